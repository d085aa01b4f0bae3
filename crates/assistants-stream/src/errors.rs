/// Errors produced by the Assistants API client and the stream decoder.
///
/// `RequestFailed` is the only variant that travels inside the event stream:
/// it is the failure half of the terminal `DomainEvent::RequestCompleted`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Invalid client configuration (missing key, missing assistant id, ...).
    #[error("config error: {0}")]
    Config(String),
    /// Transport or stream I/O failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service answered with a non-success HTTP status.
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    /// A response body could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
    /// Terminal failure reported for a streaming request.
    #[error("request failed: {message}")]
    RequestFailed { message: String },
}

impl ApiError {
    pub(crate) fn request_failed(message: impl Into<String>) -> Self {
        Self::RequestFailed {
            message: message.into(),
        }
    }

    /// Returns the human-readable reason carried by this error.
    pub fn message(&self) -> String {
        match self {
            Self::Config(message) | Self::Transport(message) | Self::Decode(message) => {
                message.clone()
            }
            Self::Status { message, .. } | Self::RequestFailed { message } => message.clone(),
        }
    }
}

/// Failure to turn one JSON object into a `JsonMessage`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageDecodeError {
    /// The block parsed as JSON but is not an object.
    #[error("message block is not a JSON object")]
    NotAnObject,
    /// The object carries none of the required field combinations.
    #[error("no message variant matches keys [{}]", keys.join(", "))]
    NoMatchingVariant { keys: Vec<String> },
    /// The block is not valid JSON.
    #[error("invalid message JSON: {0}")]
    Json(String),
}

impl From<serde_json::Error> for MessageDecodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value.to_string())
    }
}

/// Playback-side failures. These never stop the queue; they are logged and
/// reported to observers through `PlaybackOutcome::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    /// The player refused to start an item.
    #[error("playback start failed: {0}")]
    Start(String),
    /// The chunk source failed while bridging.
    #[error("audio stream failed: {0}")]
    Stream(String),
    /// Speech synthesis failed before anything could be queued.
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
}

impl From<ApiError> for PlaybackError {
    fn from(value: ApiError) -> Self {
        PlaybackError::Synthesis(value.to_string())
    }
}

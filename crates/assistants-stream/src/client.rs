//! HTTP client for the Assistants v2 endpoints used by the chat flow.

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt as _, TryStreamExt as _};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::AssistantsConfig;
use crate::decoder::decode_event_stream;
use crate::errors::{ApiError, PlaybackError};
use crate::events::DomainEvent;
use crate::model::{
    ApiErrorBody, AssistantsMessage, MessageList, Role, Run, RunOptions, RunRequest, ThreadObject,
    Transcription, TranscriptionOptions,
};
use crate::playback::SpeechChunkStream;

const BETA_HEADER: &str = "OpenAI-Beta";
const BETA_VALUE: &str = "assistants=v2";

/// Ordered event stream of one run; always ends with `RequestCompleted`.
pub type RunEventStream = BoxStream<'static, DomainEvent>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Clone)]
pub struct AssistantsClient {
    http: reqwest::Client,
    config: AssistantsConfig,
}

impl AssistantsClient {
    /// Creates a client from explicit configuration.
    pub fn new(config: AssistantsConfig) -> Result<Self, ApiError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Creates a client from `OPENAI_*` environment variables.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::new(AssistantsConfig::from_env()?)
    }

    pub fn config(&self) -> &AssistantsConfig {
        &self.config
    }

    fn authorized(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.config.url(path))
            .bearer_auth(&self.config.api_key)
    }

    /// Request to an Assistants endpoint, which requires the beta header.
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.authorized(method, path).header(BETA_HEADER, BETA_VALUE)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = builder
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let response = check_status(response).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub async fn create_thread(&self) -> Result<ThreadObject, ApiError> {
        let thread: ThreadObject = self
            .send_json(
                self.request(reqwest::Method::POST, "threads")
                    .json(&serde_json::json!({})),
            )
            .await?;
        info!(thread_id = %thread.id, "thread created");
        Ok(thread)
    }

    pub async fn create_message(
        &self,
        thread_id: &str,
        role: Role,
        text: &str,
    ) -> Result<AssistantsMessage, ApiError> {
        let path = format!("threads/{thread_id}/messages");
        self.send_json(
            self.request(reqwest::Method::POST, &path)
                .json(&message_request_body(role, text)),
        )
        .await
    }

    pub async fn list_messages(
        &self,
        thread_id: &str,
        limit: u32,
        order: SortOrder,
    ) -> Result<Vec<AssistantsMessage>, ApiError> {
        let path = format!("threads/{thread_id}/messages");
        let list: MessageList = self
            .send_json(self.request(reqwest::Method::GET, &path).query(&[
                ("limit", limit.to_string()),
                ("order", order.as_str().to_string()),
            ]))
            .await?;
        debug!(thread_id, count = list.data.len(), object = %list.object, "messages listed");
        Ok(list.data)
    }

    /// Starts a run of the configured assistant and returns it without
    /// waiting for completion; poll it with [`get_run`](Self::get_run).
    pub async fn create_run(&self, thread_id: &str, options: &RunOptions) -> Result<Run, ApiError> {
        let assistant_id = self.config.require_assistant_id()?;
        let path = format!("threads/{thread_id}/runs");
        let run: Run = self
            .send_json(
                self.request(reqwest::Method::POST, &path)
                    .json(&run_request_body(assistant_id, options, false)),
            )
            .await?;
        info!(thread_id, run_id = %run.id, status = ?run.status, "run created");
        Ok(run)
    }

    pub async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ApiError> {
        let path = format!("threads/{thread_id}/runs/{run_id}");
        let run: Run = self
            .send_json(self.request(reqwest::Method::GET, &path))
            .await?;
        debug!(thread_id, run_id, status = ?run.status, "run fetched");
        Ok(run)
    }

    /// Starts a streamed run of the configured assistant on `thread_id`.
    ///
    /// Only a missing assistant id fails up front. Transport failures and
    /// non-success statuses arrive as the terminal `RequestCompleted(Err)`.
    pub async fn create_run_stream(
        &self,
        thread_id: &str,
        options: &RunOptions,
    ) -> Result<RunEventStream, ApiError> {
        let assistant_id = self.config.require_assistant_id()?;
        let path = format!("threads/{thread_id}/runs");
        info!(thread_id, assistant_id, "starting run stream");
        let sent = self
            .request(reqwest::Method::POST, &path)
            .json(&run_request_body(assistant_id, options, true))
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(err) => return Ok(failed_run(ApiError::Transport(err.to_string()))),
        };
        match check_status(response).await {
            Ok(response) => Ok(decode_event_stream(response.bytes_stream()).boxed()),
            Err(err) => Ok(failed_run(err)),
        }
    }

    /// Synthesizes `text` into one complete mp3 buffer.
    pub async fn create_speech(&self, text: &str) -> Result<Bytes, ApiError> {
        let response = self
            .request(reqwest::Method::POST, "audio/speech")
            .timeout(self.config.timeout)
            .json(&speech_request_body(&self.config, text))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let response = check_status(response).await?;
        response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))
    }

    /// Transcribes an audio file. `file_name` carries the extension the
    /// service uses to detect the container format.
    pub async fn create_transcription(
        &self,
        audio: Bytes,
        file_name: &str,
        options: &TranscriptionOptions,
    ) -> Result<Transcription, ApiError> {
        let size = audio.len();
        let file = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(file_name.to_string())
            .mime_str(audio_mime(file_name))
            .map_err(|e| ApiError::Config(format!("invalid audio mime type: {e}")))?;
        let form = options
            .form_fields()
            .into_iter()
            .fold(reqwest::multipart::Form::new().part("file", file), |form, (name, value)| {
                form.text(name, value)
            });
        let transcription: Transcription = self
            .send_json(
                self.authorized(reqwest::Method::POST, "audio/transcriptions")
                    .multipart(form),
            )
            .await?;
        info!(file_name, bytes = size, chars = transcription.text.len(), "audio transcribed");
        Ok(transcription)
    }

    /// Synthesizes `text` as live mp3 chunks. The request is sent when the
    /// stream is first polled.
    pub fn create_speech_stream(&self, text: &str) -> SpeechChunkStream {
        let request = self
            .request(reqwest::Method::POST, "audio/speech")
            .json(&speech_request_body(&self.config, text));
        let opened = async move {
            let response = request
                .send()
                .await
                .map_err(|e| PlaybackError::Stream(e.to_string()))?;
            let response = check_status(response).await?;
            Ok::<_, PlaybackError>(
                response
                    .bytes_stream()
                    .map_err(|e| PlaybackError::Stream(e.to_string())),
            )
        };
        stream::once(opened).try_flatten().boxed()
    }
}

fn failed_run(err: ApiError) -> RunEventStream {
    stream::iter([DomainEvent::RequestCompleted(Err(err))]).boxed()
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(status_error(status.as_u16(), &body))
}

/// Prefers the message of an `{"error": {...}}` envelope over the raw body.
pub(crate) fn status_error(status: u16, body: &str) -> ApiError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.to_string());
    ApiError::Status { status, message }
}

pub(crate) fn run_request_body<'a>(
    assistant_id: &'a str,
    options: &'a RunOptions,
    stream: bool,
) -> RunRequest<'a> {
    RunRequest {
        assistant_id,
        stream,
        options,
    }
}

/// Content type for an uploaded audio file, by extension.
pub(crate) fn audio_mime(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "wav" => "audio/wav",
        "mp3" | "mpga" | "mpeg" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

pub(crate) fn message_request_body(role: Role, text: &str) -> serde_json::Value {
    serde_json::json!({
        "role": role,
        "content": [{ "type": "text", "text": text }],
    })
}

pub(crate) fn speech_request_body(config: &AssistantsConfig, text: &str) -> serde_json::Value {
    serde_json::json!({
        "model": config.speech_model,
        "input": text,
        "voice": config.voice,
        "response_format": "mp3",
    })
}

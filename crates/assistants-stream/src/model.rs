//! Payload shapes for the Assistants v2 API objects carried by stream events
//! and REST responses.
//!
//! Only fields the service always sends are required; everything else is
//! optional so newer server versions keep decoding.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Author of a thread message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
}

impl RunStatus {
    /// Whether no further status transitions will happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Completed
                | RunStatus::Incomplete
                | RunStatus::Expired
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitToolOutputs {
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationStrategy {
    #[serde(rename = "type")]
    pub kind: String,
    pub last_messages: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteDetails {
    pub reason: String,
}

/// `tool_choice` is either a mode string or a specific tool object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Tool(Tool),
}

/// A run of an assistant over a thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub thread_id: String,
    pub assistant_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub cancelled_at: Option<i64>,
    #[serde(default)]
    pub failed_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_prompt_tokens: Option<u64>,
    #[serde(default)]
    pub max_completion_tokens: Option<u64>,
    #[serde(default)]
    pub truncation_strategy: Option<TruncationStrategy>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
}

/// One step (message creation or tool call) inside a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub run_id: String,
    pub assistant_id: String,
    pub thread_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub cancelled_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub failed_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<LastError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    InProgress,
    Incomplete,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextValue {
    pub value: String,
}

/// One content part of a message. Non-text parts (images) carry no `text`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextValue>,
}

/// A thread message as returned by the API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantsMessage {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub thread_id: String,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub incomplete_at: Option<i64>,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<MessageContent>,
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl AssistantsMessage {
    /// Text of the last text content part, which is what the chat surfaces.
    pub fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .rev()
            .find_map(|part| part.text.as_ref().map(|t| t.value.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeltaContent {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextValue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub content: Vec<MessageDeltaContent>,
}

/// Incremental text for a message still being generated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelta {
    pub id: String,
    pub object: String,
    pub delta: MessageDeltaBody,
}

impl MessageDelta {
    /// Text fragment of the first content slot, if it carries text.
    pub fn text(&self) -> Option<&str> {
        self.delta
            .content
            .first()
            .and_then(|c| c.text.as_ref())
            .map(|t| t.value.as_str())
    }
}

/// Thread object returned by `POST /threads`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadObject {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MessageList {
    pub object: String,
    pub data: Vec<AssistantsMessage>,
}

/// Extra message appended to the thread when a run starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalMessage {
    pub role: Role,
    pub content: String,
}

/// Per-run overrides of the assistant's settings. Unset fields are omitted
/// from the request so the assistant's own values apply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_messages: Vec<AdditionalMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn additional_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.additional_instructions = Some(instructions.into());
        self
    }

    pub fn additional_message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.additional_messages.push(AdditionalMessage {
            role,
            content: content.into(),
        });
        self
    }

    pub fn tool(mut self, kind: impl Into<String>) -> Self {
        self.tools.push(Tool { kind: kind.into() });
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_prompt_tokens(mut self, tokens: u32) -> Self {
        self.max_prompt_tokens = Some(tokens);
        self
    }

    pub fn max_completion_tokens(mut self, tokens: u32) -> Self {
        self.max_completion_tokens = Some(tokens);
        self
    }
}

/// Body of `POST /threads/{id}/runs`.
#[derive(Debug, Serialize)]
pub(crate) struct RunRequest<'a> {
    pub assistant_id: &'a str,
    pub stream: bool,
    #[serde(flatten)]
    pub options: &'a RunOptions,
}

/// Response formats of `/audio/transcriptions` that decode as JSON.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionFormat {
    #[default]
    Json,
    /// Adds timed segments.
    VerboseJson,
}

impl TranscriptionFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscriptionFormat::Json => "json",
            TranscriptionFormat::VerboseJson => "verbose_json",
        }
    }
}

/// Settings of a speech-to-text request.
#[derive(Clone, Debug, PartialEq)]
pub struct TranscriptionOptions {
    pub model: String,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub response_format: TranscriptionFormat,
    pub temperature: Option<f32>,
    /// `word` and/or `segment`; only honoured with `VerboseJson`.
    pub timestamp_granularities: Vec<String>,
}

pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            language: None,
            prompt: None,
            response_format: TranscriptionFormat::default(),
            temperature: None,
            timestamp_granularities: Vec::new(),
        }
    }
}

impl TranscriptionOptions {
    /// Text form fields sent next to the audio file, in request order.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("model", self.model.clone()),
            ("response_format", self.response_format.as_str().to_string()),
        ];
        if let Some(language) = &self.language {
            fields.push(("language", language.clone()));
        }
        if let Some(prompt) = &self.prompt {
            fields.push(("prompt", prompt.clone()));
        }
        if let Some(temperature) = self.temperature {
            fields.push(("temperature", temperature.to_string()));
        }
        for granularity in &self.timestamp_granularities {
            fields.push(("timestamp_granularities[]", granularity.clone()));
        }
        fields
    }
}

/// Result of `POST /audio/transcriptions`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub segments: Vec<TranscriptionSegment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Error envelope `{"error": {...}}` the service may send instead of data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// Text-to-speech voice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    Alloy,
    Echo,
    Fable,
    Onyx,
    #[default]
    Nova,
    Shimmer,
}

impl std::str::FromStr for Voice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alloy" => Ok(Voice::Alloy),
            "echo" => Ok(Voice::Echo),
            "fable" => Ok(Voice::Fable),
            "onyx" => Ok(Voice::Onyx),
            "nova" => Ok(Voice::Nova),
            "shimmer" => Ok(Voice::Shimmer),
            other => Err(format!("unknown voice: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_decodes_with_minimal_fields() {
        let run: Run = serde_json::from_value(serde_json::json!({
            "id": "run_1",
            "object": "thread.run",
            "created_at": 1,
            "thread_id": "thread_1",
            "assistant_id": "asst_1",
            "status": "in_progress",
            "tool_choice": "auto"
        }))
        .expect("run");
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(!run.status.is_terminal());
        assert_eq!(run.tool_choice, Some(ToolChoice::Mode("auto".into())));
    }

    #[test]
    fn message_text_uses_last_text_part() {
        let message: AssistantsMessage = serde_json::from_value(serde_json::json!({
            "id": "msg_1",
            "object": "thread.message",
            "created_at": 1,
            "thread_id": "thread_1",
            "role": "assistant",
            "content": [
                {"type": "text", "text": {"value": "first"}},
                {"type": "image_file"},
                {"type": "text", "text": {"value": "second"}}
            ]
        }))
        .expect("message");
        assert_eq!(message.text(), Some("second"));
    }

    #[test]
    fn transcription_decodes_plain_and_verbose_bodies() {
        let plain: Transcription =
            serde_json::from_value(serde_json::json!({"text": "hello there"})).expect("plain");
        assert_eq!(plain.text, "hello there");
        assert!(plain.segments.is_empty());

        let verbose: Transcription = serde_json::from_value(serde_json::json!({
            "task": "transcribe",
            "language": "english",
            "duration": 1.5,
            "text": "hello there",
            "segments": [
                {"id": 0, "start": 0.0, "end": 0.7, "text": "hello"},
                {"id": 1, "start": 0.7, "end": 1.5, "text": " there"}
            ]
        }))
        .expect("verbose");
        assert_eq!(verbose.segments.len(), 2);
        assert_eq!(verbose.segments[1].end, 1.5);
        assert_eq!(verbose.language.as_deref(), Some("english"));
    }

    #[test]
    fn transcription_fields_skip_unset_options() {
        assert_eq!(
            TranscriptionOptions::default().form_fields(),
            vec![
                ("model", "whisper-1".to_string()),
                ("response_format", "json".to_string()),
            ]
        );

        let options = TranscriptionOptions {
            language: Some("en".into()),
            response_format: TranscriptionFormat::VerboseJson,
            temperature: Some(0.5),
            timestamp_granularities: vec!["word".into(), "segment".into()],
            ..TranscriptionOptions::default()
        };
        let fields = options.form_fields();
        assert!(fields.contains(&("response_format", "verbose_json".to_string())));
        assert!(fields.contains(&("language", "en".to_string())));
        assert!(fields.contains(&("temperature", "0.5".to_string())));
        assert_eq!(
            fields
                .iter()
                .filter(|(name, _)| *name == "timestamp_granularities[]")
                .count(),
            2
        );
        assert!(!fields.iter().any(|(name, _)| *name == "prompt"));
    }

    #[test]
    fn voice_parses_case_insensitively() {
        assert_eq!("Shimmer".parse::<Voice>(), Ok(Voice::Shimmer));
        assert!("robot".parse::<Voice>().is_err());
        assert_eq!(Voice::default(), Voice::Nova);
    }
}

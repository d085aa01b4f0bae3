//! Ordered chat transcript with upsert-by-identity semantics.

use tracing::debug;

use crate::message::{JsonMessage, decode_document};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub message_id: Option<String>,
    pub message: Option<JsonMessage>,
    pub content: String,
    pub is_user: bool,
    pub is_streaming: bool,
}

impl TranscriptEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            message_id: None,
            message: None,
            content: text.into(),
            is_user: true,
            is_streaming: false,
        }
    }

    pub fn assistant(message: JsonMessage) -> Self {
        Self {
            message_id: message.id().map(ToOwned::to_owned),
            content: message.display_text(),
            message: Some(message),
            is_user: false,
            is_streaming: false,
        }
    }

    /// Unstructured assistant text.
    pub fn raw(content: impl Into<String>, is_streaming: bool) -> Self {
        Self {
            message_id: None,
            message: None,
            content: content.into(),
            is_user: false,
            is_streaming,
        }
    }

    pub fn speakable_text(&self) -> Option<&str> {
        self.message.as_ref().and_then(JsonMessage::speakable_text)
    }

    /// Two entries describe the same message when they share a message id
    /// or a speakable text, or are user entries with identical content.
    /// Missing ids and speakable texts never match each other.
    pub fn same_entry(&self, other: &TranscriptEntry) -> bool {
        if let (Some(a), Some(b)) = (&self.message_id, &other.message_id)
            && a == b
        {
            return true;
        }
        if let (Some(a), Some(b)) = (self.speakable_text(), other.speakable_text())
            && a == b
        {
            return true;
        }
        self.is_user && other.is_user && self.content == other.content
    }
}

#[derive(Clone, Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.entries.push(TranscriptEntry::user(text));
    }

    /// Adds the placeholder that shows live text while a run streams.
    pub fn begin_streaming(&mut self) {
        self.entries.push(TranscriptEntry::raw("", true));
    }

    pub fn update_streaming(&mut self, text: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| !e.is_user && e.is_streaming)
        {
            entry.content.clear();
            entry.content.push_str(text);
        }
    }

    /// Drops every streaming placeholder.
    pub fn end_streaming(&mut self) {
        self.entries.retain(|e| e.is_user || !e.is_streaming);
    }

    /// Inserts the message, or refreshes the existing entry for it.
    /// Returns `true` when a new entry was appended.
    pub fn push_message(&mut self, message: JsonMessage) -> bool {
        let incoming = TranscriptEntry::assistant(message);
        match self.entries.iter_mut().find(|e| e.same_entry(&incoming)) {
            Some(existing) => {
                existing.content = incoming.content;
                existing.is_streaming = false;
                false
            }
            None => {
                self.entries.push(incoming);
                true
            }
        }
    }

    /// Applies the final assistant content of a run.
    ///
    /// A messages document is upserted message by message and the decoded
    /// messages are returned. Anything else is appended as raw text unless
    /// an assistant entry already shows it.
    pub fn apply_final(&mut self, content: &str) -> Vec<JsonMessage> {
        match decode_document(content) {
            Ok(messages) => {
                for message in &messages {
                    self.push_message(message.clone());
                }
                messages
            }
            Err(err) => {
                debug!(error = %err, "final content is not a messages document");
                let known = self
                    .entries
                    .iter()
                    .any(|e| !e.is_user && e.content == content);
                if !content.is_empty() && !known {
                    self.entries.push(TranscriptEntry::raw(content, false));
                }
                Vec::new()
            }
        }
    }
}

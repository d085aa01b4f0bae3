//! Incremental extraction of messages from a growing `{"messages":[...]}`
//! document.
//!
//! Only text after the cursor is scanned on each call, so the cost per
//! fragment is proportional to the new bytes.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::errors::MessageDecodeError;
use crate::message::{JsonMessage, decode_document};

/// Marks the start of the array scanned by the extractor.
pub const MESSAGES_ANCHOR: &str = "\"messages\":[";

/// Single-owner extraction state for one request.
#[derive(Debug)]
pub struct MessageExtractor {
    anchor: String,
    buffer: String,
    anchor_end: Option<usize>,
    anchor_search_from: usize,
    offset: usize,
    seen_ids: HashSet<String>,
}

impl Default for MessageExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageExtractor {
    pub fn new() -> Self {
        Self::with_anchor(MESSAGES_ANCHOR)
    }

    /// Uses a different anchor, e.g. for assistants emitting `"items":[`.
    pub fn with_anchor(anchor: impl Into<String>) -> Self {
        Self {
            anchor: anchor.into(),
            buffer: String::new(),
            anchor_end: None,
            anchor_search_from: 0,
            offset: 0,
            seen_ids: HashSet::new(),
        }
    }

    /// Full text accumulated so far, for live-typing display.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Bytes consumed after the end of the anchor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn has_anchor(&self) -> bool {
        self.anchor_end.is_some()
    }

    /// Number of distinct identifiers emitted.
    pub fn seen_count(&self) -> usize {
        self.seen_ids.len()
    }

    /// Appends a fragment and returns the messages it completes, in order.
    ///
    /// An object still open at the end of the buffer is left for the next
    /// call. Objects whose id was already emitted are dropped silently.
    pub fn append_and_extract(&mut self, fragment: &str) -> Vec<JsonMessage> {
        self.buffer.push_str(fragment);
        let mut emitted = Vec::new();
        let Some(anchor_end) = self.locate_anchor() else {
            return emitted;
        };

        loop {
            let start = anchor_end + self.offset;
            let Some(open) = self.buffer[start..].find('{').map(|i| start + i) else {
                break;
            };
            let Some(close) = find_matching_brace(&self.buffer, open) else {
                break;
            };
            let decoded = JsonMessage::from_json_str(&self.buffer[open..=close]);
            self.offset = close + 1 - anchor_end;

            match decoded {
                Ok(message) => {
                    if let Some(message) = self.admit(message) {
                        emitted.push(message);
                    }
                }
                Err(err) => warn!(error = %err, "skipping undecodable message block"),
            }
        }
        emitted
    }

    /// Reconciles against the complete final document, returning only the
    /// messages that were never emitted while streaming.
    pub fn reconcile(&mut self, final_text: &str) -> Result<Vec<JsonMessage>, MessageDecodeError> {
        let messages = decode_document(final_text)?;
        Ok(messages
            .into_iter()
            .filter_map(|message| self.admit(message))
            .collect())
    }

    fn admit(&mut self, message: JsonMessage) -> Option<JsonMessage> {
        let Some(id) = message.id() else {
            debug!("skipping message without id");
            return None;
        };
        if !self.seen_ids.insert(id.to_string()) {
            debug!(id, "duplicate message");
            return None;
        }
        Some(message)
    }

    fn locate_anchor(&mut self) -> Option<usize> {
        if let Some(end) = self.anchor_end {
            return Some(end);
        }
        let from = self.anchor_search_from;
        match self.buffer[from..].find(self.anchor.as_str()) {
            Some(pos) => {
                let end = from + pos + self.anchor.len();
                self.anchor_end = Some(end);
                Some(end)
            }
            None => {
                let mut next = self
                    .buffer
                    .len()
                    .saturating_sub(self.anchor.len().saturating_sub(1));
                while !self.buffer.is_char_boundary(next) {
                    next -= 1;
                }
                self.anchor_search_from = next.max(from);
                debug!("messages anchor not found yet");
                None
            }
        }
    }
}

/// Index of the `}` closing the object opened at `open`.
///
/// Braces inside string literals are not counted. Returns `None` while the
/// object is still incomplete.
pub fn find_matching_brace(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

//! Decoder for the Assistants run stream.
//!
//! The service frames events as `event: <name>` / `data: <json>` line pairs.
//! A `StreamSession` turns raw byte chunks into `DomainEvent`s in arrival
//! order and closes every session with exactly one
//! `DomainEvent::RequestCompleted`.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream;
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::events::DomainEvent;
use crate::model::{ApiErrorBody, ApiErrorDetail};

const EVENT_PREFIX: &str = "event:";
const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
/// Marker of an out-of-band error object in place of framed data.
pub const ERROR_MARKER: &str = "\"error\":";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyKind {
    Unknown,
    /// `event:` / `data:` lines.
    Framed,
    /// A single JSON object, which the service only sends for errors.
    Bare,
}

/// Decoding state for one outstanding streaming request.
pub struct StreamSession {
    id: uuid::Uuid,
    raw: Vec<u8>,
    line_buf: Vec<u8>,
    current_event: Option<String>,
    kind: BodyKind,
    terminated: bool,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            raw: Vec::new(),
            line_buf: Vec::new(),
            current_event: None,
            kind: BodyKind::Unknown,
            terminated: false,
        }
    }

    /// Session id used in log fields.
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// Name from the most recent `event:` line.
    pub fn current_event(&self) -> Option<&str> {
        self.current_event.as_deref()
    }

    /// Every byte received so far.
    pub fn raw_body(&self) -> &[u8] {
        &self.raw
    }

    /// Whether the terminal outcome has already been emitted.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Feeds one transport chunk and returns the events it completes.
    ///
    /// A line cut by the chunk boundary is kept until its newline arrives.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }
        self.raw.extend_from_slice(chunk);
        self.line_buf.extend_from_slice(chunk);

        if self.kind == BodyKind::Unknown {
            self.kind = match self.raw.iter().find(|b| !b.is_ascii_whitespace()) {
                Some(b'{') => BodyKind::Bare,
                Some(_) => BodyKind::Framed,
                None => return events,
            };
        }

        match self.kind {
            BodyKind::Bare => {
                if let Some(reason) = self.bare_error_reason() {
                    events.push(self.terminate(Err(ApiError::request_failed(reason))));
                }
            }
            BodyKind::Framed => {
                while let Some(pos) = self.line_buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
                    self.handle_line(&line[..pos], &mut events);
                    if self.terminated {
                        break;
                    }
                }
            }
            BodyKind::Unknown => {}
        }
        events
    }

    /// Closes the session with the transport's completion signal.
    ///
    /// Returns any event held back by an unterminated final line followed by
    /// the terminal outcome, or nothing if the session already terminated.
    pub fn finish<E: fmt::Display>(&mut self, result: Result<(), E>) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }
        if let Err(err) = result {
            warn!(session_id = %self.id, error = %err, "stream transport failed");
            events.push(self.terminate(Err(ApiError::request_failed(format!(
                "stream transport failed: {err}"
            )))));
            return events;
        }

        match self.kind {
            BodyKind::Framed if !self.line_buf.is_empty() => {
                let line = std::mem::take(&mut self.line_buf);
                self.handle_line(&line, &mut events);
            }
            BodyKind::Bare => {
                if let Some(reason) = self.bare_error_reason() {
                    events.push(self.terminate(Err(ApiError::request_failed(reason))));
                }
            }
            _ => {}
        }
        if !self.terminated {
            let body = Bytes::copy_from_slice(&self.raw);
            events.push(self.terminate(Ok(body)));
        }
        events
    }

    fn terminate(&mut self, outcome: crate::events::RequestOutcome) -> DomainEvent {
        self.terminated = true;
        self.line_buf.clear();
        match &outcome {
            Ok(body) => debug!(session_id = %self.id, bytes = body.len(), "stream completed"),
            Err(err) => debug!(session_id = %self.id, error = %err, "stream failed"),
        }
        DomainEvent::RequestCompleted(outcome)
    }

    fn handle_line(&mut self, bytes: &[u8], events: &mut Vec<DomainEvent>) {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix(EVENT_PREFIX) {
            self.current_event = Some(rest.trim().to_string());
            return;
        }
        if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            self.handle_data(rest.trim_start(), events);
            return;
        }
        if line.trim_start().starts_with('{') && line.contains(ERROR_MARKER) {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => {
                    if let Some(reason) = error_reason(&value) {
                        events.push(self.terminate(Err(ApiError::request_failed(reason))));
                    }
                }
                Err(err) => warn!(session_id = %self.id, error = %err, "skipping malformed error line"),
            }
            return;
        }
        debug!(session_id = %self.id, "ignoring unframed line");
    }

    fn handle_data(&mut self, payload: &str, events: &mut Vec<DomainEvent>) {
        if payload.is_empty() || payload == DONE_SENTINEL {
            return;
        }
        let Some(name) = self.current_event.clone() else {
            debug!(session_id = %self.id, "data line without event name");
            return;
        };
        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(session_id = %self.id, event = %name, error = %err, "skipping malformed data line");
                return;
            }
        };

        if name == "error" {
            let reason = error_reason(&value)
                .or_else(|| {
                    serde_json::from_value::<ApiErrorDetail>(value.clone())
                        .ok()
                        .map(|detail| detail.message)
                })
                .unwrap_or_else(|| "stream reported an error".to_string());
            events.push(self.terminate(Err(ApiError::request_failed(reason))));
            return;
        }
        if let Some(reason) = error_reason(&value) {
            events.push(self.terminate(Err(ApiError::request_failed(reason))));
            return;
        }

        match decode_event(&name, value) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => debug!(session_id = %self.id, event = %name, "ignoring unknown event"),
            Err(err) => {
                warn!(session_id = %self.id, event = %name, error = %err, "skipping undecodable event")
            }
        }
    }

    /// Reason of a bare error body, once the body holds a complete object.
    fn bare_error_reason(&self) -> Option<String> {
        if !contains(&self.raw, ERROR_MARKER.as_bytes()) {
            return None;
        }
        match serde_json::from_slice::<serde_json::Value>(&self.raw) {
            Ok(value) => error_reason(&value),
            Err(err) if err.is_eof() => None,
            Err(err) => {
                debug!(session_id = %self.id, error = %err, "bare body is not a JSON object yet");
                None
            }
        }
    }
}

/// Maps an event name and its JSON payload onto a `DomainEvent`.
///
/// Returns `Ok(None)` for names this decoder does not know.
pub fn decode_event(
    name: &str,
    value: serde_json::Value,
) -> Result<Option<DomainEvent>, serde_json::Error> {
    let event = match name {
        "thread.run.created" => DomainEvent::RunCreated(serde_json::from_value(value)?),
        "thread.run.queued" => DomainEvent::RunQueued(serde_json::from_value(value)?),
        "thread.run.in_progress" => DomainEvent::RunInProgress(serde_json::from_value(value)?),
        "thread.run.requires_action" => {
            DomainEvent::RunRequiresAction(serde_json::from_value(value)?)
        }
        "thread.run.completed" => DomainEvent::RunCompleted(serde_json::from_value(value)?),
        "thread.run.failed" => DomainEvent::RunFailed(serde_json::from_value(value)?),
        "thread.run.cancelled" => DomainEvent::RunCancelled(serde_json::from_value(value)?),
        "thread.run.expired" => DomainEvent::RunExpired(serde_json::from_value(value)?),
        "thread.run.incomplete" => DomainEvent::RunIncomplete(serde_json::from_value(value)?),
        "thread.run.step.created" => DomainEvent::RunStepCreated(serde_json::from_value(value)?),
        "thread.run.step.in_progress" => {
            DomainEvent::RunStepInProgress(serde_json::from_value(value)?)
        }
        "thread.run.step.completed" => {
            DomainEvent::RunStepCompleted(serde_json::from_value(value)?)
        }
        "thread.run.step.failed" => DomainEvent::RunStepFailed(serde_json::from_value(value)?),
        "thread.message.created" => DomainEvent::MessageCreated(serde_json::from_value(value)?),
        "thread.message.in_progress" => {
            DomainEvent::MessageInProgress(serde_json::from_value(value)?)
        }
        "thread.message.completed" => {
            DomainEvent::MessageCompleted(serde_json::from_value(value)?)
        }
        "thread.message.incomplete" => {
            DomainEvent::MessageIncomplete(serde_json::from_value(value)?)
        }
        "thread.message.delta" => DomainEvent::MessageDelta(serde_json::from_value(value)?),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Message of a top-level `{"error": ...}` object.
fn error_reason(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    if let Ok(body) = serde_json::from_value::<ApiErrorBody>(value.clone()) {
        return Some(body.error.message);
    }
    Some(
        error
            .as_str()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| "failed to decode error response".to_string()),
    )
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

type BoxedByteStream<E> = Pin<Box<dyn futures::Stream<Item = Result<Bytes, E>> + Send + 'static>>;

/// Adapts a transport byte stream into the ordered `DomainEvent` sequence.
///
/// The returned stream ends right after the terminal `RequestCompleted`; the
/// transport is dropped as soon as an inline error terminates the session.
pub fn decode_event_stream<S, E>(
    bytes_stream: S,
) -> impl futures::Stream<Item = DomainEvent> + Send
where
    S: futures::Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    struct State<E> {
        bytes_stream: BoxedByteStream<E>,
        session: StreamSession,
        pending: VecDeque<DomainEvent>,
        done: bool,
    }

    stream::unfold(
        State {
            bytes_stream: Box::pin(bytes_stream),
            session: StreamSession::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.done {
                    return None;
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.session.push_chunk(&chunk));
                        if state.session.is_terminated() {
                            state.done = true;
                        }
                    }
                    Some(Err(err)) => {
                        state.pending.extend(state.session.finish(Err(err)));
                        state.done = true;
                    }
                    None => {
                        state.pending.extend(state.session.finish(Ok::<(), E>(())));
                        state.done = true;
                    }
                }
            }
        },
    )
}

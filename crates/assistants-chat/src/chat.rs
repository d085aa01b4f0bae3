//! One assistant turn: consumes run events and renders the reply.

use std::io::Write;

use assistants_stream::{
    ApiError, DomainEvent, JsonMessage, MessageExtractor, Narrator, Transcript,
};
use futures::{Stream, StreamExt as _};
use tracing::{debug, info, warn};

/// How assistant output is interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputMode {
    /// The assistant answers with a `{"messages":[...]}` document.
    #[default]
    Json,
    /// Free text, printed as it streams.
    Plain,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("output failed: {0}")]
    Io(#[from] std::io::Error),
}

/// State of one streamed reply.
pub struct ChatTurn<'a> {
    mode: OutputMode,
    extractor: MessageExtractor,
    transcript: &'a mut Transcript,
    narrator: Option<&'a mut Narrator>,
    printed: Vec<String>,
    plain_open: bool,
}

impl<'a> ChatTurn<'a> {
    pub fn new(
        mode: OutputMode,
        transcript: &'a mut Transcript,
        narrator: Option<&'a mut Narrator>,
    ) -> Self {
        transcript.begin_streaming();
        Self {
            mode,
            extractor: MessageExtractor::new(),
            transcript,
            narrator,
            printed: Vec::new(),
            plain_open: false,
        }
    }

    /// Handles one event. Returns `false` once the request has completed.
    pub fn handle<W: Write>(&mut self, event: DomainEvent, out: &mut W) -> Result<bool, ChatError> {
        debug!(event = event.name(), "run event");
        match event {
            DomainEvent::MessageDelta(delta) => {
                if let Some(fragment) = delta.text() {
                    self.on_fragment(fragment, out)?;
                }
            }
            DomainEvent::MessageCompleted(message) => {
                self.transcript.end_streaming();
                if let Some(text) = message.text() {
                    self.apply_final(text, out)?;
                }
            }
            DomainEvent::MessageIncomplete(message) => {
                let reason = message.incomplete_details.map(|d| d.reason);
                warn!(message_id = %message.id, reason = ?reason, "message incomplete");
            }
            DomainEvent::RunRequiresAction(run) => {
                warn!(run_id = %run.id, "run requires tool outputs, which this client does not provide");
            }
            DomainEvent::RunFailed(run)
            | DomainEvent::RunCancelled(run)
            | DomainEvent::RunExpired(run)
            | DomainEvent::RunIncomplete(run) => {
                let reason = run.last_error.map(|e| e.message);
                warn!(run_id = %run.id, status = ?run.status, reason = ?reason, "run ended early");
            }
            DomainEvent::RunCompleted(run) => info!(run_id = %run.id, "run completed"),
            DomainEvent::RequestCompleted(outcome) => {
                self.close_plain(out)?;
                self.transcript.end_streaming();
                return match outcome {
                    Ok(body) => {
                        debug!(bytes = body.len(), "request completed");
                        Ok(false)
                    }
                    Err(err) => Err(err.into()),
                };
            }
            _ => {}
        }
        Ok(true)
    }

    fn on_fragment<W: Write>(&mut self, fragment: &str, out: &mut W) -> Result<(), ChatError> {
        match self.mode {
            OutputMode::Json => {
                for message in self.extractor.append_and_extract(fragment) {
                    self.show(message, out)?;
                }
            }
            OutputMode::Plain => {
                self.extractor.append_and_extract(fragment);
                write!(out, "{fragment}")?;
                out.flush()?;
                self.plain_open = true;
            }
        }
        self.transcript.update_streaming(self.extractor.buffer());
        Ok(())
    }

    /// Reconciles with the final text of the reply, printing only what was
    /// not shown while streaming.
    pub fn apply_final<W: Write>(&mut self, content: &str, out: &mut W) -> Result<(), ChatError> {
        self.close_plain(out)?;
        self.transcript.end_streaming();
        match self.extractor.reconcile(content) {
            Ok(unseen) => {
                for message in unseen {
                    self.show(message, out)?;
                }
            }
            Err(err) => {
                debug!(error = %err, "final content is not a messages document");
                let streamed = self.extractor.buffer() == content;
                if !streamed && !self.printed.iter().any(|p| p == content) {
                    writeln!(out, "{content}")?;
                    self.printed.push(content.to_string());
                }
            }
        }
        for message in self.transcript.apply_final(content) {
            if let Some(narrator) = self.narrator.as_deref_mut() {
                narrator.speak_if_needed(message.speakable_text());
            }
        }
        Ok(())
    }

    fn show<W: Write>(&mut self, message: JsonMessage, out: &mut W) -> Result<(), ChatError> {
        if let Some(narrator) = self.narrator.as_deref_mut() {
            narrator.speak_if_needed(message.speakable_text());
        }
        let text = message.display_text();
        writeln!(out, "{text}")?;
        self.printed.push(text);
        self.transcript.push_message(message);
        Ok(())
    }

    fn close_plain<W: Write>(&mut self, out: &mut W) -> Result<(), ChatError> {
        if self.plain_open {
            writeln!(out)?;
            self.plain_open = false;
            self.printed.push(self.extractor.buffer().to_string());
        }
        Ok(())
    }
}

/// Feeds a run's events into `turn` until the request completes.
pub async fn drive_run<S, W>(events: S, turn: &mut ChatTurn<'_>, out: &mut W) -> Result<(), ChatError>
where
    S: Stream<Item = DomainEvent>,
    W: Write,
{
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        if !turn.handle(event, out)? {
            break;
        }
    }
    Ok(())
}

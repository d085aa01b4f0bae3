//! Streaming front end for Assistants API chats.
//!
//! - `decoder` turns the raw run stream into ordered `DomainEvent`s.
//! - `extractor` pulls complete `JsonMessage`s out of a growing
//!   `{"messages":[...]}` document as the text streams in.
//! - `playback` plays synthesized speech one item at a time.
//!
//! `client`, `narration` and `transcript` wire these together for a chat.
//!
//! # Streaming a run
//!
//! ```no_run
//! use futures::StreamExt as _;
//!
//! use assistants_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ApiError> {
//! let client = AssistantsClient::from_env()?;
//! let thread = client.create_thread().await?;
//! client.create_message(&thread.id, Role::User, "Tell me a riddle").await?;
//!
//! let mut extractor = MessageExtractor::new();
//! let mut events = client
//!     .create_run_stream(&thread.id, &RunOptions::default())
//!     .await?;
//! while let Some(event) = events.next().await {
//!     match event {
//!         DomainEvent::MessageDelta(delta) => {
//!             for message in extractor.append_and_extract(delta.text().unwrap_or_default()) {
//!                 println!("{}", message.display_text());
//!             }
//!         }
//!         DomainEvent::RequestCompleted(Err(err)) => eprintln!("run failed: {err}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// HTTP client for threads, messages, runs and speech.
pub mod client;
/// Client configuration resolved from the environment.
pub mod config;
/// Run stream decoding.
pub mod decoder;
/// Public error types.
pub mod errors;
/// Typed run stream events.
pub mod events;
/// Incremental message extraction.
pub mod extractor;
/// Structured assistant messages.
pub mod message;
/// Assistants API payload types.
pub mod model;
/// Speak-once narration on top of the playback queue.
pub mod narration;
/// Process-wide tracing setup.
pub mod observability;
/// Speech playback scheduling.
pub mod playback;
/// Common imports for typical usage.
pub mod prelude;
/// Chat transcript bookkeeping.
pub mod transcript;

pub use client::{AssistantsClient, RunEventStream, SortOrder};
pub use config::AssistantsConfig;
pub use decoder::{StreamSession, decode_event, decode_event_stream};
pub use errors::{ApiError, MessageDecodeError, PlaybackError};
pub use events::{DomainEvent, RequestOutcome};
pub use extractor::{MESSAGES_ANCHOR, MessageExtractor};
pub use message::{JsonMessage, MessageKind, VARIANT_PRECEDENCE, decode_document};
pub use model::{
    AdditionalMessage, AssistantsMessage, MessageDelta, Role, Run, RunOptions, RunStatus, RunStep,
    ThreadObject, Transcription, TranscriptionFormat, TranscriptionOptions, TranscriptionSegment,
    Voice,
};
pub use narration::{NarrationMode, Narrator, SpeechSynthesizer};
pub use observability::init_observability;
pub use playback::{
    AudioByteStream, DecodedClip, PlaybackCompletion, PlaybackEvent, PlaybackItem, PlaybackOutcome,
    PlaybackQueue, PlaybackStatus, QueueSnapshot, RenderedAudio, SpeechChunkStream,
    StreamingPlayer,
};
pub use transcript::{Transcript, TranscriptEntry};

//! Common imports for typical usage.
pub use crate::{
    ApiError, AssistantsClient, AssistantsConfig, DomainEvent, JsonMessage, MessageExtractor,
    Narrator, PlaybackQueue, RenderedAudio, Role, RunOptions, SpeechSynthesizer, StreamSession,
    Transcript,
};

use bytes::Bytes;

use crate::errors::ApiError;
use crate::model::{AssistantsMessage, MessageDelta, Run, RunStep};

/// Terminal result of one streaming request: the full raw body on success.
pub type RequestOutcome = Result<Bytes, ApiError>;

/// Typed events decoded from an Assistants run stream.
///
/// Every session ends with exactly one `RequestCompleted`.
#[derive(Clone, Debug, PartialEq)]
pub enum DomainEvent {
    RunCreated(Run),
    RunQueued(Run),
    RunInProgress(Run),
    RunRequiresAction(Run),
    RunCompleted(Run),
    RunFailed(Run),
    RunCancelled(Run),
    RunExpired(Run),
    RunIncomplete(Run),
    RunStepCreated(RunStep),
    RunStepInProgress(RunStep),
    RunStepCompleted(RunStep),
    RunStepFailed(RunStep),
    MessageCreated(AssistantsMessage),
    MessageInProgress(AssistantsMessage),
    MessageCompleted(AssistantsMessage),
    MessageIncomplete(AssistantsMessage),
    /// Incremental text fragment for a message still being generated.
    MessageDelta(MessageDelta),
    /// Terminal outcome of the request.
    RequestCompleted(RequestOutcome),
}

impl DomainEvent {
    /// Whether this is the terminal request outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DomainEvent::RequestCompleted(_))
    }

    /// Wire name of the event, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::RunCreated(_) => "thread.run.created",
            DomainEvent::RunQueued(_) => "thread.run.queued",
            DomainEvent::RunInProgress(_) => "thread.run.in_progress",
            DomainEvent::RunRequiresAction(_) => "thread.run.requires_action",
            DomainEvent::RunCompleted(_) => "thread.run.completed",
            DomainEvent::RunFailed(_) => "thread.run.failed",
            DomainEvent::RunCancelled(_) => "thread.run.cancelled",
            DomainEvent::RunExpired(_) => "thread.run.expired",
            DomainEvent::RunIncomplete(_) => "thread.run.incomplete",
            DomainEvent::RunStepCreated(_) => "thread.run.step.created",
            DomainEvent::RunStepInProgress(_) => "thread.run.step.in_progress",
            DomainEvent::RunStepCompleted(_) => "thread.run.step.completed",
            DomainEvent::RunStepFailed(_) => "thread.run.step.failed",
            DomainEvent::MessageCreated(_) => "thread.message.created",
            DomainEvent::MessageInProgress(_) => "thread.message.in_progress",
            DomainEvent::MessageCompleted(_) => "thread.message.completed",
            DomainEvent::MessageIncomplete(_) => "thread.message.incomplete",
            DomainEvent::MessageDelta(_) => "thread.message.delta",
            DomainEvent::RequestCompleted(_) => "request.completed",
        }
    }
}

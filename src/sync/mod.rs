//! Outbox of user actions replayed against the chat server.
//!
//! Actions are persisted in the `action-queue` collection before any send
//! is attempted, then delivered oldest first by a single sweep at a time.
//! Each failed attempt counts against the action's retry budget; once the
//! budget is spent the action stays `failed` until the user retries or
//! discards it.

mod action;
mod events;
mod queue;
mod scheduler;
mod transport;

pub use action::{
  ActionStatus, Attachment, ChatMessage, QueuedAction, MAX_ATTACHMENT_BYTES,
};
pub use events::{EventBus, SyncEvent};
pub use queue::{LastRun, QueueStats, RetryReport, SyncOutcome, SyncQueue, SyncSummary};
pub use scheduler::Scheduler;
pub use transport::{HttpMessageSender, MessageSender};

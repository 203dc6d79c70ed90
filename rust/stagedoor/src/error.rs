//! Error taxonomy for the purchase orchestrator.
//!
//! Each boundary gets its own error enum: clock synchronization, task
//! lifecycle/validation, payload assembly, and push channels. Validation
//! errors are returned synchronously and never produce a task; runtime
//! errors are recorded on the task they belong to and never cross task
//! boundaries.

use thiserror::Error;

/// Errors from the clock synchronization boundary.
#[derive(Error, Debug)]
pub enum ClockSyncError {
    /// The time source did not answer within the caller-supplied budget.
    #[error("time source did not respond within {millis}ms")]
    Timeout { millis: u64 },

    /// Transport-level failure reaching the time source.
    #[error("time source unreachable: {0}")]
    SourceUnreachable(String),

    /// The source answered but no timestamp could be extracted.
    #[error("malformed time response: {0}")]
    MalformedResponse(String),
}

/// Errors from task creation and lifecycle operations.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The task specification failed validation at the API boundary.
    #[error("invalid task spec: {reason}")]
    InvalidSpec { reason: String },

    /// No task with the given id exists in the collection.
    #[error("no such task: {id}")]
    NotFound { id: String },

    /// The external executor rejected or failed the invocation.
    #[error("executor error: {message}")]
    Executor { message: String },

    /// Payload assembly failed.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Errors from purchase payload assembly.
#[derive(Error, Debug)]
pub enum PayloadError {
    /// A required catalog selection is missing or empty.
    #[error("missing selection: {field}")]
    MissingSelection { field: &'static str },

    /// The task has no buyers.
    #[error("at least one buyer is required")]
    NoBuyers,
}

/// Errors from a single push channel attempt.
///
/// These are logged by the dispatcher and never propagated; a failing
/// channel must not block its siblings.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel is enabled but its configuration is unusable.
    #[error("channel {channel} misconfigured: {reason}")]
    Misconfigured { channel: String, reason: String },

    /// The channel endpoint answered with a non-success status.
    #[error("channel {channel} rejected the push: HTTP {status}")]
    Rejected { channel: String, status: u16 },

    /// Transport-level failure reaching the channel endpoint.
    #[error("channel {channel} unreachable: {message}")]
    Transport { channel: String, message: String },
}

impl TaskError {
    /// Create an invalid-spec error with context.
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Create an executor error with context.
    pub fn executor(message: impl Into<String>) -> Self {
        Self::Executor {
            message: message.into(),
        }
    }
}

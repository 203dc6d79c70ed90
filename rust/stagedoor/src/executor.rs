//! Boundary contract with the external purchase executor.
//!
//! The executor owns the actual network purchase loop; this crate only
//! hands it a finished payload and routes its events back to the owning
//! task. Events carry the executor-assigned task id, which becomes the
//! task's id once the invocation is accepted.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::ExecuteOptions;
use crate::error::TaskError;
use crate::payload::PurchasePayload;

/// Event emitted by the executor during and after an invocation.
///
/// Per-task ordering is guaranteed by the channel; cross-task ordering is
/// not specified and must not be relied on.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    /// Free-form progress line for the task log.
    Progress { executor_id: String, message: String },
    /// Terminal report: the purchase either succeeded or the executor gave
    /// up. May arrive once more after a cancellation was requested.
    Finished {
        executor_id: String,
        success: bool,
        message: String,
    },
    /// Payment link for a successful order.
    PaymentLink { executor_id: String, url: String },
}

impl ExecutorEvent {
    /// The executor task id this event belongs to.
    #[must_use]
    pub fn executor_id(&self) -> &str {
        match self {
            Self::Progress { executor_id, .. }
            | Self::Finished { executor_id, .. }
            | Self::PaymentLink { executor_id, .. } => executor_id,
        }
    }
}

/// Sender half handed to the executor implementation.
pub type ExecutorEventSender = mpsc::UnboundedSender<ExecutorEvent>;

/// Receiver half consumed by the scheduler's event pump.
pub type ExecutorEventReceiver = mpsc::UnboundedReceiver<ExecutorEvent>;

/// Create the executor event channel.
#[must_use]
pub fn event_channel() -> (ExecutorEventSender, ExecutorEventReceiver) {
    mpsc::unbounded_channel()
}

/// The external purchase executor.
///
/// `invoke` returns as soon as the executor has accepted the work and
/// assigned an id; everything after that arrives as [`ExecutorEvent`]s.
/// `cancel` is best-effort — one final event may still arrive afterwards,
/// and the scheduler merges it without reopening the task.
#[async_trait]
pub trait PurchaseExecutor: Send + Sync {
    /// Start a purchase attempt loop for the payload.
    async fn invoke(
        &self,
        payload: PurchasePayload,
        options: ExecuteOptions,
    ) -> Result<String, TaskError>;

    /// Request cancellation of an in-flight invocation.
    async fn cancel(&self, executor_id: &str);
}

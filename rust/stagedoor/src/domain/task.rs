//! Purchase task entity and its lifecycle state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::buyer::{Address, Buyer, ResolvedContact};
use crate::payload::PurchasePayload;

/// Prefix of locally generated ids used before the executor assigns one.
const PLACEHOLDER_PREFIX: &str = "pending-";

/// Task lifecycle state.
///
/// `Success` and `Stopped` are terminal: a finished task is never reopened,
/// and a retry means creating a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not started; no fire time fixed yet.
    Pending,
    /// Armed with a fire time, waiting for the instant.
    Scheduled,
    /// Handed to the purchase executor.
    Running,
    /// Executor reported a successful purchase.
    Success,
    /// Stopped by the user or by a terminal executor failure.
    Stopped,
}

impl TaskStatus {
    /// Whether the state machine accepts no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Stopped)
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// Nothing re-enters `Pending`, and terminal states accept nothing.
    #[must_use]
    pub fn allows(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running | Self::Scheduled)
                | (Self::Scheduled, Self::Running | Self::Stopped)
                | (Self::Running, Self::Success | Self::Stopped)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// How the shared contact fields apply to the task's buyers.
///
/// This is an explicit flag rather than an inference from the buyer count,
/// so adding or removing a buyer never silently changes payload contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactMode {
    /// Each buyer resolves its own contact; the shared contact is unused.
    #[default]
    PerBuyer,
    /// The task-level shared contact participates in resolution for every
    /// buyer, between per-buyer overrides and address matching.
    Shared,
}

/// Catalog selection the purchase targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub project_id: String,
    pub project_name: String,
    pub screen_id: String,
    pub screen_name: String,
    pub sku_id: String,
    pub sku_name: String,
    /// Expected price in the provider's smallest unit, passed through so the
    /// executor can seed its price-change handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_money: Option<u32>,
}

/// Attempt budget mode for the executor's outer retry loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttemptMode {
    /// Keep attempting until success or user stop.
    #[default]
    Infinite,
    /// Give up after the configured number of rounds.
    Finite,
}

// The persisted spec format stores the mode as 0 (infinite) / 1 (finite).
impl Serialize for AttemptMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(match self {
            Self::Infinite => 0,
            Self::Finite => 1,
        })
    }
}

impl<'de> Deserialize<'de> for AttemptMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u32::deserialize(deserializer)? {
            0 => Ok(Self::Infinite),
            1 => Ok(Self::Finite),
            other => Err(serde::de::Error::custom(format!(
                "unknown attempt mode: {other}"
            ))),
        }
    }
}

/// Knobs passed opaquely to the purchase executor; retry policy is the
/// executor's business, the scheduler only transports these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Delay between purchase attempts, in milliseconds.
    pub interval_ms: u64,
    /// Attempt budget mode.
    pub mode: AttemptMode,
    /// Rounds allowed in finite mode.
    pub total_attempts: u32,
    /// Outbound proxy for the executor's requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            mode: AttemptMode::Infinite,
            total_attempts: 10,
            proxy: None,
        }
    }
}

/// Everything needed to create a task; validated by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub selection: Selection,
    pub buyers: Vec<Buyer>,
    pub contact_overrides: HashMap<String, ResolvedContact>,
    pub address_overrides: HashMap<String, Address>,
    pub contact_mode: ContactMode,
    pub shared_contact: Option<ResolvedContact>,
    pub fire_time: Option<DateTime<Utc>>,
    pub options: ExecuteOptions,
}

/// The central mutable entity owned by the scheduler.
///
/// All mutation goes through the scheduler's API; other components only
/// ever see snapshot clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Executor-assigned id once accepted; a local placeholder before that.
    pub id: String,

    /// Lifecycle state; transitions are monotone per [`TaskStatus::allows`].
    pub status: TaskStatus,

    /// Catalog selection the purchase targets.
    pub selection: Selection,

    /// Ordered buyers, unique by id; never empty past validation.
    pub buyers: Vec<Buyer>,

    /// User-edited contacts per buyer id; take precedence over automatic
    /// resolution.
    #[serde(default)]
    pub contact_overrides: HashMap<String, ResolvedContact>,

    /// User-picked addresses per buyer id; take precedence over matching.
    #[serde(default)]
    pub address_overrides: HashMap<String, Address>,

    /// How the shared contact applies.
    #[serde(default)]
    pub contact_mode: ContactMode,

    /// Task-level contact, consulted only in [`ContactMode::Shared`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_contact: Option<ResolvedContact>,

    /// Wall-clock instant to fire at; absent means "run immediately".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fire_time: Option<DateTime<Utc>>,

    /// Executor knobs.
    pub options: ExecuteOptions,

    /// Last payload built for this task; rebuilt when inputs change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PurchasePayload>,

    /// Append-only progress log.
    #[serde(default)]
    pub logs: Vec<String>,

    /// Payment link, set only when the purchase succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,

    /// Creation instant, local wall clock.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task from a validated draft, in `Pending` or `Scheduled`
    /// depending on whether a fire time was given.
    #[must_use]
    pub fn from_draft(draft: TaskDraft) -> Self {
        let status = if draft.fire_time.is_some() {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };

        Self {
            id: Self::placeholder_id(),
            status,
            selection: draft.selection,
            buyers: draft.buyers,
            contact_overrides: draft.contact_overrides,
            address_overrides: draft.address_overrides,
            contact_mode: draft.contact_mode,
            shared_contact: draft.shared_contact,
            fire_time: draft.fire_time,
            options: draft.options,
            payload: None,
            logs: Vec::new(),
            payment_url: None,
            created_at: Utc::now(),
        }
    }

    /// Generate a local placeholder id.
    #[must_use]
    pub fn placeholder_id() -> String {
        format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4())
    }

    /// Whether this task still carries a locally generated id.
    #[must_use]
    pub fn has_placeholder_id(&self) -> bool {
        self.id.starts_with(PLACEHOLDER_PREFIX)
    }

    /// Apply a state transition if the machine allows it.
    ///
    /// Returns `false` for illegal transitions, which callers drop silently:
    /// a late executor event for a stopped task is expected, not an error.
    pub fn try_transition(&mut self, to: TaskStatus) -> bool {
        if self.status.allows(to) {
            self.status = to;
            true
        } else {
            false
        }
    }

    /// Append a log line.
    pub fn push_log(&mut self, message: impl Into<String>) {
        self.logs.push(message.into());
    }

    /// Most recent log line, if any.
    #[must_use]
    pub fn last_log(&self) -> Option<&str> {
        self.logs.last().map(String::as_str)
    }
}

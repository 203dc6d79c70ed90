//! Stagedoor - Time-Synchronized Multi-Task Purchase Orchestrator
//!
//! This crate schedules many independent "acquire a limited resource at a
//! precise future instant" attempts against a remote ticketing service
//! whose clock differs from the local one, and exposes live progress per
//! attempt:
//!
//! - **Clock sync**: offset estimation against HTTP or NTP time sources
//! - **Task lifecycle**: independently scheduled, independently cancellable
//!   purchase tasks with exact single-instant firing across clock drift
//! - **Contact resolution**: deterministic reconciliation of masked buyer
//!   records against address-book records
//! - **Payload assembly**: per-buyer purchase requests with override-aware
//!   contact and delivery blocks
//! - **Notifications**: best-effort completion fan-out over push channels
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`config`]: Configuration loading and validation
//! - [`clock`]: Offset measurement and the shared synced clock
//! - [`domain`]: Core domain models (buyers, tasks, portable specs)
//! - [`contact`]: Buyer/address reconciliation
//! - [`payload`]: Purchase request assembly
//! - [`scheduler`]: Task ownership, timers and executor event routing
//! - [`executor`]: Boundary contract with the external purchase executor
//! - [`notify`]: Completion notification fan-out
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stagedoor::config::AppConfig;
//! use stagedoor::executor::event_channel;
//! use stagedoor::scheduler::TaskScheduler;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let (events_tx, events_rx) = event_channel();
//!     let executor = Arc::new(MyExecutor::new(events_tx));
//!     let scheduler = TaskScheduler::new(executor, events_rx, config.scheduler_settings());
//!
//!     scheduler.sync_clock().await?;
//!     let task = scheduler.create_task(draft, &address_book)?;
//!     scheduler.start(&task.id).await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod clock;
pub mod config;
pub mod contact;
pub mod domain;
pub mod error;
pub mod executor;
pub mod logging;
pub mod notify;
pub mod payload;
pub mod scheduler;

pub use clock::{ClockOffset, SyncedClock, TimeSource, TimeSyncClient};
pub use domain::{Task, TaskDraft, TaskSpec, TaskStatus};
pub use scheduler::{SchedulerSettings, TaskScheduler};

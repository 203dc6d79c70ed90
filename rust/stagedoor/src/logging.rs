//! Structured logging utilities.
//!
//! Tracing initialization for the binary plus a small operation timer used
//! around clock syncs and executor hand-offs, where the duration itself is
//! the interesting datum.

use std::time::Instant;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over the passed default level.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Operation timer that logs start and duration.
#[derive(Debug)]
pub struct OpTimer {
    /// Component being timed (e.g. "clock", "scheduler").
    component: &'static str,
    /// Operation being performed (e.g. "sync", "invoke").
    operation: &'static str,
    start: Instant,
}

impl OpTimer {
    /// Start a timer and log the operation start.
    #[must_use]
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        tracing::debug!(component, operation, "operation started");
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Finish with result-aware logging.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) {
        let duration_ms = self.start.elapsed().as_millis();
        match result {
            Ok(_) => {
                tracing::info!(
                    component = self.component,
                    operation = self.operation,
                    duration_ms,
                    "operation completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    component = self.component,
                    operation = self.operation,
                    duration_ms,
                    error = %e,
                    "operation failed"
                );
            }
        }
    }
}

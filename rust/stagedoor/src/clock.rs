//! Clock synchronization against an authoritative time source.
//!
//! Sale openings are timed on the provider's clock, not the buyer's, so the
//! scheduler works with a measured offset between the two. An offset is only
//! meaningful combined with the *current* local clock reading; consumers
//! must never cache an absolute server time across reads.
//!
//! The local receipt timestamp is taken right after the response is parsed,
//! so the measured offset silently includes up to one round trip of network
//! latency. That error is accepted: ticket windows open on whole seconds
//! and the competing clients share the same skew.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::ClockSyncError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Socket read timeout for the NTP path; the caller's overall deadline is
/// enforced on top of this.
const NTP_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Measured difference between server time and local time.
///
/// Replaced wholesale by each successful sync, never partially updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOffset {
    /// `server_time - local_time_at_receipt`, in milliseconds.
    pub offset_millis: i64,
    /// Local instant at which the server timestamp was captured.
    pub measured_at_local: DateTime<Utc>,
}

/// An authoritative time source endpoint.
///
/// HTTP endpoints answer with a JSON body carrying a timestamp in one of
/// the known provider shapes; anything else is treated as an NTP host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSource {
    /// HTTP(S) endpoint returning a JSON-wrapped timestamp.
    Http(String),
    /// NTP server, `host` or `host:port`.
    Ntp(String),
}

impl TimeSource {
    /// Classify a raw source string the way users write it.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http") {
            Self::Http(trimmed.to_string())
        } else {
            Self::Ntp(trimmed.to_string())
        }
    }
}

impl std::fmt::Display for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{url}"),
            Self::Ntp(host) => write!(f, "ntp://{host}"),
        }
    }
}

/// Extract a millisecond epoch timestamp from a provider response.
///
/// Known shapes, tried in order:
/// - `{"data": {"now": <seconds>}}`
/// - `{"data": {"t": "<millis>"}}`
/// - `{"serverTime": <millis>}`
/// - `{"time": <seconds or millis>}`, disambiguated by magnitude
#[must_use]
pub fn extract_server_millis(value: &Value) -> Option<i64> {
    if let Some(now) = value["data"]["now"].as_i64() {
        return Some(now * 1000);
    }

    if let Some(t_str) = value["data"]["t"].as_str() {
        if let Ok(t) = t_str.parse::<i64>() {
            return Some(t);
        }
    }

    if let Some(t) = value["serverTime"].as_i64() {
        return Some(t);
    }

    if let Some(t) = value["time"].as_i64() {
        // ~1.7e9 is seconds territory, ~1.7e12 is millis.
        if t > 100_000_000_000 {
            return Some(t);
        }
        return Some(t * 1000);
    }

    None
}

/// One-shot offset measurement against a time source.
///
/// No retry loop lives here; retry policy belongs to the caller.
#[derive(Debug, Clone)]
pub struct TimeSyncClient {
    client: reqwest::Client,
}

impl TimeSyncClient {
    /// Create a sync client.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Measure the offset against `source`.
    ///
    /// The deadline is enforced by racing the request against a timer, so
    /// it holds even on the NTP path where the transport blocks; a response
    /// arriving after the race is lost is discarded.
    pub async fn sync(
        &self,
        source: &TimeSource,
        timeout: Duration,
    ) -> Result<ClockOffset, ClockSyncError> {
        let server_millis = tokio::time::timeout(timeout, self.fetch_server_millis(source))
            .await
            .map_err(|_| ClockSyncError::Timeout {
                millis: timeout.as_millis() as u64,
            })??;

        let measured_at_local = Utc::now();
        Ok(ClockOffset {
            offset_millis: server_millis - measured_at_local.timestamp_millis(),
            measured_at_local,
        })
    }

    async fn fetch_server_millis(&self, source: &TimeSource) -> Result<i64, ClockSyncError> {
        match source {
            TimeSource::Http(url) => self.fetch_http(url).await,
            TimeSource::Ntp(host) => {
                let host = host.clone();
                tokio::task::spawn_blocking(move || fetch_ntp_blocking(&host))
                    .await
                    .map_err(|e| ClockSyncError::SourceUnreachable(e.to_string()))?
            }
        }
    }

    async fn fetch_http(&self, url: &str) -> Result<i64, ClockSyncError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ClockSyncError::SourceUnreachable(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ClockSyncError::MalformedResponse(e.to_string()))?;

        extract_server_millis(&body).ok_or_else(|| {
            ClockSyncError::MalformedResponse("no timestamp field in response".to_string())
        })
    }
}

impl Default for TimeSyncClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Query an NTP server; seconds resolution is all the protocol helper
/// exposes, which matches the whole-second granularity of sale openings.
fn fetch_ntp_blocking(server: &str) -> Result<i64, ClockSyncError> {
    let address = if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:123")
    };

    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| ClockSyncError::SourceUnreachable(format!("udp bind: {e}")))?;
    socket
        .set_read_timeout(Some(NTP_READ_TIMEOUT))
        .map_err(|e| ClockSyncError::SourceUnreachable(format!("udp timeout: {e}")))?;

    let result = sntpc::simple_get_time(&address, &socket)
        .map_err(|e| ClockSyncError::SourceUnreachable(format!("ntp: {e:?}")))?;

    Ok(i64::from(result.sec()) * 1000)
}

/// Shared clock handle combining the local clock with the last offset.
///
/// Until the first successful sync, [`SyncedClock::now`] returns `None` and
/// callers must fall back to the local clock, surfacing the unsynced state.
#[derive(Debug, Clone, Default)]
pub struct SyncedClock {
    offset: Arc<RwLock<Option<ClockOffset>>>,
}

impl SyncedClock {
    /// Create an unsynced clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored offset wholesale.
    pub fn apply(&self, offset: ClockOffset) {
        *self.offset.write() = Some(offset);
    }

    /// Last applied offset, if any sync has succeeded.
    #[must_use]
    pub fn offset(&self) -> Option<ClockOffset> {
        *self.offset.read()
    }

    /// Whether at least one sync has succeeded.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.offset.read().is_some()
    }

    /// Estimated server time, derived from the current local clock reading.
    #[must_use]
    pub fn now(&self) -> Option<DateTime<Utc>> {
        let offset = (*self.offset.read())?;
        Some(Utc::now() + chrono::Duration::milliseconds(offset.offset_millis))
    }
}

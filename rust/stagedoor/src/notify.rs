//! Completion notifications: one local desktop notification plus a
//! best-effort fan-out over the configured push channels.
//!
//! Each channel type has a fixed URL-construction rule. Channels are
//! independent: a failing channel is logged and never blocks the others,
//! and nothing here retries — one attempt per channel per terminal task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::NotificationsConfig;
use crate::domain::{Task, TaskStatus};
use crate::error::ChannelError;

/// The statically known push-channel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    PushPlus,
    ServerChan,
    Bark,
    Ntfy,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PushPlus => write!(f, "pushplus"),
            Self::ServerChan => write!(f, "serverchan"),
            Self::Bark => write!(f, "bark"),
            Self::Ntfy => write!(f, "ntfy"),
        }
    }
}

/// HTTP verb a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMethod {
    Get,
    Post,
}

/// A fully constructed push attempt, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub channel: ChannelKind,
    pub method: PushMethod,
    pub url: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// Build the outbound request for one channel.
///
/// URL rules per channel:
/// - PushPlus: `GET` with token/title/content as query parameters,
/// - ServerChan: `GET` with the key in the path,
/// - Bark: `GET` with title/content as path segments; a bare token expands
///   under `https://api.day.app`,
/// - Ntfy: `POST` with the content as body and the title in a header; a
///   bare topic expands under `https://ntfy.sh`.
pub fn build_push_request(
    channel: ChannelKind,
    credential: &str,
    title: &str,
    content: &str,
) -> Result<PushRequest, ChannelError> {
    let credential = credential.trim();
    if credential.is_empty() {
        return Err(ChannelError::Misconfigured {
            channel: channel.to_string(),
            reason: "no token configured".to_string(),
        });
    }

    let request = match channel {
        ChannelKind::PushPlus => PushRequest {
            channel,
            method: PushMethod::Get,
            url: format!(
                "http://www.pushplus.plus/send?token={credential}&title={}&content={}",
                urlencoding::encode(title),
                urlencoding::encode(content)
            ),
            body: None,
            headers: Vec::new(),
        },
        ChannelKind::ServerChan => PushRequest {
            channel,
            method: PushMethod::Get,
            url: format!(
                "https://sctapi.ftqq.com/{credential}.send?title={}&desp={}",
                urlencoding::encode(title),
                urlencoding::encode(content)
            ),
            body: None,
            headers: Vec::new(),
        },
        ChannelKind::Bark => {
            let mut base = if credential.starts_with("http") {
                credential.to_string()
            } else {
                format!("https://api.day.app/{credential}")
            };
            while base.ends_with('/') {
                base.pop();
            }
            PushRequest {
                channel,
                method: PushMethod::Get,
                url: format!(
                    "{base}/{}/{}",
                    urlencoding::encode(title),
                    urlencoding::encode(content)
                ),
                body: None,
                headers: Vec::new(),
            }
        }
        ChannelKind::Ntfy => {
            let url = if credential.starts_with("http") {
                credential.to_string()
            } else {
                format!("https://ntfy.sh/{credential}")
            };
            PushRequest {
                channel,
                method: PushMethod::Post,
                url,
                body: Some(content.to_string()),
                headers: vec![("Title".to_string(), title.to_string())],
            }
        }
    };

    Ok(request)
}

/// Delivery seam so tests can fail channels deterministically.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Perform exactly one delivery attempt.
    async fn deliver(&self, request: &PushRequest) -> Result<(), ChannelError>;
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpPushTransport {
    client: reqwest::Client,
}

impl HttpPushTransport {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

impl Default for HttpPushTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn deliver(&self, request: &PushRequest) -> Result<(), ChannelError> {
        let mut builder = match request.method {
            PushMethod::Get => self.client.get(&request.url),
            PushMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ChannelError::Transport {
                channel: request.channel.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ChannelError::Rejected {
                channel: request.channel.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Local desktop notification seam.
///
/// Presentation transports live outside this core; the default
/// implementation records the notification in the structured log, and a
/// host app plugs in its own implementation.
pub trait DesktopNotifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Default desktop notifier: one structured log line.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl DesktopNotifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        tracing::info!(title, body, "desktop notification");
    }
}

/// Composes and fans out completion messages for terminal tasks.
pub struct NotificationDispatcher {
    channels: Vec<(ChannelKind, String)>,
    transport: Arc<dyn PushTransport>,
    desktop: Arc<dyn DesktopNotifier>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<ChannelKind> = self.channels.iter().map(|(k, _)| *k).collect();
        f.debug_struct("NotificationDispatcher")
            .field("channels", &kinds)
            .finish()
    }
}

impl NotificationDispatcher {
    /// Build a dispatcher from the configured channel credentials.
    #[must_use]
    pub fn new(
        config: &NotificationsConfig,
        transport: Arc<dyn PushTransport>,
        desktop: Arc<dyn DesktopNotifier>,
    ) -> Self {
        let mut channels = Vec::new();
        let mut enable = |kind: ChannelKind, value: &Option<String>| {
            if let Some(v) = value {
                if !v.trim().is_empty() {
                    channels.push((kind, v.trim().to_string()));
                }
            }
        };
        enable(ChannelKind::PushPlus, &config.pushplus);
        enable(ChannelKind::ServerChan, &config.serverchan);
        enable(ChannelKind::Bark, &config.bark);
        enable(ChannelKind::Ntfy, &config.ntfy);

        Self {
            channels,
            transport,
            desktop,
        }
    }

    /// Number of enabled push channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Compose the human-readable title and body for a terminal task.
    #[must_use]
    pub fn compose(task: &Task) -> (String, String) {
        let title = if task.status == TaskStatus::Success {
            "Ticket secured!".to_string()
        } else {
            "Purchase task ended".to_string()
        };
        let body = task
            .last_log()
            .unwrap_or("task finished without log output")
            .to_string();
        (title, body)
    }

    /// Handle one terminal task: one desktop notification, then one
    /// attempt per enabled channel. Never fails past this call.
    pub async fn on_task_terminal(&self, task: &Task) {
        let (title, body) = Self::compose(task);
        self.desktop.notify(&title, &body);

        let attempts = self.channels.iter().map(|(kind, credential)| {
            let title = title.clone();
            let body = body.clone();
            async move {
                let result = match build_push_request(*kind, credential, &title, &body) {
                    Ok(request) => self.transport.deliver(&request).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!(channel = %kind, error = %e, "push channel failed");
                }
            }
        });
        futures::future::join_all(attempts).await;
    }

    /// Listen on the scheduler's terminal feed until it closes.
    pub fn spawn(self: Arc<Self>, mut terminal: broadcast::Receiver<Task>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match terminal.recv().await {
                    Ok(task) => self.on_task_terminal(&task).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "notification listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

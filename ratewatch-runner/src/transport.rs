//! Outbound message transports.
//!
//! A [`Transport`] only knows how to send one message. Failures are caught in
//! exactly one place, [`DeliveryBoundary::deliver`], which logs them and
//! records them in a [`DeliveryReport`]; nothing is retried within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use ratewatch_core::notify::{Notification, NotificationKind};

use crate::config::{TransportConfig, TransportKind};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("HTTP delivery failed: {0}")]
    Http(String),

    #[error("transport misconfigured: {0}")]
    Config(String),
}

/// One message per subscriber per run: every notification the subscriber
/// earned this run, merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub subscriber_id: String,
    pub created_at: DateTime<Utc>,
    pub kinds: Vec<NotificationKind>,
    pub text: String,
}

impl OutboundMessage {
    /// Merge a subscriber's notifications, or `None` when there are none.
    pub fn merge(
        subscriber_id: &str,
        notifications: &[Notification],
        created_at: DateTime<Utc>,
    ) -> Option<Self> {
        if notifications.is_empty() {
            return None;
        }
        Some(Self {
            subscriber_id: subscriber_id.to_string(),
            created_at,
            kinds: notifications.iter().map(|n| n.kind.clone()).collect(),
            text: notifications
                .iter()
                .map(|n| n.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        })
    }
}

pub trait Transport {
    fn name(&self) -> &str;

    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Build the transport named by configuration.
pub fn from_config(
    config: &TransportConfig,
    outbox_path: &Path,
) -> Result<Box<dyn Transport>, TransportError> {
    match config.kind {
        TransportKind::Stdout => Ok(Box::new(StdoutTransport)),
        TransportKind::Outbox => Ok(Box::new(OutboxTransport::new(outbox_path))),
        TransportKind::Webhook => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| TransportError::Config("webhook transport needs a url".into()))?;
            Ok(Box::new(WebhookTransport::new(url, config.timeout_secs)?))
        }
    }
}

/// Writes `[subscriber] text` blocks to standard output.
pub struct StdoutTransport;

impl Transport for StdoutTransport {
    fn name(&self) -> &str {
        "stdout"
    }

    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut out = io::stdout().lock();
        writeln!(out, "[{}]", message.subscriber_id)?;
        writeln!(out, "{}", message.text)?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }
}

/// Appends one JSON object per message to a JSONL file, for a separate
/// delivery process to drain.
pub struct OutboxTransport {
    path: PathBuf,
}

impl OutboxTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every message in the outbox, skipping malformed lines.
    pub fn read_all(&self) -> io::Result<Vec<OutboundMessage>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut messages = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(message) = serde_json::from_str(&line) {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}

impl Transport for OutboxTransport {
    fn name(&self) -> &str {
        "outbox"
    }

    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(message)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{json}")?;
        file.flush()?;
        Ok(())
    }
}

/// POSTs `{"subscriber_id", "text"}` as JSON to a fixed URL.
pub struct WebhookTransport {
    client: reqwest::blocking::Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    subscriber_id: &'a str,
    text: &'a str,
}

impl WebhookTransport {
    pub fn new(url: &str, timeout_secs: u64) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl Transport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let body = WebhookBody {
            subscriber_id: &message.subscriber_id,
            text: &message.text,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("HTTP {status} from {}", self.url)));
        }
        Ok(())
    }
}

/// A delivery that failed, kept for the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub subscriber_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<DeliveryFailure>,
}

/// The single point where transport failures are swallowed.
pub struct DeliveryBoundary {
    transport: Box<dyn Transport>,
}

impl DeliveryBoundary {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Send every message once. Never fails; failures are logged and reported.
    pub fn deliver(&self, messages: &[OutboundMessage]) -> DeliveryReport {
        let mut report = DeliveryReport {
            attempted: messages.len(),
            ..DeliveryReport::default()
        };
        for message in messages {
            match self.transport.send(message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!(
                        "delivery to '{}' via {} failed: {e}",
                        message.subscriber_id,
                        self.transport.name()
                    );
                    report.failed.push(DeliveryFailure {
                        subscriber_id: message.subscriber_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

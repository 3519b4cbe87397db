//! Notification sinks for the run summary.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AutomationError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Urgent,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub subject: String,
    pub severity: Severity,
    pub lines: Vec<String>,
}

impl Notification {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        match notification.severity {
            Severity::Info => info!(
                subject = %notification.subject,
                "{}",
                notification.text()
            ),
            Severity::Urgent => warn!(
                subject = %notification.subject,
                "{}",
                notification.text()
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    channel: &'a str,
    severity: &'a str,
    subject: &'a str,
    text: String,
}

/// Posts notifications as JSON to a chat webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    channel: String,
}

impl WebhookSink {
    pub fn new(url: &str, channel: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            channel: channel.to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload {
            channel: &self.channel,
            severity: notification.severity.as_str(),
            subject: &notification.subject,
            text: notification.text(),
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send notification webhook")
            .and_then(|resp| {
                resp.error_for_status()
                    .context("Notification webhook returned error status")
            })
            .map_err(|e| AutomationError::collaborator("notification sink", e))?;
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| AutomationError::collaborator("notification sink", anyhow::anyhow!("lock poisoned")))?
            .push(notification.clone());
        Ok(())
    }
}

/// Delivers to every inner sink; fails if any of them failed.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let results =
            futures::future::join_all(self.sinks.iter().map(|sink| sink.send(notification))).await;
        let mut first_err = None;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "notification sink failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

//! Alert delivery targets.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use certshift_common::Severity;

use super::AlertRecord;
use crate::error::AlertError;

/// Somewhere alerts go
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, record: &AlertRecord) -> Result<(), AlertError>;
}

/// Emits alerts as structured log events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, record: &AlertRecord) -> Result<(), AlertError> {
        match record.severity {
            Severity::Critical => error!(
                group = %record.group,
                days_remaining = record.days_remaining,
                not_after = %record.not_after,
                "Certificate expiry CRITICAL"
            ),
            Severity::Warning => warn!(
                group = %record.group,
                days_remaining = record.days_remaining,
                not_after = %record.not_after,
                "Certificate expiry WARNING"
            ),
            Severity::Ok => info!(
                group = %record.group,
                days_remaining = record.days_remaining,
                "Certificate expiry OK"
            ),
        }
        Ok(())
    }
}

/// POSTs each alert as JSON
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        Ok(Self {
            url: url.into(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, record: &AlertRecord) -> Result<(), AlertError> {
        let response = self.client.post(&self.url).json(record).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status(status.as_u16()));
        }
        debug!(url = %self.url, group = %record.group, "Delivered alert webhook");
        Ok(())
    }
}

/// Appends alerts to a JSON lines history file
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AlertSink for JsonlSink {
    fn name(&self) -> &'static str {
        "history"
    }

    async fn send(&self, record: &AlertRecord) -> Result<(), AlertError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

//! Notification sinks
//!
//! The delivery channel is pluggable; the aggregator only needs
//! success/failure back from a sink.

use super::AlertEvent;
use crate::error::AlertError;
use async_trait::async_trait;
use statline_common::config::Severity;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError>;
}

/// Writes alerts to the tracing log at a level matching their severity
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        match event.severity {
            Severity::Critical | Severity::Error => {
                tracing::error!(
                    category = %event.category,
                    severity = %event.severity,
                    title = %event.title,
                    message = %event.message,
                    "Alert"
                );
            }
            Severity::Warning => {
                tracing::warn!(
                    category = %event.category,
                    title = %event.title,
                    message = %event.message,
                    "Alert"
                );
            }
            Severity::Info => {
                tracing::info!(
                    category = %event.category,
                    title = %event.title,
                    message = %event.message,
                    "Alert"
                );
            }
        }
        Ok(())
    }
}

/// Keeps delivered alerts in memory; can be switched to fail every delivery
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AlertEvent>>>,
    failing: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AlertError::DeliveryFailed {
                sink: "memory".to_string(),
                message: "sink configured to fail".to_string(),
            });
        }

        let mut events = self.events.lock().map_err(|_| AlertError::DeliveryFailed {
            sink: "memory".to_string(),
            message: "sink lock poisoned".to_string(),
        })?;
        events.push(event.clone());
        Ok(())
    }
}

/// POSTs each alert as JSON
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    /// Every request is bounded by `timeout`; a hung endpoint becomes a
    /// delivery failure
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::SinkSetup {
                sink: "webhook".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| AlertError::DeliveryFailed {
                sink: "webhook".to_string(),
                message: format!("request failed: {}", e),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AlertError::DeliveryFailed {
                sink: "webhook".to_string(),
                message: format!("status {}", response.status()),
            })
        }
    }
}

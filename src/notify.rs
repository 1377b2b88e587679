//! Scrape completion notifications.
//!
//! A finished scrape (success, error, or cancellation) can POST a JSON
//! payload to a configured webhook. Delivery is best effort: failures are
//! logged and never affect the scrape outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::models::ProjectState;

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeEventPayload {
    /// `scrape_complete` for ready/cancelled outcomes, `scrape_error`
    /// for failures.
    pub event: &'static str,
    pub project_id: String,
    pub status: ProjectState,
    pub pages_scraped: u32,
    pub errors: u32,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, payload: ScrapeEventPayload);
}

pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notify(&self, _payload: ScrapeEventPayload) {}
}

pub struct WebhookSink {
    client: reqwest::Client,
    config: WebhookConfig,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String, config: WebhookConfig) -> anyhow::Result<Self> {
        Ok(WebhookSink {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            config,
            url,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, payload: ScrapeEventPayload) {
        let wanted = match payload.status {
            ProjectState::Ready => self.config.on_success,
            ProjectState::Error | ProjectState::Cancelled => self.config.on_error,
            _ => false,
        };
        if !wanted {
            return;
        }
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(project = %payload.project_id, "webhook delivered");
            }
            Ok(resp) => {
                warn!(project = %payload.project_id, status = %resp.status(), "webhook rejected");
            }
            Err(e) => {
                warn!(project = %payload.project_id, error = %e, "webhook delivery failed");
            }
        }
    }
}

/// Build the configured sink; no webhook URL means notifications are a
/// no-op.
pub fn sink_from_config(config: &WebhookConfig) -> anyhow::Result<Arc<dyn NotificationSink>> {
    match &config.url {
        Some(url) => Ok(Arc::new(WebhookSink::new(url.clone(), config.clone())?)),
        None => Ok(Arc::new(NullSink)),
    }
}

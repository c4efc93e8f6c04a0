//! Notifier - structured lifecycle events over a webhook.
//!
//! Observability must never block lifecycle progress: a missing URL is a
//! silent no-op and delivery failures are logged and discarded. This is the
//! only component allowed to swallow upstream errors.

use crate::config::ConfigStore;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Structured lifecycle event
///
/// Vocabulary: `usb_disconnected`, `usb_connected`, `archive_started`,
/// `archive_complete`, `archive_error`, `temperature_warning`,
/// `temperature_caution`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event: &str, message: impl Into<String>) -> Self {
        Self {
            event: event.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Notifier instance
pub struct Notifier {
    config: Arc<ConfigStore>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    /// POST `event` to the configured notifications webhook. Never fails;
    /// missing URL is a no-op.
    pub async fn send(&self, event: Event) {
        let url = self.config.get().await.notifications.webhook_url.clone();
        if url.is_empty() {
            return;
        }
        if let Err(e) = post_json(&self.client, &url, &event).await {
            tracing::warn!(event = %event.event, error = %e, "Notification failed");
        }
    }
}

/// POST an arbitrary JSON payload to a webhook URL.
///
/// Only http and https schemes are accepted, so a misconfigured URL cannot
/// be used to reach non-HTTP services.
pub async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    payload: &T,
) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Config(format!("invalid webhook URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::Config(format!(
                "webhook URL must use http or https, got {scheme:?}"
            )));
        }
    }
    client
        .post(parsed)
        .json(payload)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

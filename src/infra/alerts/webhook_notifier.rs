use crate::core::alerts::{OpsAlert, OpsNotifier};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use std::error::Error;
use std::time::Duration;

/// Posts alerts to an operator webhook as JSON.
///
/// Payload: `{"title", "summary", "timestamp", "alert": {...}}` where `alert`
/// is the tagged alert itself.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

fn payload(alert: &OpsAlert) -> serde_json::Value {
    json!({
        "title": alert.title(),
        "summary": alert.summary(),
        "timestamp": Utc::now().to_rfc3339(),
        "alert": alert,
    })
}

#[async_trait]
impl OpsNotifier for WebhookNotifier {
    async fn notify(&self, alert: &OpsAlert) -> Result<(), Box<dyn Error + Send + Sync>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&payload(alert))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        if resp.status().is_success() {
            tracing::debug!(alert = alert.title(), "Operator webhook notified");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(format!("Operator webhook error {status}: {body}").into())
        }
    }
}

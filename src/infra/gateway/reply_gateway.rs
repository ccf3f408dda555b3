use crate::core::bots::{PendingReply, ReplySender};
use crate::infra::database::enum_text;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::error::Error;
use std::time::Duration;

/// Hands replies to the messaging-channel service (platform comment APIs,
/// WeChat/WeCom robots) over HTTP.
pub struct HttpReplyGateway {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpReplyGateway {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl ReplySender for HttpReplyGateway {
    async fn send_reply(&self, reply: &PendingReply) -> Result<(), Box<dyn Error + Send + Sync>> {
        let payload = json!({
            "bot_id": reply.bot_id,
            "log_id": reply.log_id,
            "channel": enum_text(&reply.channel),
            "recipient": reply.recipient,
            "content": reply.content,
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Reply gateway error {status}: {body}").into());
        }

        Ok(())
    }
}

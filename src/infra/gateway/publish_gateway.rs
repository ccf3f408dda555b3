use crate::core::dispatch::{PlatformPublisher, PublishError, PublishReceipt};
use crate::core::scheduling::Platform;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

/// Publishes content through the platform account service at `{base_url}/{platform}`.
pub struct HttpPublishGateway {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPublishGateway {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn endpoint(&self, platform: Platform) -> String {
        format!("{}/{}", self.base_url, platform.as_str())
    }
}

#[async_trait]
impl PlatformPublisher for HttpPublishGateway {
    async fn publish(
        &self,
        platform: Platform,
        content: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let response = self
            .client
            .post(self.endpoint(platform))
            .timeout(self.timeout)
            .json(&json!({ "content": content }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Timeout(self.timeout)
                } else {
                    PublishError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Transport(format!("{status}: {body}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        Ok(PublishReceipt {
            post_id: body["post_id"].as_str().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_platform_name() {
        let gateway = HttpPublishGateway::new(
            "http://publisher.local/api/".into(),
            Duration::from_secs(5),
        );
        assert_eq!(
            gateway.endpoint(Platform::WechatChannels),
            "http://publisher.local/api/wechat_channels"
        );
    }
}

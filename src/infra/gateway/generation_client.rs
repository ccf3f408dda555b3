use crate::core::bots::ReplyGenerator;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::error::Error;
use std::time::Duration;

/// Knowledge-base backed reply generation over HTTP.
///
/// Sends `{"prompt", "knowledge_base_ids"}` and expects `{"text": "..."}` back.
pub struct GenerationClient {
    client: Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl GenerationClient {
    pub fn new(url: String, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            api_key,
            timeout,
        }
    }
}

#[async_trait]
impl ReplyGenerator for GenerationClient {
    async fn generate(
        &self,
        prompt: &str,
        knowledge_base_ids: &[i64],
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let payload = json!({
            "prompt": prompt,
            "knowledge_base_ids": knowledge_base_ids,
        });

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(format!("Generation API error: {} - {}", status, text).into());
        }

        let response_json: serde_json::Value = response.json().await?;

        let text = response_json["text"]
            .as_str()
            .ok_or("Failed to parse generated text")?
            .trim()
            .to_string();

        Ok(text)
    }
}

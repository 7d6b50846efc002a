//! Video transcript adapter.
//!
//! Transcript extraction runs in a separate sync service; this adapter
//! asks it for the transcript of each video of a channel or playlist and
//! hands the text to the shared pipeline. The service endpoint is set via
//! `TRANSCRIPT_SERVICE_URL`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::kb::{FetchAdapter, KbContent};

pub struct TranscriptAdapter {
    client: reqwest::Client,
    service_url: String,
    source_url: String,
}

impl TranscriptAdapter {
    pub fn new(source_url: &str) -> Result<Self> {
        let service_url = std::env::var("TRANSCRIPT_SERVICE_URL")
            .map_err(|_| anyhow::anyhow!("TRANSCRIPT_SERVICE_URL environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            service_url: service_url.trim_end_matches('/').to_string(),
            source_url: source_url.to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{}", self.service_url, path))
            .json(body)
            .send()
            .await
            .context("Transcript service request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Transcript service error {}: {}", status, text);
        }
        response
            .json()
            .await
            .context("Invalid JSON from transcript service")
    }
}

#[async_trait]
impl FetchAdapter for TranscriptAdapter {
    async fn list_keys(&self) -> Result<Vec<String>> {
        let json = self
            .post_json("/videos/list", &serde_json::json!({ "url": self.source_url }))
            .await?;

        json["videos"]
            .as_array()
            .map(|videos| {
                videos
                    .iter()
                    .filter_map(|v| v["url"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .ok_or_else(|| anyhow::anyhow!("Transcript service returned no video list"))
    }

    async fn fetch(&self, key: &str) -> Result<KbContent> {
        let json = self
            .post_json("/videos/transcript", &serde_json::json!({ "url": key }))
            .await?;

        let text = json["transcript"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("No transcript for {}", key))?;

        Ok(KbContent {
            title: json["title"].as_str().map(|s| s.to_string()),
            text: text.to_string(),
            ..Default::default()
        })
    }
}

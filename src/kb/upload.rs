//! Upload processor.
//!
//! A single document supplied out of band (API payload or file read)
//! flows through the same listener pipeline as crawled pages, keyed by
//! a stable `upload:` locator derived from the title.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::kb::{KbContent, KbProcessor, ProcessOutcome, ProcessorListener};

pub struct UploadProcessor {
    listener: Arc<dyn ProcessorListener>,
    title: String,
    text: String,
}

impl UploadProcessor {
    pub fn new(listener: Arc<dyn ProcessorListener>, title: &str, text: &str) -> Self {
        Self {
            listener,
            title: title.to_string(),
            text: text.to_string(),
        }
    }

    fn key(&self) -> String {
        let slug: String = self
            .title
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        format!("upload:{}", slug.trim_matches('-'))
    }
}

#[async_trait]
impl KbProcessor for UploadProcessor {
    async fn process(&mut self) -> Result<ProcessOutcome> {
        self.listener.on_before_start().await?;

        let key = self.key();
        let content = KbContent {
            title: Some(self.title.clone()),
            text: self.text.clone(),
            ..Default::default()
        };
        self.listener.on_content_available(&key, content).await?;

        self.listener.on_complete(None).await?;
        Ok(ProcessOutcome {
            visited_keys: vec![key],
        })
    }
}

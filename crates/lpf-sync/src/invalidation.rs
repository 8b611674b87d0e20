//! Post-update notifications for downstream caches.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

/// Called after posts received phone data. Failures are logged and swallowed
/// by [`notify_best_effort`].
#[async_trait]
pub trait InvalidationHook: Send + Sync {
    async fn posts_updated(&self, post_ids: &[i64]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopInvalidation;

#[async_trait]
impl InvalidationHook for NoopInvalidation {
    async fn posts_updated(&self, _post_ids: &[i64]) -> Result<()> {
        Ok(())
    }
}

/// POSTs `{"post_ids": [...]}` to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookInvalidation {
    client: reqwest::Client,
    url: String,
}

impl WebhookInvalidation {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building invalidation client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl InvalidationHook for WebhookInvalidation {
    async fn posts_updated(&self, post_ids: &[i64]) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "post_ids": post_ids }))
            .send()
            .await
            .with_context(|| format!("posting invalidation to {}", self.url))?;
        resp.error_for_status()
            .with_context(|| format!("invalidation rejected by {}", self.url))?;
        Ok(())
    }
}

pub async fn notify_best_effort(hook: &dyn InvalidationHook, post_ids: &[i64]) {
    if post_ids.is_empty() {
        return;
    }
    match hook.posts_updated(post_ids).await {
        Ok(()) => debug!(count = post_ids.len(), "invalidated posts"),
        Err(err) => warn!(error = %err, count = post_ids.len(), "post invalidation failed"),
    }
}

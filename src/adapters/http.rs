use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::core::boot::BootService;

/// Hand-off to the boot service's host API:
/// `PUT {base}/hosts/{mac}` stages an image, `DELETE {base}/hosts/{mac}`
/// clears it.
pub struct HttpBootService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBootService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build boot service client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn host_url(&self, mac: &str) -> String {
        format!("{}/hosts/{}", self.base_url, mac)
    }
}

#[async_trait]
impl BootService for HttpBootService {
    async fn stage_image(&self, mac: &str, image_ref: &str, job_id: &str) -> Result<()> {
        let url = self.host_url(mac);
        debug!(%url, image_ref, "Staging boot image");
        self.client
            .put(&url)
            .json(&json!({ "image": image_ref, "job_id": job_id }))
            .send()
            .await
            .with_context(|| format!("PUT {} failed", url))?
            .error_for_status()
            .with_context(|| format!("boot service rejected staging for {}", mac))?;
        Ok(())
    }

    async fn clear(&self, mac: &str) -> Result<()> {
        let url = self.host_url(mac);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", url))?;

        // Nothing staged is as good as cleared.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response
            .error_for_status()
            .with_context(|| format!("boot service rejected clear for {}", mac))?;
        Ok(())
    }
}

use pdfchat_error::{PdfChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Retry behaviour for downloading stored objects over HTTP.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    pub timeout_ms: u64,
    /// Extra attempts after the first one.
    pub retries: usize,
    pub base_backoff_ms: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 15000,
            retries: 2,
            base_backoff_ms: 250,
        }
    }
}

/// GETs `url`, retrying connection failures, 429 and 5xx with exponential backoff.
pub async fn http_fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    policy: FetchPolicy,
) -> Result<Vec<u8>> {
    let mut backoff_ms = policy.base_backoff_ms;
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let rb = client
            .get(url)
            .timeout(Duration::from_millis(policy.timeout_ms));
        match rb.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp.bytes().await?.to_vec());
                }
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if retryable && attempt <= policy.retries {
                    warn!(url, %status, attempt, "fetch failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                    continue;
                }
                if status.as_u16() == 404 {
                    return Err(PdfChatError::NotFound {
                        resource: url.to_string(),
                    });
                }
                return Err(PdfChatError::ObjectStorage {
                    operation: "fetch".to_string(),
                    message: format!("http {} for {}", status, url),
                });
            }
            Err(e) => {
                if attempt <= policy.retries {
                    warn!(url, error = %e, attempt, "fetch failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                    continue;
                }
                return Err(e.into());
            }
        }
    }
}

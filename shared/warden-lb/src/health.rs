//! Health probes

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::node::Node;
use crate::types::LbError;

/// Response header carrying the health score
pub const HEALTH_HEADER: &str = "x-health";

#[async_trait]
pub trait HealthFetcher: Send + Sync {
    /// Health score in `0..=100`; `Err` means the node is unreachable.
    async fn current_health(&self, node: &Node) -> Result<u8, LbError>;
}

/// HTTP probe against `http://{address}:{port}{path}`
#[derive(Clone)]
pub struct HttpHealthFetcher {
    client: reqwest::Client,
}

impl HttpHealthFetcher {
    pub fn new(timeout: Duration) -> Result<Self, LbError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LbError::Config(format!("Failed to build probe client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn url(node: &Node) -> String {
        let path = if node.path.starts_with('/') {
            node.path.clone()
        } else {
            format!("/{}", node.path)
        };
        format!("http://{}{}", node.socket_addr(), path)
    }
}

#[async_trait]
impl HealthFetcher for HttpHealthFetcher {
    async fn current_health(&self, node: &Node) -> Result<u8, LbError> {
        let url = Self::url(node);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LbError::Probe(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Probe returned non-success status");
            return Ok(0);
        }

        let header = response
            .headers()
            .get(HEALTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| LbError::Probe(format!("{}: {}", url, e)))?;

        Ok(parse_health(header.as_deref(), &body))
    }
}

/// Health from the `X-Health` header, else a `Health: NN` marker in the
/// body, else 0. Clamped to 100.
pub fn parse_health(header: Option<&str>, body: &str) -> u8 {
    let from_header = header.and_then(|value| leading_number(value.trim()));
    let from_body = || {
        body.find("Health:")
            .and_then(|idx| leading_number(body[idx + "Health:".len()..].trim_start()))
    };

    from_header.or_else(from_body).map_or(0, |health| health.min(100) as u8)
}

fn leading_number(text: &str) -> Option<u64> {
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    // absurdly long digit runs saturate instead of failing
    Some(digits.parse().unwrap_or(u64::MAX))
}

//! IPFS HTTP gateway storage portal.
//!
//! `GET <gateway>/ipfs/<address>`. Retries transport errors and 5xx with
//! exponential backoff, honours `retry-after` on 429. Retry policy lives
//! here, not in the package loader.

use std::time::Duration;

use async_trait::async_trait;

use super::StoragePortal;
use crate::error::PortalError;
use crate::identifier::ContentAddress;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Storage portal that reads through a public or local IPFS gateway.
#[derive(Clone)]
pub struct GatewayStoragePortal {
    client: reqwest::Client,
    gateway: String,
    max_retries: u32,
    retry_base: Duration,
}

impl GatewayStoragePortal {
    /// Create a portal for `gateway` (e.g. `https://ipfs.io`).
    pub fn new(gateway: &str) -> Self {
        Self::with_timeout(gateway, DEFAULT_TIMEOUT_MS)
    }

    pub fn with_timeout(gateway: &str, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("web3api/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            client,
            gateway: gateway.trim_end_matches('/').to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
        }
    }

    pub fn retries(mut self, max_retries: u32, base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = base;
        self
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn url_for(&self, address: &ContentAddress) -> String {
        format!("{}/ipfs/{address}", self.gateway)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        2u32
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.retry_base.checked_mul(factor))
            .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
    }
}

#[async_trait]
impl StoragePortal for GatewayStoragePortal {
    async fn fetch(&self, address: &ContentAddress) -> Result<Vec<u8>, PortalError> {
        let url = self.url_for(address);
        let mut retries = 0u32;

        loop {
            match self.client.get(&url).send().await {
                Ok(r) => {
                    let status = r.status().as_u16();

                    if status >= 500 && retries < self.max_retries {
                        retries += 1;
                        tracing::warn!("Gateway returned {status} for {url}, retry {retries}");
                        tokio::time::sleep(self.backoff(retries)).await;
                        continue;
                    }

                    if status == 429 && retries < self.max_retries {
                        retries += 1;
                        let retry_after = r
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| self.backoff(retries));
                        tokio::time::sleep(retry_after.min(Duration::from_secs(10))).await;
                        continue;
                    }

                    if status == 404 {
                        return Err(PortalError::NotFound(address.to_string()));
                    }
                    if !(200..300).contains(&status) {
                        return Err(PortalError::Http { status, url });
                    }

                    let bytes = r
                        .bytes()
                        .await
                        .map_err(|e| PortalError::Transport(e.to_string()))?;
                    tracing::debug!("Fetched {} bytes from {url}", bytes.len());
                    return Ok(bytes.to_vec());
                }
                Err(e) => {
                    if retries < self.max_retries {
                        retries += 1;
                        tracing::warn!("Gateway request to {url} failed: {e}, retry {retries}");
                        tokio::time::sleep(self.backoff(retries)).await;
                        continue;
                    }
                    return Err(PortalError::Transport(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast(portal: GatewayStoragePortal) -> GatewayStoragePortal {
        portal.retries(2, Duration::from_millis(1))
    }

    #[test]
    fn test_url_for_trims_trailing_slash() {
        let portal = GatewayStoragePortal::new("https://ipfs.io/");
        assert_eq!(
            portal.url_for(&ContentAddress::new("QmA")),
            "https://ipfs.io/ipfs/QmA"
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let portal =
            GatewayStoragePortal::new("https://ipfs.io").retries(40, Duration::from_millis(1));
        assert_eq!(portal.backoff(1), Duration::from_millis(1));
        assert_eq!(portal.backoff(4), Duration::from_millis(8));
        assert_eq!(portal.backoff(33), MAX_BACKOFF);
        assert_eq!(portal.backoff(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ipfs/QmA"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{\"name\":\"x\"}".to_vec()))
            .mount(&server)
            .await;

        let portal = fast(GatewayStoragePortal::new(&server.uri()));
        let bytes = portal.fetch(&ContentAddress::new("QmA")).await.unwrap();
        assert_eq!(bytes, b"{\"name\":\"x\"}");
    }

    #[tokio::test]
    async fn test_fetch_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let portal = fast(GatewayStoragePortal::new(&server.uri()));
        let err = portal.fetch(&ContentAddress::new("QmA")).await.unwrap_err();
        assert!(matches!(err, PortalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .with_priority(2)
            .mount(&server)
            .await;

        let portal = fast(GatewayStoragePortal::new(&server.uri()));
        let bytes = portal.fetch(&ContentAddress::new("QmA")).await.unwrap();
        assert_eq!(bytes, b"ok");
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let portal = fast(GatewayStoragePortal::new(&server.uri()));
        let err = portal.fetch(&ContentAddress::new("QmA")).await.unwrap_err();
        assert!(matches!(err, PortalError::Http { status: 502, .. }));
    }
}

//! Remote capacity reporting
//!
//! The rate-limited services publish how many request slots they can take
//! right now. The ticket queue asks on every poll, since the figure moves
//! independently of us.

use crate::error::{status_error, Result, SyncError};
use async_trait::async_trait;
use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[async_trait]
pub trait CapacityProbe: Send + Sync {
    /// Request slots currently available (0 means wait)
    async fn available_capacity(&self) -> Result<u32>;
}

/// For resources without a published limit
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedCapacity;

#[async_trait]
impl CapacityProbe for UnlimitedCapacity {
    async fn available_capacity(&self) -> Result<u32> {
        Ok(u32::MAX)
    }
}

/// Capacity set by the caller; used for local runs and tests
#[derive(Debug, Default)]
pub struct FixedCapacity {
    slots: AtomicU32,
}

impl FixedCapacity {
    pub fn new(slots: u32) -> Self {
        Self {
            slots: AtomicU32::new(slots),
        }
    }

    pub fn set(&self, slots: u32) {
        self.slots.store(slots, Ordering::SeqCst);
    }
}

#[async_trait]
impl CapacityProbe for FixedCapacity {
    async fn available_capacity(&self) -> Result<u32> {
        Ok(self.slots.load(Ordering::SeqCst))
    }
}

/// Reads a status page containing "`N` slots available now"
pub struct HttpCapacityProbe {
    client: reqwest::Client,
    url: String,
    pattern: Regex,
}

impl HttpCapacityProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let pattern = Regex::new(r"(\d+)\s+slots?\s+available\s+now")
            .map_err(|e| SyncError::Config(format!("invalid capacity pattern: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            pattern,
        })
    }

    fn parse(&self, body: &str) -> Result<u32> {
        let captures = self.pattern.captures(body).ok_or_else(|| {
            SyncError::DataValidation(format!("no slot count in status page {}", self.url))
        })?;
        captures[1]
            .parse()
            .map_err(|e| SyncError::DataValidation(format!("bad slot count '{}': {e}", &captures[1])))
    }
}

#[async_trait]
impl CapacityProbe for HttpCapacityProbe {
    async fn available_capacity(&self) -> Result<u32> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "capacity status page"));
        }
        let body = response.text().await?;
        self.parse(&body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_probe_parses_slots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "Connected as: 10.0.0.1\nRate limit: 2\n3 slots available now.\n",
            ))
            .mount(&server)
            .await;

        let probe = HttpCapacityProbe::new(format!("{}/status", server.uri()), Duration::from_secs(5)).unwrap();
        assert_eq!(probe.available_capacity().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_http_probe_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HttpCapacityProbe::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = probe.available_capacity().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientIo);
    }

    #[test]
    fn test_parse_rejects_page_without_count() {
        let probe = HttpCapacityProbe::new("http://localhost/status", Duration::from_secs(1)).unwrap();
        assert_eq!(probe.parse("1 slot available now").unwrap(), 1);
        assert!(probe.parse("Slot available after: 2024-01-01").is_err());
    }
}

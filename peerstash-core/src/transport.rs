//! Peer-to-peer calls made by the op log and the repair loop.

use crate::config::{OpLogConfig, RepairConfig};
use crate::oplog::Op;
use crate::storage::BlobAttributes;
use crate::{Result, StashError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub const PUSH_PATH: [&str; 3] = ["internal", "crud", "push"];
pub const SWEEP_PATH: [&str; 3] = ["internal", "crud", "sweep"];
pub const BLOBS_PATH: [&str; 2] = ["internal", "blobs"];

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver one serialized op to a peer's push endpoint.
    async fn push_op(&self, host: &str, body: Bytes) -> Result<()>;

    /// Fetch ops with `id > after` from a peer, ascending.
    async fn sweep_ops(&self, host: &str, after: &str) -> Result<Vec<Op>>;

    async fn fetch_blob(&self, host: &str, key: &str) -> Result<Bytes>;

    /// `None` when the peer does not hold `key`.
    async fn blob_info(&self, host: &str, key: &str) -> Result<Option<BlobAttributes>>;
}

/// reqwest-backed transport. Every call carries its own timeout.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    push_timeout: Duration,
    sweep_timeout: Duration,
    blob_timeout: Duration,
}

impl HttpTransport {
    pub fn new(push_timeout: Duration, sweep_timeout: Duration, blob_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(push_timeout)
            .build()
            .map_err(|error| StashError::Config(format!("failed to build http client: {}", error)))?;

        Ok(Self {
            client,
            push_timeout,
            sweep_timeout,
            blob_timeout,
        })
    }

    pub fn from_config(oplog: &OpLogConfig, repair: &RepairConfig) -> Result<Self> {
        Self::new(oplog.push_timeout(), oplog.sweep_timeout(), repair.blob_timeout())
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Join `segments` onto `host`, percent-encoding each one.
    pub fn url(host: &str, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(host)
            .map_err(|error| StashError::Config(format!("invalid peer host {}: {}", host, error)))?;

        url.path_segments_mut()
            .map_err(|_| StashError::Config(format!("peer host cannot be a base url: {}", host)))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    fn blob_url(host: &str, key: &str) -> Result<reqwest::Url> {
        Self::url(host, &[BLOBS_PATH[0], BLOBS_PATH[1], key])
    }

    fn blob_info_url(host: &str, key: &str) -> Result<reqwest::Url> {
        Self::url(host, &[BLOBS_PATH[0], BLOBS_PATH[1], "info", key])
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn push_op(&self, host: &str, body: Bytes) -> Result<()> {
        let response = self
            .client
            .post(Self::url(host, &PUSH_PATH)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.push_timeout)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "push to {} failed: status={}",
                host,
                response.status()
            )));
        }

        Ok(())
    }

    async fn sweep_ops(&self, host: &str, after: &str) -> Result<Vec<Op>> {
        let response = self
            .client
            .get(Self::url(host, &SWEEP_PATH)?)
            .query(&[("after", after)])
            .timeout(self.sweep_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "sweep of {} failed: status={}",
                host,
                response.status()
            )));
        }

        Ok(response.json::<Vec<Op>>().await?)
    }

    async fn fetch_blob(&self, host: &str, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(Self::blob_url(host, key)?)
            .timeout(self.blob_timeout)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StashError::BlobNotFound(format!("{} on {}", key, host)));
        }

        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "blob fetch failed: status={} key={} host={}",
                response.status(),
                key,
                host
            )));
        }

        Ok(response.bytes().await?)
    }

    async fn blob_info(&self, host: &str, key: &str) -> Result<Option<BlobAttributes>> {
        let response = self
            .client
            .get(Self::blob_info_url(host, key)?)
            .timeout(self.push_timeout)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "blob info failed: status={} key={} host={}",
                response.status(),
                key,
                host
            )));
        }

        Ok(Some(response.json::<BlobAttributes>().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let url = HttpTransport::url("http://node1.test:1991/", &SWEEP_PATH).unwrap();
        assert_eq!(url.as_str(), "http://node1.test:1991/internal/crud/sweep");

        let url = HttpTransport::blob_url("https://node2.test", "cid/150x150.jpg").unwrap();
        assert_eq!(url.as_str(), "https://node2.test/internal/blobs/cid%2F150x150.jpg");

        let url = HttpTransport::blob_info_url("https://node2.test", "cid/150x150.jpg").unwrap();
        assert_eq!(url.as_str(), "https://node2.test/internal/blobs/info/cid%2F150x150.jpg");
    }

    #[test]
    fn test_invalid_host() {
        assert!(matches!(
            HttpTransport::url("not a url", &PUSH_PATH),
            Err(StashError::Config(_))
        ));
    }
}

//! Peer liveness.
//!
//! Repair only counts replicas on hosts seen alive recently. The oracle is a
//! trait so the polling strategy can live elsewhere; [`HealthPoller`] is the
//! default, which hits every known host's `/health` endpoint on an interval.

use crate::config::HealthConfig;
use crate::peers::PeerSet;
use crate::transport::HttpTransport;
use crate::{Result, StashError};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub trait PeerHealthOracle: Send + Sync {
    fn last_seen(&self, host: &str) -> Option<DateTime<Utc>>;

    fn is_healthy(&self, host: &str, window: Duration) -> bool {
        let Some(seen) = self.last_seen(host) else {
            return false;
        };
        let Ok(window) = chrono::Duration::from_std(window) else {
            return true;
        };
        Utc::now() - seen <= window
    }

    fn healthy_hosts(&self, hosts: &[String], window: Duration) -> Vec<String> {
        hosts
            .iter()
            .filter(|host| self.is_healthy(host, window))
            .cloned()
            .collect()
    }
}

/// In-memory host -> last-seen-alive map.
#[derive(Default)]
pub struct HealthMap {
    seen: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl HealthMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_alive(&self, host: &str) {
        self.mark_alive_at(host, Utc::now());
    }

    pub fn mark_alive_at(&self, host: &str, at: DateTime<Utc>) {
        if let Ok(mut seen) = self.seen.write() {
            seen.insert(host.to_string(), at);
        }
    }

    pub fn forget(&self, host: &str) {
        if let Ok(mut seen) = self.seen.write() {
            seen.remove(host);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.seen.read().map(|seen| seen.clone()).unwrap_or_default()
    }
}

impl PeerHealthOracle for HealthMap {
    fn last_seen(&self, host: &str) -> Option<DateTime<Utc>> {
        self.seen.read().ok().and_then(|seen| seen.get(host).copied())
    }
}

pub struct HealthPoller {
    map: Arc<HealthMap>,
    peers: Arc<PeerSet>,
    client: reqwest::Client,
    config: HealthConfig,
}

impl HealthPoller {
    pub fn new(map: Arc<HealthMap>, peers: Arc<PeerSet>, config: HealthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|error| StashError::Config(format!("failed to build health client: {}", error)))?;

        Ok(Self {
            map,
            peers,
            client,
            config,
        })
    }

    /// Poll every known host once. Returns how many answered.
    pub async fn poll_once(&self) -> usize {
        let hosts = self.peers.hosts();
        let checks = hosts.iter().map(|host| self.check(host));
        let results = join_all(checks).await;

        let mut alive = 0;
        for (host, healthy) in hosts.iter().zip(results) {
            if healthy {
                self.map.mark_alive(host);
                alive += 1;
            }
        }
        alive
    }

    async fn check(&self, host: &str) -> bool {
        let Ok(url) = HttpTransport::url(host, &["health"]) else {
            return false;
        };

        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!("Health check of {} failed: {}", host, error);
                false
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());

        loop {
            interval.tick().await;
            let alive = self.poll_once().await;
            tracing::debug!("Health poll: {}/{} hosts alive", alive, self.peers.len());
        }
    }
}

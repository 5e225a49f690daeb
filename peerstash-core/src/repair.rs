//! Anti-entropy repair.
//!
//! On its turn, a node reads the replicated location table, finds keys whose
//! healthy replica count is off target, and fixes only its own part: it
//! pulls keys it should own but lacks, and drops keys it holds but is
//! provably not needed for.

use crate::config::RepairConfig;
use crate::health::PeerHealthOracle;
use crate::oplog::{OpLog, OpOptions};
use crate::peers::PeerSet;
use crate::placement;
use crate::records::{LocationIndex, LocationRecord, ProblemReport, Replication};
use crate::storage::{BlobStore, is_content_hash, verify_hash};
use crate::transport::PeerTransport;
use crate::{Result, StashError};
use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub tick: u64,
    pub ran: bool,
    pub cleanup: bool,
    pub under_replicated: usize,
    pub over_replicated: usize,
    pub pulled: usize,
    /// Blobs found on disk without a location claim, now claimed.
    pub reclaimed: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// With `host_count` hosts taking turns, whether `self_index` acts on `tick`.
pub fn is_my_turn(tick: u64, host_count: usize, self_index: usize) -> bool {
    if host_count == 0 {
        return false;
    }
    tick % host_count as u64 == self_index as u64
}

pub struct RepairScheduler {
    oplog: Arc<OpLog>,
    blobs: Arc<dyn BlobStore>,
    transport: Arc<dyn PeerTransport>,
    health: Arc<dyn PeerHealthOracle>,
    peers: Arc<PeerSet>,
    config: RepairConfig,
    liveness_window: Duration,
    tick: AtomicU64,
}

impl RepairScheduler {
    pub fn new(
        oplog: Arc<OpLog>,
        blobs: Arc<dyn BlobStore>,
        transport: Arc<dyn PeerTransport>,
        health: Arc<dyn PeerHealthOracle>,
        peers: Arc<PeerSet>,
        config: RepairConfig,
        liveness_window: Duration,
    ) -> Self {
        Self {
            oplog,
            blobs,
            transport,
            health,
            peers,
            config,
            liveness_window,
            tick: AtomicU64::new(0),
        }
    }

    fn self_host(&self) -> &str {
        self.oplog.host()
    }

    /// Advance the tick counter and repair if it is this node's turn.
    pub async fn tick(&self) -> Result<RepairReport> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let host_count = self.peers.len();
        let Some(self_index) = self.peers.self_index() else {
            return Ok(RepairReport {
                tick,
                ..Default::default()
            });
        };

        if !is_my_turn(tick, host_count, self_index) {
            return Ok(RepairReport {
                tick,
                ..Default::default()
            });
        }

        let cleanup = {
            let probability = self.config.cleanup_probability;
            !probability.is_nan() && rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
        };

        let mut report = self.run_repair(cleanup).await?;
        report.tick = tick;
        Ok(report)
    }

    /// One repair pass regardless of turn. `cleanup` adds the
    /// over-replication pass.
    pub async fn run_repair(&self, cleanup: bool) -> Result<RepairReport> {
        let hosts = self.peers.hosts();
        let healthy = self.healthy_hosts(&hosts);
        let mut report = RepairReport {
            ran: true,
            cleanup,
            ..Default::default()
        };

        let under = LocationIndex::new(self.oplog.store()).problem_keys(
            &healthy,
            self.config.replication_factor,
            Replication::Under,
            self.config.batch_size,
        )?;
        report.under_replicated = under.len();

        for problem in &under {
            self.repair_under_replicated(problem, &hosts, &mut report).await;
        }

        if cleanup {
            let over = LocationIndex::new(self.oplog.store()).problem_keys(
                &healthy,
                self.config.replication_factor,
                Replication::Over,
                self.config.batch_size,
            )?;
            report.over_replicated = over.len();

            for problem in &over {
                self.cleanup_over_replicated(problem, &hosts, &mut report).await;
            }
        }

        Ok(report)
    }

    fn healthy_hosts(&self, hosts: &[String]) -> Vec<String> {
        let mut healthy = self.health.healthy_hosts(hosts, self.liveness_window);
        if !healthy.iter().any(|host| host == self.self_host()) {
            healthy.push(self.self_host().to_string());
        }
        healthy
    }

    async fn repair_under_replicated(&self, problem: &ProblemReport, hosts: &[String], report: &mut RepairReport) {
        let self_host = self.self_host();
        if problem.is_held_by(self_host)
            || !placement::is_owner(&problem.key, hosts, self_host, self.config.replication_factor)
        {
            return;
        }

        match self.blobs.exists(&problem.key).await {
            Ok(true) => {
                match self
                    .oplog
                    .create(&LocationRecord::new(&problem.key, self_host), OpOptions::default())
                {
                    Ok(_) => report.reclaimed += 1,
                    Err(error) => {
                        tracing::warn!("Failed to record local copy of {}: {}", problem.key, error);
                        report.failed += 1;
                    }
                }
                return;
            }
            Ok(false) => {}
            Err(error) => {
                tracing::warn!("Failed to check local copy of {}: {}", problem.key, error);
                report.failed += 1;
                return;
            }
        }

        match self.pull(problem).await {
            Ok(source) => {
                tracing::info!(
                    "Pulled {} from {} (had {} healthy replicas)",
                    problem.key,
                    source,
                    problem.replicas()
                );
                report.pulled += 1;
            }
            Err(error) => {
                tracing::warn!("Could not pull {}: {}", problem.key, error);
                report.failed += 1;
            }
        }
    }

    /// Try each holder in turn, stopping at the first success.
    async fn pull(&self, problem: &ProblemReport) -> Result<String> {
        let self_host = self.self_host();
        let mut last_error = None;

        for source in problem.hosts.iter().filter(|host| host.as_str() != self_host) {
            match self.fetch_checked(source, &problem.key).await {
                Ok(data) => {
                    self.blobs.put(&problem.key, data).await?;
                    self.oplog
                        .create(&LocationRecord::new(&problem.key, self_host), OpOptions::default())?;
                    return Ok(source.clone());
                }
                Err(error) => {
                    if matches!(error, StashError::HashMismatch { .. }) {
                        tracing::warn!("Discarding corrupt copy of {} from {}: {}", problem.key, source, error);
                    } else {
                        tracing::debug!("Pull of {} from {} failed: {}", problem.key, source, error);
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StashError::BlobNotFound(format!("{}: no peer holds it", problem.key))))
    }

    /// Ask `source` whether it still holds `key`, fetch the bytes and check
    /// them against the reported size and, for content-hash keys, the hash.
    async fn fetch_checked(&self, source: &str, key: &str) -> Result<Bytes> {
        let timeout = self.config.blob_timeout();

        let info = tokio::time::timeout(timeout, self.transport.blob_info(source, key))
            .await
            .map_err(|_| StashError::Timeout(format!("blob info of {} from {}", key, source)))??
            .ok_or_else(|| StashError::BlobNotFound(format!("{} on {}", key, source)))?;

        let data = tokio::time::timeout(timeout, self.transport.fetch_blob(source, key))
            .await
            .map_err(|_| StashError::Timeout(format!("pull of {} from {}", key, source)))??;

        if data.len() as u64 != info.size {
            return Err(StashError::Http(format!(
                "{} from {} is {} bytes, expected {}",
                key,
                source,
                data.len(),
                info.size
            )));
        }

        if is_content_hash(key) {
            verify_hash(&data, key)?;
        }

        Ok(data)
    }

    async fn cleanup_over_replicated(&self, problem: &ProblemReport, hosts: &[String], report: &mut RepairReport) {
        let self_host = self.self_host();
        if !problem.is_held_by(self_host) {
            return;
        }

        let ranked = placement::rank(&problem.key, hosts);
        let Some(position) = ranked.iter().position(|host| host == self_host) else {
            return;
        };
        if position < self.config.replication_factor {
            return;
        }

        // Holders ranked at or above us, us included
        let depth = ranked[..=position]
            .iter()
            .filter(|host| problem.is_held_by(host))
            .count();
        if depth <= self.config.replication_factor {
            return;
        }

        let claim = LocationRecord::new(&problem.key, self_host);
        if let Err(error) = self.oplog.delete(&claim, OpOptions::default()) {
            tracing::warn!("Failed to record drop of {}: {}", problem.key, error);
            report.failed += 1;
            return;
        }

        match self.blobs.delete(&problem.key).await {
            Ok(()) => {
                tracing::info!(
                    "Dropped {} (rank {}, {} holders at or above us)",
                    problem.key,
                    position,
                    depth
                );
                report.dropped += 1;
            }
            Err(error) => {
                tracing::warn!("Dropped claim on {} but could not delete bytes: {}", problem.key, error);
                report.failed += 1;
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval());

        loop {
            interval.tick().await;

            match self.tick().await {
                Ok(report) if report.ran => tracing::info!(
                    "Repair tick {}: under={} over={} pulled={} reclaimed={} dropped={} failed={}",
                    report.tick,
                    report.under_replicated,
                    report.over_replicated,
                    report.pulled,
                    report.reclaimed,
                    report.dropped,
                    report.failed
                ),
                Ok(_) => {}
                Err(error) => tracing::warn!("Repair pass failed: {}", error),
            }
        }
    }
}

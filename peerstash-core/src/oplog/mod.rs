//! Replicated operation log.
//!
//! Every node keeps a local log of mutations. Locally authored ops are pushed
//! to each peer through a bounded outbox, and every peer is swept on a timer
//! from a saved cursor. Pushes may be dropped; sweeps are what guarantee
//! convergence. Applying an op is idempotent per op id.

pub mod op;
pub mod outbox;
pub mod registry;
pub mod store;

pub use op::{Op, OpAction, OpOptions};
pub use outbox::{Outbox, PeerStats, PeerStatsSnapshot};
pub use registry::{DecodedBatch, Record, RecordCodec, TypeRegistry, TypeRegistryBuilder, encode_records};
pub use store::{Cursor, OpStore};

use crate::config::{OpLogConfig, SweepScope};
use crate::transport::PeerTransport;
use crate::{Result, StashError};
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub type Subscriber = Arc<dyn Fn(&Op, &DecodedBatch) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The op id was already in the log. Not an error.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub fetched: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub cursor: Option<String>,
    pub seeded: bool,
}

struct PeerHandle {
    outbox: Outbox,
    inbox: Option<mpsc::Receiver<Bytes>>,
    stats: Arc<PeerStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerHandle {
    fn new(capacity: usize) -> Self {
        let stats = Arc::new(PeerStats::default());
        let (outbox, inbox) = Outbox::channel(capacity, stats.clone());
        Self {
            outbox,
            inbox: Some(inbox),
            stats,
            tasks: Vec::new(),
        }
    }

    /// Stop workers and abandon whatever is still queued.
    fn reset(&mut self, capacity: usize) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let (outbox, inbox) = Outbox::channel(capacity, self.stats.clone());
        self.outbox = outbox;
        self.inbox = Some(inbox);
    }
}

pub struct OpLog {
    host: String,
    config: OpLogConfig,
    store: Arc<OpStore>,
    registry: Arc<TypeRegistry>,
    transport: Arc<dyn PeerTransport>,
    ids: Mutex<ulid::Generator>,
    subscribers: RwLock<Vec<Subscriber>>,
    peers: Mutex<HashMap<String, PeerHandle>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl OpLog {
    pub fn new(
        host: impl Into<String>,
        config: OpLogConfig,
        store: Arc<OpStore>,
        registry: TypeRegistry,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        store.create_tables(&registry)?;

        Ok(Self {
            host: host.into(),
            config,
            store,
            registry: Arc::new(registry),
            transport,
            ids: Mutex::new(ulid::Generator::new()),
            subscribers: RwLock::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &OpLogConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<OpStore> {
        &self.store
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&Op, &DecodedBatch) + Send + Sync + 'static,
    {
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.push(Arc::new(subscriber)),
            Err(_) => tracing::error!("subscriber list lock poisoned; subscriber not added"),
        }
    }

    pub fn create<R: Record>(&self, record: &R, options: OpOptions) -> Result<Op> {
        self.mutate(OpAction::Create, std::slice::from_ref(record), options)
    }

    pub fn update<R: Record>(&self, record: &R, options: OpOptions) -> Result<Op> {
        self.mutate(OpAction::Update, std::slice::from_ref(record), options)
    }

    pub fn delete<R: Record>(&self, record: &R, options: OpOptions) -> Result<Op> {
        self.mutate(OpAction::Delete, std::slice::from_ref(record), options)
    }

    /// Author an op for `records`, apply it locally and queue it for push.
    pub fn mutate<R: Record>(&self, action: OpAction, records: &[R], options: OpOptions) -> Result<Op> {
        let payload = encode_records(records)?;

        // Ids are drawn and committed under one lock, so locally authored
        // ops land in the log in id order and no sweep cursor can pass one
        // that is still uncommitted.
        let (op, batch) = {
            let mut ids = self
                .ids
                .lock()
                .map_err(|_| StashError::Internal("id generator lock poisoned".to_string()))?;
            let id = ids
                .generate()
                .map_err(|error| StashError::Internal(format!("op id generation failed: {}", error)))?;

            let op = Op {
                id: id.to_string(),
                host: self.host.clone(),
                action,
                record_type: R::RECORD_TYPE.to_string(),
                payload,
                transient: options.transient,
            };
            let batch = self.commit(&op)?;
            (op, batch)
        };

        if let Some(batch) = batch {
            self.publish(&op, &batch);
        }
        Ok(op)
    }

    /// Merge one op, local or remote, into the log and the record tables.
    ///
    /// Unknown record types, non-canonical ids and undecodable payloads are
    /// rejected before any local state is touched. Replaying an op id
    /// returns `Duplicate`.
    pub fn apply_op(&self, op: &Op) -> Result<ApplyOutcome> {
        let Some(batch) = self.commit(op)? else {
            tracing::debug!("Skipping duplicate op {} from {}", op.id, op.host);
            return Ok(ApplyOutcome::Duplicate);
        };

        self.publish(op, &batch);
        Ok(ApplyOutcome::Applied)
    }

    /// Validate and store `op`. `None` means the id was already logged.
    fn commit(&self, op: &Op) -> Result<Option<DecodedBatch>> {
        op.ulid()?;
        let codec = self.registry.get(&op.record_type)?;
        let batch = codec.decode(&op.payload)?;

        if !self.store.apply(op, codec.as_ref(), &batch)? {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    fn publish(&self, op: &Op, batch: &DecodedBatch) {
        if op.host == self.host {
            self.broadcast(op);
        }
        self.notify(op, batch);
    }

    fn broadcast(&self, op: &Op) {
        let body = match op.to_bytes() {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!("Failed to encode op {} for push: {}", op.id, error);
                return;
            }
        };

        let Ok(peers) = self.lock_peers() else {
            return;
        };

        for (host, handle) in peers.iter() {
            if !handle.outbox.offer(body.clone()) {
                tracing::debug!("Outbox for {} is full; dropped push of op {}", host, op.id);
            }
        }
    }

    fn notify(&self, op: &Op, batch: &DecodedBatch) {
        let subscribers = match self.subscribers.read() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };

        for subscriber in subscribers {
            subscriber(op, batch);
        }
    }

    /// Ops served from this node's sweep endpoint.
    pub fn ops_after(&self, after: &str, limit: usize) -> Result<Vec<Op>> {
        let limit = limit.clamp(1, self.config.pull_limit.max(1));
        let author = match self.config.sweep_scope {
            SweepScope::Own => Some(self.host.as_str()),
            SweepScope::All => None,
        };
        self.store.ops_after(after, limit, author)
    }

    /// Pull and apply everything `host` has after our cursor for it.
    ///
    /// Rejected ops are skipped and the cursor moves past them. A local
    /// storage failure stops the batch; the cursor keeps the last op that
    /// made it in and the error is returned.
    pub async fn sweep_peer(&self, host: &str) -> Result<SweepOutcome> {
        let after = self
            .store
            .get_cursor(host)?
            .map(|cursor| cursor.last_id)
            .unwrap_or_default();

        let ops = tokio::time::timeout(
            self.config.sweep_timeout(),
            self.transport.sweep_ops(host, &after),
        )
        .await
        .map_err(|_| StashError::Timeout(format!("sweep of {}", host)))??;

        let mut outcome = SweepOutcome {
            fetched: ops.len(),
            ..Default::default()
        };
        let mut last: Option<String> = None;
        let mut failure = None;

        for op in &ops {
            match self.apply_op(op) {
                Ok(ApplyOutcome::Applied) => outcome.applied += 1,
                Ok(ApplyOutcome::Duplicate) => outcome.duplicates += 1,
                Err(error) if error.is_rejection() => {
                    tracing::warn!(
                        "Rejected op {} ({}) swept from {}: {}",
                        op.id,
                        op.record_type,
                        host,
                        error
                    );
                    outcome.rejected += 1;
                }
                Err(error) => {
                    tracing::warn!("Failed to apply op {} swept from {}: {}", op.id, host, error);
                    failure = Some(error);
                    break;
                }
            }

            // Only canonical ids may become the cursor.
            if op.ulid().is_ok() && last.as_deref().is_none_or(|prev| op.id.as_str() > prev) {
                last = Some(op.id.clone());
            }
        }

        if let Some(last) = &last {
            if last.as_str() > after.as_str() {
                self.store.upsert_cursor(host, last)?;
            }
        }

        outcome.cursor = last.or(if after.is_empty() { None } else { Some(after) });
        outcome.seeded = self.is_caught_up(&ops, outcome.cursor.as_deref());

        let stats = self.peer_stats_handle(host);
        if let Some(stats) = &stats {
            stats.record_swept(outcome.applied);
            if outcome.seeded {
                stats.mark_seeded();
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }

        if outcome.fetched > 0 {
            tracing::debug!(
                "Swept {}: fetched={} applied={} duplicates={} rejected={}",
                host,
                outcome.fetched,
                outcome.applied,
                outcome.duplicates,
                outcome.rejected
            );
        }

        Ok(outcome)
    }

    fn is_caught_up(&self, ops: &[Op], cursor: Option<&str>) -> bool {
        if ops.len() < self.config.seeded_batch_threshold {
            return true;
        }

        let Some(timestamp_ms) = cursor
            .and_then(|id| ulid::Ulid::from_string(id).ok())
            .map(|id| id.timestamp_ms())
        else {
            return false;
        };

        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        now_ms.saturating_sub(timestamp_ms) < self.config.seeded_window().as_millis() as u64
    }

    fn lock_peers(&self) -> Result<MutexGuard<'_, HashMap<String, PeerHandle>>> {
        self.peers
            .lock()
            .map_err(|_| StashError::Internal("peer table lock poisoned".to_string()))
    }

    fn peer_stats_handle(&self, host: &str) -> Option<Arc<PeerStats>> {
        self.lock_peers()
            .ok()
            .and_then(|peers| peers.get(host).map(|handle| handle.stats.clone()))
    }

    pub fn peer_stats(&self) -> Vec<PeerStatsSnapshot> {
        let Ok(peers) = self.lock_peers() else {
            return Vec::new();
        };

        let mut stats: Vec<PeerStatsSnapshot> = peers
            .iter()
            .map(|(host, handle)| handle.stats.snapshot(host))
            .collect();
        stats.sort_by(|a, b| a.host.cmp(&b.host));
        stats
    }

    pub fn is_seeded(&self, host: &str) -> bool {
        self.peer_stats_handle(host)
            .map(|stats| stats.is_seeded())
            .unwrap_or(false)
    }

    /// Replace the set of peers. New peers get an outbox (and workers when
    /// running); peers no longer listed are stopped and forgotten.
    pub fn set_peers(self: &Arc<Self>, hosts: &[String]) -> Result<()> {
        let shutdown = self
            .shutdown
            .lock()
            .map_err(|_| StashError::Internal("shutdown lock poisoned".to_string()))?;
        let mut peers = self.lock_peers()?;

        peers.retain(|host, handle| {
            let keep = hosts.contains(host);
            if !keep {
                for task in handle.tasks.drain(..) {
                    task.abort();
                }
                tracing::info!("Removed peer {}", host);
            }
            keep
        });

        for host in hosts {
            if host == &self.host || peers.contains_key(host) {
                continue;
            }

            let mut handle = PeerHandle::new(self.config.outbox_capacity);
            if let Some(sender) = shutdown.as_ref() {
                self.spawn_workers(host, &mut handle, sender.subscribe());
            }
            peers.insert(host.clone(), handle);
            tracing::info!("Added peer {}", host);
        }

        Ok(())
    }

    pub fn peers(&self) -> Vec<String> {
        let Ok(peers) = self.lock_peers() else {
            return Vec::new();
        };
        let mut hosts: Vec<String> = peers.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn is_running(&self) -> bool {
        self.shutdown
            .lock()
            .map(|shutdown| shutdown.is_some())
            .unwrap_or(false)
    }

    /// Spawn a push worker and a sweep worker per peer. No-op when running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut shutdown = self
            .shutdown
            .lock()
            .map_err(|_| StashError::Internal("shutdown lock poisoned".to_string()))?;
        if shutdown.is_some() {
            return Ok(());
        }

        let (sender, _) = watch::channel(false);
        let mut peers = self.lock_peers()?;
        for (host, handle) in peers.iter_mut() {
            self.spawn_workers(host, handle, sender.subscribe());
        }
        *shutdown = Some(sender);

        tracing::info!("Op log started for {} with {} peers", self.host, peers.len());
        Ok(())
    }

    /// Stop every peer worker. Queued pushes are abandoned. Safe to call when
    /// never started.
    pub fn stop(&self) {
        let sender = match self.shutdown.lock() {
            Ok(mut shutdown) => shutdown.take(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return;
        };
        let _ = sender.send(true);

        if let Ok(mut peers) = self.lock_peers() {
            for handle in peers.values_mut() {
                handle.reset(self.config.outbox_capacity);
            }
        }

        tracing::info!("Op log stopped for {}", self.host);
    }

    fn spawn_workers(self: &Arc<Self>, host: &str, handle: &mut PeerHandle, shutdown: watch::Receiver<bool>) {
        let Some(inbox) = handle.inbox.take() else {
            return;
        };

        handle.tasks.push(tokio::spawn(run_push_worker(
            self.transport.clone(),
            host.to_string(),
            inbox,
            handle.stats.clone(),
            self.config.push_timeout(),
            shutdown.clone(),
        )));

        handle.tasks.push(tokio::spawn(run_sweep_worker(
            Arc::downgrade(self),
            host.to_string(),
            self.config.sweep_interval(),
            shutdown,
        )));
    }
}

impl Drop for OpLog {
    fn drop(&mut self) {
        self.stop();
        if let Ok(mut peers) = self.peers.lock() {
            for handle in peers.values_mut() {
                for task in handle.tasks.drain(..) {
                    task.abort();
                }
            }
        }
    }
}

async fn run_push_worker(
    transport: Arc<dyn PeerTransport>,
    host: String,
    mut inbox: mpsc::Receiver<Bytes>,
    stats: Arc<PeerStats>,
    push_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let body = tokio::select! {
            _ = shutdown.changed() => break,
            body = inbox.recv() => match body {
                Some(body) => body,
                None => break,
            },
        };

        match tokio::time::timeout(push_timeout, transport.push_op(&host, body)).await {
            Ok(Ok(())) => stats.record_pushed(),
            Ok(Err(error)) => {
                stats.record_push_failure();
                tracing::debug!("Push to {} failed: {}", host, error);
            }
            Err(_) => {
                stats.record_push_failure();
                tracing::debug!("Push to {} timed out", host);
            }
        }
    }
}

async fn run_sweep_worker(
    log: Weak<OpLog>,
    host: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // Spread sweeps out after a fleet-wide restart.
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=interval.as_millis() as u64));
    tokio::select! {
        _ = shutdown.changed() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    loop {
        let Some(oplog) = log.upgrade() else {
            break;
        };

        let mut delay = interval;
        match oplog.sweep_peer(&host).await {
            Ok(outcome) if outcome.fetched >= oplog.config.pull_limit => delay = Duration::ZERO,
            Ok(_) => {}
            Err(error) => tracing::warn!("Sweep of {} failed: {}", host, error),
        }
        drop(oplog);

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

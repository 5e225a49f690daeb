#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use peerstash_core::{
    BlobAttributes, BlobStore, HealthMap, JobRecord, LocationRecord, MemoryBlobStore, Op, OpLog, OpLogConfig,
    OpStore, PeerSet, PeerTransport, RepairConfig, RepairScheduler, Result, StashError, TypeRegistry,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Routes peer calls straight into other in-process nodes.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, (Weak<OpLog>, Arc<MemoryBlobStore>)>>,
    down: RwLock<HashSet<String>>,
}

impl MemoryNetwork {
    pub fn register(&self, host: &str, oplog: &Arc<OpLog>, blobs: Arc<MemoryBlobStore>) {
        self.nodes
            .write()
            .unwrap()
            .insert(host.to_string(), (Arc::downgrade(oplog), blobs));
    }

    pub fn set_down(&self, host: &str, down: bool) {
        let mut hosts = self.down.write().unwrap();
        if down {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    fn node(&self, host: &str) -> Result<(Arc<OpLog>, Arc<MemoryBlobStore>)> {
        if self.down.read().unwrap().contains(host) {
            return Err(StashError::Http(format!("{} is down", host)));
        }

        let nodes = self.nodes.read().unwrap();
        let (oplog, blobs) = nodes
            .get(host)
            .ok_or_else(|| StashError::Http(format!("{} is unknown", host)))?;
        let oplog = oplog
            .upgrade()
            .ok_or_else(|| StashError::Http(format!("{} has shut down", host)))?;
        Ok((oplog, blobs.clone()))
    }
}

#[async_trait]
impl PeerTransport for MemoryNetwork {
    async fn push_op(&self, host: &str, body: Bytes) -> Result<()> {
        let (oplog, _) = self.node(host)?;
        let op: Op = serde_json::from_slice(&body)?;
        oplog.apply_op(&op)?;
        Ok(())
    }

    async fn sweep_ops(&self, host: &str, after: &str) -> Result<Vec<Op>> {
        let (oplog, _) = self.node(host)?;
        let limit = oplog.config().pull_limit;
        oplog.ops_after(after, limit)
    }

    async fn fetch_blob(&self, host: &str, key: &str) -> Result<Bytes> {
        let (_, blobs) = self.node(host)?;
        blobs.get(key).await
    }

    async fn blob_info(&self, host: &str, key: &str) -> Result<Option<BlobAttributes>> {
        let (_, blobs) = self.node(host)?;
        blobs.attributes(key).await
    }
}

pub struct Node {
    pub host: String,
    pub oplog: Arc<OpLog>,
    pub blobs: Arc<MemoryBlobStore>,
    pub health: Arc<HealthMap>,
    pub peers: Arc<PeerSet>,
    pub repair: RepairScheduler,
}

pub struct Fleet {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<Node>,
}

pub fn host(index: usize) -> String {
    format!("http://node{}.test:1991", index)
}

pub fn full_registry() -> TypeRegistry {
    TypeRegistry::builder()
        .register::<LocationRecord>()
        .register::<JobRecord>()
        .build()
}

impl Fleet {
    /// `size` nodes named `node1..=nodeN`, all healthy, workers not started.
    pub fn new(size: usize, oplog: OpLogConfig, repair: RepairConfig) -> Self {
        Self::with_registries(size, oplog, repair, |_| full_registry())
    }

    pub fn with_registries(
        size: usize,
        oplog_config: OpLogConfig,
        repair_config: RepairConfig,
        registry: impl Fn(&str) -> TypeRegistry,
    ) -> Self {
        let network = Arc::new(MemoryNetwork::default());
        let hosts: Vec<String> = (1..=size).map(host).collect();

        let nodes = hosts
            .iter()
            .map(|host| {
                let store = Arc::new(OpStore::open_in_memory().unwrap());
                let oplog = Arc::new(
                    OpLog::new(host.clone(), oplog_config.clone(), store, registry(host), network.clone()).unwrap(),
                );
                let blobs = Arc::new(MemoryBlobStore::new());
                network.register(host, &oplog, blobs.clone());

                let peers = Arc::new(PeerSet::new(host.clone(), hosts.clone(), vec![]));
                let health = Arc::new(HealthMap::new());
                for other in &hosts {
                    health.mark_alive(other);
                }

                let repair = RepairScheduler::new(
                    oplog.clone(),
                    blobs.clone(),
                    network.clone(),
                    health.clone(),
                    peers.clone(),
                    repair_config.clone(),
                    Duration::from_secs(120),
                );

                Node {
                    host: host.clone(),
                    oplog,
                    blobs,
                    health,
                    peers,
                    repair,
                }
            })
            .collect();

        Self { network, nodes }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.host.clone()).collect()
    }

    pub fn node(&self, host: &str) -> &Node {
        self.nodes.iter().find(|node| node.host == host).unwrap()
    }

    /// Every node sweeps every other node once. Unreachable peers are skipped.
    pub async fn sweep_all(&self) {
        for node in &self.nodes {
            for peer in node.peers.peers() {
                let _ = node.oplog.sweep_peer(&peer).await;
            }
        }
    }
}

//! Peerstash core: a replicated op log, rendezvous placement and an
//! anti-entropy repair loop for a fleet of content-addressed blob nodes.

pub mod config;
pub mod error;
pub mod health;
pub mod oplog;
pub mod peers;
pub mod placement;
pub mod records;
pub mod repair;
pub mod storage;
pub mod transport;

pub use config::{HealthConfig, OpLogConfig, RepairConfig, SweepScope};
pub use error::{Result, StashError};
pub use health::{HealthMap, HealthPoller, PeerHealthOracle};
pub use oplog::{
    ApplyOutcome, DecodedBatch, Op, OpAction, OpLog, OpOptions, OpStore, PeerStatsSnapshot, Record,
    SweepOutcome, TypeRegistry,
};
pub use peers::PeerSet;
pub use records::{JobRecord, JobStatus, LocationIndex, LocationRecord, ProblemReport, Replication};
pub use repair::{RepairReport, RepairScheduler};
pub use storage::{BlobAttributes, BlobStore, FsBlobStore, MemoryBlobStore, compute_hash};
pub use transport::{HttpTransport, PeerTransport};

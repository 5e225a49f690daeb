use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Counters kept per remote peer.
#[derive(Debug, Default)]
pub struct PeerStats {
    pushed: AtomicU64,
    dropped: AtomicU64,
    push_failures: AtomicU64,
    swept: AtomicU64,
    seeded: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatsSnapshot {
    pub host: String,
    pub pushed: u64,
    pub dropped: u64,
    pub push_failures: u64,
    pub swept: u64,
    pub seeded: bool,
}

impl PeerStats {
    pub fn record_pushed(&self) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_failure(&self) {
        self.push_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swept(&self, count: usize) {
        self.swept.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn mark_seeded(&self) {
        self.seeded.store(true, Ordering::Relaxed);
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, host: &str) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            host: host.to_string(),
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            seeded: self.seeded.load(Ordering::Relaxed),
        }
    }
}

/// Bounded push queue for one peer. Offering never waits: a full queue drops
/// the message and the peer's next sweep picks the op up instead.
pub struct Outbox {
    sender: mpsc::Sender<Bytes>,
    stats: Arc<PeerStats>,
}

impl Outbox {
    pub fn channel(capacity: usize, stats: Arc<PeerStats>) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, stats }, receiver)
    }

    /// Returns whether the message was queued.
    pub fn offer(&self, message: Bytes) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

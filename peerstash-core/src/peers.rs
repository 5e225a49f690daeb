use crate::Result;
use crate::oplog::OpLog;
use crate::placement::sanitize_hosts;
use std::sync::{Arc, RwLock};

/// The live host list, always including this node.
///
/// Discovery lives outside this crate; whatever resolves the fleet calls
/// [`PeerSet::refresh`] and every reader sees the sanitized, sorted list.
pub struct PeerSet {
    self_host: String,
    excluded: Vec<String>,
    hosts: RwLock<Vec<String>>,
}

impl PeerSet {
    pub fn new<I, S>(self_host: impl Into<String>, hosts: I, excluded: Vec<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let self_host = self_host.into().trim().trim_end_matches('/').to_string();
        let set = Self {
            hosts: RwLock::new(Vec::new()),
            self_host,
            excluded,
        };
        set.replace(hosts);
        set
    }

    pub fn self_host(&self) -> &str {
        &self.self_host
    }

    /// Swap in a new host list. Returns whether it differs from the old one.
    pub fn replace<I, S>(&self, hosts: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next = sanitize_hosts(hosts, &self.excluded);
        if !next.contains(&self.self_host) {
            next.push(self.self_host.clone());
            next.sort();
        }

        match self.hosts.write() {
            Ok(mut hosts) => {
                let changed = *hosts != next;
                *hosts = next;
                changed
            }
            Err(_) => {
                tracing::error!("peer set lock poisoned; host list not updated");
                false
            }
        }
    }

    /// Swap in a new host list and point the op log's push and sweep
    /// workers at the same peers.
    pub fn refresh<I, S>(&self, oplog: &Arc<OpLog>, hosts: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let changed = self.replace(hosts);
        oplog.set_peers(&self.peers())?;
        Ok(changed)
    }

    /// Every known host, sorted, self included.
    pub fn hosts(&self) -> Vec<String> {
        self.hosts
            .read()
            .map(|hosts| hosts.clone())
            .unwrap_or_else(|_| vec![self.self_host.clone()])
    }

    /// Every known host except this one.
    pub fn peers(&self) -> Vec<String> {
        self.hosts()
            .into_iter()
            .filter(|host| *host != self.self_host)
            .collect()
    }

    pub fn self_index(&self) -> Option<usize> {
        self.hosts().iter().position(|host| *host == self.self_host)
    }

    pub fn len(&self) -> usize {
        self.hosts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_is_always_present() {
        let set = PeerSet::new(
            "http://node2.test/",
            ["http://node3.test", "http://node1.test", "garbage"],
            vec!["http://node9.test".to_string()],
        );

        assert_eq!(
            set.hosts(),
            vec!["http://node1.test", "http://node2.test", "http://node3.test"]
        );
        assert_eq!(set.peers(), vec!["http://node1.test", "http://node3.test"]);
        assert_eq!(set.self_index(), Some(1));

        assert!(set.replace(["http://node9.test", "http://node4.test"]));
        assert_eq!(set.hosts(), vec!["http://node2.test", "http://node4.test"]);
        assert!(!set.replace(["http://node4.test"]));
        assert_eq!(set.len(), 2);
    }
}

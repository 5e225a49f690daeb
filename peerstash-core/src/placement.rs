//! Rendezvous (highest-random-weight) placement.
//!
//! Every host gets a score `sha256(host || key)` and hosts are ordered by
//! ascending score, ties broken by host string. Any node holding the same
//! host list computes the same ranking, and removing a host never reorders
//! the remaining ones.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

fn score(host: &str, key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(key.as_bytes());

    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Hosts ordered by preference for `key`. Empty and repeated entries are
/// ignored.
pub fn rank<S: AsRef<str>>(key: &str, hosts: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(hosts.len());
    let mut scored: Vec<([u8; 32], &str)> = hosts
        .iter()
        .map(|host| host.as_ref())
        .filter(|host| !host.is_empty() && seen.insert(*host))
        .map(|host| (score(host, key), host))
        .collect();

    scored.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().map(|(_, host)| host.to_string()).collect()
}

/// The first `replication_factor` hosts of the ranking.
pub fn owners<S: AsRef<str>>(key: &str, hosts: &[S], replication_factor: usize) -> Vec<String> {
    let mut ranked = rank(key, hosts);
    ranked.truncate(replication_factor);
    ranked
}

pub fn is_owner<S: AsRef<str>>(key: &str, hosts: &[S], host: &str, replication_factor: usize) -> bool {
    rank(key, hosts)
        .iter()
        .position(|candidate| candidate == host)
        .is_some_and(|index| index < replication_factor)
}

/// Normalize a host list before it is used for placement: trim whitespace
/// and trailing slashes, drop anything that is not an absolute http(s) URL
/// with a host, drop `excluded` hosts and duplicates. The result is sorted.
pub fn sanitize_hosts<I, S>(hosts: I, excluded: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let excluded: HashSet<String> = excluded.iter().map(|host| normalize_host(host)).collect();

    let mut clean: Vec<String> = hosts
        .into_iter()
        .map(|host| normalize_host(host.as_ref()))
        .filter(|host| is_valid_host(host) && !excluded.contains(host))
        .collect();

    clean.sort();
    clean.dedup();
    clean
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('/').to_string()
}

fn is_valid_host(host: &str) -> bool {
    match reqwest::Url::parse(host) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https")
                && url.host_str().is_some_and(|name| !name.is_empty())
                && url.path() == "/"
                && url.query().is_none()
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet(count: usize) -> Vec<String> {
        (1..=count)
            .map(|i| format!("https://node{}.stash.example.net", i))
            .collect()
    }

    #[test]
    fn test_rank_matches_fixture() {
        let hosts = fleet(70);

        let ranked = rank("baeaaaiqsea7fukrfmq3m4fxkkivwsmoqqeisbwbkgmo6rnytr4yosnj4uii", &hosts);
        assert_eq!(
            &ranked[..6],
            &[
                "https://node30.stash.example.net",
                "https://node36.stash.example.net",
                "https://node39.stash.example.net",
                "https://node57.stash.example.net",
                "https://node60.stash.example.net",
                "https://node47.stash.example.net",
            ]
        );

        let ranked = rank("QmQnMnYYhdwPDVH6iDbSAe1TiBtTykNUYEszhGVD6CcTsw", &hosts);
        assert_eq!(
            &ranked[..6],
            &[
                "https://node34.stash.example.net",
                "https://node22.stash.example.net",
                "https://node25.stash.example.net",
                "https://node63.stash.example.net",
                "https://node57.stash.example.net",
                "https://node55.stash.example.net",
            ]
        );
    }

    #[test]
    fn test_rank_is_deterministic_and_order_independent() {
        let hosts = fleet(20);
        let mut reversed = hosts.clone();
        reversed.reverse();

        let first = rank("some-key", &hosts);
        assert_eq!(first, rank("some-key", &hosts));
        assert_eq!(first, rank("some-key", &reversed));
        assert_eq!(first.len(), 20);
    }

    #[test]
    fn test_removing_a_host_keeps_relative_order() {
        let hosts = fleet(12);
        let removed = hosts[4].clone();
        let remaining: Vec<String> = hosts.iter().filter(|h| **h != removed).cloned().collect();

        for i in 0..200 {
            let key = format!("key-{}", i);
            let expected: Vec<String> = rank(&key, &hosts)
                .into_iter()
                .filter(|h| *h != removed)
                .collect();
            assert_eq!(rank(&key, &remaining), expected);
        }
    }

    #[test]
    fn test_adding_a_host_moves_only_its_keys() {
        let hosts = fleet(10);
        let mut grown = hosts.clone();
        grown.push("https://node99.stash.example.net".to_string());

        for i in 0..200 {
            let key = format!("key-{}", i);
            let before = owners(&key, &hosts, 3);
            let after = owners(&key, &grown, 3);

            if after.iter().any(|h| h == "https://node99.stash.example.net") {
                let kept = after.iter().filter(|h| before.contains(h)).count();
                assert_eq!(kept, 2);
            } else {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_is_owner_and_edge_cases() {
        let hosts = fleet(9);
        let ranked = rank("k", &hosts);

        assert!(is_owner("k", &hosts, &ranked[0], 5));
        assert!(is_owner("k", &hosts, &ranked[4], 5));
        assert!(!is_owner("k", &hosts, &ranked[5], 5));
        assert!(!is_owner("k", &hosts, "https://stranger.example.net", 5));

        let empty: Vec<String> = Vec::new();
        assert!(rank("k", &empty).is_empty());
        assert!(!is_owner("k", &empty, &ranked[0], 5));

        let dupes = vec!["http://a.test", "http://a.test", "", "http://b.test"];
        assert_eq!(rank("k", &dupes).len(), 2);
    }

    #[test]
    fn test_sanitize_hosts() {
        let raw = vec![
            " https://node1.test/ ",
            "https://node1.test",
            "http://node2.test:1991",
            "node3.test",
            "ftp://node4.test",
            "https://node5.test/some/path",
            "https://retired.test",
            "",
        ];
        let clean = sanitize_hosts(raw, &["https://retired.test/".to_string()]);
        assert_eq!(clean, vec!["http://node2.test:1991", "https://node1.test"]);
    }
}

use peerstash_core::{HealthConfig, OpLogConfig, RepairConfig, Result, StashError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This node's advertised base URL, as peers know it.
    pub host: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Initial fleet. Self may be listed or not.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Hosts that are never ranked or replicated to.
    #[serde(default)]
    pub decommissioned: Vec<String>,
    #[serde(default)]
    pub oplog: OpLogConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:1991".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("PEERSTASH")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| StashError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| StashError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if !(host.starts_with("http://") || host.starts_with("https://")) {
            return Err(StashError::Config(format!(
                "host must be an http(s) URL, got '{}'",
                self.host
            )));
        }
        if self.repair.replication_factor == 0 {
            return Err(StashError::Config("repair.replication_factor must be at least 1".to_string()));
        }
        let probability = self.repair.cleanup_probability;
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(StashError::Config(format!(
                "repair.cleanup_probability must be within [0, 1], got {}",
                probability
            )));
        }
        if self.oplog.outbox_capacity == 0 {
            return Err(StashError::Config("oplog.outbox_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn oplog_path(&self) -> PathBuf {
        self.data_dir.join("oplog.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_yaml_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "host: http://node1.stash.example.net:1991\n\
             data_dir: /var/lib/peerstash\n\
             peers:\n  - http://node2.stash.example.net:1991\n\
             repair:\n  replication_factor: 3\n"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:1991");
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.repair.replication_factor, 3);
        assert_eq!(config.repair.batch_size, 1000);
        assert_eq!(config.oplog.pull_limit, 10000);
        assert_eq!(config.oplog_path(), PathBuf::from("/var/lib/peerstash/oplog.db"));
    }

    #[test]
    fn test_rejects_nan_cleanup_probability() {
        for value in [".nan", "1.5", "-0.1"] {
            let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
            writeln!(
                file,
                "host: http://node1.stash.example.net:1991\n\
                 repair:\n  cleanup_probability: {}\n",
                value
            )
            .unwrap();

            assert!(
                matches!(Config::from_file(file.path().to_str().unwrap()), Err(StashError::Config(_))),
                "{} should be rejected",
                value
            );
        }
    }

    #[test]
    fn test_rejects_bare_host() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "host: node1:1991").unwrap();

        assert!(matches!(
            Config::from_file(file.path().to_str().unwrap()),
            Err(StashError::Config(_))
        ));
    }
}

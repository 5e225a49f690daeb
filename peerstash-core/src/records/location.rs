use crate::oplog::store::parse_timestamp;
use crate::oplog::{OpStore, Record};
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};

/// A claim that `host` currently stores the blob `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub key: String,
    pub host: String,
    pub created_at: DateTime<Utc>,
}

impl LocationRecord {
    pub fn new(key: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            host: host.into(),
            created_at: Utc::now(),
        }
    }
}

impl Record for LocationRecord {
    const RECORD_TYPE: &'static str = "blobs";

    fn create_table(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blobs (
                key TEXT NOT NULL,
                host TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (key, host)
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_blobs_host ON blobs(host)", [])?;

        Ok(())
    }

    fn insert(conn: &Connection, record: &Self) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO blobs (key, host, created_at) VALUES (?1, ?2, ?3)",
            params![record.key, record.host, record.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn upsert(conn: &Connection, record: &Self) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO blobs (key, host, created_at) VALUES (?1, ?2, ?3)",
            params![record.key, record.host, record.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete(conn: &Connection, record: &Self) -> Result<()> {
        conn.execute(
            "DELETE FROM blobs WHERE key = ?1 AND host = ?2",
            params![record.key, record.host],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replication {
    Under,
    Over,
}

/// Healthy holders of one key whose count is off target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProblemReport {
    pub key: String,
    pub hosts: Vec<String>,
}

impl ProblemReport {
    pub fn replicas(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_held_by(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }
}

/// Read-side queries over the replicated location table.
pub struct LocationIndex<'a> {
    store: &'a OpStore,
}

impl<'a> LocationIndex<'a> {
    pub fn new(store: &'a OpStore) -> Self {
        Self { store }
    }

    pub fn holders(&self, key: &str) -> Result<Vec<String>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare("SELECT host FROM blobs WHERE key = ?1 ORDER BY host")?;
            let rows = stmt.query_map([key], |row| row.get::<_, String>(0))?;

            let mut hosts = Vec::new();
            for row in rows {
                hosts.push(row?);
            }
            Ok(hosts)
        })
    }

    pub fn get(&self, key: &str, host: &str) -> Result<Option<LocationRecord>> {
        self.store.read(|conn| {
            let created_at: Option<String> = conn
                .query_row(
                    "SELECT created_at FROM blobs WHERE key = ?1 AND host = ?2",
                    [key, host],
                    |row| row.get(0),
                )
                .optional()?;

            match created_at {
                Some(created_at) => Ok(Some(LocationRecord {
                    key: key.to_string(),
                    host: host.to_string(),
                    created_at: parse_timestamp(&created_at)?,
                })),
                None => Ok(None),
            }
        })
    }

    pub fn count_for_host(&self, host: &str) -> Result<u64> {
        self.store.read(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM blobs WHERE host = ?1", [host], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Keys whose count of holders among `healthy` is below (or above)
    /// `replication_factor`, at most `limit` of them in random order so a
    /// stuck prefix cannot starve the rest.
    ///
    /// Keys with no healthy holder at all are never reported.
    pub fn problem_keys(
        &self,
        healthy: &[String],
        replication_factor: usize,
        direction: Replication,
        limit: usize,
    ) -> Result<Vec<ProblemReport>> {
        if healthy.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; healthy.len()].join(", ");
        let comparison = match direction {
            Replication::Under => "<",
            Replication::Over => ">",
        };
        let sql = format!(
            "SELECT key, json_group_array(host) FROM blobs
             WHERE host IN ({})
             GROUP BY key
             HAVING COUNT(*) {} ?
             ORDER BY RANDOM()
             LIMIT ?",
            placeholders, comparison
        );

        let mut values: Vec<Value> = healthy.iter().map(|host| Value::Text(host.clone())).collect();
        values.push(Value::Integer(replication_factor as i64));
        values.push(Value::Integer(limit as i64));

        self.store.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                let key: String = row.get(0)?;
                let hosts: String = row.get(1)?;
                Ok((key, hosts))
            })?;

            let mut reports = Vec::new();
            for row in rows {
                let (key, hosts) = row?;
                let mut hosts: Vec<String> = serde_json::from_str(&hosts)?;
                hosts.sort();
                reports.push(ProblemReport { key, hosts });
            }
            Ok(reports)
        })
    }
}

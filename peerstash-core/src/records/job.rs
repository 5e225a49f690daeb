use crate::oplog::store::parse_timestamp;
use crate::oplog::{OpStore, Record};
use crate::{Result, StashError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    Busy,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Busy => "busy",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StashError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "new" => Ok(Self::New),
            "busy" => Ok(Self::Busy),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(StashError::InvalidPayload(format!("unknown job status: {}", other))),
        }
    }
}

/// A processing job row shared by every node. `mirrors` lists the hosts
/// holding the job's input, in rendezvous order; the first mirror runs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub transcoded_by: Option<String>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, mirrors: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::New,
            mirrors,
            transcoded_by: None,
            progress: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get(store: &OpStore, id: &str) -> Result<Option<Self>> {
        store.read(|conn| {
            conn.query_row(
                "SELECT id, status, mirrors, transcoded_by, progress, error, created_at, updated_at
                 FROM jobs WHERE id = ?1",
                [id],
                job_from_row,
            )
            .optional()?
            .map(RawJob::into_record)
            .transpose()
        })
    }

    pub fn list_by_status(store: &OpStore, status: JobStatus) -> Result<Vec<Self>> {
        store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, mirrors, transcoded_by, progress, error, created_at, updated_at
                 FROM jobs WHERE status = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([status.as_str()], job_from_row)?;

            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row?.into_record()?);
            }
            Ok(jobs)
        })
    }

    fn write(conn: &Connection, verb: &str, record: &Self) -> Result<()> {
        let mirrors = serde_json::to_string(&record.mirrors)?;
        let sql = format!(
            "{} INTO jobs (id, status, mirrors, transcoded_by, progress, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            verb
        );

        conn.execute(
            &sql,
            params![
                record.id,
                record.status.as_str(),
                mirrors,
                record.transcoded_by,
                record.progress,
                record.error,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl Record for JobRecord {
    const RECORD_TYPE: &'static str = "jobs";

    fn create_table(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                mirrors TEXT NOT NULL,
                transcoded_by TEXT,
                progress REAL NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)", [])?;

        Ok(())
    }

    fn insert(conn: &Connection, record: &Self) -> Result<()> {
        Self::write(conn, "INSERT OR IGNORE", record)
    }

    fn upsert(conn: &Connection, record: &Self) -> Result<()> {
        Self::write(conn, "INSERT OR REPLACE", record)
    }

    fn delete(conn: &Connection, record: &Self) -> Result<()> {
        conn.execute("DELETE FROM jobs WHERE id = ?1", [&record.id])?;
        Ok(())
    }
}

struct RawJob {
    id: String,
    status: String,
    mirrors: String,
    transcoded_by: Option<String>,
    progress: f64,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id,
            status: self.status.parse()?,
            mirrors: serde_json::from_str(&self.mirrors)?,
            transcoded_by: self.transcoded_by,
            progress: self.progress,
            error: self.error,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        status: row.get(1)?,
        mirrors: row.get(2)?,
        transcoded_by: row.get(3)?,
        progress: row.get(4)?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::TypeRegistry;

    #[test]
    fn test_job_table_roundtrip() {
        let registry = TypeRegistry::builder().register::<JobRecord>().build();
        let store = OpStore::open_in_memory().unwrap();
        store.create_tables(&registry).unwrap();

        let mut job = JobRecord::new("j1", vec!["http://a.test".to_string()]);
        store
            .read(|conn| JobRecord::insert(conn, &job))
            .unwrap();

        job.status = JobStatus::Error;
        job.error = Some("ffmpeg exited 1".to_string());
        store.read(|conn| JobRecord::upsert(conn, &job)).unwrap();

        let stored = JobRecord::get(&store, "j1").unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.mirrors, job.mirrors);
        assert_eq!(stored.error.as_deref(), Some("ffmpeg exited 1"));

        assert_eq!(JobRecord::list_by_status(&store, JobStatus::Error).unwrap().len(), 1);
        assert!(JobRecord::list_by_status(&store, JobStatus::New).unwrap().is_empty());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("busy".parse::<JobStatus>().unwrap(), JobStatus::Busy);
        assert!("paused".parse::<JobStatus>().is_err());
    }
}

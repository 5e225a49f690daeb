use crate::oplog::{DecodedBatch, Op, OpAction, RecordCodec, TypeRegistry};
use crate::{Result, StashError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Per-peer sweep high-water mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub host: String,
    pub last_id: String,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed mutation log, sweep cursors and derived record tables.
///
/// Every write to a record table goes through [`OpStore::apply`]; the
/// connection lock is never held across an await point.
pub struct OpStore {
    conn: Mutex<Connection>,
}

impl OpStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        tracing::debug!("Opened op store at {:?} (journal_mode={})", path, mode);

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ops (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                action TEXT NOT NULL,
                record_type TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        // Sweeps in `own` scope filter by author
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ops_host_id ON ops(host, id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cursors (
                host TEXT PRIMARY KEY,
                last_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Create the table of every registered record type.
    pub fn create_tables(&self, registry: &TypeRegistry) -> Result<()> {
        let conn = self.lock()?;
        for codec in registry.codecs() {
            codec.create_table(&conn)?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StashError::Internal("op store lock poisoned".to_string()))
    }

    /// Run a read-only query against the local tables.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Record `op` and apply its records in one transaction.
    ///
    /// Returns `false` when a durable op with the same id already exists; the
    /// transaction is rolled back and nothing changes.
    pub fn apply(&self, op: &Op, codec: &dyn RecordCodec, batch: &DecodedBatch) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if !op.transient {
            let payload = serde_json::to_string(&op.payload)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO ops (id, host, action, record_type, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![op.id, op.host, op.action.as_str(), op.record_type, payload],
            )?;

            if inserted == 0 {
                tx.rollback()?;
                return Ok(false);
            }
        }

        codec.apply(&tx, op.action, batch)?;
        tx.commit()?;

        Ok(true)
    }

    pub fn contains_op(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM ops WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Durable ops with `id > after`, ascending, optionally limited to one author.
    pub fn ops_after(&self, after: &str, limit: usize, author: Option<&str>) -> Result<Vec<Op>> {
        let conn = self.lock()?;
        let limit = limit as i64;

        let mut ops = Vec::new();
        match author {
            Some(host) => {
                let mut stmt = conn.prepare(
                    "SELECT id, host, action, record_type, payload
                     FROM ops WHERE host = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![host, after, limit], op_from_row)?;
                for row in rows {
                    ops.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, host, action, record_type, payload
                     FROM ops WHERE id > ?1 ORDER BY id LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![after, limit], op_from_row)?;
                for row in rows {
                    ops.push(row?);
                }
            }
        }

        Ok(ops)
    }

    pub fn op_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ops", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn get_cursor(&self, host: &str) -> Result<Option<Cursor>> {
        let conn = self.lock()?;

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT last_id, updated_at FROM cursors WHERE host = ?1",
                [host],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((last_id, updated_at)) => Ok(Some(Cursor {
                host: host.to_string(),
                last_id,
                updated_at: parse_timestamp(&updated_at)?,
            })),
            None => Ok(None),
        }
    }

    pub fn upsert_cursor(&self, host: &str, last_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cursors (host, last_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(host) DO UPDATE SET last_id = excluded.last_id, updated_at = excluded.updated_at",
            params![host, last_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_cursors(&self) -> Result<Vec<Cursor>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT host, last_id, updated_at FROM cursors ORDER BY host")?;

        let rows = stmt.query_map([], |row| {
            let host: String = row.get(0)?;
            let last_id: String = row.get(1)?;
            let updated_at: String = row.get(2)?;
            Ok((host, last_id, updated_at))
        })?;

        let mut cursors = Vec::new();
        for row in rows {
            let (host, last_id, updated_at) = row?;
            cursors.push(Cursor {
                host,
                last_id,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }

        Ok(cursors)
    }
}

fn op_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Op> {
    let action: String = row.get(2)?;
    let payload: String = row.get(4)?;

    Ok(Op {
        id: row.get(0)?,
        host: row.get(1)?,
        action: action
            .parse::<OpAction>()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        record_type: row.get(3)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        transient: false,
    })
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::encode_records;
    use crate::{LocationRecord, LocationIndex};
    use ulid::Ulid;

    fn store() -> (OpStore, TypeRegistry) {
        let registry = TypeRegistry::builder().register::<LocationRecord>().build();
        let store = OpStore::open_in_memory().unwrap();
        store.create_tables(&registry).unwrap();
        (store, registry)
    }

    fn location_op(host: &str, action: OpAction, key: &str) -> Op {
        Op {
            id: Ulid::new().to_string(),
            host: host.to_string(),
            action,
            record_type: "blobs".to_string(),
            payload: encode_records(&[LocationRecord::new(key, host)]).unwrap(),
            transient: false,
        }
    }

    #[test]
    fn test_apply_is_deduplicated_by_id() {
        let (store, registry) = store();
        let codec = registry.get("blobs").unwrap();
        let op = location_op("http://a.test", OpAction::Create, "k1");
        let batch = codec.decode(&op.payload).unwrap();

        assert!(store.apply(&op, codec.as_ref(), &batch).unwrap());
        assert!(!store.apply(&op, codec.as_ref(), &batch).unwrap());
        assert_eq!(store.op_count().unwrap(), 1);
        assert!(store.contains_op(&op.id).unwrap());

        let holders = LocationIndex::new(&store).holders("k1").unwrap();
        assert_eq!(holders, vec!["http://a.test".to_string()]);
    }

    #[test]
    fn test_transient_ops_skip_the_log() {
        let (store, registry) = store();
        let codec = registry.get("blobs").unwrap();
        let mut op = location_op("http://a.test", OpAction::Create, "k1");
        op.transient = true;
        let batch = codec.decode(&op.payload).unwrap();

        assert!(store.apply(&op, codec.as_ref(), &batch).unwrap());
        assert_eq!(store.op_count().unwrap(), 0);
        assert_eq!(LocationIndex::new(&store).holders("k1").unwrap().len(), 1);
    }

    #[test]
    fn test_ops_after_orders_and_filters() {
        let (store, registry) = store();
        let codec = registry.get("blobs").unwrap();

        let mut ids = Vec::new();
        for (i, host) in ["http://a.test", "http://b.test", "http://a.test"].iter().enumerate() {
            let op = location_op(host, OpAction::Create, &format!("k{}", i));
            let batch = codec.decode(&op.payload).unwrap();
            store.apply(&op, codec.as_ref(), &batch).unwrap();
            ids.push(op.id);
            std::thread::sleep(Duration::from_millis(2));
        }

        let all = store.ops_after("", 100, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|pair| pair[0].id < pair[1].id));

        let own = store.ops_after("", 100, Some("http://a.test")).unwrap();
        assert_eq!(own.len(), 2);

        let tail = store.ops_after(&ids[0], 1, None).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, ids[1]);
    }

    #[test]
    fn test_cursor_upsert() {
        let (store, _) = store();
        assert!(store.get_cursor("http://b.test").unwrap().is_none());

        store.upsert_cursor("http://b.test", "01A").unwrap();
        store.upsert_cursor("http://b.test", "01B").unwrap();

        let cursor = store.get_cursor("http://b.test").unwrap().unwrap();
        assert_eq!(cursor.last_id, "01B");
        assert_eq!(store.list_cursors().unwrap().len(), 1);
    }

    #[test]
    fn test_open_file_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("meta").join("oplog.db");
        let (_, registry) = store();

        {
            let store = OpStore::open(&path).unwrap();
            store.create_tables(&registry).unwrap();
            store.upsert_cursor("http://b.test", "01A").unwrap();
        }

        let reopened = OpStore::open(&path).unwrap();
        assert_eq!(reopened.get_cursor("http://b.test").unwrap().unwrap().last_id, "01A");
    }
}

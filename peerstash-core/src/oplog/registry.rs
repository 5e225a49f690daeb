use crate::oplog::OpAction;
use crate::{Result, StashError};
use rusqlite::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// A record kind that can travel through the op log.
///
/// Each kind owns one local table. `insert` must ignore conflicts, `upsert`
/// must overwrite every column, and `delete` removes by primary key.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const RECORD_TYPE: &'static str;

    fn create_table(conn: &Connection) -> Result<()>;

    fn insert(conn: &Connection, record: &Self) -> Result<()>;

    fn upsert(conn: &Connection, record: &Self) -> Result<()>;

    fn delete(conn: &Connection, record: &Self) -> Result<()>;
}

/// Records decoded from an op payload, handed to subscribers.
pub struct DecodedBatch {
    record_type: &'static str,
    len: usize,
    records: Box<dyn Any + Send + Sync>,
}

impl DecodedBatch {
    pub fn new<R: Record>(records: Vec<R>) -> Self {
        Self {
            record_type: R::RECORD_TYPE,
            len: records.len(),
            records: Box::new(records),
        }
    }

    pub fn record_type(&self) -> &'static str {
        self.record_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn downcast<R: Record>(&self) -> Option<&[R]> {
        self.records.downcast_ref::<Vec<R>>().map(Vec::as_slice)
    }
}

impl std::fmt::Debug for DecodedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedBatch")
            .field("record_type", &self.record_type)
            .field("len", &self.len)
            .finish()
    }
}

/// Object-safe decode/apply strategy for one record type.
pub trait RecordCodec: Send + Sync {
    fn record_type(&self) -> &'static str;

    fn create_table(&self, conn: &Connection) -> Result<()>;

    fn decode(&self, payload: &serde_json::Value) -> Result<DecodedBatch>;

    fn apply(&self, conn: &Connection, action: OpAction, batch: &DecodedBatch) -> Result<()>;
}

struct TypedCodec<R>(PhantomData<fn() -> R>);

impl<R: Record> RecordCodec for TypedCodec<R> {
    fn record_type(&self) -> &'static str {
        R::RECORD_TYPE
    }

    fn create_table(&self, conn: &Connection) -> Result<()> {
        R::create_table(conn)
    }

    fn decode(&self, payload: &serde_json::Value) -> Result<DecodedBatch> {
        let records: Vec<R> = if payload.is_array() {
            serde_json::from_value(payload.clone())
        } else {
            serde_json::from_value(payload.clone()).map(|record| vec![record])
        }
        .map_err(|error| {
            StashError::InvalidPayload(format!("{} payload: {}", R::RECORD_TYPE, error))
        })?;

        Ok(DecodedBatch::new(records))
    }

    fn apply(&self, conn: &Connection, action: OpAction, batch: &DecodedBatch) -> Result<()> {
        let records = batch.downcast::<R>().ok_or_else(|| {
            StashError::Internal(format!(
                "batch of {} handed to {} codec",
                batch.record_type(),
                R::RECORD_TYPE
            ))
        })?;

        for record in records {
            match action {
                OpAction::Create => R::insert(conn, record)?,
                OpAction::Update => R::upsert(conn, record)?,
                OpAction::Delete => R::delete(conn, record)?,
            }
        }

        Ok(())
    }
}

/// Encode records as the array payload carried by an op.
pub fn encode_records<R: Record>(records: &[R]) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(records)?)
}

/// Immutable map from record type name to codec, built once at startup.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    codecs: HashMap<&'static str, Arc<dyn RecordCodec>>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn get(&self, record_type: &str) -> Result<&Arc<dyn RecordCodec>> {
        self.codecs
            .get(record_type)
            .ok_or_else(|| StashError::UnknownType(record_type.to_string()))
    }

    pub fn contains(&self, record_type: &str) -> bool {
        self.codecs.contains_key(record_type)
    }

    pub fn codecs(&self) -> impl Iterator<Item = &Arc<dyn RecordCodec>> {
        self.codecs.values()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

#[derive(Default)]
pub struct TypeRegistryBuilder {
    codecs: HashMap<&'static str, Arc<dyn RecordCodec>>,
}

impl TypeRegistryBuilder {
    pub fn register<R: Record>(self) -> Self {
        self.register_codec(Arc::new(TypedCodec::<R>(PhantomData)))
    }

    pub fn register_codec(mut self, codec: Arc<dyn RecordCodec>) -> Self {
        let record_type = codec.record_type();
        if self.codecs.insert(record_type, codec).is_some() {
            tracing::warn!("record type {} registered twice; keeping the last codec", record_type);
        }
        self
    }

    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            codecs: self.codecs,
        }
    }
}

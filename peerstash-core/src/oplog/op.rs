use crate::{Result, StashError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpAction {
    type Err = StashError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(StashError::InvalidPayload(format!(
                "unknown op action: {}",
                other
            ))),
        }
    }
}

/// A replicated mutation. `id` is a ULID string: globally unique, sortable by
/// creation time, and used both for dedup and as a sweep cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: String,
    pub host: String,
    pub action: OpAction,
    pub record_type: String,
    /// JSON array of records of `record_type`.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
}

impl Op {
    /// Parse the id. Anything but the canonical uppercase form is invalid:
    /// ids are compared as text in the log and in sweep cursors.
    pub fn ulid(&self) -> Result<Ulid> {
        let ulid = Ulid::from_string(&self.id)
            .map_err(|error| StashError::InvalidPayload(format!("invalid op id {}: {}", self.id, error)))?;
        if ulid.to_string() != self.id {
            return Err(StashError::InvalidPayload(format!("non-canonical op id {}", self.id)));
        }
        Ok(ulid)
    }

    /// Milliseconds since the epoch embedded in the id.
    pub fn timestamp_ms(&self) -> Option<u64> {
        self.ulid().ok().map(|ulid| ulid.timestamp_ms())
    }

    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        Ok(bytes::Bytes::from(serde_json::to_vec(self)?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpOptions {
    /// Apply and push, but keep out of the durable log and sweep responses.
    pub transient: bool,
}

impl OpOptions {
    pub fn transient() -> Self {
        Self { transient: true }
    }
}

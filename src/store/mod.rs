//! Conditions object storage.
//!
//! Objects are addressed by a three-level path, a run validity range and a
//! version. The same [`ObjectStore`] contract backs the primary store, the
//! reference store and the per-host local fallback.

mod file;
mod gateway;

pub use file::FileObjectStore;
pub use gateway::{CommitOutcome, DiscardReason, ObjectStoreGateway, ReconcileReport};

use crate::core::{Result, RunNumber, ShuttleError, ValidityRange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// `Subsystem/Type/Name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn parse(path: &str) -> Result<Self> {
        let segments: Vec<&str> = path.split('/').collect();
        let valid = segments.len() == 3
            && segments.iter().all(|segment| {
                !segment.is_empty()
                    && *segment != "."
                    && *segment != ".."
                    && !segment.contains('\\')
                    && segment.trim() == *segment
            });
        if !valid {
            return Err(ShuttleError::InvalidPath(path.to_string()));
        }
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// First segment, the owning subsystem.
    pub fn owner(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = ShuttleError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> Self {
        path.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub path: ObjectPath,
    pub validity: ValidityRange,
    /// Assigned by the store on `put`; 0 before that.
    pub version: u32,
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} v{}", self.path, self.validity, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Conditions,
    Reference,
    /// Shuttle bookkeeping; never promoted.
    Status,
}

const ATTEMPT_PROPERTY: &str = "attempt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub subsystem: String,
    pub producer_run: RunNumber,
    pub kind: StorageKind,
    #[serde(default)]
    pub responsible: String,
    #[serde(default)]
    pub comment: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn new(subsystem: &str, producer_run: RunNumber, kind: StorageKind) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            producer_run,
            kind,
            responsible: String::new(),
            comment: String::new(),
            created_at: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    pub fn responsible(mut self, responsible: &str) -> Self {
        self.responsible = responsible.to_string();
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Records the processing attempt that produced the object.
    pub fn attempt(self, attempt: u32) -> Self {
        self.property(ATTEMPT_PROPERTY, &attempt.to_string())
    }

    pub fn producer_attempt(&self) -> Option<u32> {
        self.properties
            .get(ATTEMPT_PROPERTY)
            .and_then(|value| value.parse().ok())
    }
}

/// Identity and metadata without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub id: ObjectId,
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub id: ObjectId,
    pub metadata: ObjectMetadata,
    pub payload: Vec<u8>,
}

impl StoredObject {
    pub fn new(
        path: ObjectPath,
        validity: ValidityRange,
        metadata: ObjectMetadata,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: ObjectId {
                path,
                validity,
                version: 0,
            },
            metadata,
            payload,
        }
    }

    pub fn header(&self) -> ObjectHeader {
        ObjectHeader {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store `object` under the next free version of its path.
    async fn put(&self, object: &StoredObject) -> Result<ObjectId>;

    /// Highest version at `path` whose validity contains `run`.
    async fn get(&self, path: &ObjectPath, run: RunNumber) -> Result<Option<StoredObject>>;

    /// Headers of every object whose path starts with `prefix` (`""` for all).
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectHeader>>;

    async fn load(&self, id: &ObjectId) -> Result<StoredObject>;

    async fn remove(&self, id: &ObjectId) -> Result<()>;

    /// Objects at `path` whose validity overlaps `range`.
    async fn list_valid(&self, path: &ObjectPath, range: &ValidityRange) -> Result<Vec<ObjectHeader>> {
        let headers = self.list(path.as_str()).await?;
        Ok(headers
            .into_iter()
            .filter(|header| header.id.path == *path && header.id.validity.overlaps(range))
            .collect())
    }
}

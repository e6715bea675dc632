// Versioned Store Port: optimistic read-check-write over JSON records
//
// Every multi-record "transaction" in the application layer is a loop of
// read -> decide -> commit(expected versions) that retries on Conflict.

pub mod memory;

use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryStore;

/// Read-check-write loops give up after this many lost races
pub const MAX_CONFLICT_RETRIES: usize = 16;

/// Record version. Bumped by every successful put and delete; a key deleted and
/// inserted again continues from its last version.
pub type Version = u64;

/// Record families kept by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Jobs,
    Subjects,
    RateLimits,
    PostingHistory,
    Tokens,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Jobs,
        Collection::Subjects,
        Collection::RateLimits,
        Collection::PostingHistory,
        Collection::Tokens,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Jobs => "jobs",
            Collection::Subjects => "subjects",
            Collection::RateLimits => "rate_limits",
            Collection::PostingHistory => "posting_history",
            Collection::Tokens => "tokens",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub key: String,
    pub version: Version,
    pub value: T,
}

/// Precondition on the stored record for a put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Key must not exist
    Absent,
    /// Key must exist at exactly this version
    Version(Version),
}

impl From<Option<Version>> for Expected {
    fn from(version: Option<Version>) -> Self {
        match version {
            Some(v) => Expected::Version(v),
            None => Expected::Absent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Put {
        collection: Collection,
        key: String,
        expected: Expected,
        value: serde_json::Value,
    },
    Delete {
        collection: Collection,
        key: String,
        version: Version,
    },
}

impl Write {
    pub fn put<T: Serialize>(
        collection: Collection,
        key: impl Into<String>,
        expected: impl Into<Expected>,
        value: &T,
    ) -> Result<Self> {
        Ok(Write::Put {
            collection,
            key: key.into(),
            expected: expected.into(),
            value: serde_json::to_value(value)?,
        })
    }

    pub fn insert<T: Serialize>(
        collection: Collection,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        Self::put(collection, key, Expected::Absent, value)
    }

    pub fn update<T: Serialize>(
        collection: Collection,
        key: impl Into<String>,
        version: Version,
        value: &T,
    ) -> Result<Self> {
        Self::put(collection, key, Expected::Version(version), value)
    }

    pub fn delete(collection: Collection, key: impl Into<String>, version: Version) -> Self {
        Write::Delete {
            collection,
            key: key.into(),
            version,
        }
    }

    pub fn target(&self) -> (Collection, &str) {
        match self {
            Write::Put {
                collection, key, ..
            }
            | Write::Delete {
                collection, key, ..
            } => (*collection, key.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A precondition failed; nothing was written
    Conflict,
}

/// Equality filter on a string field of the JSON body.
/// Dotted paths reach into nested objects (`last_error.code`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub field: String,
    pub equals: String,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, equals: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            equals: equals.into(),
        }
    }

    /// In-process evaluation, shared by adapters that cannot push filters down
    pub fn matches(&self, body: &serde_json::Value) -> bool {
        let pointer = format!("/{}", self.field.replace('.', "/"));
        body.pointer(&pointer)
            .and_then(|v| v.as_str())
            .map_or(false, |v| v == self.equals)
    }
}

/// Store interface
///
/// Implementations:
/// - InMemoryStore: process-local, used by tests and single-process runs
/// - SqliteRecordStore (infra-sqlite): shared across worker processes
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Read one record
    async fn read(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<Versioned<serde_json::Value>>>;

    /// Apply all writes atomically, or none of them if any precondition fails
    async fn commit(&self, writes: Vec<Write>) -> Result<CommitOutcome>;

    /// All records of a collection matching every filter, in key order
    async fn scan(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Vec<Versioned<serde_json::Value>>>;
}

fn decode<T: DeserializeOwned>(record: Versioned<serde_json::Value>) -> Result<Versioned<T>> {
    Ok(Versioned {
        value: serde_json::from_value(record.value)?,
        key: record.key,
        version: record.version,
    })
}

/// Typed `read`
pub async fn read_as<T: DeserializeOwned>(
    store: &dyn VersionedStore,
    collection: Collection,
    key: &str,
) -> Result<Option<Versioned<T>>> {
    store.read(collection, key).await?.map(decode).transpose()
}

/// Typed `scan`
pub async fn scan_as<T: DeserializeOwned>(
    store: &dyn VersionedStore,
    collection: Collection,
    filters: &[FieldFilter],
) -> Result<Vec<Versioned<T>>> {
    store
        .scan(collection, filters)
        .await?
        .into_iter()
        .map(decode)
        .collect()
}

/// Error for a read-check-write loop that ran out of retries
pub fn conflict_exhausted(what: impl std::fmt::Display) -> AppError {
    AppError::Conflict(format!(
        "{} lost {} consecutive races",
        what, MAX_CONFLICT_RETRIES
    ))
}

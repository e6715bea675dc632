// In-memory VersionedStore

use super::{
    Collection, CommitOutcome, Expected, FieldFilter, Version, Versioned, VersionedStore, Write,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// `None` marks a deleted key; its version carries over to the next insert
type Records = BTreeMap<(Collection, String), (Version, Option<serde_json::Value>)>;

/// Process-local store. A single mutex makes every commit atomic.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<Records>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: Collection) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|((c, _), (_, value))| *c == collection && value.is_some())
            .count()
    }

    fn precondition_holds(records: &Records, write: &Write) -> bool {
        let (collection, key) = write.target();
        let current = records
            .get(&(collection, key.to_string()))
            .and_then(|(v, value)| value.as_ref().map(|_| *v));
        match write {
            Write::Put { expected, .. } => match expected {
                Expected::Absent => current.is_none(),
                Expected::Version(v) => current == Some(*v),
            },
            Write::Delete { version, .. } => current == Some(*version),
        }
    }
}

#[async_trait]
impl VersionedStore for InMemoryStore {
    async fn read(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<Versioned<serde_json::Value>>> {
        let records = self.records.lock().await;
        Ok(records
            .get(&(collection, key.to_string()))
            .and_then(|(version, value)| {
                value.as_ref().map(|value| Versioned {
                    key: key.to_string(),
                    version: *version,
                    value: value.clone(),
                })
            }))
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<CommitOutcome> {
        let mut records = self.records.lock().await;

        if !writes
            .iter()
            .all(|w| Self::precondition_holds(&records, w))
        {
            return Ok(CommitOutcome::Conflict);
        }

        for write in writes {
            match write {
                Write::Put {
                    collection,
                    key,
                    expected,
                    value,
                } => {
                    let previous = match expected {
                        Expected::Absent => records
                            .get(&(collection, key.clone()))
                            .map_or(0, |(v, _)| *v),
                        Expected::Version(v) => v,
                    };
                    records.insert((collection, key), (previous + 1, Some(value)));
                }
                Write::Delete {
                    collection,
                    key,
                    version,
                } => {
                    records.insert((collection, key), (version + 1, None));
                }
            }
        }
        Ok(CommitOutcome::Committed)
    }

    async fn scan(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Vec<Versioned<serde_json::Value>>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .filter_map(|((_, key), (version, value))| {
                let value = value.as_ref()?;
                filters.iter().all(|f| f.matches(value)).then(|| Versioned {
                    key: key.clone(),
                    version: *version,
                    value: value.clone(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_then_update_bumps_version() {
        let store = InMemoryStore::new();
        let outcome = store
            .commit(vec![Write::insert(Collection::Jobs, "a", &json!({"n": 1})).unwrap()])
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        let record = store.read(Collection::Jobs, "a").await.unwrap().unwrap();
        assert_eq!(record.version, 1);

        store
            .commit(vec![Write::update(Collection::Jobs, "a", 1, &json!({"n": 2})).unwrap()])
            .await
            .unwrap();
        let record = store.read(Collection::Jobs, "a").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.value, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_and_writes_nothing() {
        let store = InMemoryStore::new();
        store
            .commit(vec![Write::insert(Collection::Jobs, "a", &json!({"n": 1})).unwrap()])
            .await
            .unwrap();

        // Second write is valid but the first is stale: the batch must be rejected whole
        let outcome = store
            .commit(vec![
                Write::update(Collection::Jobs, "a", 7, &json!({"n": 9})).unwrap(),
                Write::insert(Collection::Subjects, "s", &json!({})).unwrap(),
            ])
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);
        assert!(store.read(Collection::Subjects, "s").await.unwrap().is_none());
        assert_eq!(
            store.read(Collection::Jobs, "a").await.unwrap().unwrap().value,
            json!({"n": 1})
        );
    }

    #[tokio::test]
    async fn test_insert_existing_key_conflicts() {
        let store = InMemoryStore::new();
        let write = Write::insert(Collection::Tokens, "t", &json!({})).unwrap();
        store.commit(vec![write.clone()]).await.unwrap();
        assert_eq!(
            store.commit(vec![write]).await.unwrap(),
            CommitOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn test_scan_filters_within_collection() {
        let store = InMemoryStore::new();
        store
            .commit(vec![
                Write::insert(Collection::Jobs, "b", &json!({"status": "queued"})).unwrap(),
                Write::insert(Collection::Jobs, "a", &json!({"status": "queued"})).unwrap(),
                Write::insert(Collection::Jobs, "c", &json!({"status": "failed"})).unwrap(),
                Write::insert(Collection::Subjects, "d", &json!({"status": "queued"})).unwrap(),
            ])
            .await
            .unwrap();

        let queued = store
            .scan(Collection::Jobs, &[FieldFilter::eq("status", "queued")])
            .await
            .unwrap();
        let keys: Vec<_> = queued.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(store.len(Collection::Jobs).await, 3);
    }

    #[tokio::test]
    async fn test_delete_requires_matching_version() {
        let store = InMemoryStore::new();
        store
            .commit(vec![Write::insert(Collection::Jobs, "a", &json!({})).unwrap()])
            .await
            .unwrap();

        assert_eq!(
            store
                .commit(vec![Write::delete(Collection::Jobs, "a", 2)])
                .await
                .unwrap(),
            CommitOutcome::Conflict
        );
        assert_eq!(
            store
                .commit(vec![Write::delete(Collection::Jobs, "a", 1)])
                .await
                .unwrap(),
            CommitOutcome::Committed
        );
        assert!(store.read(Collection::Jobs, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reinserted_key_continues_version_sequence() {
        let store = InMemoryStore::new();
        store
            .commit(vec![Write::insert(Collection::Jobs, "a", &json!({"n": 1})).unwrap()])
            .await
            .unwrap();
        store
            .commit(vec![Write::delete(Collection::Jobs, "a", 1)])
            .await
            .unwrap();
        assert_eq!(store.len(Collection::Jobs).await, 0);
        assert!(store.scan(Collection::Jobs, &[]).await.unwrap().is_empty());

        store
            .commit(vec![Write::insert(Collection::Jobs, "a", &json!({"n": 2})).unwrap()])
            .await
            .unwrap();
        let record = store.read(Collection::Jobs, "a").await.unwrap().unwrap();
        assert_eq!(record.version, 3);

        // A writer that read the first incarnation cannot touch the second
        let stale = Write::update(Collection::Jobs, "a", 1, &json!({"n": 9})).unwrap();
        assert_eq!(
            store.commit(vec![stale]).await.unwrap(),
            CommitOutcome::Conflict
        );
        assert_eq!(
            store.read(Collection::Jobs, "a").await.unwrap().unwrap().value,
            json!({"n": 2})
        );
    }
}

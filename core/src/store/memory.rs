/// In-process document store with live watches.
/// Used by tests and demos; supports fault injection.
use super::{
    ChangeBatch, DocumentChange, DocumentStore, Query, StoreResult, Subscription, SubscriptionId,
};
use crate::error::StoreError;
use crate::model::{Document, Fields, RecordId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

struct Watcher {
    collection: String,
    query: Query,
    tx: mpsc::UnboundedSender<StoreResult<ChangeBatch>>,
}

#[derive(Default)]
struct Inner {
    /// Documents per collection, in insertion order
    collections: HashMap<String, Vec<Document>>,
    watchers: HashMap<SubscriptionId, Watcher>,
    next_subscription: u64,
    failing_writes: HashSet<String>,
    failing_queries: HashSet<String>,
    query_delay: Option<Duration>,
}

impl Inner {
    /// Push one change to every watcher of `collection` it concerns.
    /// Watchers whose receiver is gone are dropped.
    fn notify(&mut self, collection: &str, before: Option<&Fields>, after: &Document) {
        let mut dead = Vec::new();
        for (id, watcher) in &self.watchers {
            if watcher.collection != collection {
                continue;
            }
            let was = before.map(|f| watcher.query.matches(f)).unwrap_or(false);
            let is = watcher.query.matches(&after.fields);
            let change = match (was, is) {
                (false, true) => DocumentChange::added(after.clone()),
                (true, true) => DocumentChange::modified(after.clone()),
                (true, false) => DocumentChange::removed(after.clone()),
                (false, false) => continue,
            };
            if watcher.tx.send(Ok(vec![change])).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!("Dropping watcher {} with closed receiver", id);
            self.watchers.remove(&id);
        }
    }
}

/// Memory-backed `DocumentStore`; clones share the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a collection, in insertion order
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        let inner = self.inner.read().await;
        inner.collections.get(collection).cloned().unwrap_or_default()
    }

    /// Number of live watches
    pub async fn watcher_count(&self) -> usize {
        self.inner.read().await.watchers.len()
    }

    /// Make writes and updates to `collection` fail (or succeed again)
    pub async fn fail_writes(&self, collection: &str, fail: bool) {
        let mut inner = self.inner.write().await;
        if fail {
            inner.failing_writes.insert(collection.to_string());
        } else {
            inner.failing_writes.remove(collection);
        }
    }

    /// Make one-shot queries against `collection` fail (or succeed again)
    pub async fn fail_queries(&self, collection: &str, fail: bool) {
        let mut inner = self.inner.write().await;
        if fail {
            inner.failing_queries.insert(collection.to_string());
        } else {
            inner.failing_queries.remove(collection);
        }
    }

    /// Delay every one-shot query by `delay`
    pub async fn set_query_delay(&self, delay: Option<Duration>) {
        self.inner.write().await.query_delay = delay;
    }

    /// Terminate every watch on `collection` with `error`.
    /// Returns how many watches were broken.
    pub async fn break_subscriptions(&self, collection: &str, error: StoreError) -> usize {
        let mut inner = self.inner.write().await;
        let ids: Vec<SubscriptionId> = inner
            .watchers
            .iter()
            .filter(|(_, w)| w.collection == collection)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(watcher) = inner.watchers.remove(id) {
                let _ = watcher.tx.send(Err(error.clone()));
            }
        }
        ids.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn write(&self, collection: &str, fields: Fields) -> StoreResult<RecordId> {
        let mut inner = self.inner.write().await;
        if inner.failing_writes.contains(collection) {
            return Err(StoreError::Unavailable(format!(
                "writes to {} are failing",
                collection
            )));
        }

        let document = Document::new(Uuid::new_v4().to_string(), fields);
        let id = document.id.clone();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(document.clone());
        inner.notify(collection, None, &document);

        debug!("Wrote {}/{}", collection, id);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, updates: Fields) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.failing_writes.contains(collection) {
            return Err(StoreError::Unavailable(format!(
                "writes to {} are failing",
                collection
            )));
        }

        let not_found = || StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        let document = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
            .ok_or_else(not_found)?;

        let before = document.fields.clone();
        document.fields.extend(updates);
        let after = document.clone();
        inner.notify(collection, Some(&before), &after);

        debug!("Updated {}/{}", collection, id);
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Document>> {
        let delay = {
            let inner = self.inner.read().await;
            if inner.failing_queries.contains(collection) {
                return Err(StoreError::Unavailable(format!(
                    "queries on {} are failing",
                    collection
                )));
            }
            inner.query_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.inner.read().await;
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| query.matches(&d.fields))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe(&self, collection: &str, query: Query) -> StoreResult<Subscription> {
        let mut inner = self.inner.write().await;
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;

        let replay: ChangeBatch = inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| query.matches(&d.fields))
                    .cloned()
                    .map(DocumentChange::added)
                    .collect()
            })
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, the send cannot fail
        let _ = tx.send(Ok(replay));
        inner.watchers.insert(
            id,
            Watcher {
                collection: collection.to_string(),
                query,
                tx,
            },
        );

        debug!("Subscribed {} on {}", id, collection);
        Ok(Subscription { id, changes: rx })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if self.inner.write().await.watchers.remove(&id).is_some() {
            debug!("Unsubscribed {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_streams() {
        let store = MemoryStore::new();
        store
            .write("chat", fields(json!({"senderId": "a", "receiverId": "b"})))
            .await
            .unwrap();
        store
            .write("chat", fields(json!({"senderId": "b", "receiverId": "a"})))
            .await
            .unwrap();

        let mut sub = store
            .subscribe("chat", Query::new().eq("senderId", "a"))
            .await
            .unwrap();

        let replay = sub.changes.recv().await.unwrap().unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].kind, ChangeKind::Added);

        store
            .write("chat", fields(json!({"senderId": "a", "receiverId": "c"})))
            .await
            .unwrap();
        let next = sub.changes.recv().await.unwrap().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].document.fields["receiverId"], json!("c"));
    }

    #[tokio::test]
    async fn test_empty_replay_is_delivered() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("chat", Query::new()).await.unwrap();
        let replay = sub.changes.recv().await.unwrap().unwrap();
        assert!(replay.is_empty());
    }

    #[tokio::test]
    async fn test_update_reports_modified_and_merges() {
        let store = MemoryStore::new();
        let id = store
            .write(
                "conversations",
                fields(json!({"senderId": "a", "lastMessage": "hi"})),
            )
            .await
            .unwrap();
        let mut sub = store
            .subscribe("conversations", Query::new().eq("senderId", "a"))
            .await
            .unwrap();
        let _ = sub.changes.recv().await;

        store
            .update("conversations", &id, fields(json!({"lastMessage": "hello"})))
            .await
            .unwrap();

        let batch = sub.changes.recv().await.unwrap().unwrap();
        assert_eq!(batch[0].kind, ChangeKind::Modified);
        let doc = &store.documents("conversations").await[0];
        assert_eq!(doc.fields["lastMessage"], json!("hello"));
        assert_eq!(doc.fields["senderId"], json!("a"));
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = MemoryStore::new();
        let err = store
            .update("conversations", "nope", Fields::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("chat", Query::new()).await.unwrap();
        let _ = sub.changes.recv().await;

        store.unsubscribe(sub.id).await;
        assert!(sub.changes.recv().await.is_none());
        assert_eq!(store.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_break_subscriptions_is_terminal() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("chat", Query::new()).await.unwrap();
        let _ = sub.changes.recv().await;

        let broken = store
            .break_subscriptions("chat", StoreError::PermissionDenied("rules".into()))
            .await;
        assert_eq!(broken, 1);
        assert!(sub.changes.recv().await.unwrap().is_err());
        assert!(sub.changes.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::new();
        store.fail_writes("chat", true).await;
        assert!(store.write("chat", Fields::new()).await.is_err());
        store.fail_writes("chat", false).await;
        assert!(store.write("chat", Fields::new()).await.is_ok());
    }
}

/// Persistent document store backed by sled.
/// One tree per collection, keyed by record id, JSON field maps as values.
/// Watches are driven by `Tree::watch_prefix`.
use super::{
    ChangeBatch, DocumentChange, DocumentStore, Query, StoreResult, Subscription, SubscriptionId,
};
use crate::error::{Result, StoreError, SyncError};
use crate::model::{Document, Fields, RecordId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decode_entry(key: &[u8], value: &[u8]) -> StoreResult<Document> {
    let id = String::from_utf8(key.to_vec())
        .map_err(|e| StoreError::Backend(format!("non-utf8 record id: {}", e)))?;
    let fields: Fields = serde_json::from_slice(value)
        .map_err(|e| StoreError::Backend(format!("corrupt record {}: {}", id, e)))?;
    Ok(Document::new(id, fields))
}

#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    next_subscription: Arc<AtomicU64>,
    /// Cancel handles of the watch tasks
    watches: Arc<Mutex<HashMap<SubscriptionId, oneshot::Sender<()>>>>,
}

impl SledStore {
    /// Open (or create) the store in `data_dir`
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("documents.db");
        debug!("Opening document store at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open document store: {}", e)))?;

        info!("Document store initialized at {:?}", db_path);
        Ok(Self {
            db,
            next_subscription: Arc::new(AtomicU64::new(0)),
            watches: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn tree(&self, collection: &str) -> StoreResult<sled::Tree> {
        self.db.open_tree(collection).map_err(backend)
    }

    fn scan(tree: &sled::Tree, query: &Query) -> StoreResult<Vec<Document>> {
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry.map_err(backend)?;
            let document = decode_entry(&key, &value)?;
            if query.matches(&document.fields) {
                out.push(document);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DocumentStore for SledStore {
    async fn write(&self, collection: &str, fields: Fields) -> StoreResult<RecordId> {
        let tree = self.tree(collection)?;
        let id = Uuid::new_v4().to_string();
        let value = serde_json::to_vec(&fields).map_err(|e| StoreError::Backend(e.to_string()))?;

        tree.insert(id.as_bytes(), value).map_err(backend)?;
        tree.flush_async().await.map_err(backend)?;

        debug!("Wrote {}/{}", collection, id);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, updates: Fields) -> StoreResult<()> {
        let tree = self.tree(collection)?;
        let current = tree.get(id.as_bytes()).map_err(backend)?.ok_or_else(|| {
            StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }
        })?;

        let mut fields: Fields = serde_json::from_slice(&current)
            .map_err(|e| StoreError::Backend(format!("corrupt record {}: {}", id, e)))?;
        fields.extend(updates);
        let value = serde_json::to_vec(&fields).map_err(|e| StoreError::Backend(e.to_string()))?;

        tree.insert(id.as_bytes(), value).map_err(backend)?;
        tree.flush_async().await.map_err(backend)?;

        debug!("Updated {}/{}", collection, id);
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Document>> {
        let tree = self.tree(collection)?;
        Self::scan(&tree, query)
    }

    async fn subscribe(&self, collection: &str, query: Query) -> StoreResult<Subscription> {
        let tree = self.tree(collection)?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));

        // Register the watcher before the replay scan so no write falls in between
        let mut watcher = tree.watch_prefix(vec![]);
        let replay = Self::scan(&tree, &query)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = oneshot::channel();

        let mut known: HashMap<RecordId, Document> = replay
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect();
        let batch: ChangeBatch = replay.into_iter().map(DocumentChange::added).collect();
        let _ = tx.send(Ok(batch));

        // Registered before the task starts so its exit can always remove it
        self.watches.lock().await.insert(id, cancel_tx);

        let watches = self.watches.clone();
        let collection_name = collection.to_string();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = &mut cancel_rx => break,
                    event = &mut watcher => event,
                };
                let Some(event) = event else {
                    let _ = tx.send(Err(StoreError::Unavailable(format!(
                        "watch on {} ended",
                        collection_name
                    ))));
                    break;
                };

                let change = match event {
                    sled::Event::Insert { key, value } => {
                        let document = match decode_entry(&key, &value) {
                            Ok(d) => d,
                            Err(e) => {
                                warn!("Skipping undecodable record in {}: {}", collection_name, e);
                                continue;
                            }
                        };
                        let was = known.contains_key(&document.id);
                        let is = query.matches(&document.fields);
                        match (was, is) {
                            (false, true) => {
                                known.insert(document.id.clone(), document.clone());
                                DocumentChange::added(document)
                            }
                            (true, true) => {
                                known.insert(document.id.clone(), document.clone());
                                DocumentChange::modified(document)
                            }
                            (true, false) => {
                                known.remove(&document.id);
                                DocumentChange::removed(document)
                            }
                            (false, false) => continue,
                        }
                    }
                    sled::Event::Remove { key } => {
                        let id = String::from_utf8_lossy(&key).to_string();
                        match known.remove(&id) {
                            Some(document) => DocumentChange::removed(document),
                            None => continue,
                        }
                    }
                };

                if tx.send(Ok(vec![change])).is_err() {
                    break;
                }
            }
            watches.lock().await.remove(&id);
            debug!("Watch {} on {} stopped", id, collection_name);
        });

        debug!("Subscribed {} on {}", id, collection);
        Ok(Subscription { id, changes: rx })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(cancel) = self.watches.lock().await.remove(&id) {
            let _ = cancel.send(());
            debug!("Unsubscribed {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_write_query_update() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledStore::new(temp_dir.path()).unwrap();

        let id = store
            .write(
                "conversations",
                fields(json!({"senderId": "a", "receiverId": "b", "lastMessage": "hi"})),
            )
            .await
            .unwrap();
        store
            .write("conversations", fields(json!({"senderId": "c", "receiverId": "a"})))
            .await
            .unwrap();

        let found = store
            .query(
                "conversations",
                &Query::new().eq("senderId", "a").eq("receiverId", "b"),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);

        store
            .update("conversations", &id, fields(json!({"lastMessage": "hello"})))
            .await
            .unwrap();
        let found = store
            .query("conversations", &Query::new().eq("lastMessage", "hello"))
            .await
            .unwrap();
        assert_eq!(found[0].fields["senderId"], json!("a"));
        let all = store.query("conversations", &Query::new()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledStore::new(temp_dir.path()).unwrap();
        let err = store.update("chat", "nope", Fields::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_watch_replays_and_streams() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledStore::new(temp_dir.path()).unwrap();

        store
            .write("chat", fields(json!({"senderId": "a", "message": "one"})))
            .await
            .unwrap();

        let mut sub = store
            .subscribe("chat", Query::new().eq("senderId", "a"))
            .await
            .unwrap();
        let replay = sub.changes.recv().await.unwrap().unwrap();
        assert_eq!(replay.len(), 1);

        store
            .write("chat", fields(json!({"senderId": "b", "message": "other"})))
            .await
            .unwrap();
        store
            .write("chat", fields(json!({"senderId": "a", "message": "two"})))
            .await
            .unwrap();

        let batch = timeout(Duration::from_secs(5), sub.changes.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].kind, ChangeKind::Added);
        assert_eq!(batch[0].document.fields["message"], json!("two"));

        store.unsubscribe(sub.id).await;
        let closed = timeout(Duration::from_secs(5), sub.changes.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_releases_watch() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledStore::new(temp_dir.path()).unwrap();

        let sub = store.subscribe("chat", Query::new()).await.unwrap();
        assert_eq!(store.watches.lock().await.len(), 1);
        drop(sub);

        // The next delivery fails and the task exits on its own
        store
            .write("chat", fields(json!({"senderId": "a", "message": "late"})))
            .await
            .unwrap();
        timeout(Duration::from_secs(5), async {
            while !store.watches.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("watch entry removed");
    }

    #[tokio::test]
    async fn test_new_creates_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("alice").join("store");
        assert!(SledStore::new(&nested).is_ok());
        assert!(nested.join("documents.db").exists());
    }
}

/// Document store collaborator: collection writes, equality-filtered
/// queries and push-based watch subscriptions.
pub mod memory;
pub mod sled_store;

use crate::error::StoreError;
use crate::model::{Document, Fields, RecordId};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Conjunction of `field == value` filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters
            .iter()
            .all(|(field, value)| fields.get(field) == Some(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One raw change notification from a watch
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

impl DocumentChange {
    pub fn added(document: Document) -> Self {
        Self {
            kind: ChangeKind::Added,
            document,
        }
    }

    pub fn modified(document: Document) -> Self {
        Self {
            kind: ChangeKind::Modified,
            document,
        }
    }

    pub fn removed(document: Document) -> Self {
        Self {
            kind: ChangeKind::Removed,
            document,
        }
    }
}

pub type ChangeBatch = Vec<DocumentChange>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live watch.
///
/// The first batch replays every matching document (possibly none); later
/// batches carry incremental changes. An `Err` item ends the watch, and the
/// channel closes once the subscription is released.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub changes: mpsc::UnboundedReceiver<StoreResult<ChangeBatch>>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document and return its assigned id
    async fn write(&self, collection: &str, fields: Fields) -> StoreResult<RecordId>;

    /// Merge `updates` into an existing document
    async fn update(&self, collection: &str, id: &str, updates: Fields) -> StoreResult<()>;

    /// One-shot query
    async fn query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Document>>;

    async fn subscribe(&self, collection: &str, query: Query) -> StoreResult<Subscription>;

    async fn unsubscribe(&self, id: SubscriptionId);
}

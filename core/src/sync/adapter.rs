/// Change-event adapter: turns raw watch batches into typed events and
/// keeps malformed records out of the merge path.
use crate::error::{ParseError, StoreError, SyncError};
use crate::model::Record;
use crate::store::{ChangeBatch, ChangeKind, StoreResult, Subscription, SubscriptionId};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A typed change for entity `T`
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    Added(Record<T>),
    Modified(Record<T>),
    Removed(Record<T>),
}

impl<T> ChangeEvent<T> {
    pub fn record(&self) -> &Record<T> {
        match self {
            ChangeEvent::Added(r) | ChangeEvent::Modified(r) | ChangeEvent::Removed(r) => r,
        }
    }
}

/// Decode one raw batch. Records that fail to decode are logged and
/// skipped; the rest of the batch is kept.
pub fn adapt_batch<T: DeserializeOwned>(batch: ChangeBatch) -> Vec<ChangeEvent<T>> {
    let mut events = Vec::with_capacity(batch.len());
    for change in batch {
        let record = match change.document.decode::<T>() {
            Ok(record) => record,
            Err(ParseError { record_id, reason }) => {
                warn!("Dropping malformed record {}: {}", record_id, reason);
                continue;
            }
        };
        events.push(match change.kind {
            ChangeKind::Added => ChangeEvent::Added(record),
            ChangeKind::Modified => ChangeEvent::Modified(record),
            ChangeKind::Removed => ChangeEvent::Removed(record),
        });
    }
    events
}

/// A watch subscription seen through the adapter.
///
/// The first store error is returned once as `SyncError::Subscription` and
/// ends the stream; the adapter never resubscribes.
#[derive(Debug)]
pub struct EventStream {
    name: String,
    id: SubscriptionId,
    changes: mpsc::UnboundedReceiver<StoreResult<ChangeBatch>>,
    failed: bool,
}

impl EventStream {
    pub fn new(name: impl Into<String>, subscription: Subscription) -> Self {
        Self {
            name: name.into(),
            id: subscription.id,
            changes: subscription.changes,
            failed: false,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next batch of typed events; `None` once the stream is over
    pub async fn next<T: DeserializeOwned>(
        &mut self,
    ) -> Option<Result<Vec<ChangeEvent<T>>, SyncError>> {
        if self.failed {
            return None;
        }
        match self.changes.recv().await? {
            Ok(batch) => {
                debug!("{}: {} raw changes", self.name, batch.len());
                Some(Ok(adapt_batch(batch)))
            }
            Err(source) => {
                self.failed = true;
                self.changes.close();
                Some(Err(self.fail(source)))
            }
        }
    }

    fn fail(&self, source: StoreError) -> SyncError {
        SyncError::Subscription {
            stream: self.name.clone(),
            source,
        }
    }
}

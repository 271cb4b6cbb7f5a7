/// Recent conversations: the conversation list fed by live watches on the
/// summaries where the local user is either sender or receiver.
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::{fields, ConversationSummary, Participant, Record, RecordId};
use crate::store::{DocumentStore, Query, SubscriptionId};
use crate::sync::adapter::{ChangeEvent, EventStream};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One row of the conversation list, as seen by the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPreview {
    pub id: RecordId,
    pub counterpart: Participant,
    pub last_message_body: String,
    pub last_message_timestamp: DateTime<Utc>,
}

/// Summaries ordered newest first
#[derive(Debug, Clone)]
pub struct ConversationList {
    local_id: String,
    entries: Vec<Record<ConversationSummary>>,
}

impl ConversationList {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one adapted batch; returns whether anything changed
    pub fn apply(&mut self, events: Vec<ChangeEvent<ConversationSummary>>) -> bool {
        let mut changed = false;
        for event in events {
            match event {
                ChangeEvent::Added(record) | ChangeEvent::Modified(record) => {
                    match self.entries.iter_mut().find(|e| e.id == record.id) {
                        Some(existing) => {
                            if *existing != record {
                                *existing = record;
                                changed = true;
                            }
                        }
                        None => {
                            self.entries.push(record);
                            changed = true;
                        }
                    }
                }
                ChangeEvent::Removed(record) => {
                    let before = self.entries.len();
                    self.entries.retain(|e| e.id != record.id);
                    changed |= self.entries.len() != before;
                }
            }
        }
        if changed {
            self.entries.sort_by(|a, b| {
                b.value
                    .last_message_timestamp
                    .cmp(&a.value.last_message_timestamp)
            });
        }
        changed
    }

    pub fn previews(&self) -> Vec<ConversationPreview> {
        self.entries
            .iter()
            .map(|r| ConversationPreview {
                id: r.id.clone(),
                counterpart: r.value.counterpart(&self.local_id),
                last_message_body: r.value.last_message_body.clone(),
                last_message_timestamp: r.value.last_message_timestamp,
            })
            .collect()
    }
}

/// Live conversation list for one user
pub struct RecentConversations {
    store: Arc<dyn DocumentStore>,
    list: Arc<RwLock<ConversationList>>,
    revision: watch::Receiver<u64>,
    subscriptions: Vec<SubscriptionId>,
    tasks: Vec<JoinHandle<()>>,
}

impl RecentConversations {
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        config: &SyncConfig,
        local_id: &str,
    ) -> Result<Self> {
        let list = Arc::new(RwLock::new(ConversationList::new(local_id)));
        let (revision_tx, revision) = watch::channel(0u64);
        let revision_tx = Arc::new(revision_tx);

        let mut subscriptions = Vec::new();
        let mut tasks = Vec::new();
        for field in [fields::SENDER_ID, fields::RECEIVER_ID] {
            let query = Query::new().eq(field, local_id);
            let subscription = match store
                .subscribe(&config.conversations_collection, query)
                .await
            {
                Ok(sub) => sub,
                Err(source) => {
                    for id in subscriptions {
                        store.unsubscribe(id).await;
                    }
                    return Err(SyncError::Subscription {
                        stream: format!("conversations-by-{}", field),
                        source,
                    });
                }
            };
            subscriptions.push(subscription.id);

            let mut stream = EventStream::new(format!("conversations-by-{}", field), subscription);
            let list = list.clone();
            let revision_tx = revision_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(outcome) = stream.next::<ConversationSummary>().await {
                    match outcome {
                        Ok(events) => {
                            if list.write().await.apply(events) {
                                revision_tx.send_modify(|r| *r += 1);
                            }
                        }
                        Err(e) => warn!("Conversation list watch failed: {}", e),
                    }
                }
                debug!("Conversation watch {} finished", stream.name());
            }));
        }

        Ok(Self {
            store,
            list,
            revision,
            subscriptions,
            tasks,
        })
    }

    pub async fn snapshot(&self) -> Vec<ConversationPreview> {
        self.list.read().await.previews()
    }

    /// Bumped every time the list changes
    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    pub async fn close(self) {
        for id in &self.subscriptions {
            self.store.unsubscribe(*id).await;
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Chat session runtime.
///
/// One session per open chat. It owns the timeline, the resolver and both
/// message watches. Every mutation runs on a single actor task fed by one
/// event queue; watch batches, query results and create acks all arrive as
/// events on that queue.
use super::adapter::{ChangeEvent, EventStream};
use super::resolver::{ConversationResolver, PairQuery, ResolverState, SummaryWrite};
use super::timeline::{Timeline, TimelineDiff};
use crate::config::SyncConfig;
use crate::error::{Result, StoreError, SyncError};
use crate::model::{encode, fields, Message, Participant, Record, RecordId};
use crate::store::{DocumentStore, Query, SubscriptionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which of the two message watches an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    SentByMe,
    SentByPeer,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::SentByMe => write!(f, "sent-by-me"),
            StreamKind::SentByPeer => write!(f, "sent-by-peer"),
        }
    }
}

/// Events for the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// A watch batch was merged. `was_empty` asks for a full repaint,
    /// otherwise `inserted_count` messages were appended.
    TimelineChanged {
        diff: TimelineDiff,
        messages: Vec<Record<Message>>,
    },
    /// A watch failed for good. No retry happens at this layer.
    SubscriptionError { stream: StreamKind, error: String },
    /// The session released its watches
    Closed,
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub messages: Vec<Record<Message>>,
    pub resolver: ResolverState,
    pub failed_streams: Vec<StreamKind>,
}

impl SessionSnapshot {
    pub fn summary_id(&self) -> Option<&RecordId> {
        match &self.resolver {
            ResolverState::Resolved(id) => Some(id),
            _ => None,
        }
    }
}

enum SessionEvent {
    Changes {
        stream: StreamKind,
        outcome: Result<Vec<ChangeEvent<Message>>>,
    },
    LookupComplete(std::result::Result<Vec<RecordId>, StoreError>),
    CreateAck(std::result::Result<RecordId, StoreError>),
    Send {
        body: String,
        timestamp: DateTime<Utc>,
        reply: oneshot::Sender<Message>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Close(Option<oneshot::Sender<()>>),
}

/// Handle to a running chat session
pub struct ChatSession {
    local_id: String,
    peer_id: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl ChatSession {
    /// Subscribe both message watches and start the session.
    ///
    /// Returns the handle and the stream of UI updates.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        config: SyncConfig,
        local: Participant,
        peer: Participant,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionUpdate>)> {
        let mine = Query::new()
            .eq(fields::SENDER_ID, local.id.as_str())
            .eq(fields::RECEIVER_ID, peer.id.as_str());
        let theirs = Query::new()
            .eq(fields::SENDER_ID, peer.id.as_str())
            .eq(fields::RECEIVER_ID, local.id.as_str());

        let sent_by_me = store
            .subscribe(&config.chat_collection, mine)
            .await
            .map_err(|source| SyncError::Subscription {
                stream: StreamKind::SentByMe.to_string(),
                source,
            })?;
        let sent_by_peer = match store.subscribe(&config.chat_collection, theirs).await {
            Ok(sub) => sub,
            Err(source) => {
                store.unsubscribe(sent_by_me.id).await;
                return Err(SyncError::Subscription {
                    stream: StreamKind::SentByPeer.to_string(),
                    source,
                });
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let subscriptions = [sent_by_me.id, sent_by_peer.id];
        spawn_forwarder(
            StreamKind::SentByMe,
            EventStream::new(StreamKind::SentByMe.to_string(), sent_by_me),
            events_tx.clone(),
        );
        spawn_forwarder(
            StreamKind::SentByPeer,
            EventStream::new(StreamKind::SentByPeer.to_string(), sent_by_peer),
            events_tx.clone(),
        );

        info!("Opened chat session {} -> {}", local.id, peer.id);
        let local_id = local.id.clone();
        let peer_id = peer.id.clone();
        let actor = SessionActor {
            resolver: ConversationResolver::new(local.clone(), peer.clone(), config.create_policy),
            timeline: Timeline::new(),
            store,
            config,
            local,
            peer,
            events: events_tx.clone(),
            updates: updates_tx,
            subscriptions,
            failed_streams: Vec::new(),
        };
        let task = tokio::spawn(actor.run(events_rx));

        Ok((
            Self {
                local_id,
                peer_id,
                events: events_tx,
                task: Some(task),
            },
            updates_rx,
        ))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Send a message stamped with the current time
    pub async fn send(&self, body: impl Into<String>) -> Result<Message> {
        self.send_at(body, Utc::now()).await
    }

    /// Send a message with an explicit timestamp
    pub async fn send_at(&self, body: impl Into<String>, timestamp: DateTime<Utc>) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::Send {
                body: body.into(),
                timestamp,
                reply,
            })
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::Snapshot(reply))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Release both watches and stop the session. Queries still in flight
    /// complete in the background and are ignored.
    pub async fn close(mut self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::Close(Some(reply)))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.events.send(SessionEvent::Close(None));
        }
    }
}

fn spawn_forwarder(
    kind: StreamKind,
    mut stream: EventStream,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    tokio::spawn(async move {
        while let Some(outcome) = stream.next::<Message>().await {
            let failed = outcome.is_err();
            if events
                .send(SessionEvent::Changes {
                    stream: kind,
                    outcome,
                })
                .is_err()
            {
                break;
            }
            if failed {
                break;
            }
        }
        debug!("Forwarder for {} ({}) finished", kind, stream.id());
    });
}

struct SessionActor {
    store: Arc<dyn DocumentStore>,
    config: SyncConfig,
    local: Participant,
    peer: Participant,
    timeline: Timeline,
    resolver: ConversationResolver,
    /// Completions of spawned store calls come back through here
    events: mpsc::UnboundedSender<SessionEvent>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    subscriptions: [SubscriptionId; 2],
    failed_streams: Vec<StreamKind>,
}

impl SessionActor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let mut close_reply = None;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Changes { stream, outcome } => self.on_changes(stream, outcome),
                SessionEvent::LookupComplete(outcome) => {
                    if let Some(write) = self.resolver.on_lookup_complete(outcome) {
                        self.dispatch(write);
                    }
                }
                SessionEvent::CreateAck(outcome) => {
                    if let Some(write) = self.resolver.on_create_ack(outcome) {
                        self.dispatch(write);
                    }
                }
                SessionEvent::Send {
                    body,
                    timestamp,
                    reply,
                } => {
                    let message = self.on_send(body, timestamp);
                    let _ = reply.send(message);
                }
                SessionEvent::Snapshot(reply) => {
                    let _ = reply.send(SessionSnapshot {
                        messages: self.timeline.messages().to_vec(),
                        resolver: self.resolver.state().clone(),
                        failed_streams: self.failed_streams.clone(),
                    });
                }
                SessionEvent::Close(reply) => {
                    close_reply = reply;
                    break;
                }
            }
        }

        for id in self.subscriptions {
            self.store.unsubscribe(id).await;
        }
        let _ = self.updates.send(SessionUpdate::Closed);
        info!("Closed chat session {} -> {}", self.local.id, self.peer.id);
        if let Some(reply) = close_reply {
            let _ = reply.send(());
        }
    }

    fn on_changes(&mut self, stream: StreamKind, outcome: Result<Vec<ChangeEvent<Message>>>) {
        let events = match outcome {
            Ok(events) => events,
            Err(e) => {
                warn!("Watch {} failed: {}", stream, e);
                self.failed_streams.push(stream);
                let _ = self.updates.send(SessionUpdate::SubscriptionError {
                    stream,
                    error: e.to_string(),
                });
                return;
            }
        };

        let diff = self.timeline.apply_events(events);
        debug!(
            "{}: +{} (was_empty={}), timeline now {}",
            stream,
            diff.inserted_count,
            diff.was_empty,
            self.timeline.len()
        );
        let _ = self.updates.send(SessionUpdate::TimelineChanged {
            diff,
            messages: self.timeline.messages().to_vec(),
        });

        for query in self.resolver.on_timeline_populated(self.timeline.len()) {
            self.spawn_lookup(query);
        }
    }

    fn on_send(&mut self, body: String, timestamp: DateTime<Utc>) -> Message {
        let message = Message::new(&self.local.id, &self.peer.id, body, timestamp);

        match encode(&message) {
            Ok(record) => {
                let store = self.store.clone();
                let collection = self.config.chat_collection.clone();
                tokio::spawn(async move {
                    match store.write(&collection, record).await {
                        Ok(id) => debug!("Message {} written", id),
                        Err(e) => error!("Failed to write message: {}", e),
                    }
                });
            }
            Err(e) => error!("Failed to encode message: {}", e),
        }

        if let Some(write) = self.resolver.on_send(&message) {
            self.dispatch(write);
        }
        message
    }

    fn spawn_lookup(&self, query: PairQuery) {
        let store = self.store.clone();
        let collection = self.config.conversations_collection.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = store
                .query(&collection, &query.to_query())
                .await
                .map(|docs| docs.into_iter().map(|d| d.id).collect::<Vec<_>>());
            // Ignored once the session has ended
            let _ = events.send(SessionEvent::LookupComplete(outcome));
        });
    }

    fn dispatch(&self, write: SummaryWrite) {
        let store = self.store.clone();
        let collection = self.config.conversations_collection.clone();
        match write {
            SummaryWrite::Create(summary) => {
                // Every create is acked, even one that never reached the store
                let record = encode(&summary).map_err(|e| {
                    error!("Failed to encode conversation summary: {}", e);
                    StoreError::Backend(e.to_string())
                });
                let events = self.events.clone();
                tokio::spawn(async move {
                    let outcome = match record {
                        Ok(record) => store.write(&collection, record).await,
                        Err(e) => Err(e),
                    };
                    let _ = events.send(SessionEvent::CreateAck(outcome));
                });
            }
            SummaryWrite::Update { id, last_message } => {
                tokio::spawn(async move {
                    if let Err(e) = store
                        .update(&collection, &id, last_message.to_fields())
                        .await
                    {
                        error!("Failed to update conversation {}: {}", id, e);
                    }
                });
            }
        }
    }
}

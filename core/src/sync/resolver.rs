/// Conversation resolver: find-or-create the summary record for the
/// session's participant pair, then keep it updated on every send.
///
/// The resolver does no I/O. It returns the queries and writes to issue and
/// is fed their completions, so the session decides how to run them.
///
/// States: `NoSummary -> Resolving -> Resolved(id)`. A lookup with no match
/// falls back to `NoSummary` so the next timeline change can try again.
use crate::config::CreatePolicy;
use crate::error::StoreError;
use crate::model::{fields, ConversationSummary, LastMessage, Message, Participant, RecordId};
use crate::store::Query;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverState {
    NoSummary,
    Resolving,
    Resolved(RecordId),
}

/// Existence check for one direction of the pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairQuery {
    pub sender_id: String,
    pub receiver_id: String,
}

impl PairQuery {
    pub fn to_query(&self) -> Query {
        Query::new()
            .eq(fields::SENDER_ID, self.sender_id.as_str())
            .eq(fields::RECEIVER_ID, self.receiver_id.as_str())
    }
}

/// Write the session must issue against the conversations collection
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryWrite {
    Create(ConversationSummary),
    Update {
        id: RecordId,
        last_message: LastMessage,
    },
}

#[derive(Debug)]
pub struct ConversationResolver {
    local: Participant,
    peer: Participant,
    policy: CreatePolicy,
    state: ResolverState,
    pending_lookups: usize,
    creates_in_flight: usize,
    /// Latest send held back while a create is in flight (SerializePending only)
    deferred: Option<LastMessage>,
}

impl ConversationResolver {
    pub fn new(local: Participant, peer: Participant, policy: CreatePolicy) -> Self {
        Self {
            local,
            peer,
            policy,
            state: ResolverState::NoSummary,
            pending_lookups: 0,
            creates_in_flight: 0,
            deferred: None,
        }
    }

    pub fn state(&self) -> &ResolverState {
        &self.state
    }

    pub fn summary_id(&self) -> Option<&RecordId> {
        match &self.state {
            ResolverState::Resolved(id) => Some(id),
            _ => None,
        }
    }

    /// The timeline changed. With no summary known and at least one
    /// message, look the pair up in both directions: either side may have
    /// created the summary.
    pub fn on_timeline_populated(&mut self, timeline_len: usize) -> Vec<PairQuery> {
        if self.state != ResolverState::NoSummary || timeline_len == 0 {
            return Vec::new();
        }
        self.state = ResolverState::Resolving;
        self.pending_lookups = 2;
        debug!(
            "Looking up conversation between {} and {}",
            self.local.id, self.peer.id
        );
        vec![
            PairQuery {
                sender_id: self.local.id.clone(),
                receiver_id: self.peer.id.clone(),
            },
            PairQuery {
                sender_id: self.peer.id.clone(),
                receiver_id: self.local.id.clone(),
            },
        ]
    }

    /// One existence query finished. A failed query counts as no match.
    pub fn on_lookup_complete(
        &mut self,
        outcome: Result<Vec<RecordId>, StoreError>,
    ) -> Option<SummaryWrite> {
        self.pending_lookups = self.pending_lookups.saturating_sub(1);

        let flush = match outcome {
            Ok(ids) => match ids.into_iter().next() {
                Some(id) => self.adopt(id, "lookup"),
                None => None,
            },
            Err(e) => {
                warn!("Conversation lookup failed: {}", e);
                None
            }
        };

        if self.pending_lookups == 0 && self.state == ResolverState::Resolving {
            debug!("No conversation found for {}/{}", self.local.id, self.peer.id);
            self.state = ResolverState::NoSummary;
        }
        flush
    }

    /// The local user sent `message`
    pub fn on_send(&mut self, message: &Message) -> Option<SummaryWrite> {
        if let ResolverState::Resolved(id) = &self.state {
            return Some(SummaryWrite::Update {
                id: id.clone(),
                last_message: LastMessage::of(message),
            });
        }

        if self.policy == CreatePolicy::SerializePending && self.creates_in_flight > 0 {
            debug!("Create in flight, deferring summary update");
            self.deferred = Some(LastMessage::of(message));
            return None;
        }

        self.creates_in_flight += 1;
        Some(SummaryWrite::Create(ConversationSummary::first_message(
            &self.local,
            &self.peer,
            message,
        )))
    }

    /// A create finished: adopt the new id, or log the failure
    pub fn on_create_ack(
        &mut self,
        outcome: Result<RecordId, StoreError>,
    ) -> Option<SummaryWrite> {
        self.creates_in_flight = self.creates_in_flight.saturating_sub(1);
        match outcome {
            Ok(id) => self.adopt(id, "create"),
            Err(e) => {
                error!("Failed to create conversation summary: {}", e);
                if self.summary_id().is_some() || self.creates_in_flight > 0 {
                    return None;
                }
                let last = self.deferred.take()?;
                self.creates_in_flight += 1;
                let message = Message::new(&self.local.id, &self.peer.id, last.body, last.timestamp);
                Some(SummaryWrite::Create(ConversationSummary::first_message(
                    &self.local,
                    &self.peer,
                    &message,
                )))
            }
        }
    }

    fn adopt(&mut self, id: RecordId, source: &str) -> Option<SummaryWrite> {
        if let ResolverState::Resolved(current) = &self.state {
            if *current != id {
                warn!(
                    "Duplicate conversation summary {} from {}, keeping {}",
                    id, source, current
                );
            }
            return None;
        }

        info!("Conversation summary resolved to {} ({})", id, source);
        self.state = ResolverState::Resolved(id.clone());
        self.deferred.take().map(|last_message| SummaryWrite::Update {
            id,
            last_message,
        })
    }
}

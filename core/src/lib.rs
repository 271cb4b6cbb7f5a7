/// ChatSync - message synchronization core for a two-party chat client
///
/// Merges the two live message watches of a chat into one ordered timeline
/// and keeps a single conversation summary per participant pair on a
/// document store that offers writes, equality queries and watches.

pub mod error;
pub mod config;
pub mod model;
pub mod store;
pub mod sync;
pub mod recent;

pub use error::{Result, StoreError, SyncError};
pub use config::{Config, CreatePolicy, SyncConfig};
pub use model::{ConversationSummary, Message, MessageDirection, Participant, Record};
pub use store::{DocumentStore, MemoryStore, SledStore};
pub use sync::{ChatSession, SessionUpdate};
pub use recent::RecentConversations;

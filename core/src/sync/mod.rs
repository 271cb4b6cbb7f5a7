/// Message synchronization: change adapter, timeline merger,
/// conversation resolver and the per-chat session that drives them.
pub mod adapter;
pub mod resolver;
pub mod session;
pub mod timeline;

pub use adapter::{adapt_batch, ChangeEvent, EventStream};
pub use resolver::{ConversationResolver, PairQuery, ResolverState, SummaryWrite};
pub use session::{ChatSession, SessionSnapshot, SessionUpdate, StreamKind};
pub use timeline::{Timeline, TimelineDiff};

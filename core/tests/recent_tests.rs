/// Recent conversation list tests
extern crate chatsync_core;

use chatsync_core::recent::{ConversationPreview, RecentConversations};
use chatsync_core::store::{DocumentStore, MemoryStore};
use chatsync_core::sync::ChatSession;
use chatsync_core::{Participant, SyncConfig};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn wait_for_list<F>(recent: &RecentConversations, what: &str, cond: F) -> Vec<ConversationPreview>
where
    F: Fn(&[ConversationPreview]) -> bool,
{
    let mut revisions = recent.revisions();
    timeout(Duration::from_secs(5), async {
        loop {
            let previews = recent.snapshot().await;
            if cond(&previews) {
                return previews;
            }
            let _ = revisions.changed().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

#[tokio::test]
async fn test_list_follows_both_directions() {
    let memory = MemoryStore::new();
    let store: Arc<dyn DocumentStore> = Arc::new(memory.clone());
    let config = SyncConfig::default();
    let alice = Participant::new("alice", "Alice", "");
    let bob = Participant::new("bob", "Bob", "");
    let carol = Participant::new("carol", "Carol", "");

    let recent = RecentConversations::open(store.clone(), &config, "alice").await.unwrap();
    assert!(recent.snapshot().await.is_empty());

    // Alice starts a chat with Bob, Carol starts one with Alice
    let (with_bob, _u1) = ChatSession::open(store.clone(), config.clone(), alice.clone(), bob.clone())
        .await
        .unwrap();
    with_bob
        .send_at("hi bob", Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap())
        .await
        .unwrap();
    let (carol_side, _u2) = ChatSession::open(store.clone(), config.clone(), carol.clone(), alice.clone())
        .await
        .unwrap();
    carol_side
        .send_at("hey alice", Utc.with_ymd_and_hms(2024, 3, 7, 10, 5, 0).unwrap())
        .await
        .unwrap();

    let previews = wait_for_list(&recent, "two conversations", |p| p.len() == 2).await;
    assert_eq!(previews[0].counterpart.display_name, "Carol");
    assert_eq!(previews[1].counterpart.id, "bob");
    assert_eq!(previews[1].last_message_body, "hi bob");

    // Bob answers later; the conversation moves to the top
    let (bob_side, _u3) = ChatSession::open(store.clone(), config.clone(), bob.clone(), alice.clone())
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while bob_side.snapshot().await.unwrap().summary_id().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob resolves the summary");
    bob_side
        .send_at("hi alice", Utc.with_ymd_and_hms(2024, 3, 7, 10, 9, 0).unwrap())
        .await
        .unwrap();

    let previews = wait_for_list(&recent, "bob on top", |p| {
        p.first().map(|c| c.last_message_body.as_str()) == Some("hi alice")
    })
    .await;
    assert_eq!(previews.len(), 2);
    assert_eq!(previews[0].counterpart.id, "bob");

    with_bob.close().await.unwrap();
    carol_side.close().await.unwrap();
    bob_side.close().await.unwrap();
    recent.close().await;
    assert_eq!(memory.watcher_count().await, 0);
}

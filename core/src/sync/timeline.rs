/// Timeline merger: folds the Added events of both message watches into one
/// chronologically ordered, duplicate-free sequence.
use super::adapter::ChangeEvent;
use crate::model::{Message, Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// What changed after applying events; drives full repaint vs append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineDiff {
    pub was_empty: bool,
    pub inserted_count: usize,
}

impl TimelineDiff {
    /// First population of the view: repaint everything
    pub fn is_full_repaint(&self) -> bool {
        self.was_empty
    }
}

/// Ordered message list for one chat session.
///
/// Every insertion re-sorts the whole list (stable, by timestamp), so
/// equal timestamps keep arrival order. Fine for session-sized histories;
/// large histories would want a sorted insert instead.
#[derive(Debug, Default, Clone)]
pub struct Timeline {
    messages: Vec<Record<Message>>,
    seen: HashSet<RecordId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Record<Message>] {
        &self.messages
    }

    /// Insert one message. Replays of an already seen record id are no-ops.
    pub fn apply_added(&mut self, record: Record<Message>) -> TimelineDiff {
        let was_empty = self.is_empty();
        let inserted = self.push(record);
        if inserted {
            self.sort();
        }
        TimelineDiff {
            was_empty,
            inserted_count: usize::from(inserted),
        }
    }

    /// Apply one adapted batch. Only `Added` events matter; edits and
    /// deletes are not part of the chat flow.
    pub fn apply_events(&mut self, events: Vec<ChangeEvent<Message>>) -> TimelineDiff {
        let was_empty = self.is_empty();
        let mut inserted_count = 0;
        for event in events {
            match event {
                ChangeEvent::Added(record) => {
                    if self.push(record) {
                        inserted_count += 1;
                    }
                }
                other => debug!("Ignoring non-add change for {}", other.record().id),
            }
        }
        if inserted_count > 0 {
            self.sort();
        }
        TimelineDiff {
            was_empty,
            inserted_count,
        }
    }

    fn push(&mut self, record: Record<Message>) -> bool {
        if !self.seen.insert(record.id.clone()) {
            debug!("Skipping replayed message {}", record.id);
            return false;
        }
        self.messages.push(record);
        true
    }

    fn sort(&mut self) {
        self.messages.sort_by_key(|r| r.value.timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(id: &str, body: &str, h: u32, m: u32) -> Record<Message> {
        Record {
            id: id.to_string(),
            value: Message::new(
                "alice",
                "bob",
                body,
                Utc.with_ymd_and_hms(2024, 3, 7, h, m, 0).unwrap(),
            ),
        }
    }

    fn ids(timeline: &Timeline) -> Vec<&str> {
        timeline.messages().iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_chronological_not_arrival_order() {
        let mut timeline = Timeline::new();
        let first = timeline.apply_added(record("Y", "b", 9, 59));
        let second = timeline.apply_added(record("X", "a", 10, 0));

        assert_eq!(ids(&timeline), vec!["Y", "X"]);
        assert!(first.was_empty);
        assert!(!second.was_empty);
        assert_eq!(second.inserted_count, 1);

        let mut reversed = Timeline::new();
        reversed.apply_added(record("X", "a", 10, 0));
        reversed.apply_added(record("Y", "b", 9, 59));
        assert_eq!(ids(&reversed), vec!["Y", "X"]);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut timeline = Timeline::new();
        timeline.apply_added(record("1", "a", 10, 0));
        timeline.apply_added(record("2", "b", 10, 1));
        let before: Vec<String> = ids(&timeline).iter().map(|s| s.to_string()).collect();

        let diff = timeline.apply_added(record("1", "a", 10, 0));
        assert_eq!(diff.inserted_count, 0);
        assert_eq!(ids(&timeline), before);
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut timeline = Timeline::new();
        timeline.apply_added(record("late", "z", 11, 0));
        timeline.apply_added(record("first", "a", 10, 0));
        timeline.apply_added(record("second", "b", 10, 0));
        timeline.apply_added(record("early", "y", 9, 0));

        assert_eq!(ids(&timeline), vec!["early", "first", "second", "late"]);
    }

    #[test]
    fn test_sorted_for_any_arrival_order() {
        let minutes = [7u32, 3, 9, 1, 5, 8, 2, 6, 4, 0];
        let mut timeline = Timeline::new();
        for (i, m) in minutes.iter().enumerate() {
            timeline.apply_added(record(&format!("m{}", i), "x", 12, *m));
        }
        let stamps: Vec<_> = timeline
            .messages()
            .iter()
            .map(|r| r.value.timestamp)
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(timeline.len(), minutes.len());
    }

    #[test]
    fn test_apply_events_counts_and_ignores_edits() {
        let mut timeline = Timeline::new();
        let diff = timeline.apply_events(vec![
            ChangeEvent::Added(record("1", "a", 10, 0)),
            ChangeEvent::Modified(record("2", "b", 10, 1)),
            ChangeEvent::Added(record("3", "c", 9, 0)),
            ChangeEvent::Added(record("1", "a", 10, 0)),
            ChangeEvent::Removed(record("3", "c", 9, 0)),
        ]);

        assert!(diff.is_full_repaint());
        assert_eq!(diff.inserted_count, 2);
        assert_eq!(ids(&timeline), vec!["3", "1"]);
    }

    #[test]
    fn test_empty_batch_reports_empty_state() {
        let mut timeline = Timeline::new();
        let diff = timeline.apply_events(Vec::new());
        assert_eq!(
            diff,
            TimelineDiff {
                was_empty: true,
                inserted_count: 0
            }
        );
    }
}

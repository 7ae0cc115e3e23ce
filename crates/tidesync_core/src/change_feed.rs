//! Change feed for observing committed writes.
//!
//! The store emits one event per committed transaction (or autocommit
//! statement) naming the tables it touched. Query watchers subscribe to the
//! feed to decide when to re-run.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = LocalStore::open_in_memory(schema)?;
//! let mut changes = store.changes();
//!
//! tokio::spawn(async move {
//!     while let Ok(event) = changes.recv().await {
//!         println!("commit {} touched {:?}", event.sequence, event.tables);
//!     }
//! });
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// A committed write, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Commit sequence number, starting at 1 for the first commit of this
    /// store instance.
    pub sequence: u64,
    /// Tables written by the commit, the mutation log included.
    pub tables: BTreeSet<String>,
}

impl ChangeEvent {
    /// Returns true if the commit wrote any of `tables`.
    pub fn touches<'a>(&self, tables: impl IntoIterator<Item = &'a str>) -> bool {
        tables.into_iter().any(|t| self.tables.contains(t))
    }
}

/// Distributes commit events to subscribers.
///
/// The change feed:
/// - Emits only committed writes
/// - Preserves commit order
/// - Supports multiple subscribers
/// - Never blocks the writer; slow subscribers observe a lag instead
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
    sequence: AtomicU64,
}

impl ChangeFeed {
    /// Creates a change feed buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Emits an event for a commit that wrote `tables`.
    ///
    /// Empty commits are not announced. Returns the assigned sequence.
    pub fn emit(&self, tables: BTreeSet<String>) -> Option<u64> {
        if tables.is_empty() {
            return None;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is not an error.
        let _ = self.sender.send(ChangeEvent { sequence, tables });
        Some(sequence)
    }

    /// Returns the sequence of the latest emitted event, 0 if none.
    pub fn latest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn tables(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn emit_and_receive() {
        let feed = ChangeFeed::default();
        let mut rx = feed.subscribe();

        assert_eq!(feed.emit(tables(&["tasks", "mutation_log"])), Some(1));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.sequence, 1);
        assert!(event.touches(["tasks"]));
        assert!(!event.touches(["notes"]));
    }

    #[tokio::test]
    async fn multiple_subscribers_in_order() {
        let feed = ChangeFeed::default();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();

        feed.emit(tables(&["a"]));
        feed.emit(tables(&["b"]));

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap().sequence, 1);
            assert_eq!(rx.recv().await.unwrap().sequence, 2);
        }
    }

    #[test]
    fn empty_commits_are_skipped() {
        let feed = ChangeFeed::default();
        let mut rx = feed.subscribe();
        assert_eq!(feed.emit(BTreeSet::new()), None);
        assert_eq!(feed.latest_sequence(), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::default();
        assert_eq!(feed.subscriber_count(), 0);

        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        assert_eq!(feed.subscriber_count(), 0);
        assert_eq!(feed.emit(tables(&["a"])), Some(1));
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let feed = ChangeFeed::new(2);
        let mut rx = feed.subscribe();

        for _ in 0..5 {
            feed.emit(tables(&["a"]));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
        assert_eq!(rx.recv().await.unwrap().sequence, 4);
        assert_eq!(feed.latest_sequence(), 5);
    }
}

use hive_core::StateEvent;
use tokio::sync::broadcast;

/// Fan-out channel carrying every request, subtask, and worker transition.
///
/// Subscribers that fall behind lose the oldest events (broadcast lag); the
/// feed is an observation surface, not a source of truth, so consumers that
/// need exactness re-read the ledger.
#[derive(Debug, Clone)]
pub struct StatusFeed {
    tx: broadcast::Sender<StateEvent>,
}

impl StatusFeed {
    /// Default buffered event capacity per subscriber.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Creates a feed with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a feed buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StateEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let feed = StatusFeed::new();
        feed.publish(StateEvent::WorkerJoined {
            id: Uuid::new_v4(),
            at: Utc::now(),
        });
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let feed = StatusFeed::new();
        let mut rx = feed.subscribe();

        let worker = Uuid::new_v4();
        feed.publish(StateEvent::WorkerJoined {
            id: worker,
            at: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            StateEvent::WorkerJoined { id, .. } => assert_eq!(id, worker),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers_fan_out() {
        let feed = StatusFeed::new();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();

        feed.publish(StateEvent::WorkerLeft {
            id: Uuid::new_v4(),
            at: Utc::now(),
        });

        assert!(matches!(rx1.recv().await.unwrap(), StateEvent::WorkerLeft { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), StateEvent::WorkerLeft { .. }));
    }
}

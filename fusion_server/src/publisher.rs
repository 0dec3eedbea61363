//! Fan-out of fused snapshots to subscribers.
//!
//! Each subscriber owns a bounded queue. A subscriber whose queue is full
//! when a snapshot is published is disconnected rather than allowed to
//! stall the tick; it can reconnect and gets the latest snapshot at once.

use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use tracker_core::FusedTrackSnapshot;

pub type SubscriberId = u64;

/// Receiving side handed to one subscriber.
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<Arc<str>>,
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Arc<str>>,
}

#[derive(Default)]
struct Inner {
    latest: Option<Arc<str>>,
    latest_seq: u64,
    subscribers: Vec<Subscriber>,
    next_id: SubscriberId,
}

pub struct Publisher {
    queue_depth: usize,
    inner: Mutex<Inner>,
}

impl Publisher {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a subscriber. The latest snapshot, if any, is already queued.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut inner = self.inner.lock();
        if let Some(latest) = &inner.latest {
            // Fresh channel with capacity >= 1 cannot be full.
            let _ = tx.try_send(Arc::clone(latest));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        debug!(subscriber = id, "subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.lock().subscribers.retain(|s| s.id != id);
    }

    /// Store `snapshot` as the latest and push it to every subscriber.
    /// Returns the number of subscribers it was delivered to.
    pub fn publish(&self, snapshot: &FusedTrackSnapshot) -> Result<usize> {
        let json: Arc<str> = serde_json::to_string(snapshot)?.into();
        let mut inner = self.inner.lock();
        inner.latest = Some(Arc::clone(&json));
        inner.latest_seq = snapshot.seq;

        inner.subscribers.retain(|sub| match sub.tx.try_send(Arc::clone(&json)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = sub.id, "subscriber queue full, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "subscriber gone");
                false
            }
        });
        Ok(inner.subscribers.len())
    }

    /// Latest serialized snapshot.
    pub fn latest(&self) -> Option<Arc<str>> {
        self.inner.lock().latest.clone()
    }

    pub fn latest_seq(&self) -> u64 {
        self.inner.lock().latest_seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(seq: u64) -> FusedTrackSnapshot {
        FusedTrackSnapshot {
            seq,
            timestamp: seq as f64,
            tracks: Vec::new(),
        }
    }

    fn seq_of(json: &str) -> u64 {
        serde_json::from_str::<FusedTrackSnapshot>(json).unwrap().seq
    }

    #[test]
    fn new_subscriber_sees_latest_immediately() {
        let publisher = Publisher::new(4);
        publisher.publish(&snap(7)).unwrap();
        let mut sub = publisher.subscribe();
        assert_eq!(seq_of(&sub.rx.try_recv().unwrap()), 7);
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn slow_subscriber_is_dropped() {
        let publisher = Publisher::new(2);
        let mut fast = publisher.subscribe();
        let _slow = publisher.subscribe();

        for seq in 1..=2 {
            assert_eq!(publisher.publish(&snap(seq)).unwrap(), 2);
            assert_eq!(seq_of(&fast.rx.try_recv().unwrap()), seq);
        }
        // `_slow` never drained; its queue of 2 is full now.
        assert_eq!(publisher.publish(&snap(3)).unwrap(), 1);
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(seq_of(&fast.rx.try_recv().unwrap()), 3);
    }

    #[test]
    fn closed_subscriber_is_pruned() {
        let publisher = Publisher::new(2);
        let sub = publisher.subscribe();
        drop(sub);
        assert_eq!(publisher.publish(&snap(1)).unwrap(), 0);
        assert_eq!(publisher.latest_seq(), 1);
    }
}

//! Change feed for observing written documents.
//!
//! Every bulk write publishes exactly one [`EventBulk`] to the instance's
//! feed, after the backend acknowledged the write. The feed:
//! - Publishes whole bulks, never single events
//! - Preserves publication order per subscriber
//! - Does not replay: a new subscriber only sees later bulks
//! - Drops subscribers that fall too far behind
//!
//! # Usage
//!
//! ```rust
//! use tabdb_core::{ChangeFeed, EventBulk};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let feed = ChangeFeed::new(16);
//! let mut stream = feed.subscribe();
//!
//! feed.publish(EventBulk { id: "b1".into(), events: vec![] });
//! assert_eq!(stream.recv().await.unwrap().id, "b1");
//! # }
//! ```

use crate::types::EventBulk;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError, Receiver, Sender};

/// Distributes event bulks to subscribers.
#[derive(Debug)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<Arc<EventBulk>>>>,
    buffer: usize,
}

impl ChangeFeed {
    /// Creates a feed where each subscriber buffers up to `buffer` bulks.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    /// Subscribes to bulks published from now on.
    pub fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.write().push(tx);
        ChangeStream { rx }
    }

    /// Publishes a bulk to every live subscriber.
    ///
    /// Subscribers that were dropped, or whose buffer is full, are removed.
    pub fn publish(&self, bulk: EventBulk) {
        let bulk = Arc::new(bulk);
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| match tx.try_send(Arc::clone(&bulk)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(bulk = %bulk.id, "dropping change subscriber that fell behind");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Disconnects every subscriber. Their streams end after draining.
    pub fn close(&self) {
        self.subscribers.write().clear();
    }

    /// Returns the number of connected subscribers.
    ///
    /// Dropped streams are only noticed on the next publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// A subscription to a [`ChangeFeed`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ChangeStream {
    rx: Receiver<Arc<EventBulk>>,
}

impl ChangeStream {
    /// Waits for the next bulk. Returns `None` once the feed closed this
    /// subscription and everything buffered was received.
    pub async fn recv(&mut self) -> Option<Arc<EventBulk>> {
        self.rx.recv().await
    }

    /// Returns the next buffered bulk without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<EventBulk>> {
        match self.rx.try_recv() {
            Ok(bulk) => Some(bulk),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(id: &str) -> EventBulk {
        EventBulk {
            id: id.to_string(),
            events: Vec::new(),
        }
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let feed = ChangeFeed::new(8);
        let mut stream = feed.subscribe();
        feed.publish(bulk("a"));
        assert_eq!(stream.recv().await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn multiple_subscribers_share_one_bulk() {
        let feed = ChangeFeed::new(8);
        let mut first = feed.subscribe();
        let mut second = feed.subscribe();
        feed.publish(bulk("a"));

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn no_replay_for_late_subscribers() {
        let feed = ChangeFeed::new(8);
        feed.publish(bulk("early"));
        let mut stream = feed.subscribe();
        assert!(stream.try_recv().is_none());
        feed.publish(bulk("late"));
        assert_eq!(stream.try_recv().unwrap().id, "late");
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::new(8);
        let stream = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(stream);
        feed.publish(bulk("a"));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_is_dropped() {
        let feed = ChangeFeed::new(2);
        let mut slow = feed.subscribe();
        for i in 0..3 {
            feed.publish(bulk(&i.to_string()));
        }
        assert_eq!(feed.subscriber_count(), 0);
        // what was buffered is still readable
        assert_eq!(slow.try_recv().unwrap().id, "0");
        assert_eq!(slow.try_recv().unwrap().id, "1");
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let feed = ChangeFeed::new(8);
        let mut stream = feed.subscribe();
        feed.publish(bulk("a"));
        feed.close();
        assert_eq!(stream.recv().await.unwrap().id, "a");
        assert!(stream.recv().await.is_none());
    }
}

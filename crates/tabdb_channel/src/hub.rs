//! Named broadcast channels shared by the contexts of one process.

use crate::error::{ChannelError, ChannelResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};
use uuid::Uuid;

/// Default number of envelopes buffered per channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Identity of one channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(Uuid);

impl EndpointId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which side of a channel a message travels on.
///
/// Application messages (remote requests and responses) and election
/// signals share one channel, but receivers filter by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Application message.
    Message,
    /// Election signal.
    Internal,
}

/// A message in flight.
///
/// Every envelope of a channel carries a sequence number. Sequence numbers
/// increase in the order receivers see the envelopes, so comparing two of
/// them tells which message was posted first.
#[derive(Debug, Clone)]
pub struct Envelope {
    sender: EndpointId,
    kind: MessageKind,
    sequence: u64,
    payload: Arc<str>,
}

impl Envelope {
    /// Returns the endpoint that posted this message.
    #[must_use]
    pub fn sender(&self) -> EndpointId {
        self.sender
    }

    /// Returns the message kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns the position of this envelope in its channel.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the raw JSON payload.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> ChannelResult<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug)]
struct SharedChannel {
    name: String,
    sender: broadcast::Sender<Arc<Envelope>>,
    /// Last sequence number handed out. Held while sending.
    sequence: Mutex<u64>,
    /// Leadership lock. Holds the sequence number of the last leader death.
    leadership: Arc<tokio::sync::Mutex<u64>>,
    /// Open endpoints. Only changed under the hub's channel map lock.
    endpoints: AtomicUsize,
}

#[derive(Debug)]
struct HubInner {
    capacity: usize,
    channels: Mutex<HashMap<String, Arc<SharedChannel>>>,
}

/// Registry of named channels.
///
/// A hub stands for the process: every context that wants to talk to the
/// others opens its endpoints from the same hub. Cloning is cheap and
/// clones share the channels.
///
/// # Example
///
/// ```rust
/// use tabdb_channel::ChannelHub;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let hub = ChannelHub::new();
/// let a = hub.open("tabdb-app");
/// let b = hub.open("tabdb-app");
///
/// let mut inbox = b.subscribe();
/// a.post_message(&"hello").unwrap();
/// let envelope = inbox.recv().await.unwrap();
/// assert_eq!(envelope.decode::<String>().unwrap(), "hello");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ChannelHub {
    inner: Arc<HubInner>,
}

impl ChannelHub {
    /// Creates a hub with the default buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a hub buffering `capacity` envelopes per channel.
    ///
    /// A receiver that falls further behind loses the oldest envelopes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Opens a new endpoint on the channel called `name`.
    ///
    /// The name lives in the hub until its last endpoint is dropped.
    pub fn open(&self, name: &str) -> BroadcastChannel {
        let shared = {
            let mut channels = self.inner.channels.lock();
            let shared = channels.entry(name.to_string()).or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.inner.capacity);
                Arc::new(SharedChannel {
                    name: name.to_string(),
                    sender,
                    sequence: Mutex::new(0),
                    leadership: Arc::new(tokio::sync::Mutex::new(0)),
                    endpoints: AtomicUsize::new(0),
                })
            });
            shared.endpoints.fetch_add(1, Ordering::Relaxed);
            Arc::clone(shared)
        };
        let endpoint = BroadcastChannel {
            id: EndpointId::new(),
            shared,
            hub: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        };
        tracing::trace!(channel = name, endpoint = %endpoint.id, "opened channel endpoint");
        endpoint
    }

    /// Returns the number of channel names with at least one endpoint.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a named channel.
#[derive(Debug)]
pub struct BroadcastChannel {
    id: EndpointId,
    shared: Arc<SharedChannel>,
    hub: Arc<HubInner>,
    closed: AtomicBool,
}

impl BroadcastChannel {
    /// Returns this endpoint's id.
    #[must_use]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Returns the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Posts an application message to every other endpoint and returns
    /// its sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if this endpoint is closed or the message cannot
    /// be encoded.
    pub fn post_message<T: Serialize + ?Sized>(&self, message: &T) -> ChannelResult<u64> {
        self.post(MessageKind::Message, message, None)
    }

    /// Posts an election signal to every other endpoint and returns its
    /// sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if this endpoint is closed or the message cannot
    /// be encoded.
    pub fn post_internal<T: Serialize + ?Sized>(&self, message: &T) -> ChannelResult<u64> {
        self.post(MessageKind::Internal, message, None)
    }

    /// Posts an election signal while giving up the leadership lock.
    ///
    /// The signal's sequence number is stored in the lock before it is
    /// released, and no other envelope can be sequenced between the release
    /// and the signal. The next holder of the lock therefore knows which
    /// messages were posted before the previous leadership ended.
    pub(crate) fn post_releasing<T: Serialize + ?Sized>(
        &self,
        message: &T,
        leadership: OwnedMutexGuard<u64>,
    ) -> ChannelResult<u64> {
        self.post(MessageKind::Internal, message, Some(leadership))
    }

    fn post<T: Serialize + ?Sized>(
        &self,
        kind: MessageKind,
        message: &T,
        leadership: Option<OwnedMutexGuard<u64>>,
    ) -> ChannelResult<u64> {
        if self.is_closed() {
            return Err(ChannelError::closed(self.name()));
        }
        let payload: Arc<str> = serde_json::to_string(message)?.into();

        let mut last = self.shared.sequence.lock();
        *last += 1;
        let sequence = *last;
        if let Some(mut guard) = leadership {
            *guard = sequence;
        }
        let envelope = Envelope {
            sender: self.id,
            kind,
            sequence,
            payload,
        };
        // no receivers is not an error: nobody else is listening yet
        let _ = self.shared.sender.send(Arc::new(envelope));
        Ok(sequence)
    }

    /// Returns the sequence number of the last envelope posted on this
    /// channel by any endpoint.
    pub fn last_sequence(&self) -> u64 {
        *self.shared.sequence.lock()
    }

    /// Subscribes to messages posted by other endpoints after this call.
    pub fn subscribe(&self) -> ChannelReceiver {
        ChannelReceiver {
            own: self.id,
            name: self.shared.name.clone(),
            rx: self.shared.sender.subscribe(),
        }
    }

    /// Closes this endpoint. Further posts fail; existing receivers keep
    /// draining what is buffered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns true if [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn leadership(&self) -> Arc<tokio::sync::Mutex<u64>> {
        Arc::clone(&self.shared.leadership)
    }
}

impl Drop for BroadcastChannel {
    fn drop(&mut self) {
        let mut channels = self.hub.channels.lock();
        let remaining = self.shared.endpoints.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0
            && channels
                .get(&self.shared.name)
                .is_some_and(|shared| Arc::ptr_eq(shared, &self.shared))
        {
            channels.remove(&self.shared.name);
            tracing::trace!(channel = %self.shared.name, "dropped last channel endpoint");
        }
    }
}

/// Receiving side of an endpoint subscription.
#[derive(Debug)]
pub struct ChannelReceiver {
    own: EndpointId,
    name: String,
    rx: broadcast::Receiver<Arc<Envelope>>,
}

impl ChannelReceiver {
    /// Waits for the next envelope posted by another endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Lagged`] once after this receiver lost
    /// envelopes; the next call continues with the oldest one still
    /// buffered. Returns [`ChannelError::Closed`] once every endpoint of
    /// the channel is gone.
    pub async fn recv(&mut self) -> ChannelResult<Arc<Envelope>> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.sender == self.own => continue,
                Ok(envelope) => return Ok(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.name, skipped, "channel receiver lagged");
                    return Err(ChannelError::Lagged {
                        name: self.name.clone(),
                        skipped,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ChannelError::closed(&self.name))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn messages_reach_other_endpoints() {
        let hub = ChannelHub::new();
        let a = hub.open("db");
        let b = hub.open("db");
        let c = hub.open("db");
        let mut inbox_b = b.subscribe();
        let mut inbox_c = c.subscribe();

        a.post_message(&42).unwrap();
        assert_eq!(inbox_b.recv().await.unwrap().decode::<i32>().unwrap(), 42);
        let envelope = inbox_c.recv().await.unwrap();
        assert_eq!(envelope.sender(), a.id());
        assert_eq!(envelope.kind(), MessageKind::Message);
    }

    #[tokio::test]
    async fn sender_does_not_receive_own_messages() {
        let hub = ChannelHub::new();
        let a = hub.open("db");
        let b = hub.open("db");
        let mut own = a.subscribe();

        a.post_message(&"mine").unwrap();
        b.post_internal(&"theirs").unwrap();

        let envelope = own.recv().await.unwrap();
        assert_eq!(envelope.payload(), "\"theirs\"");
        assert_eq!(envelope.kind(), MessageKind::Internal);
    }

    #[tokio::test]
    async fn channels_are_separated_by_name() {
        let hub = ChannelHub::new();
        let a = hub.open("one");
        let b = hub.open("two");
        let mut inbox = b.subscribe();

        a.post_message(&1).unwrap();
        assert!(timeout(Duration::from_millis(50), inbox.recv()).await.is_err());
        assert_eq!(hub.channel_count(), 2);
    }

    #[tokio::test]
    async fn closed_endpoint_cannot_post() {
        let hub = ChannelHub::new();
        let a = hub.open("db");
        a.close();
        assert!(matches!(a.post_message(&1), Err(ChannelError::Closed { .. })));
    }

    #[tokio::test]
    async fn lagging_receiver_skips_ahead() {
        let hub = ChannelHub::with_capacity(2);
        let a = hub.open("db");
        let b = hub.open("db");
        let mut inbox = b.subscribe();
        for i in 0..5 {
            a.post_message(&i).unwrap();
        }
        let lagged = inbox.recv().await.unwrap_err();
        assert!(matches!(lagged, ChannelError::Lagged { skipped: 3, .. }));
        let first = inbox.recv().await.unwrap().decode::<i32>().unwrap();
        assert_eq!(first, 3);
    }

    #[tokio::test]
    async fn sequence_numbers_follow_delivery_order() {
        let hub = ChannelHub::new();
        let a = hub.open("db");
        let b = hub.open("db");
        let c = hub.open("db");
        let mut inbox = c.subscribe();

        let first = a.post_message(&"a").unwrap();
        let second = b.post_internal(&"b").unwrap();
        let third = a.post_message(&"c").unwrap();
        assert!(first < second && second < third);
        assert_eq!(c.last_sequence(), third);

        for expected in [first, second, third] {
            assert_eq!(inbox.recv().await.unwrap().sequence(), expected);
        }
    }

    #[tokio::test]
    async fn releasing_leadership_stamps_the_lock() {
        let hub = ChannelHub::new();
        let a = hub.open("db");
        let b = hub.open("db");

        let guard = a.leadership().try_lock_owned().unwrap();
        a.post_message(&"before").unwrap();
        let death = a.post_releasing(&"death", guard).unwrap();

        let next = b.leadership().try_lock_owned().unwrap();
        assert_eq!(*next, death);
        assert!(b.post_message(&"after").unwrap() > death);
    }

    #[tokio::test]
    async fn names_are_dropped_with_their_last_endpoint() {
        let hub = ChannelHub::new();
        let a = hub.open("db");
        let b = hub.open("db");
        let mut inbox = b.subscribe();
        assert_eq!(hub.channel_count(), 1);

        drop(a);
        assert_eq!(hub.channel_count(), 1);
        drop(b);
        assert_eq!(hub.channel_count(), 0);
        assert!(matches!(inbox.recv().await, Err(ChannelError::Closed { .. })));

        // reopening starts a fresh channel
        let c = hub.open("db");
        assert_eq!(c.last_sequence(), 0);
    }
}

//! Leader election over a broadcast channel.

use crate::error::{ChannelError, ChannelResult};
use crate::hub::{BroadcastChannel, ChannelReceiver, MessageKind};
use crate::message::InternalMessage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Election state of one elector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// No leader is known.
    NoLeader,
    /// Trying to take the leadership lock.
    Applying,
    /// This elector leads.
    Leader,
    /// Another elector leads.
    Follower,
    /// The elector was closed.
    Closed,
}

impl ElectionState {
    /// Returns true if some elector (this one or another) is known to lead.
    #[must_use]
    pub const fn has_leader(self) -> bool {
        matches!(self, Self::Leader | Self::Follower)
    }

    /// Returns true if this elector leads.
    #[must_use]
    pub const fn is_leader(self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// Elects one leader among the endpoints of a channel.
///
/// Leadership is a lock shared by every endpoint of the channel name. The
/// winner keeps it until [`close`](Self::close), then posts a leader death
/// signal. Followers wait for that signal, mark it as processed and apply
/// again.
///
/// # Invariants
///
/// - at most one elector per channel name is `Leader` at any time
/// - the lock is released before the death signal is posted, so a
///   follower reacting to the signal can always win the next round
/// - a new leader knows the sequence number of the last death signal
///   (its [fence](Self::leadership_fence)); everything posted before it
///   was addressed to an earlier leader
///
/// Must be started inside a tokio runtime.
#[derive(Debug)]
pub struct LeaderElector {
    channel: Arc<BroadcastChannel>,
    state: watch::Receiver<ElectionState>,
    shutdown: watch::Sender<bool>,
    log: Arc<ElectionLog>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct ElectionLog {
    /// Sequence number of the last death before this elector took the lock.
    fence: AtomicU64,
    /// Every death signal up to this sequence number has been handled.
    settled_through: AtomicU64,
    tokens: Mutex<HashSet<String>>,
}

impl ElectionLog {
    fn settle(&self, sequence: u64) {
        self.settled_through.fetch_max(sequence, Ordering::SeqCst);
    }
}

impl LeaderElector {
    /// Starts electing on `channel`.
    pub fn start(channel: BroadcastChannel) -> Self {
        let channel = Arc::new(channel);
        let (state_tx, state_rx) = watch::channel(ElectionState::NoLeader);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let log = Arc::new(ElectionLog::default());

        // subscribed before spawning so no death signal can slip past
        let inbox = channel.subscribe();
        let task = tokio::spawn(run_election(
            Arc::clone(&channel),
            inbox,
            state_tx,
            shutdown_rx,
            Arc::clone(&log),
        ));

        Self {
            channel,
            state: state_rx,
            shutdown: shutdown_tx,
            log,
            task: Mutex::new(Some(task)),
        }
    }

    /// Returns the channel this elector runs on.
    pub fn channel(&self) -> &BroadcastChannel {
        &self.channel
    }

    /// Returns the current state.
    pub fn state(&self) -> ElectionState {
        *self.state.borrow()
    }

    /// Returns true if some elector is known to lead.
    pub fn has_leader(&self) -> bool {
        self.state().has_leader()
    }

    /// Returns true if this elector leads.
    pub fn is_leader(&self) -> bool {
        self.state().is_leader()
    }

    /// Returns a receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ElectionState> {
        self.state.clone()
    }

    /// Returns true if this elector has reacted to the death signal
    /// carrying `token`.
    pub fn has_processed_death(&self, token: &str) -> bool {
        self.log.tokens.lock().contains(token)
    }

    /// Returns the sequence number of the last leader death posted before
    /// this elector took the lock.
    ///
    /// Messages with a sequence number up to the fence were posted while an
    /// earlier leader held the lock. Their senders saw that leader die after
    /// posting and retry on their own, so a leader must not answer them.
    /// Meaningful while [`is_leader`](Self::is_leader) holds.
    pub fn leadership_fence(&self) -> u64 {
        self.log.fence.load(Ordering::SeqCst)
    }

    /// Waits until some elector leads.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if this elector closes first.
    pub async fn wait_for_leader(&self) -> ChannelResult<()> {
        match self.wait_until(ElectionState::has_leader).await {
            ElectionState::Closed => Err(ChannelError::closed(self.channel.name())),
            _ => Ok(()),
        }
    }

    /// Waits until this elector leads.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if this elector closes first.
    pub async fn await_leadership(&self) -> ChannelResult<()> {
        match self.wait_until(ElectionState::is_leader).await {
            ElectionState::Closed => Err(ChannelError::closed(self.channel.name())),
            _ => Ok(()),
        }
    }

    /// Waits until this elector either leads or has reacted to the death
    /// signal with the given sequence number. Returns immediately once
    /// closed.
    pub async fn settle_death(&self, sequence: u64) {
        let mut rx = self.state.clone();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_leader()
                || state == ElectionState::Closed
                || self.log.settled_through.load(Ordering::SeqCst) >= sequence
            {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn wait_until(&self, done: impl Fn(ElectionState) -> bool) -> ElectionState {
        let mut rx = self.state.clone();
        loop {
            let state = *rx.borrow_and_update();
            if done(state) || state == ElectionState::Closed {
                return state;
            }
            if rx.changed().await.is_err() {
                return ElectionState::Closed;
            }
        }
    }

    /// Stops electing. A leader releases the lock and posts its death
    /// signal before this returns.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(channel = self.channel.name(), error = %e, "election task failed");
            }
        }
        self.channel.close();
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn run_election(
    channel: Arc<BroadcastChannel>,
    mut inbox: ChannelReceiver,
    state: watch::Sender<ElectionState>,
    mut shutdown: watch::Receiver<bool>,
    log: Arc<ElectionLog>,
) {
    let lock = channel.leadership();
    loop {
        state.send_replace(ElectionState::Applying);
        match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => {
                log.fence.store(*guard, Ordering::SeqCst);
                log.settle(*guard);
                state.send_replace(ElectionState::Leader);
                tracing::info!(channel = channel.name(), fence = *guard, "elected leader");
                shutdown_requested(&mut shutdown).await;

                let token = Uuid::new_v4().to_string();
                match channel.post_releasing(&InternalMessage::leader_death(&token), guard) {
                    Ok(sequence) => {
                        tracing::info!(channel = channel.name(), %token, sequence, "leader stepped down");
                    }
                    Err(e) => {
                        tracing::warn!(channel = channel.name(), error = %e, "failed to post leader death");
                    }
                }
                break;
            }
            Err(_) => {
                state.send_replace(ElectionState::Follower);
                tokio::select! {
                    () = shutdown_requested(&mut shutdown) => break,
                    death = next_leader_death(&mut inbox) => match death {
                        Ok((sequence, token)) => {
                            tracing::debug!(channel = channel.name(), %token, sequence, "leader died");
                            // NoLeader must be visible before the death counts as settled
                            state.send_replace(ElectionState::NoLeader);
                            log.tokens.lock().insert(token);
                            log.settle(sequence);
                        }
                        Err(e) if e.is_lagged() => {
                            // a death signal may be among the lost envelopes
                            state.send_replace(ElectionState::NoLeader);
                            log.settle(channel.last_sequence());
                        }
                        Err(_) => break,
                    },
                }
            }
        }
    }
    state.send_replace(ElectionState::Closed);
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Waits for the next leader death and returns its sequence number and
/// token.
async fn next_leader_death(inbox: &mut ChannelReceiver) -> ChannelResult<(u64, String)> {
    loop {
        let envelope = inbox.recv().await?;
        if envelope.kind() != MessageKind::Internal {
            continue;
        }
        match envelope.decode::<InternalMessage>() {
            Ok(message) if message.is_leader_death() => {
                return Ok((envelope.sequence(), message.token))
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "ignoring malformed internal message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ChannelHub;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn single_elector_becomes_leader() {
        let hub = ChannelHub::new();
        let elector = LeaderElector::start(hub.open("db"));
        timeout(WAIT, elector.await_leadership()).await.unwrap().unwrap();
        assert!(elector.is_leader());
        assert!(elector.has_leader());
    }

    #[tokio::test]
    async fn only_one_leader_per_channel() {
        let hub = ChannelHub::new();
        let electors: Vec<_> = (0..4).map(|_| LeaderElector::start(hub.open("db"))).collect();
        for elector in &electors {
            timeout(WAIT, elector.wait_for_leader()).await.unwrap().unwrap();
        }
        let leaders = electors.iter().filter(|e| e.is_leader()).count();
        assert_eq!(leaders, 1);
    }

    #[tokio::test]
    async fn follower_takes_over_after_leader_closes() {
        let hub = ChannelHub::new();
        let first = LeaderElector::start(hub.open("db"));
        timeout(WAIT, first.await_leadership()).await.unwrap().unwrap();

        let second = LeaderElector::start(hub.open("db"));
        timeout(WAIT, second.wait_for_leader()).await.unwrap().unwrap();
        assert_eq!(second.state(), ElectionState::Follower);

        let mut observer = hub.open("db").subscribe();
        first.close().await;
        assert_eq!(first.state(), ElectionState::Closed);

        timeout(WAIT, second.await_leadership()).await.unwrap().unwrap();

        // the death signal went out and the follower recorded it
        let envelope = timeout(WAIT, observer.recv()).await.unwrap().unwrap();
        let death: InternalMessage = envelope.decode().unwrap();
        assert!(death.is_leader_death());
        assert!(second.has_processed_death(&death.token));
        assert_eq!(second.leadership_fence(), envelope.sequence());
    }

    #[tokio::test]
    async fn fence_covers_messages_posted_to_the_old_leader() {
        let hub = ChannelHub::new();
        let first = LeaderElector::start(hub.open("db"));
        timeout(WAIT, first.await_leadership()).await.unwrap().unwrap();
        assert_eq!(first.leadership_fence(), 0);

        let second = LeaderElector::start(hub.open("db"));
        timeout(WAIT, second.wait_for_leader()).await.unwrap().unwrap();
        let sender = hub.open("db");
        let stale = sender.post_message(&"for the first leader").unwrap();

        first.close().await;
        timeout(WAIT, second.await_leadership()).await.unwrap().unwrap();
        let fresh = sender.post_message(&"for the second leader").unwrap();

        assert!(stale <= second.leadership_fence());
        assert!(fresh > second.leadership_fence());
    }

    #[tokio::test]
    async fn lagging_follower_applies_again() {
        let hub = ChannelHub::with_capacity(2);
        let first = LeaderElector::start(hub.open("db"));
        timeout(WAIT, first.await_leadership()).await.unwrap().unwrap();
        let second = LeaderElector::start(hub.open("db"));
        timeout(WAIT, second.wait_for_leader()).await.unwrap().unwrap();

        // bury the death signal under chatter the follower cannot buffer
        let noise = hub.open("db");
        first.close().await;
        for i in 0..8 {
            noise.post_message(&i).unwrap();
        }

        timeout(WAIT, second.await_leadership()).await.unwrap().unwrap();
        // the death was the first envelope of the channel
        assert_eq!(second.leadership_fence(), 1);
    }

    #[tokio::test]
    async fn closed_elector_stops_waiting() {
        let hub = ChannelHub::new();
        let first = LeaderElector::start(hub.open("db"));
        timeout(WAIT, first.await_leadership()).await.unwrap().unwrap();

        let second = LeaderElector::start(hub.open("db"));
        timeout(WAIT, second.wait_for_leader()).await.unwrap().unwrap();
        second.close().await;

        let result = timeout(WAIT, second.await_leadership()).await.unwrap();
        assert!(matches!(result, Err(ChannelError::Closed { .. })));
        // a closed follower never posts a death signal, so the leader stays
        assert!(first.is_leader());
    }

    #[tokio::test]
    async fn settle_death_returns_for_leader_and_unseen_deaths_wait() {
        let hub = ChannelHub::new();
        let leader = LeaderElector::start(hub.open("db"));
        timeout(WAIT, leader.await_leadership()).await.unwrap().unwrap();
        timeout(WAIT, leader.settle_death(u64::MAX)).await.unwrap();

        let follower = LeaderElector::start(hub.open("db"));
        timeout(WAIT, follower.wait_for_leader()).await.unwrap().unwrap();
        assert!(timeout(Duration::from_millis(50), follower.settle_death(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn separate_channels_elect_separately() {
        let hub = ChannelHub::new();
        let a = LeaderElector::start(hub.open("one"));
        let b = LeaderElector::start(hub.open("two"));
        timeout(WAIT, a.await_leadership()).await.unwrap().unwrap();
        timeout(WAIT, b.await_leadership()).await.unwrap().unwrap();
    }
}

//! # TabDB Channel
//!
//! Inter-context messaging and leader election for TabDB.
//!
//! Several contexts of one process (tabs, workers) that open the same
//! physical database talk to each other over a named [`BroadcastChannel`].
//! A message posted on a channel reaches every other endpoint of the same
//! name, never the endpoint that posted it.
//!
//! On top of a channel, a [`LeaderElector`] decides which context leads:
//!
//! ```text
//! NoLeader ──▶ Applying ──▶ Leader
//!                  │
//!                  └──────▶ Follower ──(leader death)──▶ NoLeader
//! ```
//!
//! The leader holds the channel's leadership lock until it closes, then
//! posts a `{context: "leader", action: "death"}` signal so followers
//! re-apply.
//!
//! Every envelope carries a per-channel sequence number. Senders compare
//! the sequence of their own post with that of a death signal to tell
//! whether the dead leader could have been the one to answer, and a new
//! leader ignores messages sequenced before its
//! [fence](LeaderElector::leadership_fence).
//!
//! ## Example
//!
//! ```rust
//! use tabdb_channel::{ChannelHub, LeaderElector};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let hub = ChannelHub::new();
//! let first = LeaderElector::start(hub.open("tabdb-app"));
//! let second = LeaderElector::start(hub.open("tabdb-app"));
//!
//! first.wait_for_leader().await.unwrap();
//! second.wait_for_leader().await.unwrap();
//! assert!(first.is_leader() != second.is_leader());
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod elector;
mod error;
mod hub;
mod message;

pub use elector::{ElectionState, LeaderElector};
pub use error::{ChannelError, ChannelResult};
pub use hub::{BroadcastChannel, ChannelHub, ChannelReceiver, EndpointId, Envelope, MessageKind};
pub use message::InternalMessage;

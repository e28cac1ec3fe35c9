//! # TabDB Core
//!
//! The storage layer of TabDB: storage instances shared safely by several
//! contexts (tabs, workers) of one process.
//!
//! This crate provides:
//! - [`StorageInstance`]: bulk writes with per-row conflicts, point reads
//!   and a change event stream
//! - Leader election per database name, shared by all instances of a
//!   context through a reference-counted registry
//! - Forwarding of operations from followers to the leader, with a retry
//!   of the whole operation when the leader dies
//! - [`Crypter`]: field-level encryption through a pluggable
//!   [`StringCipher`]
//! - [`DeterministicSort`]: a total document order with the primary key as
//!   tiebreaker
//!
//! ## Architecture
//!
//! ```text
//! caller ──▶ StorageInstance ──▶ must_use_local_state
//!                                    │
//!                    ┌───────────────┴───────────────┐
//!                 leader                          follower
//!                    │                               │
//!           backend + ChangeFeed          request ──▶ channel ──▶ leader
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod crypter;
pub mod crypto;
mod error;
mod instance;
mod registry;
pub mod remote;
mod sort;
mod storage;
mod types;
mod util;

pub use change_feed::{ChangeFeed, ChangeStream};
pub use config::{CrypterConfig, InstanceKind, InstanceParams, StorageConfig};
pub use crypter::{Crypter, StringCipher};
pub use error::{CoreError, CoreResult, RemoteErrorPayload};
pub use instance::{Route, StorageInstance};
pub use registry::ElectorRegistry;
pub use remote::{CallOutput, RemoteCall};
pub use sort::{compare_values, DeterministicSort, SortDirection};
pub use storage::Storage;
pub use types::{
    event_key, ChangeEvent, ChangeOperation, EventBulk, StorageChangeEvent, WriteResult,
};

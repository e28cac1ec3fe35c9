//! # TabDB Testkit
//!
//! Test utilities for TabDB.
//!
//! This crate provides:
//! - A multi-context harness: several [`Storage`](tabdb_core::Storage)
//!   contexts sharing one channel hub and one backend store
//! - Document builders and a reversible test cipher
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tabdb_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn follower_forwards() {
//!     let contexts = Contexts::new();
//!     let leader = contexts.context().create_instance(humans()).await.unwrap();
//!     // ...
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;

//! # TabDB Storage
//!
//! Document model and storage backend contract for TabDB.
//!
//! This crate provides the lowest-level storage abstraction. A backend stores
//! documents by primary key and rejects writes whose declared previous
//! revision does not match the stored one. It does not keep a change log;
//! change events are synthesized one layer up from write outcomes.
//!
//! ## Design Principles
//!
//! - Backends are keyed document stores (bulk write, point read)
//! - Revisions are assigned by the backend on every successful write
//! - Conflicts are per-row data, never a failed call
//! - Must be `Send + Sync` so a connection can be shared across tasks
//!
//! ## Available Backends
//!
//! - [`InMemoryStore`] - Process-shared in-memory collections
//! - [`FileStore`] - JSON snapshot files with an exclusive lock per connection
//!
//! ## Example
//!
//! ```rust
//! use tabdb_storage::{BackendFactory, BackendParams, Document, InMemoryStore, WriteRow};
//!
//! let store = InMemoryStore::new();
//! let backend = store.open(&BackendParams::new("app", "humans", "id")).unwrap();
//!
//! let doc = Document::new().with("id", "alice").with("age", 31);
//! let outcome = backend.bulk_write(&[WriteRow::insert(doc)]).unwrap();
//! let written = outcome[0].as_ref().unwrap();
//! assert!(written.revision().unwrap().starts_with("1-"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod document;
mod error;
mod file;
mod memory;
pub mod revision;
mod write;

pub use backend::{BackendFactory, BackendParams, RowOutcome, StorageBackend};
pub use document::{
    Attachment, Attachments, Document, ATTACHMENTS_FIELD, DELETED_FIELD, REVISION_FIELD,
};
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, FileStore};
pub use memory::{InMemoryBackend, InMemoryStore};
pub use revision::{ConflictReason, WriteKind};
pub use write::{ConflictError, WriteRow, CONFLICT_STATUS};

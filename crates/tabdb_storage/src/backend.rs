//! Storage backend trait definitions.

use std::fmt;
use std::sync::Arc;

use crate::document::Document;
use crate::error::StorageResult;
use crate::write::{ConflictError, WriteRow};

/// Outcome of one row of a bulk write.
pub type RowOutcome = Result<Document, ConflictError>;

/// One open connection to a stored collection.
///
/// Backends store whole documents by primary key. They are not required to
/// keep a change log: the instance layer derives change events from the
/// outcomes returned by [`bulk_write`](StorageBackend::bulk_write).
///
/// # Invariants
///
/// - `bulk_write` returns exactly one outcome per input row, in input order
/// - a successful row carries a freshly assigned revision
/// - rows of one call are applied in order, so a later row sees the effect
///   of an earlier one
/// - data outlives the connection; only [`BackendFactory::destroy`] drops it
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Returns the dotted path of the primary key.
    fn primary_path(&self) -> &str;

    /// Writes `rows`, checking each row's previous revision.
    ///
    /// # Errors
    ///
    /// Returns an error if a row has no primary key, the connection is
    /// closed, or the write cannot be made durable. Revision conflicts are
    /// not errors; they are reported per row.
    fn bulk_write(&self, rows: &[WriteRow]) -> StorageResult<Vec<RowOutcome>>;

    /// Reads documents by primary key. Unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    fn find_by_ids(&self, ids: &[String], with_deleted: bool) -> StorageResult<Vec<Document>>;

    /// Returns the number of stored documents, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    fn count(&self) -> StorageResult<usize>;

    /// Closes the connection. Stored data is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if pending data cannot be flushed.
    fn close(&self) -> StorageResult<()>;
}

/// Identifies the collection a connection is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendParams {
    /// Physical database name.
    pub database_name: String,
    /// Collection (or key/value namespace) name.
    pub collection_name: String,
    /// Dotted path of the primary key.
    pub primary_path: String,
}

impl BackendParams {
    /// Creates backend parameters.
    pub fn new(
        database_name: impl Into<String>,
        collection_name: impl Into<String>,
        primary_path: impl Into<String>,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            collection_name: collection_name.into(),
            primary_path: primary_path.into(),
        }
    }
}

/// Opens connections to stored collections.
///
/// One factory value represents one physical store. Every context of the
/// process that shares the store shares the factory.
pub trait BackendFactory: Send + Sync + fmt::Debug {
    /// Opens a connection to the collection named by `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be opened.
    fn open(&self, params: &BackendParams) -> StorageResult<Arc<dyn StorageBackend>>;

    /// Deletes all stored data of a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be removed.
    fn destroy(&self, database_name: &str, collection_name: &str) -> StorageResult<()>;
}

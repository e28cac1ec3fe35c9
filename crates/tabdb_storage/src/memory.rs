//! In-memory storage backend.

use crate::backend::{BackendFactory, BackendParams, RowOutcome, StorageBackend};
use crate::document::Document;
use crate::error::{StorageError, StorageResult};
use crate::revision;
use crate::write::{ConflictError, WriteRow};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Collection = Arc<RwLock<BTreeMap<String, Document>>>;

/// A process-shared in-memory store.
///
/// Collections live as long as the store, so closing a connection and
/// opening a new one sees the same data. This stands in for a persistent
/// engine shared by several contexts of one process and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral databases that don't need persistence
///
/// # Example
///
/// ```rust
/// use tabdb_storage::{BackendFactory, BackendParams, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// let params = BackendParams::new("app", "todos", "id");
/// let backend = store.open(&params).unwrap();
/// assert_eq!(backend.count().unwrap(), 0);
/// assert_eq!(store.open_count("app", "todos"), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: Mutex<HashMap<(String, String), Collection>>,
    opened: Mutex<HashMap<(String, String), usize>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many connections were ever opened for a collection.
    pub fn open_count(&self, database_name: &str, collection_name: &str) -> usize {
        self.opened
            .lock()
            .get(&(database_name.to_string(), collection_name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Returns the number of stored documents of a collection, without
    /// opening a connection.
    pub fn document_count(&self, database_name: &str, collection_name: &str) -> usize {
        self.collections
            .lock()
            .get(&(database_name.to_string(), collection_name.to_string()))
            .map(|docs| docs.read().len())
            .unwrap_or(0)
    }
}

impl BackendFactory for InMemoryStore {
    fn open(&self, params: &BackendParams) -> StorageResult<Arc<dyn StorageBackend>> {
        let key = (params.database_name.clone(), params.collection_name.clone());
        let docs = Arc::clone(self.collections.lock().entry(key.clone()).or_default());
        *self.opened.lock().entry(key).or_insert(0) += 1;
        Ok(Arc::new(InMemoryBackend::with_collection(
            params.primary_path.clone(),
            docs,
        )))
    }

    fn destroy(&self, database_name: &str, collection_name: &str) -> StorageResult<()> {
        let key = (database_name.to_string(), collection_name.to_string());
        if let Some(docs) = self.collections.lock().remove(&key) {
            // connections still holding the map must observe the removal
            docs.write().clear();
        }
        Ok(())
    }
}

/// An in-memory connection to one collection.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads. A bulk
/// write holds the collection's write lock for the whole batch.
#[derive(Debug)]
pub struct InMemoryBackend {
    primary_path: String,
    docs: Collection,
    closed: AtomicBool,
}

impl InMemoryBackend {
    /// Creates a standalone backend with its own empty collection.
    #[must_use]
    pub fn new(primary_path: impl Into<String>) -> Self {
        Self::with_collection(primary_path.into(), Collection::default())
    }

    fn with_collection(primary_path: String, docs: Collection) -> Self {
        Self {
            primary_path,
            docs,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn primary_path(&self) -> &str {
        &self.primary_path
    }

    fn bulk_write(&self, rows: &[WriteRow]) -> StorageResult<Vec<RowOutcome>> {
        self.ensure_open()?;
        let ids = rows
            .iter()
            .map(|row| row.document.require_primary(&self.primary_path).map(str::to_string))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut docs = self.docs.write();
        let outcomes: Vec<RowOutcome> = rows
            .iter()
            .zip(ids)
            .map(|(row, id)| match revision::apply(row, docs.get(&id))? {
                Ok((_, written)) => {
                    docs.insert(id, written.clone());
                    Ok(Ok(written))
                }
                Err(reason) => Ok(Err(ConflictError::new(id, row.clone(), reason))),
            })
            .collect::<StorageResult<_>>()?;
        Ok(outcomes)
    }

    fn find_by_ids(&self, ids: &[String], with_deleted: bool) -> StorageResult<Vec<Document>> {
        self.ensure_open()?;
        let docs = self.docs.read();
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(id))
            .filter(|doc| with_deleted || !doc.is_deleted())
            .cloned()
            .collect())
    }

    fn count(&self) -> StorageResult<usize> {
        self.ensure_open()?;
        Ok(self.docs.read().len())
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

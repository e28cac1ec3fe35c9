//! File-based storage backend for persistent storage.

use crate::backend::{BackendFactory, BackendParams, RowOutcome, StorageBackend};
use crate::document::Document;
use crate::error::{StorageError, StorageResult};
use crate::revision;
use crate::write::{ConflictError, WriteRow};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// A store that keeps every collection in a JSON snapshot file.
///
/// Layout: `<root>/<database>/<collection>.json`, plus a
/// `<collection>.lock` file that the open connection holds exclusively.
/// Only one connection per collection can be open at a time, which matches
/// the rule that only the leading context holds the live connection.
///
/// Destroying a collection whose connection is open through this store
/// empties that connection in place and leaves its lock alone. A lock file
/// held by anyone else is never deleted.
///
/// # Example
///
/// ```no_run
/// use tabdb_storage::{BackendFactory, BackendParams, FileStore};
///
/// let store = FileStore::new("/tmp/tabdb");
/// let backend = store.open(&BackendParams::new("app", "humans", "id")).unwrap();
/// println!("{} documents", backend.count().unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    /// Connections opened through this store, by snapshot path.
    live: Arc<Mutex<HashMap<PathBuf, Weak<FileBackend>>>>,
}

impl FileStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, database_name: &str, collection_name: &str) -> PathBuf {
        self.root
            .join(database_name)
            .join(format!("{collection_name}.json"))
    }

    fn lock_path(&self, database_name: &str, collection_name: &str) -> PathBuf {
        self.root
            .join(database_name)
            .join(format!("{collection_name}.lock"))
    }

    fn live_backend(&self, data_path: &Path) -> Option<Arc<FileBackend>> {
        self.live
            .lock()
            .get(data_path)
            .and_then(Weak::upgrade)
            .filter(|backend| backend.is_open())
    }
}

impl BackendFactory for FileStore {
    fn open(&self, params: &BackendParams) -> StorageResult<Arc<dyn StorageBackend>> {
        let data_path = self.data_path(&params.database_name, &params.collection_name);
        let backend = Arc::new(FileBackend::open(
            &data_path,
            &self.lock_path(&params.database_name, &params.collection_name),
            params.primary_path.clone(),
        )?);

        let mut live = self.live.lock();
        live.retain(|_, backend| backend.strong_count() > 0);
        live.insert(data_path, Arc::downgrade(&backend));
        Ok(backend)
    }

    fn destroy(&self, database_name: &str, collection_name: &str) -> StorageResult<()> {
        let data_path = self.data_path(database_name, collection_name);
        if let Some(backend) = self.live_backend(&data_path) {
            return backend.clear();
        }

        remove_if_exists(&data_path)?;
        let lock_path = self.lock_path(database_name, collection_name);
        let lock_file = match OpenOptions::new().read(true).write(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if lock_file.try_lock_exclusive().is_err() {
            tracing::debug!(path = %lock_path.display(), "lock file is held, keeping it");
            return Ok(());
        }
        remove_if_exists(&lock_path)?;
        lock_file.unlock()?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// A connection to one collection snapshot file.
///
/// # Durability
///
/// Every bulk write rewrites the snapshot to a temporary file, syncs it and
/// renames it over the old one. The in-memory view only changes after the
/// rename succeeded.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    primary_path: String,
    docs: RwLock<BTreeMap<String, Document>>,
    lock: Mutex<Option<File>>,
}

impl FileBackend {
    /// Opens the snapshot at `path`, taking the exclusive lock at
    /// `lock_path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another connection holds the
    /// lock, or an error if the snapshot cannot be read.
    pub fn open(path: &Path, lock_path: &Path, primary_path: String) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;
        lock_file.try_lock_exclusive().map_err(|_| StorageError::Locked {
            path: lock_path.to_path_buf(),
        })?;

        let docs = match fs::read(path) {
            Ok(bytes) => Self::decode_snapshot(&bytes, &primary_path)?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), documents = docs.len(), "opened file backend");

        Ok(Self {
            path: path.to_path_buf(),
            primary_path,
            docs: RwLock::new(docs),
            lock: Mutex::new(Some(lock_file)),
        })
    }

    /// Returns the path to the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode_snapshot(bytes: &[u8], primary_path: &str) -> StorageResult<BTreeMap<String, Document>> {
        let documents: Vec<Document> = serde_json::from_slice(bytes)
            .map_err(|e| StorageError::corrupted(format!("unreadable snapshot: {e}")))?;
        documents
            .into_iter()
            .map(|doc| Ok((doc.require_primary(primary_path)?.to_string(), doc)))
            .collect()
    }

    fn persist(&self, docs: &BTreeMap<String, Document>) -> StorageResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let snapshot: Vec<&Document> = docs.values().collect();
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer(&mut file, &snapshot)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock.lock().is_some()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if !self.is_open() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Drops every document and the snapshot file. The connection stays
    /// open and keeps its lock.
    fn clear(&self) -> StorageResult<()> {
        self.ensure_open()?;
        let mut docs = self.docs.write();
        remove_if_exists(&self.path)?;
        docs.clear();
        tracing::debug!(path = %self.path.display(), "cleared open file backend");
        Ok(())
    }
}

impl StorageBackend for FileBackend {
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
        let mut next = docs.clone();
        let outcomes: Vec<RowOutcome> = rows
            .iter()
            .zip(ids)
            .map(|(row, id)| match revision::apply(row, next.get(&id))? {
                Ok((_, written)) => {
                    next.insert(id, written.clone());
                    Ok(Ok(written))
                }
                Err(reason) => Ok(Err(ConflictError::new(id, row.clone(), reason))),
            })
            .collect::<StorageResult<_>>()?;

        if outcomes.iter().any(Result::is_ok) {
            self.persist(&next)?;
            *docs = next;
        }
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
        if let Some(file) = self.lock.lock().take() {
            file.unlock()?;
        }
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if let Some(file) = self.lock.get_mut().take() {
            let _ = file.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params() -> BackendParams {
        BackendParams::new("app", "humans", "id")
    }

    fn human(id: &str) -> Document {
        Document::new().with("id", id).with("age", 30)
    }

    #[test]
    fn file_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let backend = store.open(&params()).unwrap();
        let outcome = backend.bulk_write(&[WriteRow::insert(human("a"))]).unwrap();
        let written = outcome[0].clone().unwrap();
        backend.close().unwrap();

        let reopened = store.open(&params()).unwrap();
        let found = reopened.find_by_ids(&["a".to_string()], false).unwrap();
        assert_eq!(found, vec![written]);
    }

    #[test]
    fn file_second_connection_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let first = store.open(&params()).unwrap();
        let second = store.open(&params());
        assert!(matches!(second, Err(StorageError::Locked { .. })));

        first.close().unwrap();
        assert!(store.open(&params()).is_ok());
    }

    #[test]
    fn file_conflicts_do_not_rewrite_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let backend = store.open(&params()).unwrap();
        backend.bulk_write(&[WriteRow::insert(human("a"))]).unwrap();

        let data_path = dir.path().join("app").join("humans.json");
        let before = fs::metadata(&data_path).unwrap().modified().unwrap();
        let outcome = backend.bulk_write(&[WriteRow::insert(human("a"))]).unwrap();
        assert!(outcome[0].is_err());
        let after = fs::metadata(&data_path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn file_destroy_removes_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let backend = store.open(&params()).unwrap();
        backend.bulk_write(&[WriteRow::insert(human("a"))]).unwrap();
        backend.close().unwrap();

        store.destroy("app", "humans").unwrap();
        assert!(!dir.path().join("app").join("humans.json").exists());
        assert_eq!(store.open(&params()).unwrap().count().unwrap(), 0);

        // destroying twice is fine
        store.destroy("app", "humans").unwrap();
    }

    #[test]
    fn file_destroy_empties_the_open_connection() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let backend = store.open(&params()).unwrap();
        backend.bulk_write(&[WriteRow::insert(human("a"))]).unwrap();

        store.destroy("app", "humans").unwrap();
        assert_eq!(backend.count().unwrap(), 0);
        assert!(backend.find_by_ids(&["a".to_string()], true).unwrap().is_empty());

        // the lock is still held by the open connection
        assert!(dir.path().join("app").join("humans.lock").exists());
        assert!(matches!(store.open(&params()), Err(StorageError::Locked { .. })));

        backend.bulk_write(&[WriteRow::insert(human("b"))]).unwrap();
        backend.close().unwrap();

        let reopened = store.open(&params()).unwrap();
        let ids = ["a".to_string(), "b".to_string()];
        let found = reopened.find_by_ids(&ids, true).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].primary("id"), Some("b"));
    }

    #[test]
    fn file_destroy_keeps_a_lock_held_elsewhere() {
        let dir = TempDir::new().unwrap();
        let holder = FileStore::new(dir.path());
        let backend = holder.open(&params()).unwrap();

        // a second store over the same root cannot see the connection
        let other = FileStore::new(dir.path());
        other.destroy("app", "humans").unwrap();
        assert!(dir.path().join("app").join("humans.lock").exists());
        assert!(matches!(other.open(&params()), Err(StorageError::Locked { .. })));
        backend.close().unwrap();
    }

    #[test]
    fn file_corrupted_snapshot_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app").join("humans.json"), b"{not json").unwrap();

        let result = store.open(&params());
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_closed_connection_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let backend = store.open(&params()).unwrap();
        backend.close().unwrap();
        assert!(matches!(backend.count(), Err(StorageError::Closed)));
    }
}

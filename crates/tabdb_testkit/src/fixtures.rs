//! Test fixtures and multi-context helpers.
//!
//! A [`Contexts`] value stands for one origin: every [`Storage`] it hands
//! out behaves like a separate tab that shares the channel hub and the
//! backend store with the others.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tabdb_channel::ChannelHub;
use tabdb_core::{
    ChangeStream, CoreError, CoreResult, EventBulk, InstanceParams, Storage, StorageConfig,
    StorageInstance, StringCipher,
};
use tabdb_storage::{BackendFactory, Document, FileStore, InMemoryStore};
use tempfile::TempDir;

/// Default time a test waits for an asynchronous outcome.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Database name used by the fixtures.
pub const TEST_DATABASE: &str = "testdb";

/// Several contexts of one origin.
pub struct Contexts {
    hub: ChannelHub,
    factory: Arc<dyn BackendFactory>,
    memory: Option<Arc<InMemoryStore>>,
    config: StorageConfig,
    _temp_dir: Option<TempDir>,
}

impl Contexts {
    /// Creates contexts sharing a fresh in-memory store.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    /// Creates contexts sharing a fresh in-memory store, with `config`.
    pub fn with_config(config: StorageConfig) -> Self {
        let memory = Arc::new(InMemoryStore::new());
        Self {
            hub: ChannelHub::new(),
            factory: Arc::clone(&memory) as Arc<dyn BackendFactory>,
            memory: Some(memory),
            config,
            _temp_dir: None,
        }
    }

    /// Creates contexts sharing a file store in a temporary directory.
    pub fn with_file_store() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self {
            hub: ChannelHub::new(),
            factory: Arc::new(FileStore::new(temp_dir.path())),
            memory: None,
            config: StorageConfig::default(),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Creates contexts sharing a custom backend factory.
    pub fn with_factory(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            hub: ChannelHub::new(),
            factory,
            memory: None,
            config: StorageConfig::default(),
            _temp_dir: None,
        }
    }

    /// Returns the shared in-memory store.
    ///
    /// # Panics
    ///
    /// Panics if these contexts use another backend.
    pub fn memory(&self) -> &InMemoryStore {
        self.memory
            .as_deref()
            .expect("contexts do not use the in-memory store")
    }

    /// Returns the shared backend factory.
    pub fn factory(&self) -> Arc<dyn BackendFactory> {
        Arc::clone(&self.factory)
    }

    /// Opens a new context.
    pub fn context(&self) -> Storage {
        Storage::new(self.config.clone(), self.factory(), self.hub.clone())
    }
}

impl Default for Contexts {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of the `humans` collection keyed by `id`.
pub fn humans() -> InstanceParams {
    InstanceParams::new(TEST_DATABASE, "humans", "id")
}

/// Parameters of another collection of the same database.
pub fn collection(name: &str) -> InstanceParams {
    InstanceParams::new(TEST_DATABASE, name, "id")
}

/// Builds a human document.
pub fn human(id: &str, name: &str, age: i64) -> Document {
    Document::new()
        .with("id", id)
        .with("name", name)
        .with("age", age)
}

/// Builds a document from a JSON value.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn doc(value: Value) -> Document {
    Document::from_value(value).expect("document must be a JSON object")
}

/// Awaits `future`, failing the test after [`TEST_TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out")
}

/// Waits until the instance's database has a leader.
pub async fn wait_for_leader(instance: &StorageInstance) {
    if let Some(elector) = instance.elector() {
        within(elector.wait_for_leader())
            .await
            .expect("elector closed while waiting for a leader");
    }
}

/// Waits until the instance's context leads its database.
pub async fn await_leadership(instance: &StorageInstance) {
    if let Some(elector) = instance.elector() {
        within(elector.await_leadership())
            .await
            .expect("elector closed while waiting for leadership");
    }
}

/// Receives the next event bulk.
pub async fn next_bulk(stream: &mut ChangeStream) -> Arc<EventBulk> {
    within(stream.recv()).await.expect("change stream ended")
}

/// A reversible cipher for tests: `"<password>:" + reversed(plain)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestCipher;

impl StringCipher for TestCipher {
    fn encrypt_string(&self, plain: &str, password: &str) -> CoreResult<String> {
        Ok(format!("{password}:{}", plain.chars().rev().collect::<String>()))
    }

    fn decrypt_string(&self, encrypted: &str, password: &str) -> CoreResult<String> {
        let body = encrypted
            .strip_prefix(password)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| CoreError::encryption("wrong password"))?;
        Ok(body.chars().rev().collect())
    }
}

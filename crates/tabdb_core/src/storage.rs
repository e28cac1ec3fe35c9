//! The per-context storage factory.

use crate::config::{InstanceParams, StorageConfig};
use crate::crypter::Crypter;
use crate::error::{CoreError, CoreResult};
use crate::instance::{InstanceContext, StorageInstance};
use crate::registry::{ElectorRegistry, OpenInstances};
use std::fmt;
use std::sync::Arc;
use tabdb_channel::{ChannelHub, LeaderElector};
use tabdb_storage::BackendFactory;

struct StorageShared {
    config: StorageConfig,
    factory: Arc<dyn BackendFactory>,
    hub: ChannelHub,
    electors: Arc<ElectorRegistry>,
    open_instances: Arc<OpenInstances>,
}

/// Creates storage instances for one context (one tab or worker).
///
/// Contexts that share a [`ChannelHub`] and a [`BackendFactory`] model
/// several contexts of one origin: they elect one leader per database name
/// and forward their operations to it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tabdb_channel::ChannelHub;
/// use tabdb_core::{InstanceParams, Storage, StorageConfig};
/// use tabdb_storage::{Document, InMemoryStore, WriteRow};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), tabdb_core::CoreError> {
/// let storage = Storage::new(
///     StorageConfig::default(),
///     Arc::new(InMemoryStore::new()),
///     ChannelHub::new(),
/// );
/// let humans = storage
///     .create_instance(InstanceParams::new("app", "humans", "id"))
///     .await?;
///
/// let result = humans
///     .bulk_write(vec![WriteRow::insert(Document::new().with("id", "alice"))])
///     .await?;
/// assert!(result.success.contains_key("alice"));
///
/// humans.close().await?;
/// assert_eq!(storage.open_instance_count(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Storage {
    shared: Arc<StorageShared>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("config", &self.shared.config)
            .field("open_instances", &self.open_instance_count())
            .finish()
    }
}

impl Storage {
    /// Creates a context.
    pub fn new(config: StorageConfig, factory: Arc<dyn BackendFactory>, hub: ChannelHub) -> Self {
        let electors = Arc::new(ElectorRegistry::new(hub.clone(), config.channel_prefix.clone()));
        Self {
            shared: Arc::new(StorageShared {
                config,
                factory,
                hub,
                electors,
                open_instances: Arc::new(OpenInstances::default()),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Returns the hub this context talks over.
    pub fn hub(&self) -> &ChannelHub {
        &self.shared.hub
    }

    /// Creates an instance for a collection.
    ///
    /// In multi-instance mode this takes a reference on the database's
    /// elector; in single-instance mode it opens the backend right away.
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Structural`] for empty names, or the backend's
    /// error in single-instance mode.
    pub async fn create_instance(&self, params: InstanceParams) -> CoreResult<StorageInstance> {
        if params.database_name.is_empty() || params.collection_name.is_empty() {
            return Err(CoreError::structural(
                "database and collection names must not be empty",
            ));
        }
        if params.primary_path.is_empty() {
            return Err(CoreError::structural("primary path must not be empty"));
        }

        let shared = &self.shared;
        let crypter = Crypter::new(params.crypter.clone(), shared.config.cipher.clone());
        StorageInstance::create(
            params,
            InstanceContext {
                factory: Arc::clone(&shared.factory),
                electors: Arc::clone(&shared.electors),
                open_instances: Arc::clone(&shared.open_instances),
                crypter,
                multi_instance: shared.config.multi_instance,
                request_id_length: shared.config.request_id_length,
                event_bulk_id_length: shared.config.event_bulk_id_length,
                change_buffer: shared.config.change_buffer,
            },
        )
    }

    /// Returns the number of instances created and not closed yet.
    pub fn open_instance_count(&self) -> usize {
        self.shared.open_instances.len()
    }

    /// Returns how many instances reference the elector of `database_name`.
    pub fn elector_ref_count(&self, database_name: &str) -> usize {
        self.shared.electors.ref_count(database_name)
    }

    /// Returns the elector of `database_name` if any instance holds it.
    pub fn elector(&self, database_name: &str) -> Option<Arc<LeaderElector>> {
        self.shared.electors.get(database_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabdb_storage::InMemoryStore;

    fn storage(config: StorageConfig) -> Storage {
        Storage::new(config, Arc::new(InMemoryStore::new()), ChannelHub::new())
    }

    #[tokio::test]
    async fn instances_share_one_elector_per_database() {
        let storage = storage(StorageConfig::default());
        let humans = storage
            .create_instance(InstanceParams::new("app", "humans", "id"))
            .await
            .unwrap();
        let meta = storage
            .create_instance(InstanceParams::key_object("app", "meta"))
            .await
            .unwrap();
        assert_eq!(storage.elector_ref_count("app"), 2);
        assert_eq!(storage.open_instance_count(), 2);

        humans.close().await.unwrap();
        assert_eq!(storage.elector_ref_count("app"), 1);
        meta.close().await.unwrap();
        assert_eq!(storage.elector_ref_count("app"), 0);
        assert!(storage.elector("app").is_none());
        assert_eq!(storage.open_instance_count(), 0);
    }

    #[tokio::test]
    async fn single_instance_mode_has_no_elector() {
        let storage = storage(StorageConfig::new().multi_instance(false));
        let humans = storage
            .create_instance(InstanceParams::new("app", "humans", "id"))
            .await
            .unwrap();
        assert!(humans.elector().is_none());
        assert!(humans.is_leader());
        assert!(humans.has_local_state());
        assert_eq!(storage.elector_ref_count("app"), 0);
    }

    #[tokio::test]
    async fn empty_names_are_rejected() {
        let storage = storage(StorageConfig::default());
        let result = storage
            .create_instance(InstanceParams::new("", "humans", "id"))
            .await;
        assert!(matches!(result, Err(CoreError::Structural { .. })));
        assert_eq!(storage.open_instance_count(), 0);
    }
}

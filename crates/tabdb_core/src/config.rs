//! Storage configuration.

use crate::crypter::StringCipher;
use std::fmt;
use std::sync::Arc;

/// Configuration shared by every instance a [`Storage`](crate::Storage)
/// creates.
#[derive(Clone)]
pub struct StorageConfig {
    /// Whether several contexts may open the same database. When false no
    /// election happens and every instance uses its local backend.
    pub multi_instance: bool,

    /// Prefix of the channel name; the database name is appended.
    pub channel_prefix: String,

    /// Length of random remote request ids.
    pub request_id_length: usize,

    /// Length of random event bulk ids.
    pub event_bulk_id_length: usize,

    /// Change bulks a subscriber may fall behind before it is dropped.
    pub change_buffer: usize,

    /// Cipher used by field encryption, if any.
    pub cipher: Option<Arc<dyn StringCipher>>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            multi_instance: true,
            channel_prefix: "tabdb-".to_string(),
            request_id_length: 12,
            event_bulk_id_length: 10,
            change_buffer: 1024,
            cipher: None,
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("multi_instance", &self.multi_instance)
            .field("channel_prefix", &self.channel_prefix)
            .field("request_id_length", &self.request_id_length)
            .field("event_bulk_id_length", &self.event_bulk_id_length)
            .field("change_buffer", &self.change_buffer)
            .field("cipher", &self.cipher.as_ref().map(|_| "<cipher>"))
            .finish()
    }
}

impl StorageConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether several contexts may share a database.
    #[must_use]
    pub fn multi_instance(mut self, value: bool) -> Self {
        self.multi_instance = value;
        self
    }

    /// Sets the channel name prefix.
    #[must_use]
    pub fn channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Sets the length of remote request ids.
    #[must_use]
    pub fn request_id_length(mut self, length: usize) -> Self {
        self.request_id_length = length.max(1);
        self
    }

    /// Sets the length of event bulk ids.
    #[must_use]
    pub fn event_bulk_id_length(mut self, length: usize) -> Self {
        self.event_bulk_id_length = length.max(1);
        self
    }

    /// Sets how many bulks a change subscriber may lag behind.
    #[must_use]
    pub fn change_buffer(mut self, bulks: usize) -> Self {
        self.change_buffer = bulks.max(1);
        self
    }

    /// Sets the cipher used for field encryption.
    #[must_use]
    pub fn cipher(mut self, cipher: Arc<dyn StringCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Returns the channel name for a database.
    pub fn channel_name(&self, database_name: &str) -> String {
        format!("{}{}", self.channel_prefix, database_name)
    }
}

/// What an instance stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// Regular documents of a collection.
    Collection,
    /// Local key/value documents used for bookkeeping.
    KeyObject,
}

impl InstanceKind {
    /// Prefix of the event ids this kind produces.
    pub const fn event_prefix(self) -> &'static str {
        match self {
            InstanceKind::Collection => "non-local",
            InstanceKind::KeyObject => "local",
        }
    }

    /// Message type tag of remote requests for this kind.
    pub const fn message_type(self) -> &'static str {
        match self {
            InstanceKind::Collection => "tabdb-remote-request",
            InstanceKind::KeyObject => "tabdb-remote-request-key-object",
        }
    }
}

/// Field encryption settings of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrypterConfig {
    /// Password handed to the cipher. Encryption is off without one.
    pub password: Option<String>,
    /// Dotted paths of the encrypted fields.
    pub encrypted_paths: Vec<String>,
}

impl CrypterConfig {
    /// Creates an encryption setting for `paths`.
    pub fn new(password: impl Into<String>, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            password: Some(password.into()),
            encrypted_paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

/// Identifies the collection an instance is created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceParams {
    /// Physical database name; instances of one name share an elector.
    pub database_name: String,
    /// Collection name.
    pub collection_name: String,
    /// Dotted path of the primary key.
    pub primary_path: String,
    /// What the instance stores.
    pub kind: InstanceKind,
    /// Field encryption settings.
    pub crypter: CrypterConfig,
}

impl InstanceParams {
    /// Creates parameters for a collection instance.
    pub fn new(
        database_name: impl Into<String>,
        collection_name: impl Into<String>,
        primary_path: impl Into<String>,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            collection_name: collection_name.into(),
            primary_path: primary_path.into(),
            kind: InstanceKind::Collection,
            crypter: CrypterConfig::default(),
        }
    }

    /// Creates parameters for a key/value instance keyed by `_id`.
    pub fn key_object(database_name: impl Into<String>, collection_name: impl Into<String>) -> Self {
        Self {
            kind: InstanceKind::KeyObject,
            ..Self::new(database_name, collection_name, "_id")
        }
    }

    /// Sets field encryption.
    #[must_use]
    pub fn encryption(mut self, crypter: CrypterConfig) -> Self {
        self.crypter = crypter;
        self
    }
}

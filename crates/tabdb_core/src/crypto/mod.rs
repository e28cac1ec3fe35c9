//! Built-in cipher plugin for field encryption.
//!
//! The [`Crypter`](crate::Crypter) only needs a [`StringCipher`]. This
//! module provides one based on AES-256-GCM, available with the
//! `encryption` feature.
//!
//! ## Security Model
//!
//! - AES-256-GCM authenticated encryption
//! - Unique random nonce per field value
//! - Keys derived from the password with HKDF-SHA256 and zeroized on drop
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tabdb_core::crypto::AesGcmCipher;
//! use tabdb_core::StorageConfig;
//!
//! let config = StorageConfig::new().cipher(Arc::new(AesGcmCipher::new()?));
//! ```
//!
//! [`StringCipher`]: crate::StringCipher

#[cfg(feature = "encryption")]
mod aes;

#[cfg(feature = "encryption")]
pub use aes::*;

/// Module contents when encryption feature is disabled.
#[cfg(not(feature = "encryption"))]
mod stub {
    use crate::error::{CoreError, CoreResult};

    /// AES-GCM cipher (stub when encryption disabled).
    #[derive(Debug)]
    pub struct AesGcmCipher {
        _private: (),
    }

    impl AesGcmCipher {
        /// Always returns [`CoreError::PluginMissing`] when encryption is
        /// disabled.
        pub fn new() -> CoreResult<Self> {
            Err(CoreError::PluginMissing)
        }
    }
}

#[cfg(not(feature = "encryption"))]
pub use stub::*;

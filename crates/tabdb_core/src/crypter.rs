//! Field-level document encryption.

use crate::config::CrypterConfig;
use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tabdb_storage::Document;

/// The cipher plugin boundary: string in, string out.
///
/// Implementations must be deterministic in the sense that
/// `decrypt_string(encrypt_string(s, p), p) == s`.
pub trait StringCipher: Send + Sync {
    /// Encrypts `plain` with `password`.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    fn encrypt_string(&self, plain: &str, password: &str) -> CoreResult<String>;

    /// Decrypts `encrypted` with `password`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid ciphertext for `password`.
    fn decrypt_string(&self, encrypted: &str, password: &str) -> CoreResult<String>;
}

/// Encrypts and decrypts the configured fields of documents.
///
/// Each configured dotted path that is present in a document is replaced
/// by the cipher's output for the JSON encoding of its value. Attachments
/// are never touched; their payloads stay shared with the input.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tabdb_core::{CoreResult, Crypter, CrypterConfig, StringCipher};
/// use tabdb_storage::Document;
///
/// struct Reverse;
///
/// impl StringCipher for Reverse {
///     fn encrypt_string(&self, plain: &str, _: &str) -> CoreResult<String> {
///         Ok(plain.chars().rev().collect())
///     }
///     fn decrypt_string(&self, encrypted: &str, _: &str) -> CoreResult<String> {
///         Ok(encrypted.chars().rev().collect())
///     }
/// }
///
/// let crypter = Crypter::new(CrypterConfig::new("pw", ["secret"]), Some(Arc::new(Reverse)));
/// let doc = Document::new().with("id", "a").with("secret", "abc");
///
/// let encrypted = crypter.encrypt(doc.clone()).unwrap();
/// assert_eq!(encrypted.get("secret").unwrap(), "\"cba\"");
/// assert_eq!(crypter.decrypt(encrypted).unwrap(), doc);
/// ```
#[derive(Clone, Default)]
pub struct Crypter {
    password: Option<String>,
    paths: Vec<String>,
    cipher: Option<Arc<dyn StringCipher>>,
}

impl fmt::Debug for Crypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crypter")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("paths", &self.paths)
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

impl Crypter {
    /// Creates a crypter.
    pub fn new(config: CrypterConfig, cipher: Option<Arc<dyn StringCipher>>) -> Self {
        Self {
            password: config.password,
            paths: config.encrypted_paths,
            cipher,
        }
    }

    /// Returns true if a password is configured.
    pub fn is_active(&self) -> bool {
        self.password.is_some()
    }

    /// Encrypts the configured fields of `doc`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PluginMissing`] if a password is set without a
    /// cipher, or the cipher's error.
    pub fn encrypt(&self, doc: Document) -> CoreResult<Document> {
        self.transform(doc, |cipher, password, value| {
            let plain = serde_json::to_string(value)?;
            Ok(Value::String(cipher.encrypt_string(&plain, password)?))
        })
    }

    /// Decrypts the configured fields of `doc`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PluginMissing`] if a password is set without a
    /// cipher, [`CoreError::Encryption`] if an encrypted field does not hold
    /// a string, or the cipher's error.
    pub fn decrypt(&self, doc: Document) -> CoreResult<Document> {
        self.transform(doc, |cipher, password, value| {
            let Value::String(encrypted) = value else {
                return Err(CoreError::encryption("encrypted field does not hold a string"));
            };
            let plain = cipher.decrypt_string(encrypted, password)?;
            Ok(serde_json::from_str(&plain)?)
        })
    }

    fn transform<F>(&self, mut doc: Document, convert: F) -> CoreResult<Document>
    where
        F: Fn(&dyn StringCipher, &str, &Value) -> CoreResult<Value>,
    {
        let Some(password) = self.password.as_deref() else {
            return Ok(doc);
        };
        let cipher = self.cipher.as_deref().ok_or(CoreError::PluginMissing)?;

        let attachments = doc.take_attachments();
        for path in &self.paths {
            let Some(value) = doc.get_path(path) else {
                continue;
            };
            let converted = convert(cipher, password, value)?;
            if !doc.set_path(path, converted) {
                return Err(CoreError::impossible_state(format!(
                    "cannot write back encrypted field '{path}'"
                )));
            }
        }
        doc.set_attachments(attachments);
        Ok(doc)
    }
}

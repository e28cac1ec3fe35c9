//! String cipher using AES-256-GCM.

use crate::crypter::StringCipher;
use crate::error::{CoreError, CoreResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const DEFAULT_SALT: &[u8] = b"tabdb-field-encryption";
const KEY_INFO: &[u8] = b"tabdb-field-key-v1";

/// Key derived from a password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct FieldKey {
    bytes: [u8; KEY_SIZE],
}

impl FieldKey {
    fn derive(password: &str, salt: &[u8]) -> CoreResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(KEY_INFO, &mut bytes)
            .map_err(|_| CoreError::encryption("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }
}

/// Encrypts field values with AES-256-GCM.
///
/// The output is `hex(nonce || ciphertext || tag)`. The key is derived
/// from the password on every call, so one cipher serves any number of
/// passwords.
#[derive(Clone)]
pub struct AesGcmCipher {
    salt: Vec<u8>,
}

impl AesGcmCipher {
    /// Creates a cipher with the default salt.
    ///
    /// # Errors
    ///
    /// Never fails when the `encryption` feature is enabled.
    pub fn new() -> CoreResult<Self> {
        Ok(Self::with_salt(DEFAULT_SALT))
    }

    /// Creates a cipher deriving keys with `salt`.
    pub fn with_salt(salt: &[u8]) -> Self {
        Self {
            salt: salt.to_vec(),
        }
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}

impl StringCipher for AesGcmCipher {
    fn encrypt_string(&self, plain: &str, password: &str) -> CoreResult<String> {
        let cipher = FieldKey::derive(password, &self.salt)?.cipher();

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|_| CoreError::encryption("encryption error"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(hex::encode(result))
    }

    fn decrypt_string(&self, encrypted: &str, password: &str) -> CoreResult<String> {
        let bytes = hex::decode(encrypted)
            .map_err(|e| CoreError::encryption(format!("ciphertext is not hex: {e}")))?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CoreError::encryption("ciphertext too short"));
        }

        let cipher = FieldKey::derive(password, &self.salt)?.cipher();
        let nonce = Nonce::from_slice(&bytes[..NONCE_SIZE]);
        let plain = cipher
            .decrypt(nonce, &bytes[NONCE_SIZE..])
            .map_err(|_| CoreError::encryption("decryption error"))?;
        String::from_utf8(plain).map_err(|_| CoreError::encryption("plaintext is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = AesGcmCipher::new().unwrap();
        let encrypted = cipher.encrypt_string("{\"pin\":1234}", "pw").unwrap();
        assert!(!encrypted.contains("pin"));
        assert_eq!(
            cipher.decrypt_string(&encrypted, "pw").unwrap(),
            "{\"pin\":1234}"
        );
    }

    #[test]
    fn encrypt_produces_different_ciphertext() {
        let cipher = AesGcmCipher::new().unwrap();
        let a = cipher.encrypt_string("same", "pw").unwrap();
        let b = cipher.encrypt_string("same", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_password_fails() {
        let cipher = AesGcmCipher::new().unwrap();
        let encrypted = cipher.encrypt_string("secret", "right").unwrap();
        assert!(cipher.decrypt_string(&encrypted, "wrong").is_err());
    }

    #[test]
    fn different_salt_cannot_decrypt() {
        let a = AesGcmCipher::with_salt(b"one");
        let b = AesGcmCipher::with_salt(b"two");
        let encrypted = a.encrypt_string("secret", "pw").unwrap();
        assert!(b.decrypt_string(&encrypted, "pw").is_err());
    }

    #[test]
    fn malformed_input_fails() {
        let cipher = AesGcmCipher::new().unwrap();
        assert!(cipher.decrypt_string("not hex", "pw").is_err());
        assert!(cipher.decrypt_string("abcd", "pw").is_err());
    }
}

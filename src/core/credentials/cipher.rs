use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;
use tracing::warn;

use super::CredentialError;

type HmacSha256 = hmac::Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypts the token columns of the credential table.
///
/// Values are stored as base64(nonce || ciphertext). Rows written before
/// encryption was introduced are returned as-is.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

/// Derive a 256-bit key from machine-specific identifiers.
/// HMAC-SHA256(hostname + username, "toolhost-credentials-v1") keeps the key
/// stable across restarts but tied to the local machine/user.
fn derive_machine_key() -> Result<[u8; 32], CredentialError> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = whoami::username();
    let input = format!("{}{}", hostname, username);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"toolhost-credentials-v1")
        .map_err(|e| CredentialError::Storage(format!("key derivation failed: {}", e)))?;
    mac.update(input.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl SecretCipher {
    pub fn from_machine_identity() -> Result<Self, CredentialError> {
        Ok(Self::with_key(derive_machine_key()?))
    }

    pub fn with_key(key: [u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::Storage(format!("encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CredentialError::Storage(format!("base64 decode failed: {}", e)))?;

        if combined.len() <= NONCE_LEN {
            return Err(CredentialError::Storage(
                "encrypted value too short".to_string(),
            ));
        }
        self.open_sealed(&combined)
    }

    fn open_sealed(&self, combined: &[u8]) -> Result<String, CredentialError> {
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CredentialError::Storage(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| CredentialError::Storage(format!("UTF-8 decode failed: {}", e)))
    }

    /// Decrypt a stored column, accepting legacy plaintext rows.
    ///
    /// Only values that cannot be a sealed column (not base64, or shorter
    /// than nonce plus tag) are read as plaintext. A sealed value that fails
    /// to authenticate is an error, typically a changed machine identity.
    pub fn open_column(&self, stored: &str) -> Result<String, CredentialError> {
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(stored)
            .ok()
            .filter(|bytes| bytes.len() >= NONCE_LEN + TAG_LEN);
        match sealed {
            Some(combined) => self.open_sealed(&combined).map_err(|e| {
                CredentialError::Storage(format!(
                    "stored credential does not decrypt with this machine's key: {}",
                    e
                ))
            }),
            None => {
                warn!("credential column is not encrypted, reading it as plaintext");
                Ok(stored.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::with_key([7u8; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let c = cipher();
        let encrypted = c.encrypt("refresh-abc").unwrap();
        assert_ne!(encrypted, "refresh-abc");
        assert_eq!(c.decrypt(&encrypted).unwrap(), "refresh-abc");
    }

    #[test]
    fn encrypt_uses_fresh_nonce() {
        let c = cipher();
        let a = c.encrypt("same").unwrap();
        let b = c.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_short_input() {
        let short = base64::engine::general_purpose::STANDARD.encode(b"short");
        assert!(cipher().decrypt(&short).is_err());
    }

    #[test]
    fn decrypt_rejects_other_key() {
        let encrypted = cipher().encrypt("token").unwrap();
        let other = SecretCipher::with_key([9u8; 32]);
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn open_column_passes_legacy_plaintext_through() {
        assert_eq!(cipher().open_column("plain-token").unwrap(), "plain-token");
    }

    #[test]
    fn open_column_reads_sealed_values() {
        let c = cipher();
        let sealed = c.encrypt("refresh-abc").unwrap();
        assert_eq!(c.open_column(&sealed).unwrap(), "refresh-abc");
    }

    #[test]
    fn open_column_rejects_value_sealed_with_other_key() {
        let sealed = cipher().encrypt("refresh-abc").unwrap();
        let other = SecretCipher::with_key([9u8; 32]);
        let err = other.open_column(&sealed).unwrap_err();
        assert!(matches!(err, CredentialError::Storage(_)));
        assert!(!err.to_string().contains(&sealed));
    }

    #[test]
    fn machine_key_is_stable() {
        assert_eq!(derive_machine_key().unwrap(), derive_machine_key().unwrap());
    }
}

//! Partner key material and value sealing
//!
//! Every anonymized file is sealed with its own random data key. The data
//! key is stored next to the artifact, wrapped under the partner key, which
//! is derived from the partner's data encryption key and file password.
//! Nothing lives only in process memory: any instance holding the partner
//! record and the file record can open the file. Rotating partner secrets
//! re-wraps the data keys and leaves the sealed content untouched.
//!
//! Sealed values are in-band tokens `[[enc:<base64(nonce || ciphertext)>]]`.

use crate::error::{AnonymizeError, Result};
use crate::types::PartnerSecrets;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Opening marker of a sealed token
pub const TOKEN_PREFIX: &str = "[[enc:";
/// Closing marker of a sealed token
pub const TOKEN_SUFFIX: &str = "]]";

const KEY_DOMAIN: &[u8] = b"a3s-anonymize/partner-key/v1";
const KEY_ID_DOMAIN: &[u8] = b"a3s-anonymize/key-id/v1";
const NONCE_LEN: usize = 12;

/// Derive the 256-bit partner key from its secrets
pub fn derive_key(secrets: &PartnerSecrets) -> Result<Zeroizing<[u8; 32]>> {
    if secrets.data_encryption_key.is_empty() {
        return Err(AnonymizeError::KeyUnavailable(
            "Partner has no data encryption key".to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    for part in [
        secrets.data_encryption_key.expose(),
        secrets.file_password.expose(),
    ] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&hasher.finalize());
    Ok(key)
}

/// Fresh random 256-bit data key
pub fn generate_data_key() -> Zeroizing<[u8; 32]> {
    let generated = Aes256Gcm::generate_key(&mut OsRng);
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&generated);
    key
}

/// Public fingerprint of a key, safe to store and log
pub fn key_fingerprint(key: &[u8; 32]) -> String {
    let digest = Sha256::new()
        .chain_update(KEY_ID_DOMAIN)
        .chain_update(key)
        .finalize();
    format!("key-{}", hex::encode(&digest[..8]))
}

/// A data key encrypted under a partner key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    /// Fingerprint of the partner key that wraps this data key
    pub partner_key_id: String,
    /// base64(nonce || ciphertext)
    pub wrapped: String,
}

/// An AES-256-GCM key ready to seal and open values
#[derive(Clone)]
pub struct SealingKey {
    key_id: String,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SealingKey {
    pub fn from_bytes(key: &[u8; 32]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| AnonymizeError::KeyUnavailable(format!("Invalid key length: {}", e)))?;
        Ok(Self {
            key_id: key_fingerprint(key),
            cipher,
        })
    }

    /// The partner's current key
    pub fn for_partner(secrets: &PartnerSecrets) -> Result<Self> {
        Self::from_bytes(&*derive_key(secrets)?)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypt a value into a sealed token
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let sealed = self.encrypt(plaintext.as_bytes())?;
        Ok(format!("{}{}{}", TOKEN_PREFIX, sealed, TOKEN_SUFFIX))
    }

    /// Decrypt a sealed token back to the original value
    pub fn open(&self, token: &str) -> Result<String> {
        let encoded = token
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|t| t.strip_suffix(TOKEN_SUFFIX))
            .ok_or_else(|| {
                AnonymizeError::MalformedInput("Value is not a sealed token".to_string())
            })?;

        let plaintext = self.decrypt(encoded)?;
        String::from_utf8(plaintext).map_err(|e| {
            AnonymizeError::MalformedInput(format!("Decrypted value is not UTF-8: {}", e))
        })
    }

    /// Wrap a data key under this key
    pub fn wrap(&self, data_key: &[u8; 32]) -> Result<WrappedKey> {
        Ok(WrappedKey {
            partner_key_id: self.key_id.clone(),
            wrapped: self.encrypt(data_key)?,
        })
    }

    /// Recover the raw data key wrapped under this key
    pub fn unwrap_bytes(&self, wrapped: &WrappedKey) -> Result<Zeroizing<[u8; 32]>> {
        if wrapped.partner_key_id != self.key_id {
            return Err(AnonymizeError::KeyUnavailable(format!(
                "Data key is wrapped under '{}', partner key is '{}'",
                wrapped.partner_key_id, self.key_id
            )));
        }

        let plaintext = Zeroizing::new(self.decrypt(&wrapped.wrapped)?);
        if plaintext.len() != 32 {
            return Err(AnonymizeError::MalformedInput(format!(
                "Wrapped data key has {} bytes",
                plaintext.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&plaintext);
        Ok(key)
    }

    /// Recover the data key wrapped under this key
    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<SealingKey> {
        Self::from_bytes(&*self.unwrap_bytes(wrapped)?)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| AnonymizeError::KeyUnavailable(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let sealed = BASE64.decode(encoded).map_err(|e| {
            AnonymizeError::MalformedInput(format!("Invalid token encoding: {}", e))
        })?;
        if sealed.len() <= NONCE_LEN {
            return Err(AnonymizeError::MalformedInput(
                "Sealed token is truncated".to_string(),
            ));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| {
                AnonymizeError::KeyUnavailable(format!(
                    "Decryption with key '{}' failed: {}",
                    self.key_id, e
                ))
            })
    }
}

//! Encrypted-at-rest storage for identity HMAC keys.
//!
//! The configuration provides a ring of named symmetric keys
//! (`key_id -> "algorithm:base64-secret"`). Each stored identity records
//! which key encrypted it; no key_id means the stored value is plaintext.
//! Rotation decrypts with whatever key matches and re-encrypts under the
//! ring's default.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use thiserror::Error;

pub const ALGORITHM_AES256_GCM: &str = "aes256-gcm";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("bad key spec for {key_id:?}: {detail}")]
    BadSpec { key_id: String, detail: String },

    #[error("unknown key id: {0}")]
    UnknownKey(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed with every known key")]
    Decrypt,
}

struct RingKey {
    secret: Vec<u8>,
}

impl RingKey {
    fn cipher(&self) -> Result<Aes256Gcm, KeyRingError> {
        Aes256Gcm::new_from_slice(&self.secret).map_err(|_| KeyRingError::Encrypt)
    }
}

pub struct KeyRing {
    keys: BTreeMap<String, RingKey>,
    default_key_id: Option<String>,
}

impl KeyRing {
    /// Parse ring entries of the form `"aes256-gcm:<base64 32-byte secret>"`.
    pub fn from_config(
        entries: &BTreeMap<String, String>,
        default_key_id: Option<String>,
    ) -> Result<Self, KeyRingError> {
        let mut keys = BTreeMap::new();
        for (key_id, spec) in entries {
            let (algorithm, secret_b64) =
                spec.split_once(':').ok_or_else(|| KeyRingError::BadSpec {
                    key_id: key_id.clone(),
                    detail: "expected algorithm:base64-secret".to_string(),
                })?;
            if algorithm != ALGORITHM_AES256_GCM {
                return Err(KeyRingError::BadSpec {
                    key_id: key_id.clone(),
                    detail: format!("unsupported algorithm {algorithm:?}"),
                });
            }
            let secret = BASE64
                .decode(secret_b64.trim())
                .map_err(|e| KeyRingError::BadSpec {
                    key_id: key_id.clone(),
                    detail: e.to_string(),
                })?;
            if secret.len() != 32 {
                return Err(KeyRingError::BadSpec {
                    key_id: key_id.clone(),
                    detail: format!("secret must be 32 bytes, got {}", secret.len()),
                });
            }
            keys.insert(key_id.clone(), RingKey { secret });
        }
        if let Some(default) = &default_key_id {
            if !keys.contains_key(default) {
                return Err(KeyRingError::UnknownKey(default.clone()));
            }
        }
        Ok(Self {
            keys,
            default_key_id,
        })
    }

    /// An empty ring: everything is stored plaintext.
    pub fn empty() -> Self {
        Self {
            keys: BTreeMap::new(),
            default_key_id: None,
        }
    }

    pub fn default_key_id(&self) -> Option<&str> {
        self.default_key_id.as_deref()
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    /// Encrypt under the ring default. With no default configured the value
    /// passes through unchanged and no key_id is recorded.
    pub fn encrypt_default(&self, plaintext: &str) -> Result<(String, Option<String>), KeyRingError> {
        match &self.default_key_id {
            Some(key_id) => {
                let stored = self.encrypt_with(key_id, plaintext)?;
                Ok((stored, Some(key_id.clone())))
            }
            None => Ok((plaintext.to_string(), None)),
        }
    }

    /// Stored layout: base64(nonce || ciphertext), fresh nonce per call.
    pub fn encrypt_with(&self, key_id: &str, plaintext: &str) -> Result<String, KeyRingError> {
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| KeyRingError::UnknownKey(key_id.to_string()))?;
        let cipher = key.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| KeyRingError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a stored value. No key_id means plaintext. An unknown key_id
    /// hint falls back to trying every ring entry, which covers identities
    /// written before the hint column existed.
    pub fn decrypt(&self, stored: &str, key_id: Option<&str>) -> Result<String, KeyRingError> {
        let key_id = key_id.filter(|id| !id.is_empty());
        let Some(key_id) = key_id else {
            return Ok(stored.to_string());
        };

        if let Some(key) = self.keys.get(key_id) {
            return self.decrypt_with(key, stored);
        }
        for key in self.keys.values() {
            if let Ok(plaintext) = self.decrypt_with(key, stored) {
                return Ok(plaintext);
            }
        }
        Err(KeyRingError::Decrypt)
    }

    fn decrypt_with(&self, key: &RingKey, stored: &str) -> Result<String, KeyRingError> {
        let blob = BASE64
            .decode(stored.trim())
            .map_err(|_| KeyRingError::Decrypt)?;
        if blob.len() <= NONCE_LEN {
            return Err(KeyRingError::Decrypt);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = key.cipher().map_err(|_| KeyRingError::Decrypt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| KeyRingError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| KeyRingError::Decrypt)
    }

    /// A fresh ring secret in config format.
    pub fn generate_entry() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{ALGORITHM_AES256_GCM}:{}", BASE64.encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(ids: &[&str], default: Option<&str>) -> KeyRing {
        let entries: BTreeMap<String, String> = ids
            .iter()
            .map(|id| (id.to_string(), KeyRing::generate_entry()))
            .collect();
        KeyRing::from_config(&entries, default.map(str::to_string)).unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let ring = ring_with(&["k1"], Some("k1"));
        let (stored, key_id) = ring.encrypt_default("secret-hmac-key").unwrap();
        assert_eq!(key_id.as_deref(), Some("k1"));
        assert_ne!(stored, "secret-hmac-key");
        assert_eq!(ring.decrypt(&stored, key_id.as_deref()).unwrap(), "secret-hmac-key");
    }

    #[test]
    fn plaintext_passthrough_without_default() {
        let ring = KeyRing::empty();
        let (stored, key_id) = ring.encrypt_default("plain").unwrap();
        assert_eq!(stored, "plain");
        assert_eq!(key_id, None);
        assert_eq!(ring.decrypt(&stored, None).unwrap(), "plain");
    }

    #[test]
    fn unknown_hint_tries_every_key() {
        let ring = ring_with(&["old", "new"], Some("old"));
        let stored = ring.encrypt_with("new", "v").unwrap();
        // Hint points at a key id that is no longer in the ring.
        assert_eq!(ring.decrypt(&stored, Some("retired")).unwrap(), "v");
    }

    #[test]
    fn decrypt_fails_with_wrong_ring() {
        let a = ring_with(&["k1"], Some("k1"));
        let b = ring_with(&["k1"], Some("k1"));
        let (stored, key_id) = a.encrypt_default("v").unwrap();
        assert!(b.decrypt(&stored, key_id.as_deref()).is_err());
    }

    #[test]
    fn rejects_bad_specs() {
        let mut entries = BTreeMap::new();
        entries.insert("k".to_string(), "no-colon".to_string());
        assert!(KeyRing::from_config(&entries, None).is_err());

        let mut entries = BTreeMap::new();
        entries.insert("k".to_string(), "rot13:YWJj".to_string());
        assert!(KeyRing::from_config(&entries, None).is_err());
    }
}

//! AES-256-GCM encryption of face encodings at rest.
//!
//! Blob layout: 12-byte random nonce, then ciphertext with the GCM tag.

use crate::{Result, StoreError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl EmbeddingCipher {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        let fingerprint = Sha256::digest(key)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            fingerprint,
        }
    }

    /// Read the key file, generating a fresh key (mode 0600) if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let bad_key = |reason: String| StoreError::BadKey {
            path: path.display().to_string(),
            reason,
        };

        match std::fs::read(path) {
            Ok(bytes) => {
                let key: [u8; KEY_LEN] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| bad_key(format!("expected {KEY_LEN} bytes, found {}", bytes.len())))?;
                Ok(Self::from_key(&key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);

                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path)?;
                file.write_all(&key)?;
                file.sync_all()?;

                tracing::info!(path = %path.display(), "generated new face encoding key");
                Ok(Self::from_key(&key))
            }
            Err(e) => Err(bad_key(e.to_string())),
        }
    }

    /// Hex SHA-256 of the key, recorded in the database to detect key swaps.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StoreError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a sealed blob; `None` if it is truncated or fails authentication.
    pub fn open(&self, blob: &[u8]) -> Option<Vec<u8>> {
        if blob.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = EmbeddingCipher::from_key(&[7u8; KEY_LEN]);
        let blob = cipher.seal(b"embedding bytes").unwrap();
        assert_eq!(blob.len(), NONCE_LEN + 15 + 16);
        assert_eq!(cipher.open(&blob).as_deref(), Some(&b"embedding bytes"[..]));
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let cipher = EmbeddingCipher::from_key(&[7u8; KEY_LEN]);
        assert_ne!(cipher.seal(b"x").unwrap(), cipher.seal(b"x").unwrap());
    }

    #[test]
    fn test_open_rejects_tampering_and_wrong_key() {
        let cipher = EmbeddingCipher::from_key(&[7u8; KEY_LEN]);
        let mut blob = cipher.seal(b"embedding bytes").unwrap();

        let other = EmbeddingCipher::from_key(&[8u8; KEY_LEN]);
        assert!(other.open(&blob).is_none());

        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(cipher.open(&blob).is_none());
        assert!(cipher.open(&blob[..NONCE_LEN]).is_none());
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let a = EmbeddingCipher::from_key(&[0u8; KEY_LEN]);
        let b = EmbeddingCipher::from_key(&[1u8; KEY_LEN]);
        assert_eq!(a.fingerprint().len(), 64);
        assert_ne!(a.fingerprint(), b.fingerprint());
        // SHA-256 of 32 zero bytes.
        assert!(a.fingerprint().starts_with("66687aadf862bd77"));
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = std::env::temp_dir().join(format!("clinic-key-test-{}", std::process::id()));
        let path = dir.join("encodings.key");
        let _ = std::fs::remove_dir_all(&dir);

        let first = EmbeddingCipher::load_or_create(&path).unwrap();
        let second = EmbeddingCipher::load_or_create(&path).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(std::fs::read(&path).unwrap().len(), KEY_LEN);

        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            EmbeddingCipher::load_or_create(&path),
            Err(StoreError::BadKey { .. })
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

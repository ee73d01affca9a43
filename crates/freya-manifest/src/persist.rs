//! Sealing the manifest to disk.
//!
//! The document is serialized as JSON, encrypted with XChaCha20-Poly1305
//! under an Argon2id password-derived key, and written base64-encoded.
//! The random 24-byte nonce is prepended to the ciphertext inside the
//! envelope. A MAC failure on load means the password is wrong.

use std::fs;
use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;

use crate::Manifest;

/// Fixed KDF salt; every mount of every store uses the same one, so the
/// password alone reproduces the key.
pub const KDF_SALT: [u8; 16] = [
    0xd0, 0xe1, 0x03, 0xc2, 0x5a, 0x3c, 0x52, 0xaf, 0x5d, 0xfe, 0xd5, 0xbf, 0xf8, 0x75, 0x7c,
    0x8f,
];

/// Sealed-manifest key length (XChaCha20-Poly1305).
pub const SEAL_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("manifest envelope is malformed")]
    Envelope,

    #[error("wrong password")]
    Auth,
}

pub type Result<T> = std::result::Result<T, PersistError>;

/// Derive the sealing key from the user password with Argon2id over the
/// fixed salt. 64 MiB, 3 passes.
pub fn derive_key(password: &str) -> Result<[u8; SEAL_KEY_LEN]> {
    let params = Params::new(65536, 3, 1, Some(SEAL_KEY_LEN))
        .map_err(|e| PersistError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; SEAL_KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), &KDF_SALT, &mut key)
        .map_err(|e| PersistError::Kdf(e.to_string()))?;
    Ok(key)
}

/// Seal `manifest` into the envelope file at `path`.
///
/// The write goes through a temp file plus rename so a crash mid-dump
/// never leaves a torn envelope behind.
pub fn save(key: &[u8; SEAL_KEY_LEN], path: &Path, manifest: &Manifest) -> Result<()> {
    let plaintext = serde_json::to_vec(manifest)?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| PersistError::Envelope)?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);

    let encoded = STANDARD.encode(&envelope);
    let temp = path.with_extension("tmp");
    fs::write(&temp, encoded)?;
    fs::rename(&temp, path)?;
    debug!(path = %path.display(), bytes = plaintext.len(), "manifest sealed");
    Ok(())
}

/// Load and unseal the manifest at `path`.
///
/// Returns `Ok(None)` when the file does not exist (first mount).
/// A MAC failure surfaces as [`PersistError::Auth`].
pub fn load(key: &[u8; SEAL_KEY_LEN], path: &Path) -> Result<Option<Manifest>> {
    if !path.is_file() {
        return Ok(None);
    }

    let encoded = fs::read_to_string(path)?;
    let envelope = STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|_| PersistError::Envelope)?;
    if envelope.len() < NONCE_LEN {
        return Err(PersistError::Envelope);
    }

    let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| PersistError::Auth)?;

    Ok(Some(serde_json::from_slice(&plaintext)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PathInfo, DEFAULT_MODE};
    use tempfile::tempdir;

    #[test]
    fn derive_key_is_deterministic() {
        let a = derive_key("hunter2").unwrap();
        let b = derive_key("hunter2").unwrap();
        let c = derive_key("hunter3").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".freyafs");
        let key = derive_key("pw").unwrap();

        let mut manifest = Manifest::new();
        let info = PathInfo::make();
        manifest.structure.add("/f", info.clone());
        manifest.metadata.add_file(&info, DEFAULT_MODE);
        manifest.cids.insert(info.path_id.clone(), vec!["c0".into()]);

        save(&key, &path, &manifest).unwrap();
        let back = load(&key, &path).unwrap().unwrap();
        assert_eq!(back.structure.get("/f", true).unwrap(), info);
        assert_eq!(back.cids[&info.path_id], vec!["c0"]);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let key = derive_key("pw").unwrap();
        assert!(load(&key, &dir.path().join(".freyafs")).unwrap().is_none());
    }

    #[test]
    fn wrong_password_is_an_auth_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".freyafs");

        let key = derive_key("correct").unwrap();
        save(&key, &path, &Manifest::new()).unwrap();

        let wrong = derive_key("incorrect").unwrap();
        assert!(matches!(load(&wrong, &path), Err(PersistError::Auth)));
        // The envelope on disk is untouched by the failed attempt.
        assert!(load(&key, &path).unwrap().is_some());
    }

    #[test]
    fn envelope_is_base64_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".freyafs");
        let key = derive_key("pw").unwrap();
        save(&key, &path, &Manifest::new()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(STANDARD.decode(content.trim().as_bytes()).is_ok());
    }
}

//! Cryptographic utilities for relay payloads
//!
//! Every RPC payload and session event is sealed with AES-256-GCM under a key
//! that belongs to exactly one scope (a session or a machine). Blobs travel as
//! base64 of `version ‖ nonce ‖ ciphertext`.

mod keys;
mod scope;

pub use keys::{MasterSecret, ScopeKey};
pub use scope::{EncryptionScope, ScopeId, ScopeRegistry};

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;

/// AES-256-GCM encryption key size
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM
pub const NONCE_SIZE: usize = 12;

/// Leading byte of every sealed blob
pub const BLOB_VERSION: u8 = 0;

/// Encrypt data using AES-256-GCM
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    result.push(BLOB_VERSION);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt data using AES-256-GCM
pub fn decrypt(key: &[u8; KEY_SIZE], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < 1 + NONCE_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }
    if blob[0] != BLOB_VERSION {
        return Err(Error::Crypto(format!(
            "Unsupported blob version {}",
            blob[0]
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;

    let nonce = Nonce::from_slice(&blob[1..1 + NONCE_SIZE]);
    let encrypted = &blob[1 + NONCE_SIZE..];

    cipher
        .decrypt(nonce, encrypted)
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}

/// Seal a JSON value into a base64 blob
pub fn seal_json(key: &[u8; KEY_SIZE], value: &serde_json::Value) -> Result<String> {
    let plaintext = serde_json::to_vec(value)?;
    let blob = encrypt(key, &plaintext)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

/// Open a base64 blob produced by [`seal_json`]
pub fn open_json(key: &[u8; KEY_SIZE], encoded: &str) -> Result<serde_json::Value> {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Crypto(format!("Invalid base64 payload: {}", e)))?;
    let plaintext = decrypt(key, &blob)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Generate a random encryption key
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

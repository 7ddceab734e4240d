//! Key material for scoped encryption
//!
//! A single machine master secret is shared with the paired client. Every
//! scope gets its own key derived from it with HKDF-SHA256, so a key is never
//! reused across a session and a machine registration.

use super::KEY_SIZE;
use crate::error::{Error, Result};
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const HKDF_SALT: &[u8] = b"tether-scope-key-v1";

/// Machine master secret.
///
/// Zeroized on drop to prevent secret material from lingering in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; KEY_SIZE]);

impl MasterSecret {
    /// Generate a fresh random secret
    pub fn generate() -> Self {
        Self(super::generate_key())
    }

    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a base64-encoded secret
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Crypto(format!("Invalid master secret encoding: {}", e)))?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::Crypto(format!(
                "Master secret must be {} bytes, got {}",
                KEY_SIZE,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Encode as base64 (for writing back into the config file)
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Derive the key for one scope
    pub fn derive(&self, info: &str) -> Result<ScopeKey> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &self.0);
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(info.as_bytes(), &mut okm)
            .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        Ok(ScopeKey(okm))
    }
}

/// Symmetric key owned by one encryption scope
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ScopeKey(pub(crate) [u8; KEY_SIZE]);

impl ScopeKey {
    /// Access the raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

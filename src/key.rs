//! Key generation and key material encoding.
//!
//! Every capsule is sealed under its own random 256-bit key. The key never
//! touches the local disk: the packer hands it back to its caller as hex
//! [`KeyMaterial`], and the unpacker receives it the same way.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CapsuleError, Result};

/// Symmetric key size in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// AEAD nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// A 256-bit capsule key.
///
/// Zeroed on drop, not `Clone`, and redacted in `Debug` output.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Decode a key from its hex encoding.
    ///
    /// Odd-length input, non-hex characters and any decoded length other
    /// than [`KEY_SIZE`] are rejected with [`CapsuleError::KeyFormat`].
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        let decoded = Zeroizing::new(
            hex::decode(encoded).map_err(|e| CapsuleError::KeyFormat(e.to_string()))?,
        );

        if decoded.len() != KEY_SIZE {
            return Err(CapsuleError::KeyFormat(format!(
                "expected {} key bytes, got {}",
                KEY_SIZE,
                decoded.len()
            )));
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    /// Export the key as hex for hand-off to the custody service
    pub fn to_material(&self) -> KeyMaterial {
        KeyMaterial(Zeroizing::new(hex::encode(self.bytes)))
    }

    /// Access the key bytes through a closure
    pub fn expose<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; KEY_SIZE]) -> R,
    {
        f(&self.bytes)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Hex-encoded key material as returned to the caller of a pack.
///
/// The caller alone is responsible for moving this to the custody service
/// over an authenticated channel.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Zeroizing<String>);

impl KeyMaterial {
    /// Wrap an already-encoded key string (e.g. one fetched from custody)
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(Zeroizing::new(encoded.into()))
    }

    /// The encoded key
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Decode back into a usable key
    pub fn to_key(&self) -> Result<SymmetricKey> {
        SymmetricKey::from_hex(self.expose())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Generate a fresh random 256-bit key
pub fn generate_key() -> SymmetricKey {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut bytes);
    let key = SymmetricKey::new(bytes);
    bytes.zeroize();
    key
}

/// Generate a fresh 96-bit nonce.
///
/// Must be called once per encryption; nonces are never reused.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_key();
        let b = generate_key();
        a.expose(|ka| b.expose(|kb| assert_ne!(ka, kb)));
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = generate_key();
        let material = key.to_material();
        assert_eq!(material.expose().len(), KEY_SIZE * 2);

        let decoded = material.to_key().unwrap();
        key.expose(|a| decoded.expose(|b| assert_eq!(a, b)));
    }

    #[test]
    fn test_odd_length_rejected() {
        let result = SymmetricKey::from_hex("abc");
        assert!(matches!(result.unwrap_err(), CapsuleError::KeyFormat(_)));
    }

    #[test]
    fn test_non_hex_rejected() {
        let encoded = "zz".repeat(KEY_SIZE);
        let result = SymmetricKey::from_hex(&encoded);
        assert!(matches!(result.unwrap_err(), CapsuleError::KeyFormat(_)));
    }

    #[test]
    fn test_short_key_rejected() {
        let result = SymmetricKey::from_hex("00112233");
        assert!(matches!(result.unwrap_err(), CapsuleError::KeyFormat(_)));
    }

    #[test]
    fn test_debug_redacted() {
        let key = SymmetricKey::new([7u8; KEY_SIZE]);
        let material = key.to_material();
        assert!(format!("{:?}", key).contains("redacted"));
        assert!(!format!("{:?}", material).contains("0707"));
    }
}

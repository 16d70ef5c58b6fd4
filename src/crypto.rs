use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::{CapsuleError, Result};
use crate::key::{generate_nonce, SymmetricKey, NONCE_SIZE};

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Smallest valid sealed payload: nonce plus tag around an empty plaintext
pub const MIN_SEALED_SIZE: usize = NONCE_SIZE + TAG_SIZE;

fn cipher_for(key: &SymmetricKey) -> Result<Aes256Gcm> {
    key.expose(|bytes| Aes256Gcm::new_from_slice(bytes))
        .map_err(|e| CapsuleError::CryptoUnavailable(format!("AES-256-GCM setup failed: {}", e)))
}

/// Seal one payload: `nonce (12) || ciphertext || tag (16)`.
///
/// # Security
/// A fresh random nonce is drawn for every call, so sealing the same
/// plaintext twice under one key never repeats a nonce.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce = generate_nonce();

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CapsuleError::CryptoUnavailable(format!("Encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed payload.
///
/// # Security
/// Any authentication failure maps to [`CapsuleError::DecryptionFailed`]
/// whether the key is wrong or the bytes were modified, so callers get no
/// oracle distinguishing the two.
pub fn open(key: &SymmetricKey, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < MIN_SEALED_SIZE {
        return Err(CapsuleError::MalformedCapsule(format!(
            "Payload too short: {} bytes",
            sealed.len()
        )));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = cipher_for(key)?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CapsuleError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::generate_key;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_sealed_layout() {
        let key = generate_key();
        let sealed = seal(&key, b"HelloWorld").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 10 + TAG_SIZE);
        assert_eq!(open(&key, &sealed).unwrap().as_slice(), b"HelloWorld");
    }

    #[test]
    fn test_empty_plaintext() {
        let key = generate_key();
        let sealed = seal(&key, b"").unwrap();
        assert_eq!(sealed.len(), MIN_SEALED_SIZE);
        assert!(open(&key, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_every_byte_flip_detected() {
        let key = generate_key();
        let sealed = seal(&key, b"tamper evident payload").unwrap();

        for idx in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[idx] ^= 0x01;
            let result = open(&key, &tampered);
            assert!(
                matches!(result, Err(CapsuleError::DecryptionFailed)),
                "flip at byte {} was not detected",
                idx
            );
        }
    }

    #[test]
    fn test_wrong_key() {
        let key = generate_key();
        let other = generate_key();
        let sealed = seal(&key, b"Secret data").unwrap();

        let result = open(&other, &sealed);
        assert!(matches!(result, Err(CapsuleError::DecryptionFailed)));
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let key = generate_key();
        let result = open(&key, &[0u8; MIN_SEALED_SIZE - 1]);
        assert!(matches!(result, Err(CapsuleError::MalformedCapsule(_))));
    }

    #[test]
    fn test_nonce_never_repeats() {
        let key = generate_key();
        let trials = 2000;
        let nonces: HashSet<Vec<u8>> = (0..trials)
            .map(|_| seal(&key, b"same plaintext").unwrap()[..NONCE_SIZE].to_vec())
            .collect();
        assert_eq!(nonces.len(), trials);
    }

    proptest! {
        #[test]
        fn prop_seal_open_roundtrip(
            plaintext in proptest::collection::vec(any::<u8>(), 0..4096),
            key_bytes in any::<[u8; 32]>(),
        ) {
            let key = SymmetricKey::new(key_bytes);
            let sealed = seal(&key, &plaintext).unwrap();
            let opened = open(&key, &sealed).unwrap();
            prop_assert_eq!(opened.as_slice(), plaintext.as_slice());
        }
    }
}

use std::path::PathBuf;

use thiserror::Error;

/// Core error types for the capsule engine
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// Unreadable source, unwritable destination or any other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Container is truncated, unparsable or missing a required entry
    #[error("Malformed capsule: {0}")]
    MalformedCapsule(String),

    /// Key material is not a valid encoding of a 256-bit key
    #[error("Invalid key format: {0}")]
    KeyFormat(String),

    /// AEAD authentication failed.
    ///
    /// Wrong key and tampered ciphertext are deliberately reported the same way.
    #[error("Decryption failed: wrong key or corrupted capsule")]
    DecryptionFailed,

    /// Cipher, digest or signature provider could not be set up
    #[error("Cryptographic provider unavailable: {0}")]
    CryptoUnavailable(String),

    /// Overwrite-then-delete did not complete for a path (non-fatal for sweeps)
    #[error("Failed to shred {}: {source}", path.display())]
    ShredFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid parameter or state
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The session owner task is gone
    #[error("Session service is closed")]
    SessionClosed,
}

impl From<zip::result::ZipError> for CapsuleError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => CapsuleError::Io(io),
            other => CapsuleError::MalformedCapsule(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CapsuleError>;

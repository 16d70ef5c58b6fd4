//! CAPSULE - Sealed File Capsule Engine
//!
//! Seals files into portable `.cpsx` containers whose key is held by a
//! custody service, and opens them into private temp directories that are
//! shredded when the capsule expires or the session ends.
//!
//! # Security Features
//! - AES-256-GCM authenticated encryption with a fresh nonce per payload
//! - Per-capsule random keys, zeroized on drop and redacted in `Debug`
//! - SHA-256 checksum listing and optional Ed25519 manifest signature
//! - Overwrite-then-delete erasure of decrypted material (best effort)
//!
//! # Architecture
//! - `error`: Error types and result alias
//! - `key`: Key generation and key material encoding
//! - `crypto`: Payload sealing and opening
//! - `container`: The ZIP-based container codec
//! - `manifest`: Manifest record, timestamps and signing
//! - `pack` / `unpack`: Capsule creation and opening
//! - `verify`: Keyless checksum and signature checks
//! - `eraser`: Secure erasure
//! - `session`: Registry of open capsules, expiry scheduler and owner task
//! - `custody`: Boundary to the key custody backend
//! - `config` / `logging`: Ambient setup
//!
//! # Example
//! ```rust,ignore
//! use capsule::{pack, unpack, Blob, PackRequest, SessionService, UnpackOptions};
//!
//! let request = PackRequest::new(vec![Blob::new("note.txt", b"HelloWorld".to_vec())], "note.cpsx", "admin");
//! let outcome = pack(request, None).await?;
//!
//! let opened = unpack("note.cpsx", &outcome.key_material, &UnpackOptions::default()).await?;
//! let sessions = SessionService::spawn(Default::default(), Default::default());
//! sessions.add(opened).await?;
//! // ... later, on exit
//! sessions.shred_all().await?;
//! ```

pub mod config;
pub mod container;
pub mod crypto;
pub mod custody;
pub mod eraser;
pub mod error;
pub mod key;
pub mod logging;
pub mod manifest;
pub mod pack;
pub mod session;
pub mod unpack;
pub mod verify;

// Re-export commonly used types
pub use config::{load_config, Config};
pub use custody::{AccessToken, CapsuleRegistration, CustodyError, CustodyService};
#[cfg(feature = "in-memory-custody")]
pub use custody::InMemoryCustody;
pub use eraser::{Eraser, OverwriteEraser};
pub use error::{CapsuleError, Result};
pub use key::{generate_key, KeyMaterial, SymmetricKey};
pub use manifest::{Ed25519Signer, Manifest, ManifestSigner};
pub use pack::{pack, pack_with_key, Blob, PackOutcome, PackRequest};
pub use session::{
    ExpiryScheduler, OpenedCapsule, SessionHandle, SessionRegistry, SessionService, SessionStatus,
};
pub use unpack::{unpack, UnpackOptions};
pub use verify::{verify_checksums, verify_signature};

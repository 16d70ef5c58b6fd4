//! Capsule manifest and detached signing.
//!
//! The manifest is the only plaintext metadata inside a container. Once
//! built it is serialized exactly once; the signature, if any, covers those
//! serialized bytes followed by the checksum listing.

use chrono::{DateTime, NaiveDateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{CapsuleError, Result};

/// Access level written when the caller does not choose one
pub const DEFAULT_ACCESS_LEVEL: &str = "L2";

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"];
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M%:z"];

/// Parse an ISO-8601 timestamp as written by any capsule producer.
///
/// Accepts RFC 3339, minute precision (`2025-01-01T00:00Z`), explicit
/// offsets, a trailing `[Region/City]` zone id, and naive local times,
/// which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let mut s = raw.trim();
    if let Some(idx) = s.find('[') {
        s = &s[..idx];
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Some(naive) = s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        return parse_naive(naive).map(|dt| dt.and_utc());
    }

    OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| parse_naive(s).map(|dt| dt.and_utc()))
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn de_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

fn de_opt_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw))),
    }
}

/// The `manifest.json` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub capsule_id: Uuid,
    pub created_by: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub created_at: DateTime<Utc>,
    /// Absent means the capsule never expires
    #[serde(
        default,
        deserialize_with = "de_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_access_level")]
    pub access_level: String,
    #[serde(default, alias = "user_id", skip_serializing_if = "Option::is_none")]
    pub authorized_subject: Option<String>,
}

fn default_access_level() -> String {
    DEFAULT_ACCESS_LEVEL.to_string()
}

impl Manifest {
    pub fn builder(created_by: impl Into<String>) -> ManifestBuilder {
        ManifestBuilder::new(created_by)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| CapsuleError::InvalidParameter(format!("Unserializable manifest: {}", e)))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CapsuleError::MalformedCapsule(format!("Invalid manifest: {}", e)))
    }

    /// Whether the capsule has expired at `now` (`expires_at <= now`)
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Builds a [`Manifest`] with a fresh capsule id.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    created_by: String,
    created_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    access_level: String,
    authorized_subject: Option<String>,
}

impl ManifestBuilder {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            created_at: None,
            expires_at: None,
            access_level: default_access_level(),
            authorized_subject: None,
        }
    }

    pub fn expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = at;
        self
    }

    pub fn access_level(mut self, level: impl Into<String>) -> Self {
        self.access_level = level.into();
        self
    }

    pub fn authorized_subject(mut self, subject: Option<String>) -> Self {
        self.authorized_subject = subject.filter(|s| !s.trim().is_empty());
        self
    }

    /// Override the creation time (defaults to now)
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn build(self) -> Result<Manifest> {
        if self.created_by.trim().is_empty() {
            return Err(CapsuleError::InvalidParameter(
                "Creator identity must not be empty".to_string(),
            ));
        }

        Ok(Manifest {
            capsule_id: Uuid::new_v4(),
            created_by: self.created_by,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            expires_at: self.expires_at,
            access_level: self.access_level,
            authorized_subject: self.authorized_subject,
        })
    }
}

/// Bytes covered by `access.sig`: manifest JSON, then the checksum listing
pub fn signed_message(manifest_json: &[u8], checksums: Option<&[u8]>) -> Vec<u8> {
    let mut message = manifest_json.to_vec();
    if let Some(listing) = checksums {
        message.extend_from_slice(listing);
    }
    message
}

/// A pluggable producer of detached manifest signatures.
pub trait ManifestSigner: Send + Sync {
    /// Short algorithm name for logs
    fn algorithm(&self) -> &'static str;

    /// Sign `message`, returning raw signature bytes
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Ed25519 manifest signer.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Fresh key pair; the caller decides whether to keep the public half
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load a signing key from its 32-byte hex seed
    pub fn from_hex(seed_hex: &str) -> Result<Self> {
        let seed = Zeroizing::new(
            hex::decode(seed_hex.trim()).map_err(|e| CapsuleError::KeyFormat(e.to_string()))?,
        );
        let seed: &[u8; 32] = seed.as_slice().try_into().map_err(|_| {
            CapsuleError::KeyFormat(format!("signing seed must be 32 bytes, got {}", seed.len()))
        })?;
        Ok(Self {
            key: SigningKey::from_bytes(seed),
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex of the public key, for publication alongside the capsule
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl ManifestSigner for Ed25519Signer {
    fn algorithm(&self) -> &'static str {
        "ed25519"
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }
}

/// Parse a hex Ed25519 public key
pub fn verifying_key_from_hex(encoded: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(encoded.trim()).map_err(|e| CapsuleError::KeyFormat(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CapsuleError::KeyFormat("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CapsuleError::KeyFormat(e.to_string()))
}

/// Check an Ed25519 detached signature over `message`
pub fn verify_ed25519(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => key.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

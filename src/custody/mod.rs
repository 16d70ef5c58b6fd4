//! Boundary to the key custody backend.
//!
//! The backend stores each capsule's key and hands it only to subjects that
//! hold an unrevoked grant on an unlocked capsule. Callers see opaque
//! success or failure. A networked backend implements [`CustodyService`];
//! the in-process `InMemoryCustody` sits behind the `in-memory-custody`
//! feature.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::key::KeyMaterial;
use crate::pack::PackOutcome;

#[cfg(any(test, feature = "in-memory-custody"))]
mod memory;

#[cfg(any(test, feature = "in-memory-custody"))]
pub use memory::{CapsuleRecord, InMemoryCustody, Lifecycle};

/// Delay between `initiate_delete` and the capsule's forced expiry
pub const DESTRUCTION_GRACE_SECS: i64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CustodyError {
    /// Unknown token, wrong role, no grant, or the capsule is locked
    #[error("access denied")]
    Denied,
    #[error("capsule not found: {0}")]
    NotFound(Uuid),
    /// The request itself is unacceptable
    #[error("custody request rejected: {0}")]
    Rejected(String),
}

/// Bearer token presented to the custody service. Redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// What the packer's caller registers with custody after a pack.
#[derive(Debug, Clone)]
pub struct CapsuleRegistration {
    pub capsule_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// SHA-256 hex of the plaintext content
    pub content_digest: String,
    pub key_material: KeyMaterial,
    pub access_level: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CapsuleRegistration {
    pub fn from_pack(outcome: &PackOutcome) -> Self {
        Self {
            capsule_id: outcome.capsule_id,
            name: outcome.display_name.clone(),
            description: None,
            content_digest: outcome.content_digest.clone(),
            key_material: outcome.key_material.clone(),
            access_level: outcome.manifest.access_level.clone(),
            expires_at: outcome.manifest.expires_at,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[async_trait]
pub trait CustodyService: Send + Sync {
    /// Register a freshly packed capsule and escrow its key (admin only)
    async fn create_capsule(
        &self,
        token: &AccessToken,
        registration: CapsuleRegistration,
    ) -> Result<(), CustodyError>;

    /// Release the key to a subject holding a live grant
    async fn fetch_decryption_key(
        &self,
        token: &AccessToken,
        capsule_id: Uuid,
    ) -> Result<KeyMaterial, CustodyError>;

    /// Allow `subject` to fetch the key (admin only, idempotent)
    async fn grant_access(
        &self,
        token: &AccessToken,
        capsule_id: Uuid,
        subject: &str,
    ) -> Result<(), CustodyError>;

    /// Withdraw a grant (admin only)
    async fn revoke_access(
        &self,
        token: &AccessToken,
        capsule_id: Uuid,
        subject: &str,
    ) -> Result<(), CustodyError>;

    /// Flip a capsule between locked and unlocked (admin only)
    async fn toggle_lock(&self, token: &AccessToken, capsule_id: Uuid) -> Result<(), CustodyError>;

    /// Mark a capsule for destruction; its expiry is pulled in to shortly
    /// after now (admin only)
    async fn initiate_delete(&self, token: &AccessToken, capsule_id: Uuid) -> Result<(), CustodyError>;
}

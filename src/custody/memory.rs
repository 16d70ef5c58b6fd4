//! In-process custody backend with grants, locks and delete marking.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::{AccessToken, CapsuleRegistration, CustodyError, CustodyService, DESTRUCTION_GRACE_SECS};
use crate::key::KeyMaterial;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Principal {
    Admin(String),
    Subject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    MarkedForDestruction,
}

/// Custody-side view of one capsule
#[derive(Debug, Clone)]
pub struct CapsuleRecord {
    pub capsule_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub content_digest: String,
    pub access_level: String,
    pub created_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: bool,
    pub lifecycle: Lifecycle,
    grants: HashSet<String>,
    key_material: KeyMaterial,
}

impl CapsuleRecord {
    pub fn is_granted(&self, subject: &str) -> bool {
        self.grants.contains(subject)
    }
}

#[derive(Default)]
struct CustodyState {
    tokens: HashMap<AccessToken, Principal>,
    capsules: HashMap<Uuid, CapsuleRecord>,
}

/// In-process custody backend for tests and local composition.
#[derive(Clone, Default)]
pub struct InMemoryCustody {
    state: Arc<RwLock<CustodyState>>,
}

impl InMemoryCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token carrying the admin role
    pub async fn issue_admin_token(&self, admin: impl Into<String>) -> AccessToken {
        self.issue(Principal::Admin(admin.into())).await
    }

    /// Issue a token for a client subject
    pub async fn issue_subject_token(&self, subject: impl Into<String>) -> AccessToken {
        self.issue(Principal::Subject(subject.into())).await
    }

    /// Snapshot of a capsule record
    pub async fn record(&self, capsule_id: Uuid) -> Option<CapsuleRecord> {
        self.state.read().await.capsules.get(&capsule_id).cloned()
    }

    async fn issue(&self, principal: Principal) -> AccessToken {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let token = AccessToken::new(hex::encode(raw));
        self.state.write().await.tokens.insert(token.clone(), principal);
        token
    }
}

impl fmt::Debug for InMemoryCustody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCustody").finish_non_exhaustive()
    }
}

fn require_admin(state: &CustodyState, token: &AccessToken) -> Result<String, CustodyError> {
    match state.tokens.get(token) {
        Some(Principal::Admin(name)) => Ok(name.clone()),
        _ => Err(CustodyError::Denied),
    }
}

fn capsule_mut(
    state: &mut CustodyState,
    capsule_id: Uuid,
) -> Result<&mut CapsuleRecord, CustodyError> {
    state
        .capsules
        .get_mut(&capsule_id)
        .ok_or(CustodyError::NotFound(capsule_id))
}

#[async_trait]
impl CustodyService for InMemoryCustody {
    async fn create_capsule(
        &self,
        token: &AccessToken,
        registration: CapsuleRegistration,
    ) -> Result<(), CustodyError> {
        let mut state = self.state.write().await;
        let admin = require_admin(&state, token)?;

        if registration.name.is_empty() || registration.content_digest.is_empty() {
            return Err(CustodyError::Rejected("Missing required fields".to_string()));
        }
        if registration.key_material.to_key().is_err() {
            return Err(CustodyError::Rejected("Key material is not a valid key".to_string()));
        }
        if state.capsules.contains_key(&registration.capsule_id) {
            return Err(CustodyError::Rejected(format!(
                "Capsule {} already registered",
                registration.capsule_id
            )));
        }

        let record = CapsuleRecord {
            capsule_id: registration.capsule_id,
            name: registration.name,
            description: registration.description,
            content_digest: registration.content_digest,
            access_level: registration.access_level,
            created_by: admin.clone(),
            expires_at: registration.expires_at,
            locked: false,
            lifecycle: Lifecycle::Active,
            grants: HashSet::new(),
            key_material: registration.key_material,
        };
        state.capsules.insert(record.capsule_id, record);

        info!(action = "CAPSULE_CREATE", actor = %admin, capsule_id = %registration.capsule_id, "custody event");
        Ok(())
    }

    async fn fetch_decryption_key(
        &self,
        token: &AccessToken,
        capsule_id: Uuid,
    ) -> Result<KeyMaterial, CustodyError> {
        let state = self.state.read().await;
        let Some(Principal::Subject(subject)) = state.tokens.get(token) else {
            warn!(action = "KEY_FETCH_FORBIDDEN", %capsule_id, "custody event");
            return Err(CustodyError::Denied);
        };

        let released = state.capsules.get(&capsule_id).filter(|record| {
            record.is_granted(subject) && !record.locked && record.lifecycle == Lifecycle::Active
        });

        match released {
            Some(record) => {
                info!(action = "KEY_FETCH", actor = %subject, %capsule_id, "custody event");
                Ok(record.key_material.clone())
            }
            None => {
                warn!(action = "KEY_FETCH_FORBIDDEN", actor = %subject, %capsule_id, "custody event");
                Err(CustodyError::Denied)
            }
        }
    }

    async fn grant_access(
        &self,
        token: &AccessToken,
        capsule_id: Uuid,
        subject: &str,
    ) -> Result<(), CustodyError> {
        if subject.trim().is_empty() {
            return Err(CustodyError::Rejected("subject is required".to_string()));
        }

        let mut state = self.state.write().await;
        let admin = require_admin(&state, token)?;
        capsule_mut(&mut state, capsule_id)?
            .grants
            .insert(subject.to_string());

        info!(action = "ACCESS_GRANT", actor = %admin, %capsule_id, granted_to = subject, "custody event");
        Ok(())
    }

    async fn revoke_access(
        &self,
        token: &AccessToken,
        capsule_id: Uuid,
        subject: &str,
    ) -> Result<(), CustodyError> {
        let mut state = self.state.write().await;
        let admin = require_admin(&state, token)?;
        capsule_mut(&mut state, capsule_id)?.grants.remove(subject);

        info!(action = "ACCESS_REVOKE", actor = %admin, %capsule_id, revoked_from = subject, "custody event");
        Ok(())
    }

    async fn toggle_lock(&self, token: &AccessToken, capsule_id: Uuid) -> Result<(), CustodyError> {
        let mut state = self.state.write().await;
        let admin = require_admin(&state, token)?;
        let record = capsule_mut(&mut state, capsule_id)?;
        record.locked = !record.locked;

        info!(action = "TOGGLE_LOCK", actor = %admin, %capsule_id, locked = record.locked, "custody event");
        Ok(())
    }

    async fn initiate_delete(&self, token: &AccessToken, capsule_id: Uuid) -> Result<(), CustodyError> {
        let mut state = self.state.write().await;
        let admin = require_admin(&state, token)?;
        let record = capsule_mut(&mut state, capsule_id)?;
        record.lifecycle = Lifecycle::MarkedForDestruction;
        record.expires_at = Some(Utc::now() + Duration::seconds(DESTRUCTION_GRACE_SECS));

        info!(action = "INITIATE_DELETE", actor = %admin, %capsule_id, "custody event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::generate_key;

    fn registration() -> CapsuleRegistration {
        CapsuleRegistration {
            capsule_id: Uuid::new_v4(),
            name: "quarterly".to_string(),
            description: None,
            content_digest: "ab".repeat(32),
            key_material: generate_key().to_material(),
            access_level: "L2".to_string(),
            expires_at: None,
        }
    }

    async fn registered() -> (InMemoryCustody, AccessToken, CapsuleRegistration) {
        let custody = InMemoryCustody::new();
        let admin = custody.issue_admin_token("root").await;
        let reg = registration();
        custody.create_capsule(&admin, reg.clone()).await.unwrap();
        (custody, admin, reg)
    }

    #[tokio::test]
    async fn test_key_released_only_with_grant() {
        let (custody, admin, reg) = registered().await;
        let alice = custody.issue_subject_token("alice@example.com").await;

        assert_eq!(
            custody.fetch_decryption_key(&alice, reg.capsule_id).await,
            Err(CustodyError::Denied)
        );

        custody
            .grant_access(&admin, reg.capsule_id, "alice@example.com")
            .await
            .unwrap();
        let key = custody.fetch_decryption_key(&alice, reg.capsule_id).await.unwrap();
        assert_eq!(key, reg.key_material);

        custody
            .revoke_access(&admin, reg.capsule_id, "alice@example.com")
            .await
            .unwrap();
        assert_eq!(
            custody.fetch_decryption_key(&alice, reg.capsule_id).await,
            Err(CustodyError::Denied)
        );
    }

    #[tokio::test]
    async fn test_lock_blocks_key_fetch() {
        let (custody, admin, reg) = registered().await;
        let bob = custody.issue_subject_token("bob").await;
        custody.grant_access(&admin, reg.capsule_id, "bob").await.unwrap();

        custody.toggle_lock(&admin, reg.capsule_id).await.unwrap();
        assert!(custody.record(reg.capsule_id).await.unwrap().locked);
        assert_eq!(
            custody.fetch_decryption_key(&bob, reg.capsule_id).await,
            Err(CustodyError::Denied)
        );

        custody.toggle_lock(&admin, reg.capsule_id).await.unwrap();
        assert!(custody.fetch_decryption_key(&bob, reg.capsule_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_initiate_delete_pulls_in_expiry() {
        let (custody, admin, reg) = registered().await;
        let bob = custody.issue_subject_token("bob").await;
        custody.grant_access(&admin, reg.capsule_id, "bob").await.unwrap();

        let before = Utc::now();
        custody.initiate_delete(&admin, reg.capsule_id).await.unwrap();

        let record = custody.record(reg.capsule_id).await.unwrap();
        assert_eq!(record.lifecycle, Lifecycle::MarkedForDestruction);
        let expires = record.expires_at.unwrap();
        assert!(expires > before);
        assert!(expires <= Utc::now() + Duration::seconds(DESTRUCTION_GRACE_SECS));
        assert_eq!(
            custody.fetch_decryption_key(&bob, reg.capsule_id).await,
            Err(CustodyError::Denied)
        );
    }

    #[tokio::test]
    async fn test_admin_operations_need_admin_token() {
        let (custody, _, reg) = registered().await;
        let client = custody.issue_subject_token("mallory").await;
        let forged = AccessToken::new("not-a-token");

        assert_eq!(
            custody.grant_access(&client, reg.capsule_id, "mallory").await,
            Err(CustodyError::Denied)
        );
        assert_eq!(custody.toggle_lock(&forged, reg.capsule_id).await, Err(CustodyError::Denied));
        assert_eq!(
            custody.create_capsule(&client, registration()).await,
            Err(CustodyError::Denied)
        );
    }

    #[tokio::test]
    async fn test_unknown_capsule_and_bad_registration() {
        let (custody, admin, reg) = registered().await;
        let missing = Uuid::new_v4();

        assert_eq!(
            custody.initiate_delete(&admin, missing).await,
            Err(CustodyError::NotFound(missing))
        );
        assert!(matches!(
            custody.create_capsule(&admin, reg).await,
            Err(CustodyError::Rejected(_))
        ));

        let mut bad_key = registration();
        bad_key.key_material = KeyMaterial::new("xyz");
        assert!(matches!(
            custody.create_capsule(&admin, bad_key).await,
            Err(CustodyError::Rejected(_))
        ));
    }
}

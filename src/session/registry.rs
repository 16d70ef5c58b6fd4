//! Registry of open capsules.
//!
//! Every structural mutation takes `&mut self`, so whoever owns the registry
//! serializes them. Readers hold a [`SessionView`] instead; the entry lock is
//! only taken for short, non-blocking sections and never while shredding, so
//! a view is never stuck behind a sweep.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{CapsuleSummary, OpenedCapsule, SessionStatus};
use crate::eraser::{Eraser, OverwriteEraser};
use crate::error::CapsuleError;

type Entries = Arc<RwLock<Vec<OpenedCapsule>>>;

fn read(entries: &Entries) -> RwLockReadGuard<'_, Vec<OpenedCapsule>> {
    entries.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(entries: &Entries) -> RwLockWriteGuard<'_, Vec<OpenedCapsule>> {
    entries.write().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of a sweep or shutdown pass, by [`OpenedCapsule::session_id`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose temp directory was shredded and which were deregistered
    pub shredded: Vec<Uuid>,
    /// Sessions whose shred failed
    pub failed: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.shredded.is_empty() && self.failed.is_empty()
    }
}

/// Live, read-only view of the registry.
///
/// Cloning is cheap, and every read reflects the registry's current state.
#[derive(Debug, Clone)]
pub struct SessionView {
    entries: Entries,
}

impl SessionView {
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        read(&self.entries)
            .iter()
            .any(|c| c.session_id() == session_id)
    }

    pub fn get(&self, session_id: Uuid) -> Option<CapsuleSummary> {
        read(&self.entries)
            .iter()
            .find(|c| c.session_id() == session_id)
            .map(OpenedCapsule::summary)
    }

    /// Every open session of one capsule; a container may be opened more than once
    pub fn sessions_of(&self, capsule_id: Uuid) -> Vec<CapsuleSummary> {
        read(&self.entries)
            .iter()
            .filter(|c| c.capsule_id() == capsule_id)
            .map(OpenedCapsule::summary)
            .collect()
    }

    /// Current entries in insertion order
    pub fn snapshot(&self) -> Vec<CapsuleSummary> {
        read(&self.entries)
            .iter()
            .map(OpenedCapsule::summary)
            .collect()
    }
}

/// The set of capsules whose plaintext is currently on disk.
pub struct SessionRegistry {
    entries: Entries,
    eraser: Arc<dyn Eraser>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(OverwriteEraser::default()))
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("open", &read(&self.entries).len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(eraser: Arc<dyn Eraser>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            eraser,
        }
    }

    /// Register a freshly opened capsule; visible to every view immediately
    pub fn add(&mut self, capsule: OpenedCapsule) {
        info!(
            session_id = %capsule.session_id(),
            capsule_id = %capsule.capsule_id(),
            name = capsule.name(),
            expires_at = ?capsule.expires_at(),
            "capsule session opened"
        );
        write(&self.entries).push(capsule);
    }

    pub fn list_all(&self) -> SessionView {
        SessionView {
            entries: Arc::clone(&self.entries),
        }
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }

    pub fn eraser(&self) -> Arc<dyn Eraser> {
        Arc::clone(&self.eraser)
    }

    /// Shred and deregister every capsule with `expires_at <= now`.
    ///
    /// A failed shred is logged and leaves that entry registered as
    /// [`SessionStatus::ShredFailed`] for the next sweep; the remaining
    /// entries are still processed.
    pub async fn sweep_expired(&mut self, now: DateTime<Utc>) -> SweepReport {
        let targets = self.mark_shredding(|c| c.is_expired_at(now));
        if targets.is_empty() {
            return SweepReport::default();
        }

        info!(count = targets.len(), "sweeping expired capsules");
        let report = self.shred_targets(targets).await;

        let mut entries = write(&self.entries);
        entries.retain(|c| !report.shredded.contains(&c.session_id()));
        for capsule in entries.iter_mut() {
            if report.failed.contains(&capsule.session_id()) {
                capsule.set_status(SessionStatus::ShredFailed);
            }
        }
        report
    }

    /// Shred every registered capsule and empty the registry.
    ///
    /// Entries are removed even when their shred fails; the failures are
    /// logged and reported.
    pub async fn shred_all(&mut self) -> SweepReport {
        let targets = self.mark_shredding(|_| true);
        if targets.is_empty() {
            return SweepReport::default();
        }

        info!(count = targets.len(), "shredding all open capsules");
        let report = self.shred_targets(targets).await;
        write(&self.entries).clear();

        for id in &report.failed {
            error!(session_id = %id, "capsule data may survive shutdown");
        }
        report
    }

    fn mark_shredding<F>(&self, mut select: F) -> Vec<(Uuid, PathBuf)>
    where
        F: FnMut(&OpenedCapsule) -> bool,
    {
        let mut entries = write(&self.entries);
        entries
            .iter_mut()
            .filter(|c| select(c))
            .map(|c| {
                c.set_status(SessionStatus::Shredding);
                (c.session_id(), c.temp_directory().to_path_buf())
            })
            .collect()
    }

    async fn shred_targets(&self, targets: Vec<(Uuid, PathBuf)>) -> SweepReport {
        let mut report = SweepReport::default();

        for (session_id, dir) in targets {
            let eraser = Arc::clone(&self.eraser);
            let path = dir.clone();
            let result = tokio::task::spawn_blocking(move || eraser.shred(&path))
                .await
                .unwrap_or_else(|e| {
                    Err(CapsuleError::ShredFailure {
                        path: dir.clone(),
                        source: std::io::Error::other(format!("shred task failed: {}", e)),
                    })
                });

            match result {
                Ok(()) => {
                    info!(session_id = %session_id, dir = %dir.display(), "capsule data shredded");
                    report.shredded.push(session_id);
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "failed to shred capsule data");
                    report.failed.push(session_id);
                }
            }
        }

        report
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        // Last line of defence if the owner never ran shred_all
        let leftovers: Vec<OpenedCapsule> = write(&self.entries).drain(..).collect();
        for capsule in leftovers {
            warn!(capsule_id = %capsule.capsule_id(), "registry dropped with open capsule; shredding");
            if let Err(e) = self.eraser.shred(capsule.temp_directory()) {
                error!(capsule_id = %capsule.capsule_id(), error = %e, "failed to shred on drop");
            }
        }
    }
}

//! Client-side sessions over decrypted capsules.
//!
//! - [`registry`]: the set of currently open capsules and their erasure
//! - [`scheduler`]: the periodic expiry trigger
//! - [`service`]: the single owner task that applies all registry mutations

pub mod registry;
pub mod scheduler;
pub mod service;

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use registry::{SessionRegistry, SessionView, SweepReport};
pub use scheduler::{ExpiryScheduler, SchedulerState};
pub use service::{SessionCommand, SessionHandle, SessionService};

/// Lifecycle of an open capsule inside the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Decrypted files are available
    Open,
    /// A sweep or shutdown is erasing the temp directory
    Shredding,
    /// The last shred attempt failed; the next sweep retries it
    ShredFailed,
}

/// A capsule whose plaintext currently lives in a temp directory.
///
/// The temp directory belongs to this record alone, so the type is
/// deliberately not `Clone`.
#[derive(Debug)]
pub struct OpenedCapsule {
    session_id: Uuid,
    capsule_id: Uuid,
    name: String,
    temp_directory: PathBuf,
    files: Vec<PathBuf>,
    expires_at: Option<DateTime<Utc>>,
    status: SessionStatus,
}

impl OpenedCapsule {
    pub fn new(
        capsule_id: Uuid,
        name: impl Into<String>,
        temp_directory: PathBuf,
        files: Vec<PathBuf>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            capsule_id,
            name: name.into(),
            temp_directory,
            files,
            expires_at,
            status: SessionStatus::Open,
        }
    }

    /// Identity of this opening; two unpacks of one container differ here
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn capsule_id(&self) -> Uuid {
        self.capsule_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn temp_directory(&self) -> &Path {
        &self.temp_directory
    }

    /// Decrypted files inside the temp directory
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    /// `expires_at <= now`; capsules without expiry never expire
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Human-readable status line for listings
    pub fn status_label(&self) -> String {
        match self.expires_at {
            None => "Active (No Expiry)".to_string(),
            Some(at) => format!("Expires: {}", at.format("%Y-%m-%d %H:%M")),
        }
    }

    pub fn summary(&self) -> CapsuleSummary {
        CapsuleSummary {
            session_id: self.session_id,
            capsule_id: self.capsule_id,
            name: self.name.clone(),
            temp_directory: self.temp_directory.clone(),
            expires_at: self.expires_at,
            status: self.status,
        }
    }
}

/// Read-only snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleSummary {
    pub session_id: Uuid,
    pub capsule_id: Uuid,
    pub name: String,
    pub temp_directory: PathBuf,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

impl fmt::Display for CapsuleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expires_at {
            Some(at) => write!(f, "{} (expires {})", self.name, at.format("%Y-%m-%d %H:%M")),
            None => write!(f, "{} (no expiry)", self.name),
        }
    }
}

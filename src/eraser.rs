//! Overwrite-then-delete erasure of decrypted material.
//!
//! # Limitations
//! This is best effort. Journaling and copy-on-write filesystems, SSD wear
//! leveling, snapshots and backups can all retain earlier copies of the
//! overwritten blocks. Nothing here defends against forensic recovery on such
//! storage.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::error::{CapsuleError, Result};

const OVERWRITE_CHUNK: usize = 64 * 1024;

/// Destroys a file or directory tree.
pub trait Eraser: Send + Sync {
    /// Shred `path`: files are overwritten then deleted, directories are
    /// emptied recursively then removed. A path that is already gone is not
    /// an error.
    fn shred(&self, path: &Path) -> Result<()>;
}

/// Overwrites every byte with random data before unlinking.
#[derive(Debug, Clone)]
pub struct OverwriteEraser {
    passes: u32,
}

impl Default for OverwriteEraser {
    fn default() -> Self {
        Self { passes: 1 }
    }
}

impl OverwriteEraser {
    /// Eraser making `passes` random overwrites (at least one)
    pub fn new(passes: u32) -> Self {
        Self {
            passes: passes.max(1),
        }
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    fn shred_dir(&self, path: &Path) -> Result<()> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(shred_failure(path, e)),
        };

        // Keep going after a failed child so every other file still gets overwritten
        let mut first_error = None;
        for entry in entries {
            let result = entry
                .map_err(|e| shred_failure(path, e))
                .and_then(|entry| self.shred(&entry.path()));
            if let Err(e) = result {
                warn!(error = %e, "failed to shred directory child");
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(shred_failure(path, e)),
        }
    }

    fn shred_file(&self, path: &Path) -> Result<()> {
        make_writable(path);

        match overwrite_file(path, self.passes) {
            Ok(bytes) => debug!(path = %path.display(), bytes, passes = self.passes, "file overwritten"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "file vanished before it could be shredded");
                return Ok(());
            }
            Err(e) => return Err(shred_failure(path, e)),
        }

        unlink(path)
    }
}

impl Eraser for OverwriteEraser {
    fn shred(&self, path: &Path) -> Result<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "shred target already gone");
                return Ok(());
            }
            Err(e) => return Err(shred_failure(path, e)),
        };

        let file_type = metadata.file_type();
        if file_type.is_dir() {
            self.shred_dir(path)
        } else if file_type.is_file() {
            self.shred_file(path)
        } else {
            // Symlinks are never followed; FIFOs, sockets and device nodes
            // hold no plaintext and opening them for writing can block
            debug!(path = %path.display(), "unlinking non-regular file");
            unlink(path)
        }
    }
}

fn unlink(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(shred_failure(path, e)),
    }
}

/// Overwrite the full current length of `path` with random bytes, `passes`
/// times, syncing after each pass. Returns the number of bytes per pass.
pub(crate) fn overwrite_file(path: &Path, passes: u32) -> std::io::Result<u64> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();

    let mut buf = vec![0u8; OVERWRITE_CHUNK];
    for _ in 0..passes.max(1) {
        file.seek(SeekFrom::Start(0))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(OVERWRITE_CHUNK as u64) as usize;
            OsRng.fill_bytes(&mut buf[..n]);
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.sync_data()?;
    }
    Ok(len)
}

#[cfg(unix)]
fn make_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        if metadata.permissions().mode() & 0o200 == 0 {
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        }
    }
}

#[cfg(not(unix))]
fn make_writable(path: &Path) {
    if let Ok(metadata) = fs::metadata(path) {
        let mut permissions = metadata.permissions();
        if permissions.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            let _ = fs::set_permissions(path, permissions);
        }
    }
}

fn shred_failure(path: &Path, source: std::io::Error) -> CapsuleError {
    CapsuleError::ShredFailure {
        path: path.to_path_buf(),
        source,
    }
}

//! Sealing plaintext into a `.cpsx` container.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::container::{
    payload_entry_name, sha256_hex, ChecksumListing, ContainerWriter, CHECKSUMS_ENTRY,
    MANIFEST_ENTRY, SIGNATURE_ENTRY,
};
use crate::crypto::seal;
use crate::error::{CapsuleError, Result};
use crate::key::{generate_key, KeyMaterial, SymmetricKey};
use crate::manifest::{signed_message, Manifest, ManifestSigner, DEFAULT_ACCESS_LEVEL};

/// One plaintext payload to seal.
pub struct Blob {
    name: String,
    data: Zeroizing<Vec<u8>>,
}

impl Blob {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: Zeroizing::new(data),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read a single file; the blob takes the file's name
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                CapsuleError::InvalidParameter(format!("No usable file name in {}", path.display()))
            })?
            .to_string();

        let data = tokio::fs::read(path).await.map_err(|e| {
            CapsuleError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read source file {}: {}", path.display(), e),
            ))
        })?;

        Ok(Self::new(name, data))
    }

    /// Read a file, or every regular file directly inside a directory
    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            CapsuleError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open source {}: {}", path.display(), e),
            ))
        })?;

        if !metadata.is_dir() {
            return Ok(vec![Self::from_file(path).await?]);
        }

        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            } else {
                debug!(path = %entry.path().display(), "skipping non-file source entry");
            }
        }
        files.sort();

        let mut blobs = Vec::with_capacity(files.len());
        for file in files {
            blobs.push(Self::from_file(file).await?);
        }
        Ok(blobs)
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Everything needed to seal one capsule.
#[derive(Debug)]
pub struct PackRequest {
    pub blobs: Vec<Blob>,
    pub destination: PathBuf,
    /// Name the caller registers with the custody service
    pub display_name: String,
    pub created_by: String,
    pub authorized_subject: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_level: String,
    /// Add a `checksums.sha256` listing of the encrypted entries
    pub write_checksums: bool,
}

impl PackRequest {
    pub fn new(blobs: Vec<Blob>, destination: impl Into<PathBuf>, created_by: impl Into<String>) -> Self {
        let destination = destination.into();
        let display_name = destination
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            blobs,
            destination,
            display_name,
            created_by: created_by.into(),
            authorized_subject: None,
            expires_at: None,
            access_level: DEFAULT_ACCESS_LEVEL.to_string(),
            write_checksums: true,
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn authorized_subject(mut self, subject: Option<String>) -> Self {
        self.authorized_subject = subject;
        self
    }

    pub fn expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = at;
        self
    }

    pub fn access_level(mut self, level: impl Into<String>) -> Self {
        self.access_level = level.into();
        self
    }

    pub fn write_checksums(mut self, enabled: bool) -> Self {
        self.write_checksums = enabled;
        self
    }
}

/// Result of a successful pack.
#[derive(Debug)]
pub struct PackOutcome {
    pub capsule_id: Uuid,
    pub display_name: String,
    pub container: PathBuf,
    /// SHA-256 of the plaintext, for integrity registration with custody
    pub content_digest: String,
    /// `(blob name, SHA-256 of its plaintext)` in blob order
    pub blob_digests: Vec<(String, String)>,
    /// The capsule key. The caller alone forwards it to custody.
    pub key_material: KeyMaterial,
    /// The manifest as written into the container
    pub manifest: Manifest,
}

/// Seal `request` under a freshly generated key.
///
/// # Errors
/// - [`CapsuleError::Io`] if a source cannot be read or the destination written
/// - [`CapsuleError::CryptoUnavailable`] if the cipher cannot be set up
/// - [`CapsuleError::InvalidParameter`] for empty or badly named blobs
pub async fn pack(request: PackRequest, signer: Option<&dyn ManifestSigner>) -> Result<PackOutcome> {
    pack_with_key(request, generate_key(), signer).await
}

/// Seal `request` under a caller-supplied key.
///
/// The container is first written to `<destination>.partial` and only
/// renamed into place once complete; a failed pack leaves nothing behind.
pub async fn pack_with_key(
    request: PackRequest,
    key: SymmetricKey,
    signer: Option<&dyn ManifestSigner>,
) -> Result<PackOutcome> {
    let PackRequest {
        blobs,
        destination,
        display_name,
        created_by,
        authorized_subject,
        expires_at,
        access_level,
        write_checksums,
    } = request;

    if blobs.is_empty() {
        return Err(CapsuleError::InvalidParameter(
            "Nothing to seal: no payload blobs".to_string(),
        ));
    }
    for blob in &blobs {
        validate_blob_name(blob.name())?;
    }

    // Encrypt every blob under its own nonce and digest the plaintext
    let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(blobs.len());
    let mut blob_digests = Vec::with_capacity(blobs.len());
    for blob in &blobs {
        let sealed = seal(&key, &blob.data)?;
        blob_digests.push((blob.name.clone(), sha256_hex(&blob.data)));
        entries.push((payload_entry_name(&blob.name), sealed));
    }
    drop(blobs);

    let content_digest = content_digest(&blob_digests);

    let manifest = Manifest::builder(created_by)
        .expires_at(expires_at)
        .access_level(access_level)
        .authorized_subject(authorized_subject)
        .build()?;
    let manifest_json = manifest.to_json()?;

    let checksums = write_checksums.then(|| {
        let mut listing = ChecksumListing::new();
        for (name, bytes) in &entries {
            listing.push(name.clone(), sha256_hex(bytes));
        }
        listing.to_bytes()
    });

    let signature = match signer {
        Some(signer) => {
            let message = signed_message(&manifest_json, checksums.as_deref());
            let signature = signer.sign(&message)?;
            debug!(algorithm = signer.algorithm(), "manifest signed");
            Some(signature)
        }
        None => None,
    };

    let partial = partial_path(&destination);
    let write_target = partial.clone();
    let written = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut writer = ContainerWriter::create(&write_target)?;
        writer.add_entry(MANIFEST_ENTRY, &manifest_json)?;
        for (name, bytes) in &entries {
            writer.add_entry(name, bytes)?;
        }
        if let Some(listing) = &checksums {
            writer.add_entry(CHECKSUMS_ENTRY, listing)?;
        }
        if let Some(signature) = &signature {
            writer.add_entry(SIGNATURE_ENTRY, signature)?;
        }
        let file = writer.finish()?;
        file.sync_all()?;
        Ok(())
    })
    .await
    .map_err(|e| CapsuleError::Io(std::io::Error::other(format!("Pack task failed: {}", e))))
    .and_then(|inner| inner);

    let finalized = match written {
        Ok(()) => tokio::fs::rename(&partial, &destination)
            .await
            .map_err(CapsuleError::from),
        Err(e) => Err(e),
    };

    if let Err(e) = finalized {
        if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %partial.display(), error = %cleanup, "failed to remove partial container");
            }
        }
        return Err(e);
    }

    info!(
        capsule_id = %manifest.capsule_id,
        payloads = blob_digests.len(),
        signed = signer.is_some(),
        container = %destination.display(),
        "capsule sealed"
    );

    Ok(PackOutcome {
        capsule_id: manifest.capsule_id,
        display_name,
        container: destination,
        content_digest,
        blob_digests,
        key_material: key.to_material(),
        manifest,
    })
}

fn validate_blob_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(CapsuleError::InvalidParameter(format!(
            "Invalid payload name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Digest of a single blob, or of the sorted per-blob listing for several
fn content_digest(blob_digests: &[(String, String)]) -> String {
    if let [(_, digest)] = blob_digests {
        return digest.clone();
    }

    let mut lines: Vec<String> = blob_digests
        .iter()
        .map(|(name, digest)| format!("{}  {}\n", digest, name))
        .collect();
    lines.sort();
    sha256_hex(lines.concat().as_bytes())
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name: OsString = destination.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

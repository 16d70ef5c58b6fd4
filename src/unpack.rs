//! Opening a `.cpsx` container into a private temp directory.

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::container::{payload_name, ContainerReader, MANIFEST_ENTRY, PAYLOAD_PREFIX};
use crate::crypto::open;
use crate::eraser::{Eraser, OverwriteEraser};
use crate::error::{CapsuleError, Result};
use crate::key::{KeyMaterial, SymmetricKey};
use crate::manifest::Manifest;
use crate::session::OpenedCapsule;

/// Default prefix of per-capsule temp directories
pub const DEFAULT_TEMP_PREFIX: &str = "capsule_";

/// Where decrypted capsules are materialized.
#[derive(Debug, Clone)]
pub struct UnpackOptions {
    /// Parent of every per-capsule temp directory; created if missing
    pub temp_root: PathBuf,
    pub temp_prefix: String,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir(),
            temp_prefix: DEFAULT_TEMP_PREFIX.to_string(),
        }
    }
}

impl UnpackOptions {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
            ..Self::default()
        }
    }

    pub fn temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.temp_prefix = prefix.into();
        self
    }
}

/// Decrypted payloads, held only until they are written out
struct Decrypted {
    manifest: Manifest,
    payloads: Vec<(String, Zeroizing<Vec<u8>>)>,
}

/// Open `container` with `key` and materialize its payloads.
///
/// Nothing touches the disk until every payload has authenticated. The
/// returned capsule exclusively owns a fresh `<temp_root>/<prefix><uuid>`
/// directory (mode 0700 on unix).
///
/// # Errors
/// - [`CapsuleError::KeyFormat`] if `key` is not a valid key encoding
/// - [`CapsuleError::MalformedCapsule`] for a truncated archive, a missing or
///   unparsable manifest, no payloads, or a payload name with separators
/// - [`CapsuleError::DecryptionFailed`] for a wrong key or altered payload
/// - [`CapsuleError::Io`] if the temp directory cannot be written
pub async fn unpack<P: AsRef<Path>>(
    container: P,
    key: &KeyMaterial,
    options: &UnpackOptions,
) -> Result<OpenedCapsule> {
    let container = container.as_ref().to_path_buf();
    let key = key.to_key()?;

    let name = container
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_root = options.temp_root.clone();
    let dir_name = format!("{}{}", options.temp_prefix, Uuid::new_v4());

    let (manifest, temp_directory, files) = tokio::task::spawn_blocking(move || {
        let decrypted = decrypt_container(&container, &key)?;
        drop(key);

        let dir = temp_root.join(dir_name);
        let files = materialize(&temp_root, &dir, &decrypted.payloads)?;
        Ok::<_, CapsuleError>((decrypted.manifest, dir, files))
    })
    .await
    .map_err(|e| CapsuleError::Io(std::io::Error::other(format!("Unpack task failed: {}", e))))??;

    info!(
        capsule_id = %manifest.capsule_id,
        files = files.len(),
        dir = %temp_directory.display(),
        "capsule opened"
    );

    Ok(OpenedCapsule::new(
        manifest.capsule_id,
        name,
        temp_directory,
        files,
        manifest.expires_at,
    ))
}

fn decrypt_container(path: &Path, key: &SymmetricKey) -> Result<Decrypted> {
    let mut reader = ContainerReader::open(path)?;

    let manifest_bytes = reader
        .read_entry(MANIFEST_ENTRY)?
        .ok_or_else(|| CapsuleError::MalformedCapsule("Missing manifest.json".to_string()))?;
    let manifest = Manifest::from_json(&manifest_bytes)?;

    let entries = reader.entries_with_prefix(PAYLOAD_PREFIX);
    if entries.is_empty() {
        return Err(CapsuleError::MalformedCapsule(
            "Container holds no payload".to_string(),
        ));
    }

    let mut payloads = Vec::with_capacity(entries.len());
    for entry in &entries {
        let Some(name) = payload_name(entry) else {
            // Directory markers and foreign files under payload/
            debug!(entry = %entry, "ignoring non-payload entry");
            continue;
        };
        validate_payload_name(name)?;

        let sealed = read_sealed(&mut reader, entry)?;
        let plaintext = open(key, &sealed)?;
        payloads.push((name.to_string(), plaintext));
    }

    if payloads.is_empty() {
        return Err(CapsuleError::MalformedCapsule(
            "Container holds no payload".to_string(),
        ));
    }

    Ok(Decrypted { manifest, payloads })
}

/// Read a sealed payload entry.
///
/// The archive CRC covers the sealed bytes, so a CRC mismatch is an altered
/// payload and reports the same way as a failed authentication.
fn read_sealed<R: Read + std::io::Seek>(reader: &mut ContainerReader<R>, entry: &str) -> Result<Vec<u8>> {
    let mut stream = reader
        .entry(entry)?
        .ok_or_else(|| CapsuleError::MalformedCapsule(format!("Missing entry {}", entry)))?;

    let mut sealed = Vec::new();
    stream.read_to_end(&mut sealed).map_err(|e| match e.kind() {
        ErrorKind::InvalidData => CapsuleError::DecryptionFailed,
        ErrorKind::UnexpectedEof => {
            CapsuleError::MalformedCapsule(format!("Entry {} is truncated", entry))
        }
        _ => CapsuleError::Io(e),
    })?;
    Ok(sealed)
}

fn validate_payload_name(name: &str) -> Result<()> {
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(CapsuleError::MalformedCapsule(format!(
            "Invalid payload name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Write every payload under a new private `dir`; on failure the partial
/// directory is shredded before the error is returned.
fn materialize(
    temp_root: &Path,
    dir: &Path,
    payloads: &[(String, Zeroizing<Vec<u8>>)],
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(temp_root)?;
    create_private_dir(dir)?;

    let written = payloads
        .iter()
        .map(|(name, data)| {
            let path = dir.join(name);
            write_private_file(&path, data)?;
            Ok(path)
        })
        .collect::<Result<Vec<_>>>();

    if let Err(e) = &written {
        warn!(dir = %dir.display(), error = %e, "materialization failed; shredding partial output");
        if let Err(shred) = OverwriteEraser::default().shred(dir) {
            warn!(error = %shred, "failed to shred partial temp directory");
        }
    }
    written
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir(dir)
}

fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{payload_entry_name, ContainerWriter};
    use crate::crypto::seal;
    use crate::key::generate_key;
    use crate::pack::{pack, Blob, PackRequest};
    use chrono::TimeZone;

    async fn packed(dir: &Path, data: &[u8]) -> (PathBuf, KeyMaterial) {
        let dest = dir.join("note.cpsx");
        let request = PackRequest::new(vec![Blob::new("note.txt", data.to_vec())], &dest, "admin");
        let outcome = pack(request, None).await.unwrap();
        (dest, outcome.key_material)
    }

    fn write_container(path: &Path, entries: &[(&str, Vec<u8>)]) {
        let mut writer = ContainerWriter::create(path).unwrap();
        for (name, bytes) in entries {
            writer.add_entry(name, bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    fn manifest_json() -> Vec<u8> {
        Manifest::builder("admin").build().unwrap().to_json().unwrap()
    }

    fn count_temp_dirs(root: &Path) -> usize {
        match fs::read_dir(root) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn test_unpack_recovers_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let temp_root = dir.path().join("open");
        let expiry = chrono::Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let dest = dir.path().join("hello.cpsx");
        let request = PackRequest::new(vec![Blob::new("hello.txt", b"HelloWorld".to_vec())], &dest, "admin")
            .expires_at(Some(expiry));
        let outcome = pack(request, None).await.unwrap();

        let options = UnpackOptions::new(&temp_root).temp_prefix("test_");
        let opened = unpack(&dest, &outcome.key_material, &options).await.unwrap();

        assert_eq!(opened.capsule_id(), outcome.capsule_id);
        assert_eq!(opened.name(), "hello.cpsx");
        assert_eq!(opened.expires_at(), Some(expiry));
        assert!(opened.temp_directory().starts_with(&temp_root));
        assert!(opened
            .temp_directory()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("test_"));
        assert_eq!(opened.files().len(), 1);
        assert_eq!(fs::read(&opened.files()[0]).unwrap(), b"HelloWorld");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(opened.temp_directory()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn test_each_unpack_gets_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, key) = packed(dir.path(), b"twice").await;
        let options = UnpackOptions::new(dir.path().join("open"));

        let first = unpack(&dest, &key, &options).await.unwrap();
        let second = unpack(&dest, &key, &options).await.unwrap();
        assert_ne!(first.temp_directory(), second.temp_directory());
    }

    #[tokio::test]
    async fn test_wrong_key_materializes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let temp_root = dir.path().join("open");
        let (dest, _) = packed(dir.path(), b"secret").await;

        let wrong = generate_key().to_material();
        let result = unpack(&dest, &wrong, &UnpackOptions::new(&temp_root)).await;
        assert!(matches!(result, Err(CapsuleError::DecryptionFailed)));
        assert_eq!(count_temp_dirs(&temp_root), 0);
    }

    #[tokio::test]
    async fn test_bad_key_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, _) = packed(dir.path(), b"secret").await;

        let bad_keys = vec![String::new(), "abc".to_string(), "zz".repeat(32), "00".repeat(16)];
        for bad in bad_keys {
            let result = unpack(&dest, &KeyMaterial::new(bad.clone()), &UnpackOptions::default()).await;
            assert!(matches!(result, Err(CapsuleError::KeyFormat(_))), "accepted {:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_tampered_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let temp_root = dir.path().join("open");
        let key = generate_key();
        let mut sealed = seal(&key, b"tamper me").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;

        let path = dir.path().join("bad.cpsx");
        write_container(
            &path,
            &[
                (MANIFEST_ENTRY, manifest_json()),
                (&payload_entry_name("x.txt"), sealed),
            ],
        );

        let result = unpack(&path, &key.to_material(), &UnpackOptions::new(&temp_root)).await;
        assert!(matches!(result, Err(CapsuleError::DecryptionFailed)));
        assert_eq!(count_temp_dirs(&temp_root), 0);
    }

    #[tokio::test]
    async fn test_flipped_archive_byte_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, key) = packed(dir.path(), b"a payload long enough to find").await;

        // Locate the stored payload inside the archive and flip one byte
        let mut reader = ContainerReader::open(&dest).unwrap();
        let sealed = reader.read_entry(&payload_entry_name("note.txt")).unwrap().unwrap();
        drop(reader);

        let mut archive = fs::read(&dest).unwrap();
        let offset = archive
            .windows(sealed.len())
            .position(|w| w == sealed.as_slice())
            .unwrap();
        archive[offset + sealed.len() / 2] ^= 0x01;
        fs::write(&dest, &archive).unwrap();

        let result = unpack(&dest, &key, &UnpackOptions::new(dir.path().join("open"))).await;
        assert!(matches!(result, Err(CapsuleError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key();
        let path = dir.path().join("nomanifest.cpsx");
        write_container(&path, &[(&payload_entry_name("x"), seal(&key, b"x").unwrap())]);

        let result = unpack(&path, &key.to_material(), &UnpackOptions::default()).await;
        assert!(matches!(result, Err(CapsuleError::MalformedCapsule(_))));
    }

    #[tokio::test]
    async fn test_missing_payload() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key();
        let path = dir.path().join("empty.cpsx");
        write_container(&path, &[(MANIFEST_ENTRY, manifest_json())]);

        let result = unpack(&path, &key.to_material(), &UnpackOptions::default()).await;
        assert!(matches!(result, Err(CapsuleError::MalformedCapsule(_))));
    }

    #[tokio::test]
    async fn test_payload_with_separator_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key();
        let path = dir.path().join("nested.cpsx");
        write_container(
            &path,
            &[
                (MANIFEST_ENTRY, manifest_json()),
                ("payload/sub/x.enc", seal(&key, b"x").unwrap()),
            ],
        );

        let result = unpack(&path, &key.to_material(), &UnpackOptions::default()).await;
        assert!(matches!(result, Err(CapsuleError::MalformedCapsule(_))));
    }

    #[tokio::test]
    async fn test_truncated_container() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, key) = packed(dir.path(), b"cut short").await;

        let bytes = fs::read(&dest).unwrap();
        fs::write(&dest, &bytes[..bytes.len() / 2]).unwrap();

        let result = unpack(&dest, &key, &UnpackOptions::default()).await;
        assert!(matches!(result, Err(CapsuleError::MalformedCapsule(_))));
    }

    #[tokio::test]
    async fn test_missing_container_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key().to_material();
        let result = unpack(dir.path().join("nope.cpsx"), &key, &UnpackOptions::default()).await;
        assert!(matches!(result, Err(CapsuleError::Io(_))));
    }
}

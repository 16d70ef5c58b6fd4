//! Keyless integrity checks over an existing container.
//!
//! Neither check decrypts anything; both only need the container file.

use std::io::{ErrorKind, Read, Seek};
use std::path::Path;

use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::container::{
    ChecksumListing, ContainerReader, CHECKSUMS_ENTRY, MANIFEST_ENTRY, PAYLOAD_PREFIX,
    SIGNATURE_ENTRY,
};
use crate::error::{CapsuleError, Result};
use crate::manifest::{signed_message, verify_ed25519};

const HASH_BUFFER: usize = 64 * 1024;

/// Check every entry against `checksums.sha256`.
///
/// # Security
/// - Does NOT need the key and does NOT decrypt
/// - Digests are compared in constant time
/// - Every payload entry must be listed; an unlisted payload fails the check
///
/// # Errors
/// [`CapsuleError::MalformedCapsule`] if the container has no checksum
/// listing or the listing cannot be parsed.
pub async fn verify_checksums<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref().to_path_buf();
    run_blocking(move || check_checksums(&path)).await
}

/// Check `access.sig` against `public_key`.
///
/// Returns `Ok(false)` for a missing or invalid signature.
pub async fn verify_signature<P: AsRef<Path>>(path: P, public_key: &VerifyingKey) -> Result<bool> {
    let path = path.as_ref().to_path_buf();
    let public_key = *public_key;
    run_blocking(move || check_signature(&path, &public_key)).await
}

async fn run_blocking<F>(f: F) -> Result<bool>
where
    F: FnOnce() -> Result<bool> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CapsuleError::Io(std::io::Error::other(format!("Verify task failed: {}", e))))?
}

fn check_checksums(path: &Path) -> Result<bool> {
    let mut reader = ContainerReader::open(path)?;

    let listing_bytes = reader.read_entry(CHECKSUMS_ENTRY)?.ok_or_else(|| {
        CapsuleError::MalformedCapsule("Container has no checksum listing".to_string())
    })?;
    let listing = ChecksumListing::parse(&listing_bytes)?;

    let mut intact = true;

    for payload in reader.entries_with_prefix(PAYLOAD_PREFIX) {
        if listing.get(&payload).is_none() {
            warn!(entry = %payload, "payload missing from checksum listing");
            intact = false;
        }
    }

    for (entry, expected) in listing.iter() {
        let Ok(expected) = hex::decode(expected) else {
            warn!(entry, "checksum is not hex");
            intact = false;
            continue;
        };

        match digest_entry(&mut reader, entry)? {
            Some(actual) if bool::from(actual.as_slice().ct_eq(&expected)) => {}
            Some(_) => {
                warn!(entry, "checksum mismatch");
                intact = false;
            }
            None => {
                warn!(entry, "listed entry is missing");
                intact = false;
            }
        }
    }

    info!(path = %path.display(), entries = listing.len(), intact, "checksums verified");
    Ok(intact)
}

/// Stream one entry through SHA-256.
///
/// A corrupted stored entry fails its archive CRC; that counts as a digest
/// that matches nothing.
fn digest_entry<R: Read + Seek>(reader: &mut ContainerReader<R>, entry: &str) -> Result<Option<Vec<u8>>> {
    let Some(mut stream) = reader.entry(entry)? else {
        return Ok(None);
    };

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    loop {
        match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == ErrorKind::InvalidData => return Ok(Some(Vec::new())),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(hasher.finalize().to_vec()))
}

fn check_signature(path: &Path, public_key: &VerifyingKey) -> Result<bool> {
    let mut reader = ContainerReader::open(path)?;

    let manifest = reader
        .read_entry(MANIFEST_ENTRY)?
        .ok_or_else(|| CapsuleError::MalformedCapsule("Missing manifest.json".to_string()))?;
    let checksums = reader.read_entry(CHECKSUMS_ENTRY)?;

    let Some(signature) = reader.read_entry(SIGNATURE_ENTRY)? else {
        warn!(path = %path.display(), "container is not signed");
        return Ok(false);
    };

    let message = signed_message(&manifest, checksums.as_deref());
    let valid = verify_ed25519(public_key, &message, &signature);
    info!(path = %path.display(), valid, "signature verified");
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::container::{payload_entry_name, sha256_hex, ContainerWriter};
    use crate::manifest::{Ed25519Signer, ManifestSigner};
    use crate::pack::{pack, Blob, PackRequest};

    async fn signed_capsule(dir: &Path) -> (PathBuf, Ed25519Signer) {
        let dest = dir.join("signed.cpsx");
        let signer = Ed25519Signer::generate();
        let request = PackRequest::new(
            vec![
                Blob::new("a.txt", b"alpha".to_vec()),
                Blob::new("b.txt", b"beta".to_vec()),
            ],
            &dest,
            "admin",
        );
        pack(request, Some(&signer)).await.unwrap();
        (dest, signer)
    }

    fn flip_inside(path: &Path, needle: &[u8]) {
        let mut bytes = std::fs::read(path).unwrap();
        let at = bytes.windows(needle.len()).position(|w| w == needle).unwrap();
        bytes[at + needle.len() / 2] ^= 0x01;
        std::fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn test_fresh_capsule_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, signer) = signed_capsule(dir.path()).await;

        assert!(verify_checksums(&dest).await.unwrap());
        assert!(verify_signature(&dest, &signer.verifying_key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_other_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, _) = signed_capsule(dir.path()).await;

        let stranger = Ed25519Signer::generate();
        assert!(!verify_signature(&dest, &stranger.verifying_key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, _) = signed_capsule(dir.path()).await;

        let mut reader = ContainerReader::open(&dest).unwrap();
        let sealed = reader.read_entry(&payload_entry_name("a.txt")).unwrap().unwrap();
        drop(reader);

        flip_inside(&dest, &sealed);
        assert!(!verify_checksums(&dest).await.unwrap());
    }

    #[tokio::test]
    async fn test_forged_listing_fails_signature() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("forged.cpsx");
        let signer = Ed25519Signer::generate();

        let manifest = b"{\"capsule_id\":\"x\"}".to_vec();
        let payload = b"sealed bytes".to_vec();
        let entry = payload_entry_name("x.txt");

        let mut honest = ChecksumListing::new();
        honest.push(entry.clone(), sha256_hex(&payload));
        let signature = signer
            .sign(&signed_message(&manifest, Some(&honest.to_bytes())))
            .unwrap();

        // Listing swapped after signing
        let mut forged = ChecksumListing::new();
        forged.push(entry.clone(), sha256_hex(b"other bytes"));

        let mut writer = ContainerWriter::create(&dest).unwrap();
        writer.add_entry(MANIFEST_ENTRY, &manifest).unwrap();
        writer.add_entry(&entry, &payload).unwrap();
        writer.add_entry(CHECKSUMS_ENTRY, &forged.to_bytes()).unwrap();
        writer.add_entry(SIGNATURE_ENTRY, &signature).unwrap();
        writer.finish().unwrap();

        assert!(!verify_signature(&dest, &signer.verifying_key()).await.unwrap());
        assert!(!verify_checksums(&dest).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsigned_and_unlisted() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bare.cpsx");
        let request = PackRequest::new(vec![Blob::new("a.txt", b"alpha".to_vec())], &dest, "admin")
            .write_checksums(false);
        pack(request, None).await.unwrap();

        let key = Ed25519Signer::generate().verifying_key();
        assert!(!verify_signature(&dest, &key).await.unwrap());
        assert!(matches!(
            verify_checksums(&dest).await,
            Err(CapsuleError::MalformedCapsule(_))
        ));
    }
}

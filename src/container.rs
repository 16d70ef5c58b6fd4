//! The `.cpsx` container codec.
//!
//! A container is a ZIP archive of named entries. Entry order carries no
//! meaning; readers look entries up by name or by prefix.
//!
//! Layout:
//! - `manifest.json`: UTF-8 JSON manifest
//! - `payload/<name>.enc`: nonce (12 bytes) || ciphertext || tag (16 bytes)
//! - `checksums.sha256` (optional): `"<hex digest>  <entry-name>"` lines
//! - `access.sig` (optional): detached signature bytes

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{CapsuleError, Result};

/// File extension of capsule containers
pub const CONTAINER_EXTENSION: &str = "cpsx";

/// Manifest entry name
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Prefix shared by all encrypted payload entries
pub const PAYLOAD_PREFIX: &str = "payload/";

/// Suffix of encrypted payload entries
pub const PAYLOAD_SUFFIX: &str = ".enc";

/// Optional checksum listing entry
pub const CHECKSUMS_ENTRY: &str = "checksums.sha256";

/// Optional detached signature entry
pub const SIGNATURE_ENTRY: &str = "access.sig";

/// Entry name for a payload with the given file name
pub fn payload_entry_name(name: &str) -> String {
    format!("{}{}{}", PAYLOAD_PREFIX, name, PAYLOAD_SUFFIX)
}

/// Recover the payload file name from an entry name, if it is a payload entry
pub fn payload_name(entry: &str) -> Option<&str> {
    entry
        .strip_prefix(PAYLOAD_PREFIX)?
        .strip_suffix(PAYLOAD_SUFFIX)
        .filter(|name| !name.is_empty())
}

/// Reject entry names that could escape a materialization directory
pub fn validate_entry_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.split('/').any(|part| part == ".." || part == ".");

    if bad {
        return Err(CapsuleError::MalformedCapsule(format!(
            "Invalid entry name: {:?}",
            name
        )));
    }
    Ok(())
}

/// SHA-256 of `data` as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Writes a container entry by entry.
///
/// Nothing is valid on disk until [`ContainerWriter::finish`] has written
/// the central directory.
pub struct ContainerWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    names: HashSet<String>,
}

impl ContainerWriter<File> {
    /// Create (or truncate) a container file at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref()).map_err(|e| {
            CapsuleError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create container file: {}", e),
            ))
        })?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Seek> ContainerWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
            names: HashSet::new(),
        }
    }

    /// Append one named entry. Duplicate names are rejected.
    pub fn add_entry(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_entry_name(name)?;
        if !self.names.insert(name.to_string()) {
            return Err(CapsuleError::InvalidParameter(format!(
                "Duplicate container entry: {}",
                name
            )));
        }

        // Ciphertext does not compress; store everything as-is
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .unix_permissions(0o600);

        self.zip.start_file(name, options)?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    /// Write the central directory and hand back the underlying writer
    pub fn finish(self) -> Result<W> {
        Ok(self.zip.finish()?)
    }
}

/// Random-access reader over a container.
pub struct ContainerReader<R: Read + Seek> {
    zip: ZipArchive<R>,
}

impl ContainerReader<BufReader<File>> {
    /// Open a container file.
    ///
    /// A truncated or partially written file has no valid central directory
    /// and is rejected with [`CapsuleError::MalformedCapsule`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            CapsuleError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open container file: {}", e),
            ))
        })?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> ContainerReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        let zip = ZipArchive::new(inner).map_err(|e| match e {
            zip::result::ZipError::Io(io) if io.kind() != ErrorKind::UnexpectedEof => {
                CapsuleError::Io(io)
            }
            other => CapsuleError::MalformedCapsule(format!("Not a valid container: {}", other)),
        })?;
        Ok(Self { zip })
    }

    /// Number of entries in the archive
    pub fn len(&self) -> usize {
        self.zip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zip.len() == 0
    }

    /// All entry names, sorted
    pub fn entry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.zip.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    /// Entry names starting with `prefix`, sorted
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .zip
            .file_names()
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.zip.file_names().any(|n| n == name)
    }

    /// Stream one entry without loading the archive into memory.
    ///
    /// Returns `Ok(None)` if no entry has that name. The CRC of the entry is
    /// checked when the stream reaches its end.
    pub fn entry(&mut self, name: &str) -> Result<Option<impl Read + '_>> {
        match self.zip.by_name(name) {
            Ok(file) => Ok(Some(file)),
            Err(zip::result::ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one entry fully into memory
    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(mut reader) = self.entry(name)? else {
            return Ok(None);
        };

        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::InvalidData => {
                CapsuleError::MalformedCapsule(format!("Entry {} is corrupt: {}", name, e))
            }
            _ => CapsuleError::Io(e),
        })?;
        Ok(Some(bytes))
    }
}

/// The `checksums.sha256` listing: one `"<digest>  <entry-name>"` line per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumListing {
    entries: Vec<(String, String)>,
}

impl ChecksumListing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the digest of an entry
    pub fn push(&mut self, entry: impl Into<String>, digest: impl Into<String>) {
        self.entries.push((entry.into(), digest.into()));
    }

    /// Digest recorded for an entry
    pub fn get(&self, entry: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, digest)| digest.as_str())
    }

    /// `(entry, digest)` pairs in listing order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, d)| (n.as_str(), d.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for (name, digest) in &self.entries {
            out.push_str(digest);
            out.push_str("  ");
            out.push_str(name);
            out.push('\n');
        }
        out.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| {
            CapsuleError::MalformedCapsule("Checksum listing is not UTF-8".to_string())
        })?;

        let mut listing = Self::new();
        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            let (digest, name) = line.split_once("  ").ok_or_else(|| {
                CapsuleError::MalformedCapsule(format!("Bad checksum line: {:?}", line))
            })?;
            listing.push(name, digest);
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ContainerWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer.add_entry(name, bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_entries_by_name_and_prefix() {
        let bytes = build(&[
            ("payload/b.txt.enc", &b"bbb"[..]),
            (MANIFEST_ENTRY, &b"{}"[..]),
            ("payload/a.txt.enc", &b"aaa"[..]),
        ]);

        let mut reader = ContainerReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.len(), 3);
        assert!(reader.contains(MANIFEST_ENTRY));
        assert_eq!(
            reader.entries_with_prefix(PAYLOAD_PREFIX),
            vec!["payload/a.txt.enc", "payload/b.txt.enc"]
        );
        assert_eq!(reader.read_entry("payload/b.txt.enc").unwrap().unwrap(), b"bbb");
        assert!(reader.read_entry("missing").unwrap().is_none());
    }

    #[test]
    fn test_stream_entry() {
        let big = vec![0x5au8; 200_000];
        let bytes = build(&[("payload/big.enc", &big[..])]);

        let mut reader = ContainerReader::new(Cursor::new(bytes)).unwrap();
        let mut stream = reader.entry("payload/big.enc").unwrap().unwrap();
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, big.len());
    }

    #[test]
    fn test_truncated_archive_rejected() {
        let body = vec![1u8; 512];
        let bytes = build(&[(MANIFEST_ENTRY, &b"{\"x\":1}"[..]), ("payload/a.enc", &body[..])]);
        let truncated = bytes[..bytes.len() / 2].to_vec();

        let result = ContainerReader::new(Cursor::new(truncated));
        assert!(matches!(result, Err(CapsuleError::MalformedCapsule(_))));
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let mut writer = ContainerWriter::new(Cursor::new(Vec::new()));
        writer.add_entry(MANIFEST_ENTRY, b"{}").unwrap();
        let result = writer.add_entry(MANIFEST_ENTRY, b"{}");
        assert!(matches!(result, Err(CapsuleError::InvalidParameter(_))));
    }

    #[test]
    fn test_entry_name_validation() {
        assert!(validate_entry_name("payload/report.pdf.enc").is_ok());
        assert!(validate_entry_name("payload/../../etc/passwd.enc").is_err());
        assert!(validate_entry_name("/abs.enc").is_err());
        assert!(validate_entry_name("payload\\x.enc").is_err());
    }

    #[test]
    fn test_payload_names() {
        assert_eq!(payload_entry_name("a.txt"), "payload/a.txt.enc");
        assert_eq!(payload_name("payload/a.txt.enc"), Some("a.txt"));
        assert_eq!(payload_name("payload/.enc"), None);
        assert_eq!(payload_name(MANIFEST_ENTRY), None);
    }

    #[test]
    fn test_checksum_listing_parse() {
        let mut listing = ChecksumListing::new();
        listing.push("payload/a.enc", sha256_hex(b"a"));
        listing.push("payload/b.enc", sha256_hex(b"b"));

        let bytes = listing.to_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with(&format!("{}  payload/a.enc\n", sha256_hex(b"a"))));

        let parsed = ChecksumListing::parse(&bytes).unwrap();
        assert_eq!(parsed, listing);
        assert_eq!(parsed.get("payload/b.enc"), Some(sha256_hex(b"b").as_str()));

        assert!(ChecksumListing::parse(b"no-separator-here\n").is_err());
    }
}

//! Configuration loading and validation.
//!
//! Every section and field is optional; an empty file yields
//! [`Config::default`].
//!
//! ```toml
//! [session]
//! sweep_interval_secs = 60
//! temp_root = "/run/user/1000/capsules"
//! temp_prefix = "capsule_"
//!
//! [eraser]
//! passes = 1
//!
//! [pack]
//! access_level = "L2"
//! sign_manifest = true
//! write_checksums = true
//! signing_key_hex = "…64 hex chars…"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::eraser::OverwriteEraser;
use crate::error::{CapsuleError, Result};
use crate::manifest::{Ed25519Signer, DEFAULT_ACCESS_LEVEL};
use crate::session::{ExpiryScheduler, SessionRegistry};
use crate::unpack::{UnpackOptions, DEFAULT_TEMP_PREFIX};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub eraser: EraserConfig,

    #[serde(default)]
    pub pack: PackConfig,
}

/// Client session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Seconds between expiry sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Parent of the per-capsule temp directories; the OS temp dir if unset.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,

    /// Name prefix of per-capsule temp directories.
    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            temp_root: None,
            temp_prefix: default_temp_prefix(),
        }
    }
}

impl SessionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn unpack_options(&self) -> UnpackOptions {
        let mut options = UnpackOptions::default().temp_prefix(self.temp_prefix.clone());
        if let Some(root) = &self.temp_root {
            options.temp_root = root.clone();
        }
        options
    }
}

/// Secure eraser settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EraserConfig {
    /// Random overwrite passes per file.
    #[serde(default = "default_passes")]
    pub passes: u32,
}

impl Default for EraserConfig {
    fn default() -> Self {
        Self {
            passes: default_passes(),
        }
    }
}

/// Packer settings.
#[derive(Clone, Deserialize)]
pub struct PackConfig {
    /// Access level written into new manifests.
    #[serde(default = "default_access_level")]
    pub access_level: String,

    /// Attach an Ed25519 signature over the manifest.
    #[serde(default = "default_true")]
    pub sign_manifest: bool,

    /// Attach a checksum listing of the encrypted entries.
    #[serde(default = "default_true")]
    pub write_checksums: bool,

    /// Hex Ed25519 seed; a fresh key is generated per run if unset.
    #[serde(default)]
    pub signing_key_hex: Option<String>,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            access_level: default_access_level(),
            sign_manifest: true,
            write_checksums: true,
            signing_key_hex: None,
        }
    }
}

impl std::fmt::Debug for PackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackConfig")
            .field("access_level", &self.access_level)
            .field("sign_manifest", &self.sign_manifest)
            .field("write_checksums", &self.write_checksums)
            .field(
                "signing_key_hex",
                &self.signing_key_hex.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl PackConfig {
    /// The signer to use, if signing is enabled
    pub fn signer(&self) -> Result<Option<Ed25519Signer>> {
        if !self.sign_manifest {
            return Ok(None);
        }
        match &self.signing_key_hex {
            Some(seed) => Ed25519Signer::from_hex(seed).map(Some),
            None => Ok(Some(Ed25519Signer::generate())),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_temp_prefix() -> String {
    DEFAULT_TEMP_PREFIX.to_string()
}

fn default_passes() -> u32 {
    1
}

fn default_access_level() -> String {
    DEFAULT_ACCESS_LEVEL.to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| CapsuleError::InvalidParameter(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidParameter`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.session.sweep_interval_secs == 0 {
            return Err(CapsuleError::InvalidParameter(
                "session.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.session.temp_prefix.contains(['/', '\\']) {
            return Err(CapsuleError::InvalidParameter(
                "session.temp_prefix must not contain path separators".to_string(),
            ));
        }
        if self.eraser.passes == 0 {
            return Err(CapsuleError::InvalidParameter(
                "eraser.passes must be at least 1".to_string(),
            ));
        }
        if self.pack.access_level.trim().is_empty() {
            return Err(CapsuleError::InvalidParameter(
                "pack.access_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn eraser(&self) -> OverwriteEraser {
        OverwriteEraser::new(self.eraser.passes)
    }

    /// Empty registry shredding with the configured eraser
    pub fn registry(&self) -> SessionRegistry {
        SessionRegistry::new(Arc::new(self.eraser()))
    }

    /// Idle scheduler at the configured interval
    pub fn expiry_scheduler(&self) -> ExpiryScheduler {
        ExpiryScheduler::new(self.session.sweep_interval())
    }
}

/// Load and validate configuration from a TOML file.
///
/// # Errors
///
/// Returns [`CapsuleError::Io`] if the file cannot be read and
/// [`CapsuleError::InvalidParameter`] if it does not parse or validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        CapsuleError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config at {}: {e}", path.display()),
        ))
    })?;
    Config::from_toml(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = Config::default();
        assert_eq!(config.session.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.session.temp_prefix, "capsule_");
        assert!(config.session.temp_root.is_none());
        assert_eq!(config.eraser.passes, 1);
        assert_eq!(config.pack.access_level, "L2");
        assert!(config.pack.sign_manifest);
        assert!(config.pack.write_checksums);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.session.sweep_interval_secs, 60);
        assert_eq!(config.eraser.passes, 1);
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config = Config::from_toml(
            r#"
            [session]
            sweep_interval_secs = 5
            temp_root = "/var/tmp/capsules"

            [pack]
            sign_manifest = false
            "#,
        )
        .unwrap();

        assert_eq!(config.session.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.session.temp_prefix, "capsule_");
        let options = config.session.unpack_options();
        assert_eq!(options.temp_root, PathBuf::from("/var/tmp/capsules"));
        assert!(config.pack.write_checksums);
        assert!(config.pack.signer().unwrap().is_none());
    }

    #[test]
    fn zero_values_rejected() {
        for doc in [
            "[session]\nsweep_interval_secs = 0",
            "[eraser]\npasses = 0",
            "[session]\ntemp_prefix = \"../x\"",
        ] {
            assert!(
                matches!(Config::from_toml(doc), Err(CapsuleError::InvalidParameter(_))),
                "accepted {doc:?}"
            );
        }
    }

    #[test]
    fn configured_signing_key_is_stable() {
        let seed = "07".repeat(32);
        let config = Config::from_toml(&format!("[pack]\nsigning_key_hex = \"{seed}\"")).unwrap();

        let first = config.pack.signer().unwrap().unwrap();
        let second = config.pack.signer().unwrap().unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());
        assert!(!format!("{:?}", config.pack).contains(&seed));
    }

    #[test]
    fn load_missing_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(CapsuleError::Io(_))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capsule.toml");
        std::fs::write(&path, "[eraser]\npasses = 3\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.eraser().passes(), 3);
    }
}

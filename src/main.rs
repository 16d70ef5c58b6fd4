//! `capsule` - standalone packer and verifier.
//!
//! Prints results on stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::info;

use capsule::config::{load_config, Config};
use capsule::manifest::{parse_timestamp, verifying_key_from_hex, ManifestSigner};
use capsule::{logging, pack, verify_checksums, verify_signature, Blob, PackRequest};

#[derive(Debug, Parser)]
#[command(name = "capsule", version, about = "Seal files into capsules and check existing ones")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seal a file or directory into a new capsule; prompts for anything not given
    Pack(PackArgs),
    /// Check a capsule's checksum listing and, optionally, its signature
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
struct PackArgs {
    /// Source file or directory
    #[arg(long)]
    source: Option<PathBuf>,

    /// Destination `.cpsx` path
    #[arg(long)]
    dest: Option<PathBuf>,

    /// Creator identity recorded in the manifest
    #[arg(long)]
    creator: Option<String>,

    /// Authorized subject id
    #[arg(long)]
    subject: Option<String>,

    /// Expiry as YYYY-MM-DDTHH:MM (UTC)
    #[arg(long)]
    expires: Option<String>,

    /// Do not sign the manifest
    #[arg(long)]
    no_sign: bool,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    /// Capsule file to check
    file: PathBuf,

    /// Hex Ed25519 public key to check the signature against
    #[arg(long)]
    public_key: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_cli();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Pack(args) => run_pack(&config, args).await.map(|()| true),
        Command::Verify(args) => run_verify(args).await,
    }
}

struct Prompter {
    lines: Lines<BufReader<Stdin>>,
}

impl Prompter {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Use `given` if present, otherwise ask on stdin
    async fn value(&mut self, given: Option<String>, label: &str) -> Result<String> {
        if let Some(value) = given {
            return Ok(value);
        }

        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{label}: ").as_bytes()).await?;
        stdout.flush().await?;

        let line = self
            .lines
            .next_line()
            .await
            .context("failed to read from stdin")?
            .unwrap_or_default();
        Ok(line.trim().to_string())
    }
}

async fn run_pack(config: &Config, args: PackArgs) -> Result<()> {
    let mut prompt = Prompter::new();

    let source = prompt
        .value(args.source.map(path_string), "Source file or directory")
        .await?;
    if source.is_empty() {
        bail!("a source path is required");
    }
    let dest = prompt
        .value(args.dest.map(path_string), "Destination .cpsx path")
        .await?;
    if dest.is_empty() {
        bail!("a destination path is required");
    }
    let creator = prompt.value(args.creator, "Creator").await?;
    let subject = prompt.value(args.subject, "Authorized subject id").await?;
    let expires = prompt
        .value(args.expires, "Expiry (YYYY-MM-DDTHH:MM, blank for none)")
        .await?;

    let expires_at = if expires.is_empty() {
        None
    } else {
        match parse_timestamp(&expires) {
            Some(at) => Some(at),
            None => bail!("unrecognised expiry {expires:?}; expected YYYY-MM-DDTHH:MM"),
        }
    };

    let blobs = Blob::from_path(&source)
        .await
        .with_context(|| format!("failed to read {source}"))?;

    let request = PackRequest::new(blobs, &dest, creator)
        .authorized_subject(Some(subject))
        .expires_at(expires_at)
        .access_level(config.pack.access_level.clone())
        .write_checksums(config.pack.write_checksums);

    let signer = if args.no_sign {
        None
    } else {
        config.pack.signer().context("invalid signing key")?
    };

    let outcome = pack(request, signer.as_ref().map(|s| s as &dyn ManifestSigner))
        .await
        .with_context(|| format!("failed to seal {dest}"))?;

    info!(capsule_id = %outcome.capsule_id, "capsule written");
    println!("capsule_id: {}", outcome.capsule_id);
    println!("container: {}", outcome.container.display());
    println!("content_digest: {}", outcome.content_digest);
    println!("key_material: {}", outcome.key_material.expose());
    if let Some(signer) = &signer {
        println!("public_key: {}", signer.public_key_hex());
    }
    Ok(())
}

async fn run_verify(args: VerifyArgs) -> Result<bool> {
    let file = args.file.as_path();
    let mut intact = check(file, "checksums", verify_checksums(file).await)?;

    if let Some(encoded) = &args.public_key {
        let key = verifying_key_from_hex(encoded).context("invalid public key")?;
        intact &= check(file, "signature", verify_signature(file, &key).await)?;
    }
    Ok(intact)
}

fn check(file: &Path, what: &str, result: capsule::Result<bool>) -> Result<bool> {
    let ok = result.with_context(|| format!("failed to check {what} of {}", file.display()))?;
    println!("{what}: {}", if ok { "ok" } else { "FAILED" });
    Ok(ok)
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

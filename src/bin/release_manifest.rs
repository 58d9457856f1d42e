#![forbid(unsafe_code)]

//! Publisher side of self-update: writes the version marker for a pipeline
//! build and manages the signing key.

use anyhow::{Context, Result, bail};
use bandfetch_tools::update::RemoteVersionMarker;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Parser, Subcommand};
use ed25519_dalek::{Signer, SigningKey};
use rand_core::OsRng;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "release_manifest", version, about = "Build update markers for bandfetch releases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the marker JSON for a pipeline build
    Manifest {
        /// The pipeline executable being published
        payload: PathBuf,
        /// Version string recorded in the marker
        #[arg(long = "release")]
        release: String,
        /// URL the payload will be served from
        #[arg(long)]
        url: String,
        /// File holding the base64 signing key
        #[arg(long)]
        signing_key: Option<PathBuf>,
        /// Write the marker here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create a signing key; prints the public key to configure launchers with
    Keygen {
        /// Where the secret key is written
        secret: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match Cli::parse().command {
        Commands::Manifest {
            payload,
            release,
            url,
            signing_key,
            output,
        } => {
            let key = signing_key.as_deref().map(load_signing_key).transpose()?;
            let bytes =
                fs::read(&payload).with_context(|| format!("reading {}", payload.display()))?;
            let marker = build_marker(&bytes, &release, &url, key.as_ref())?;
            let json = serde_json::to_string_pretty(&marker)?;
            match output {
                Some(path) => {
                    fs::write(&path, format!("{json}\n"))
                        .with_context(|| format!("writing {}", path.display()))?;
                    log::info!("Wrote marker for v{release} to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Keygen { secret } => {
            if secret.exists() {
                bail!("{} already exists; refusing to overwrite a key", secret.display());
            }
            let key = SigningKey::generate(&mut OsRng);
            write_secret(&secret, &BASE64.encode(key.to_bytes()))?;
            println!("{}", BASE64.encode(key.verifying_key().to_bytes()));
        }
    }
    Ok(())
}

fn build_marker(
    payload: &[u8],
    version: &str,
    url: &str,
    key: Option<&SigningKey>,
) -> Result<RemoteVersionMarker> {
    if payload.is_empty() {
        bail!("payload is empty");
    }
    Ok(RemoteVersionMarker {
        version: version.trim().to_string(),
        download_url: url.to_string(),
        checksum: blake3::hash(payload).to_hex().to_string(),
        signature: key.map(|key| BASE64.encode(key.sign(payload).to_bytes())),
        file_size: Some(payload.len() as u64),
    })
}

fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let bytes: [u8; 32] = BASE64
        .decode(raw.trim())
        .context("signing key is not valid base64")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn write_secret(path: &Path, encoded: &str) -> Result<()> {
    fs::write(path, format!("{encoded}\n"))
        .with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting permissions on {}", path.display()))?;
    }
    Ok(())
}

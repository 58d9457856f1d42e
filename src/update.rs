#![forbid(unsafe_code)]

//! Self-update of the pipeline executable, run by the launcher before every
//! batch.
//!
//! A candidate is downloaded next to the installed pipeline, verified
//! (non-empty, size, blake3 checksum, optional ed25519 signature, and a
//! `--version` run), and only then renamed over the old file. Any failure
//! leaves the installed pipeline untouched.

use std::cmp::Ordering;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::LauncherSettings;
use crate::error::UpdateError;
use crate::transport::Transport;

/// How long a candidate gets to answer `--version`.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const PROBE_POLL: Duration = Duration::from_millis(50);

/// The document published at the manifest URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersionMarker {
    pub version: String,
    pub download_url: String,
    /// Lowercase blake3 hex digest of the payload.
    pub checksum: String,
    /// Base64 ed25519 signature over the payload bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { version: String },
    Installed { version: String },
    Skipped { reason: String },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UpdateStatus {
    #[serde(default)]
    messages: Vec<StatusMessage>,
    latest_version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusMessage {
    message: String,
    version: Option<String>,
    timestamp: f64,
}

/// Dotted numeric comparison. Non-numeric parts count as 0 and the shorter
/// version is padded with zeros, so `1.2` equals `1.2.0`.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let parse = |version: &str| -> Vec<u64> {
        version
            .trim()
            .trim_start_matches(['v', 'V'])
            .split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (left, right) = (parse(left), parse(right));
    let len = left.len().max(right.len());
    (0..len)
        .map(|index| {
            let a = left.get(index).copied().unwrap_or(0);
            let b = right.get(index).copied().unwrap_or(0);
            a.cmp(&b)
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Share links that render a preview page (`dl=0`) are switched to direct
/// downloads.
pub fn direct_download_url(url: &str) -> String {
    url.replace("dl=0", "dl=1")
}

pub fn read_local_version(settings: &LauncherSettings) -> Option<String> {
    fs::read_to_string(settings.version_file())
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|version| !version.is_empty())
}

/// Runs the update and never fails: errors are logged, recorded in the
/// status file and reported as `Skipped`.
pub fn run_self_update(settings: &LauncherSettings, transport: &dyn Transport) -> UpdateOutcome {
    match check_and_apply(settings, transport) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("Self-update failed, keeping the installed pipeline: {err}");
            append_status(settings, &format!("Update failed: {err}"), None);
            UpdateOutcome::Skipped {
                reason: err.to_string(),
            }
        }
    }
}

pub fn check_and_apply(
    settings: &LauncherSettings,
    transport: &dyn Transport,
) -> Result<UpdateOutcome, UpdateError> {
    if settings.updates_disabled {
        return Ok(UpdateOutcome::Skipped {
            reason: "updates disabled".to_string(),
        });
    }
    let Some(manifest_url) = settings.manifest_url.as_deref() else {
        return Ok(UpdateOutcome::Skipped {
            reason: "no manifest URL configured".to_string(),
        });
    };

    let marker = fetch_marker(transport, manifest_url)?;
    let installed = settings.pipeline_path.is_file();
    let local = read_local_version(settings);
    if installed {
        let local_version = local.as_deref().unwrap_or("0");
        if compare_versions(&marker.version, local_version) != Ordering::Greater {
            info!("Pipeline is up to date (v{local_version})");
            clear_status(settings);
            return Ok(UpdateOutcome::UpToDate {
                version: local_version.to_string(),
            });
        }
        info!("Update available: v{local_version} -> v{}", marker.version);
    } else {
        info!("No pipeline installed, fetching v{}", marker.version);
    }

    append_status(
        settings,
        &format!("Downloading v{}...", marker.version),
        Some(&marker.version),
    );
    install(settings, transport, &marker)?;
    append_status(
        settings,
        &format!("Successfully updated to v{}!", marker.version),
        Some(&marker.version),
    );
    info!("Installed pipeline v{}", marker.version);
    Ok(UpdateOutcome::Installed {
        version: marker.version,
    })
}

fn fetch_marker(transport: &dyn Transport, url: &str) -> Result<RemoteVersionMarker, UpdateError> {
    let body = transport.get_text(url)?;
    let mut marker: RemoteVersionMarker =
        serde_json::from_str(&body).map_err(|err| UpdateError::Manifest(err.to_string()))?;
    if marker.version.trim().is_empty() || marker.download_url.trim().is_empty() {
        return Err(UpdateError::Manifest(
            "missing version or download_url".to_string(),
        ));
    }
    marker.download_url = direct_download_url(&marker.download_url);
    Ok(marker)
}

fn install(
    settings: &LauncherSettings,
    transport: &dyn Transport,
    marker: &RemoteVersionMarker,
) -> Result<(), UpdateError> {
    let pipeline = &settings.pipeline_path;
    let dir = pipeline
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut candidate = tempfile::Builder::new()
        .prefix(".bandfetch-update")
        .tempfile_in(dir)?;
    let info = {
        let mut writer = io::BufWriter::new(candidate.as_file_mut());
        let info = transport.download(&marker.download_url, &mut writer, &mut |_: u64| {})?;
        writer.flush()?;
        info
    };

    if info.bytes == 0 {
        return Err(UpdateError::EmptyPayload);
    }
    for expected in [info.content_length, marker.file_size].into_iter().flatten() {
        if expected != info.bytes {
            return Err(UpdateError::SizeMismatch {
                expected,
                actual: info.bytes,
            });
        }
    }

    let payload = fs::read(candidate.path())?;
    verify_checksum(&payload, &marker.checksum)?;
    if let Some(key) = settings.public_key.as_deref() {
        verify_signature(&payload, marker.signature.as_deref(), key)?;
    }

    let candidate = candidate.into_temp_path();
    make_executable(&candidate)?;
    probe_loadable(&candidate, &marker.version, PROBE_TIMEOUT)?;

    if pipeline.is_file() {
        fs::copy(pipeline, settings.backup_path())?;
    }
    candidate.persist(pipeline).map_err(|err| err.error)?;
    write_atomic(&settings.version_file(), marker.version.as_bytes())?;
    Ok(())
}

fn verify_checksum(payload: &[u8], expected: &str) -> Result<(), UpdateError> {
    let actual = blake3::hash(payload).to_hex().to_string();
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(UpdateError::ChecksumMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(())
}

fn verify_signature(payload: &[u8], signature: Option<&str>, public_key: &str) -> Result<(), UpdateError> {
    let signature = signature.ok_or_else(|| UpdateError::Signature("manifest is unsigned".to_string()))?;
    let key_bytes: [u8; 32] = BASE64
        .decode(public_key.trim())
        .map_err(|err| UpdateError::Signature(format!("public key: {err}")))?
        .try_into()
        .map_err(|_| UpdateError::Signature("public key must be 32 bytes".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|err| UpdateError::Signature(format!("public key: {err}")))?;
    let signature_bytes = BASE64
        .decode(signature.trim())
        .map_err(|err| UpdateError::Signature(format!("signature: {err}")))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|err| UpdateError::Signature(format!("signature: {err}")))?;
    key.verify(payload, &signature)
        .map_err(|err| UpdateError::Signature(err.to_string()))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Runs `<candidate> --version`; it must exit successfully before `timeout`.
fn probe_loadable(candidate: &Path, expected: &str, timeout: Duration) -> Result<(), UpdateError> {
    let mut child = Command::new(candidate)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| UpdateError::NotLoadable(err.to_string()))?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(UpdateError::NotLoadable(format!(
                "--version did not answer within {}s",
                timeout.as_secs()
            )));
        }
        std::thread::sleep(PROBE_POLL);
    };
    if !status.success() {
        return Err(UpdateError::NotLoadable(format!("--version exited with {status}")));
    }

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = io::Read::read_to_string(&mut out, &mut stdout);
    }
    if !stdout.trim().is_empty() && !stdout.contains(expected) {
        warn!(
            "Candidate reports {:?}, expected v{expected}",
            stdout.trim()
        );
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.flush()?;
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Appends a message to the status file the GUI polls. Best effort.
pub fn append_status(settings: &LauncherSettings, message: &str, version: Option<&str>) {
    let path = settings.status_file();
    let mut status: UpdateStatus = fs::read(&path)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .unwrap_or_default();
    status.messages.push(StatusMessage {
        message: message.to_string(),
        version: version.map(str::to_string),
        timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
    });
    status.latest_version = version.map(str::to_string);

    let written = serde_json::to_vec(&status)
        .map_err(io::Error::from)
        .and_then(|bytes| write_atomic(&path, &bytes));
    if let Err(err) = written {
        warn!("Cannot write {}: {err}", path.display());
    }
}

fn clear_status(settings: &LauncherSettings) {
    let path = settings.status_file();
    if let Err(err) = fs::remove_file(&path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!("Cannot clear {}: {err}", path.display());
    }
}

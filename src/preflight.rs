#![forbid(unsafe_code)]

//! Checks the binaries run before any network or disk work starts.
//!
//! Capability checks (is the codec installed?) live here and never inside the
//! pipeline itself.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Fails fast when a binary is started as root, so downloads never end up
/// owned by root inside a user's music folder.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use a regular user account");
    }
    Ok(())
}

/// Runs `<codec> -version` to fail loudly when a transcode format was
/// requested but the codec is missing.
pub fn ensure_codec_available(codec: &Path) -> Result<()> {
    let status = Command::new(codec)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            codec.display()
        ),
        Err(err) => bail!("{} is not installed or not in PATH: {}", codec.display(), err),
    }
}

/// The temporary directory must not sit inside the destination root, or
/// half-written files would show up in the library.
pub fn ensure_separate_dirs(temp_dir: &Path, download_root: &Path) -> Result<()> {
    let temp = absolute(temp_dir);
    let root = absolute(download_root);
    if temp.starts_with(&root) {
        bail!(
            "temporary directory {} must not live inside the download root {}",
            temp.display(),
            root.display()
        );
    }
    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#![forbid(unsafe_code)]

//! Post-Processor: optional container change through the codec process,
//! tag embedding, and placement of the finished file.
//!
//! Transcoding changes the container only. The source stream is the best
//! quality available, and re-encoding it can never add fidelity back.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use lofty::config::WriteOptions;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use log::{debug, warn};
use tempfile::TempPath;
use tokio::process::Command;

use crate::error::ProcessError;
use crate::fetch::TEMP_PREFIX;
use crate::model::{OutputFormat, TrackDescriptor};

pub const COVER_FILE_NAME: &str = "cover.jpg";
const STDERR_TAIL: usize = 2000;

pub struct Transcoder {
    codec: PathBuf,
    timeout: Duration,
    temp_dir: PathBuf,
}

impl Transcoder {
    pub fn new(codec: PathBuf, timeout: Duration, temp_dir: PathBuf) -> Self {
        Self {
            codec,
            timeout,
            temp_dir,
        }
    }

    /// Re-encodes `input` into a new temp file of the requested container.
    /// A process still running at the timeout is killed.
    pub async fn transcode(&self, input: &Path, format: OutputFormat) -> Result<TempPath, ProcessError> {
        let output = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(&format!(".{}", format.extension()))
            .tempfile_in(&self.temp_dir)?
            .into_temp_path();

        let tool = self.codec.display().to_string();
        let child = Command::new(&self.codec)
            .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y"])
            .arg("-i")
            .arg(input)
            .args(["-vn", "-map_metadata", "-1"])
            .args(codec_args(format))
            .arg(&*output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => ProcessError::CodecMissing { tool: tool.clone() },
                _ => ProcessError::Io(err),
            })?;

        let finished = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let result = match finished {
            Ok(result) => result?,
            Err(_) => {
                warn!("{tool} exceeded {:?} on {}, killed", self.timeout, input.display());
                return Err(ProcessError::Timeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        if !result.status.success() {
            return Err(ProcessError::CodecFailed {
                code: result.status.code(),
                stderr: stderr_tail(&result.stderr),
            });
        }
        debug!("Transcoded {} to {format}", input.display());
        Ok(output)
    }
}

fn codec_args(format: OutputFormat) -> &'static [&'static str] {
    match format {
        OutputFormat::Original | OutputFormat::Mp3 => &["-codec:a", "libmp3lame", "-q:a", "2"],
        OutputFormat::Flac => &["-codec:a", "flac"],
        OutputFormat::Ogg => &["-codec:a", "libvorbis", "-q:a", "5"],
        OutputFormat::Wav => &["-codec:a", "pcm_s16le"],
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text.len().saturating_sub(STDERR_TAIL);
    let start = (start..text.len())
        .find(|index| text.is_char_boundary(*index))
        .unwrap_or(text.len());
    text[start..].to_string()
}

/// What tagging managed to embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagReport {
    pub art_embedded: bool,
}

/// Writes artist, album, title, track number, date and (when usable) the
/// front cover. Unreadable art is dropped with a warning.
pub fn embed_tags(
    path: &Path,
    descriptor: &TrackDescriptor,
    art: Option<&[u8]>,
) -> Result<TagReport, ProcessError> {
    let tagging = |reason: String| ProcessError::Tagging {
        path: path.to_path_buf(),
        reason,
    };

    let probe = Probe::open(path)
        .map_err(|err| tagging(err.to_string()))?
        .guess_file_type()
        .map_err(|err| tagging(err.to_string()))?;
    let mut tagged_file = probe.read().map_err(|err| tagging(err.to_string()))?;
    if tagged_file.primary_tag().is_none() {
        let tag_type = tagged_file.primary_tag_type();
        tagged_file.insert_tag(Tag::new(tag_type));
    }
    let Some(tag) = tagged_file.primary_tag_mut() else {
        return Err(tagging("file has no writable tag".to_string()));
    };

    tag.set_artist(descriptor.artist.clone());
    tag.set_album(descriptor.album.clone());
    tag.set_title(descriptor.title.clone());
    if let Some(number) = descriptor.track_number {
        tag.set_track(number);
    }
    if let Some(date) = &descriptor.release_date {
        tag.insert_text(ItemKey::RecordingDate, date.clone());
    }

    let mut art_embedded = false;
    if let Some(bytes) = art {
        match cover_picture(bytes) {
            Ok(picture) => {
                tag.remove_picture_type(PictureType::CoverFront);
                tag.push_picture(picture);
                art_embedded = true;
            }
            Err(reason) => warn!("Skipping cover art for {}: {reason}", path.display()),
        }
    }

    tagged_file
        .save_to_path(path, WriteOptions::default())
        .map_err(|err| tagging(err.to_string()))?;
    Ok(TagReport { art_embedded })
}

fn cover_picture(bytes: &[u8]) -> Result<Picture, String> {
    if image_kind(bytes).is_none() {
        return Err("not a JPEG, PNG or GIF image".to_string());
    }
    let mut reader = bytes;
    let mut picture = Picture::from_reader(&mut reader).map_err(|err| err.to_string())?;
    picture.set_pic_type(PictureType::CoverFront);
    Ok(picture)
}

fn image_kind(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("jpeg")
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("gif")
    } else {
        None
    }
}

/// Moves a finished temp file to its destination. A rename is tried first;
/// across filesystems the bytes are copied to a hidden sibling and renamed
/// so a partial file is never visible under the final name.
pub fn install_file(temp: TempPath, destination: &Path) -> io::Result<()> {
    let parent = destination
        .parent()
        .ok_or_else(|| io::Error::other(format!("{} has no parent", destination.display())))?;
    std::fs::create_dir_all(parent)?;

    let temp = match temp.persist(destination) {
        Ok(()) => return Ok(()),
        Err(err) => {
            debug!("Rename into {} failed ({}), copying", destination.display(), err.error);
            err.path
        }
    };

    let file_name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{file_name}.part"));
    if let Err(err) = std::fs::copy(&temp, &staging).and_then(|_| std::fs::rename(&staging, destination)) {
        let _ = std::fs::remove_file(&staging);
        return Err(err);
    }
    drop(temp);
    Ok(())
}

/// Writes `cover.jpg` next to an album's tracks unless one is already there.
pub fn save_cover(album_dir: &Path, bytes: &[u8]) -> io::Result<bool> {
    let target = album_dir.join(COVER_FILE_NAME);
    if target.exists() || image_kind(bytes).is_none() {
        return Ok(false);
    }
    std::fs::create_dir_all(album_dir)?;
    let mut staged = tempfile::Builder::new()
        .prefix(".cover")
        .tempfile_in(album_dir)?;
    io::Write::write_all(&mut staged, bytes)?;
    match staged.persist_noclobber(&target) {
        Ok(_) => Ok(true),
        Err(err) if target.exists() => {
            drop(err);
            Ok(false)
        }
        Err(err) => Err(err.error),
    }
}

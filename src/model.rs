#![forbid(unsafe_code)]

//! Plain data carried between pipeline stages.
//!
//! Descriptors are created once by the extractor and never mutated; run state
//! lives in `DownloadJob`, which only the scheduler's owner task touches.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::JobFailure;

/// What an input URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Track,
    Album,
    Artist,
}

/// A classified input URL. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputReference {
    pub url: String,
    pub kind: RefKind,
}

impl InputReference {
    pub fn new(url: impl Into<String>, kind: RefKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }
}

/// Container the final file is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Keep the served stream untouched.
    Original,
    Mp3,
    Flac,
    Ogg,
    Wav,
}

/// Container the platform serves unauthenticated streams in.
pub const SOURCE_EXTENSION: &str = "mp3";

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "original" | "passthrough" | "source" => Some(Self::Original),
            "mp3" => Some(Self::Mp3),
            "flac" => Some(Self::Flac),
            "ogg" | "vorbis" => Some(Self::Ogg),
            "wav" => Some(Self::Wav),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Original => SOURCE_EXTENSION,
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Wav => "wav",
        }
    }

    /// True when the codec process has to run. Re-encoding never improves on
    /// the source stream; it only changes the container.
    pub fn needs_transcode(self) -> bool {
        self.extension() != SOURCE_EXTENSION
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Original => "original",
            other => other.extension(),
        };
        f.write_str(label)
    }
}

/// One downloadable track and the metadata needed to tag and place it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub artist: String,
    pub album: String,
    pub title: String,
    pub track_number: Option<u32>,
    /// ISO `YYYY-MM-DD` when the page exposes a release date.
    pub release_date: Option<String>,
    pub stream_url: String,
    /// Empty when the page has no artwork.
    pub art_url: String,
    pub format: OutputFormat,
    /// Page the descriptor was extracted from.
    pub source_url: String,
}

impl TrackDescriptor {
    /// Normalized artist+album+title, used to collapse overlapping inputs.
    pub fn identity_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            normalize_key_part(&self.artist),
            normalize_key_part(&self.album),
            normalize_key_part(&self.title)
        )
    }

    /// Normalized artist+album, the playlist grouping key.
    pub fn album_key(&self) -> AlbumKey {
        AlbumKey(format!(
            "{}\u{1f}{}",
            normalize_key_part(&self.artist),
            normalize_key_part(&self.album)
        ))
    }

    pub fn year(&self) -> Option<u32> {
        self.release_date
            .as_deref()
            .and_then(|date| date.get(0..4))
            .and_then(|year| year.parse().ok())
    }
}

fn normalize_key_part(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlbumKey(pub String);

pub type JobId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Fetching,
    Transcoding,
    Tagging,
    Writing,
    Done,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Fetching => "fetching",
            Self::Transcoding => "transcoding",
            Self::Tagging => "tagging",
            Self::Writing => "writing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// A descriptor plus its run state. Owned by the scheduler.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: JobId,
    pub descriptor: TrackDescriptor,
    pub destination: PathBuf,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<JobFailure>,
    pub bytes_transferred: u64,
}

impl DownloadJob {
    pub fn new(id: JobId, descriptor: TrackDescriptor, destination: PathBuf) -> Self {
        Self {
            id,
            descriptor,
            destination,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            bytes_transferred: 0,
        }
    }
}

/// One state transition, as published to the progress sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub from_state: JobStatus,
    pub to_state: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.to_state.is_terminal()
    }
}

/// Final state of one job after a batch.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub id: JobId,
    pub descriptor: TrackDescriptor,
    pub destination: PathBuf,
    pub status: JobStatus,
    pub attempts: u32,
    pub failure: Option<JobFailure>,
}

/// An input that never produced jobs.
#[derive(Debug, Clone)]
pub struct InputFailure {
    pub url: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<JobOutcome>,
    pub input_failures: Vec<InputFailure>,
    /// Tracks dropped during extraction, e.g. for lacking a stream.
    pub warnings: Vec<String>,
    pub playlists: Vec<PathBuf>,
}

impl BatchReport {
    pub fn count(&self, status: JobStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }

    /// Full success means no failed job and no failed input.
    pub fn is_success(&self) -> bool {
        self.input_failures.is_empty() && self.count(JobStatus::Failed) == 0
    }
}

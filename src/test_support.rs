//! In-memory transport and fixtures shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::FetchError;
use crate::model::{OutputFormat, TrackDescriptor};
use crate::transport::{DownloadInfo, Transport};

/// Serves canned pages and bodies; scripted errors are returned (in order)
/// before the canned response.
#[derive(Default)]
pub struct FakeTransport {
    pages: Mutex<HashMap<String, String>>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    scripted: Mutex<HashMap<String, VecDeque<FetchError>>>,
    permanent: Mutex<HashMap<String, FetchError>>,
    calls: Mutex<HashMap<String, usize>>,
    gate: Option<Arc<Gate>>,
}

/// Holds downloads until released, counting how many are waiting.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    fn pass(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        let transport = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (transport, gate)
    }

    pub fn page(self, url: &str, body: &str) -> Self {
        self.pages.lock().insert(url.to_string(), body.to_string());
        self
    }

    pub fn body(self, url: &str, bytes: &[u8]) -> Self {
        self.bodies.lock().insert(url.to_string(), bytes.to_vec());
        self
    }

    pub fn fail_then(self, url: &str, errors: Vec<FetchError>) -> Self {
        self.scripted
            .lock()
            .insert(url.to_string(), errors.into_iter().collect());
        self
    }

    pub fn fail_always(self, url: &str, error: FetchError) -> Self {
        self.permanent.lock().insert(url.to_string(), error);
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    fn record(&self, url: &str) -> Result<(), FetchError> {
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;
        if let Some(error) = self.permanent.lock().get(url) {
            return Err(error.clone());
        }
        if let Some(queue) = self.scripted.lock().get_mut(url)
            && let Some(error) = queue.pop_front()
        {
            return Err(error);
        }
        Ok(())
    }

    fn not_found(url: &str) -> FetchError {
        FetchError::Status {
            status: 404,
            url: url.to_string(),
        }
    }
}

impl Transport for FakeTransport {
    fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.record(url)?;
        self.pages
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Self::not_found(url))
    }

    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<DownloadInfo, FetchError> {
        self.record(url)?;
        let body = self
            .bodies
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Self::not_found(url))?;
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        sink.write_all(&body)
            .map_err(|err| FetchError::Io(err.to_string()))?;
        on_progress(body.len() as u64);
        Ok(DownloadInfo {
            bytes: body.len() as u64,
            content_length: Some(body.len() as u64),
        })
    }
}

pub fn transient() -> FetchError {
    FetchError::Status {
        status: 503,
        url: "https://cdn.example".to_string(),
    }
}

pub fn track(album: &str, number: u32, title: &str) -> TrackDescriptor {
    TrackDescriptor {
        artist: "Test Artist".to_string(),
        album: album.to_string(),
        title: title.to_string(),
        track_number: Some(number),
        release_date: Some("2021-03-05".to_string()),
        stream_url: format!("https://cdn.example/{album}/{number}.mp3"),
        art_url: String::new(),
        format: OutputFormat::Original,
        source_url: format!("https://test.bandcamp.com/album/{album}"),
    }
}

/// Builds the inline script element the platform embeds in release pages.
pub fn release_page(tralbum: &serde_json::Value, album_title: Option<&str>) -> String {
    let encoded = html_attr(&tralbum.to_string());
    let embed = match album_title {
        Some(title) => format!(
            r#" data-embed="{}""#,
            html_attr(&serde_json::json!({ "album_title": title }).to_string())
        ),
        None => String::new(),
    };
    format!(
        r#"<!DOCTYPE html><html><head><title>release</title>
<script type="text/javascript" src="/tralbum.js" data-tralbum="{encoded}"{embed}></script>
</head><body><h2 class="trackTitle">x</h2></body></html>"#
    )
}

fn html_attr(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Writes an executable shell script, the way external programs are stubbed.
#[cfg(unix)]
pub fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A short, valid PCM WAV file (mono, 8 kHz, 16-bit silence).
pub fn wav_bytes() -> Vec<u8> {
    let samples = 800u32;
    let data_len = samples * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&8000u32.to_le_bytes());
    out.extend_from_slice(&16000u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    out
}

/// Smallest PNG lofty recognises as a picture.
pub fn png_bytes() -> Vec<u8> {
    let mut out = b"\x89PNG\r\n\x1a\n".to_vec();
    out.extend_from_slice(&13u32.to_be_bytes());
    out.extend_from_slice(b"IHDR");
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&[8, 2, 0, 0, 0]);
    out.extend_from_slice(&[0x90, 0x77, 0x53, 0xde]);
    out
}

#![forbid(unsafe_code)]

//! Turns release pages into `TrackDescriptor`s.
//!
//! Every assumption about the platform's page markup lives in this module:
//! the `data-tralbum` script attribute carrying release JSON, the
//! `data-embed` attribute carrying the parent album title of a track page,
//! and the `#music-grid` listing on artist pages. When the platform changes
//! its markup, this is the only file that has to follow.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, warn};
use scraper::{Html, Selector};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::ExtractionError;
use crate::fetch::{RetryPolicy, with_retry};
use crate::model::{InputReference, OutputFormat, RefKind, TrackDescriptor};
use crate::transport::Transport;

/// Key of the freely streamable rendition inside `trackinfo[].file`.
const STREAM_KEY: &str = "mp3-128";
const ART_URL_BASE: &str = "https://f4.bcbits.com/img";
const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Descriptors for one reference plus the per-track problems that did not
/// stop the rest of the release.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub descriptors: Vec<TrackDescriptor>,
    pub warnings: Vec<String>,
}

/// What an artist page links to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtistListing {
    /// Absolute release URLs in page order, without duplicates.
    Links(Vec<String>),
    /// Artists with a single release get that release's page directly.
    EmbeddedRelease(RefKind),
}

#[derive(Debug, Deserialize)]
struct TralbumData {
    artist: Option<String>,
    item_type: Option<String>,
    current: Option<CurrentRelease>,
    art_id: Option<u64>,
    album_release_date: Option<String>,
    trackinfo: Option<Vec<TrackInfo>>,
}

#[derive(Debug, Deserialize)]
struct CurrentRelease {
    title: Option<String>,
    release_date: Option<String>,
    art_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TrackInfo {
    title: Option<String>,
    track_num: Option<u32>,
    file: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    album_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientItem {
    page_url: Option<String>,
}

/// Fetches a Track or Album page (retrying transient failures) and parses it.
pub fn extract(
    transport: &dyn Transport,
    reference: &InputReference,
    format: OutputFormat,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Extraction, ExtractionError> {
    let html = fetch_page(transport, &reference.url, policy, cancel)?;
    parse_release_page(&html, &reference.url, format)
}

pub(crate) fn fetch_page(
    transport: &dyn Transport,
    url: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<String, ExtractionError> {
    with_retry(
        policy,
        cancel,
        |attempt, err| warn!("Retrying {url} (attempt {attempt}): {err}"),
        |_| transport.get_text(url),
    )
    .map(|(html, _)| html)
    .map_err(ExtractionError::Unavailable)
}

/// Parses the embedded release data of a Track or Album page.
pub fn parse_release_page(
    html: &str,
    page_url: &str,
    format: OutputFormat,
) -> Result<Extraction, ExtractionError> {
    let document = Html::parse_document(html);
    let data = embedded_release(&document, page_url)?.ok_or_else(|| ExtractionError::Parse {
        url: page_url.to_string(),
        reason: "no embedded release data".to_string(),
    })?;

    let tracks = data.trackinfo.unwrap_or_default();
    let has_stream = tracks.iter().any(|track| stream_url(track).is_some());
    if !has_stream {
        return Err(ExtractionError::NotStreamable {
            url: page_url.to_string(),
        });
    }

    let current = data.current.as_ref();
    let release_title = current
        .and_then(|current| current.title.clone())
        .filter(|title| !title.trim().is_empty());
    let is_album = data.item_type.as_deref() != Some("track");
    let album = if is_album {
        release_title.clone()
    } else {
        embedded_album_title(&document, page_url)?
            .or_else(|| release_title.clone())
    }
    .unwrap_or_else(|| "Unknown Album".to_string());

    let artist = data
        .artist
        .clone()
        .filter(|artist| !artist.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
    let release_date = current
        .and_then(|current| current.release_date.as_deref())
        .or(data.album_release_date.as_deref())
        .and_then(normalize_release_date);
    let art_url = data
        .art_id
        .or_else(|| current.and_then(|current| current.art_id))
        .map(art_url_for)
        .unwrap_or_default();

    let mut extraction = Extraction::default();
    for (index, track) in tracks.iter().enumerate() {
        let position = index as u32 + 1;
        let title = track
            .title
            .clone()
            .filter(|title| !title.trim().is_empty())
            .or_else(|| (!is_album).then(|| release_title.clone()).flatten())
            .unwrap_or_else(|| format!("Track {position}"));

        let Some(stream) = stream_url(track) else {
            let message = format!("{page_url}: \"{title}\" has no stream URL, skipping");
            warn!("{message}");
            extraction.warnings.push(message);
            continue;
        };

        let track_number = track
            .track_num
            .filter(|number| *number > 0)
            .or(is_album.then_some(position));

        extraction.descriptors.push(TrackDescriptor {
            artist: artist.clone(),
            album: album.clone(),
            title,
            track_number,
            release_date: release_date.clone(),
            stream_url: stream,
            art_url: art_url.clone(),
            format,
            source_url: page_url.to_string(),
        });
    }

    debug!(
        "{page_url}: {} track(s), {} warning(s)",
        extraction.descriptors.len(),
        extraction.warnings.len()
    );
    Ok(extraction)
}

/// Collects release links from an artist page.
pub fn parse_artist_page(html: &str, page_url: &str) -> Result<ArtistListing, ExtractionError> {
    let base = Url::parse(page_url).map_err(|err| ExtractionError::Parse {
        url: page_url.to_string(),
        reason: err.to_string(),
    })?;
    let document = Html::parse_document(html);

    let mut raw_links = Vec::new();
    for element in document.select(&selector("#music-grid a[href]", page_url)?) {
        if let Some(href) = element.value().attr("href") {
            raw_links.push(href.to_string());
        }
    }
    for element in document.select(&selector("[data-client-items]", page_url)?) {
        let Some(raw) = element.value().attr("data-client-items") else {
            continue;
        };
        match serde_json::from_str::<Vec<ClientItem>>(raw) {
            Ok(items) => raw_links.extend(items.into_iter().filter_map(|item| item.page_url)),
            Err(err) => warn!("{page_url}: unreadable client item list: {err}"),
        }
    }

    let mut links = Vec::new();
    for raw in raw_links {
        let Ok(mut joined) = base.join(raw.trim()) else {
            continue;
        };
        joined.set_fragment(None);
        joined.set_query(None);
        let link = joined.to_string();
        if !links.contains(&link) {
            links.push(link);
        }
    }

    if links.is_empty()
        && let Some(data) = embedded_release(&document, page_url)?
    {
        let kind = match data.item_type.as_deref() {
            Some("track") => RefKind::Track,
            _ => RefKind::Album,
        };
        return Ok(ArtistListing::EmbeddedRelease(kind));
    }

    Ok(ArtistListing::Links(links))
}

fn selector(css: &str, page_url: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|err| ExtractionError::Parse {
        url: page_url.to_string(),
        reason: format!("selector {css}: {err}"),
    })
}

fn embedded_release(
    document: &Html,
    page_url: &str,
) -> Result<Option<TralbumData>, ExtractionError> {
    let found = document
        .select(&selector("[data-tralbum]", page_url)?)
        .find_map(|element| element.value().attr("data-tralbum").map(str::to_string));
    let Some(raw) = found else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| ExtractionError::Parse {
            url: page_url.to_string(),
            reason: format!("data-tralbum: {err}"),
        })
}

fn embedded_album_title(document: &Html, page_url: &str) -> Result<Option<String>, ExtractionError> {
    let title = document
        .select(&selector("[data-embed]", page_url)?)
        .filter_map(|element| element.value().attr("data-embed"))
        .filter_map(|raw| serde_json::from_str::<EmbedData>(raw).ok())
        .find_map(|embed| embed.album_title)
        .filter(|title| !title.trim().is_empty());
    Ok(title)
}

fn stream_url(track: &TrackInfo) -> Option<String> {
    let raw = track.file.as_ref()?.get(STREAM_KEY)?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    Some(raw.to_string())
}

fn art_url_for(art_id: u64) -> String {
    format!("{ART_URL_BASE}/a{art_id:010}_10.jpg")
}

/// Accepts `04 Jan 2019 00:00:00 GMT` (what release pages carry) or an ISO
/// date, and returns `YYYY-MM-DD`.
fn normalize_release_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, "%d %b %Y %H:%M:%S GMT") {
        return Some(datetime.format("%Y-%m-%d").to_string());
    }
    NaiveDate::parse_from_str(trimmed.get(..10)?, "%Y-%m-%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

#![forbid(unsafe_code)]

//! URL Resolver: classifies input URLs and expands artist pages one level.

use log::{debug, info};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{InputError, ResolutionError};
use crate::extractor::{ArtistListing, fetch_page, parse_artist_page};
use crate::fetch::RetryPolicy;
use crate::model::{InputReference, RefKind};
use crate::transport::Transport;

const PLATFORM_DOMAIN: &str = "bandcamp.com";

/// Classifies a URL by path shape. Query strings and fragments are dropped.
pub fn classify(input: &str) -> Result<InputReference, ResolutionError> {
    let unsupported = || ResolutionError::UnsupportedUrl(input.to_string());
    let mut url = Url::parse(input.trim()).map_err(|_| unsupported())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(unsupported());
    }
    let host = url.host_str().ok_or_else(unsupported)?.to_ascii_lowercase();

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
        .unwrap_or_default();
    let kind = match segments.as_slice() {
        ["track", _] => RefKind::Track,
        ["album", _] => RefKind::Album,
        [] | ["music"] if is_artist_host(&host) => RefKind::Artist,
        _ => return Err(unsupported()),
    };

    url.set_query(None);
    url.set_fragment(None);
    Ok(InputReference::new(url.to_string(), kind))
}

fn is_artist_host(host: &str) -> bool {
    match host.strip_suffix(PLATFORM_DOMAIN) {
        Some(prefix) => {
            let Some(subdomain) = prefix.strip_suffix('.') else {
                return false;
            };
            !subdomain.is_empty() && subdomain != "www" && !subdomain.contains('.')
        }
        None => false,
    }
}

/// Returns the references an input stands for: itself for Track and Album,
/// every linked release for Artist.
pub fn resolve(
    transport: &dyn Transport,
    input: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<InputReference>, InputError> {
    let reference = classify(input)?;
    if reference.kind != RefKind::Artist {
        return Ok(vec![reference]);
    }

    let html = fetch_page(transport, &reference.url, policy, cancel)?;
    let references = match parse_artist_page(&html, &reference.url)? {
        ArtistListing::EmbeddedRelease(kind) => vec![InputReference::new(reference.url, kind)],
        ArtistListing::Links(links) => links
            .iter()
            .filter_map(|link| match classify(link) {
                Ok(found) if found.kind != RefKind::Artist => Some(found),
                _ => {
                    debug!("Ignoring non-release link {link}");
                    None
                }
            })
            .collect(),
    };
    info!("{input}: {} release(s) found", references.len());
    Ok(references)
}

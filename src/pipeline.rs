#![forbid(unsafe_code)]

//! One `BatchRun`: resolve → extract → de-duplicate → plan → schedule.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{info, warn};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::PipelineSettings;
use crate::error::InputError;
use crate::extractor::extract;
use crate::fetch::{RetryPolicy, TEMP_PREFIX};
use crate::model::{BatchReport, InputFailure, OutputFormat, TrackDescriptor};
use crate::planner::PathPlanner;
use crate::progress::EventQueue;
use crate::resolver::resolve;
use crate::scheduler::{PlannedJob, Scheduler};
use crate::transport::Transport;

/// Temp files older than this belong to a run that never cleaned up.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

pub struct Pipeline {
    settings: PipelineSettings,
    transport: Arc<dyn Transport>,
    events: Arc<EventQueue>,
}

/// What the extraction phase produced for the whole batch.
#[derive(Debug, Default)]
struct Collected {
    descriptors: Vec<TrackDescriptor>,
    failures: Vec<InputFailure>,
    warnings: Vec<String>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, transport: Arc<dyn Transport>, events: Arc<EventQueue>) -> Self {
        Self {
            settings,
            transport,
            events,
        }
    }

    pub async fn run(&self, inputs: &[String], cancel: &CancellationToken) -> BatchReport {
        let temp_dir = self.settings.temp_dir.clone();
        match tokio::task::spawn_blocking(move || sweep_stale_temp(&temp_dir, STALE_TEMP_AGE)).await {
            Ok(0) => {}
            Ok(removed) => info!("Removed {removed} stale temp file(s)"),
            Err(err) => warn!("Temp sweep failed: {err}"),
        }

        let collected = self.collect(inputs, cancel).await;
        let descriptors = dedupe(collected.descriptors);
        info!(
            "{} unique track(s) from {} input(s), {} input failure(s)",
            descriptors.len(),
            inputs.len(),
            collected.failures.len()
        );

        let planner = PathPlanner::new(&self.settings.download_root, &self.settings.template);
        let planned: Vec<PlannedJob> = planner
            .plan(&descriptors)
            .into_iter()
            .zip(descriptors)
            .map(|(destination, descriptor)| PlannedJob {
                descriptor,
                destination,
            })
            .collect();

        let scheduler = Scheduler::new(&self.settings, self.transport.clone(), self.events.clone());
        let schedule = scheduler.run(planned, cancel).await;
        BatchReport {
            outcomes: schedule.outcomes,
            input_failures: collected.failures,
            warnings: collected.warnings,
            playlists: schedule.playlists,
        }
    }

    async fn collect(&self, inputs: &[String], cancel: &CancellationToken) -> Collected {
        let mut collected = Collected::default();
        for input in inputs {
            if cancel.is_cancelled() {
                collected.failures.push(InputFailure {
                    url: input.clone(),
                    message: "batch cancelled".to_string(),
                });
                continue;
            }

            let transport = self.transport.clone();
            let policy = RetryPolicy::from_settings(&self.settings);
            let format = self.settings.format;
            let token = cancel.clone();
            let owned = input.clone();
            let result = tokio::task::spawn_blocking(move || {
                collect_input(transport.as_ref(), &owned, format, &policy, &token)
            })
            .await;
            match result {
                Ok(found) => {
                    collected.descriptors.extend(found.descriptors);
                    collected.failures.extend(found.failures);
                    collected.warnings.extend(found.warnings);
                }
                Err(err) => collected.failures.push(InputFailure {
                    url: input.clone(),
                    message: format!("extraction task failed: {err}"),
                }),
            }
        }
        collected
    }
}

/// Resolves one input and extracts every reference it expands to. A failing
/// reference never hides the others.
fn collect_input(
    transport: &dyn Transport,
    input: &str,
    format: OutputFormat,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Collected {
    let mut collected = Collected::default();
    let references = match resolve(transport, input, policy, cancel) {
        Ok(references) => references,
        Err(err) => {
            warn!("{input}: {err}");
            collected.failures.push(input_failure(input, &err));
            return collected;
        }
    };

    for reference in references {
        match extract(transport, &reference, format, policy, cancel) {
            Ok(extraction) => {
                collected.descriptors.extend(extraction.descriptors);
                collected.warnings.extend(extraction.warnings);
            }
            Err(err) => {
                let err = InputError::from(err);
                warn!("{}: {err}", reference.url);
                collected.failures.push(input_failure(&reference.url, &err));
            }
        }
    }
    collected
}

fn input_failure(url: &str, err: &InputError) -> InputFailure {
    InputFailure {
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Keeps the first descriptor seen for every identity key.
fn dedupe(descriptors: Vec<TrackDescriptor>) -> Vec<TrackDescriptor> {
    let mut seen = HashSet::new();
    descriptors
        .into_iter()
        .filter(|descriptor| seen.insert(descriptor.identity_key()))
        .collect()
}

/// Deletes pipeline temp files in `dir` last modified more than `max_age`
/// ago. Returns how many were removed.
pub fn sweep_stale_temp(dir: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            continue;
        }
        let stale = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if stale {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!("Cannot remove {}: {err}", entry.path().display()),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;
    use crate::test_support::{FakeTransport, release_page, wav_bytes};
    use serde_json::json;
    use tempfile::tempdir;

    const ARTIST: &str = "https://band.bandcamp.com/music";
    const ALBUM_A: &str = "https://band.bandcamp.com/album/a";
    const ALBUM_B: &str = "https://band.bandcamp.com/album/b";

    fn album_page(title: &str, tracks: &[(&str, Option<&str>)]) -> String {
        let trackinfo: Vec<_> = tracks
            .iter()
            .enumerate()
            .map(|(index, (name, stream))| {
                json!({
                    "title": name,
                    "track_num": index + 1,
                    "file": stream.map(|url| json!({ "mp3-128": url })),
                })
            })
            .collect();
        release_page(
            &json!({
                "artist": "The Band",
                "item_type": "album",
                "current": { "title": title, "release_date": "01 Feb 2020 00:00:00 GMT" },
                "trackinfo": trackinfo,
            }),
            None,
        )
    }

    fn platform() -> FakeTransport {
        let artist = r#"<html><body><ol id="music-grid">
            <li><a href="/album/a">A</a></li><li><a href="/album/b">B</a></li>
        </ol></body></html>"#;
        FakeTransport::new()
            .page(ARTIST, artist)
            .page(
                ALBUM_A,
                &album_page(
                    "A",
                    &[
                        ("One", Some("https://t4.example/a1")),
                        ("Two", None),
                        ("Three", Some("https://t4.example/a3")),
                    ],
                ),
            )
            .page(ALBUM_B, &album_page("B", &[("Solo", Some("https://t4.example/b1"))]))
            .body("https://t4.example/a1", &wav_bytes())
            .body("https://t4.example/a3", &wav_bytes())
            .body("https://t4.example/b1", &wav_bytes())
    }

    fn settings(root: &Path) -> PipelineSettings {
        PipelineSettings {
            download_root: root.join("music"),
            temp_dir: root.join("tmp"),
            backoff_base: Duration::from_millis(1),
            embed_art: false,
            ..PipelineSettings::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_inputs_collapse_to_unique_jobs() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(platform());
        let pipeline = Pipeline::new(
            settings(dir.path()),
            transport.clone(),
            Arc::new(EventQueue::new(1024)),
        );
        let inputs = vec![ALBUM_A.to_string(), ARTIST.to_string()];
        let report = pipeline.run(&inputs, &CancellationToken::new()).await;

        assert!(report.is_success(), "{:?}", report.input_failures);
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.count(JobStatus::Done), 3);
        let keys: HashSet<String> = report
            .outcomes
            .iter()
            .map(|o| o.descriptor.identity_key())
            .collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(transport.calls("https://t4.example/a1"), 1);
        assert_eq!(report.playlists.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn album_jobs_match_streamable_tracks() {
        let dir = tempdir().unwrap();
        let pipeline = Pipeline::new(
            settings(dir.path()),
            Arc::new(platform()),
            Arc::new(EventQueue::new(1024)),
        );
        let report = pipeline
            .run(&[ALBUM_A.to_string()], &CancellationToken::new())
            .await;
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(
            report.outcomes[0].destination,
            dir.path().join("music/The Band/A/01 - One.mp3")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_inputs_do_not_stop_good_ones() {
        let dir = tempdir().unwrap();
        let pipeline = Pipeline::new(
            settings(dir.path()),
            Arc::new(platform()),
            Arc::new(EventQueue::new(1024)),
        );
        let inputs = vec![
            "https://example.org/nothing".to_string(),
            "https://band.bandcamp.com/album/missing".to_string(),
            ALBUM_B.to_string(),
        ];
        let report = pipeline.run(&inputs, &CancellationToken::new()).await;
        assert_eq!(report.input_failures.len(), 2);
        assert!(report.input_failures[0].message.contains("unsupported URL"));
        assert_eq!(report.count(JobStatus::Done), 1);
        assert!(!report.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_batch_extracts_nothing() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(platform());
        let pipeline = Pipeline::new(
            settings(dir.path()),
            transport.clone(),
            Arc::new(EventQueue::new(16)),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = pipeline.run(&[ALBUM_A.to_string()], &cancel).await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.input_failures.len(), 1);
        assert_eq!(transport.total_calls(), 0);
    }

    #[test]
    fn sweep_removes_only_old_pipeline_temp_files() {
        let dir = tempdir().unwrap();
        let old = dir.path().join(format!("{TEMP_PREFIX}old.part"));
        let fresh = dir.path().join(format!("{TEMP_PREFIX}fresh.part"));
        let foreign = dir.path().join("notes.txt");
        for path in [&old, &fresh, &foreign] {
            std::fs::write(path, b"x").unwrap();
        }
        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        for path in [&old, &foreign] {
            std::fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(two_hours_ago)
                .unwrap();
        }

        assert_eq!(sweep_stale_temp(dir.path(), STALE_TEMP_AGE), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn sweep_of_missing_dir_is_a_no_op() {
        assert_eq!(
            sweep_stale_temp(Path::new("/nonexistent/bandfetch-tmp"), STALE_TEMP_AGE),
            0
        );
    }
}

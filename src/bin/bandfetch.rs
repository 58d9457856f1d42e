#![forbid(unsafe_code)]

//! Headless pipeline: downloads every track reachable from the given URLs.
//!
//! Exits 0 only when every input resolved and every job ended `Done` or
//! `Skipped`. Files that did complete stay on disk either way.

use anyhow::{Context, Result};
use bandfetch_tools::config::{SettingsOverrides, resolve_pipeline_settings};
use bandfetch_tools::model::{BatchReport, JobStatus, OutputFormat};
use bandfetch_tools::pipeline::Pipeline;
use bandfetch_tools::preflight::{ensure_codec_available, ensure_not_root, ensure_separate_dirs};
use bandfetch_tools::progress::{EventQueue, JsonLinesSink, LogSink, ProgressSink, spawn_sink_pump};
use bandfetch_tools::transport::HttpTransport;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const FORMAT_HELP: &str = "original, mp3, flac, ogg or wav. Anything but original re-encodes \
the 128 kbps MP3 stream: the container changes, the fidelity never exceeds the source";

#[derive(Debug, Parser)]
#[command(name = "bandfetch", version, about = "Download tracks, albums and discographies")]
struct Cli {
    /// Track, album or artist page URLs
    #[arg(required = true)]
    urls: Vec<String>,

    /// Settings file
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Root directory for finished files
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Simultaneous downloads (1-16)
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    #[arg(short, long, value_parser = parse_format, help = FORMAT_HELP)]
    format: Option<OutputFormat>,

    /// Path template, e.g. "{artist}/{album}/{track} - {title}"
    #[arg(long)]
    template: Option<String>,

    #[arg(long)]
    no_embed_art: bool,

    /// Also write cover.jpg into each album directory
    #[arg(long)]
    save_cover: bool,

    #[arg(long)]
    no_playlist: bool,

    /// Write playlists here instead of next to the tracks
    #[arg(long)]
    playlist_dir: Option<PathBuf>,

    /// Treat HTTP 429 as permanent
    #[arg(long)]
    no_retry_429: bool,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// Codec executable used for transcoding
    #[arg(long)]
    codec: Option<PathBuf>,

    /// Append every progress event as a JSON line to this file
    #[arg(long)]
    progress_file: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            env_path: self.env_file.clone(),
            download_root: self.output.clone(),
            temp_dir: self.temp_dir.clone(),
            concurrency: self.concurrency,
            format: self.format,
            template: self.template.clone(),
            embed_art: self.no_embed_art.then_some(false),
            save_cover: self.save_cover.then_some(true),
            write_playlists: self.no_playlist.then_some(false),
            playlist_dir: self.playlist_dir.clone(),
            retry_on_429: self.no_retry_429.then_some(false),
            max_attempts: self.max_attempts,
            codec: self.codec.clone(),
        }
    }
}

/// Said once per run so nobody mistakes a FLAC or WAV file for a lossless copy.
fn transcode_notice(format: OutputFormat) -> Option<String> {
    format.needs_transcode().then(|| {
        format!("Output is re-encoded to {format} from a 128 kbps MP3 stream; quality is no higher than the source")
    })
}

fn parse_format(value: &str) -> Result<OutputFormat, String> {
    OutputFormat::parse(value).ok_or_else(|| format!("unknown format: {value}"))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Cli::parse()) {
        Ok(report) if report.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<BatchReport> {
    ensure_not_root("bandfetch")?;
    let settings = resolve_pipeline_settings(cli.overrides())?;
    ensure_separate_dirs(&settings.temp_dir, &settings.download_root)?;
    if let Some(notice) = transcode_notice(settings.format) {
        ensure_codec_available(&settings.codec)?;
        info!("{notice}");
    }
    std::fs::create_dir_all(&settings.temp_dir)
        .with_context(|| format!("creating {}", settings.temp_dir.display()))?;

    let mut sinks: Vec<Box<dyn ProgressSink>> = vec![Box::new(LogSink)];
    if let Some(path) = &cli.progress_file {
        let sink = JsonLinesSink::create(path)
            .with_context(|| format!("opening progress file {}", path.display()))?;
        sinks.push(Box::new(sink));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    let report = runtime.block_on(async move {
        let events = Arc::new(EventQueue::new(settings.event_capacity));
        let pump = spawn_sink_pump(events.clone(), sinks);
        let transport = Arc::new(HttpTransport::new(settings.http_timeout));
        let pipeline = Pipeline::new(settings, transport, events.clone());

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling remaining downloads");
                    cancel.cancel();
                }
            })
        };

        let report = pipeline.run(&cli.urls, &cancel).await;
        interrupt.abort();
        events.close();
        if let Err(err) = pump.await {
            warn!("Progress pump stopped abnormally: {err}");
        }
        report
    });

    print_summary(&report);
    Ok(report)
}

fn print_summary(report: &BatchReport) {
    for failure in &report.input_failures {
        warn!("{}: {}", failure.url, failure.message);
    }
    for outcome in report
        .outcomes
        .iter()
        .filter(|outcome| outcome.status == JobStatus::Failed)
    {
        let reason = outcome
            .failure
            .as_ref()
            .map(|failure| failure.message.as_str())
            .unwrap_or("unknown error");
        warn!(
            "{} - {}: {reason}",
            outcome.descriptor.artist, outcome.descriptor.title
        );
    }
    info!(
        "{} done, {} skipped, {} failed, {} input(s) failed, {} playlist(s)",
        report.count(JobStatus::Done),
        report.count(JobStatus::Skipped),
        report.count(JobStatus::Failed),
        report.input_failures.len(),
        report.playlists.len()
    );
}

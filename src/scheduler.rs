#![forbid(unsafe_code)]

//! Download Scheduler.
//!
//! A fixed pool of worker tasks drains one shared queue. Workers never touch
//! `DownloadJob` state: they send `JobUpdate`s to the owner loop, which is
//! the only place job state changes, events are published and playlists are
//! notified. Cancellation is checked between stages, never inside one.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;

use crate::config::{MAX_CONCURRENCY, PipelineSettings};
use crate::error::{FailureKind, JobFailure};
use crate::fetch::{FetchReport, Fetcher, ReportFn, RetryPolicy};
use crate::model::{DownloadJob, JobId, JobOutcome, JobStatus, ProgressEvent, TrackDescriptor};
use crate::playlist::PlaylistWriter;
use crate::postprocess::{Transcoder, embed_tags, install_file, save_cover};
use crate::progress::EventQueue;
use crate::transport::Transport;

/// A descriptor with the destination the planner gave it.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub descriptor: TrackDescriptor,
    pub destination: PathBuf,
}

#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub outcomes: Vec<JobOutcome>,
    pub playlists: Vec<PathBuf>,
}

#[derive(Debug)]
enum Change {
    Enter(JobStatus),
    Bytes(u64),
    Retrying { attempt: u32, error: String },
    Fail { failure: JobFailure, attempts: Option<u32> },
}

#[derive(Debug)]
struct JobUpdate {
    id: JobId,
    change: Change,
}

/// A worker's handle for reporting on the one job it is running.
#[derive(Clone)]
struct JobHandle {
    id: JobId,
    updates: UnboundedSender<JobUpdate>,
}

impl JobHandle {
    fn send(&self, change: Change) {
        if self.updates.send(JobUpdate { id: self.id, change }).is_err() {
            debug!("job {}: owner gone, update dropped", self.id);
        }
    }

    fn enter(&self, status: JobStatus) {
        self.send(Change::Enter(status));
    }

    fn fail(&self, failure: JobFailure, attempts: Option<u32>) {
        self.send(Change::Fail { failure, attempts });
    }

    fn reporter(&self) -> ReportFn {
        let handle = self.clone();
        Arc::new(move |report| match report {
            FetchReport::Bytes(total) => handle.send(Change::Bytes(total)),
            FetchReport::Retrying { attempt, error } => handle.send(Change::Retrying {
                attempt,
                error: error.to_string(),
            }),
        })
    }
}

struct WorkItem {
    id: JobId,
    descriptor: TrackDescriptor,
    destination: PathBuf,
}

struct WorkerContext {
    queue: Mutex<VecDeque<WorkItem>>,
    updates: UnboundedSender<JobUpdate>,
    cancel: CancellationToken,
    fetcher: Arc<Fetcher>,
    transcoder: Arc<Transcoder>,
    embed_art: bool,
    save_cover: bool,
}

pub struct Scheduler {
    concurrency: usize,
    temp_dir: PathBuf,
    fetcher: Arc<Fetcher>,
    transcoder: Arc<Transcoder>,
    embed_art: bool,
    save_cover: bool,
    playlists: Option<Option<PathBuf>>,
    events: Arc<EventQueue>,
}

impl Scheduler {
    pub fn new(settings: &PipelineSettings, transport: Arc<dyn Transport>, events: Arc<EventQueue>) -> Self {
        let fetcher = Fetcher::new(
            transport,
            settings.temp_dir.clone(),
            RetryPolicy::from_settings(settings),
        );
        let transcoder = Transcoder::new(
            settings.codec.clone(),
            settings.codec_timeout,
            settings.temp_dir.clone(),
        );
        Self {
            concurrency: settings.concurrency.clamp(1, MAX_CONCURRENCY),
            temp_dir: settings.temp_dir.clone(),
            fetcher: Arc::new(fetcher),
            transcoder: Arc::new(transcoder),
            embed_art: settings.embed_art,
            save_cover: settings.save_cover,
            playlists: settings
                .write_playlists
                .then(|| settings.playlist_dir.clone()),
            events,
        }
    }

    /// Runs every job to a terminal state. Outcomes come back in job order.
    pub async fn run(&self, planned: Vec<PlannedJob>, cancel: &CancellationToken) -> ScheduleReport {
        if let Err(err) = tokio::fs::create_dir_all(&self.temp_dir).await {
            warn!("Cannot create {}: {err}", self.temp_dir.display());
        }

        let jobs: Vec<DownloadJob> = planned
            .into_iter()
            .enumerate()
            .map(|(id, job)| DownloadJob::new(id, job.descriptor, job.destination))
            .collect();
        let mut playlists = self.playlists.clone().map(PlaylistWriter::new);
        if let Some(writer) = playlists.as_mut() {
            for job in &jobs {
                writer.register(job.id, &job.descriptor);
            }
        }

        let (updates, receiver) = unbounded_channel();
        let queue = jobs
            .iter()
            .map(|job| WorkItem {
                id: job.id,
                descriptor: job.descriptor.clone(),
                destination: job.destination.clone(),
            })
            .collect();
        let context = Arc::new(WorkerContext {
            queue: Mutex::new(queue),
            updates,
            cancel: cancel.clone(),
            fetcher: self.fetcher.clone(),
            transcoder: self.transcoder.clone(),
            embed_art: self.embed_art,
            save_cover: self.save_cover,
        });

        let workers = self.concurrency.min(jobs.len());
        info!("Starting {} job(s) on {workers} worker(s)", jobs.len());
        let handles: Vec<_> = (0..workers)
            .map(|_| tokio::spawn(work(context.clone())))
            .collect();
        drop(context);

        let (jobs, written) = own_jobs(jobs, receiver, &self.events, playlists).await;
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("Worker task ended abnormally: {err}");
            }
        }

        let outcomes: Vec<JobOutcome> = jobs
            .into_iter()
            .map(|job| JobOutcome {
                id: job.id,
                descriptor: job.descriptor,
                destination: job.destination,
                status: job.status,
                attempts: job.attempts,
                failure: job.last_error.filter(|_| job.status == JobStatus::Failed),
            })
            .collect();
        let count = |status| outcomes.iter().filter(|o| o.status == status).count();
        info!(
            "Batch finished: {} done, {} skipped, {} failed",
            count(JobStatus::Done),
            count(JobStatus::Skipped),
            count(JobStatus::Failed)
        );
        ScheduleReport {
            outcomes,
            playlists: written,
        }
    }
}

/// The single owner of job state. Runs until every worker has hung up.
async fn own_jobs(
    mut jobs: Vec<DownloadJob>,
    mut receiver: UnboundedReceiver<JobUpdate>,
    events: &EventQueue,
    mut playlists: Option<PlaylistWriter>,
) -> (Vec<DownloadJob>, Vec<PathBuf>) {
    let mut written = Vec::new();
    while let Some(update) = receiver.recv().await {
        let Some(job) = jobs.get_mut(update.id) else {
            continue;
        };
        if job.status.is_terminal() {
            continue;
        }
        events.push(apply(job, update.change));
        if job.status.is_terminal() {
            record_terminal(job, playlists.as_mut(), &mut written);
        }
    }

    // A worker that died mid-job leaves its job without a terminal state.
    for job in jobs.iter_mut().filter(|job| !job.status.is_terminal()) {
        let failure = JobFailure::new(FailureKind::Io, "worker stopped before the job finished");
        events.push(apply(job, Change::Fail { failure, attempts: None }));
        record_terminal(job, playlists.as_mut(), &mut written);
    }
    (jobs, written)
}

fn apply(job: &mut DownloadJob, change: Change) -> ProgressEvent {
    let from = job.status;
    let mut event = ProgressEvent {
        job_id: job.id,
        from_state: from,
        to_state: from,
        bytes_transferred: None,
        error: None,
    };
    match change {
        Change::Enter(to) => {
            if to == JobStatus::Fetching {
                job.attempts = 1;
            }
            job.status = to;
            event.to_state = to;
        }
        Change::Bytes(total) => {
            job.bytes_transferred = total;
            event.bytes_transferred = Some(total);
        }
        Change::Retrying { attempt, error } => {
            job.attempts = attempt;
            job.last_error = Some(JobFailure::new(FailureKind::Fetch, error.clone()));
            event.error = Some(error);
        }
        Change::Fail { failure, attempts } => {
            if let Some(attempts) = attempts {
                job.attempts = attempts;
            }
            job.status = JobStatus::Failed;
            event.to_state = JobStatus::Failed;
            event.error = Some(failure.message.clone());
            job.last_error = Some(failure);
        }
    }
    event
}

fn record_terminal(job: &DownloadJob, playlists: Option<&mut PlaylistWriter>, written: &mut Vec<PathBuf>) {
    let Some(writer) = playlists else {
        return;
    };
    match writer.record(job.id, &job.descriptor, &job.destination, job.status) {
        Ok(Some(path)) => written.push(path),
        Ok(None) => {}
        Err(err) => warn!(
            "Playlist for {} - {} not written: {err}",
            job.descriptor.artist, job.descriptor.album
        ),
    }
}

async fn work(context: Arc<WorkerContext>) {
    loop {
        let Some(item) = context.queue.lock().pop_front() else {
            break;
        };
        let handle = JobHandle {
            id: item.id,
            updates: context.updates.clone(),
        };
        if context.cancel.is_cancelled() {
            handle.fail(JobFailure::cancelled(), None);
            continue;
        }
        context.run_job(item, &handle).await;
    }
}

impl WorkerContext {
    /// Reports cancellation when it was requested during the last stage.
    fn stop_requested(&self, handle: &JobHandle) -> bool {
        if self.cancel.is_cancelled() {
            handle.fail(JobFailure::cancelled(), None);
            return true;
        }
        false
    }

    async fn run_job(&self, item: WorkItem, handle: &JobHandle) {
        let WorkItem {
            id,
            descriptor,
            destination,
        } = item;

        if already_present(&destination).await {
            debug!("job {id}: {} exists, skipping", destination.display());
            handle.enter(JobStatus::Skipped);
            return;
        }

        handle.enter(JobStatus::Fetching);
        let reporter = handle.reporter();
        let fetched = match self
            .fetcher
            .fetch_audio(&descriptor.stream_url, &self.cancel, &reporter)
            .await
        {
            Ok(fetched) => fetched,
            Err(failure) => {
                handle.fail(failure.error.into(), Some(failure.attempts));
                return;
            }
        };
        let art = if self.embed_art || self.save_cover {
            self.fetcher.fetch_art(&descriptor.art_url, &self.cancel).await
        } else {
            None
        };
        if self.stop_requested(handle) {
            return;
        }

        let mut working = fetched.path;
        if descriptor.format.needs_transcode() {
            handle.enter(JobStatus::Transcoding);
            match self.transcoder.transcode(&working, descriptor.format).await {
                Ok(output) => working = output,
                Err(err) => {
                    handle.fail(err.into(), None);
                    return;
                }
            }
            if self.stop_requested(handle) {
                return;
            }
        }

        handle.enter(JobStatus::Tagging);
        let embedded = if self.embed_art { art.clone() } else { None };
        let tag_path = working.to_path_buf();
        let tag_descriptor = descriptor.clone();
        let tagged = tokio::task::spawn_blocking(move || {
            embed_tags(&tag_path, &tag_descriptor, embedded.as_deref().map(Vec::as_slice))
        })
        .await;
        match tagged {
            Ok(Ok(report)) => debug!("job {id}: tagged (art embedded: {})", report.art_embedded),
            Ok(Err(err)) => {
                handle.fail(err.into(), None);
                return;
            }
            Err(err) => {
                handle.fail(
                    JobFailure::new(FailureKind::Process, format!("tagging task failed: {err}")),
                    None,
                );
                return;
            }
        }
        if self.stop_requested(handle) {
            return;
        }

        handle.enter(JobStatus::Writing);
        let cover = if self.save_cover { art } else { None };
        let target = destination.clone();
        let written = tokio::task::spawn_blocking(move || {
            install_file(working, &target)?;
            if let Some(bytes) = cover
                && let Some(dir) = target.parent()
                && let Err(err) = save_cover(dir, &bytes)
            {
                warn!("Cover for {} not saved: {err}", dir.display());
            }
            Ok::<(), std::io::Error>(())
        })
        .await;
        match written {
            Ok(Ok(())) => handle.enter(JobStatus::Done),
            Ok(Err(err)) => handle.fail(
                JobFailure::new(
                    FailureKind::Io,
                    format!("cannot write {}: {err}", destination.display()),
                ),
                None,
            ),
            Err(err) => handle.fail(
                JobFailure::new(FailureKind::Io, format!("write task failed: {err}")),
                None,
            ),
        }
    }
}

async fn already_present(destination: &Path) -> bool {
    tokio::fs::metadata(destination)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

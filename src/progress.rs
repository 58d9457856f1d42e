#![forbid(unsafe_code)]

//! The one channel from the scheduler to whatever displays progress.
//!
//! Producers never wait on consumers. When the queue is full the oldest
//! non-terminal event is dropped; terminal events are always kept, even if
//! that takes the queue past its capacity.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::model::{JobStatus, ProgressEvent};

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<ProgressEvent>,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: ProgressEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.events.len() >= self.capacity {
                match state.events.iter().position(|queued| !queued.is_terminal()) {
                    Some(oldest) => {
                        state.events.remove(oldest);
                        state.dropped += 1;
                    }
                    None if !event.is_terminal() => {
                        state.dropped += 1;
                        return;
                    }
                    None => {}
                }
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Waits for the next event; `None` once closed and drained.
    pub async fn recv(&self) -> Option<ProgressEvent> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// No further events are accepted; queued ones can still be received.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Takes everything queued right now without waiting.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.state.lock().events.drain(..).collect()
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait ProgressSink: Send {
    fn publish(&mut self, event: &ProgressEvent);

    fn finish(&mut self) {}
}

/// Renders transitions through the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn publish(&mut self, event: &ProgressEvent) {
        let id = event.job_id;
        match (event.to_state, &event.error) {
            (JobStatus::Failed, Some(error)) => warn!("job {id}: failed: {error}"),
            (JobStatus::Fetching, Some(error)) => warn!("job {id}: retrying after: {error}"),
            (to, _) if event.from_state == to => {
                if let Some(bytes) = event.bytes_transferred {
                    log::debug!("job {id}: {bytes} bytes");
                }
            }
            (to, _) => info!("job {id}: {} -> {}", event.from_state.as_str(), to.as_str()),
        }
    }
}

/// One JSON object per line, for machine consumers.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl ProgressSink for JsonLinesSink {
    fn publish(&mut self, event: &ProgressEvent) {
        let written = serde_json::to_writer(&mut self.writer, event)
            .map_err(io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        if let Err(err) = written {
            warn!("Failed to write progress event: {err}");
        }
        if event.is_terminal()
            && let Err(err) = self.writer.flush()
        {
            warn!("Failed to flush progress file: {err}");
        }
    }

    fn finish(&mut self) {
        if let Err(err) = self.writer.flush() {
            warn!("Failed to flush progress file: {err}");
        }
    }
}

/// Moves events from the queue into the sinks until the queue is closed.
pub fn spawn_sink_pump(queue: Arc<EventQueue>, mut sinks: Vec<Box<dyn ProgressSink>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            for sink in sinks.iter_mut() {
                sink.publish(&event);
            }
        }
        for sink in sinks.iter_mut() {
            sink.finish();
        }
        let dropped = queue.dropped();
        if dropped > 0 {
            info!("{dropped} progress event(s) were dropped under load");
        }
    })
}

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::job::{FileOutcome, FileResult};

/// Worker lifecycle phase. Once a terminal phase is reached there is no way
/// back to a non-terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Preflight,
    Downloading,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

/// Snapshot of the worker's state, served verbatim by the status endpoint.
/// This document is the only channel between worker and poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub phase: Phase,
    pub active: Vec<String>,
    pub total_files: usize,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub throughput_bps: u64,
    pub results: Vec<FileResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerStatus {
    pub fn failed_results(&self) -> Vec<&FileResult> {
        self.results
            .iter()
            .filter(|r| r.status == FileOutcome::Failed)
            .collect()
    }

    pub fn skipped_results(&self) -> Vec<&FileResult> {
        self.results
            .iter()
            .filter(|r| r.status == FileOutcome::Skipped)
            .collect()
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    active: BTreeSet<String>,
    total_files: usize,
    downloaded_bytes: u64,
    total_bytes: u64,
    results: Vec<FileResult>,
    error: Option<String>,
}

/// Shared handle to the worker's status record. The download pipeline is the
/// single writer; the ticker and the status endpoint only take snapshots.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<Inner>>,
    window: Arc<Mutex<ThroughputWindow>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        StatusHandle {
            inner: Arc::new(RwLock::new(Inner {
                phase: Phase::Preflight,
                active: BTreeSet::new(),
                total_files: 0,
                downloaded_bytes: 0,
                total_bytes: 0,
                results: Vec::new(),
                error: None,
            })),
            window: Arc::new(Mutex::new(ThroughputWindow::new(Duration::from_secs(60)))),
        }
    }

    pub fn begin(&self, total_files: usize) {
        self.inner.write().unwrap().total_files = total_files;
    }

    pub fn set_total_bytes(&self, total_bytes: u64) {
        self.inner.write().unwrap().total_bytes = total_bytes;
    }

    pub fn set_phase(&self, phase: Phase) {
        let mut inner = self.inner.write().unwrap();
        if !inner.phase.is_terminal() {
            inner.phase = phase;
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.read().unwrap().phase
    }

    pub fn start_file(&self, dest: &str) {
        self.inner.write().unwrap().active.insert(dest.to_string());
    }

    pub fn finish_file(&self, dest: &str) {
        self.inner.write().unwrap().active.remove(dest);
    }

    pub fn push_result(&self, result: FileResult) {
        self.inner.write().unwrap().results.push(result);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.inner.write().unwrap().downloaded_bytes += bytes;
        self.window.lock().unwrap().record(bytes);
    }

    /// Abort the whole worker with a top-level error message.
    pub fn fail(&self, message: impl Into<String>) {
        let mut inner = self.inner.write().unwrap();
        inner.error = Some(message.into());
        inner.phase = Phase::Failed;
    }

    /// Move to the terminal phase: `failed` if any entry failed, else
    /// `completed`. No-op if a terminal phase was already set.
    pub fn finish(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.phase.is_terminal() {
            return;
        }
        let any_failed = inner
            .results
            .iter()
            .any(|r| r.status == FileOutcome::Failed);
        inner.phase = if any_failed {
            Phase::Failed
        } else {
            Phase::Completed
        };
    }

    pub fn snapshot(&self) -> WorkerStatus {
        let throughput_bps = self.window.lock().unwrap().bytes_per_sec();
        let inner = self.inner.read().unwrap();
        WorkerStatus {
            phase: inner.phase,
            active: inner.active.iter().cloned().collect(),
            total_files: inner.total_files,
            downloaded_bytes: inner.downloaded_bytes,
            total_bytes: inner.total_bytes,
            throughput_bps,
            results: inner.results.clone(),
            error: inner.error.clone(),
        }
    }
}

/// Trailing-window throughput estimate: only byte-count samples from the
/// last `window` contribute, so the figure tracks recent rate rather than a
/// lifetime average.
#[derive(Debug)]
pub struct ThroughputWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        ThroughputWindow {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
    }

    pub fn bytes_per_sec(&mut self) -> u64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&mut self, now: Instant) -> u64 {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let oldest = match self.samples.front() {
            Some((at, _)) => *at,
            None => return 0,
        };
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let elapsed = now.duration_since(oldest).max(Duration::from_secs(1));
        (total as f64 / elapsed.as_secs_f64()) as u64
    }
}

/// Human-readable progress line printed by the worker's ticker and by the
/// poller after each successful status poll.
pub fn progress_line(status: &WorkerStatus) -> String {
    let done = status.results.len();
    // Unknown-size entries contribute bytes without contributing to the
    // total, so the raw ratio can pass 100
    let percent = if status.total_bytes > 0 {
        (status.downloaded_bytes * 100 / status.total_bytes).min(100)
    } else {
        0
    };
    let remaining = status.total_bytes.saturating_sub(status.downloaded_bytes);
    let eta = if status.throughput_bps > 0 {
        let secs = remaining / status.throughput_bps;
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        String::from("unknown")
    };
    let mut line = format!(
        "{}/{} files, {}/{} ({}%), {}/s, ETA {}",
        done,
        status.total_files,
        human_bytes(status.downloaded_bytes),
        human_bytes(status.total_bytes),
        percent,
        human_bytes(status.throughput_bps),
        eta
    );
    let failed = status.failed_results().len();
    if failed > 0 {
        line.push_str(&format!(", {} failed", failed));
    }
    line
}

pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

//! Checkpoint progress monitor.
//!
//! Polls a fixed set of checkpoint paths until every one of them reports the
//! target epoch. Missing or half-written files are left out of that poll's
//! progress map and retried on the next one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use aa_types::{AaError, AaResult, CheckpointStore};

/// One expected checkpoint, labelled for progress reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedCheckpoint {
    pub label: String,
    pub path: PathBuf,
}

impl TrackedCheckpoint {
    pub fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Polling,
    Done,
}

/// Label to epoch reached, for the checkpoints readable in one poll.
pub type ProgressMap = BTreeMap<String, u32>;

pub struct ProgressMonitor {
    store: Arc<dyn CheckpointStore>,
    tracked: Vec<TrackedCheckpoint>,
    target_epoch: u32,
    interval: Duration,
    timeout: Option<Duration>,
    state: MonitorState,
}

impl ProgressMonitor {
    pub fn new(store: Arc<dyn CheckpointStore>, tracked: Vec<TrackedCheckpoint>, target_epoch: u32) -> Self {
        Self {
            store,
            tracked,
            target_epoch,
            interval: Duration::from_secs(10),
            timeout: None,
            state: MonitorState::Polling,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Read every checkpoint once. Weights-only checkpoints count as done.
    pub fn poll_once(&self) -> ProgressMap {
        read_progress(self.store.as_ref(), &self.tracked, self.target_epoch)
    }

    /// [`poll_once`](Self::poll_once) on the blocking pool.
    async fn poll_blocking(&self) -> AaResult<ProgressMap> {
        let store = self.store.clone();
        let tracked = self.tracked.clone();
        let target = self.target_epoch;
        tokio::task::spawn_blocking(move || read_progress(store.as_ref(), &tracked, target))
            .await
            .map_err(|e| AaError::WorkerLost(e.to_string()))
    }

    /// Lowest epoch across all tracked checkpoints, if every one was read.
    fn min_epoch(&self, progress: &ProgressMap) -> Option<u32> {
        if progress.len() < self.tracked.len() {
            return None;
        }
        progress.values().copied().min()
    }

    fn is_done(&self, progress: &ProgressMap) -> bool {
        self.min_epoch(progress)
            .is_some_and(|min| min >= self.target_epoch)
    }

    /// Poll until every checkpoint reaches the target epoch.
    ///
    /// Without a timeout this waits indefinitely.
    pub async fn wait(&mut self) -> AaResult<ProgressMap> {
        let started = Instant::now();
        let mut step = 0;
        loop {
            let progress = self.poll_blocking().await?;
            if let Some(min) = self.min_epoch(&progress) {
                if min > step {
                    step = min;
                    info!(epoch = step, target = self.target_epoch, progress = ?progress, "checkpoint progress");
                }
            }
            if self.is_done(&progress) {
                self.state = MonitorState::Done;
                return Ok(progress);
            }

            if let Some(timeout) = self.timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    let missing = self
                        .tracked
                        .iter()
                        .filter(|t| progress.get(&t.label).map_or(true, |&e| e < self.target_epoch))
                        .map(|t| t.label.clone())
                        .collect();
                    return Err(AaError::MonitorTimeout {
                        waited_secs: waited.as_secs(),
                        missing,
                    });
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

fn read_progress(store: &dyn CheckpointStore, tracked: &[TrackedCheckpoint], target: u32) -> ProgressMap {
    let mut progress = ProgressMap::new();
    for tracked in tracked {
        match store.load(&tracked.path) {
            Ok(Some(checkpoint)) => {
                progress.insert(tracked.label.clone(), checkpoint.progress(target));
            }
            Ok(None) => {}
            Err(e) => debug!(path = %tracked.path.display(), error = %e, "checkpoint not readable yet"),
        }
    }
    progress
}

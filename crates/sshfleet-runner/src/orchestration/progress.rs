//! Caller-owned completion reporting.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

use sshfleet_core::model::JobResult;

/// Completion count at the moment a job finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Notified by the dispatcher each time a job finishes.
///
/// Calls may come from several tasks at once.
pub trait ProgressObserver: Send + Sync {
    fn job_finished(&self, progress: Progress, result: &JobResult);
}

impl<F> ProgressObserver for F
where
    F: Fn(Progress, &JobResult) + Send + Sync,
{
    fn job_finished(&self, progress: Progress, result: &JobResult) {
        self(progress, result);
    }
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn job_finished(&self, _progress: Progress, _result: &JobResult) {}
}

/// Counts finished jobs and logs "N of total" as they complete.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    finished: AtomicUsize,
}

impl ProgressCounter {
    pub const fn new() -> Self {
        Self {
            finished: AtomicUsize::new(0),
        }
    }

    /// Jobs reported finished so far.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ProgressObserver for ProgressCounter {
    fn job_finished(&self, progress: Progress, result: &JobResult) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        info!(
            completed = progress.completed,
            total = progress.total,
            job = result.id.as_deref().unwrap_or("<anonymous>"),
            exit_code = ?result.exit_code,
            "Number of jobs finished so far: {} of {}",
            progress.completed,
            progress.total
        );
    }
}

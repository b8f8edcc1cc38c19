//! Greedy job dispatch over a [`WorkerPool`].
//!
//! Jobs are handed out in submission order: each job waits for the next free
//! connection and then runs on its own task while the dispatcher moves on to
//! the next job. Completion order is whatever the remote hosts make it; the
//! returned results are nevertheless in submission order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use sshfleet_core::model::{JobDescriptor, JobResult};

use super::pool::{PooledConnection, WorkerPool};
use super::progress::{Progress, ProgressObserver};
use super::session::{RemoteExecutionSession, ScratchLayout};
use crate::transport::Connector;

/// Assigns jobs to pooled connections and collects their results.
pub struct JobDispatcher<C: Connector> {
    pool: Arc<WorkerPool<C>>,
    layout: Arc<ScratchLayout>,
}

impl<C: Connector> JobDispatcher<C> {
    pub fn new(pool: Arc<WorkerPool<C>>, layout: ScratchLayout) -> Self {
        Self {
            pool,
            layout: Arc::new(layout),
        }
    }

    pub fn pool(&self) -> &WorkerPool<C> {
        &self.pool
    }

    /// Run every job, at most one per connection at a time.
    ///
    /// Returns exactly one result per job, in submission order. `observer`
    /// hears about each job as it finishes.
    pub async fn run(
        &self,
        jobs: Vec<JobDescriptor>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Vec<JobResult> {
        let total = jobs.len();
        info!(jobs = total, connections = self.pool.size(), "Dispatching jobs");

        let completed = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::with_capacity(total);
        let mut results: Vec<Option<JobResult>> = (0..total).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (index, job) in jobs.into_iter().enumerate() {
            ids.push(job.id.clone());
            let conn = match self.pool.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(job = job.display_id(), error = %e, "No connection for job");
                    let result = JobResult::not_run(job.id, e.to_string());
                    report(&*observer, &completed, total, &result);
                    results[index] = Some(result);
                    continue;
                }
            };

            let layout = Arc::clone(&self.layout);
            let observer = Arc::clone(&observer);
            let completed = Arc::clone(&completed);
            tasks.spawn(async move {
                let result = execute(conn, &job, &layout).await;
                report(&*observer, &completed, total, &result);
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "Job task failed"),
            }
        }

        let results: Vec<JobResult> = results
            .into_iter()
            .zip(ids)
            .map(|(result, id)| {
                result.unwrap_or_else(|| {
                    let result = JobResult::not_run(id, "job task panicked");
                    report(&*observer, &completed, total, &result);
                    result
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.succeeded()).count();
        info!(jobs = total, failed, "All jobs finished");
        results
    }

    /// Run jobs one after another, never more than one at a time.
    ///
    /// Each job still takes the next idle connection, so consecutive jobs
    /// rotate through every pooled connection in FIFO order.
    pub async fn run_sequential(
        &self,
        jobs: Vec<JobDescriptor>,
        observer: &dyn ProgressObserver,
    ) -> Vec<JobResult> {
        let total = jobs.len();
        info!(jobs = total, "Running jobs sequentially");
        let completed = AtomicUsize::new(0);
        let mut results = Vec::with_capacity(total);

        for job in jobs {
            let result = match self.pool.acquire().await {
                Ok(conn) => execute(conn, &job, &self.layout).await,
                Err(e) => JobResult::not_run(job.id.clone(), e.to_string()),
            };
            report(observer, &completed, total, &result);
            results.push(result);
        }
        results
    }
}

async fn execute<C: Connector>(
    mut conn: PooledConnection<C>,
    job: &JobDescriptor,
    layout: &ScratchLayout,
) -> JobResult {
    let result = RemoteExecutionSession::new(&mut *conn, job, layout)
        .run()
        .await;
    WorkerPool::<C>::release(conn);
    result
}

fn report(observer: &dyn ProgressObserver, completed: &AtomicUsize, total: usize, result: &JobResult) {
    let completed = completed.fetch_add(1, Ordering::SeqCst) + 1;
    observer.job_finished(Progress { completed, total }, result);
}

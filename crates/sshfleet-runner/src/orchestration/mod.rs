//! Job orchestration: connection pool, remote sessions, and greedy dispatch.
//!
//! - [`WorkerPool`]: one live connection per declared CPU slot, handed out
//!   exclusively through a fair (FIFO) blocking `acquire`.
//! - [`RemoteExecutionSession`]: runs one job on one connection inside a
//!   fresh scratch directory, end to end.
//! - [`JobDispatcher`]: assigns jobs in submission order to the first free
//!   connection and collects one [`JobResult`](sshfleet_core::JobResult) per
//!   job.
//! - [`ProgressObserver`]: caller-owned completion reporting.

pub mod dispatcher;
pub mod pool;
pub mod progress;
pub mod session;

pub use dispatcher::JobDispatcher;
pub use pool::{PoolError, PooledConnection, WorkerConnection, WorkerPool};
pub use progress::{NoProgress, Progress, ProgressCounter, ProgressObserver};
pub use session::{RemoteExecutionSession, ScratchLayout, SessionError};

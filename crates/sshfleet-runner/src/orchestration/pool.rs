//! Semaphore-guarded pool of live worker connections.
//!
//! The [`WorkerPool`] opens one connection per declared CPU slot across all
//! hosts and hands them out exclusively. Waiters are served in FIFO order
//! (Tokio's semaphore is fair). A checked-out connection is wrapped in a
//! [`PooledConnection`] that puts it back when dropped, so a connection is
//! returned on every exit path, including panics.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use sshfleet_core::model::HostDescriptor;

use crate::transport::{Connector, RemoteShell, TransportError};

/// One live session bound to one host, reused across many jobs.
///
/// Carries the host descriptor and connector so it can replace its own
/// session after a transfer failure.
pub struct WorkerConnection<C: Connector> {
    slot: usize,
    host: Arc<HostDescriptor>,
    connector: Arc<C>,
    shell: C::Shell,
    reconnect_attempts: u32,
}

impl<C: Connector> WorkerConnection<C> {
    /// Connect slot `slot` to `host`.
    pub async fn open(
        connector: Arc<C>,
        host: Arc<HostDescriptor>,
        slot: usize,
    ) -> Result<Self, TransportError> {
        let shell = connector.connect(&host).await?;
        debug!(host = %host.label(), slot, "Worker connected");
        Ok(Self {
            slot,
            host,
            connector,
            shell,
            reconnect_attempts: 0,
        })
    }

    /// Pool-wide slot index, stable for the pool's lifetime.
    pub const fn slot(&self) -> usize {
        self.slot
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.host
    }

    pub fn shell_mut(&mut self) -> &mut C::Shell {
        &mut self.shell
    }

    /// Number of reconnects attempted on this connection so far.
    pub const fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Replace the session in place with a fresh one to the same host.
    ///
    /// On failure the old session is kept.
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.reconnect_attempts += 1;
        info!(host = %self.host.label(), slot = self.slot, "Reconnecting worker");
        let fresh = self.connector.connect(&self.host).await?;
        let mut stale = std::mem::replace(&mut self.shell, fresh);
        stale.disconnect().await;
        Ok(())
    }
}

type IdleQueue<C> = Arc<Mutex<VecDeque<WorkerConnection<C>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection checked out of the pool.
///
/// When dropped, the connection is returned to the pool before the permit
/// is released.
pub struct PooledConnection<C: Connector> {
    conn: Option<WorkerConnection<C>>,
    idle: IdleQueue<C>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = WorkerConnection<C>;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(slot = conn.slot(), "Returning connection to pool");
            lock(&self.idle).push_back(conn);
        }
    }
}

/// Fixed-size pool of worker connections.
pub struct WorkerPool<C: Connector> {
    idle: IdleQueue<C>,
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl<C: Connector> WorkerPool<C> {
    /// Open `cpu_slots` connections to every host, all concurrently.
    ///
    /// Any single failure fails the whole build; no partial pool is returned.
    pub async fn build(connector: Arc<C>, hosts: &[HostDescriptor]) -> Result<Self, PoolError> {
        if hosts.is_empty() {
            return Err(PoolError::NoHosts);
        }
        if let Some(host) = hosts.iter().find(|h| h.cpu_slots == 0) {
            return Err(PoolError::InvalidHost {
                host: host.label(),
            });
        }

        let size: usize = hosts.iter().map(|h| h.cpu_slots).sum();
        info!(hosts = hosts.len(), slots = size, "Connecting worker pool");

        let mut pending = JoinSet::new();
        let mut next_slot = 0;
        for host in hosts {
            let host = Arc::new(host.clone());
            for _ in 0..host.cpu_slots {
                let slot = next_slot;
                next_slot += 1;
                let connector = Arc::clone(&connector);
                let host = Arc::clone(&host);
                pending.spawn(async move {
                    let label = host.label();
                    let opened = WorkerConnection::open(connector, host, slot).await;
                    (slot, label, opened)
                });
            }
        }

        let mut connections = Vec::with_capacity(size);
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((_, _, Ok(conn))) => connections.push(conn),
                Ok((slot, host, Err(source))) => {
                    error!(host = %host, slot, error = %source, "Worker connection failed");
                    pending.abort_all();
                    return Err(PoolError::Connect { host, slot, source });
                }
                Err(e) => {
                    pending.abort_all();
                    return Err(PoolError::Spawn(e.to_string()));
                }
            }
        }
        connections.sort_by_key(WorkerConnection::slot);

        info!(slots = size, "Worker pool ready");
        Ok(Self {
            idle: Arc::new(Mutex::new(connections.into())),
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    /// Wait for a free connection and take exclusive ownership of it.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        let conn = lock(&self.idle).pop_front().ok_or(PoolError::Closed)?;
        debug!(slot = conn.slot(), host = %conn.host().label(), "Connection acquired");
        Ok(PooledConnection {
            conn: Some(conn),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    /// Return a connection. Dropping the handle does the same.
    pub fn release(conn: PooledConnection<C>) {
        drop(conn);
    }

    /// Total number of connections (sum of CPU slots).
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Connections currently sitting idle in the pool.
    pub fn free_count(&self) -> usize {
        lock(&self.idle).len()
    }

    /// Connections currently checked out.
    pub fn owned_count(&self) -> usize {
        self.size - self.free_count()
    }

    /// Stop handing out connections and disconnect the idle ones.
    ///
    /// Pending and future `acquire` calls fail with [`PoolError::Closed`].
    /// Connections still checked out are dropped with the pool.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        let drained: Vec<_> = lock(&self.idle).drain(..).collect();
        info!(connections = drained.len(), "Shutting down worker pool");
        for mut conn in drained {
            conn.shell_mut().disconnect().await;
        }
    }
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No hosts configured")]
    NoHosts,

    #[error("Host {host} declares zero cpu slots")]
    InvalidHost { host: String },

    #[error("Failed to connect slot {slot} to {host}: {source}")]
    Connect {
        host: String,
        slot: usize,
        #[source]
        source: TransportError,
    },

    #[error("Connection task failed: {0}")]
    Spawn(String),

    /// The pool was shut down.
    #[error("Worker pool has been closed")]
    Closed,
}

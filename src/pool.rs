//! Connection pooling: a bounded set of connections handed out
//! on demand, with an idle FIFO for reuse and a waiter queue for callers
//! that arrive when the pool is at capacity.

use crate::config::Dialer;
use crate::connection::{Connection, ConnectionState};
use crate::error::{RedisError, RedisResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::debug;

/// Point-in-time counters exposed for observability.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_open: usize,
    pub num_idle: usize,
    pub wait_count: u64,
    pub wait_duration: Duration,
    pub max_idle_closed: u64,
}

struct Inner {
    dialer: Dialer,
    max_open: usize,
    max_idle: AtomicUsize,
    num_open: AtomicUsize,
    idle: AsyncMutex<VecDeque<Connection>>,
    waiters: AsyncMutex<VecDeque<oneshot::Sender<Connection>>>,
    wait_count: AtomicU64,
    wait_duration_micros: AtomicU64,
    max_idle_closed: AtomicU64,
    closed: AtomicBool,
}

/// A bounded pool of `Connection`s dialed from a single `Dialer`.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    pub fn new(dialer: Dialer, max_open: usize, max_idle: usize) -> Self {
        Pool {
            inner: Arc::new(Inner {
                dialer,
                max_open: max_open.max(1),
                max_idle: AtomicUsize::new(max_idle.min(max_open.max(1))),
                num_open: AtomicUsize::new(0),
                idle: AsyncMutex::new(VecDeque::new()),
                waiters: AsyncMutex::new(VecDeque::new()),
                wait_count: AtomicU64::new(0),
                wait_duration_micros: AtomicU64::new(0),
                max_idle_closed: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Acquires a connection, reusing an idle one if available, dialing a
    /// fresh one if under `max_open`, or waiting for a release otherwise.
    /// `deadline` bounds the whole acquisition, idle reuse included.
    pub async fn acquire(&self, deadline: Option<Duration>) -> RedisResult<PooledConnection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RedisError::PoolClosed);
        }

        if let Some(conn) = self.take_idle_usable().await {
            return Ok(PooledConnection::new(self.clone(), conn));
        }

        if self.inner.num_open.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < self.inner.max_open).then_some(n + 1)
        }).is_ok() {
            match Connection::connect(&self.inner.dialer).await {
                Ok(conn) => return Ok(PooledConnection::new(self.clone(), conn)),
                Err(e) => {
                    self.inner.num_open.fetch_sub(1, Ordering::AcqRel);
                    return Err(e);
                }
            }
        }

        self.wait_for_release(deadline).await
    }

    async fn take_idle_usable(&self) -> Option<Connection> {
        let mut idle = self.inner.idle.lock().await;
        while let Some(conn) = idle.pop_front() {
            if conn.state() == ConnectionState::Active {
                return Some(conn);
            }
            self.inner.num_open.fetch_sub(1, Ordering::AcqRel);
        }
        None
    }

    async fn wait_for_release(&self, deadline: Option<Duration>) -> RedisResult<PooledConnection> {
        let started = Instant::now();
        self.inner.wait_count.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().await.push_back(tx);

        let recv_result = match deadline {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(inner) => inner.map_err(|_| RedisError::PoolClosed),
                Err(_) => Err(RedisError::PoolTimeout),
            },
            None => rx.await.map_err(|_| RedisError::PoolClosed),
        };
        self.inner
            .wait_duration_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        recv_result.map(|conn| PooledConnection::new(self.clone(), conn))
    }

    /// Returns a connection to the pool: handed directly to a waiter if one
    /// is queued, otherwise pushed onto the idle FIFO (and closed outright
    /// if that would exceed `max_idle`).
    async fn release(&self, conn: Connection) {
        if self.inner.closed.load(Ordering::Acquire) || conn.state() != ConnectionState::Active {
            self.inner.num_open.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let mut waiters = self.inner.waiters.lock().await;
        while let Some(waiter) = waiters.pop_front() {
            match waiter.send(conn) {
                Ok(()) => return,
                Err(returned_conn) => {
                    // Waiter already gave up (e.g. timed out); try the next
                    // one with the same connection.
                    return self.release_after_waiter_gone(returned_conn).await;
                }
            }
        }
        drop(waiters);

        let max_idle = self.inner.max_idle.load(Ordering::Acquire);
        let mut idle = self.inner.idle.lock().await;
        if idle.len() >= max_idle {
            self.inner.max_idle_closed.fetch_add(1, Ordering::Relaxed);
            self.inner.num_open.fetch_sub(1, Ordering::AcqRel);
            drop(idle);
            let _ = conn.close().await;
        } else {
            idle.push_back(conn);
        }
    }

    async fn release_after_waiter_gone(&self, conn: Connection) {
        Box::pin(self.release(conn)).await;
    }

    /// Changes the idle-pool ceiling; connections already idle above the
    /// new limit are closed on their next release rather than evicted
    /// immediately.
    pub fn set_max_idle(&self, max_idle: usize) {
        self.inner.max_idle.store(max_idle, Ordering::Release);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            num_open: self.inner.num_open.load(Ordering::Acquire),
            num_idle: self.inner.idle.try_lock().map(|g| g.len()).unwrap_or(0),
            wait_count: self.inner.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_micros(
                self.inner.wait_duration_micros.load(Ordering::Relaxed),
            ),
            max_idle_closed: self.inner.max_idle_closed.load(Ordering::Relaxed),
        }
    }

    /// Closes the pool: no further `acquire` calls succeed, and every idle
    /// connection is closed. In-flight borrows are allowed to finish and
    /// their connections are closed on release instead of being returned to
    /// the idle pool.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut idle = self.inner.idle.lock().await;
        while let Some(conn) = idle.pop_front() {
            self.inner.num_open.fetch_sub(1, Ordering::AcqRel);
            let _ = conn.close().await;
        }
        debug!("pool closed");
    }
}

/// A connection borrowed from a `Pool`. Returned to the pool's idle FIFO
/// when dropped (synchronously detaching the async release via `tokio::spawn`
/// so `Drop` itself stays non-async).
pub struct PooledConnection {
    pool: Pool,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Pool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken only on drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(conn).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_max_idle_clamps_future_releases() {
        let pool = Pool::new(Dialer::new(), 4, 4);
        pool.set_max_idle(1);
        assert_eq!(pool.inner.max_idle.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let pool = Pool::new(Dialer::new(), 4, 4);
        let stats = pool.stats();
        assert_eq!(stats.num_open, 0);
        assert_eq!(stats.num_idle, 0);
        assert_eq!(stats.wait_count, 0);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let pool = Pool::new(Dialer::new(), 4, 4);
        pool.close().await;
        let result = pool.acquire(Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(RedisError::PoolClosed)));
    }
}

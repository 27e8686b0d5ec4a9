//! C3 — Bounded VMS session pool.
//!
//! Sessions are expensive to establish (an authenticate round-trip against
//! the VMS) so callers borrow them from a bounded pool instead of opening a
//! new one per operation. A background task evicts sessions idle longer than
//! `idle_timeout`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("session pool closed")]
    Closed,
    #[error("timed out waiting {0:?} for a pooled session")]
    AcquireTimeout(Duration),
    #[error("session factory failed: {0}")]
    Factory(String),
}

/// A pooled VMS session. The pool only manages lifecycle (creation, idle
/// eviction, checkout/checkin); session semantics belong to `T`.
struct Entry<T> {
    session: T,
    last_used: Instant,
}

struct Inner<T> {
    idle: Mutex<VecDeque<Entry<T>>>,
    /// Total sessions outstanding (idle + checked out), bounded by `max_size`.
    outstanding: AtomicU64,
    max_size: u64,
    idle_timeout: Duration,
    closed: std::sync::atomic::AtomicBool,
    returned: Notify,
}

/// A session borrowed from the pool. Returns itself to the idle queue on
/// drop unless explicitly discarded (e.g. the caller observed it as broken).
pub struct PooledSession<T> {
    session: Option<T>,
    pool: Arc<Inner<T>>,
}

impl<T> PooledSession<T> {
    pub fn get(&self) -> &T {
        self.session.as_ref().expect("session taken")
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.session.as_mut().expect("session taken")
    }

    /// Drop the session without returning it to the pool, e.g. because the
    /// caller detected it is broken. Frees one outstanding slot.
    pub fn discard(mut self) {
        self.session = None;
        self.pool.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.pool.returned.notify_one();
    }
}

impl<T> Drop for PooledSession<T> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let mut idle = pool.idle.lock().await;
                idle.push_back(Entry {
                    session,
                    last_used: Instant::now(),
                });
                drop(idle);
                pool.returned.notify_one();
            });
        }
    }
}

/// Bounded pool of VMS sessions, generic over the session type so this
/// module has no dependency on a concrete VMS client.
pub struct ConnectionPool<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ConnectionPool<T> {
    pub fn new(max_size: u64, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(VecDeque::new()),
                outstanding: AtomicU64::new(0),
                max_size,
                idle_timeout,
                closed: std::sync::atomic::AtomicBool::new(false),
                returned: Notify::new(),
            }),
            evictor: Mutex::new(None),
        }
    }

    /// Spawn the idle-eviction background task. Idempotent.
    pub async fn start_evictor(self: &Arc<Self>) {
        let mut guard = self.evictor.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let sweep_interval = (inner.idle_timeout / 2).max(Duration::from_millis(100));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let mut idle = inner.idle.lock().await;
                let before = idle.len();
                idle.retain(|e| e.last_used.elapsed() < inner.idle_timeout);
                let evicted = before - idle.len();
                let remaining = idle.len() as u64;
                drop(idle);
                if evicted > 0 {
                    inner
                        .outstanding
                        .fetch_sub(evicted as u64, Ordering::SeqCst);
                    debug!(evicted, remaining, "evicted idle sessions");
                }
            }
        }));
    }

    pub async fn stop(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut guard = self.evictor.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        self.inner.returned.notify_waiters();
    }

    /// Acquire a session: reuse an idle one, create a new one if below
    /// `max_size`, or wait for one to be returned. `factory` is only called
    /// while under the slot budget, never while holding the idle-queue lock.
    pub async fn get<F, Fut>(&self, factory: F) -> Result<PooledSession<T>, PoolError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }

            {
                let mut idle = self.inner.idle.lock().await;
                if let Some(entry) = idle.pop_front() {
                    return Ok(PooledSession {
                        session: Some(entry.session),
                        pool: self.inner.clone(),
                    });
                }
            }

            let outstanding = self.inner.outstanding.load(Ordering::SeqCst);
            if outstanding < self.inner.max_size {
                // Reserve the slot before the (possibly slow) factory call so
                // concurrent callers cannot all race past the bound.
                if self
                    .inner
                    .outstanding
                    .compare_exchange(
                        outstanding,
                        outstanding + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    match factory().await {
                        Ok(session) => {
                            info!(outstanding = outstanding + 1, "created pooled session");
                            return Ok(PooledSession {
                                session: Some(session),
                                pool: self.inner.clone(),
                            });
                        }
                        Err(message) => {
                            self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
                            warn!(%message, "session factory failed");
                            return Err(PoolError::Factory(message));
                        }
                    }
                }
                continue;
            }

            self.inner.returned.notified().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.inner.outstanding.load(Ordering::SeqCst),
            max_size: self.inner.max_size,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub outstanding: u64,
    pub max_size: u64,
}

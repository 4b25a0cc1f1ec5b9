//! Blocking pool of lab sessions for course-wide runs.
//!
//! Each worker checks out one physical session for the duration of an
//! exercise. Checkout blocks while every session is in use, validates liveness
//! on the way out, and transparently replaces a dead session. The pool only
//! manages session lifetime; it never sees simulation state.

use crate::error::{Error, Result};
use crate::remote::RemoteShell;
use log::{debug, info, warn};
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

type Factory<S> = Box<dyn Fn() -> Result<S> + Send + Sync>;

struct PooledSession<S> {
    shell: S,
    created_at: Instant,
    last_used: Instant,
}

struct PoolState<S> {
    idle: Vec<PooledSession<S>>,
    checked_out: usize,
    created: usize,
    replaced: usize,
}

/// Statistics about the session pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Sessions connected over the pool's lifetime
    pub created: usize,
    /// Dead sessions swapped out on checkout
    pub replaced: usize,
    /// Age of the oldest idle session since it connected
    pub oldest_idle: Option<Duration>,
    /// Longest time an idle session has gone unused
    pub longest_unused: Option<Duration>,
}

/// Thread-safe, fixed-capacity pool of connected shells.
pub struct SessionPool<S: RemoteShell> {
    factory: Factory<S>,
    state: Mutex<PoolState<S>>,
    available: Condvar,
    capacity: usize,
}

impl<S: RemoteShell> SessionPool<S> {
    /// Creates a pool that builds unconnected shells with `factory` and
    /// connects them on demand.
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> Result<S> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                checked_out: 0,
                created: 0,
                replaced: 0,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState<S>>> {
        self.state
            .lock()
            .map_err(|e| Error::Connection(format!("Failed to acquire pool lock: {}", e)))
    }

    fn create(&self) -> Result<S> {
        let mut shell = (self.factory)()?;
        shell.connect()?;
        Ok(shell)
    }

    /// Checks out a live session, blocking until one is available.
    pub fn checkout(&self) -> Result<SessionGuard<'_, S>> {
        let mut state = self.lock()?;
        loop {
            if let Some(mut pooled) = state.idle.pop() {
                state.checked_out += 1;
                drop(state);

                if pooled.shell.is_alive() {
                    debug!("Reusing pooled session to {}", pooled.shell.host());
                    pooled.last_used = Instant::now();
                    return Ok(SessionGuard::new(self, pooled));
                }

                warn!("Pooled session to {} is dead; replacing it", pooled.shell.host());
                pooled.shell.disconnect();
                let fresh = self.create();
                let mut state = self.lock()?;
                return match fresh {
                    Ok(shell) => {
                        state.created += 1;
                        state.replaced += 1;
                        Ok(SessionGuard::new(self, PooledSession::new(shell)))
                    }
                    Err(e) => {
                        state.checked_out -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            if state.checked_out < self.capacity {
                state.checked_out += 1;
                drop(state);

                info!("Opening new pooled session");
                let fresh = self.create();
                let mut state = self.lock()?;
                return match fresh {
                    Ok(shell) => {
                        state.created += 1;
                        Ok(SessionGuard::new(self, PooledSession::new(shell)))
                    }
                    Err(e) => {
                        state.checked_out -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            state = self
                .available
                .wait(state)
                .map_err(|e| Error::Connection(format!("Failed to wait on pool: {}", e)))?;
        }
    }

    fn release(&self, pooled: PooledSession<S>) {
        if let Ok(mut state) = self.state.lock() {
            state.checked_out -= 1;
            state.idle.push(pooled);
            self.available.notify_one();
        }
    }

    /// Disconnects every idle session.
    pub fn close_all(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let closed = state.idle.len();
        for mut pooled in state.idle.drain(..) {
            pooled.shell.disconnect();
        }
        info!("Closed {} pooled sessions", closed);
        Ok(closed)
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let state = self.lock()?;
        Ok(PoolStats {
            capacity: self.capacity,
            idle: state.idle.len(),
            checked_out: state.checked_out,
            created: state.created,
            replaced: state.replaced,
            oldest_idle: state.idle.iter().map(|p| p.created_at.elapsed()).max(),
            longest_unused: state.idle.iter().map(|p| p.last_used.elapsed()).max(),
        })
    }
}

impl<S> PooledSession<S> {
    fn new(shell: S) -> Self {
        let now = Instant::now();
        Self {
            shell,
            created_at: now,
            last_used: now,
        }
    }
}

/// Guard that returns its session to the pool when dropped.
pub struct SessionGuard<'a, S: RemoteShell> {
    pool: &'a SessionPool<S>,
    session: Option<PooledSession<S>>,
}

impl<'a, S: RemoteShell> SessionGuard<'a, S> {
    fn new(pool: &'a SessionPool<S>, session: PooledSession<S>) -> Self {
        Self {
            pool,
            session: Some(session),
        }
    }
}

impl<S: RemoteShell> Deref for SessionGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        // only None after drop
        &self.session.as_ref().expect("session present until drop").shell
    }
}

impl<S: RemoteShell> DerefMut for SessionGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session.as_mut().expect("session present until drop").shell
    }
}

impl<S: RemoteShell> Drop for SessionGuard<'_, S> {
    fn drop(&mut self) {
        if let Some(mut pooled) = self.session.take() {
            pooled.last_used = Instant::now();
            debug!("Returning session to {} to the pool", pooled.shell.host());
            self.pool.release(pooled);
        }
    }
}

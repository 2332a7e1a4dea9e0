//! Idle connection reaper.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use super::PooledConnection;

/// A pool the reaper can sweep.
pub trait Reapable: Send + Sync {
    /// Marks idle connections and removes those idle for longer than
    /// `idle_timeout` since they were first seen idle.
    ///
    /// The returned connections are shut down by the caller, outside any
    /// pool lock.
    fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> ReapOutcome;
}

/// Result of one sweep over a pool.
#[derive(Debug)]
pub struct ReapOutcome {
    /// Connections removed from the pool.
    pub evicted: Vec<Arc<PooledConnection>>,
    /// `false` once the pool holds nothing worth sweeping.
    pub keep: bool,
}

struct Registration {
    id: Uuid,
    generation: u64,
    pool: Weak<dyn Reapable>,
}

#[derive(Default)]
struct ReaperState {
    registrations: Vec<Registration>,
    next_generation: u64,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

struct ReaperInner {
    idle_timeout: Duration,
    runtime: Handle,
    state: Mutex<ReaperState>,
}

/// Background task closing idle pooled connections.
///
/// The task starts when the first pool registers and stops once no pool
/// is left. It sweeps every half `idle_timeout`, so a connection idle since
/// its last session ended is closed after more than `idle_timeout` and at
/// most one and a half `idle_timeout`.
#[derive(Clone)]
pub struct Reaper {
    inner: Arc<ReaperInner>,
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("idle_timeout", &self.inner.idle_timeout)
            .field("registered", &self.registered())
            .finish_non_exhaustive()
    }
}

impl Reaper {
    /// Creates a stopped reaper for connections idle longer than
    /// `idle_timeout`.
    #[must_use]
    pub fn new(idle_timeout: Duration, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ReaperInner {
                idle_timeout,
                runtime,
                state: Mutex::new(ReaperState::default()),
            }),
        }
    }

    /// Adds a pool, starting the task if needed. Registering an id again
    /// replaces the earlier registration.
    pub fn register(&self, id: Uuid, pool: Weak<dyn Reapable>) {
        let mut state = self.inner.lock();
        if state.stopped {
            return;
        }
        state.registrations.retain(|registration| registration.id != id);
        let generation = state.next_generation;
        state.next_generation += 1;
        state.registrations.push(Registration {
            id,
            generation,
            pool,
        });
        if state.task.is_none() {
            debug!(idle_timeout_ms = self.inner.idle_timeout.as_millis(), "reaper started");
            state.task = Some(self.inner.runtime.spawn(run(Arc::downgrade(&self.inner))));
        }
    }

    /// Removes a pool.
    pub fn unregister(&self, id: Uuid) {
        self.inner
            .lock()
            .registrations
            .retain(|registration| registration.id != id);
    }

    /// Registered pools.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    /// Returns `true` while the background task exists.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().task.is_some()
    }

    /// Stops the task for good and forgets every pool.
    pub fn shutdown(&self) {
        let task = {
            let mut state = self.inner.lock();
            state.stopped = true;
            state.registrations.clear();
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
            debug!("reaper stopped");
        }
    }
}

impl ReaperInner {
    fn lock(&self) -> MutexGuard<'_, ReaperState> {
        self.state.lock().expect("lock poisoned")
    }

    fn sweep_interval(&self) -> Duration {
        (self.idle_timeout / 2).max(Duration::from_millis(1))
    }

    /// One pass over every pool. Returns `false` once the task should exit.
    fn sweep(&self) -> bool {
        let snapshot: Vec<(Uuid, u64, Weak<dyn Reapable>)> = self
            .lock()
            .registrations
            .iter()
            .map(|r| (r.id, r.generation, Weak::clone(&r.pool)))
            .collect();

        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut finished = Vec::new();
        for (id, generation, pool) in snapshot {
            match pool.upgrade() {
                Some(pool) => {
                    let outcome = pool.reap_idle(now, self.idle_timeout);
                    evicted.extend(outcome.evicted);
                    if !outcome.keep {
                        finished.push((id, generation));
                    }
                },
                None => finished.push((id, generation)),
            }
        }

        for pooled in evicted {
            debug!(connection = pooled.id(), "closing idle connection");
            pooled.shutdown();
        }

        let mut state = self.lock();
        state
            .registrations
            .retain(|r| !finished.contains(&(r.id, r.generation)));
        trace!(pools = state.registrations.len(), "reaper sweep done");
        if state.registrations.is_empty() || state.stopped {
            state.task = None;
            debug!("reaper idle, stopping");
            return false;
        }
        true
    }
}

async fn run(inner: Weak<ReaperInner>) {
    loop {
        let Some(interval) = inner.upgrade().map(|inner| inner.sweep_interval()) else {
            return;
        };
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.sweep() {
            return;
        }
    }
}

//! Bounded pool of idle workers with FIFO waiter hand-off.
//!
//! `acquire`/`release` mutate the pool state inside one critical section
//! each; suspension only happens on the waiter channel, never between a
//! decision and its matching mutation. Under contention a released worker is
//! handed directly to the oldest waiter, bypassing the idle list, so waiters
//! are served strictly FIFO and can never be starved by an idle surplus.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::HostConfig;
use crate::error::EvalError;
use crate::worker::Worker;

/// Floor for the idle sweep cadence so short test timeouts still get swept.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

pub struct WorkerPool {
    inner: Arc<Mutex<PoolState>>,
    config: Arc<HostConfig>,
}

struct PoolState {
    idle: Vec<IdleWorker>,
    waiters: VecDeque<oneshot::Sender<Result<Worker, EvalError>>>,
    /// Idle plus acquired-but-not-released workers. Never exceeds
    /// `max_pool_size`.
    live: usize,
    disposed: bool,
    sweeper: Option<JoinHandle<()>>,
}

struct IdleWorker {
    worker: Worker,
    released_at: Instant,
}

enum AcquirePlan {
    Reuse(Worker),
    Spawn,
    Wait(oneshot::Receiver<Result<Worker, EvalError>>),
}

impl WorkerPool {
    /// Creates the pool and starts its idle-eviction sweeper. Must be called
    /// from within a tokio runtime.
    pub fn new(config: Arc<HostConfig>) -> Self {
        let inner = Arc::new(Mutex::new(PoolState {
            idle: Vec::new(),
            waiters: VecDeque::new(),
            live: 0,
            disposed: false,
            sweeper: None,
        }));
        let sweeper = tokio::spawn(idle_sweep_loop(
            Arc::downgrade(&inner),
            config.limits.idle_timeout,
        ));
        lock_or_recover(&inner).sweeper = Some(sweeper);
        Self { inner, config }
    }

    /// Pops an idle worker, spawns a new one if the pool is under its bound,
    /// or suspends FIFO until a release hands one over.
    pub async fn acquire(&self) -> Result<Worker, EvalError> {
        loop {
            let plan = {
                let mut state = lock_or_recover(&self.inner);
                if state.disposed {
                    return Err(EvalError::Disposed);
                }
                if let Some(entry) = state.idle.pop() {
                    AcquirePlan::Reuse(entry.worker)
                } else if state.live < self.config.limits.max_pool_size {
                    state.live += 1;
                    AcquirePlan::Spawn
                } else {
                    let (sender, receiver) = oneshot::channel();
                    state.waiters.push_back(sender);
                    AcquirePlan::Wait(receiver)
                }
            };
            match plan {
                AcquirePlan::Reuse(mut worker) => {
                    if worker.has_exited() {
                        // Stale idle worker; free its slot and retry.
                        self.discard(worker).await;
                        continue;
                    }
                    return Ok(worker);
                }
                AcquirePlan::Spawn => {
                    return match Worker::spawn(self.config.clone()).await {
                        Ok(worker) => Ok(worker),
                        Err(error) => {
                            lock_or_recover(&self.inner).live -= 1;
                            Err(error)
                        }
                    };
                }
                AcquirePlan::Wait(receiver) => {
                    return receiver.await.unwrap_or(Err(EvalError::Disposed));
                }
            }
        }
    }

    /// Returns a worker to the pool: oldest waiter first, then the idle
    /// list, else the surplus worker is terminated. Dead workers free their
    /// slot instead.
    pub async fn release(&self, mut worker: Worker) {
        if worker.has_exited() {
            self.discard(worker).await;
            return;
        }
        if let Some(mut surplus) = self.hand_off(worker) {
            surplus.terminate().await;
        }
    }

    /// Drops a dead or distrusted worker, freeing its slot. If waiters are
    /// queued, a replacement is spawned for the oldest one.
    pub async fn discard(&self, mut worker: Worker) {
        let respawn = {
            let mut state = lock_or_recover(&self.inner);
            state.live = state.live.saturating_sub(1);
            let needed = !state.disposed
                && !state.waiters.is_empty()
                && state.live < self.config.limits.max_pool_size;
            if needed {
                state.live += 1;
            }
            needed
        };
        worker.terminate().await;

        if respawn {
            match Worker::spawn(self.config.clone()).await {
                Ok(fresh) => {
                    if let Some(mut surplus) = self.hand_off(fresh) {
                        surplus.terminate().await;
                    }
                }
                Err(error) => {
                    let waiter = {
                        let mut state = lock_or_recover(&self.inner);
                        state.live = state.live.saturating_sub(1);
                        state.waiters.pop_front()
                    };
                    if let Some(sender) = waiter {
                        let _ = sender.send(Err(error));
                    }
                }
            }
        }
    }

    /// Terminates idle workers, fails pending waiters, and stops the
    /// sweeper. Safe to call multiple times.
    pub async fn dispose(&self) {
        let (idle, waiters, sweeper) = {
            let mut state = lock_or_recover(&self.inner);
            state.disposed = true;
            state.live = state.live.saturating_sub(state.idle.len());
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
                state.sweeper.take(),
            )
        };
        if let Some(handle) = sweeper {
            handle.abort();
        }
        for sender in waiters {
            let _ = sender.send(Err(EvalError::Disposed));
        }
        for mut entry in idle {
            entry.worker.terminate().await;
        }
    }

    pub fn idle_count(&self) -> usize {
        lock_or_recover(&self.inner).idle.len()
    }

    pub fn live_count(&self) -> usize {
        lock_or_recover(&self.inner).live
    }

    pub fn waiter_count(&self) -> usize {
        lock_or_recover(&self.inner).waiters.len()
    }

    /// Hands a live worker to the oldest waiter or the idle list. Returns
    /// the worker back when the pool has no room for it (its slot is freed).
    fn hand_off(&self, mut worker: Worker) -> Option<Worker> {
        let mut state = lock_or_recover(&self.inner);
        if state.disposed {
            state.live = state.live.saturating_sub(1);
            return Some(worker);
        }
        while let Some(sender) = state.waiters.pop_front() {
            match sender.send(Ok(worker)) {
                Ok(()) => return None,
                // The waiter gave up; try the next one.
                Err(Ok(returned)) => worker = returned,
                Err(Err(_)) => unreachable!("hand_off only sends Ok values"),
            }
        }
        if state.idle.len() < self.config.limits.max_pool_size {
            state.idle.push(IdleWorker {
                worker,
                released_at: Instant::now(),
            });
            None
        } else {
            state.live = state.live.saturating_sub(1);
            Some(worker)
        }
    }
}

async fn idle_sweep_loop(state: Weak<Mutex<PoolState>>, idle_timeout: Duration) {
    let period = (idle_timeout / 4).max(MIN_SWEEP_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = state.upgrade() else {
            return;
        };
        let expired: Vec<Worker> = {
            let mut state = lock_or_recover(&inner);
            if state.disposed {
                return;
            }
            let mut expired = Vec::new();
            let mut index = 0;
            while index < state.idle.len() {
                if state.idle[index].released_at.elapsed() > idle_timeout {
                    expired.push(state.idle.remove(index).worker);
                } else {
                    index += 1;
                }
            }
            state.live = state.live.saturating_sub(expired.len());
            expired
        };
        for mut worker in expired {
            tracing::info!(pid = worker.pid(), "evicting idle interpreter worker");
            worker.terminate().await;
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

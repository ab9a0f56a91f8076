//! Context-to-worker affinity and per-context serial execution.
//!
//! A context (one document, one session) keeps exactly one dedicated worker
//! so the interpreter's mutable session state survives across sequential
//! requests. Requests against one context run strictly one at a time in
//! submission order; distinct contexts run fully in parallel, each against
//! its own worker.
//!
//! The router favors reuse over pooling for context-bound work: a live
//! worker is never swapped out from under its context. The pool is only the
//! allocator consulted when a context needs a worker it does not have,
//! either on first use or as a replacement after its worker died.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{EvalError, ExecutionOutput};
use crate::pool::WorkerPool;
use crate::worker::{Worker, WorkerState};

struct EvalJob {
    code: String,
    reply: oneshot::Sender<Result<ExecutionOutput, EvalError>>,
}

/// Cheap handle to one execution context. All clones feed the same serial
/// queue.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    context_id: String,
    jobs: mpsc::UnboundedSender<EvalJob>,
    interrupt: watch::Sender<u64>,
}

impl ContextHandle {
    pub fn context_id(&self) -> &str {
        &self.inner.context_id
    }

    /// Submits one evaluation unit. The queue position is taken synchronously
    /// when this method is called, so concurrent callers that call in a known
    /// order are executed in that order; the returned future resolves once
    /// the unit has settled.
    pub fn evaluate(&self, code: &str) -> impl Future<Output = Result<ExecutionOutput, EvalError>> {
        let (reply, receiver) = oneshot::channel();
        let enqueued = self
            .inner
            .jobs
            .send(EvalJob {
                code: code.to_string(),
                reply,
            })
            .is_ok();
        async move {
            if !enqueued {
                return Err(EvalError::Disposed);
            }
            receiver.await.unwrap_or(Err(EvalError::Disposed))
        }
    }

    /// Kills this context's bound worker. An in-flight evaluation settles
    /// promptly with [`EvalError::Interrupted`]; the next request respawns.
    pub fn interrupt(&self) {
        self.inner.interrupt.send_modify(|generation| *generation += 1);
    }
}

pub struct ContextRouter {
    pool: Arc<WorkerPool>,
    state: Mutex<RouterState>,
}

struct RouterState {
    contexts: HashMap<String, ContextEntry>,
    disposed: bool,
}

struct ContextEntry {
    handle: ContextHandle,
    task: JoinHandle<()>,
}

impl ContextRouter {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(RouterState {
                contexts: HashMap::new(),
                disposed: false,
            }),
        }
    }

    /// Returns the context's handle, creating its serial queue on first use.
    pub fn get_or_create(&self, context_id: &str) -> Result<ContextHandle, EvalError> {
        let mut state = lock_or_recover(&self.state);
        if state.disposed {
            return Err(EvalError::Disposed);
        }
        if let Some(entry) = state.contexts.get(context_id) {
            return Ok(entry.handle.clone());
        }

        let (jobs, job_queue) = mpsc::unbounded_channel();
        let (interrupt, interrupt_queue) = watch::channel(0u64);
        let task = tokio::spawn(context_loop(
            context_id.to_string(),
            self.pool.clone(),
            job_queue,
            interrupt_queue,
        ));
        let handle = ContextHandle {
            inner: Arc::new(HandleInner {
                context_id: context_id.to_string(),
                jobs,
                interrupt,
            }),
        };
        tracing::debug!(context_id, "created execution context");
        state.contexts.insert(
            context_id.to_string(),
            ContextEntry {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    /// Interrupts the named context. Returns false if it does not exist.
    pub fn interrupt(&self, context_id: &str) -> bool {
        let state = lock_or_recover(&self.state);
        match state.contexts.get(context_id) {
            Some(entry) => {
                entry.handle.interrupt();
                true
            }
            None => false,
        }
    }

    pub fn context_count(&self) -> usize {
        lock_or_recover(&self.state).contexts.len()
    }

    /// Tears down every context queue. Queued jobs settle with
    /// [`EvalError::Disposed`]; bound workers are killed. Idempotent.
    pub async fn dispose(&self) {
        let entries: Vec<ContextEntry> = {
            let mut state = lock_or_recover(&self.state);
            state.disposed = true;
            state.contexts.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            // Aborting drops the queue and its worker; kill_on_drop reaps
            // the subprocess. Pending replies resolve as Disposed.
            entry.task.abort();
            let _ = entry.task.await;
        }
    }
}

/// Drains one context's job queue, one evaluation at a time. Owns the
/// context's worker; replaces it via the pool when it is found dead.
async fn context_loop(
    context_id: String,
    pool: Arc<WorkerPool>,
    mut jobs: mpsc::UnboundedReceiver<EvalJob>,
    mut interrupt: watch::Receiver<u64>,
) {
    let mut worker: Option<Worker> = None;
    let mut interrupt_open = true;
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            changed = interrupt.changed(), if interrupt_open => {
                if changed.is_err() {
                    // All handles are gone; drain the remaining queue.
                    interrupt_open = false;
                    continue;
                }
                if let Some(bound) = worker.take() {
                    tracing::info!(context_id = %context_id, "interrupt: killing idle context worker");
                    pool.discard(bound).await;
                }
                continue;
            }
        };

        // An interrupt that raced ahead of this job still kills the worker
        // it was aimed at; the job itself runs on a fresh one.
        if interrupt.has_changed().unwrap_or(false) {
            interrupt.borrow_and_update();
            if let Some(bound) = worker.take() {
                pool.discard(bound).await;
            }
        }

        if let Some(bound) = worker.as_mut() {
            if bound.has_exited() {
                tracing::info!(
                    context_id = %context_id,
                    exit_code = bound.exit_code(),
                    "context worker exited, replacing"
                );
                if let Some(stale) = worker.take() {
                    pool.discard(stale).await;
                }
            }
        }
        if worker.is_none() {
            match pool.acquire().await {
                Ok(mut fresh) => {
                    fresh.bind_interrupt(interrupt.clone());
                    worker = Some(fresh);
                }
                Err(error) => {
                    let _ = job.reply.send(Err(error));
                    continue;
                }
            }
        }
        let Some(bound) = worker.as_mut() else {
            continue;
        };

        let result = bound.evaluate(&job.code).await;
        if bound.state() == WorkerState::Dead {
            if let Some(dead) = worker.take() {
                pool.discard(dead).await;
            }
        }
        let _ = job.reply.send(result);
    }

    if let Some(bound) = worker.take() {
        pool.release(bound).await;
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

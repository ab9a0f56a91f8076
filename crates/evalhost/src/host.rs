//! Host-facing facade tying the pool, router, and shutdown registry
//! together. This is the surface the embedding layer (editor, CLI) consumes.

use std::sync::Arc;

use crate::config::HostConfig;
use crate::error::{EvalError, ExecutionOutput};
use crate::pool::WorkerPool;
use crate::router::{ContextHandle, ContextRouter};
use crate::shutdown;

pub struct EvalHost {
    pool: Arc<WorkerPool>,
    router: ContextRouter,
}

impl EvalHost {
    /// Builds the host and installs the process-wide shutdown hook. Must be
    /// called from within a tokio runtime.
    pub fn new(config: HostConfig) -> Self {
        shutdown::install_signal_hook();
        let config = Arc::new(config);
        let pool = Arc::new(WorkerPool::new(config));
        let router = ContextRouter::new(pool.clone());
        Self { pool, router }
    }

    /// Returns the handle for `context_id`, creating its dedicated worker
    /// lane on first use.
    pub fn acquire_or_create(&self, context_id: &str) -> Result<ContextHandle, EvalError> {
        self.router.get_or_create(context_id)
    }

    /// Evaluates one unit through the given context handle.
    pub async fn evaluate(
        &self,
        handle: &ContextHandle,
        code: &str,
    ) -> Result<ExecutionOutput, EvalError> {
        handle.evaluate(code).await
    }

    /// Convenience for `acquire_or_create` followed by `evaluate`.
    pub async fn evaluate_in(
        &self,
        context_id: &str,
        code: &str,
    ) -> Result<ExecutionOutput, EvalError> {
        let handle = self.acquire_or_create(context_id)?;
        handle.evaluate(code).await
    }

    /// Kills the named context's worker; its in-flight evaluation settles
    /// with [`EvalError::Interrupted`]. Returns false for unknown contexts.
    pub fn interrupt(&self, context_id: &str) -> bool {
        self.router.interrupt(context_id)
    }

    /// Direct access to the worker pool, for non-session-sticky callers.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Tears down every context and the pool. Idempotent.
    pub async fn dispose_all(&self) {
        self.router.dispose().await;
        self.pool.dispose().await;
    }
}

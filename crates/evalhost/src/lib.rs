//! Orchestration core for long-lived, stateful interpreter subprocesses.
//!
//! The host speaks a byte-oriented stdio protocol with each worker: the
//! subprocess announces readiness with a reserved control byte, and every
//! evaluation unit and response is delimited by an end-of-message sentinel.
//! On top of one [`worker::Worker`] per subprocess sit a bounded
//! [`pool::WorkerPool`] with FIFO waiters, a [`router::ContextRouter`] that
//! pins one worker per execution context so interpreter session state
//! survives across requests, and a per-context serial queue that executes
//! concurrent submissions strictly in order.

pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod pool;
pub mod router;
pub mod shutdown;
pub mod worker;

pub use config::{HostConfig, HostLimits, ProcessConfig, Sentinels};
pub use error::{EvalError, ExecutionOutput};
pub use host::EvalHost;
pub use pool::WorkerPool;
pub use router::ContextHandle;
pub use worker::{Worker, WorkerState};

//! Process-wide registry of live worker subprocesses.
//!
//! Every spawned worker registers its pid here and unregisters on
//! termination. One signal hook, installed at most once per process, kills
//! every registered worker when the host process is shut down, so no
//! orphaned interpreters survive the host.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, OnceLock};

static LIVE_WORKERS: OnceLock<Mutex<BTreeSet<u32>>> = OnceLock::new();
static SIGNAL_HOOK: OnceLock<()> = OnceLock::new();

fn live_workers() -> &'static Mutex<BTreeSet<u32>> {
    LIVE_WORKERS.get_or_init(|| Mutex::new(BTreeSet::new()))
}

pub(crate) fn register_worker(pid: u32) {
    lock_or_recover(live_workers()).insert(pid);
}

pub(crate) fn unregister_worker(pid: u32) {
    lock_or_recover(live_workers()).remove(&pid);
}

/// Number of worker subprocesses currently believed alive.
pub fn tracked_worker_count() -> usize {
    lock_or_recover(live_workers()).len()
}

#[cfg(test)]
pub(crate) fn is_worker_tracked(pid: u32) -> bool {
    lock_or_recover(live_workers()).contains(&pid)
}

/// Kills every registered worker subprocess exactly once.
pub(crate) fn kill_all_registered() {
    let pids: Vec<u32> = {
        let mut live = lock_or_recover(live_workers());
        std::mem::take(&mut *live).into_iter().collect()
    };
    for pid in pids {
        tracing::warn!(pid, "killing interpreter worker during shutdown");
        #[cfg(unix)]
        // SAFETY: plain kill(2) on a pid this process spawned and tracks.
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pid;
    }
}

/// Installs the once-per-process shutdown hook. On SIGINT/SIGTERM it kills
/// every registered worker, then exits with the conventional signal status.
/// Must be called from within a tokio runtime. Safe to call repeatedly.
pub fn install_signal_hook() {
    #[cfg(unix)]
    SIGNAL_HOOK.get_or_init(|| {
        tokio::spawn(async {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
                return;
            };
            let Ok(mut terminate) = signal(SignalKind::terminate()) else {
                return;
            };
            let signo = tokio::select! {
                _ = interrupt.recv() => libc::SIGINT,
                _ = terminate.recv() => libc::SIGTERM,
            };
            tracing::warn!(
                workers = tracked_worker_count(),
                signo,
                "shutdown signal received, killing live interpreter workers"
            );
            kill_all_registered();
            std::process::exit(128 + signo);
        });
    });
    #[cfg(not(unix))]
    {
        // Non-unix teardown relies on kill_on_drop for each child.
        SIGNAL_HOOK.get_or_init(|| ());
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

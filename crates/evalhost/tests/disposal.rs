//! Disposal must leave nothing behind: no routable contexts, no pooled
//! workers, and no pids lingering in the shutdown registry.
//!
//! Kept as a single test in its own binary because it asserts on the
//! process-wide registry count.

mod common;

use evalhost::{shutdown, EvalHost};

use common::stub_config;

#[tokio::test]
async fn dispose_all_unregisters_every_context_worker() {
    let host = EvalHost::new(stub_config());
    host.evaluate_in("left", "x = 1").await.expect("first context worker");
    host.evaluate_in("right", "y = 2").await.expect("second context worker");
    assert_eq!(shutdown::tracked_worker_count(), 2);

    host.dispose_all().await;
    assert_eq!(
        shutdown::tracked_worker_count(),
        0,
        "disposed workers must be unregistered from the shutdown registry"
    );
}

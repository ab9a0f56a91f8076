//! End-to-end coverage of the host facade: context-to-worker affinity,
//! per-context submission ordering, interruption, and disposal.

mod common;

use std::time::{Duration, Instant};

use evalhost::{EvalError, EvalHost};

use common::stub_config;

#[tokio::test]
async fn context_state_persists_across_requests() {
    let host = EvalHost::new(stub_config());

    host.evaluate_in("notebook", "a = 1").await.expect("assignment");
    let output = host.evaluate_in("notebook", "p a").await.expect("lookup");
    assert_eq!(output.stdout, "1");

    host.dispose_all().await;
}

#[tokio::test]
async fn distinct_contexts_do_not_share_interpreter_state() {
    let host = EvalHost::new(stub_config());

    host.evaluate_in("left", "secret = 5").await.expect("assignment");
    let output = host.evaluate_in("right", "p secret").await.expect("response");
    assert_eq!(output.stdout, "");
    assert!(output.stderr.contains("unknown variable"));

    host.dispose_all().await;
}

#[tokio::test]
async fn concurrent_submissions_to_one_context_run_in_submission_order() {
    let host = EvalHost::new(stub_config());
    let handle = host.acquire_or_create("ordered").expect("handle");

    // The queue position is taken synchronously when evaluate is called, so
    // building the futures in order fixes the execution order even though
    // none has been polled yet.
    handle.evaluate("n = 0").await.expect("seed");
    let pending: Vec<_> = (0..8).map(|_| handle.evaluate("n = n + 1\np n")).collect();
    for (index, future) in pending.into_iter().enumerate() {
        let output = future.await.expect("ordered evaluation");
        assert_eq!(output.stdout, (index + 1).to_string());
    }

    host.dispose_all().await;
}

#[tokio::test]
async fn distinct_contexts_evaluate_in_parallel() {
    let host = EvalHost::new(stub_config());
    // Pin each context to its worker up front.
    host.evaluate_in("parallel-a", "p 0").await.expect("warm a");
    host.evaluate_in("parallel-b", "p 0").await.expect("warm b");

    let started = Instant::now();
    let (a, b) = tokio::join!(
        host.evaluate_in("parallel-a", "sleep 400\np 1"),
        host.evaluate_in("parallel-b", "sleep 400\np 2"),
    );
    assert_eq!(a.expect("context a").stdout, "1");
    assert_eq!(b.expect("context b").stdout, "2");
    assert!(
        started.elapsed() < Duration::from_millis(750),
        "contexts ran serially: {:?}",
        started.elapsed()
    );

    host.dispose_all().await;
}

#[tokio::test]
async fn interrupt_settles_the_inflight_evaluation_and_respawns() {
    let host = EvalHost::new(stub_config());
    let handle = host.acquire_or_create("busy").expect("handle");
    handle.evaluate("a = 3").await.expect("seed state");

    let inflight = tokio::spawn(handle.evaluate("sleep 30000"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(host.interrupt("busy"));

    let result = inflight.await.expect("inflight task");
    assert!(matches!(result, Err(EvalError::Interrupted { .. })));

    // The next request runs on a fresh worker; the session is gone.
    let output = handle.evaluate("p a").await.expect("fresh worker");
    assert_eq!(output.stdout, "");
    assert!(output.stderr.contains("unknown variable"));

    host.dispose_all().await;
}

#[tokio::test]
async fn interrupting_an_unknown_context_reports_false() {
    let host = EvalHost::new(stub_config());
    assert!(!host.interrupt("never-created"));
    host.dispose_all().await;
}

#[tokio::test]
async fn a_dead_context_worker_is_replaced_on_the_next_request() {
    let host = EvalHost::new(stub_config());

    host.evaluate_in("crashy", "a = 9").await.expect("seed state");
    let error = host.evaluate_in("crashy", "die 4").await.expect_err("worker must die");
    let EvalError::ProcessExit { partial } = error else {
        panic!("expected ProcessExit, got {error:?}");
    };
    assert_eq!(partial.exit_code, Some(4));

    // Same context, fresh interpreter.
    let output = host.evaluate_in("crashy", "p a").await.expect("replacement worker");
    assert_eq!(output.stdout, "");
    assert!(output.stderr.contains("unknown variable"));

    host.dispose_all().await;
}

#[tokio::test]
async fn dispose_rejects_later_requests_and_is_idempotent() {
    let host = EvalHost::new(stub_config());
    host.evaluate_in("short-lived", "p 1").await.expect("one evaluation");

    host.dispose_all().await;
    host.dispose_all().await;

    let error = host
        .evaluate_in("short-lived", "p 2")
        .await
        .expect_err("host is disposed");
    assert!(matches!(error, EvalError::Disposed));
}

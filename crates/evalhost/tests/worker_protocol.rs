//! Wire-protocol and lifecycle coverage for a single worker driving the
//! stub interpreter.

mod common;

use std::sync::Arc;
use std::time::Duration;

use evalhost::{EvalError, HostConfig, Sentinels, Worker, WorkerState};

use common::{stub_config, stub_process};

#[tokio::test]
async fn evaluate_returns_the_trimmed_framed_response() {
    let mut worker = Worker::spawn(Arc::new(stub_config())).await.expect("ready worker");
    assert_eq!(worker.state(), WorkerState::Ready);

    let output = worker.evaluate("p 1 + 1").await.expect("response");
    assert_eq!(output.stdout, "2");
    assert_eq!(output.stderr, "");
    assert_eq!(output.exit_code, None);
    assert_eq!(worker.state(), WorkerState::Ready);

    worker.terminate().await;
}

#[tokio::test]
async fn interpreter_session_state_survives_across_evaluations() {
    let mut worker = Worker::spawn(Arc::new(stub_config())).await.expect("ready worker");

    worker.evaluate("a = 40").await.expect("assignment");
    let output = worker.evaluate("p a + 2").await.expect("lookup");
    assert_eq!(output.stdout, "42");

    worker.terminate().await;
}

#[tokio::test]
async fn stderr_is_captured_separately_from_the_response_frame() {
    let mut worker = Worker::spawn(Arc::new(stub_config())).await.expect("ready worker");

    let output = worker.evaluate("warn something odd\np 4").await.expect("response");
    assert_eq!(output.stdout, "4");
    assert!(output.stderr.contains("something odd"));

    worker.terminate().await;
}

#[tokio::test]
async fn silent_boot_times_out() {
    let mut config = stub_config();
    config.process = stub_process().with_args(["--no-ready"]);
    config.limits.initialization_timeout = Duration::from_millis(300);

    let error = Worker::spawn(Arc::new(config)).await.expect_err("handshake must time out");
    assert!(matches!(error, EvalError::InitializationTimeout { timeout_ms: 300 }));
}

#[tokio::test]
async fn nonzero_exit_during_evaluation_is_a_process_exit() {
    let mut worker = Worker::spawn(Arc::new(stub_config())).await.expect("ready worker");

    let error = worker.evaluate("die 3").await.expect_err("worker must die");
    let EvalError::ProcessExit { partial } = error else {
        panic!("expected ProcessExit, got {error:?}");
    };
    assert_eq!(partial.exit_code, Some(3));
    assert_eq!(worker.state(), WorkerState::Dead);
}

#[tokio::test]
async fn clean_exit_without_output_is_reported_distinctly() {
    let mut worker = Worker::spawn(Arc::new(stub_config())).await.expect("ready worker");

    let error = worker.evaluate("quit").await.expect_err("worker must quit");
    let EvalError::CleanExitNoOutput { partial } = error else {
        panic!("expected CleanExitNoOutput, got {error:?}");
    };
    assert_eq!(partial.exit_code, Some(0));
    assert_eq!(partial.stdout, "");
    assert_eq!(worker.state(), WorkerState::Dead);
}

#[tokio::test]
async fn overrunning_evaluation_times_out_and_kills_the_worker() {
    let mut config = stub_config();
    config.limits.execution_timeout = Duration::from_millis(200);
    let mut worker = Worker::spawn(Arc::new(config)).await.expect("ready worker");

    let error = worker.evaluate("sleep 5000").await.expect_err("evaluation must time out");
    assert!(matches!(error, EvalError::ExecutionTimeout { timeout_ms: 200, .. }));
    assert_eq!(worker.state(), WorkerState::Dead);
}

#[tokio::test]
async fn end_of_transmission_flavor_frames_responses() {
    let mut config = stub_config();
    config.process = stub_process().with_args(["--sentinel-eot"]);
    config.sentinels = Sentinels::END_OF_TRANSMISSION;
    let mut worker = Worker::spawn(Arc::new(config)).await.expect("ready worker");

    let output = worker.evaluate("p 2 + 2").await.expect("response");
    assert_eq!(output.stdout, "4");

    worker.terminate().await;
}

#[tokio::test]
async fn working_directory_is_applied_to_the_subprocess() {
    let dir = tempfile::tempdir().expect("tempdir");
    let canonical = dir.path().canonicalize().expect("canonical tempdir path");
    let mut config = stub_config();
    config.process = stub_process().with_working_directory(dir.path());
    let mut worker = Worker::spawn(Arc::new(config)).await.expect("ready worker");

    let output = worker.evaluate("cwd").await.expect("response");
    assert_eq!(
        std::path::Path::new(&output.stdout)
            .canonicalize()
            .expect("canonical reported path"),
        canonical
    );

    worker.terminate().await;
}

#[tokio::test]
async fn configured_environment_is_forwarded_to_the_subprocess() {
    let mut config = stub_config();
    config.process = stub_process().with_env("EVALHOST_TEST_TOKEN", "sesame");
    let mut worker = Worker::spawn(Arc::new(config)).await.expect("ready worker");

    let output = worker.evaluate("env EVALHOST_TEST_TOKEN").await.expect("response");
    assert_eq!(output.stdout, "sesame");

    worker.terminate().await;
}

#[cfg(unix)]
#[tokio::test]
async fn evaluating_against_a_vanished_subprocess_fails() {
    let mut worker = Worker::spawn(Arc::new(stub_config())).await.expect("ready worker");
    let pid = worker.pid().expect("live pid");
    // Kill the subprocess behind the worker's back.
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let error = worker.evaluate("p 1").await.expect_err("evaluation must fail");
    assert!(matches!(
        error,
        EvalError::StdinWriteFailure { .. } | EvalError::ProcessExit { .. }
    ));
    assert_eq!(worker.state(), WorkerState::Dead);
}

#[tokio::test]
async fn spawn_fails_with_the_command_in_the_error() {
    let config = HostConfig::new(evalhost::ProcessConfig::new("/nonexistent/guest-interp"));
    let error = Worker::spawn(Arc::new(config)).await.expect_err("spawn must fail");
    let EvalError::ProcessSpawnError { command, .. } = error else {
        panic!("expected ProcessSpawnError, got {error:?}");
    };
    assert_eq!(command, "/nonexistent/guest-interp");
}

//! Task polling on a paused clock. No database is involved here, so tokio's
//! auto-advancing test clock drives every sleep and deadline.

mod common;

use catalog_orchestrator::gateway::TaskStatus;
use catalog_orchestrator::{RemoteTask, TaskOutcome, TaskPolicy, TaskTracker};
use common::{ctx, StubGateway};
use std::time::Duration;

fn task(task_id: &str, policy: TaskPolicy) -> RemoteTask {
    RemoteTask {
        task_id: task_id.to_string(),
        instance_id: 1,
        policy,
    }
}

#[tokio::test(start_paused = true)]
async fn test_success_after_polls() {
    let gateway = StubGateway::new();
    gateway.script_task(
        "t1",
        vec![TaskStatus::running(), TaskStatus::running(), TaskStatus::success()],
    );
    let tracker = TaskTracker::new(gateway.clone());

    let started = tokio::time::Instant::now();
    let outcome = tracker
        .wait(&ctx(), &task("t1", TaskPolicy::from_secs(4, 600)))
        .await;

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(gateway.poll_count("t1"), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn test_failure_carries_remote_message() {
    let gateway = StubGateway::new();
    gateway.script_task("t1", vec![TaskStatus::failed("disk full")]);
    let tracker = TaskTracker::new(gateway.clone());

    let outcome = tracker
        .wait(&ctx(), &task("t1", TaskPolicy::from_secs(2, 180)))
        .await;

    assert_eq!(outcome, TaskOutcome::Failed("disk full".to_string()));
    assert_eq!(gateway.poll_count("t1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_after_max_wait() {
    let gateway = StubGateway::new();
    gateway.script_task("t1", vec![TaskStatus::running()]);
    let tracker = TaskTracker::new(gateway.clone());

    let outcome = tracker
        .wait(&ctx(), &task("t1", TaskPolicy::from_secs(4, 600)))
        .await;

    match outcome {
        TaskOutcome::Timeout { waited } => assert!(waited >= Duration::from_secs(600)),
        other => panic!("expected timeout, got {other:?}"),
    }
    // Polls at 0, 4, ..., 596 seconds and possibly once more at the deadline.
    let polls = gateway.poll_count("t1");
    assert!((150..=151).contains(&polls), "polled {polls} times");
}

#[tokio::test(start_paused = true)]
async fn test_timeout_maps_to_error() {
    let outcome = TaskOutcome::Timeout {
        waited: Duration::from_secs(600),
    };
    let err = outcome.into_result("t9").unwrap_err();

    assert!(err.to_string().contains("t9"));
    assert!(TaskOutcome::Success.into_result("t9").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_the_wait_stops_polling() {
    let gateway = StubGateway::new();
    gateway.script_task("t1", vec![TaskStatus::running()]);
    let tracker = TaskTracker::new(gateway.clone());
    let long = task("t1", TaskPolicy::from_secs(1, 3600));

    let abandoned = tokio::time::timeout(Duration::from_secs(10), tracker.wait(&ctx(), &long)).await;
    assert!(abandoned.is_err());

    let polls = gateway.poll_count("t1");
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(gateway.poll_count("t1"), polls);
}

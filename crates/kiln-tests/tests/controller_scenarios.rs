//! End-to-end worker runs against a scripted coordinator
//!
//! Time is paused in every async test so lease and heartbeat periods of
//! several minutes run instantly.

use kiln_core::config::HeartbeatConfig;
use kiln_core::{Error, FrameId, WorkerId};
use kiln_tests::common::{self, grant, receipt, Call, ScriptedCoordinator, ScriptedEngine};
use kiln_worker::{ControllerSettings, RetryPolicy, RunSummary, WorkerController};
use std::sync::Arc;
use std::time::Duration;

fn controller(
    coordinator: &ScriptedCoordinator,
    engine: &ScriptedEngine,
    settings: ControllerSettings,
) -> WorkerController {
    common::init();
    WorkerController::new(
        Arc::new(coordinator.clone()),
        Box::new(engine.clone()),
        settings,
    )
}

fn frames(ids: &[u64]) -> Vec<FrameId> {
    ids.iter().copied().map(FrameId).collect()
}

fn register_calls(coordinator: &ScriptedCoordinator) -> usize {
    coordinator
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Register(_)))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_granted_frame_is_rendered_next() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Ok(receipt("w1", &[6])))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::new();

    let summary = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap();

    assert_eq!(engine.executed(), frames(&[5, 6]));
    assert_eq!(coordinator.submitted_frames(), frames(&[5, 6]));
    assert_eq!(coordinator.calls()[0], Call::Register(1));
    assert_eq!(summary.worker_id, Some(WorkerId::from("w1")));
    assert!(summary.registered_at.is_some());
    assert_eq!(summary.frames_rendered, 2);
    assert_eq!(summary.frames_submitted, 2);
}

#[tokio::test(start_paused = true)]
async fn test_mismatched_worker_id_is_fatal() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Ok(receipt("w2", &[6])));
    let engine = ScriptedEngine::new();

    let err = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap_err();

    match err {
        Error::WorkerIdMismatch { expected, actual } => {
            assert_eq!(expected.as_str(), "w1");
            assert_eq!(actual.as_str(), "w2");
        }
        other => panic!("expected a worker id mismatch, got {other:?}"),
    }
    // Frame 6 was never queued, so it was never rendered
    assert_eq!(engine.executed(), frames(&[5]));
    assert_eq!(coordinator.submitted_frames(), frames(&[5]));
}

#[tokio::test(start_paused = true)]
async fn test_failed_heartbeat_is_retried_on_next_tick() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 900, &[5]))))
        .on_heartbeat(Err(Error::Connection("connection refused".into())))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::with_render_time(Duration::from_secs(700));

    let settings = ControllerSettings {
        heartbeat: HeartbeatConfig {
            interval_secs: Some(300),
            ..Default::default()
        },
        ..Default::default()
    };

    let summary = controller(&coordinator, &engine, settings)
        .run()
        .await
        .unwrap();

    let beats = coordinator.heartbeat_times();
    assert_eq!(beats.len(), 2);
    let gap = beats[1] - beats[0];
    assert!(gap >= Duration::from_secs(300) && gap < Duration::from_secs(301));
    assert_eq!(summary.heartbeats_failed, 1);
    assert_eq!(summary.heartbeats_sent, 1);
    assert_eq!(summary.frames_submitted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_grant_ends_run_cleanly() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::new();

    let summary = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap();

    assert_eq!(engine.executed(), frames(&[5]));
    assert_eq!(summary.frames_submitted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_grant_still_drains_queued_frames() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5, 7]))))
        .on_submit(Ok(receipt("w1", &[])))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::new();

    controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap();

    // Most recently granted first
    assert_eq!(engine.executed(), frames(&[7, 5]));
}

#[tokio::test(start_paused = true)]
async fn test_worker_id_is_attached_to_every_call() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("node-17", 60, &[1]))))
        .on_submit(Ok(receipt("node-17", &[2])))
        .on_submit(Ok(receipt("node-17", &[3])))
        .on_submit(Ok(receipt("node-17", &[])));
    let engine = ScriptedEngine::with_render_time(Duration::from_secs(45));

    let summary = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap();

    assert!(summary.heartbeats_sent > 0);
    for call in coordinator.calls() {
        match call {
            Call::Heartbeat(worker_id) | Call::Submit { worker_id, .. } => {
                assert_eq!(worker_id.as_str(), "node-17");
            }
            Call::Register(_) | Call::FetchProject => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_stops_when_run_completes() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 60, &[5]))))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::with_render_time(Duration::from_secs(50));

    let summary = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap();

    let beats_at_exit = coordinator.heartbeat_times().len();
    assert!(beats_at_exit > 0);
    assert_eq!(summary.heartbeats_sent, beats_at_exit as u64);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(coordinator.heartbeat_times().len(), beats_at_exit);
}

#[tokio::test(start_paused = true)]
async fn test_no_work_at_registration() {
    let coordinator = ScriptedCoordinator::new().on_register(Ok(None));
    let engine = ScriptedEngine::new();

    let summary = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap();

    assert_eq!(summary, RunSummary::default());
    assert_eq!(coordinator.calls(), vec![Call::Register(1)]);
    assert!(engine.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_lease_is_rejected() {
    let coordinator = ScriptedCoordinator::new().on_register(Ok(Some(grant("w1", 0, &[5]))));
    let engine = ScriptedEngine::new();

    let err = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap_err();

    assert!(err.is_protocol_violation());
    assert!(engine.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_period_must_be_shorter_than_lease() {
    let coordinator = ScriptedCoordinator::new().on_register(Ok(Some(grant("w1", 300, &[5]))));
    let engine = ScriptedEngine::new();

    let settings = ControllerSettings {
        heartbeat: HeartbeatConfig {
            interval_secs: Some(300),
            ..Default::default()
        },
        ..Default::default()
    };

    let err = controller(&coordinator, &engine, settings)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert!(engine.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_heartbeat_fraction_fails_cleanly() {
    let coordinator = ScriptedCoordinator::new().on_register(Ok(Some(grant("w1", 300, &[5]))));
    let engine = ScriptedEngine::new();

    let settings = ControllerSettings {
        heartbeat: HeartbeatConfig {
            fraction: -0.5,
            interval_secs: None,
        },
        ..Default::default()
    };

    let err = controller(&coordinator, &engine, settings)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert!(engine.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_registration_retries_transient_failures() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Err(Error::Connection("connection refused".into())))
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::new();

    let settings = ControllerSettings {
        register_retry: RetryPolicy::new(
            3,
            Duration::from_millis(500),
            Duration::from_secs(5),
        ),
        ..Default::default()
    };

    controller(&coordinator, &engine, settings)
        .run()
        .await
        .unwrap();

    assert_eq!(register_calls(&coordinator), 2);
    assert_eq!(engine.executed(), frames(&[5]));
}

#[tokio::test(start_paused = true)]
async fn test_registration_rejection_is_not_retried() {
    let coordinator = ScriptedCoordinator::new().on_register(Err(Error::Status {
        operation: "register",
        status: 401,
        body: "unauthorized".into(),
    }));
    let engine = ScriptedEngine::new();

    let settings = ControllerSettings {
        register_retry: RetryPolicy::new(
            3,
            Duration::from_millis(500),
            Duration::from_secs(5),
        ),
        ..Default::default()
    };

    let err = controller(&coordinator, &engine, settings)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Status { status: 401, .. }));
    assert_eq!(register_calls(&coordinator), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execution_failure_is_fatal() {
    let coordinator = ScriptedCoordinator::new().on_register(Ok(Some(grant("w1", 300, &[5]))));
    let engine = ScriptedEngine::failing_on(5);

    let err = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Execution { frame_id: FrameId(5), .. }));
    assert!(coordinator.submitted_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_submission_failure_is_fatal_without_retry() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Err(Error::Timeout("upload timed out".into())));
    let engine = ScriptedEngine::new();

    let err = controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(coordinator.submitted_frames(), frames(&[5]));
}

#[tokio::test(start_paused = true)]
async fn test_submission_retry_reuses_idempotency_key() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Err(Error::Timeout("upload timed out".into())))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::new();

    let settings = ControllerSettings {
        submit_retry: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(1)),
        ..Default::default()
    };

    controller(&coordinator, &engine, settings)
        .run()
        .await
        .unwrap();

    let keys: Vec<_> = coordinator
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Submit {
                idempotency_key, ..
            } => Some(idempotency_key),
            _ => None,
        })
        .collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], keys[1]);
}

#[tokio::test(start_paused = true)]
async fn test_artifacts_released_after_acknowledgment() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Ok(receipt("w1", &[6])))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::new();

    controller(&coordinator, &engine, ControllerSettings::default())
        .run()
        .await
        .unwrap();

    let artifacts = engine.artifacts();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().all(|path| !path.exists()));
}

#[tokio::test(start_paused = true)]
async fn test_artifacts_kept_on_request() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::new();

    let settings = ControllerSettings {
        keep_artifacts: true,
        ..Default::default()
    };

    controller(&coordinator, &engine, settings)
        .run()
        .await
        .unwrap();

    assert!(engine.artifacts().iter().all(|path| path.exists()));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_render() {
    let coordinator = ScriptedCoordinator::new()
        .on_register(Ok(Some(grant("w1", 300, &[5]))))
        .on_submit(Ok(receipt("w1", &[])));
    let engine = ScriptedEngine::with_render_time(Duration::from_secs(200));

    let worker = controller(&coordinator, &engine, ControllerSettings::default());
    let cancel = worker.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(50)).await;
        cancel.cancel();
    });

    let err = worker.run().await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(coordinator.submitted_frames().is_empty());
}

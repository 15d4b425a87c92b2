//! Job lifecycle tests: start failures, cancellation, interactive sessions
//! and saving containers as images.


use std::sync::Arc;
use std::time::Duration;

use gridlet::backend::{BackendCall, BackendOp};
use gridlet::error::GridError;
use gridlet::events::UserEvent;
use gridlet::scheduler::{Job, JobState};
use test_harness::{
    assert_eventually, batch_params, interactive_params, EngineCall, TestGrid,
};

fn kinds(events: &[UserEvent]) -> Vec<&'static str> {
    events.iter().map(UserEvent::kind).collect()
}

/// Submit an interactive session on a single board and wait until its
/// container is reachable.
async fn interactive_job(tg: &mut TestGrid, user_session: &str) -> Arc<Job> {
    tg.add_boards(&["rpi-01"]);
    tg.grid
        .submit_session(interactive_params(1, user_session))
        .await
        .unwrap();
    let job = tg.grid.running_jobs()[0].clone();

    let username = format!("user-{}", user_session);
    let tg = &*tg;
    assert_eventually(
        || async {
            tg.flush().await;
            tg.backend
                .events_for(&username)
                .iter()
                .any(|e| matches!(e, UserEvent::ExecSuccess { .. }))
        },
        Duration::from_secs(2),
        "interactive container should come up",
    )
    .await;
    job
}

#[tokio::test]
async fn test_interactive_job_gets_ssh_access() {
    let mut tg = TestGrid::new();
    let job = interactive_job(&mut tg, "shell").await;

    assert_eq!(job.state(), JobState::Running);
    let credentials = job.ssh_credentials().unwrap();
    assert_eq!(credentials.host, "rpi-01");
    assert!((2200..=2203).contains(&credentials.port));
    assert!(credentials.username.starts_with('u'));
    assert_eq!(credentials.username.len(), 8);
    assert_eq!(credentials.password.len(), 16);
    assert_eq!(tg.deps.ssh.port_of(job.id()), Some(credentials.port));

    let events = tg.backend.events_for("user-shell");
    assert_eq!(
        kinds(&events),
        vec!["pull_data", "pull_success", "exec_success"]
    );
    match events.last() {
        Some(UserEvent::ExecSuccess { connection, .. }) => {
            assert_eq!(connection.as_ref(), Some(&credentials));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let spec = tg
        .calls()
        .into_iter()
        .find_map(|(_, call)| match call {
            EngineCall::Create(spec) => Some(spec),
            _ => None,
        })
        .unwrap();
    assert_eq!(spec.name, format!("session-shell.job-{}", job.id()));
    assert_eq!(spec.port_bindings.len(), 1);
    assert_eq!(spec.port_bindings[0].host_port, credentials.port);
    assert_eq!(spec.port_bindings[0].container_port, 22);
    assert_eq!(spec.command[0], "/bin/sh");
    assert!(spec.binds.contains(&"workspace-user-shell:/workspace".to_string()));
    assert!(spec.binds.contains(&"public:/public:ro".to_string()));

    // Interactive jobs never exec a command.
    assert!(!tg
        .calls()
        .iter()
        .any(|(_, call)| matches!(call, EngineCall::Exec(..))));
}

#[tokio::test]
async fn test_cancel_releases_resources_once() {
    let mut tg = TestGrid::new();
    let job = interactive_job(&mut tg, "twice").await;
    let container = job.container_id().unwrap();
    assert_eq!(tg.deps.ssh.reserved_count(), 1);

    let (first, second) = tokio::join!(job.cancel(), job.cancel());
    assert!(first ^ second, "exactly one cancel should win");
    assert!(!job.cancel().await);
    assert!(!job.complete().await);

    assert_eq!(job.state(), JobState::Canceled);
    assert!(!tg.grid.boards()[0].is_used());
    assert_eq!(tg.deps.ssh.reserved_count(), 0);
    assert!(job.container_id().is_none());

    let stops = tg
        .calls()
        .into_iter()
        .filter(|(_, call)| *call == EngineCall::Stop(container.clone()))
        .count();
    assert_eq!(stops, 1);

    tg.next_completion().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tg.completions.try_recv().is_err(), "only one completion");
    assert!(tg.grid.running_jobs().is_empty());
}

#[tokio::test]
async fn test_pull_failure_cancels_job() {
    let mut tg = TestGrid::new();
    tg.add_boards(&["b1"]);
    tg.engine("b1").fail_pull(true);

    tg.grid
        .submit_session(batch_params(1, "broken", 1, 1))
        .await
        .unwrap();
    let job = tg.next_completion().await;

    assert_eq!(job.state(), JobState::Canceled);
    assert!(!tg.grid.boards()[0].is_used());
    assert!(!tg
        .calls()
        .iter()
        .any(|(_, call)| matches!(call, EngineCall::Create(_))));

    tg.flush().await;
    let events = tg.backend.events_for("user-broken");
    assert_eq!(kinds(&events), vec!["start_error"]);
    assert!(tg.backend.calls().contains(&BackendCall::JobUpdate {
        job_id: job.id(),
        state: JobState::Canceled,
    }));
}

#[tokio::test]
async fn test_interactive_start_failure_releases_port() {
    let mut tg = TestGrid::new();
    tg.add_boards(&["b1"]);
    tg.engine("b1").fail_create(true);

    tg.grid
        .submit_session(interactive_params(1, "nospace"))
        .await
        .unwrap();
    let job = tg.next_completion().await;

    assert_eq!(job.state(), JobState::Canceled);
    assert_eq!(tg.deps.ssh.reserved_count(), 0);
    assert!(job.ssh_credentials().is_none());

    tg.flush().await;
    let events = tg.backend.events_for("user-nospace");
    assert_eq!(kinds(&events).last(), Some(&"start_error"));
}

#[tokio::test]
async fn test_batch_job_environment() {
    let mut tg = TestGrid::new();
    tg.add_boards(&["b1"]);

    let mut params = batch_params(1, "env", 2, 1);
    params.image.options = "--privileged --device=/dev/gpiomem".to_string();
    tg.grid.submit_session(params).await.unwrap();
    tg.next_completion().await;
    tg.next_completion().await;

    let specs: Vec<_> = tg
        .calls()
        .into_iter()
        .filter_map(|(_, call)| match call {
            EngineCall::Create(spec) => Some(spec),
            _ => None,
        })
        .collect();
    assert_eq!(specs.len(), 2);
    assert!(specs[0].env.contains(&"DATASET_CHUNK=0".to_string()));
    assert!(specs[1].env.contains(&"DATASET_CHUNK=1".to_string()));
    assert!(specs.iter().all(|s| s.privileged && s.auto_remove));
    assert!(specs
        .iter()
        .all(|s| s.devices == vec!["/dev/gpiomem".to_string()]));

    let execs: Vec<Vec<String>> = tg
        .calls()
        .into_iter()
        .filter_map(|(_, call)| match call {
            EngineCall::Exec(_, command) => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(execs.len(), 2);
    assert!(execs.iter().all(|c| c == &["python3", "bench.py"]));
}

#[tokio::test]
async fn test_save_commits_pushes_and_registers() {
    let mut tg = TestGrid::new();
    let job = interactive_job(&mut tg, "saver").await;
    let container = job.container_id().unwrap();
    tg.backend.clear_calls();

    tg.grid.save_session(1, "saver-image").unwrap();
    assert_eventually(
        || async { tg.backend.images().len() == 1 },
        Duration::from_secs(2),
        "image should be registered",
    )
    .await;
    tg.flush().await;

    let image = &tg.backend.images()[0];
    assert_eq!(image.name, "saver-image");
    assert!(tg.backend.calls().contains(&BackendCall::DockerImageCreate {
        platform_id: tg.grid.platform().id,
        name: "saver-image".to_string(),
    }));

    let events = tg.backend.events_for("user-saver");
    assert_eq!(
        kinds(&events),
        vec!["push_data", "push_success", "register_success"]
    );

    let engine_calls: Vec<EngineCall> = tg
        .calls()
        .into_iter()
        .map(|(_, call)| call)
        .filter(|call| matches!(call, EngineCall::Commit(..) | EngineCall::Push(_)))
        .collect();
    assert_eq!(
        engine_calls,
        vec![
            EngineCall::Commit(container, "saver-image".to_string()),
            EngineCall::Push("saver-image".to_string()),
        ]
    );

    // Saving never changes the job.
    assert_eq!(job.state(), JobState::Running);
}

#[tokio::test]
async fn test_push_failure_reports_single_commit_error() {
    let mut tg = TestGrid::new();
    interactive_job(&mut tg, "pushy").await;
    tg.engine("rpi-01").fail_push(true);
    tg.backend.clear_calls();

    tg.grid.save_session(1, "pushy-image").unwrap();
    assert_eventually(
        || async {
            tg.flush().await;
            tg.backend
                .events_for("user-pushy")
                .iter()
                .any(|e| matches!(e, UserEvent::CommitError { .. }))
        },
        Duration::from_secs(2),
        "push failure should be reported",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    tg.flush().await;

    let events = tg.backend.events_for("user-pushy");
    let kinds = kinds(&events);
    assert_eq!(kinds.iter().filter(|k| **k == "commit_error").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "push_error").count(), 1);
    assert!(!kinds.iter().any(|k| k.starts_with("register")));
    assert!(tg.backend.images().is_empty());
}

#[tokio::test]
async fn test_register_failure_reports_single_commit_error() {
    let mut tg = TestGrid::new();
    interactive_job(&mut tg, "lost").await;
    tg.backend.fail(BackendOp::DockerImageCreate);
    tg.backend.clear_calls();

    tg.grid.save_session(1, "lost-image").unwrap();
    assert_eventually(
        || async {
            tg.flush().await;
            tg.backend
                .events_for("user-lost")
                .iter()
                .any(|e| matches!(e, UserEvent::CommitError { .. }))
        },
        Duration::from_secs(2),
        "registration failure should be reported",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    tg.flush().await;

    let events = tg.backend.events_for("user-lost");
    let kinds = kinds(&events);
    assert_eq!(kinds.iter().filter(|k| **k == "commit_error").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "register_error").count(), 1);
    assert!(kinds.contains(&"push_success"));
    assert!(tg.backend.images().is_empty());
}

#[tokio::test]
async fn test_commit_failure_skips_push() {
    let mut tg = TestGrid::new();
    interactive_job(&mut tg, "commity").await;
    tg.engine("rpi-01").fail_commit(true);
    tg.backend.clear_calls();

    tg.grid.save_session(1, "commity-image").unwrap();
    assert_eventually(
        || async {
            tg.flush().await;
            !tg.backend.events_for("user-commity").is_empty()
        },
        Duration::from_secs(2),
        "commit failure should be reported",
    )
    .await;

    assert_eq!(
        kinds(&tg.backend.events_for("user-commity")),
        vec!["commit_error"]
    );
    assert!(!tg
        .calls()
        .iter()
        .any(|(_, call)| matches!(call, EngineCall::Push(_))));
}

#[tokio::test]
async fn test_save_requires_running_container() {
    let mut tg = TestGrid::new();

    assert!(matches!(
        tg.grid.save_session(7, "img"),
        Err(GridError::SessionNotFound(7))
    ));

    // No boards, so the job never starts.
    tg.grid
        .submit_session(interactive_params(1, "idle"))
        .await
        .unwrap();
    assert!(matches!(
        tg.grid.save_session(1, "img"),
        Err(GridError::NoRunningJob { session: 1 })
    ));
}

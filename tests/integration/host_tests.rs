//! Integration tests for the session host lifecycle: create, start, pause,
//! stop, kill, remove and shutdown.

use std::sync::Arc;
use std::time::Duration;

use fenix::platform::Platform;
use fenix::session::task::{GeneralRun, SessionTask, StopTrigger};
use fenix::session::{SessionHost, SessionStatus};
use fenix::AppError;

use crate::support::driver::FakeDriverFactory;
use crate::support::game::{FakePlatform, GameSpec};
use crate::support::{Harness, PASSWORD, THRALL};

fn endless_run() -> Vec<SessionTask> {
    vec![SessionTask::GeneralRun(GeneralRun {
        character: THRALL.into(),
        bot_name: "Grind Bot".into(),
        profile_path: "profiles/grind.xml".into(),
        combat_routine: Some("Custom".into()),
        stop: StopTrigger::BotStopped,
        timeout_seconds: None,
    })]
}

fn setup() -> (Arc<FakePlatform>, Arc<FakeDriverFactory>, Harness) {
    let platform = FakePlatform::new(GameSpec::default());
    let drivers = FakeDriverFactory::new(false);
    let harness = Harness::new(Arc::clone(&platform), Arc::clone(&drivers), PASSWORD);
    (platform, drivers, harness)
}

/// Let the session run until its bot has been started.
async fn until_bot_started(drivers: &FakeDriverFactory) {
    for _ in 0..10_000 {
        if drivers.starts() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("bot never started");
}

#[tokio::test(start_paused = true)]
async fn names_must_be_unique_and_non_empty() {
    let (_, _, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("farm", Vec::new()).unwrap();

    assert!(matches!(host.create("farm", Vec::new()), Err(AppError::InvalidArgument(_))));
    assert!(matches!(host.create("  ", Vec::new()), Err(AppError::InvalidArgument(_))));
    assert_eq!(
        host.start("missing"),
        Err(AppError::NotFound("no session named missing".into()))
    );
    assert!(matches!(host.pause("missing"), Err(AppError::NotFound(_))));
    assert!(matches!(host.wait("missing").await, Err(AppError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_are_listed_and_wait_returns_at_once() {
    let (_, _, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("b-farm", endless_run()).unwrap();
    host.create("a-farm", Vec::new()).unwrap();

    let list = host.list();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].name, "a-farm");
    assert_eq!(list[1].tasks, 1);
    assert!(list.iter().all(|s| s.status == SessionStatus::Idle && s.started_at.is_none()));
    assert_eq!(host.wait("a-farm").await, Ok(SessionStatus::Idle));
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_while_running() {
    let (_, drivers, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("farm", endless_run()).unwrap();

    assert_eq!(host.start("farm"), Ok(true));
    assert_eq!(host.start("farm"), Ok(false));
    until_bot_started(&drivers).await;

    let summary = &host.list()[0];
    assert_eq!(summary.status, SessionStatus::Running);
    assert!(summary.target_pid.is_some());
    assert!(summary.started_at.is_some());
    assert_eq!(drivers.requests()[0].combat_routine.as_deref(), Some("Custom"));
    assert!(matches!(host.remove("farm"), Err(AppError::InvalidArgument(_))));

    host.stop("farm").unwrap();
    assert_eq!(host.wait("farm").await, Ok(SessionStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn stopping_disposes_the_driver_and_frees_the_target() {
    let (platform, drivers, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("farm", endless_run()).unwrap();
    host.start("farm").unwrap();
    until_bot_started(&drivers).await;
    let pid = host.list()[0].target_pid.unwrap();

    host.stop("farm").unwrap();
    assert_eq!(host.wait("farm").await, Ok(SessionStatus::Failed));

    let driver = &drivers.drivers()[0];
    assert_eq!(driver.disposals(), 1);
    assert!(!driver.holds_lease());
    assert_eq!(harness.keys.free_count(), 1);
    assert!(platform.is_alive(pid));
    assert_eq!(harness.pool.free_pids(), vec![pid]);
    assert_eq!(host.list()[0].target_pid, None);

    host.remove("farm").unwrap();
    assert!(host.list().is_empty());
}

#[tokio::test(start_paused = true)]
async fn a_finished_session_can_be_restarted() {
    let (_, drivers, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("farm", endless_run()).unwrap();
    host.start("farm").unwrap();
    until_bot_started(&drivers).await;
    host.stop("farm").unwrap();
    host.wait("farm").await.unwrap();

    assert_eq!(host.start("farm"), Ok(true));
    for _ in 0..10_000 {
        if drivers.starts() > 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(drivers.starts(), 2);
    assert_eq!(drivers.requests().len(), 2);
    host.stop("farm").unwrap();
    assert_eq!(host.wait("farm").await, Ok(SessionStatus::Failed));
    assert!(drivers.drivers().iter().all(|d| d.disposals() == 1));
    assert_eq!(harness.keys.free_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_toggle_the_flag() {
    let (_, _, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("farm", Vec::new()).unwrap();

    host.pause("farm").unwrap();
    assert!(host.list()[0].paused);
    host.resume("farm").unwrap();
    assert!(!host.list()[0].paused);
}

#[tokio::test(start_paused = true)]
async fn paused_session_makes_no_progress() {
    let (platform, drivers, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("farm", endless_run()).unwrap();
    host.pause("farm").unwrap();
    host.start("farm").unwrap();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(platform.launches().is_empty());
    assert_eq!(host.list()[0].status, SessionStatus::Running);

    host.resume("farm").unwrap();
    until_bot_started(&drivers).await;
    host.stop("farm").unwrap();
    host.wait("farm").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn kill_takes_the_target_down() {
    let (platform, drivers, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("farm", endless_run()).unwrap();
    host.start("farm").unwrap();
    until_bot_started(&drivers).await;
    let pid = host.list()[0].target_pid.unwrap();

    host.kill("farm").unwrap();
    assert_eq!(host.wait("farm").await, Ok(SessionStatus::Failed));
    assert!(!platform.is_alive(pid));
    assert!(harness.pool.free_pids().is_empty());
    assert!(!harness.pool.is_allocated(pid));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_sessions_and_kills_launched_targets() {
    let (platform, drivers, harness) = setup();
    let host = SessionHost::new(harness.context());
    host.create("farm", endless_run()).unwrap();
    host.start("farm").unwrap();
    until_bot_started(&drivers).await;
    let pid = host.list()[0].target_pid.unwrap();

    host.shutdown().await;
    assert_eq!(host.list()[0].status, SessionStatus::Failed);
    assert_eq!(drivers.drivers()[0].disposals(), 1);
    assert_eq!(harness.keys.free_count(), 1);
    assert!(!platform.is_alive(pid));
    assert!(matches!(host.start("farm"), Err(AppError::InvalidArgument(_))));
}

#[tokio::test(start_paused = true)]
async fn wait_all_returns_once_every_running_session_ends() {
    let (_, drivers, harness) = setup();
    let host = Arc::new(SessionHost::new(harness.context()));
    host.create("farm", endless_run()).unwrap();
    host.create("empty", Vec::new()).unwrap();
    host.create("never", endless_run()).unwrap();
    host.wait_all().await;

    host.start("farm").unwrap();
    host.start("empty").unwrap();
    until_bot_started(&drivers).await;

    let waiter = tokio::spawn({
        let host = Arc::clone(&host);
        async move { host.wait_all().await }
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!waiter.is_finished());

    host.stop("farm").unwrap();
    waiter.await.unwrap();
    let statuses: Vec<SessionStatus> = host.list().into_iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![SessionStatus::Completed, SessionStatus::Failed, SessionStatus::Idle]
    );
}

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use drover::codec::{REPLY_UNKNOWN_JOB, REPLY_UNKNOWN_RESERVATION};
use drover::test_helpers::MockCoordinator;
use drover::{
    Attribute, ClusterClient, ClusterConfig, ClusterError, CoordinatorLink, Reply, ReplyBody,
    RequestBody,
};

fn owns(job: &'static str) -> impl Fn(&drover::Request) -> Option<Reply> + Send + Sync + 'static {
    move |request: &drover::Request| match &request.body {
        RequestBody::SignalJob { job_id, .. } if job_id == job => Some(Reply::ok()),
        RequestBody::SignalJob { .. } => Some(Reply::error(REPLY_UNKNOWN_JOB, "unknown job")),
        RequestBody::ModifyReservation { .. } => {
            Some(Reply::error(REPLY_UNKNOWN_RESERVATION, "unknown reservation"))
        }
        RequestBody::SelectJobs { .. } => Some(Reply::with_body(ReplyBody::Select(vec![job.to_string()]))),
        _ => Some(Reply::ok()),
    }
}

#[tokio::test]
async fn signal_fails_over_to_the_owning_coordinator() {
    common::init_tracing();
    let first = MockCoordinator::start(owns("1.svr1")).await.unwrap();
    let second = MockCoordinator::start(owns("2.svr2")).await.unwrap();
    let addrs: Vec<SocketAddr> = vec![first.addr(), second.addr()];

    let client = ClusterClient::connect(&addrs, &ClusterConfig::default()).await.unwrap();
    client.signal_job("2.svr2", "SIGTERM", None).await.unwrap();

    assert!(second.requests().iter().any(|request| matches!(
        &request.body,
        RequestBody::SignalJob { job_id, signal } if job_id == "2.svr2" && signal == "SIGTERM"
    )));
    assert_eq!(client.router().locations().get("2.svr2"), Some(1));

    // the location cache sends the next request straight to the owner
    let before = first.requests().len();
    client.signal_job("2.svr2", "SIGKILL", Some("force")).await.unwrap();
    assert_eq!(first.requests().len(), before);
    assert_eq!(second.requests().last().unwrap().extension.as_deref(), Some("force"));
}

#[tokio::test]
async fn unknown_everywhere_is_target_not_recognized() {
    let first = MockCoordinator::start(owns("1.svr1")).await.unwrap();
    let second = MockCoordinator::start(owns("2.svr2")).await.unwrap();
    let client = ClusterClient::connect(&[first.addr(), second.addr()], &ClusterConfig::default())
        .await
        .unwrap();

    let err = client
        .modify_reservation("R9.svr1", vec![Attribute::new("Resource_List.ncpus", "8")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::TargetNotRecognized(target) if target == "R9.svr1"));
    assert_eq!(first.requests().len(), 1);
    assert_eq!(second.requests().len(), 1);
}

#[tokio::test]
async fn unreachable_coordinator_is_skipped() {
    let dead = MockCoordinator::start(owns("1.svr1")).await.unwrap();
    let dead_addr = dead.addr();
    dead.shutdown().await;
    let live = MockCoordinator::start(owns("1.svr1")).await.unwrap();

    let client = ClusterClient::connect(&[dead_addr, live.addr()], &ClusterConfig::default())
        .await
        .unwrap();
    assert!(!client.router().links()[0].is_up());

    client.router().locations().record("1.svr1", 0);
    client.signal_job("1.svr1", "SIGHUP", None).await.unwrap();
    assert_eq!(live.requests().len(), 1);
}

#[tokio::test]
async fn lost_coordinator_goes_down_and_is_skipped_afterwards() {
    let flaky = MockCoordinator::start(|_| None).await.unwrap();
    let steady = MockCoordinator::start(owns("5.svr")).await.unwrap();
    let client = ClusterClient::connect(&[flaky.addr(), steady.addr()], &ClusterConfig::default())
        .await
        .unwrap();

    client.router().locations().record("5.svr", 0);
    let err = client.signal_job("5.svr", "SIGTERM", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::Io(_)), "{err:?}");
    assert!(!client.router().links()[0].is_up());

    client.signal_job("5.svr", "SIGTERM", None).await.unwrap();
    assert_eq!(flaky.requests().len(), 1);
    assert_eq!(steady.requests().len(), 1);
}

#[tokio::test]
async fn restarted_coordinator_is_used_again_after_the_backoff() {
    let config = ClusterConfig {
        reconnect_backoff: Duration::from_millis(100),
        ..Default::default()
    };
    let original = MockCoordinator::start(owns("8.svr")).await.unwrap();
    let addr = original.addr();
    let client = ClusterClient::connect(&[addr], &config).await.unwrap();
    client.signal_job("8.svr", "SIGSTOP", None).await.unwrap();

    original.shutdown().await;
    let err = client.signal_job("8.svr", "SIGCONT", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::Io(_)), "{err:?}");
    assert!(!client.router().links()[0].is_up());

    let restarted = MockCoordinator::start_at(addr, owns("8.svr")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    client.signal_job("8.svr", "SIGCONT", None).await.unwrap();
    assert!(client.router().links()[0].is_up());
    assert_eq!(restarted.requests().len(), 1);
}

#[tokio::test]
async fn lost_coordinator_is_not_retried_before_the_backoff() {
    let server = MockCoordinator::start(owns("9.svr")).await.unwrap();
    let addr = server.addr();
    server.shutdown().await;

    let client = ClusterClient::connect(&[addr], &ClusterConfig::default()).await.unwrap();
    let _restarted = MockCoordinator::start_at(addr, owns("9.svr")).await.unwrap();

    let err = client.signal_job("9.svr", "SIGTERM", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::NoReachablePeer), "{err:?}");
}

#[tokio::test]
async fn select_gathers_from_every_coordinator() {
    let first = MockCoordinator::start(owns("1.svr1")).await.unwrap();
    let second = MockCoordinator::start(owns("2.svr2")).await.unwrap();
    let client = ClusterClient::connect(&[first.addr(), second.addr()], &ClusterConfig::default())
        .await
        .unwrap();

    let jobs = client
        .select_jobs(vec![Attribute::new("job_state", "R")], None)
        .await
        .unwrap();
    assert_eq!(jobs, vec!["1.svr1", "2.svr2"]);
}

#[tokio::test]
async fn no_addresses_is_invalid() {
    assert!(matches!(
        ClusterClient::connect(&[], &ClusterConfig::default()).await,
        Err(ClusterError::InvalidRequest(_))
    ));
}

//! End-to-end pipeline scenarios.
//!
//! Tests cover:
//! - A full tick against a backlog larger than the quota
//! - Shutdown with admitted and queued work
//! - Backpressure when the gateway stalls
//! - Drain timeout
//! - Independent pipelines in one process

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{dispatch_config, run_once, spawn_dispatcher, wait_until, ScriptedGateway};
use mailflow_core::config::DispatchConfig;
use mailflow_core::db::MemoryJobStore;
use mailflow_core::jobs::JobStatus;
use mailflow_core::pipeline::Pipeline;

#[tokio::test(start_paused = true)]
async fn test_backlog_larger_than_quota() {
    let store = MemoryJobStore::new();
    let content = store.insert_content("s", "b");
    let ids = store.seed(content, 2_500);

    // rate 10 over a 60s interval: quota 600 in a single batch of up to 1000
    let config = DispatchConfig {
        batch_size: 1_000,
        ..dispatch_config(10, 20)
    };
    let gateway = Arc::new(ScriptedGateway::new());
    let (tick, summary) = run_once(Arc::new(store.clone()), gateway.clone(), &config).await;

    assert_eq!(tick.claimed, 600);
    assert_eq!(summary.sent, 600);
    assert_eq!(gateway.call_count(), 600);
    assert_eq!(store.count(JobStatus::Sent), 600);
    assert_eq!(store.count(JobStatus::InFlight), 0);
    assert_eq!(store.count(JobStatus::Created), 1_900);

    // the quota went to the oldest jobs
    assert!(ids[..600]
        .iter()
        .all(|id| store.job(*id).unwrap().status == JobStatus::Sent));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_admitted_and_drops_queued() {
    let store = MemoryJobStore::new();
    let content = store.insert_content("s", "b");
    store.seed(content, 55);

    let (gateway, gate) = ScriptedGateway::new().gated();
    let gateway = Arc::new(gateway);
    let harness = spawn_dispatcher(Arc::new(store.clone()), gateway.clone(), &dispatch_config(100, 5));

    let tick = harness.scheduler.run_tick(&harness.cancel).await;
    assert_eq!(tick.enqueued, 55);
    assert!(wait_until(|| gateway.in_flight() == 5, Duration::from_secs(5)).await);

    harness.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.open();

    let summary = harness.dispatcher.await.unwrap();
    assert_eq!(summary.admitted, 5);
    assert_eq!(summary.sent, 5);
    assert_eq!(summary.drained, 5);
    assert_eq!(summary.dropped_queued, 50);
    assert_eq!(summary.abandoned, 0);

    assert_eq!(gateway.call_count(), 5);
    assert_eq!(store.count(JobStatus::Sent), 5);
    // dropped jobs are not reverted
    assert_eq!(store.count(JobStatus::InFlight), 50);
    assert_eq!(store.count(JobStatus::Created), 0);
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_abandons_stuck_sends() {
    let store = MemoryJobStore::new();
    let content = store.insert_content("s", "b");
    store.seed(content, 3);

    let (gateway, _gate) = ScriptedGateway::new().gated();
    let gateway = Arc::new(gateway);
    let config = DispatchConfig {
        drain_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(600),
        ..dispatch_config(100, 5)
    };
    let harness = spawn_dispatcher(Arc::new(store.clone()), gateway.clone(), &config);
    harness.scheduler.run_tick(&harness.cancel).await;
    assert!(wait_until(|| gateway.in_flight() == 3, Duration::from_secs(5)).await);

    harness.cancel.cancel();
    let summary = harness.dispatcher.await.unwrap();

    assert_eq!(summary.admitted, 3);
    assert_eq!(summary.abandoned, 3);
    assert_eq!(summary.sent + summary.failed, 0);
    assert_eq!(harness.pool.stats().abandoned, 3);
    assert_eq!(harness.pool.in_flight(), 0);
    assert_eq!(store.count(JobStatus::InFlight), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_gateway_blocks_intake_without_dropping() {
    let store = MemoryJobStore::new();
    let content = store.insert_content("s", "b");
    store.seed(content, 40);

    let (gateway, gate) = ScriptedGateway::new().gated();
    let gateway = Arc::new(gateway);
    let config = DispatchConfig {
        batch_size: 5,
        queue_capacity: 3,
        ..dispatch_config(100, 2)
    };
    let harness = spawn_dispatcher(Arc::new(store.clone()), gateway.clone(), &config);
    let cancel = harness.cancel.clone();
    let scheduler = harness.scheduler;
    let tick = tokio::spawn(async move { scheduler.run_tick(&cancel).await });

    assert!(wait_until(|| gateway.in_flight() == 2, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let created = store.count(JobStatus::Created);

    // intake stays frozen while the gateway is stalled
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!tick.is_finished());
    assert!(created > 0);
    assert_eq!(store.count(JobStatus::Created), created);
    assert_eq!(gateway.call_count(), 2);
    assert_eq!(store.count(JobStatus::Failed), 0);

    gate.open();
    let report = tick.await.unwrap();
    assert_eq!(report.claimed, 40);
    assert_eq!(report.enqueued, 40);
    assert_eq!(report.dropped, 0);

    let summary = harness.dispatcher.await.unwrap();
    assert_eq!(summary.sent, 40);
    assert_eq!(store.count(JobStatus::Sent), 40);
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_runs_ticks_until_shutdown() {
    let store = MemoryJobStore::new();
    let content = store.insert_content("s", "b");
    store.seed(content, 25);

    // quota 5 x 2s = 10 per tick
    let config = DispatchConfig {
        interval: Duration::from_secs(2),
        ..dispatch_config(5, 10)
    };
    let pipeline = Pipeline::new(config, Arc::new(store.clone()), Arc::new(ScriptedGateway::new())).unwrap();
    let handle = pipeline.start();

    assert!(wait_until(|| store.count(JobStatus::Sent) == 25, Duration::from_secs(30)).await);
    let summary = handle.shutdown().await.unwrap();

    assert!(summary.scheduler.ticks >= 3);
    assert_eq!(summary.scheduler.claimed, 25);
    assert_eq!(summary.dispatch.sent, 25);
    assert_eq!(summary.dispatch.dropped_queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_independent_pipelines() {
    let first = MemoryJobStore::new();
    let second = MemoryJobStore::new();
    let content = first.insert_content("s", "b");
    first.seed(content, 10);
    let content = second.insert_content("s", "b");
    second.seed(content, 4);

    let bad_gateway = ScriptedGateway::new();
    let bad_gateway = (0..4).fold(bad_gateway, |g, i| g.failing_for(&format!("user{}@example.com", i)));

    let a = Pipeline::new(dispatch_config(10, 10), Arc::new(first.clone()), Arc::new(ScriptedGateway::new()))
        .unwrap()
        .start();
    let b = Pipeline::new(dispatch_config(2, 1), Arc::new(second.clone()), Arc::new(bad_gateway))
        .unwrap()
        .start();

    assert!(wait_until(
        || first.count(JobStatus::Sent) == 10 && second.count(JobStatus::Failed) == 4,
        Duration::from_secs(30)
    )
    .await);

    let (a, b) = (a.shutdown().await.unwrap(), b.shutdown().await.unwrap());
    assert_eq!(a.dispatch.sent, 10);
    assert_eq!(b.dispatch.failed, 4);
    assert_eq!(b.dispatch.sent, 0);
}

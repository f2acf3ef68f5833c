//! Health monitor tests

use std::time::Duration;

use deckhand::deploy::fsm::AppStatus;
use deckhand::errors::ErrorKind;
use deckhand::health::CheckStatus;
use deckhand::models::app::{AppUpdate, HealthCheck};
use deckhand::models::deployment::DeploymentStatus;
use deckhand::workers::health;

use crate::common::Harness;

#[tokio::test]
async fn test_sweep_records_healthy_apps() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.create("idle").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();

    assert_eq!(h.state.monitor.sweep().await.unwrap(), 1);

    let report = h.state.monitor.report("blog").unwrap();
    assert_eq!(report.check, CheckStatus::Healthy);
    assert_eq!(report.consecutive_failures, 0);
    assert!(report.last_checked.is_some());

    let idle = h.state.monitor.report("idle").unwrap();
    assert_eq!(idle.check, CheckStatus::Unknown);
    assert_eq!(idle.status, AppStatus::Pending);
}

#[tokio::test]
async fn test_failures_below_threshold_keep_running() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();
    h.runtime.kill("deckhand-blog");

    h.state.monitor.sweep().await.unwrap();

    let report = h.state.monitor.report("blog").unwrap();
    assert_eq!(report.status, AppStatus::Running);
    assert_eq!(report.check, CheckStatus::Unhealthy);
    assert_eq!(report.consecutive_failures, 1);
    assert!(report.last_error.unwrap().contains("deckhand-blog"));
}

#[tokio::test]
async fn test_threshold_fails_app_and_recovery_restores_it() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();
    h.runtime.kill("deckhand-blog");

    h.state.monitor.sweep().await.unwrap();
    h.state.monitor.sweep().await.unwrap();
    h.state.monitor.wait_for_rollbacks().await;

    // Nothing older to roll back to
    assert_eq!(h.app("blog").status, AppStatus::Failed);
    assert!(h.proxy.route("deckhand-blog").is_none());

    let app = h.state.engine.restart("blog").await.unwrap();
    assert_eq!(app.status, AppStatus::Failed);

    h.state.monitor.sweep().await.unwrap();
    assert_eq!(h.app("blog").status, AppStatus::Running);
    assert!(h.proxy.route("deckhand-blog").is_some());
    assert_eq!(h.state.monitor.report("blog").unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn test_threshold_rolls_back_to_previous_deployment() {
    let h = Harness::new().await;
    h.create("blog").await;
    let first = h.deploy_image("blog", "ghost:5").await.unwrap();
    let second = h.deploy_image("blog", "ghost:6").await.unwrap();
    h.runtime.kill("deckhand-blog");

    h.state.monitor.sweep().await.unwrap();
    h.state.monitor.sweep().await.unwrap();
    h.state.monitor.wait_for_rollbacks().await;

    let app = h.app("blog");
    assert_eq!(app.status, AppStatus::Running);
    assert_eq!(app.image.as_deref(), Some("ghost:5"));
    assert!(h.runtime.container("deckhand-blog").unwrap().running);

    let deployments = h.state.engine.list_deployments("blog").unwrap();
    assert!(deployments.iter().any(|d| d.id == first.id && d.active));
    assert!(deployments
        .iter()
        .any(|d| d.id == second.id && d.status == DeploymentStatus::RolledBack));
}

#[tokio::test]
async fn test_sweep_skips_busy_apps() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();
    h.runtime.kill("deckhand-blog");

    let guard = h.state.engine.locks().try_lock_app("blog").unwrap();
    assert_eq!(h.state.monitor.sweep().await.unwrap(), 0);
    assert_eq!(h.state.monitor.report("blog").unwrap().consecutive_failures, 0);

    drop(guard);
    assert_eq!(h.state.monitor.sweep().await.unwrap(), 1);
}

#[tokio::test]
async fn test_check_now() {
    let h = Harness::new().await;
    h.create("blog").await;

    let err = h.state.monitor.check_now("blog").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.deploy_image("blog", "ghost:5").await.unwrap();
    let report = h.state.monitor.check_now("blog").await.unwrap();
    assert_eq!(report.check, CheckStatus::Healthy);

    let err = h.state.monitor.check_now("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_tcp_check_counts_toward_streak() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();

    // Nothing listens on the published port
    let update = AppUpdate {
        health_check: Some(HealthCheck::Tcp),
        ..Default::default()
    };
    h.state.engine.update_app("blog", update).await.unwrap();

    let report = h.state.monitor.check_now("blog").await.unwrap();
    assert_eq!(report.check, CheckStatus::Unhealthy);
    assert_eq!(report.consecutive_failures, 1);
    assert!(report.last_error.unwrap().contains("connect"));
}

#[tokio::test]
async fn test_health_worker_sweeps_until_shutdown() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();
    h.runtime.kill("deckhand-blog");

    let options = health::Options {
        interval: Duration::from_millis(10),
        initial_delay: Duration::from_millis(0),
    };
    health::run(
        &options,
        h.state.monitor.as_ref(),
        |_| tokio::time::sleep(Duration::from_millis(10)),
        Box::pin(tokio::time::sleep(Duration::from_millis(300))),
    )
    .await;

    assert_eq!(h.app("blog").status, AppStatus::Failed);
}

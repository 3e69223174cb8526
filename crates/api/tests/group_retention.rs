//! Tests for the background sweep of expired job groups.

mod common;

use std::time::Duration;

use common::{build_test_app_with, post_json, test_config, workflow, Behaviour, FakeFarm};
use renderfarm_api::background::group_retention;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn sweeper_evicts_finished_groups_and_stops_on_cancel() {
    let mut config = test_config();
    config.scheduler.retention = Duration::ZERO;
    let (app, state) = build_test_app_with(FakeFarm::new().with("gpu-a", Behaviour::Succeed), config);

    let created = post_json(
        app,
        "/api/v1/job-groups",
        json!({"job_spec": workflow(), "target_backends": ["gpu-a"]}),
    )
    .await;
    assert_eq!(created.status(), axum::http::StatusCode::CREATED);

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(group_retention::run(
        state.manager.clone(),
        Duration::from_millis(10),
        cancel.clone(),
    ));

    let emptied = tokio::time::timeout(Duration::from_secs(5), async {
        while state.manager.group_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(emptied.is_ok(), "finished group was never evicted");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .expect("sweeper must stop once cancelled")
        .unwrap();
}

#[tokio::test]
async fn sweeper_keeps_running_groups() {
    let mut config = test_config();
    config.scheduler.retention = Duration::ZERO;
    let (app, state) = build_test_app_with(FakeFarm::new().with("gpu-a", Behaviour::Hang), config);

    post_json(
        app,
        "/api/v1/job-groups",
        json!({"job_spec": workflow(), "target_backends": ["gpu-a"]}),
    )
    .await;

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(group_retention::run(
        state.manager.clone(),
        Duration::from_millis(10),
        cancel.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(state.manager.group_count().await, 1);
    cancel.cancel();
    sweeper.await.unwrap();
}

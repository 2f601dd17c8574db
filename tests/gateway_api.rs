use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use dagline_core::config::{EngineConfig, GatewayConfig, StoreConfig};
use dagline_core::event::EventBus;
use dagline_core::status::RunStatus;
use dagline_core::types::{DagRun, DagStep, EngineType};
use dagline_engine::RunLauncher;
use dagline_gateway::{router, AppState};
use dagline_store::MemoryRunStore;

fn write_workflow(dir: &Path, name: &str, yaml: &str) {
    let mut f = std::fs::File::create(dir.join(name)).expect("create workflow");
    f.write_all(yaml.as_bytes()).expect("write workflow");
}

fn test_app(workflows_dir: &Path) -> (Router, Arc<MemoryRunStore>) {
    let store = Arc::new(MemoryRunStore::new());
    let bus = Arc::new(EventBus::new(256));
    let engine_config = EngineConfig {
        workflows_dir: workflows_dir.display().to_string(),
        retry_backoff_ms: 1,
        ..Default::default()
    };
    let store_config = StoreConfig {
        archive_dir: workflows_dir.join("archives").display().to_string(),
        ..Default::default()
    };
    let launcher = Arc::new(RunLauncher::new(
        store.clone() as Arc<dyn dagline_core::traits::RunStore>,
        bus.clone(),
        &engine_config,
        &store_config,
        None,
    ));
    let state = Arc::new(AppState {
        config: GatewayConfig::default(),
        store: store.clone(),
        bus,
        launcher,
        default_engine: EngineType::Sequential,
        started_at: Instant::now(),
    });
    (router(state), store)
}

async fn get_json(app: &Router, path: &str) -> (StatusCode, serde_json::Value) {
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(path)
                .body(Body::empty())
                .expect("build request"),
        )
        .await
        .expect("send request");
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("read body");
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn send_json(
    app: &Router,
    method: &str,
    path: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("build request"),
        )
        .await
        .expect("send request");
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("read body");
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn seeded_run(dag_id: &str, status: RunStatus) -> DagRun {
    let mut run = DagRun::new(dag_id);
    let mut step = DagStep::new("only", "Only step");
    if status.is_terminal() {
        step.mark_running();
        step.mark_terminal(dagline_core::status::StepStatus::Success, None);
    }
    run.steps.push(step);
    run.apply_status(status);
    run
}

async fn seed(store: &MemoryRunStore, run: &DagRun) {
    use dagline_core::traits::RunStore;
    store.insert_run(run).await.expect("seed run");
}

#[tokio::test]
async fn test_health_reports_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path());

    let (status, body) = get_json(&app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_list_runs_pagination() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(dir.path());
    for i in 0..5 {
        seed(&store, &seeded_run(&format!("dag_{i}"), RunStatus::Pending)).await;
    }

    let (status, body) = get_json(&app, "/api/dag-runs?limit=2&offset=0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 5);
    assert_eq!(body["page"], 1);
    assert_eq!(body["limit"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    // newest first
    assert_eq!(body["items"][0]["dag_id"], "dag_4");

    let (_, body) = get_json(&app, "/api/dag-runs?limit=2&offset=4").await;
    assert_eq!(body["page"], 3);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    // offset past the end is an empty page, not an error
    let (status, body) = get_json(&app, "/api/dag-runs?limit=2&offset=100").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 0);
    assert_eq!(body["total"], 5);
}

#[tokio::test]
async fn test_list_runs_status_filter() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(dir.path());
    seed(&store, &seeded_run("waiting", RunStatus::Pending)).await;
    seed(&store, &seeded_run("done", RunStatus::Success)).await;

    let (status, body) = get_json(&app, "/api/dag-runs?status=success").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["dag_id"], "done");

    // legacy vocabulary is accepted on input
    let (status, body) = get_json(&app, "/api/dag-runs?status=completed").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);

    let (status, body) = get_json(&app, "/api/dag-runs?status=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
    assert_eq!(body["path"], "/api/dag-runs");
}

#[tokio::test]
async fn test_get_unknown_run_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path());

    let (status, body) = get_json(&app, "/api/dag-runs/no-such-run").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFoundError");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_get_run_returns_full_record() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(dir.path());
    let run = seeded_run("inspect_me", RunStatus::Running);
    seed(&store, &run).await;

    let (status, body) = get_json(&app, &format!("/api/dag-runs/{}", run.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dag_id"], "inspect_me");
    assert_eq!(body["status"], "running");
    assert_eq!(body["steps"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_run_rejects_unknown_engine() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path());

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/dag-runs",
        serde_json::json!({
            "workflow_path": "whatever.yaml",
            "engine_type": "quantum",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn test_create_run_rejects_missing_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path());

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/dag-runs",
        serde_json::json!({ "workflow_path": "ghost.yaml" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn test_create_run_completes_and_is_queryable() {
    let dir = tempfile::tempdir().unwrap();
    write_workflow(
        dir.path(),
        "two_step.yaml",
        "dag_id: two_step\nsteps:\n  - id: first\n  - id: second\n    depends_on: [first]\n",
    );
    let (app, _store) = test_app(dir.path());

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/dag-runs",
        serde_json::json!({ "workflow_path": "two_step.yaml" }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["run_id"].as_str().expect("run_id in response").to_string();

    // poll until the driver finishes
    let mut last = serde_json::Value::Null;
    for _ in 0..200 {
        let (status, body) = get_json(&app, &format!("/api/dag-runs/{run_id}")).await;
        assert_eq!(status, StatusCode::OK);
        let s = RunStatus::parse_lenient(body["status"].as_str().unwrap()).unwrap();
        last = body;
        if s.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(last["status"], "success");
    assert_eq!(last["steps"][0]["status"], "success");
    assert_eq!(last["steps"][1]["status"], "success");
    assert!(last["end_date"].is_string());
}

#[tokio::test]
async fn test_patch_status_only_accepts_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(dir.path());
    let run = seeded_run("patchable", RunStatus::Running);
    seed(&store, &run).await;

    let (status, body) = send_json(
        &app,
        "PATCH",
        &format!("/api/dag-runs/{}/status", run.id),
        serde_json::json!({ "status": "success" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn test_cancel_pending_run() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(dir.path());
    let run = seeded_run("cancellable", RunStatus::Pending);
    seed(&store, &run).await;

    let (status, body) = send_json(
        &app,
        "PATCH",
        &format!("/api/dag-runs/{}/status", run.id),
        serde_json::json!({ "status": "cancelled" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert!(body["end_date"].is_string());
    assert_eq!(body["steps"][0]["status"], "cancelled");
}

#[tokio::test]
async fn test_cancel_terminal_run_is_409() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(dir.path());
    let run = seeded_run("already_done", RunStatus::Success);
    seed(&store, &run).await;

    let (status, body) = send_json(
        &app,
        "PATCH",
        &format!("/api/dag-runs/{}/status", run.id),
        serde_json::json!({ "status": "cancelled" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "InvalidTransition");
}

#[tokio::test]
async fn test_cancel_unknown_run_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = test_app(dir.path());

    let (status, body) = send_json(
        &app,
        "PATCH",
        "/api/dag-runs/no-such-run/status",
        serde_json::json!({ "status": "cancelled" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFoundError");
}

#[tokio::test]
async fn test_metrics_counts_runs_by_status() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = test_app(dir.path());
    seed(&store, &seeded_run("a", RunStatus::Pending)).await;
    seed(&store, &seeded_run("b", RunStatus::Pending)).await;
    seed(&store, &seeded_run("c", RunStatus::Failed)).await;

    let (status, body) = get_json(&app, "/api/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runs"]["total"], 3);
    assert_eq!(body["runs"]["by_status"]["pending"], 2);
    assert_eq!(body["runs"]["by_status"]["failed"], 1);
}

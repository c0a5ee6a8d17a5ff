//! End-to-end scenarios over the real router and a temp database:
//! issue allocation (sequential and concurrent), workflow record CRUD,
//! the worker intake endpoints, and session-deduplicated fan-out.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

use adwd::config::ServerConfig;
use adwd::server::api::SharedState;
use adwd::server::connections::Frame;
use adwd::server::{build_router, build_state};

struct TestApp {
    state: SharedState,
    router: Router,
    _dir: tempfile::TempDir,
}

fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        db_path: dir.path().join("adwd.db"),
        agents_dir: dir.path().join("agents"),
        specs_dir: dir.path().join("specs"),
        repo_root: dir.path().to_path_buf(),
        ..ServerConfig::default()
    };
    let (state, _events_rx) = build_state(config).unwrap();
    let router = build_router(Arc::clone(&state));
    TestApp {
        state,
        router,
        _dir: dir,
    }
}

async fn request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn attach_client(state: &SharedState) -> (String, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = state.connections.connect(tx, Value::Null);
    (id, rx)
}

fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Frame::Text(text) = frame {
            out.push(serde_json::from_str(&text).unwrap());
        }
    }
    out
}

// ── Issue allocation ─────────────────────────────────────────────────

#[tokio::test]
async fn allocation_is_sequential_from_empty_store() {
    let app = test_app();

    let (status, body) = request(
        &app.router,
        "POST",
        "/api/issues/allocate",
        Some(json!({"issue_title": "a"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["issue_number"], 1);

    let (status, body) = request(
        &app.router,
        "POST",
        "/api/issues/allocate",
        Some(json!({"issue_title": "b"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["issue_number"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_allocations_form_contiguous_range() {
    let app = test_app();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let router = app.router.clone();
        tasks.push(tokio::spawn(async move {
            let (status, body) = request(
                &router,
                "POST",
                "/api/issues/allocate",
                Some(json!({"issue_title": format!("issue-{}", i)})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            body["issue_number"].as_i64().unwrap()
        }));
    }

    let mut numbers = Vec::new();
    for task in tasks {
        numbers.push(task.await.unwrap());
    }
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=20).collect::<Vec<i64>>());

    let (status, issues) = request(&app.router, "GET", "/api/issues?page_size=100", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(issues.as_array().unwrap().len(), 20);
}

#[tokio::test]
async fn issue_get_delete_lifecycle() {
    let app = test_app();
    request(
        &app.router,
        "POST",
        "/api/issues/allocate",
        Some(json!({"issue_title": "keep me"})),
    )
    .await;

    let (status, body) = request(&app.router, "GET", "/api/issues/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["issue_title"], "keep me");

    let (status, _) = request(&app.router, "DELETE", "/api/issues/1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(&app.router, "GET", "/api/issues/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Soft-deleted rows stay visible with include_deleted.
    let (_, issues) = request(
        &app.router,
        "GET",
        "/api/issues?include_deleted=true",
        None,
    )
    .await;
    assert_eq!(issues.as_array().unwrap().len(), 1);

    let (status, _) = request(
        &app.router,
        "DELETE",
        "/api/issues/1?permanent=true",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, issues) = request(
        &app.router,
        "GET",
        "/api/issues?include_deleted=true",
        None,
    )
    .await;
    assert!(issues.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn dedup_on_clean_store_reports_zero() {
    let app = test_app();
    for title in ["a", "b", "c"] {
        request(
            &app.router,
            "POST",
            "/api/issues/allocate",
            Some(json!({"issue_title": title})),
        )
        .await;
    }

    let (status, report) = request(
        &app.router,
        "POST",
        "/api/maintenance/dedup-issues",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["duplicates_found"], 0);
    assert_eq!(report["records_reassigned"], 0);
}

// ── Workflow records ─────────────────────────────────────────────────

#[tokio::test]
async fn create_adw_conflicts_on_duplicate() {
    let app = test_app();
    let body = json!({"adw_id": "testadw1", "issue_number": 999, "issue_title": "T"});

    let (status, created) = request(&app.router, "POST", "/api/adws", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["adw_id"], "testadw1");
    assert_eq!(created["issue_number"], 999);

    let (status, error) = request(&app.router, "POST", "/api/adws", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(error["error"].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn create_adw_validates_id_shape() {
    let app = test_app();
    let (status, _) = request(
        &app.router,
        "POST",
        "/api/adws",
        Some(json!({"adw_id": "short"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn patch_adw_and_filters() {
    let app = test_app();
    request(
        &app.router,
        "POST",
        "/api/adws",
        Some(json!({"adw_id": "testadw1"})),
    )
    .await;
    request(
        &app.router,
        "POST",
        "/api/adws",
        Some(json!({"adw_id": "testadw2"})),
    )
    .await;

    let (status, updated) = request(
        &app.router,
        "PATCH",
        "/api/adws/testadw1",
        Some(json!({"status": "in_progress", "current_stage": "build"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "in_progress");
    assert_eq!(updated["current_stage"], "build");

    let (_, list) = request(&app.router, "GET", "/api/adws?status=in_progress", None).await;
    assert_eq!(list["total_count"], 1);
    assert_eq!(list["adws"][0]["adw_id"], "testadw1");

    let (status, _) = request(
        &app.router,
        "PATCH",
        "/api/adws/ghost999",
        Some(json!({"status": "pending"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn completed_at_coerces_status_over_http() {
    let app = test_app();
    request(
        &app.router,
        "POST",
        "/api/adws",
        Some(json!({"adw_id": "testadw1"})),
    )
    .await;

    let (_, updated) = request(
        &app.router,
        "PATCH",
        "/api/adws/testadw1",
        Some(json!({"completed_at": "2026-02-01T10:00:00Z"})),
    )
    .await;
    assert_eq!(updated["status"], "completed");

    let (_, record) = request(&app.router, "GET", "/api/adws/testadw1", None).await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["completed_at"], "2026-02-01T10:00:00Z");
}

#[tokio::test]
async fn activity_log_round_trip() {
    let app = test_app();
    request(
        &app.router,
        "POST",
        "/api/adws",
        Some(json!({"adw_id": "testadw1"})),
    )
    .await;

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/adws/testadw1/activity",
        Some(json!({
            "event_type": "stage_transition",
            "field_changed": "current_stage",
            "old_value": "plan",
            "new_value": "build",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, history) = request(
        &app.router,
        "GET",
        "/api/adws/testadw1/activity?page=1&page_size=10",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // The record-creation entry plus the explicit one.
    assert_eq!(history["total_count"], 2);
    assert_eq!(history["activities"][0]["event_type"], "stage_transition");
}

#[tokio::test]
async fn soft_deleted_adw_hidden_from_reads() {
    let app = test_app();
    request(
        &app.router,
        "POST",
        "/api/adws",
        Some(json!({"adw_id": "testadw1"})),
    )
    .await;

    let (status, _) = request(&app.router, "DELETE", "/api/adws/testadw1", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(&app.router, "GET", "/api/adws/testadw1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, list) = request(&app.router, "GET", "/api/adws?include_deleted=true", None).await;
    assert_eq!(list["total_count"], 1);
}

// ── Worker intake ────────────────────────────────────────────────────

#[tokio::test]
async fn workflow_updates_deduplicate_by_session() {
    let app = test_app();
    let (tab_a, mut rx_a) = attach_client(&app.state);
    let (tab_b, mut rx_b) = attach_client(&app.state);
    app.state
        .connections
        .register_session(&tab_a, "abc", Value::Null);
    app.state
        .connections
        .register_session(&tab_b, "abc", Value::Null);
    drain_frames(&mut rx_a);
    drain_frames(&mut rx_b);

    let (status, body) = request(
        &app.router,
        "POST",
        "/api/workflow-updates",
        Some(json!({
            "type": "status_update",
            "data": {
                "adw_id": "abcd1234",
                "workflow_name": "adw_plan_iso",
                "status": "in_progress",
                "message": "Planning",
                "timestamp": "2026-02-01T00:00:00Z",
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let delivered = drain_frames(&mut rx_a).len() + drain_frames(&mut rx_b).len();
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn workflow_updates_reject_missing_fields() {
    let app = test_app();
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/workflow-updates",
        Some(json!({
            "type": "status_update",
            "data": {"adw_id": "abcd1234"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("status_update"));

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/workflow-updates",
        Some(json!({"type": "telemetry", "data": {"x": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stage_event_derives_progress() {
    let app = test_app();
    let (_client, mut rx) = attach_client(&app.state);
    drain_frames(&mut rx);

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/stage-event",
        Some(json!({
            "adw_id": "abcd1234",
            "event_type": "stage_completed",
            "stage_name": "build",
            "message": "Build finished",
            "stage_index": 1,
            "total_stages": 4,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let frames = drain_frames(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "stage_completed");
    assert_eq!(frames[0]["data"]["progress_percent"], 50.0);

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/stage-event",
        Some(json!({
            "adw_id": "abcd1234",
            "event_type": "stage_exploded",
            "stage_name": "build",
            "message": "?",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn agent_state_update_routes_through_taxonomy() {
    let app = test_app();
    let (_client, mut rx) = attach_client(&app.state);
    drain_frames(&mut rx);

    let (status, body) = request(
        &app.router,
        "POST",
        "/api/agent-state-update",
        Some(json!({
            "adw_id": "abcd1234",
            "event_type": "thinking_block",
            "data": {"content": "hmm"},
            "timestamp": "2026-02-01T00:00:00Z",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let frames = drain_frames(&mut rx);
    assert_eq!(frames[0]["type"], "thinking_block");
    assert_eq!(frames[0]["data"]["adw_id"], "abcd1234");
    assert_eq!(frames[0]["data"]["content"], "hmm");

    // Unknown event types are logged and dropped, not errors.
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/agent-state-update",
        Some(json!({
            "adw_id": "abcd1234",
            "event_type": "quantum_leap",
            "data": {},
            "timestamp": "2026-02-01T00:00:00Z",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert!(drain_frames(&mut rx).is_empty());
}

#[tokio::test]
async fn phase_transition_and_artifacts_broadcast() {
    let app = test_app();
    let (_client, mut rx) = attach_client(&app.state);
    drain_frames(&mut rx);

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/workflow-phase-transition",
        Some(json!({"adw_id": "abcd1234", "phase_from": "plan", "phase_to": "build"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/screenshot-available",
        Some(json!({"adw_id": "abcd1234", "screenshot_path": "reviewer/review_img/a.png"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/spec-created",
        Some(json!({"adw_id": "abcd1234", "spec_path": "specs/plan-abcd1234.md", "spec_type": "plan"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/agent-output-chunk",
        Some(json!({"adw_id": "abcd1234", "agent_role": "planner", "content": "line"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let types: Vec<String> = drain_frames(&mut rx)
        .into_iter()
        .map(|f| f["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        types,
        vec![
            "workflow_phase_transition",
            "screenshot_available",
            "spec_created",
            "agent_output_chunk",
        ]
    );
}

#[tokio::test]
async fn subscriber_only_sees_its_workflow() {
    let app = test_app();
    let (scoped, mut rx_scoped) = attach_client(&app.state);
    let (_open, mut rx_open) = attach_client(&app.state);
    app.state.connections.subscribe_to_adw(&scoped, "adw-aaaa");
    drain_frames(&mut rx_scoped);
    drain_frames(&mut rx_open);

    request(
        &app.router,
        "POST",
        "/api/agent-output-chunk",
        Some(json!({"adw_id": "adw-bbbb", "agent_role": "planner", "content": "x"})),
    )
    .await;

    assert!(drain_frames(&mut rx_scoped).is_empty());
    assert_eq!(drain_frames(&mut rx_open).len(), 1);
}

// ── Health & stuck scan ──────────────────────────────────────────────

#[tokio::test]
async fn health_reports_database_state() {
    let app = test_app();
    let (status, body) = request(&app.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["total_workflows_triggered"], 0);
    assert!(body["health_check"]["healthy"].as_bool().unwrap());
}

#[tokio::test]
async fn detect_stuck_endpoint() {
    let app = test_app();
    request(
        &app.router,
        "POST",
        "/api/adws",
        Some(json!({"adw_id": "testadw1", "status": "in_progress"})),
    )
    .await;

    // Nothing is stale yet.
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/adws/detect-stuck",
        Some(json!({"threshold_minutes": 30})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stuck_count"], 0);

    // A zero-minute threshold flags the fresh in-progress row.
    let (_, body) = request(
        &app.router,
        "POST",
        "/api/adws/detect-stuck",
        Some(json!({"threshold_minutes": -1})),
    )
    .await;
    assert_eq!(body["stuck_count"], 1);

    let (_, record) = request(&app.router, "GET", "/api/adws/testadw1", None).await;
    assert_eq!(record["is_stuck"], true);
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::events::{
    Event, EventPayload, StageEvent, StatusUpdate, WorkflowLog, now_iso,
};
use crate::launcher::WorkerLauncher;
use crate::monitor::LogStreamer;
use crate::store::models::*;
use crate::store::{DbHandle, StoreError};

use super::connections::ConnectionManager;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub connections: ConnectionManager,
    pub launcher: WorkerLauncher,
    pub streamer: LogStreamer,
    pub started_at: Instant,
    pub workflows_triggered: AtomicU64,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::Contention(msg) => ApiError::Conflict(msg),
            StoreError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        // Workflow records
        .route("/api/adws", get(list_adws).post(create_adw))
        .route("/api/adws/detect-stuck", post(detect_stuck))
        .route(
            "/api/adws/{adw_id}",
            get(get_adw).patch(update_adw).delete(delete_adw),
        )
        .route(
            "/api/adws/{adw_id}/activity",
            get(get_activity).post(log_activity),
        )
        // Issue tracker
        .route("/api/issues/allocate", post(allocate_issue))
        .route("/api/issues", get(list_issues))
        .route(
            "/api/issues/{issue_number}",
            get(get_issue).delete(delete_issue),
        )
        .route("/api/maintenance/dedup-issues", post(dedup_issues))
        // Worker intake (the ingress bridge)
        .route("/api/workflow-updates", post(workflow_updates))
        .route("/api/stage-event", post(stage_event))
        .route("/api/agent-state-update", post(agent_state_update))
        .route(
            "/api/workflow-phase-transition",
            post(workflow_phase_transition),
        )
        .route("/api/agent-output-chunk", post(agent_output_chunk))
        .route("/api/screenshot-available", post(screenshot_available))
        .route("/api/spec-created", post(spec_created))
}

// ── Health ────────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let health = state.db.call(|db| Ok(db.health())).await;
    let (healthy, health_check) = match health {
        Ok(health) => (health.healthy, serde_json::to_value(&health).ok()),
        Err(e) => (false, Some(json!({"error": e.to_string()}))),
    };

    let status = if healthy { "healthy" } else { "unhealthy" };
    Json(json!({
        "status": status,
        "service": "adw-trigger-server",
        "active_connections": state.connections.connection_count(),
        "total_workflows_triggered": state.workflows_triggered.load(Ordering::Relaxed),
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "health_check": health_check,
    }))
}

// ── Workflow record API ───────────────────────────────────────────────

async fn create_adw(
    State(state): State<SharedState>,
    Json(create): Json<AdwCreate>,
) -> Result<impl IntoResponse, ApiError> {
    if create.adw_id.len() != 8 || !create.adw_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ApiError::BadRequest(
            "adw_id must be exactly 8 alphanumeric characters".to_string(),
        ));
    }

    let record = state
        .db
        .call(move |db| db.create_workflow(&create))
        .await?;

    state.connections.broadcast(
        &Event::new(EventPayload::SystemLog {
            level: "SUCCESS".to_string(),
            message: format!("ADW {} created", record.adw_id),
            details: None,
            context: json!({
                "adw_id": record.adw_id,
                "event_type": "adw_created",
                "issue_number": record.issue_number,
            }),
        }),
        false,
    );

    info!(adw_id = %record.adw_id, "created workflow record");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_adws(
    State(state): State<SharedState>,
    Query(filters): Query<AdwFilters>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .db
        .call(move |db| db.list_workflows(&filters))
        .await?;
    let total = records.len();
    Ok(Json(json!({"adws": records, "total_count": total})))
}

async fn get_adw(
    State(state): State<SharedState>,
    Path(adw_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.db.call(move |db| db.get_workflow(&adw_id)).await?;
    Ok(Json(record))
}

async fn update_adw(
    State(state): State<SharedState>,
    Path(adw_id): Path<String>,
    Json(update): Json<AdwUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let updated_fields: Vec<String> = serde_json::to_value(&update)
        .ok()
        .and_then(|v| {
            v.as_object().map(|o| {
                o.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
        })
        .unwrap_or_default();

    let record = {
        let adw_id = adw_id.clone();
        state
            .db
            .call(move |db| db.update_workflow(&adw_id, &update))
            .await?
    };

    state.connections.broadcast(
        &Event::new(EventPayload::SystemLog {
            level: "INFO".to_string(),
            message: format!("ADW {} updated", adw_id),
            details: None,
            context: json!({
                "adw_id": adw_id,
                "event_type": "adw_updated",
                "updated_fields": updated_fields,
            }),
        }),
        false,
    );

    Ok(Json(record))
}

async fn delete_adw(
    State(state): State<SharedState>,
    Path(adw_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.delete_workflow(&adw_id))
        .await?;
    Ok(Json(json!({"success": true})))
}

async fn log_activity(
    State(state): State<SharedState>,
    Path(adw_id): Path<String>,
    Json(entry): Json<ActivityCreate>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .db
        .call(move |db| db.append_activity(&adw_id, &entry))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": id, "message": "Activity logged successfully"})),
    ))
}

#[derive(Deserialize)]
struct ActivityPageQuery {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    100
}

async fn get_activity(
    State(state): State<SharedState>,
    Path(adw_id): Path<String>,
    Query(page): Query<ActivityPageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page_size = page.page_size.clamp(1, 1000);
    let page_number = page.page.max(1);
    let (activities, total) = {
        let adw_id = adw_id.clone();
        state
            .db
            .call(move |db| db.list_activity(&adw_id, page_number, page_size))
            .await?
    };
    Ok(Json(json!({
        "adw_id": adw_id,
        "activities": activities,
        "total_count": total,
        "page": page_number,
        "page_size": page_size,
    })))
}

#[derive(Deserialize, Default)]
struct DetectStuckRequest {
    #[serde(default)]
    threshold_minutes: Option<i64>,
    #[serde(default)]
    adw_id: Option<String>,
}

async fn detect_stuck(
    State(state): State<SharedState>,
    Json(req): Json<DetectStuckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let threshold = req.threshold_minutes.unwrap_or(30);
    let count = state
        .db
        .call(move |db| db.detect_stuck(threshold, req.adw_id.as_deref()))
        .await?;
    Ok(Json(json!({
        "stuck_count": count,
        "message": format!("Flagged {} workflows as stuck", count),
    })))
}

// ── Issue tracker API ─────────────────────────────────────────────────

async fn allocate_issue(
    State(state): State<SharedState>,
    Json(req): Json<IssueAllocate>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.db.call(move |db| db.allocate_issue(&req)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "issue_number": record.issue_number,
            "issue_title": record.issue_title,
            "adw_id": record.adw_id,
            "message": format!("Issue number {} allocated successfully", record.issue_number),
        })),
    ))
}

#[derive(Deserialize)]
struct IssueListQuery {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    include_deleted: bool,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

async fn list_issues(
    State(state): State<SharedState>,
    Query(query): Query<IssueListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page_size = query.page_size.clamp(1, 1000);
    let issues = state
        .db
        .call(move |db| {
            db.list_issues(
                query.project_id.as_deref(),
                query.include_deleted,
                query.page,
                page_size,
            )
        })
        .await?;
    Ok(Json(issues))
}

async fn get_issue(
    State(state): State<SharedState>,
    Path(issue_number): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .db
        .call(move |db| db.get_issue(issue_number))
        .await?;
    Ok(Json(issue))
}

#[derive(Deserialize)]
struct DeleteIssueQuery {
    #[serde(default)]
    permanent: bool,
}

async fn delete_issue(
    State(state): State<SharedState>,
    Path(issue_number): Path<i64>,
    Query(query): Query<DeleteIssueQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.delete_issue(issue_number, query.permanent))
        .await?;
    let message = if query.permanent {
        format!("Issue {} permanently deleted", issue_number)
    } else {
        format!("Issue {} soft-deleted", issue_number)
    };
    Ok(Json(json!({"success": true, "message": message})))
}

async fn dedup_issues(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .db
        .call(|db| db.deduplicate_issue_numbers())
        .await?;
    Ok(Json(report))
}

// ── Worker intake (ingress bridge) ────────────────────────────────────
//
// Detached workers POST progress here; each endpoint validates the body
// and hands the event to the connection manager. None of them mutate
// workflow records - state changes flow through the store API.

#[derive(Deserialize)]
struct WorkflowUpdateEnvelope {
    #[serde(rename = "type")]
    update_type: String,
    data: Value,
}

async fn workflow_updates(
    State(state): State<SharedState>,
    Json(envelope): Json<WorkflowUpdateEnvelope>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = match envelope.update_type.as_str() {
        "status_update" => {
            let update: StatusUpdate = serde_json::from_value(envelope.data)
                .map_err(|e| ApiError::BadRequest(format!("Invalid status_update: {}", e)))?;
            EventPayload::StatusUpdate(update)
        }
        "workflow_log" => {
            let log: WorkflowLog = serde_json::from_value(envelope.data)
                .map_err(|e| ApiError::BadRequest(format!("Invalid workflow_log: {}", e)))?;
            EventPayload::WorkflowLog(log)
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unknown message type: {}",
                other
            )));
        }
    };

    state.connections.broadcast(&Event::new(payload), true);
    Ok(Json(json!({
        "status": "success",
        "message": "Update broadcasted to all clients",
        "clients_count": state.connections.connection_count(),
    })))
}

#[derive(Deserialize)]
struct StageEventRequest {
    adw_id: String,
    event_type: String,
    stage_name: String,
    message: String,
    #[serde(default)]
    previous_stage: Option<String>,
    #[serde(default)]
    next_stage: Option<String>,
    #[serde(default)]
    duration_ms: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    skip_reason: Option<String>,
    #[serde(default)]
    stage_index: Option<u32>,
    #[serde(default)]
    total_stages: Option<u32>,
    #[serde(default)]
    completed_stages: Option<Vec<String>>,
    #[serde(default)]
    pending_stages: Option<Vec<String>>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Stage progress as a percentage of stages entered so far.
fn stage_progress(stage_index: Option<u32>, total_stages: Option<u32>) -> Option<f64> {
    match (stage_index, total_stages) {
        (Some(_), Some(0)) => Some(0.0),
        (Some(index), Some(total)) => Some((index + 1) as f64 / total as f64 * 100.0),
        _ => None,
    }
}

async fn stage_event(
    State(state): State<SharedState>,
    Json(req): Json<StageEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let progress_percent = stage_progress(req.stage_index, req.total_stages);
    let stage = StageEvent {
        adw_id: req.adw_id,
        stage_name: req.stage_name,
        message: req.message,
        previous_stage: req.previous_stage,
        next_stage: req.next_stage,
        duration_ms: req.duration_ms,
        error: req.error,
        skip_reason: req.skip_reason,
        stage_index: req.stage_index,
        total_stages: req.total_stages,
        completed_stages: req.completed_stages,
        pending_stages: req.pending_stages,
        progress_percent,
        metadata: req.metadata,
    };
    let payload = EventPayload::stage(&req.event_type, stage).ok_or_else(|| {
        ApiError::BadRequest(format!("Unknown stage event type: {}", req.event_type))
    })?;

    state.connections.publish(&Event::new(payload));
    Ok(Json(json!({"status": "success", "message": "Stage event broadcasted"})))
}

#[derive(Deserialize)]
struct AgentStateUpdateRequest {
    adw_id: String,
    event_type: String,
    data: Value,
    #[allow(dead_code)]
    timestamp: String,
}

async fn agent_state_update(
    State(state): State<SharedState>,
    Json(req): Json<AgentStateUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Rehydrate the payload through the taxonomy: inject the adw_id into
    // the data object and deserialize the tagged pair. Unknown types are
    // logged and dropped (forward-compatible), not errors.
    let mut data = match req.data {
        Value::Object(map) => map,
        _ => {
            return Err(ApiError::BadRequest(
                "data must be a JSON object".to_string(),
            ));
        }
    };
    data.insert("adw_id".to_string(), Value::String(req.adw_id.clone()));

    let tagged = json!({"type": req.event_type, "data": Value::Object(data)});
    match serde_json::from_value::<EventPayload>(tagged) {
        Ok(payload) => {
            state.connections.publish(&Event::new(payload));
            Ok(Json(json!({"status": "success", "message": "Agent event broadcasted"})))
        }
        Err(e) => {
            warn!(
                adw_id = %req.adw_id,
                event_type = %req.event_type,
                error = %e,
                "dropping unparseable agent state update"
            );
            Ok(Json(json!({"status": "ignored", "message": "Unknown agent event type"})))
        }
    }
}

#[derive(Deserialize)]
struct PhaseTransitionRequest {
    adw_id: String,
    phase_to: String,
    #[serde(default)]
    phase_from: Option<String>,
    #[serde(default)]
    workflow_name: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn workflow_phase_transition(
    State(state): State<SharedState>,
    Json(req): Json<PhaseTransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    info!(
        adw_id = %req.adw_id,
        from = ?req.phase_from,
        to = %req.phase_to,
        "workflow phase transition"
    );
    state.connections.publish(&Event::new(EventPayload::WorkflowPhaseTransition {
        adw_id: req.adw_id,
        phase_from: req.phase_from,
        phase_to: req.phase_to,
        workflow_name: req.workflow_name,
        metadata: req.metadata.unwrap_or_else(|| json!({})),
    }));
    Ok(Json(json!({"status": "success", "message": "Phase transition broadcasted"})))
}

#[derive(Deserialize)]
struct OutputChunkRequest {
    adw_id: String,
    agent_role: String,
    content: String,
    #[serde(default)]
    line_number: Option<i64>,
    #[serde(default)]
    total_lines: Option<i64>,
    #[serde(default)]
    is_complete: bool,
}

async fn agent_output_chunk(
    State(state): State<SharedState>,
    Json(req): Json<OutputChunkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.connections.publish(&Event::new(EventPayload::AgentOutputChunk {
        adw_id: req.adw_id,
        agent_role: req.agent_role,
        content: req.content,
        line_number: req.line_number,
        total_lines: req.total_lines,
        is_complete: req.is_complete,
    }));
    Ok(Json(json!({"status": "success", "message": "Output chunk broadcasted"})))
}

#[derive(Deserialize)]
struct ScreenshotRequest {
    adw_id: String,
    screenshot_path: String,
    #[serde(default)]
    screenshot_type: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn screenshot_available(
    State(state): State<SharedState>,
    Json(req): Json<ScreenshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.connections.publish(&Event::new(EventPayload::ScreenshotAvailable {
        adw_id: req.adw_id,
        screenshot_path: req.screenshot_path,
        screenshot_type: req.screenshot_type,
        metadata: req.metadata.unwrap_or_else(|| json!({})),
    }));
    Ok(Json(json!({"status": "success", "message": "Screenshot broadcasted"})))
}

#[derive(Deserialize)]
struct SpecCreatedRequest {
    adw_id: String,
    spec_path: String,
    #[serde(default)]
    spec_type: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn spec_created(
    State(state): State<SharedState>,
    Json(req): Json<SpecCreatedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.connections.publish(&Event::new(EventPayload::SpecCreated {
        adw_id: req.adw_id,
        spec_path: req.spec_path,
        spec_type: req.spec_type,
        metadata: req.metadata.unwrap_or_else(|| json!({})),
    }));
    Ok(Json(json!({"status": "success", "message": "Spec creation broadcasted"})))
}

// ── Helpers shared with the control plane ─────────────────────────────

/// Send a `status_update` event to one connection.
pub fn send_status_update(
    connections: &ConnectionManager,
    connection_id: &str,
    adw_id: &str,
    workflow_name: &str,
    status: &str,
    message: &str,
) {
    connections.send_to(
        connection_id,
        &Event::new(EventPayload::StatusUpdate(StatusUpdate {
            adw_id: adw_id.to_string(),
            workflow_name: workflow_name.to_string(),
            status: status.to_string(),
            message: message.to_string(),
            timestamp: now_iso(),
            progress_percent: None,
            current_step: None,
        })),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_progress_derivation() {
        assert_eq!(stage_progress(Some(0), Some(5)), Some(20.0));
        assert_eq!(stage_progress(Some(4), Some(5)), Some(100.0));
        assert_eq!(stage_progress(Some(3), Some(0)), Some(0.0));
        assert_eq!(stage_progress(None, Some(5)), None);
        assert_eq!(stage_progress(Some(1), None), None);
    }

    #[test]
    fn test_store_error_mapping() {
        let conflict: ApiError = StoreError::Conflict("dup".to_string()).into();
        assert!(matches!(conflict, ApiError::Conflict(_)));
        let not_found: ApiError = StoreError::NotFound("gone".to_string()).into();
        assert!(matches!(not_found, ApiError::NotFound(_)));
        let contention: ApiError = StoreError::Contention("busy".to_string()).into();
        assert!(matches!(contention, ApiError::Conflict(_)));
    }
}

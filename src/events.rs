//! Event taxonomy for the broadcast bus.
//!
//! Every event crossing the bus serializes as `{"type": ..., "data": {...},
//! "timestamp": ...}`. The `type`/`data` pair is an adjacently tagged enum;
//! the timestamp is stamped once when the event is built. Unknown fields
//! inside a known payload are ignored on deserialization so workers can add
//! fields without breaking older servers.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of diff lines carried in a `file_changed` event.
const MAX_DIFF_LINES: usize = 1000;

/// Current UTC time as an RFC 3339 string with a trailing `Z`.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A bus event: tagged payload plus the moment it was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: String,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: now_iso(),
        }
    }
}

impl From<EventPayload> for Event {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    // ── Control ─────────────────────────────────────────────────────
    ConnectionAck {
        connection_id: String,
        connected_at: String,
        message: String,
    },
    Ping {},
    Pong {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<String>,
    },
    Heartbeat {
        active_connections: usize,
        server_status: String,
    },
    SessionRegistered {
        session_id: String,
        message: String,
    },
    Error(ErrorEnvelope),
    TriggerResponse(TriggerResponse),
    TicketNotificationResponse {
        status: String,
        ticket_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SystemLog {
        level: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(default)]
        context: Value,
    },

    // ── Workflow lifecycle ──────────────────────────────────────────
    StatusUpdate(StatusUpdate),
    WorkflowLog(WorkflowLog),
    WorkflowPhaseTransition {
        adw_id: String,
        #[serde(default)]
        phase_from: Option<String>,
        phase_to: String,
        #[serde(default)]
        workflow_name: Option<String>,
        #[serde(default)]
        metadata: Value,
    },
    StageStarted(StageEvent),
    StageCompleted(StageEvent),
    StageFailed(StageEvent),
    StageSkipped(StageEvent),
    WorkflowStarted(StageEvent),
    WorkflowCompleted(StageEvent),
    WorkflowFailed(StageEvent),
    AgentUpdated {
        adw_id: String,
        state: Value,
        changed_fields: Vec<String>,
    },
    AgentSummaryUpdate {
        adw_id: String,
        status: String,
        #[serde(default)]
        progress_percent: Option<f64>,
        #[serde(default)]
        current_step: Option<String>,
        #[serde(default)]
        workflow_name: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        metadata: Value,
    },

    // ── Agent output ────────────────────────────────────────────────
    ThinkingBlock {
        adw_id: String,
        content: String,
        #[serde(default)]
        reasoning_type: Option<String>,
        #[serde(default)]
        duration_ms: Option<i64>,
        #[serde(default)]
        sequence: Option<i64>,
    },
    TextBlock {
        adw_id: String,
        content: String,
        #[serde(default)]
        sequence: Option<i64>,
    },
    ToolUsePre {
        adw_id: String,
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    ToolUsePost {
        adw_id: String,
        tool_name: String,
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        tool_output: Option<String>,
        status: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        duration_ms: Option<i64>,
    },
    FileChanged {
        adw_id: String,
        file_path: String,
        operation: String,
        #[serde(default)]
        diff: Option<String>,
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        lines_added: i64,
        #[serde(default)]
        lines_removed: i64,
    },
    SummaryUpdate {
        adw_id: String,
        summary_type: String,
        content: String,
        #[serde(default)]
        related_file: Option<String>,
        #[serde(default)]
        metadata: Value,
    },
    AgentLog(AgentLog),
    AgentOutputChunk {
        adw_id: String,
        agent_role: String,
        content: String,
        #[serde(default)]
        line_number: Option<i64>,
        #[serde(default)]
        total_lines: Option<i64>,
        #[serde(default)]
        is_complete: bool,
    },
    ChatStream {
        adw_id: String,
        content: String,
        #[serde(default)]
        stream_type: Option<String>,
        #[serde(default)]
        is_complete: bool,
    },

    // ── Artifacts ───────────────────────────────────────────────────
    ScreenshotAvailable {
        adw_id: String,
        screenshot_path: String,
        #[serde(default)]
        screenshot_type: Option<String>,
        #[serde(default)]
        metadata: Value,
    },
    SpecCreated {
        adw_id: String,
        spec_path: String,
        #[serde(default)]
        spec_type: Option<String>,
        #[serde(default)]
        metadata: Value,
    },
}

/// Error envelope used on the control plane:
/// `{error_type, message, details?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            error_type: "validation_error".to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self {
            error_type: "rate_limit_error".to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self {
            error_type: "system_error".to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// Synchronous response to a `trigger_workflow` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
    pub adw_id: String,
    pub workflow_name: String,
    pub message: String,
    pub logs_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Workflow status update posted by workers.
///
/// The `timestamp` field is worker-supplied and required by the intake
/// contract; the envelope carries the server-side stamp separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub adw_id: String,
    pub workflow_name: String,
    pub status: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default)]
    pub progress_percent: Option<f64>,
    #[serde(default)]
    pub current_step: Option<String>,
}

/// Log line proxied from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLog {
    pub adw_id: String,
    pub workflow_name: String,
    pub message: String,
    pub level: String,
    pub timestamp: String,
}

/// Structured log line from an agent subdirectory (execution.log or
/// raw_output.jsonl system messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLog {
    pub adw_id: String,
    #[serde(default)]
    pub agent_role: Option<String>,
    pub message: String,
    pub level: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Stage lifecycle payload shared by all seven stage/workflow tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub adw_id: String,
    pub stage_name: String,
    pub message: String,
    #[serde(default)]
    pub previous_stage: Option<String>,
    #[serde(default)]
    pub next_stage: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub stage_index: Option<u32>,
    #[serde(default)]
    pub total_stages: Option<u32>,
    #[serde(default)]
    pub completed_stages: Option<Vec<String>>,
    #[serde(default)]
    pub pending_stages: Option<Vec<String>>,
    #[serde(default)]
    pub progress_percent: Option<f64>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl EventPayload {
    /// The workflow this event belongs to, when it is workflow-scoped.
    /// Control events (heartbeat, pong, ...) return `None` and are routed
    /// to every connection.
    pub fn adw_id(&self) -> Option<&str> {
        use EventPayload::*;
        match self {
            StatusUpdate(u) => Some(&u.adw_id),
            WorkflowLog(l) => Some(&l.adw_id),
            WorkflowPhaseTransition { adw_id, .. }
            | AgentUpdated { adw_id, .. }
            | AgentSummaryUpdate { adw_id, .. }
            | ThinkingBlock { adw_id, .. }
            | TextBlock { adw_id, .. }
            | ToolUsePre { adw_id, .. }
            | ToolUsePost { adw_id, .. }
            | FileChanged { adw_id, .. }
            | SummaryUpdate { adw_id, .. }
            | AgentOutputChunk { adw_id, .. }
            | ChatStream { adw_id, .. }
            | ScreenshotAvailable { adw_id, .. }
            | SpecCreated { adw_id, .. } => Some(adw_id),
            AgentLog(l) => Some(&l.adw_id),
            StageStarted(e) | StageCompleted(e) | StageFailed(e) | StageSkipped(e)
            | WorkflowStarted(e) | WorkflowCompleted(e) | WorkflowFailed(e) => Some(&e.adw_id),
            _ => None,
        }
    }

    /// Wrap a stage payload under the tag named by `event_type`.
    /// Unknown types are rejected so the intake can 400 them.
    pub fn stage(event_type: &str, event: StageEvent) -> Option<Self> {
        use EventPayload::*;
        Some(match event_type {
            "stage_started" => StageStarted(event),
            "stage_completed" => StageCompleted(event),
            "stage_failed" => StageFailed(event),
            "stage_skipped" => StageSkipped(event),
            "workflow_started" => WorkflowStarted(event),
            "workflow_completed" => WorkflowCompleted(event),
            "workflow_failed" => WorkflowFailed(event),
            _ => return None,
        })
    }
}

/// Cap a diff at [`MAX_DIFF_LINES`] lines, appending a marker line when
/// content was dropped.
pub fn truncate_diff(diff: &str) -> String {
    let mut lines = diff.lines();
    let kept: Vec<&str> = lines.by_ref().take(MAX_DIFF_LINES).collect();
    if lines.next().is_none() {
        return diff.to_string();
    }
    let mut out = kept.join("\n");
    out.push_str("\n... [diff truncated]");
    out
}

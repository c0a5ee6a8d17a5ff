use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdwStatus {
    Pending,
    InProgress,
    Completed,
    Errored,
    Stuck,
}

impl AdwStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Stuck => "stuck",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "stuck" => Ok(Self::Stuck),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdwStage {
    Backlog,
    Plan,
    Build,
    Test,
    Review,
    Document,
    ReadyToMerge,
    Completed,
    Errored,
}

impl AdwStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Document => "document",
            Self::ReadyToMerge => "ready-to-merge",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "plan" => Ok(Self::Plan),
            "build" => Ok(Self::Build),
            "test" => Ok(Self::Test),
            "review" => Ok(Self::Review),
            "document" => Ok(Self::Document),
            "ready-to-merge" => Ok(Self::ReadyToMerge),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSet {
    Base,
    Heavy,
}

impl ModelSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Heavy => "heavy",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "base" => Ok(Self::Base),
            "heavy" => Ok(Self::Heavy),
            _ => Err(format!("Invalid model set: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Github,
    Kanban,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Kanban => "kanban",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "github" => Ok(Self::Github),
            "kanban" => Ok(Self::Kanban),
            _ => Err(format!("Invalid data source: {}", s)),
        }
    }
}

/// One workflow execution. The single source of truth for an ADW.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdwRecord {
    pub id: i64,
    pub adw_id: String,
    pub issue_number: Option<i64>,
    pub issue_title: Option<String>,
    pub issue_body: Option<String>,
    /// Slash-command classification: `/feature`, `/bug`, `/chore`, `/patch`.
    pub issue_class: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub current_stage: AdwStage,
    pub status: AdwStatus,
    pub is_stuck: bool,
    pub workflow_name: Option<String>,
    pub model_set: ModelSet,
    pub data_source: DataSource,
    /// Opaque issue blob from the initiator; stored and relayed verbatim.
    pub issue_json: Option<Value>,
    /// Opaque multi-stage orchestration state; stored verbatim.
    pub orchestrator_state: Option<Value>,
    pub plan_file: Option<String>,
    pub all_adws: Option<Value>,
    pub patch_file: Option<String>,
    pub patch_history: Option<Value>,
    pub patch_source_mode: Option<String>,
    pub backend_port: Option<i64>,
    pub websocket_port: Option<i64>,
    pub frontend_port: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub deleted_at: Option<String>,
}

/// Fields accepted when creating a workflow record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdwCreate {
    pub adw_id: String,
    #[serde(default)]
    pub issue_number: Option<i64>,
    #[serde(default)]
    pub issue_title: Option<String>,
    #[serde(default)]
    pub issue_body: Option<String>,
    #[serde(default)]
    pub issue_class: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub current_stage: Option<AdwStage>,
    #[serde(default)]
    pub status: Option<AdwStatus>,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub model_set: Option<ModelSet>,
    #[serde(default)]
    pub data_source: Option<DataSource>,
    #[serde(default)]
    pub issue_json: Option<Value>,
    #[serde(default)]
    pub orchestrator_state: Option<Value>,
    #[serde(default)]
    pub backend_port: Option<i64>,
    #[serde(default)]
    pub websocket_port: Option<i64>,
    #[serde(default)]
    pub frontend_port: Option<i64>,
}

/// Partial update. Only listed columns may change; everything else is
/// maintained by the store (`updated_at`) or immutable (`adw_id`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdwUpdate {
    #[serde(default)]
    pub issue_number: Option<i64>,
    #[serde(default)]
    pub issue_title: Option<String>,
    #[serde(default)]
    pub issue_body: Option<String>,
    #[serde(default)]
    pub issue_class: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub current_stage: Option<AdwStage>,
    #[serde(default)]
    pub status: Option<AdwStatus>,
    #[serde(default)]
    pub is_stuck: Option<bool>,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub model_set: Option<ModelSet>,
    #[serde(default)]
    pub data_source: Option<DataSource>,
    #[serde(default)]
    pub issue_json: Option<Value>,
    #[serde(default)]
    pub orchestrator_state: Option<Value>,
    #[serde(default)]
    pub plan_file: Option<String>,
    #[serde(default)]
    pub patch_file: Option<String>,
    #[serde(default)]
    pub patch_history: Option<Value>,
    #[serde(default)]
    pub patch_source_mode: Option<String>,
    #[serde(default)]
    pub backend_port: Option<i64>,
    #[serde(default)]
    pub websocket_port: Option<i64>,
    #[serde(default)]
    pub frontend_port: Option<i64>,
    /// Setting this coerces `status = completed`.
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl AdwUpdate {
    pub fn is_empty(&self) -> bool {
        serde_json::to_value(self)
            .map(|v| {
                v.as_object()
                    .map(|o| o.values().all(Value::is_null))
                    .unwrap_or(true)
            })
            .unwrap_or(true)
    }
}

/// Filters for listing workflow records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdwFilters {
    pub status: Option<String>,
    pub stage: Option<String>,
    pub is_stuck: Option<bool>,
    #[serde(default)]
    pub include_deleted: bool,
}

/// One append-only activity log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub adw_id: String,
    pub event_type: String,
    pub event_data: Option<Value>,
    pub field_changed: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub user: Option<String>,
    pub workflow_step: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityCreate {
    pub event_type: String,
    #[serde(default)]
    pub event_data: Option<Value>,
    #[serde(default)]
    pub field_changed: Option<String>,
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub workflow_step: Option<String>,
}

/// One issue-tracker row binding an allocated number to a title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: i64,
    pub issue_number: i64,
    pub issue_title: String,
    pub project_id: String,
    pub adw_id: Option<String>,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

/// Request body for issue-number allocation.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueAllocate {
    pub issue_title: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub adw_id: Option<String>,
}

/// Result of the offline issue-number deduplication routine.
#[derive(Debug, Clone, Serialize)]
pub struct DedupReport {
    pub duplicates_found: usize,
    pub records_reassigned: usize,
    pub reassignments: Vec<Reassignment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reassignment {
    pub record_id: i64,
    pub adw_id: Option<String>,
    pub old_issue_number: i64,
    pub new_issue_number: i64,
    pub issue_title: String,
}

/// Store health snapshot for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub database_path: String,
    pub adw_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, ToSql, Transaction, params};
use serde_json::Value;
use tracing::{info, warn};

use super::models::*;
use super::{StoreError, state_file};
use crate::events::now_iso;

/// The workflow state database.
///
/// One `rusqlite::Connection` guarded by the surrounding [`super::DbHandle`].
/// Schema lives in code; a migrations table records applied versions so new
/// columns can be added to databases created by older builds.
pub struct AdwDb {
    conn: Connection,
    path: String,
    /// When false, every workflow save is mirrored to
    /// `agents/<adw_id>/adw_state.json` for legacy tooling.
    db_only: bool,
    agents_dir: PathBuf,
}

impl AdwDb {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let mut db = Self {
            conn,
            path: path.display().to_string(),
            db_only: true,
            agents_dir: PathBuf::from("agents"),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let mut db = Self {
            conn,
            path: ":memory:".to_string(),
            db_only: true,
            agents_dir: PathBuf::from("agents"),
        };
        db.init()?;
        Ok(db)
    }

    /// Enable dual-write mode: mirror workflow records under `agents_dir`.
    pub fn with_dual_write(mut self, agents_dir: PathBuf) -> Self {
        self.db_only = false;
        self.agents_dir = agents_dir;
        self
    }

    fn init(&mut self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.create_schema().context("Failed to create schema")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS schema_migrations (
                    version TEXT PRIMARY KEY,
                    description TEXT,
                    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                );

                CREATE TABLE IF NOT EXISTS adw_states (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    adw_id TEXT NOT NULL UNIQUE,
                    issue_number INTEGER,
                    issue_title TEXT,
                    issue_body TEXT,
                    issue_class TEXT,
                    branch_name TEXT,
                    worktree_path TEXT,
                    current_stage TEXT NOT NULL DEFAULT 'backlog',
                    status TEXT NOT NULL DEFAULT 'pending',
                    is_stuck INTEGER NOT NULL DEFAULT 0,
                    workflow_name TEXT,
                    model_set TEXT NOT NULL DEFAULT 'base',
                    data_source TEXT NOT NULL DEFAULT 'kanban',
                    issue_json TEXT,
                    orchestrator_state TEXT,
                    patch_file TEXT,
                    patch_history TEXT,
                    patch_source_mode TEXT,
                    backend_port INTEGER,
                    websocket_port INTEGER,
                    frontend_port INTEGER,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    completed_at TEXT,
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS adw_activity_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    adw_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    event_data TEXT,
                    field_changed TEXT,
                    old_value TEXT,
                    new_value TEXT,
                    user TEXT,
                    workflow_step TEXT,
                    timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                );

                CREATE TABLE IF NOT EXISTS issue_tracker (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_number INTEGER NOT NULL,
                    issue_title TEXT NOT NULL,
                    project_id TEXT NOT NULL DEFAULT 'default',
                    adw_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    deleted_at TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_issue_tracker_number
                    ON issue_tracker(issue_number);
                CREATE INDEX IF NOT EXISTS idx_adw_states_status ON adw_states(status);
                CREATE INDEX IF NOT EXISTS idx_adw_states_stage ON adw_states(current_stage);
                CREATE INDEX IF NOT EXISTS idx_activity_adw ON adw_activity_logs(adw_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Apply any unapplied in-code migrations, each adding columns that
    /// older databases are missing. Idempotent.
    fn run_migrations(&mut self) -> Result<()> {
        struct Migration {
            version: &'static str,
            columns: &'static [(&'static str, &'static str, &'static str)],
        }

        const MIGRATIONS: &[Migration] = &[Migration {
            version: "001_add_plan_file_all_adws",
            columns: &[
                ("adw_states", "plan_file", "TEXT"),
                ("adw_states", "all_adws", "TEXT"),
            ],
        }];

        let tx = self.conn.transaction()?;
        for migration in MIGRATIONS {
            let applied: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM schema_migrations WHERE version = ?1",
                    params![migration.version],
                    |row| row.get(0),
                )
                .optional()?;
            if applied.is_some() {
                continue;
            }

            for (table, column, col_type) in migration.columns {
                let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", table))?;
                let existing: Vec<String> = stmt
                    .query_map([], |row| row.get::<_, String>(1))?
                    .collect::<rusqlite::Result<_>>()?;
                if !existing.iter().any(|c| c == column) {
                    info!(table, column, "adding column via migration");
                    tx.execute(
                        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, col_type),
                        [],
                    )?;
                }
            }

            tx.execute(
                "INSERT INTO schema_migrations (version, description) VALUES (?1, ?2)",
                params![
                    migration.version,
                    format!(
                        "Added columns: {:?}",
                        migration.columns.iter().map(|c| c.1).collect::<Vec<_>>()
                    )
                ],
            )?;
            info!(version = migration.version, "migration applied");
        }
        tx.commit()?;
        Ok(())
    }

    // ── Workflow records ─────────────────────────────────────────────

    /// Insert a new workflow record. Conflicts on an existing `adw_id`, or
    /// on an `issue_number` already present in the tracker or a live
    /// workflow row. Appends a `workflow_started` activity entry.
    pub fn create_workflow(&mut self, create: &AdwCreate) -> Result<AdwRecord, StoreError> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM adw_states WHERE adw_id = ?1",
                params![create.adw_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::Conflict(format!(
                "ADW with ID {} already exists",
                create.adw_id
            )));
        }

        if let Some(issue_number) = create.issue_number {
            let taken: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM issue_tracker
                     WHERE issue_number = ?1 AND deleted_at IS NULL",
                    params![issue_number],
                    |row| row.get(0),
                )
                .optional()?;
            let taken_by_adw: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM adw_states
                     WHERE issue_number = ?1 AND deleted_at IS NULL",
                    params![issue_number],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() || taken_by_adw.is_some() {
                return Err(StoreError::Conflict(format!(
                    "Issue number {} already exists",
                    issue_number
                )));
            }
        }

        let issue_json = create.issue_json.as_ref().map(Value::to_string);
        let orchestrator_state = create.orchestrator_state.as_ref().map(Value::to_string);

        self.conn
            .execute(
                "INSERT INTO adw_states (
                    adw_id, issue_number, issue_title, issue_body, issue_class,
                    branch_name, worktree_path, current_stage, status,
                    workflow_name, model_set, data_source, issue_json,
                    orchestrator_state, backend_port, websocket_port, frontend_port
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    create.adw_id,
                    create.issue_number,
                    create.issue_title,
                    create.issue_body,
                    create.issue_class,
                    create.branch_name,
                    create.worktree_path,
                    create.current_stage.unwrap_or(AdwStage::Backlog).as_str(),
                    create.status.unwrap_or(AdwStatus::Pending).as_str(),
                    create.workflow_name,
                    create.model_set.unwrap_or(ModelSet::Base).as_str(),
                    create.data_source.unwrap_or(DataSource::Kanban).as_str(),
                    issue_json,
                    orchestrator_state,
                    create.backend_port,
                    create.websocket_port,
                    create.frontend_port,
                ],
            )
            .context("Failed to insert workflow record")?;

        self.conn
            .execute(
                "INSERT INTO adw_activity_logs (adw_id, event_type, event_data)
                 VALUES (?1, ?2, ?3)",
                params![
                    create.adw_id,
                    "workflow_started",
                    serde_json::json!({"created_from": "api", "timestamp": now_iso()})
                        .to_string()
                ],
            )
            .context("Failed to log creation activity")?;

        let record = self.fetch_workflow(&create.adw_id, true)?;
        self.mirror(&record);
        Ok(record)
    }

    pub fn get_workflow(&self, adw_id: &str) -> Result<AdwRecord, StoreError> {
        self.fetch_workflow(adw_id, false)
    }

    fn fetch_workflow(&self, adw_id: &str, include_deleted: bool) -> Result<AdwRecord, StoreError> {
        let sql = if include_deleted {
            format!("SELECT {} FROM adw_states WHERE adw_id = ?1", ADW_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM adw_states WHERE adw_id = ?1 AND deleted_at IS NULL",
                ADW_COLUMNS
            )
        };
        let row = self
            .conn
            .query_row(&sql, params![adw_id], map_adw_row)
            .optional()
            .context("Failed to query workflow record")?;
        match row {
            Some(raw) => Ok(raw.into_record()),
            None => Err(StoreError::NotFound(format!("ADW {} not found", adw_id))),
        }
    }

    pub fn list_workflows(&self, filters: &AdwFilters) -> Result<Vec<AdwRecord>, StoreError> {
        let mut sql = format!("SELECT {} FROM adw_states WHERE 1=1", ADW_COLUMNS);
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if !filters.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if let Some(status) = &filters.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.clone()));
        }
        if let Some(stage) = &filters.stage {
            sql.push_str(" AND current_stage = ?");
            args.push(Box::new(stage.clone()));
        }
        if let Some(is_stuck) = filters.is_stuck {
            sql.push_str(" AND is_stuck = ?");
            args.push(Box::new(if is_stuck { 1 } else { 0 }));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_workflows")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), map_adw_row)
            .context("Failed to query workflows")?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read workflow row")?.into_record());
        }
        Ok(records)
    }

    /// Apply a partial update. `updated_at` refreshes; setting
    /// `completed_at` coerces `status = completed` unless the update names
    /// a status itself.
    pub fn update_workflow(
        &mut self,
        adw_id: &str,
        update: &AdwUpdate,
    ) -> Result<AdwRecord, StoreError> {
        // Existence (and soft-delete) check up front.
        self.fetch_workflow(adw_id, false)?;

        if update.is_empty() {
            return self.fetch_workflow(adw_id, false);
        }

        let now = now_iso();
        let tx = self.conn.transaction()?;

        set_col(&tx, adw_id, "issue_number", &update.issue_number, &now)?;
        set_col(&tx, adw_id, "issue_title", &update.issue_title, &now)?;
        set_col(&tx, adw_id, "issue_body", &update.issue_body, &now)?;
        set_col(&tx, adw_id, "issue_class", &update.issue_class, &now)?;
        set_col(&tx, adw_id, "branch_name", &update.branch_name, &now)?;
        set_col(&tx, adw_id, "worktree_path", &update.worktree_path, &now)?;
        set_col(
            &tx,
            adw_id,
            "current_stage",
            &update.current_stage.map(|s| s.as_str().to_string()),
            &now,
        )?;
        set_col(
            &tx,
            adw_id,
            "status",
            &update.status.map(|s| s.as_str().to_string()),
            &now,
        )?;
        set_col(
            &tx,
            adw_id,
            "is_stuck",
            &update.is_stuck.map(|b| if b { 1 } else { 0 }),
            &now,
        )?;
        set_col(&tx, adw_id, "workflow_name", &update.workflow_name, &now)?;
        set_col(
            &tx,
            adw_id,
            "model_set",
            &update.model_set.map(|m| m.as_str().to_string()),
            &now,
        )?;
        set_col(
            &tx,
            adw_id,
            "data_source",
            &update.data_source.map(|d| d.as_str().to_string()),
            &now,
        )?;
        set_col(
            &tx,
            adw_id,
            "issue_json",
            &update.issue_json.as_ref().map(Value::to_string),
            &now,
        )?;
        set_col(
            &tx,
            adw_id,
            "orchestrator_state",
            &update.orchestrator_state.as_ref().map(Value::to_string),
            &now,
        )?;
        set_col(&tx, adw_id, "plan_file", &update.plan_file, &now)?;
        set_col(&tx, adw_id, "patch_file", &update.patch_file, &now)?;
        set_col(
            &tx,
            adw_id,
            "patch_history",
            &update.patch_history.as_ref().map(Value::to_string),
            &now,
        )?;
        set_col(
            &tx,
            adw_id,
            "patch_source_mode",
            &update.patch_source_mode,
            &now,
        )?;
        set_col(&tx, adw_id, "backend_port", &update.backend_port, &now)?;
        set_col(&tx, adw_id, "websocket_port", &update.websocket_port, &now)?;
        set_col(&tx, adw_id, "frontend_port", &update.frontend_port, &now)?;

        if let Some(completed_at) = &update.completed_at {
            set_col(&tx, adw_id, "completed_at", &Some(completed_at.clone()), &now)?;
            if update.status.is_none() {
                set_col(
                    &tx,
                    adw_id,
                    "status",
                    &Some("completed".to_string()),
                    &now,
                )?;
            }
        }

        tx.commit().context("Failed to commit workflow update")?;

        let record = self.fetch_workflow(adw_id, false)?;
        self.mirror(&record);
        Ok(record)
    }

    /// Soft-delete a workflow record.
    pub fn delete_workflow(&mut self, adw_id: &str) -> Result<(), StoreError> {
        self.fetch_workflow(adw_id, false)?;
        self.conn
            .execute(
                "UPDATE adw_states SET deleted_at = ?1, updated_at = ?1 WHERE adw_id = ?2",
                params![now_iso(), adw_id],
            )
            .context("Failed to soft-delete workflow")?;
        Ok(())
    }

    // ── Activity log ─────────────────────────────────────────────────

    pub fn append_activity(
        &mut self,
        adw_id: &str,
        entry: &ActivityCreate,
    ) -> Result<i64, StoreError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM adw_states WHERE adw_id = ?1",
                params![adw_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("ADW {} not found", adw_id)));
        }

        self.conn
            .execute(
                "INSERT INTO adw_activity_logs (
                    adw_id, event_type, event_data, field_changed,
                    old_value, new_value, user, workflow_step
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    adw_id,
                    entry.event_type,
                    entry.event_data.as_ref().map(Value::to_string),
                    entry.field_changed,
                    entry.old_value,
                    entry.new_value,
                    entry.user,
                    entry.workflow_step,
                ],
            )
            .context("Failed to insert activity log")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Paginated activity history, newest first. Returns (rows, total).
    pub fn list_activity(
        &self,
        adw_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<ActivityEntry>, i64), StoreError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM adw_states WHERE adw_id = ?1",
                params![adw_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("ADW {} not found", adw_id)));
        }

        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM adw_activity_logs WHERE adw_id = ?1",
                params![adw_id],
                |row| row.get(0),
            )
            .context("Failed to count activity")?;

        let offset = (page.max(1) - 1) * page_size;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, adw_id, event_type, event_data, field_changed,
                        old_value, new_value, user, workflow_step, timestamp
                 FROM adw_activity_logs
                 WHERE adw_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
            )
            .context("Failed to prepare list_activity")?;
        let rows = stmt
            .query_map(params![adw_id, page_size, offset], |row| {
                let event_data: Option<String> = row.get(3)?;
                Ok(ActivityEntry {
                    id: row.get(0)?,
                    adw_id: row.get(1)?,
                    event_type: row.get(2)?,
                    event_data: event_data.and_then(|s| parse_json_column(&s, "event_data")),
                    field_changed: row.get(4)?,
                    old_value: row.get(5)?,
                    new_value: row.get(6)?,
                    user: row.get(7)?,
                    workflow_step: row.get(8)?,
                    timestamp: row.get(9)?,
                })
            })
            .context("Failed to query activity")?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("Failed to read activity row")?);
        }
        Ok((entries, total))
    }

    // ── Stuck detection ──────────────────────────────────────────────

    /// Flag in-progress workflows whose `updated_at` is older than the
    /// threshold. Idempotent: already-flagged rows are skipped.
    pub fn detect_stuck(
        &mut self,
        threshold_minutes: i64,
        adw_id: Option<&str>,
    ) -> Result<usize, StoreError> {
        let threshold =
            (chrono::Utc::now() - chrono::Duration::minutes(threshold_minutes)).to_rfc3339_opts(
                chrono::SecondsFormat::Micros,
                true,
            );

        let count = match adw_id {
            Some(adw_id) => self
                .conn
                .execute(
                    "UPDATE adw_states SET is_stuck = 1
                     WHERE adw_id = ?1 AND status = 'in_progress'
                       AND updated_at < ?2 AND is_stuck = 0",
                    params![adw_id, threshold],
                )
                .context("Failed to flag stuck workflow")?,
            None => self
                .conn
                .execute(
                    "UPDATE adw_states SET is_stuck = 1
                     WHERE status = 'in_progress' AND updated_at < ?1 AND is_stuck = 0",
                    params![threshold],
                )
                .context("Failed to flag stuck workflows")?,
        };
        if count > 0 {
            info!(count, "flagged stuck workflows");
        }
        Ok(count)
    }

    // ── Issue tracker ────────────────────────────────────────────────

    pub fn get_issue(&self, issue_number: i64) -> Result<IssueRecord, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, issue_number, issue_title, project_id, adw_id, created_at, deleted_at
                 FROM issue_tracker WHERE issue_number = ?1 AND deleted_at IS NULL",
                params![issue_number],
                map_issue_row,
            )
            .optional()
            .context("Failed to query issue")?;
        row.ok_or_else(|| StoreError::NotFound(format!("Issue {} not found", issue_number)))
    }

    pub fn list_issues(
        &self,
        project_id: Option<&str>,
        include_deleted: bool,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<IssueRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT id, issue_number, issue_title, project_id, adw_id, created_at, deleted_at
             FROM issue_tracker WHERE 1=1",
        );
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if !include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if let Some(project_id) = project_id {
            sql.push_str(" AND project_id = ?");
            args.push(Box::new(project_id.to_string()));
        }
        sql.push_str(" ORDER BY issue_number DESC LIMIT ? OFFSET ?");
        args.push(Box::new(page_size));
        args.push(Box::new((page.max(1) - 1) * page_size));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_issues")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), map_issue_row)
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?);
        }
        Ok(issues)
    }

    /// Soft delete by default; `permanent` removes the row entirely.
    pub fn delete_issue(&mut self, issue_number: i64, permanent: bool) -> Result<(), StoreError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM issue_tracker WHERE issue_number = ?1",
                params![issue_number],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!(
                "Issue {} not found",
                issue_number
            )));
        }

        if permanent {
            self.conn
                .execute(
                    "DELETE FROM issue_tracker WHERE issue_number = ?1",
                    params![issue_number],
                )
                .context("Failed to delete issue")?;
        } else {
            self.conn
                .execute(
                    "UPDATE issue_tracker SET deleted_at = ?1 WHERE issue_number = ?2",
                    params![now_iso(), issue_number],
                )
                .context("Failed to soft-delete issue")?;
        }
        Ok(())
    }

    // ── Deduplication maintenance ────────────────────────────────────

    /// Repair legacy duplicate issue numbers in one transaction: the
    /// oldest row in each duplicate set keeps its number; every later row
    /// is reassigned to successive values past the current maximum, and a
    /// linked workflow record's `issue_number` is updated to match.
    pub fn deduplicate_issue_numbers(&mut self) -> Result<DedupReport, StoreError> {
        let tx = self.conn.transaction()?;
        let mut reassignments = Vec::new();

        let duplicates: Vec<i64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT issue_number FROM issue_tracker
                     GROUP BY issue_number HAVING COUNT(*) > 1
                     ORDER BY issue_number",
                )
                .context("Failed to prepare duplicate scan")?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .context("Failed to scan duplicates")?;
            rows.collect::<rusqlite::Result<_>>()
                .context("Failed to read duplicate rows")?
        };

        if duplicates.is_empty() {
            tx.commit()?;
            return Ok(DedupReport {
                duplicates_found: 0,
                records_reassigned: 0,
                reassignments: Vec::new(),
            });
        }

        let mut next_number: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(issue_number), 0) FROM issue_tracker",
                [],
                |row| row.get(0),
            )
            .context("Failed to read max issue number")?;
        next_number += 1;

        for issue_number in &duplicates {
            let records: Vec<(i64, Option<String>, String)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id, adw_id, issue_title FROM issue_tracker
                         WHERE issue_number = ?1
                         ORDER BY created_at ASC, id ASC",
                    )
                    .context("Failed to prepare duplicate set query")?;
                let rows = stmt
                    .query_map(params![issue_number], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .context("Failed to query duplicate set")?;
                rows.collect::<rusqlite::Result<_>>()
                    .context("Failed to read duplicate set")?
            };

            // The oldest record keeps the original number.
            for (record_id, adw_id, issue_title) in records.into_iter().skip(1) {
                let new_number = next_number;
                next_number += 1;

                tx.execute(
                    "UPDATE issue_tracker SET issue_number = ?1 WHERE id = ?2",
                    params![new_number, record_id],
                )
                .context("Failed to reassign issue number")?;

                if let Some(adw_id) = &adw_id {
                    tx.execute(
                        "UPDATE adw_states SET issue_number = ?1 WHERE adw_id = ?2",
                        params![new_number, adw_id],
                    )
                    .context("Failed to mirror reassignment into adw_states")?;
                }

                info!(
                    old = issue_number,
                    new = new_number,
                    record_id,
                    "reassigned duplicate issue number"
                );
                reassignments.push(Reassignment {
                    record_id,
                    adw_id,
                    old_issue_number: *issue_number,
                    new_issue_number: new_number,
                    issue_title,
                });
            }
        }

        tx.commit().context("Failed to commit deduplication")?;

        Ok(DedupReport {
            duplicates_found: duplicates.len(),
            records_reassigned: reassignments.len(),
            reassignments,
        })
    }

    // ── Health ───────────────────────────────────────────────────────

    pub fn health(&self) -> StoreHealth {
        match self
            .conn
            .query_row("SELECT COUNT(*) FROM adw_states", [], |row| {
                row.get::<_, i64>(0)
            }) {
            Ok(count) => StoreHealth {
                healthy: true,
                database_path: self.path.clone(),
                adw_count: Some(count),
                error: None,
            },
            Err(e) => StoreHealth {
                healthy: false,
                database_path: self.path.clone(),
                adw_count: None,
                error: Some(e.to_string()),
            },
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    pub(super) fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn mirror(&self, record: &AdwRecord) {
        if self.db_only {
            return;
        }
        if let Err(e) = state_file::write_state_mirror(&self.agents_dir, record) {
            warn!(adw_id = %record.adw_id, error = %e, "failed to mirror state file");
        }
    }
}

/// Column list shared by every workflow SELECT so row mapping stays in one
/// place.
const ADW_COLUMNS: &str = "id, adw_id, issue_number, issue_title, issue_body, issue_class, \
     branch_name, worktree_path, current_stage, status, is_stuck, workflow_name, \
     model_set, data_source, issue_json, orchestrator_state, plan_file, all_adws, \
     patch_file, patch_history, patch_source_mode, backend_port, websocket_port, \
     frontend_port, created_at, updated_at, completed_at, deleted_at";

/// Intermediate row for adw_states before string columns become typed
/// values.
struct AdwRow {
    id: i64,
    adw_id: String,
    issue_number: Option<i64>,
    issue_title: Option<String>,
    issue_body: Option<String>,
    issue_class: Option<String>,
    branch_name: Option<String>,
    worktree_path: Option<String>,
    current_stage: String,
    status: String,
    is_stuck: i64,
    workflow_name: Option<String>,
    model_set: String,
    data_source: String,
    issue_json: Option<String>,
    orchestrator_state: Option<String>,
    plan_file: Option<String>,
    all_adws: Option<String>,
    patch_file: Option<String>,
    patch_history: Option<String>,
    patch_source_mode: Option<String>,
    backend_port: Option<i64>,
    websocket_port: Option<i64>,
    frontend_port: Option<i64>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    deleted_at: Option<String>,
}

impl AdwRow {
    fn into_record(self) -> AdwRecord {
        AdwRecord {
            id: self.id,
            adw_id: self.adw_id,
            issue_number: self.issue_number,
            issue_title: self.issue_title,
            issue_body: self.issue_body,
            issue_class: self.issue_class,
            branch_name: self.branch_name,
            worktree_path: self.worktree_path,
            current_stage: AdwStage::from_str(&self.current_stage).unwrap_or(AdwStage::Backlog),
            status: AdwStatus::from_str(&self.status).unwrap_or(AdwStatus::Pending),
            is_stuck: self.is_stuck != 0,
            workflow_name: self.workflow_name,
            model_set: ModelSet::from_str(&self.model_set).unwrap_or(ModelSet::Base),
            data_source: DataSource::from_str(&self.data_source).unwrap_or(DataSource::Kanban),
            issue_json: self
                .issue_json
                .and_then(|s| parse_json_column(&s, "issue_json")),
            orchestrator_state: self
                .orchestrator_state
                .and_then(|s| parse_json_column(&s, "orchestrator_state")),
            plan_file: self.plan_file,
            all_adws: self
                .all_adws
                .and_then(|s| parse_json_column(&s, "all_adws")),
            patch_file: self.patch_file,
            patch_history: self
                .patch_history
                .and_then(|s| parse_json_column(&s, "patch_history")),
            patch_source_mode: self.patch_source_mode,
            backend_port: self.backend_port,
            websocket_port: self.websocket_port,
            frontend_port: self.frontend_port,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            deleted_at: self.deleted_at,
        }
    }
}

fn map_adw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdwRow> {
    Ok(AdwRow {
        id: row.get(0)?,
        adw_id: row.get(1)?,
        issue_number: row.get(2)?,
        issue_title: row.get(3)?,
        issue_body: row.get(4)?,
        issue_class: row.get(5)?,
        branch_name: row.get(6)?,
        worktree_path: row.get(7)?,
        current_stage: row.get(8)?,
        status: row.get(9)?,
        is_stuck: row.get(10)?,
        workflow_name: row.get(11)?,
        model_set: row.get(12)?,
        data_source: row.get(13)?,
        issue_json: row.get(14)?,
        orchestrator_state: row.get(15)?,
        plan_file: row.get(16)?,
        all_adws: row.get(17)?,
        patch_file: row.get(18)?,
        patch_history: row.get(19)?,
        patch_source_mode: row.get(20)?,
        backend_port: row.get(21)?,
        websocket_port: row.get(22)?,
        frontend_port: row.get(23)?,
        created_at: row.get(24)?,
        updated_at: row.get(25)?,
        completed_at: row.get(26)?,
        deleted_at: row.get(27)?,
    })
}

fn map_issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRecord> {
    Ok(IssueRecord {
        id: row.get(0)?,
        issue_number: row.get(1)?,
        issue_title: row.get(2)?,
        project_id: row.get(3)?,
        adw_id: row.get(4)?,
        created_at: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

/// Opaque JSON columns are stored verbatim; a corrupt blob is logged and
/// surfaced as absent rather than failing the read.
fn parse_json_column(raw: &str, column: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(column, error = %e, "failed to parse stored JSON column");
            None
        }
    }
}

/// Write one column when the update carries a value for it.
fn set_col<T: ToSql>(
    tx: &Transaction<'_>,
    adw_id: &str,
    column: &str,
    value: &Option<T>,
    now: &str,
) -> Result<(), StoreError> {
    if let Some(value) = value {
        tx.execute(
            &format!(
                "UPDATE adw_states SET {} = ?1, updated_at = ?2 WHERE adw_id = ?3",
                column
            ),
            params![value, now, adw_id],
        )
        .with_context(|| format!("Failed to update column {}", column))?;
    }
    Ok(())
}

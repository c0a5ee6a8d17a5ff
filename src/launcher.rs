//! Worker launcher: validate a trigger request, upsert the workflow
//! record, and detach a worker subprocess.
//!
//! Workers outlive the server. They are spawned in their own process group
//! with null stdio and a sanitized environment (only `PATH` plus the
//! contents of the configured `.env` file), then left alone — progress
//! flows back through the filesystem tree and the HTTP intake, never
//! through the child handle.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::events::TriggerResponse;
use crate::store::models::{AdwCreate, AdwUpdate, DataSource, ModelSet};
use crate::store::{DbHandle, StoreError};
use crate::workflows;

/// A workflow trigger request from the control plane or HTTP API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowTriggerRequest {
    #[serde(default)]
    pub workflow_type: String,
    #[serde(default)]
    pub adw_id: Option<String>,
    #[serde(default)]
    pub issue_number: Option<i64>,
    /// One of feature | bug | chore | patch; stored as `/<type>`.
    #[serde(default)]
    pub issue_type: Option<String>,
    /// Opaque issue blob from a kanban initiator.
    #[serde(default)]
    pub issue_json: Option<Value>,
    #[serde(default)]
    pub model_set: Option<String>,
}

const ISSUE_TYPES: &[&str] = &["feature", "bug", "chore", "patch"];

/// Validate a trigger request, returning the first failure.
pub fn validate_trigger(req: &WorkflowTriggerRequest) -> Result<(), String> {
    if !workflows::is_known(&req.workflow_type) {
        return Err(format!("Unknown workflow type: {}", req.workflow_type));
    }

    if workflows::is_dependent(&req.workflow_type) && req.adw_id.is_none() {
        return Err(format!(
            "{} is a dependent workflow that requires an existing ADW ID. \
             Provide an ADW ID in your request.",
            req.workflow_type
        ));
    }

    if let Some(issue_type) = &req.issue_type
        && !ISSUE_TYPES.contains(&issue_type.as_str())
    {
        return Err(format!("Invalid issue_type: {}", issue_type));
    }

    let has_issue_context = req.issue_number.is_some()
        || req.issue_type.is_some()
        || req.issue_json.is_some()
        || (workflows::is_dependent(&req.workflow_type) && req.adw_id.is_some());
    if workflows::requires_issue(&req.workflow_type) && !has_issue_context {
        return Err(format!(
            "{} requires either an issue_number, issue_type, or issue_json parameter, \
             or an existing adw_id for dependent workflows.",
            req.workflow_type
        ));
    }

    Ok(())
}

/// Generate a fresh 8-character alphanumeric workflow id.
pub fn make_adw_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct WorkerLauncher {
    config: ServerConfig,
}

impl WorkerLauncher {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Accept a validated request: upsert the workflow record, detach the
    /// worker, and answer with an accept token. Launch failures come back
    /// as a `status: "error"` response rather than an Err, so the control
    /// plane can relay them verbatim.
    pub async fn launch(
        &self,
        db: &DbHandle,
        req: &WorkflowTriggerRequest,
    ) -> Result<TriggerResponse, StoreError> {
        let adw_id = req.adw_id.clone().unwrap_or_else(make_adw_id);
        self.upsert_record(db, &adw_id, req).await?;

        let logs_path = format!("agents/{}/{}/", adw_id, req.workflow_type);
        match self.spawn_worker(&adw_id, req) {
            Ok(()) => {
                info!(
                    adw_id = %adw_id,
                    workflow = %req.workflow_type,
                    "background worker started"
                );
                Ok(TriggerResponse {
                    status: "accepted".to_string(),
                    adw_id: adw_id.clone(),
                    workflow_name: req.workflow_type.clone(),
                    message: format!("ADW {} triggered successfully", req.workflow_type),
                    logs_path,
                    error: None,
                })
            }
            Err(e) => {
                error!(adw_id = %adw_id, error = %e, "failed to launch workflow");
                Ok(TriggerResponse {
                    status: "error".to_string(),
                    adw_id,
                    workflow_name: req.workflow_type.clone(),
                    message: "Failed to trigger workflow".to_string(),
                    logs_path: String::new(),
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Reuse an existing record (refreshing the request-supplied fields)
    /// or create a new one.
    async fn upsert_record(
        &self,
        db: &DbHandle,
        adw_id: &str,
        req: &WorkflowTriggerRequest,
    ) -> Result<(), StoreError> {
        let adw_id = adw_id.to_string();
        let issue_class = req.issue_type.as_ref().map(|t| format!("/{}", t));
        let data_source = if req.issue_json.is_some() || req.issue_type.is_some() {
            DataSource::Kanban
        } else {
            DataSource::Github
        };
        let model_set = req
            .model_set
            .as_deref()
            .and_then(|m| ModelSet::from_str(m).ok())
            .unwrap_or(ModelSet::Base);
        let req = req.clone();

        db.call(move |db| {
            match db.get_workflow(&adw_id) {
                Ok(_) => {
                    db.update_workflow(
                        &adw_id,
                        &AdwUpdate {
                            issue_number: req.issue_number,
                            issue_class,
                            issue_json: req.issue_json.clone(),
                            model_set: Some(model_set),
                            data_source: Some(data_source),
                            workflow_name: Some(req.workflow_type.clone()),
                            ..Default::default()
                        },
                    )?;
                }
                Err(StoreError::NotFound(_)) => {
                    db.create_workflow(&AdwCreate {
                        adw_id: adw_id.clone(),
                        issue_number: req.issue_number,
                        issue_class,
                        issue_json: req.issue_json.clone(),
                        model_set: Some(model_set),
                        data_source: Some(data_source),
                        workflow_name: Some(req.workflow_type.clone()),
                        ..Default::default()
                    })?;
                }
                Err(e) => return Err(e),
            }
            Ok(())
        })
        .await
    }

    fn spawn_worker(&self, adw_id: &str, req: &WorkflowTriggerRequest) -> anyhow::Result<()> {
        let script = self
            .config
            .repo_root
            .join("adws")
            .join(format!("{}.py", req.workflow_type));

        let mut cmd = Command::new("uv");
        cmd.arg("run").arg(&script);
        if let Some(issue_number) = req.issue_number {
            cmd.arg(issue_number.to_string());
        }
        cmd.arg(adw_id);

        cmd.current_dir(&self.config.repo_root)
            .env_clear()
            .envs(self.worker_env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group so the worker survives server shutdown.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        // Reap the exit status off-thread; the server never blocks on it.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }

    /// Build the sanitized worker environment: `PATH`, the `.env` file's
    /// pairs, and `GH_TOKEN` derived from `GITHUB_PAT` when present.
    fn worker_env(&self) -> HashMap<String, String> {
        build_worker_env(&self.config.env_file, self.config.github_pat.as_deref())
    }
}

fn build_worker_env(env_file: &Path, github_pat: Option<&str>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }

    if env_file.exists() {
        match dotenvy::from_path_iter(env_file) {
            Ok(pairs) => {
                for pair in pairs {
                    match pair {
                        Ok((key, value)) => {
                            env.insert(key, value);
                        }
                        Err(e) => error!(error = %e, "malformed line in env file"),
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to read env file"),
        }
    }

    let pat = env
        .remove("GITHUB_PAT")
        .or_else(|| github_pat.map(str::to_string));
    if let Some(pat) = pat {
        env.insert("GH_TOKEN".to_string(), pat);
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AdwDb;

    fn trigger(workflow: &str) -> WorkflowTriggerRequest {
        WorkflowTriggerRequest {
            workflow_type: workflow.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_make_adw_id_shape() {
        let id = make_adw_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(make_adw_id(), make_adw_id());
    }

    #[test]
    fn test_unknown_workflow_rejected() {
        let err = validate_trigger(&trigger("adw_teleport_iso")).unwrap_err();
        assert!(err.contains("Unknown workflow type"));
    }

    #[test]
    fn test_dependent_workflow_requires_adw_id() {
        let mut req = trigger("adw_build_iso");
        req.issue_number = Some(3);
        let err = validate_trigger(&req).unwrap_err();
        assert!(err.contains("dependent workflow"));

        req.adw_id = Some("abcd1234".to_string());
        assert!(validate_trigger(&req).is_ok());
    }

    #[test]
    fn test_issue_context_required() {
        let req = trigger("adw_plan_iso");
        let err = validate_trigger(&req).unwrap_err();
        assert!(err.contains("issue_number"));

        let mut with_number = trigger("adw_plan_iso");
        with_number.issue_number = Some(12);
        assert!(validate_trigger(&with_number).is_ok());

        let mut with_type = trigger("adw_plan_iso");
        with_type.issue_type = Some("bug".to_string());
        assert!(validate_trigger(&with_type).is_ok());

        let mut with_json = trigger("adw_plan_iso");
        with_json.issue_json = Some(serde_json::json!({"id": 1}));
        assert!(validate_trigger(&with_json).is_ok());
    }

    #[test]
    fn test_adw_id_alone_satisfies_only_dependent_workflows() {
        // A fresh plan with only an adw_id still lacks issue context.
        let mut plan = trigger("adw_plan_iso");
        plan.adw_id = Some("abcd1234".to_string());
        assert!(validate_trigger(&plan).is_err());

        let mut build = trigger("adw_build_iso");
        build.adw_id = Some("abcd1234".to_string());
        assert!(validate_trigger(&build).is_ok());
    }

    #[test]
    fn test_invalid_issue_type_rejected() {
        let mut req = trigger("adw_plan_iso");
        req.issue_type = Some("enhancement".to_string());
        let err = validate_trigger(&req).unwrap_err();
        assert!(err.contains("Invalid issue_type"));
    }

    #[test]
    fn test_workflow_without_issue_requirement() {
        assert!(validate_trigger(&trigger("adw_merge_iso")).is_ok());
    }

    #[test]
    fn test_worker_env_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(
            &env_file,
            "GITHUB_PAT=ghp_secret\nCLAUDE_CODE_PATH=/usr/bin/claude\n",
        )
        .unwrap();

        // SAFETY: test-local marker variable, removed before assertions
        // elsewhere could observe it.
        unsafe { std::env::set_var("ADWD_TEST_LEAKY_VAR", "leak") };
        let env = build_worker_env(&env_file, None);
        unsafe { std::env::remove_var("ADWD_TEST_LEAKY_VAR") };

        assert!(env.contains_key("PATH"));
        assert_eq!(
            env.get("CLAUDE_CODE_PATH").map(String::as_str),
            Some("/usr/bin/claude")
        );
        assert_eq!(env.get("GH_TOKEN").map(String::as_str), Some("ghp_secret"));
        assert!(!env.contains_key("GITHUB_PAT"));
        assert!(!env.contains_key("ADWD_TEST_LEAKY_VAR"));
    }

    #[test]
    fn test_worker_env_pat_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "A=b\n").unwrap();

        let env = build_worker_env(&env_file, Some("ghp_from_config"));
        assert_eq!(
            env.get("GH_TOKEN").map(String::as_str),
            Some("ghp_from_config")
        );
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let db = DbHandle::new(AdwDb::new_in_memory().unwrap());
        let launcher = WorkerLauncher::new(ServerConfig::default());

        let mut req = trigger("adw_plan_iso");
        req.adw_id = Some("abcd1234".to_string());
        req.issue_type = Some("bug".to_string());
        launcher.upsert_record(&db, "abcd1234", &req).await.unwrap();

        let record = db
            .call(|db| db.get_workflow("abcd1234"))
            .await
            .unwrap();
        assert_eq!(record.issue_class.as_deref(), Some("/bug"));
        assert_eq!(record.data_source, DataSource::Kanban);
        assert_eq!(record.workflow_name.as_deref(), Some("adw_plan_iso"));

        // Second trigger for the same id updates in place.
        let mut again = trigger("adw_build_iso");
        again.adw_id = Some("abcd1234".to_string());
        again.issue_number = Some(42);
        launcher
            .upsert_record(&db, "abcd1234", &again)
            .await
            .unwrap();

        let record = db
            .call(|db| db.get_workflow("abcd1234"))
            .await
            .unwrap();
        assert_eq!(record.issue_number, Some(42));
        assert_eq!(record.workflow_name.as_deref(), Some("adw_build_iso"));
        assert_eq!(record.data_source, DataSource::Github);
    }
}

//! Legacy JSON mirror for dual-write mode.
//!
//! The database is authoritative; the mirror exists for operators and older
//! tooling that read `agents/<adw_id>/adw_state.json` directly. The file is
//! replaced atomically (temp file + rename) so the directory monitor never
//! observes a half-written snapshot.

use std::path::Path;

use anyhow::{Context, Result};

use super::models::AdwRecord;

pub const STATE_FILENAME: &str = "adw_state.json";

pub fn write_state_mirror(agents_dir: &Path, record: &AdwRecord) -> Result<()> {
    let workflow_dir = agents_dir.join(&record.adw_id);
    std::fs::create_dir_all(&workflow_dir)
        .with_context(|| format!("Failed to create {}", workflow_dir.display()))?;

    let target = workflow_dir.join(STATE_FILENAME);
    let tmp = workflow_dir.join(format!("{}.tmp", STATE_FILENAME));

    let json = serde_json::to_string_pretty(record).context("Failed to serialize state")?;
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &target)
        .with_context(|| format!("Failed to replace {}", target.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{AdwStage, AdwStatus, DataSource, ModelSet};

    fn sample_record() -> AdwRecord {
        AdwRecord {
            id: 1,
            adw_id: "abcd1234".to_string(),
            issue_number: Some(7),
            issue_title: Some("T".to_string()),
            issue_body: None,
            issue_class: None,
            branch_name: None,
            worktree_path: None,
            current_stage: AdwStage::Backlog,
            status: AdwStatus::Pending,
            is_stuck: false,
            workflow_name: None,
            model_set: ModelSet::Base,
            data_source: DataSource::Kanban,
            issue_json: None,
            orchestrator_state: None,
            plan_file: None,
            all_adws: None,
            patch_file: None,
            patch_history: None,
            patch_source_mode: None,
            backend_port: None,
            websocket_port: None,
            frontend_port: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn test_mirror_write_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = sample_record();
        write_state_mirror(dir.path(), &record).unwrap();

        let path = dir.path().join("abcd1234").join(STATE_FILENAME);
        let first: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(first["issue_number"], 7);

        record.issue_number = Some(8);
        write_state_mirror(dir.path(), &record).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(second["issue_number"], 8);

        // No temp file left behind.
        assert!(!dir
            .path()
            .join("abcd1234")
            .join(format!("{}.tmp", STATE_FILENAME))
            .exists());
    }
}

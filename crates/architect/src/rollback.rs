//! Backup-and-restore for proposal-mutated files.
//!
//! Backups are write-once: a dated directory per proposal execution with a
//! mirrored file tree and `metadata.json` written last, so a directory
//! without metadata is an aborted backup and is ignored.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use noema_store::{clock, Workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Active,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub proposal_id: String,
    pub timestamp: String,
    /// Workspace-relative paths that were requested for backup.
    pub files: Vec<String>,
    /// Requested paths that did not exist at backup time; rollback deletes
    /// them if the proposal created them since.
    pub missing_files: Vec<String>,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub status: RollbackStatus,
    pub restored_files: Vec<String>,
    pub error: Option<String>,
}

pub struct RollbackManager {
    workspace: Workspace,
    backups_root: PathBuf,
}

impl RollbackManager {
    pub fn new(workspace: Workspace) -> Self {
        let backups_root = workspace.backups_dir();
        Self {
            workspace,
            backups_root,
        }
    }

    /// Snapshot the given files before a proposal touches them. Absolute
    /// paths outside the workspace are skipped with a warning; files that do
    /// not exist yet are recorded in `missing_files`.
    pub fn backup(&self, file_paths: &[String], proposal_id: &str) -> Result<String> {
        let now = clock::now();
        let base_id = format!(
            "backup_{}_{proposal_id}",
            now.format("%Y%m%d_%H%M%S")
        );
        let mut backup_id = base_id.clone();
        let mut backup_path = self.backups_root.join(&backup_id);
        let mut suffix = 1;
        while backup_path.exists() {
            backup_id = format!("{base_id}_{suffix}");
            backup_path = self.backups_root.join(&backup_id);
            suffix += 1;
        }

        fs::create_dir_all(&backup_path)
            .with_context(|| format!("create backup directory {}", backup_path.display()))?;

        let mut files = Vec::new();
        let mut missing_files = Vec::new();
        for file_path in file_paths {
            let Some(rel) = self.workspace.relativize(std::path::Path::new(file_path)) else {
                warn!(path = %file_path, "skipping backup of out-of-workspace path");
                continue;
            };
            let rel_display = rel.display().to_string();
            files.push(rel_display.clone());

            let source = self.workspace.root().join(&rel);
            if !source.exists() {
                info!(path = %source.display(), "file missing at backup time, recorded only");
                missing_files.push(rel_display);
                continue;
            }

            let target = backup_path.join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(err) = fs::copy(&source, &target) {
                error!(source = %source.display(), %err, "failed to copy file into backup");
            }
        }

        let metadata = BackupMetadata {
            backup_id: backup_id.clone(),
            proposal_id: proposal_id.to_string(),
            timestamp: clock::format_iso(now),
            files,
            missing_files,
            status: BackupStatus::Active,
            rolled_back_at: None,
        };
        self.write_metadata(&backup_path, &metadata)?;
        Ok(backup_id)
    }

    /// Restore every file from the backup; delete files that were recorded
    /// as missing. Any per-file error accumulates into a failed report and
    /// the metadata stays `active`.
    pub fn rollback(&self, backup_id: &str) -> RollbackReport {
        let backup_path = self.backups_root.join(backup_id);
        if !backup_path.exists() {
            return failed("backup_not_found");
        }
        let Some(mut metadata) = self.read_metadata(&backup_path) else {
            return failed("metadata_not_found");
        };
        if metadata.status != BackupStatus::Active {
            return failed("already_rolled_back");
        }

        let mut restored = Vec::new();
        let mut errors = Vec::new();
        for rel in &metadata.files {
            let backup_file = backup_path.join(rel);
            let target = self.workspace.root().join(rel);

            if backup_file.exists() {
                let result = (|| -> std::io::Result<()> {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(&backup_file, &target)?;
                    Ok(())
                })();
                match result {
                    Ok(()) => restored.push(rel.clone()),
                    Err(err) => {
                        error!(path = %rel, %err, "failed to restore file");
                        errors.push(format!("restore_failed:{rel}"));
                    }
                }
            } else if metadata.missing_files.contains(rel) {
                if target.exists() {
                    if let Err(err) = fs::remove_file(&target) {
                        error!(path = %rel, %err, "failed to delete created file");
                        errors.push(format!("restore_failed:{rel}"));
                    }
                }
            } else {
                errors.push(format!("missing_backup_file:{rel}"));
            }
        }

        if !errors.is_empty() {
            return RollbackReport {
                status: RollbackStatus::Failed,
                restored_files: restored,
                error: Some(errors.join(";")),
            };
        }

        metadata.status = BackupStatus::RolledBack;
        metadata.rolled_back_at = Some(clock::now_iso());
        if self.write_metadata(&backup_path, &metadata).is_err() {
            return failed("metadata_update_failed");
        }

        RollbackReport {
            status: RollbackStatus::Success,
            restored_files: restored,
            error: None,
        }
    }

    /// Backup metadata, newest first.
    pub fn list_backups(&self, limit: usize) -> Vec<BackupMetadata> {
        let entries = match fs::read_dir(&self.backups_root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut backups: Vec<BackupMetadata> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| self.read_metadata(&path))
            .collect();
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        backups.truncate(limit);
        backups
    }

    /// Delete backups older than the retention cutoff, stale actives
    /// included.
    pub fn cleanup(&self, retention_days: i64) {
        let cutoff = clock::now() - Duration::days(retention_days);
        let Ok(entries) = fs::read_dir(&self.backups_root) else {
            return;
        };
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            if !path.is_dir() {
                continue;
            }
            let Some(metadata) = self.read_metadata(&path) else {
                continue;
            };
            let Some(timestamp) = clock::parse_iso(&metadata.timestamp) else {
                warn!(backup = %metadata.backup_id, "skipping cleanup of backup with bad timestamp");
                continue;
            };
            if timestamp < cutoff {
                match fs::remove_dir_all(&path) {
                    Ok(()) => info!(backup = %metadata.backup_id, "expired backup deleted"),
                    Err(err) => error!(backup = %metadata.backup_id, %err, "failed to delete backup"),
                }
            }
        }
    }

    /// Roll back the latest active backup for a proposal when the success
    /// rate degraded beyond the threshold. Returns whether a rollback ran
    /// and succeeded.
    pub fn auto_rollback_check(
        &self,
        proposal_id: &str,
        current_success_rate: f64,
        baseline_success_rate: f64,
        threshold: f64,
    ) -> bool {
        if baseline_success_rate <= 0.0 {
            return false;
        }
        let degradation = (baseline_success_rate - current_success_rate) / baseline_success_rate;
        if degradation <= threshold {
            return false;
        }

        let Some(backup_id) = self.latest_active_backup_for(proposal_id) else {
            warn!(proposal_id, "no active backup found for auto-rollback");
            return false;
        };
        self.rollback(&backup_id).status == RollbackStatus::Success
    }

    pub fn latest_active_backup_for(&self, proposal_id: &str) -> Option<String> {
        self.list_backups(1000)
            .into_iter()
            .find(|backup| {
                backup.proposal_id == proposal_id && backup.status == BackupStatus::Active
            })
            .map(|backup| backup.backup_id)
    }

    fn read_metadata(&self, backup_dir: &std::path::Path) -> Option<BackupMetadata> {
        let path = backup_dir.join("metadata.json");
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                error!(path = %path.display(), %err, "unreadable backup metadata");
                None
            }
        }
    }

    fn write_metadata(
        &self,
        backup_dir: &std::path::Path,
        metadata: &BackupMetadata,
    ) -> Result<()> {
        let path = backup_dir.join("metadata.json");
        fs::write(&path, serde_json::to_string_pretty(metadata)?)
            .with_context(|| format!("write metadata {}", path.display()))?;
        Ok(())
    }
}

fn failed(reason: &str) -> RollbackReport {
    RollbackReport {
        status: RollbackStatus::Failed,
        restored_files: Vec::new(),
        error: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use noema_store::Workspace;

    use super::{BackupStatus, RollbackManager, RollbackStatus};

    fn manager() -> (tempfile::TempDir, RollbackManager) {
        let dir = tempdir().unwrap();
        let manager = RollbackManager::new(Workspace::new(dir.path()));
        (dir, manager)
    }

    fn write_workspace_file(root: &std::path::Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn backup_then_modify_then_rollback_restores_original_bytes() {
        let (dir, manager) = manager();
        let rel = "rules/experience/x.md";
        write_workspace_file(dir.path(), rel, "original content");

        let backup_id = manager.backup(&[rel.to_string()], "prop_001").unwrap();
        write_workspace_file(dir.path(), rel, "# new");

        let report = manager.rollback(&backup_id);
        assert_eq!(report.status, RollbackStatus::Success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(rel)).unwrap(),
            "original content"
        );

        let metadata = manager.list_backups(10).remove(0);
        assert_eq!(metadata.status, BackupStatus::RolledBack);
        assert!(metadata.rolled_back_at.is_some());
    }

    #[test]
    fn rollback_deletes_files_that_were_missing_at_backup_time() {
        let (dir, manager) = manager();
        let rel = "rules/experience/created_later.md";

        let backup_id = manager.backup(&[rel.to_string()], "prop_002").unwrap();
        write_workspace_file(dir.path(), rel, "created by the proposal");

        let report = manager.rollback(&backup_id);
        assert_eq!(report.status, RollbackStatus::Success);
        assert!(!dir.path().join(rel).exists());
    }

    #[test]
    fn second_rollback_is_refused() {
        let (dir, manager) = manager();
        write_workspace_file(dir.path(), "a.md", "x");
        let backup_id = manager.backup(&["a.md".to_string()], "prop_003").unwrap();

        assert_eq!(manager.rollback(&backup_id).status, RollbackStatus::Success);
        let second = manager.rollback(&backup_id);
        assert_eq!(second.status, RollbackStatus::Failed);
        assert_eq!(second.error.as_deref(), Some("already_rolled_back"));
    }

    #[test]
    fn unknown_backup_id_fails_cleanly() {
        let (_dir, manager) = manager();
        let report = manager.rollback("backup_nope");
        assert_eq!(report.error.as_deref(), Some("backup_not_found"));
    }

    #[test]
    fn out_of_workspace_paths_are_skipped() {
        let (_dir, manager) = manager();
        let backup_id = manager
            .backup(&["/etc/passwd".to_string()], "prop_004")
            .unwrap();
        let metadata = manager.list_backups(10).remove(0);
        assert_eq!(metadata.backup_id, backup_id);
        assert!(metadata.files.is_empty());
    }

    #[test]
    fn colliding_backup_ids_get_a_numeric_suffix() {
        let (dir, manager) = manager();
        write_workspace_file(dir.path(), "a.md", "x");
        let first = manager.backup(&["a.md".to_string()], "prop_005").unwrap();
        let second = manager.backup(&["a.md".to_string()], "prop_005").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn auto_rollback_triggers_only_past_the_threshold() {
        let (dir, manager) = manager();
        write_workspace_file(dir.path(), "a.md", "original");
        let _backup_id = manager.backup(&["a.md".to_string()], "prop_006").unwrap();
        write_workspace_file(dir.path(), "a.md", "mutated");

        assert!(!manager.auto_rollback_check("prop_006", 0.78, 0.90, 0.20));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.md")).unwrap(),
            "mutated"
        );

        assert!(manager.auto_rollback_check("prop_006", 0.50, 0.90, 0.20));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.md")).unwrap(),
            "original"
        );

        assert!(!manager.auto_rollback_check("prop_006", 0.1, 0.0, 0.20));
    }

    #[test]
    fn list_backups_sorts_newest_first_and_limits() {
        let (dir, manager) = manager();
        write_workspace_file(dir.path(), "a.md", "x");
        for i in 0..3 {
            manager
                .backup(&["a.md".to_string()], &format!("prop_{i}"))
                .unwrap();
        }
        let backups = manager.list_backups(2);
        assert_eq!(backups.len(), 2);
        assert!(backups[0].timestamp >= backups[1].timestamp);
    }
}

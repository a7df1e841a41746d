//! Architect: reads the latest deep report and active signals, asks the
//! heavy model for proposals, classifies blast radius, gates execution, and
//! later validates or rolls back.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use noema_llm::{extract_json_array, LlmClient};
use noema_store::{clock, JsonlLog, Workspace};

use crate::council::run_council_review;
use crate::proposal::{BlastRadius, Proposal, ProposalStatus};
use crate::rollback::{RollbackManager, RollbackStatus};

const DIAGNOSE_SYSTEM: &str = "You are the Architect. You diagnose problems from the \
observer's report and design improvement proposals.\n\nFrom the report and active signals \
below, produce zero or more proposals.\n\nDiagnosis priority:\n\
1. error_pattern (highest)\n2. efficiency\n3. skill_gap\n4. preference (lowest)\n\n\
Output a JSON array of proposals in this shape:\n[\n  {\n    \"proposal_id\": \"prop_XXX\",\n\
    \"level\": 0,\n    \"trigger_source\": \"observer_report:YYYY-MM-DD\",\n\
    \"problem\": \"what is wrong\",\n    \"solution\": \"what to change\",\n\
    \"files_affected\": [\"rules/experience/task_strategies.md\"],\n\
    \"blast_radius\": \"trivial|small|medium|large\",\n\
    \"expected_effect\": \"expected outcome\",\n\
    \"verification_method\": \"how to verify\",\n    \"verification_days\": 5,\n\
    \"rollback_plan\": \"how to undo\",\n\
    \"new_content\": \"the new rule file content (markdown)\"\n  }\n]\n\n\
Return an empty array [] when nothing needs improving.\nOutput only JSON.";

const DESIGN_CONTENT_SYSTEM: &str = "You are the Architect. Produce the concrete new rule \
file content for the proposal below.\n\nOutput the full markdown content that should replace \
the target file. Output only markdown, no commentary.";

/// Max files per approval level; more than the level-2 cap forces level 3.
const MAX_FILES_PER_LEVEL: [usize; 3] = [1, 3, 5];

/// Outbound notification seam. The runtime implements this over the message
/// bus; absence or failure never changes proposal state.
#[async_trait]
pub trait ProposalNotifier: Send + Sync {
    /// A proposal waiting on the user (approval or discussion), with
    /// approve / reject / discuss actions attached.
    async fn proposal_pending(&self, proposal: &Proposal);
    /// A status note about a proposal (executed, council verdict).
    async fn proposal_update(&self, proposal: &Proposal, note: &str);
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ProposalStatus,
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    NotFound,
    /// The proposal is in a state verification does not apply to.
    Status(ProposalStatus),
    Verifying {
        remaining_days: i64,
    },
    Validated,
    RolledBack,
}

pub struct ArchitectEngine {
    workspace: Workspace,
    llm: Arc<dyn LlmClient>,
    model: String,
    rollback: Arc<RollbackManager>,
    notifier: Option<Arc<dyn ProposalNotifier>>,
    proposals_dir: PathBuf,
}

impl ArchitectEngine {
    pub fn new(
        workspace: Workspace,
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        rollback: Arc<RollbackManager>,
        notifier: Option<Arc<dyn ProposalNotifier>>,
    ) -> Self {
        let proposals_dir = workspace.proposals_dir();
        Self {
            workspace,
            llm,
            model: model.into(),
            rollback,
            notifier,
            proposals_dir,
        }
    }

    /// Read the newest deep report and the active signals, ask the model
    /// for proposals, persist and return them. No report means no work.
    pub async fn analyze_and_propose(&self) -> Vec<Proposal> {
        let Some((report_content, report_date)) = self.read_latest_report() else {
            return Vec::new();
        };
        let signals = JsonlLog::new(self.workspace.active_signals_log()).read_values();

        let user_message = format!(
            "=== Observer deep report ({report_date}) ===\n{report_content}\n\n\
             === Active signals ===\n{}\n",
            serde_json::to_string(&signals).unwrap_or_default(),
        );

        let raw = self
            .llm
            .complete(DIAGNOSE_SYSTEM, &user_message, &self.model, 3000)
            .await;
        if raw.is_empty() {
            error!("architect diagnosis call failed");
            return Vec::new();
        }

        let proposals: Vec<Proposal> = extract_json_array(&raw)
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter_map(|(index, value)| Proposal::from_llm_value(value, index, &report_date))
            .collect();

        for proposal in &proposals {
            self.save_proposal(proposal);
        }
        info!(count = proposals.len(), "architect proposals generated");
        proposals
    }

    /// Blast radius and file count jointly pick the approval level.
    pub fn determine_approval_level(&self, proposal: &Proposal) -> u8 {
        let files = proposal.files_affected.len();
        if files > MAX_FILES_PER_LEVEL[2] || proposal.blast_radius == BlastRadius::Large {
            return 3;
        }
        let radius_level = proposal.blast_radius.level();
        for level in 0..=2u8 {
            if files <= MAX_FILES_PER_LEVEL[level as usize] && radius_level <= level {
                return level;
            }
        }
        2
    }

    /// Run a proposal through the gate. Levels 0 and 1 execute now behind a
    /// backup; level 2 waits for approval, level 3 for discussion; level
    /// >= 2 gets a council review first.
    pub async fn execute_proposal(&self, mut proposal: Proposal) -> ExecutionOutcome {
        let level = self.determine_approval_level(&proposal);
        proposal.level = Some(level);

        if level >= 2 {
            let review = run_council_review(&proposal, self.llm.as_ref(), &self.model).await;
            proposal.council_review = Some(review.clone());
            self.save_proposal(&proposal);

            if review.is_rejected() {
                proposal.status = ProposalStatus::Rejected;
                self.save_proposal(&proposal);
                self.notify_update(&proposal, &format!("council rejected: {}", review.summary))
                    .await;
                return ExecutionOutcome {
                    status: ProposalStatus::Rejected,
                    backup_id: None,
                };
            }
            if review.needs_revision() {
                proposal.status = ProposalStatus::NeedsRevision;
                self.save_proposal(&proposal);
                self.notify_update(
                    &proposal,
                    &format!("council requests revision: {}", review.summary),
                )
                .await;
                return ExecutionOutcome {
                    status: ProposalStatus::NeedsRevision,
                    backup_id: None,
                };
            }
            // Approved by the council; human approval still gates levels 2
            // and 3 below.
            self.notify_update(&proposal, &format!("council approved: {}", review.summary))
                .await;
        }

        if level == 3 {
            proposal.status = ProposalStatus::PendingDiscussion;
            self.save_proposal(&proposal);
            self.notify_pending(&proposal).await;
            return ExecutionOutcome {
                status: ProposalStatus::PendingDiscussion,
                backup_id: None,
            };
        }
        if level == 2 {
            proposal.status = ProposalStatus::PendingApproval;
            self.save_proposal(&proposal);
            self.notify_pending(&proposal).await;
            return ExecutionOutcome {
                status: ProposalStatus::PendingApproval,
                backup_id: None,
            };
        }

        // Level 0 or 1: backup, then write.
        let mut backup_id = None;
        if !proposal.files_affected.is_empty() {
            match self
                .rollback
                .backup(&proposal.files_affected, &proposal.proposal_id)
            {
                Ok(id) => backup_id = Some(id),
                Err(err) => {
                    error!(proposal_id = %proposal.proposal_id, %err, "backup failed");
                    proposal.status = ProposalStatus::Failed;
                    self.save_proposal(&proposal);
                    return ExecutionOutcome {
                        status: ProposalStatus::Failed,
                        backup_id: None,
                    };
                }
            }
        }

        if let Err(err) = self.apply_changes(&mut proposal).await {
            error!(proposal_id = %proposal.proposal_id, %err, "apply changes failed");
            proposal.status = ProposalStatus::Failed;
            self.save_proposal(&proposal);
            return ExecutionOutcome {
                status: ProposalStatus::Failed,
                backup_id,
            };
        }

        proposal.status = ProposalStatus::Executed;
        proposal.executed_at = Some(clock::now_iso());
        proposal.backup_id = backup_id.clone();
        self.save_proposal(&proposal);

        if level == 1 {
            self.notify_update(&proposal, "executed").await;
        }
        ExecutionOutcome {
            status: ProposalStatus::Executed,
            backup_id,
        }
    }

    /// Check an executed proposal against its verification window. Past the
    /// window, either validate or roll back.
    pub async fn check_verification(&self, proposal_id: &str) -> VerificationOutcome {
        let Some(mut proposal) = self.load_proposal(proposal_id) else {
            return VerificationOutcome::NotFound;
        };
        if !matches!(
            proposal.status,
            ProposalStatus::Executed | ProposalStatus::Verifying
        ) {
            return VerificationOutcome::Status(proposal.status);
        }

        let executed_at = proposal.executed_at.as_deref().and_then(clock::parse_iso);
        let Some(executed_at) = executed_at else {
            proposal.status = ProposalStatus::Verifying;
            self.save_proposal(&proposal);
            return VerificationOutcome::Verifying {
                remaining_days: proposal.verification_days,
            };
        };

        let elapsed_days = (clock::now() - executed_at).num_days();
        if elapsed_days < proposal.verification_days {
            proposal.status = ProposalStatus::Verifying;
            self.save_proposal(&proposal);
            return VerificationOutcome::Verifying {
                remaining_days: proposal.verification_days - elapsed_days,
            };
        }

        if self.evaluate_effect() {
            proposal.status = ProposalStatus::Validated;
            self.save_proposal(&proposal);
            VerificationOutcome::Validated
        } else {
            if let Some(backup_id) = proposal.backup_id.clone() {
                let report = self.rollback.rollback(&backup_id);
                if report.status != RollbackStatus::Success {
                    warn!(
                        proposal_id,
                        error = ?report.error,
                        "rollback during verification reported failure"
                    );
                }
            }
            proposal.status = ProposalStatus::RolledBack;
            self.save_proposal(&proposal);
            VerificationOutcome::RolledBack
        }
    }

    /// Proposals still waiting on a decision.
    pub fn get_pending_proposals(&self) -> Vec<Proposal> {
        let entries = match fs::read_dir(&self.proposals_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        paths
            .into_iter()
            .filter_map(|path| {
                let raw = fs::read_to_string(&path).ok()?;
                serde_json::from_str::<Proposal>(&raw).ok()
            })
            .filter(|proposal| {
                matches!(
                    proposal.status,
                    ProposalStatus::New
                        | ProposalStatus::PendingApproval
                        | ProposalStatus::PendingDiscussion
                )
            })
            .collect()
    }

    /// Proposal ids currently inside their verification window.
    pub fn proposals_in_verification(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.proposals_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let raw = fs::read_to_string(&path).ok()?;
                serde_json::from_str::<Proposal>(&raw).ok()
            })
            .filter(|proposal| {
                matches!(
                    proposal.status,
                    ProposalStatus::Executed | ProposalStatus::Verifying
                )
            })
            .map(|proposal| proposal.proposal_id)
            .collect()
    }

    pub fn load_proposal(&self, proposal_id: &str) -> Option<Proposal> {
        let path = self.proposals_dir.join(format!("{proposal_id}.json"));
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(proposal) => Some(proposal),
            Err(err) => {
                error!(proposal_id, %err, "failed to parse proposal file");
                None
            }
        }
    }

    pub fn update_status(&self, proposal_id: &str, status: ProposalStatus) {
        if let Some(mut proposal) = self.load_proposal(proposal_id) {
            proposal.status = status;
            if status == ProposalStatus::Executed {
                proposal.executed_at = Some(clock::now_iso());
            }
            self.save_proposal(&proposal);
        }
    }

    pub fn save_proposal(&self, proposal: &Proposal) {
        if let Err(err) = fs::create_dir_all(&self.proposals_dir) {
            error!(%err, "failed to create proposals directory");
            return;
        }
        let path = self
            .proposals_dir
            .join(format!("{}.json", proposal.proposal_id));
        match serde_json::to_string_pretty(proposal) {
            Ok(raw) => {
                if let Err(err) = fs::write(&path, raw) {
                    error!(proposal_id = %proposal.proposal_id, %err, "failed to save proposal");
                }
            }
            Err(err) => error!(proposal_id = %proposal.proposal_id, %err, "unserializable proposal"),
        }
    }

    /// Verification heuristic, documented and deliberately simple: the
    /// change holds when no HIGH or CRITICAL signal is currently active.
    fn evaluate_effect(&self) -> bool {
        !JsonlLog::new(self.workspace.active_signals_log())
            .read_values()
            .iter()
            .any(|signal| {
                matches!(
                    signal.get("priority").and_then(|v| v.as_str()),
                    Some("HIGH") | Some("CRITICAL")
                )
            })
    }

    async fn apply_changes(&self, proposal: &mut Proposal) -> anyhow::Result<()> {
        let Some(target_rel) = proposal.files_affected.first().cloned() else {
            return Ok(());
        };

        if proposal.new_content.is_empty() {
            let generated = self
                .llm
                .complete(
                    DESIGN_CONTENT_SYSTEM,
                    &format!(
                        "Problem: {}\nSolution: {}\nTarget file: {target_rel}",
                        proposal.problem, proposal.solution
                    ),
                    &self.model,
                    1500,
                )
                .await;
            if generated.is_empty() {
                anyhow::bail!("model returned empty content, refusing to overwrite file");
            }
            proposal.new_content = generated;
        }

        // Writes only land strictly inside the workspace.
        let target = self.workspace.resolve(&target_rel)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &proposal.new_content)?;
        info!(path = %target.display(), "proposal content written");
        Ok(())
    }

    fn read_latest_report(&self) -> Option<(String, String)> {
        let entries = fs::read_dir(self.workspace.deep_reports_dir()).ok()?;
        let mut reports: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
            .collect();
        reports.sort();
        let latest = reports.pop()?;
        let date = latest.file_stem()?.to_string_lossy().to_string();
        match fs::read_to_string(&latest) {
            Ok(content) => Some((content, date)),
            Err(err) => {
                error!(path = %latest.display(), %err, "failed to read deep report");
                None
            }
        }
    }

    async fn notify_pending(&self, proposal: &Proposal) {
        if let Some(notifier) = &self.notifier {
            notifier.proposal_pending(proposal).await;
        }
    }

    async fn notify_update(&self, proposal: &Proposal, note: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.proposal_update(proposal, note).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use noema_llm::MockLlm;
    use noema_store::Workspace;

    use crate::proposal::{BlastRadius, Proposal, ProposalStatus};
    use crate::rollback::RollbackManager;

    use super::{ArchitectEngine, VerificationOutcome};

    fn engine(mock: MockLlm) -> (tempfile::TempDir, ArchitectEngine) {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let rollback = Arc::new(RollbackManager::new(workspace.clone()));
        let engine = ArchitectEngine::new(workspace, Arc::new(mock), "heavy", rollback, None);
        (dir, engine)
    }

    fn proposal(blast_radius: BlastRadius, files: &[&str]) -> Proposal {
        Proposal {
            proposal_id: "prop_20260225_120000_000001_001".to_string(),
            level: None,
            trigger_source: "observer_report:2026-02-25".to_string(),
            problem: "recurring timezone mistakes".to_string(),
            solution: "add a timezone rule".to_string(),
            files_affected: files.iter().map(|s| s.to_string()).collect(),
            blast_radius,
            expected_effect: "fewer corrections".to_string(),
            verification_method: "watch signals".to_string(),
            verification_days: 5,
            rollback_plan: "restore backup".to_string(),
            new_content: "# new".to_string(),
            status: ProposalStatus::New,
            created_at: noema_store::clock::now_iso(),
            executed_at: None,
            backup_id: None,
            council_review: None,
        }
    }

    #[test]
    fn approval_level_classifier_matches_the_table() {
        let (_dir, engine) = engine(MockLlm::new());

        let trivial = proposal(BlastRadius::Trivial, &["a.md"]);
        assert_eq!(engine.determine_approval_level(&trivial), 0);

        let small = proposal(BlastRadius::Small, &["a.md", "b.md"]);
        assert_eq!(engine.determine_approval_level(&small), 1);

        let medium = proposal(BlastRadius::Medium, &["a.md"]);
        assert_eq!(engine.determine_approval_level(&medium), 2);

        let large = proposal(BlastRadius::Large, &["a.md"]);
        assert_eq!(engine.determine_approval_level(&large), 3);

        let many = proposal(
            BlastRadius::Trivial,
            &["a.md", "b.md", "c.md", "d.md", "e.md", "f.md"],
        );
        assert_eq!(engine.determine_approval_level(&many), 3, "more than 5 files");

        // A trivial radius with 2 files outgrows level 0's one-file cap.
        let trivial_two = proposal(BlastRadius::Trivial, &["a.md", "b.md"]);
        assert_eq!(engine.determine_approval_level(&trivial_two), 1);
    }

    #[tokio::test]
    async fn level0_proposal_executes_with_a_backup() {
        let (dir, engine) = engine(MockLlm::new());
        let rel = "rules/experience/x.md";
        std::fs::create_dir_all(dir.path().join("rules/experience")).unwrap();
        std::fs::write(dir.path().join(rel), "old rule text").unwrap();

        let outcome = engine
            .execute_proposal(proposal(BlastRadius::Trivial, &[rel]))
            .await;

        assert_eq!(outcome.status, ProposalStatus::Executed);
        let backup_id = outcome.backup_id.expect("backup created");
        assert!(dir.path().join("backups").join(&backup_id).exists());
        assert_eq!(std::fs::read_to_string(dir.path().join(rel)).unwrap(), "# new");

        let saved = engine
            .load_proposal("prop_20260225_120000_000001_001")
            .unwrap();
        assert_eq!(saved.status, ProposalStatus::Executed);
        assert!(saved.executed_at.is_some());
        assert_eq!(saved.backup_id.as_deref(), Some(backup_id.as_str()));
    }

    #[tokio::test]
    async fn rollback_after_execution_restores_prior_bytes() {
        let (dir, engine) = engine(MockLlm::new());
        let rel = "rules/experience/x.md";
        std::fs::create_dir_all(dir.path().join("rules/experience")).unwrap();
        std::fs::write(dir.path().join(rel), "pre-proposal bytes").unwrap();

        let outcome = engine
            .execute_proposal(proposal(BlastRadius::Trivial, &[rel]))
            .await;
        let backup_id = outcome.backup_id.unwrap();

        let rollback = RollbackManager::new(Workspace::new(dir.path()));
        let report = rollback.rollback(&backup_id);
        assert_eq!(report.status, crate::rollback::RollbackStatus::Success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(rel)).unwrap(),
            "pre-proposal bytes"
        );
    }

    #[tokio::test]
    async fn path_traversal_in_a_proposal_fails_without_writing() {
        let (dir, engine) = engine(MockLlm::new());
        let outcome = engine
            .execute_proposal(proposal(BlastRadius::Trivial, &["../../outside.md"]))
            .await;
        assert_eq!(outcome.status, ProposalStatus::Failed);
        assert!(!dir.path().parent().unwrap().join("outside.md").exists());
    }

    #[tokio::test]
    async fn empty_generated_content_refuses_to_write() {
        let mock = MockLlm::new().with_response("heavy", "");
        let (dir, engine) = engine(mock);
        let rel = "rules/experience/x.md";
        std::fs::create_dir_all(dir.path().join("rules/experience")).unwrap();
        std::fs::write(dir.path().join(rel), "untouched").unwrap();

        let mut prop = proposal(BlastRadius::Trivial, &[rel]);
        prop.new_content = String::new();
        let outcome = engine.execute_proposal(prop).await;

        assert_eq!(outcome.status, ProposalStatus::Failed);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(rel)).unwrap(),
            "untouched"
        );
    }

    #[tokio::test]
    async fn level2_waits_for_approval_after_council_approves() {
        let mock = MockLlm::new().with_response(
            "heavy",
            "{\"conclusion\": \"approved\", \"summary\": \"fine\"}",
        );
        let (dir, engine) = engine(mock);
        let rel = "rules/experience/x.md";
        std::fs::create_dir_all(dir.path().join("rules/experience")).unwrap();
        std::fs::write(dir.path().join(rel), "kept").unwrap();

        let outcome = engine
            .execute_proposal(proposal(BlastRadius::Medium, &[rel]))
            .await;

        assert_eq!(outcome.status, ProposalStatus::PendingApproval);
        assert!(outcome.backup_id.is_none());
        assert_eq!(
            std::fs::read_to_string(dir.path().join(rel)).unwrap(),
            "kept",
            "no file mutation before human approval"
        );
        let saved = engine
            .load_proposal("prop_20260225_120000_000001_001")
            .unwrap();
        assert!(saved.council_review.is_some());
    }

    #[tokio::test]
    async fn council_rejection_persists_and_stops() {
        let mock = MockLlm::new().with_response(
            "heavy",
            "{\"conclusion\": \"rejected\", \"summary\": \"too risky\"}",
        );
        let (_dir, engine) = engine(mock);
        let outcome = engine
            .execute_proposal(proposal(BlastRadius::Medium, &["a.md"]))
            .await;
        assert_eq!(outcome.status, ProposalStatus::Rejected);
    }

    #[tokio::test]
    async fn level3_goes_to_discussion_without_execution() {
        let mock = MockLlm::new().with_response(
            "heavy",
            "{\"conclusion\": \"approved\", \"summary\": \"ok\"}",
        );
        let (_dir, engine) = engine(mock);
        let outcome = engine
            .execute_proposal(proposal(BlastRadius::Large, &["a.md"]))
            .await;
        assert_eq!(outcome.status, ProposalStatus::PendingDiscussion);
    }

    #[tokio::test]
    async fn verification_inside_the_window_reports_remaining_days() {
        let (_dir, engine) = engine(MockLlm::new());
        let mut prop = proposal(BlastRadius::Trivial, &[]);
        prop.status = ProposalStatus::Executed;
        prop.executed_at = Some(noema_store::clock::now_iso());
        engine.save_proposal(&prop);

        let outcome = engine.check_verification(&prop.proposal_id).await;
        assert_eq!(
            outcome,
            VerificationOutcome::Verifying { remaining_days: 5 }
        );
        let saved = engine.load_proposal(&prop.proposal_id).unwrap();
        assert_eq!(saved.status, ProposalStatus::Verifying);
    }

    #[tokio::test]
    async fn verification_past_the_window_validates_when_signals_are_calm() {
        let (_dir, engine) = engine(MockLlm::new());
        let mut prop = proposal(BlastRadius::Trivial, &[]);
        prop.status = ProposalStatus::Executed;
        let executed = noema_store::clock::now() - chrono::Duration::days(6);
        prop.executed_at = Some(noema_store::clock::format_iso(executed));
        engine.save_proposal(&prop);

        let outcome = engine.check_verification(&prop.proposal_id).await;
        assert_eq!(outcome, VerificationOutcome::Validated);
    }

    #[tokio::test]
    async fn verification_past_the_window_rolls_back_on_high_signals() {
        let (dir, engine) = engine(MockLlm::new());
        let rel = "rules/experience/x.md";
        std::fs::create_dir_all(dir.path().join("rules/experience")).unwrap();
        std::fs::write(dir.path().join(rel), "original").unwrap();

        let outcome = engine
            .execute_proposal(proposal(BlastRadius::Trivial, &[rel]))
            .await;
        let backup_id = outcome.backup_id.unwrap();

        // Age the execution past the verification window.
        let mut saved = engine
            .load_proposal("prop_20260225_120000_000001_001")
            .unwrap();
        let executed = noema_store::clock::now() - chrono::Duration::days(6);
        saved.executed_at = Some(noema_store::clock::format_iso(executed));
        engine.save_proposal(&saved);

        // A HIGH active signal marks the verification as failed.
        std::fs::create_dir_all(dir.path().join("signals")).unwrap();
        std::fs::write(
            dir.path().join("signals/active.jsonl"),
            "{\"signal_id\":\"sig_x\",\"signal_type\":\"task_failure\",\"priority\":\"HIGH\",\
             \"source\":\"s\",\"description\":\"d\",\"related_tasks\":[],\
             \"timestamp\":\"2026-02-25T10:00:00\",\"status\":\"active\"}\n",
        )
        .unwrap();

        let outcome = engine
            .check_verification("prop_20260225_120000_000001_001")
            .await;
        assert_eq!(outcome, VerificationOutcome::RolledBack);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(rel)).unwrap(),
            "original",
            "rollback restored the backup {backup_id}"
        );
    }

    #[tokio::test]
    async fn analyze_and_propose_reads_the_latest_report() {
        let proposals_json = serde_json::json!([{
            "problem": "timezone errors",
            "solution": "add rule",
            "files_affected": ["rules/experience/tz.md"],
            "blast_radius": "trivial",
            "new_content": "# tz",
        }]);
        let mock = MockLlm::new().with_response("heavy", proposals_json.to_string());
        let (dir, engine) = engine(mock);

        std::fs::create_dir_all(dir.path().join("observations/deep_reports")).unwrap();
        std::fs::write(
            dir.path().join("observations/deep_reports/2026-02-24.md"),
            "older report",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("observations/deep_reports/2026-02-25.md"),
            "newest report",
        )
        .unwrap();

        let proposals = engine.analyze_and_propose().await;
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].trigger_source, "observer_report:2026-02-25");
        assert!(dir
            .path()
            .join("architect/proposals")
            .join(format!("{}.json", proposals[0].proposal_id))
            .exists());
    }

    #[tokio::test]
    async fn no_deep_report_means_no_proposals() {
        let (_dir, engine) = engine(MockLlm::new());
        assert!(engine.analyze_and_propose().await.is_empty());
    }

    #[tokio::test]
    async fn pending_proposals_are_listed() {
        let (_dir, engine) = engine(MockLlm::new());
        let mut pending = proposal(BlastRadius::Medium, &["a.md"]);
        pending.status = ProposalStatus::PendingApproval;
        engine.save_proposal(&pending);

        let mut done = proposal(BlastRadius::Trivial, &["b.md"]);
        done.proposal_id = "prop_other".to_string();
        done.status = ProposalStatus::Executed;
        engine.save_proposal(&done);

        let listed = engine.get_pending_proposals();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].proposal_id, pending.proposal_id);
    }
}

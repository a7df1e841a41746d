//! Proposal records, persisted one JSON file each under
//! `architect/proposals/`.

use serde::{Deserialize, Serialize};

use noema_store::clock;

use crate::council::CouncilReview;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlastRadius {
    Trivial,
    Small,
    Medium,
    Large,
}

impl BlastRadius {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "trivial" => Some(Self::Trivial),
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    /// The approval level this radius maps to on its own.
    pub fn level(self) -> u8 {
        match self {
            Self::Trivial => 0,
            Self::Small => 1,
            Self::Medium => 2,
            Self::Large => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    New,
    PendingApproval,
    PendingDiscussion,
    Executed,
    Verifying,
    Validated,
    RolledBack,
    Rejected,
    NeedsRevision,
    Failed,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::PendingApproval => "pending_approval",
            Self::PendingDiscussion => "pending_discussion",
            Self::Executed => "executed",
            Self::Verifying => "verifying",
            Self::Validated => "validated",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
            Self::NeedsRevision => "needs_revision",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,
    /// Approval level, attached at execution time by the classifier.
    #[serde(default)]
    pub level: Option<u8>,
    pub trigger_source: String,
    pub problem: String,
    pub solution: String,
    #[serde(default)]
    pub files_affected: Vec<String>,
    pub blast_radius: BlastRadius,
    #[serde(default)]
    pub expected_effect: String,
    #[serde(default)]
    pub verification_method: String,
    pub verification_days: i64,
    #[serde(default)]
    pub rollback_plan: String,
    #[serde(default)]
    pub new_content: String,
    pub status: ProposalStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub council_review: Option<CouncilReview>,
}

impl Proposal {
    /// Build one proposal from a tolerantly-parsed model object, filling
    /// defaults for everything the model left out. The generated id carries
    /// microseconds so same-day runs never collide.
    pub fn from_llm_value(value: &serde_json::Value, index: usize, report_date: &str) -> Option<Self> {
        let object = value.as_object()?;
        let get_str = |key: &str| {
            object
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let proposal_id = object
            .get("proposal_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "prop_{}_{:03}",
                    chrono::Local::now().format("%Y%m%d_%H%M%S_%6f"),
                    index + 1
                )
            });

        let trigger_source = object
            .get("trigger_source")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("observer_report:{report_date}"));

        Some(Self {
            proposal_id,
            level: object.get("level").and_then(|v| v.as_u64()).map(|v| v as u8),
            trigger_source,
            problem: get_str("problem"),
            solution: get_str("solution"),
            files_affected: object
                .get("files_affected")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            blast_radius: object
                .get("blast_radius")
                .and_then(|v| v.as_str())
                .and_then(BlastRadius::parse)
                .unwrap_or(BlastRadius::Small),
            expected_effect: get_str("expected_effect"),
            verification_method: get_str("verification_method"),
            verification_days: object
                .get("verification_days")
                .and_then(|v| v.as_i64())
                .unwrap_or(5),
            rollback_plan: get_str("rollback_plan"),
            new_content: get_str("new_content"),
            status: ProposalStatus::New,
            created_at: clock::now_iso(),
            executed_at: None,
            backup_id: None,
            council_review: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{BlastRadius, Proposal, ProposalStatus};

    #[test]
    fn llm_value_fills_missing_fields_with_defaults() {
        let value = serde_json::json!({
            "problem": "timezone errors keep recurring",
            "solution": "add a timezone checklist rule",
            "files_affected": ["rules/experience/timezones.md"],
            "blast_radius": "trivial",
            "new_content": "# Timezones\n\nAlways confirm the offset.",
        });
        let proposal = Proposal::from_llm_value(&value, 0, "2026-02-25").unwrap();

        assert!(proposal.proposal_id.starts_with("prop_"));
        assert_eq!(proposal.trigger_source, "observer_report:2026-02-25");
        assert_eq!(proposal.status, ProposalStatus::New);
        assert_eq!(proposal.blast_radius, BlastRadius::Trivial);
        assert_eq!(proposal.verification_days, 5);
    }

    #[test]
    fn unknown_blast_radius_defaults_to_small() {
        let value = serde_json::json!({"problem": "p", "blast_radius": "apocalyptic"});
        let proposal = Proposal::from_llm_value(&value, 0, "2026-02-25").unwrap();
        assert_eq!(proposal.blast_radius, BlastRadius::Small);
    }

    #[test]
    fn non_object_values_are_rejected() {
        assert!(Proposal::from_llm_value(&serde_json::json!("nope"), 0, "d").is_none());
    }

    #[test]
    fn status_round_trips_through_serde() {
        let value = serde_json::to_value(ProposalStatus::PendingApproval).unwrap();
        assert_eq!(value, "pending_approval");
        let back: ProposalStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back, ProposalStatus::PendingApproval);
    }
}

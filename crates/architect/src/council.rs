//! Multi-role proposal review. One model plays four reviewers in a fixed
//! order, then a final call produces the conclusion. A single role failing
//! leaves a stub and the review continues.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use noema_llm::{extract_json_object, LlmClient};

use crate::proposal::Proposal;

const ROLES: &[(&str, &str, &str)] = &[
    (
        "safety",
        "Safety Reviewer",
        "You are the safety reviewer of a self-improving agent system. Assess the proposal's \
         safety and risk.\nFocus:\n- Rollback feasibility: can the change be undone cleanly if \
         it fails?\n- Boundaries: could the change affect core behaviour?\n- Data safety: any \
         risk of losing or leaking data?\n- Degradation: does the system stay stable in edge \
         cases?\n\nAnalyze the proposal and reply with your concern and recommendation.",
    ),
    (
        "efficiency",
        "Efficiency Reviewer",
        "You are the efficiency reviewer of a self-improving agent system. Assess cost and \
         efficiency impact.\nFocus:\n- Token cost: how much extra model spend does this add?\n\
         - Latency: does it slow down replies?\n- Resource footprint: CPU, memory, storage.\n\
         - Value for money: is the payoff worth the cost?\n\nAnalyze the proposal and reply \
         with your concern and recommendation.",
    ),
    (
        "user_experience",
        "User Experience Reviewer",
        "You are the user-experience reviewer of a self-improving agent system. Assess the \
         proposal from the user's side.\nFocus:\n- Perceived improvement: will the user notice?\n\
         - Conversation quality: better or worse dialogue?\n- Notifications: sensible frequency \
         and timing?\n- Learning cost: does the user have to adapt?\n\nAnalyze the proposal and \
         reply with your concern and recommendation.",
    ),
    (
        "long_term",
        "Long-term Reviewer",
        "You are the long-term planning reviewer of a self-improving agent system. Assess the \
         proposal's architectural direction.\nFocus:\n- Technical debt: does it introduce any?\n\
         - Extensibility: will future changes require rework?\n- Consistency: does it fit the \
         overall design?\n- Maintainability: is it easy to understand later?\n\nAnalyze the \
         proposal and reply with your concern and recommendation.",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Approved,
    NeedsRevision,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilMemberReview {
    pub role: String,
    pub name: String,
    pub concern: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilReview {
    pub proposal_id: String,
    pub reviews: Vec<CouncilMemberReview>,
    pub conclusion: Conclusion,
    pub summary: String,
}

impl CouncilReview {
    pub fn is_approved(&self) -> bool {
        self.conclusion == Conclusion::Approved
    }
    pub fn needs_revision(&self) -> bool {
        self.conclusion == Conclusion::NeedsRevision
    }
    pub fn is_rejected(&self) -> bool {
        self.conclusion == Conclusion::Rejected
    }
}

/// Run the four-role review plus the conclusion call. Never fails: role
/// failures become stubs, an unparsable conclusion defaults to
/// needs_revision.
pub async fn run_council_review(
    proposal: &Proposal,
    llm: &dyn LlmClient,
    model: &str,
) -> CouncilReview {
    let proposal_text = build_proposal_text(proposal);
    let mut review = CouncilReview {
        proposal_id: proposal.proposal_id.clone(),
        reviews: Vec::with_capacity(ROLES.len()),
        conclusion: Conclusion::NeedsRevision,
        summary: String::new(),
    };

    for (role, name, system_prompt) in ROLES {
        let response = llm.complete(system_prompt, &proposal_text, model, 1000).await;
        let (concern, recommendation) = if response.is_empty() {
            error!(role, "council member call failed");
            (
                "review failed: model unavailable".to_string(),
                "no specific recommendation".to_string(),
            )
        } else {
            parse_member_response(&response)
        };
        review.reviews.push(CouncilMemberReview {
            role: (*role).to_string(),
            name: (*name).to_string(),
            concern,
            recommendation,
        });
    }

    let reviews_text = review
        .reviews
        .iter()
        .map(|member| {
            format!(
                "[{}]\nConcern: {}\nRecommendation: {}",
                member.name, member.concern, member.recommendation
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let conclusion_system = "You chair the review council of a self-improving agent system. \
         Based on the four reviews below, give the final verdict.\n\
         The conclusion must be exactly one of: \"approved\", \"needs_revision\", \"rejected\".\n\
         Respond with JSON: {\"conclusion\": \"...\", \"summary\": \"overall summary\"}";
    let conclusion_user = format!("Proposal: {proposal_text}\n\nReviews:\n{reviews_text}");

    let response = llm.complete(conclusion_system, &conclusion_user, model, 600).await;
    let (conclusion, summary) = parse_conclusion_response(&response);
    review.conclusion = conclusion;
    review.summary = summary;

    info!(
        proposal_id = %review.proposal_id,
        conclusion = ?review.conclusion,
        reviews = review.reviews.len(),
        "council review complete"
    );
    review
}

fn build_proposal_text(proposal: &Proposal) -> String {
    let files = proposal.files_affected.join(", ");
    format!(
        "Proposal id: {}\n\nProblem:\n{}\n\nSolution:\n{}\n\nFiles affected: {}\n\n\
         Blast radius: {}\nExpected effect: {}",
        proposal.proposal_id,
        proposal.problem,
        proposal.solution,
        if files.is_empty() { "none" } else { &files },
        proposal.blast_radius.as_str(),
        proposal.expected_effect,
    )
}

/// Pull `concern:` / `recommendation:` out of free text. When neither label
/// is present, the whole response becomes the concern.
fn parse_member_response(text: &str) -> (String, String) {
    let recommendation_re =
        Regex::new(r"(?is)recommendation\s*[:：]\s*(.+)").expect("recommendation regex");
    let concern_re = Regex::new(r"(?is)concern\s*[:：]\s*(.+)").expect("concern regex");

    let (recommendation, concern_region_end) = match recommendation_re.captures(text) {
        Some(captures) => (
            captures[1].trim().to_string(),
            captures.get(0).map(|m| m.start()).unwrap_or(text.len()),
        ),
        None => (String::new(), text.len()),
    };

    let concern = concern_re
        .captures(&text[..concern_region_end])
        .map(|captures| captures[1].trim().to_string())
        .unwrap_or_default();

    if concern.is_empty() {
        (
            text.trim().to_string(),
            "no specific recommendation".to_string(),
        )
    } else {
        (concern, recommendation)
    }
}

fn parse_conclusion_response(text: &str) -> (Conclusion, String) {
    if let Some(parsed) = extract_json_object(text) {
        let summary = parsed
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match parsed.get("conclusion").and_then(|v| v.as_str()) {
            Some("approved") => return (Conclusion::Approved, summary),
            Some("needs_revision") => return (Conclusion::NeedsRevision, summary),
            Some("rejected") => return (Conclusion::Rejected, summary),
            _ => {}
        }
    }
    warn!("could not parse council conclusion, defaulting to needs_revision");
    (Conclusion::NeedsRevision, String::new())
}

#[cfg(test)]
mod tests {
    use noema_llm::MockLlm;
    use noema_store::clock;

    use crate::proposal::{BlastRadius, Proposal, ProposalStatus};

    use super::{parse_conclusion_response, parse_member_response, run_council_review, Conclusion};

    fn proposal() -> Proposal {
        Proposal {
            proposal_id: "prop_test_001".to_string(),
            level: None,
            trigger_source: "observer_report:2026-02-25".to_string(),
            problem: "token usage climbing".to_string(),
            solution: "trim the memory section".to_string(),
            files_affected: vec!["rules/experience/memory.md".to_string()],
            blast_radius: BlastRadius::Medium,
            expected_effect: "lower spend".to_string(),
            verification_method: "watch token totals".to_string(),
            verification_days: 5,
            rollback_plan: "restore backup".to_string(),
            new_content: String::new(),
            status: ProposalStatus::New,
            created_at: clock::now_iso(),
            executed_at: None,
            backup_id: None,
            council_review: None,
        }
    }

    #[test]
    fn member_response_with_labels_parses_both_parts() {
        let (concern, recommendation) = parse_member_response(
            "Concern: the trim might drop relevant context.\nRecommendation: cap instead of cut.",
        );
        assert_eq!(concern, "the trim might drop relevant context.");
        assert_eq!(recommendation, "cap instead of cut.");
    }

    #[test]
    fn unlabeled_member_response_becomes_the_concern() {
        let (concern, recommendation) = parse_member_response("Looks risky overall.");
        assert_eq!(concern, "Looks risky overall.");
        assert_eq!(recommendation, "no specific recommendation");
    }

    #[test]
    fn conclusion_parses_from_fenced_json() {
        let (conclusion, summary) = parse_conclusion_response(
            "```json\n{\"conclusion\": \"approved\", \"summary\": \"low risk\"}\n```",
        );
        assert_eq!(conclusion, Conclusion::Approved);
        assert_eq!(summary, "low risk");
    }

    #[test]
    fn invalid_conclusion_defaults_to_needs_revision() {
        let (conclusion, _) =
            parse_conclusion_response("{\"conclusion\": \"maybe\", \"summary\": \"?\"}");
        assert_eq!(conclusion, Conclusion::NeedsRevision);
        let (conclusion, _) = parse_conclusion_response("not json");
        assert_eq!(conclusion, Conclusion::NeedsRevision);
    }

    #[tokio::test]
    async fn review_collects_all_four_roles_in_order() {
        let mock = MockLlm::new().with_response(
            "heavy",
            "Concern: fine.\nRecommendation: ship it.",
        );
        let review = run_council_review(&proposal(), &mock, "heavy").await;

        assert_eq!(review.reviews.len(), 4);
        let roles: Vec<&str> = review.reviews.iter().map(|r| r.role.as_str()).collect();
        assert_eq!(roles, vec!["safety", "efficiency", "user_experience", "long_term"]);
        // The conclusion call got non-JSON, so the default applies.
        assert_eq!(review.conclusion, Conclusion::NeedsRevision);
        assert_eq!(mock.call_count(), 5, "four roles plus the conclusion");
    }

    #[tokio::test]
    async fn failed_members_leave_stubs_and_review_continues() {
        let mock = MockLlm::new().with_response("heavy", "");
        let review = run_council_review(&proposal(), &mock, "heavy").await;
        assert_eq!(review.reviews.len(), 4);
        assert!(review.reviews[0].concern.contains("review failed"));
        assert_eq!(review.conclusion, Conclusion::NeedsRevision);
    }
}

//! Rule loading, relevance scoring, and prompt section building.
//!
//! Rule files are plain markdown, no front matter. The name comes from the
//! filename stem, the tier from the directory, and keywords from the
//! headings. Constitution rules are always injected; experience rules are
//! scored against the task and included within budget.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{info, warn};

use crate::score::bigram_bonus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTier {
    Constitution,
    Experience,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub file_path: PathBuf,
    pub name: String,
    pub tier: RuleTier,
    pub content: String,
}

impl Rule {
    /// Heading words, used as relevance keywords.
    pub fn keywords(&self) -> Vec<String> {
        let heading = Regex::new(r"(?m)^#+\s+(.+)$").expect("heading regex");
        heading
            .captures_iter(&self.content)
            .flat_map(|cap| {
                cap[1]
                    .trim()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Coarse token estimate: two characters per token handles mixed
    /// CJK/ASCII rule text acceptably.
    pub fn token_estimate(&self) -> usize {
        self.content.chars().count() / 2
    }
}

/// Output of [`RulesInterpreter::build_section`].
#[derive(Debug, Clone, Default)]
pub struct RuleSections {
    pub constitution_prompt: String,
    pub experience_prompt: String,
    pub constitution_tokens: usize,
    pub experience_tokens: usize,
    pub rules_used: Vec<String>,
}

#[derive(Debug)]
pub struct RulesInterpreter {
    rules_dir: PathBuf,
    constitution: Vec<Rule>,
    experience: Vec<Rule>,
}

impl RulesInterpreter {
    /// Load rules from `<rules_dir>/constitution` and
    /// `<rules_dir>/experience`. Missing directories are fine; unreadable
    /// files are skipped with a warning.
    pub fn load(rules_dir: impl Into<PathBuf>) -> Self {
        let mut interpreter = Self {
            rules_dir: rules_dir.into(),
            constitution: Vec::new(),
            experience: Vec::new(),
        };
        interpreter.reload();
        interpreter
    }

    /// Re-walk the rule directories. Called after the architect rewrites a
    /// rule file.
    pub fn reload(&mut self) {
        self.constitution = load_tier(&self.rules_dir.join("constitution"), RuleTier::Constitution);
        self.experience = load_tier(&self.rules_dir.join("experience"), RuleTier::Experience);
        let total_tokens: usize = self
            .constitution
            .iter()
            .chain(self.experience.iter())
            .map(Rule::token_estimate)
            .sum();
        info!(
            constitution = self.constitution.len(),
            experience = self.experience.len(),
            est_tokens = total_tokens,
            "rules loaded"
        );
    }

    pub fn constitution_rules(&self) -> &[Rule] {
        &self.constitution
    }

    /// Experience rules sorted by relevance to the task, cut off at the
    /// first rule that would exceed `max_tokens`.
    pub fn experience_rules(&self, task_context: &str, max_tokens: Option<usize>) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.experience.iter().collect();
        if !task_context.is_empty() {
            let mut scored: Vec<(f64, &Rule)> = rules
                .into_iter()
                .map(|rule| (self.relevance_score(rule, task_context), rule))
                .collect();
            scored.sort_by(|(a, _), (b, _)| b.total_cmp(a));
            rules = scored.into_iter().map(|(_, rule)| rule).collect();
        }

        match max_tokens {
            None => rules,
            Some(budget) => {
                let mut kept = Vec::new();
                let mut used = 0;
                for rule in rules {
                    let est = rule.token_estimate();
                    if used + est > budget {
                        break;
                    }
                    kept.push(rule);
                    used += est;
                }
                kept
            }
        }
    }

    /// Relevance of one rule to a task description. A small floor keeps the
    /// ordering stable when nothing matches.
    pub fn relevance_score(&self, rule: &Rule, task_context: &str) -> f64 {
        let context = task_context.to_lowercase();
        let mut score = 0.0;

        for keyword in rule.keywords() {
            let keyword = keyword.to_lowercase();
            if context.contains(&keyword) {
                score += 2.0;
            } else if keyword.contains(&context) {
                score += 1.5;
            }
        }

        let readable_name = rule.name.replace('_', " ").to_lowercase();
        if context.contains(&readable_name) || readable_name.contains(&context) {
            score += 1.0;
        }

        let preview: String = rule.content.chars().take(300).collect();
        score += bigram_bonus(&context, &preview.to_lowercase());

        score + 0.01
    }

    pub fn rule_by_name(&self, name: &str) -> Option<&Rule> {
        self.constitution
            .iter()
            .chain(self.experience.iter())
            .find(|rule| rule.name == name)
    }

    /// Build the rule part of the system prompt. Constitution rules are
    /// concatenated greedily within their budget and come first (stable
    /// prefix, cache friendly); experience rules are relevance-ordered and
    /// budgeted separately.
    pub fn build_section(
        &self,
        task_context: &str,
        constitution_budget: usize,
        experience_budget: usize,
    ) -> RuleSections {
        let mut sections = RuleSections::default();

        let mut constitution_parts = Vec::new();
        for rule in &self.constitution {
            let est = rule.token_estimate();
            if sections.constitution_tokens + est > constitution_budget {
                warn!(rule = %rule.name, "constitution budget exceeded, stopping");
                break;
            }
            constitution_parts.push(format!("### {}\n\n{}", rule.name, rule.content));
            sections.constitution_tokens += est;
            sections.rules_used.push(rule.name.clone());
        }

        let experience_rules = self.experience_rules(task_context, Some(experience_budget));
        let mut experience_parts = Vec::new();
        for rule in &experience_rules {
            experience_parts.push(format!("### {}\n\n{}", rule.name, rule.content));
            sections.experience_tokens += rule.token_estimate();
            sections.rules_used.push(rule.name.clone());
        }

        if !constitution_parts.is_empty() {
            sections.constitution_prompt =
                format!("## Core Rules\n\n{}", constitution_parts.join("\n\n"));
        }
        if !experience_parts.is_empty() {
            sections.experience_prompt = format!(
                "## Guidance from Experience\n\n{}",
                experience_parts.join("\n\n")
            );
        }
        sections
    }
}

fn load_tier(directory: &Path, tier: RuleTier) -> Vec<Rule> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(_) => {
            warn!(directory = %directory.display(), "rules directory not found");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content.trim().to_string(),
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to read rule file");
                    return None;
                }
            };
            if content.is_empty() {
                return None;
            }
            let name = path.file_stem()?.to_string_lossy().to_string();
            Some(Rule {
                file_path: path,
                name,
                tier,
                content,
            })
        })
        .collect()
}

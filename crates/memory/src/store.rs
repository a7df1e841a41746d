//! Markdown-backed memory: user-level and project-level notes, conversation
//! snapshots, daily summaries, and keyword retrieval over all of it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use noema_store::{append_md_bullet, StoreError, Workspace};

use crate::score::bigram_bonus;

/// Where a search should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    All,
    User,
    Project,
    Conversations,
    Summaries,
}

/// One scored retrieval result.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub source: String,
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
struct ConversationRecord<'a> {
    conversation_id: &'a str,
    timestamp: String,
    messages: &'a [serde_json::Value],
    metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    workspace: Workspace,
}

impl MemoryStore {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    // Writes.

    pub fn save_user_memory(&self, key: &str, content: &str) -> Result<PathBuf, StoreError> {
        let path = self.workspace.user_memory_dir().join(format!("{key}.md"));
        write_text(&path, content)?;
        info!(key, chars = content.len(), "user memory saved");
        Ok(path)
    }

    pub fn save_project_memory(
        &self,
        project: &str,
        key: &str,
        content: &str,
    ) -> Result<PathBuf, StoreError> {
        let path = self
            .workspace
            .projects_dir()
            .join(project)
            .join(format!("{key}.md"));
        write_text(&path, content)?;
        info!(project, key, "project memory saved");
        Ok(path)
    }

    /// Append one dated preference bullet.
    pub fn append_preference(&self, preference: &str) -> Result<(), StoreError> {
        let date = Local::now().format("%Y-%m-%d");
        append_md_bullet(
            &self.workspace.preferences_file(),
            "User Preferences",
            &format!("[{date}] {preference}"),
        )
    }

    /// Append one dated error-pattern bullet, optionally tagged with its
    /// source task.
    pub fn append_error_pattern(&self, pattern: &str, source: &str) -> Result<(), StoreError> {
        let date = Local::now().format("%Y-%m-%d");
        let source_tag = if source.is_empty() {
            String::new()
        } else {
            format!(" (from {source})")
        };
        append_md_bullet(
            &self.workspace.error_patterns_file(),
            "Known Error Patterns",
            &format!("[{date}]{source_tag} {pattern}"),
        )
    }

    pub fn save_conversation(
        &self,
        conversation_id: &str,
        messages: &[serde_json::Value],
        metadata: serde_json::Value,
    ) -> Result<PathBuf, StoreError> {
        let record = ConversationRecord {
            conversation_id,
            timestamp: noema_store::clock::now_iso(),
            messages,
            metadata,
        };
        let path = self
            .workspace
            .conversations_dir()
            .join(format!("{conversation_id}.json"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        Ok(path)
    }

    pub fn save_daily_summary(&self, date: &str, summary: &str) -> Result<PathBuf, StoreError> {
        let path = self
            .workspace
            .daily_summaries_dir()
            .join(format!("{date}.md"));
        write_text(&path, summary)?;
        Ok(path)
    }

    // Retrieval.

    /// Keyword search across the selected scope, best matches first.
    pub fn search(
        &self,
        query: &str,
        scope: SearchScope,
        project: Option<&str>,
        max_results: usize,
    ) -> Vec<MemoryHit> {
        let mut candidates = Vec::new();

        if matches!(scope, SearchScope::All | SearchScope::User) {
            candidates.extend(scan_markdown(&self.workspace.user_memory_dir()));
        }
        if matches!(scope, SearchScope::All | SearchScope::Project) {
            if let Some(project) = project {
                candidates.extend(scan_markdown(&self.workspace.projects_dir().join(project)));
            }
        }
        if matches!(scope, SearchScope::All | SearchScope::Summaries) {
            candidates.extend(scan_markdown(&self.workspace.daily_summaries_dir()));
        }
        if matches!(scope, SearchScope::All | SearchScope::Conversations) {
            candidates.extend(self.scan_conversations(query));
        }

        let mut hits: Vec<MemoryHit> = candidates
            .into_iter()
            .filter_map(|(source, content)| {
                let score = relevance_score(query, &content);
                (score > 0.0).then_some(MemoryHit {
                    source,
                    content,
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(max_results);
        hits
    }

    /// Convenience for the context engine: just the matching snippets.
    pub fn relevant_memories(
        &self,
        query: &str,
        project: Option<&str>,
        max_results: usize,
    ) -> Vec<String> {
        self.search(query, SearchScope::All, project, max_results)
            .into_iter()
            .map(|hit| hit.content)
            .collect()
    }

    pub fn user_preferences(&self) -> String {
        read_or_empty(&self.workspace.preferences_file())
    }

    pub fn project_context(&self, project: &str) -> String {
        read_or_empty(&self.workspace.projects_dir().join(project).join("context.md"))
    }

    /// Error-pattern bullets from the last `days` days, headings preserved.
    pub fn recent_errors(&self, days: i64) -> String {
        let content = read_or_empty(&self.workspace.error_patterns_file());
        if content.is_empty() {
            return content;
        }
        let cutoff = (Local::now() - chrono::Duration::days(days))
            .format("%Y-%m-%d")
            .to_string();
        let dated = Regex::new(r"^- \[(\d{4}-\d{2}-\d{2})\]").expect("date regex");

        content
            .lines()
            .filter(|line| match dated.captures(line) {
                Some(cap) => cap[1] >= *cutoff,
                None => !line.starts_with("- ["),
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    fn scan_conversations(&self, query: &str) -> Vec<(String, String)> {
        let dir = self.workspace.conversations_dir();
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .filter_map(|path| {
                    let mtime = path.metadata().and_then(|m| m.modified()).ok()?;
                    Some((mtime, path))
                })
                .collect(),
            Err(_) => return Vec::new(),
        };
        files.sort_by(|a, b| b.0.cmp(&a.0));

        files
            .into_iter()
            .take(50)
            .filter_map(|(_, path)| {
                let raw = fs::read_to_string(&path).ok()?;
                let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
                let full_text = value
                    .get("messages")?
                    .as_array()?
                    .iter()
                    .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n");
                let snippet = extract_snippet(&full_text, query, 500)?;
                Some((path.display().to_string(), snippet))
            })
            .collect()
    }
}

fn write_text(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

fn scan_markdown(directory: &Path) -> Vec<(String, String)> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .filter_map(|path| {
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to read memory file");
                    return None;
                }
            };
            (!content.trim().is_empty()).then(|| (path.display().to_string(), content))
        })
        .collect()
}

/// Substring containment plus word hits plus bigram overlap. Only the first
/// 1000 characters of the content participate, so huge files do not win on
/// volume alone.
fn relevance_score(query: &str, content: &str) -> f64 {
    if query.is_empty() || content.is_empty() {
        return 0.0;
    }

    let query = query.to_lowercase();
    let content: String = content.to_lowercase().chars().take(1000).collect();
    let mut score = 0.0;

    if content.contains(&query) {
        score += 5.0;
    }

    for word in query.split_whitespace().filter(|w| w.chars().count() >= 2) {
        if content.contains(word) {
            score += 2.0;
        }
    }

    score + bigram_bonus(&query, &content)
}

/// Pull a window around the best match position, word search first, bigram
/// fallback for unsegmented scripts.
fn extract_snippet(text: &str, query: &str, max_chars: usize) -> Option<String> {
    let text_lower = text.to_lowercase();
    let query_lower = query.to_lowercase();

    let mut pos = text_lower.find(&query_lower);
    if pos.is_none() {
        for word in query_lower.split_whitespace().filter(|w| w.chars().count() >= 2) {
            pos = text_lower.find(word);
            if pos.is_some() {
                break;
            }
        }
    }
    if pos.is_none() {
        let chars: Vec<char> = query_lower.chars().collect();
        for pair in chars.windows(2) {
            let bigram: String = pair.iter().collect();
            pos = text_lower.find(&bigram);
            if pos.is_some() {
                break;
            }
        }
    }

    let pos = pos?;
    let chars: Vec<char> = text.chars().collect();
    // Byte position back to a char index for slicing; counted on the
    // lowercased text where the byte offset is valid.
    let char_pos = text_lower[..pos].chars().count().min(chars.len());
    let start = char_pos.saturating_sub(max_chars / 2);
    let end = (char_pos + max_chars / 2).min(chars.len());
    let mut snippet: String = chars[start..end].iter().collect();
    snippet = snippet.trim().to_string();

    if start > 0 {
        snippet = format!("...{snippet}");
    }
    if end < chars.len() {
        snippet = format!("{snippet}...");
    }
    Some(snippet)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use noema_store::Workspace;

    use super::{MemoryStore, SearchScope};

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(Workspace::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn search_ranks_the_matching_memory_first() {
        let (_dir, store) = store();
        store
            .save_user_memory("projects", "The billing migration uses Postgres 16.")
            .unwrap();
        store
            .save_user_memory("hobbies", "Weekend climbing trips in spring.")
            .unwrap();

        let hits = store.search("postgres billing migration", SearchScope::User, None, 5);
        assert!(!hits.is_empty());
        assert!(hits[0].content.contains("Postgres"));
    }

    #[test]
    fn project_scope_requires_a_project_name() {
        let (_dir, store) = store();
        store
            .save_project_memory("atlas", "context", "Atlas ships the mobile app rewrite.")
            .unwrap();

        let with_project = store.search("mobile rewrite", SearchScope::Project, Some("atlas"), 5);
        assert_eq!(with_project.len(), 1);
        let without = store.search("mobile rewrite", SearchScope::Project, None, 5);
        assert!(without.is_empty());
    }

    #[test]
    fn preferences_accumulate_as_dated_bullets() {
        let (_dir, store) = store();
        store.append_preference("answers in Spanish").unwrap();
        store.append_preference("short summaries first").unwrap();

        let prefs = store.user_preferences();
        assert!(prefs.starts_with("# User Preferences"));
        assert_eq!(prefs.lines().filter(|l| l.starts_with("- [")).count(), 2);
    }

    #[test]
    fn recent_errors_filters_out_old_bullets() {
        let (dir, store) = store();
        let path = dir.path().join("memory/user/error_patterns.md");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let today = chrono::Local::now().format("%Y-%m-%d");
        std::fs::write(
            &path,
            format!(
                "# Known Error Patterns\n\n- [2001-01-01] ancient mistake\n- [{today}] fresh mistake\n"
            ),
        )
        .unwrap();

        let recent = store.recent_errors(7);
        assert!(recent.contains("fresh mistake"));
        assert!(!recent.contains("ancient mistake"));
        assert!(recent.contains("# Known Error Patterns"));
    }

    #[test]
    fn conversation_snippets_surface_in_search() {
        let (_dir, store) = store();
        let messages = vec![
            serde_json::json!({"role": "user", "content": "let's plan the kubernetes upgrade"}),
            serde_json::json!({"role": "assistant", "content": "noted, upgrade to 1.30"}),
        ];
        store
            .save_conversation("conv_001", &messages, serde_json::json!({}))
            .unwrap();

        let hits = store.search("kubernetes upgrade", SearchScope::Conversations, None, 5);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("kubernetes"));
    }

    #[test]
    fn relevant_memories_returns_plain_snippets() {
        let (_dir, store) = store();
        store
            .save_user_memory("notes", "Deploy window is Friday evening.")
            .unwrap();
        let memories = store.relevant_memories("deploy window", None, 3);
        assert_eq!(memories.len(), 1);
    }
}

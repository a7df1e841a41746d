//! Dated-bullet appends to human-readable markdown files
//! (`preferences.md`, `error_patterns.md`).

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::StoreError;

/// Append `- <bullet>` to a markdown file, creating it with `# <heading>`
/// on first use.
pub fn append_md_bullet(path: &Path, heading: &str, bullet: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        fs::write(path, format!("# {heading}\n\n"))?;
    }
    let mut file = fs::OpenOptions::new().append(true).open(path)?;
    writeln!(file, "- {bullet}")?;
    Ok(())
}

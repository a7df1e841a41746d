//! Durable substrate: workspace paths, append-only JSONL logs, and the
//! path-safety guard every proposal-originated write goes through.

pub mod clock;
mod jsonl;
mod markdown;
mod workspace;

pub use jsonl::JsonlLog;
pub use markdown::append_md_bullet;
pub use workspace::Workspace;

/// Typed errors raised at the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write target resolved outside the workspace root. No file is
    /// modified when this is returned.
    #[error("path escapes workspace root: {0}")]
    PathTraversal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

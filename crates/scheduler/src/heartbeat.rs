//! Periodic wake-up that reads `HEARTBEAT.md` and invokes a callback when
//! the file carries actionable content.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub type HeartbeatCallback = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Checkbox list prefixes, checked or unchecked, that do not count as
/// actionable on their own.
const CHECKBOX_PREFIXES: &[&str] = &[
    "- [ ]", "* [ ]", "- [x]", "* [x]", "- [X]", "* [X]",
];

/// True when the file content holds nothing actionable: only blank lines,
/// headings, HTML comments, and checkbox items.
pub fn is_heartbeat_empty(content: &str) -> bool {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("<!--") {
            continue;
        }
        if CHECKBOX_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            continue;
        }
        return false;
    }
    true
}

pub struct HeartbeatService {
    heartbeat_file: PathBuf,
    interval: Duration,
    callback: HeartbeatCallback,
}

impl HeartbeatService {
    pub fn new(heartbeat_file: PathBuf, interval_s: u64, callback: HeartbeatCallback) -> Self {
        Self {
            heartbeat_file,
            interval: Duration::from_secs(interval_s),
            callback,
        }
    }

    /// One wake-up: read the file, skip when empty, otherwise hand the
    /// contents to the callback. Callback errors are logged, never raised.
    pub async fn tick(&self) {
        let content = match std::fs::read_to_string(&self.heartbeat_file) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("heartbeat file missing, skipping");
                return;
            }
            Err(err) => {
                warn!(path = %self.heartbeat_file.display(), %err, "failed to read heartbeat file");
                return;
            }
        };

        if is_heartbeat_empty(&content) {
            debug!("heartbeat file has no actionable content");
            return;
        }

        info!("heartbeat found actionable content, invoking callback");
        if let Err(err) = (self.callback)(content).await {
            error!(%err, "heartbeat callback failed");
        }
    }

    /// Sleep-tick loop until shutdown flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = self.interval.as_secs(), "heartbeat service started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat service stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tempfile::tempdir;

    use super::{is_heartbeat_empty, HeartbeatCallback, HeartbeatService};

    #[test]
    fn headings_comments_and_checkboxes_are_not_actionable() {
        assert!(is_heartbeat_empty(""));
        assert!(is_heartbeat_empty("# Heartbeat\n\n<!-- instructions -->\n"));
        assert!(is_heartbeat_empty("- [ ] pending item\n* [x] done item\n"));
        assert!(is_heartbeat_empty("# Title\n- [X] checked with label\n"));
    }

    #[test]
    fn plain_text_is_actionable() {
        assert!(!is_heartbeat_empty("# Title\ncheck the deploy status\n"));
        assert!(!is_heartbeat_empty("remind me about the invoice"));
    }

    fn recording_callback() -> (Arc<Mutex<Vec<String>>>, HeartbeatCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let callback: HeartbeatCallback = Arc::new(move |content| {
            let seen = captured.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(content);
                Ok(())
            })
        });
        (seen, callback)
    }

    #[tokio::test]
    async fn tick_skips_missing_and_empty_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("HEARTBEAT.md");
        let (seen, callback) = recording_callback();
        let service = HeartbeatService::new(path.clone(), 1800, callback);

        service.tick().await;
        std::fs::write(&path, "# Heartbeat\n<!-- nothing yet -->\n").unwrap();
        service.tick().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tick_invokes_the_callback_with_file_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("HEARTBEAT.md");
        std::fs::write(&path, "# Heartbeat\nfollow up on the migration\n").unwrap();

        let (seen, callback) = recording_callback();
        let service = HeartbeatService::new(path, 1800, callback);
        service.tick().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("follow up on the migration"));
    }

    #[tokio::test]
    async fn callback_errors_are_swallowed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("HEARTBEAT.md");
        std::fs::write(&path, "do something\n").unwrap();

        let callback: HeartbeatCallback =
            Arc::new(|_| Box::pin(async { anyhow::bail!("callback exploded") }));
        let service = HeartbeatService::new(path, 1800, callback);
        service.tick().await;
    }
}

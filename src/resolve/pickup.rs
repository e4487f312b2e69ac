//! Last-resort pickup of files a browser saved to a local folder.
//!
//! Disabled unless configured. Only meaningful when the page session is a real
//! browser whose downloads land in a known directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Suffixes browsers use while a download is still in progress.
const PARTIAL_SUFFIXES: &[&str] = &[".crdownload", ".part", ".partial", ".tmp", ".download"];

/// A completed file found in the watched folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedFile {
    /// Full path.
    pub path: PathBuf,
    /// Size when it was judged stable.
    pub size: u64,
}

impl PickedFile {
    /// File name component.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Finds a file that appeared after `since`.
#[async_trait]
pub trait FolderPickup: Send + Sync {
    /// Waits for a stable file modified at or after `since`.
    async fn pick_up(&self, since: SystemTime) -> Option<PickedFile>;
}

/// Polls a directory until a matching file stops growing.
#[derive(Debug, Clone)]
pub struct PollingFolderPickup {
    dir: PathBuf,
    extensions: Vec<String>,
    timeout: Duration,
    poll_interval: Duration,
}

impl PollingFolderPickup {
    /// Watches `dir` for files with one of `extensions` (case-insensitive,
    /// without dots) for at most `timeout`.
    pub fn new<I, S>(dir: impl Into<PathBuf>, extensions: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            dir: dir.into(),
            extensions: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let lower = name.to_ascii_lowercase();
        if PARTIAL_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
            return false;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
    }

    /// Newest accepted file modified at or after `since`.
    async fn newest_since(&self, since: SystemTime) -> Option<PickedFile> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.ok()?;
        let mut newest: Option<(SystemTime, PickedFile)> = None;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !self.accepts(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if !meta.is_file() || modified < since {
                continue;
            }
            if newest.as_ref().is_none_or(|(best, _)| modified > *best) {
                newest = Some((
                    modified,
                    PickedFile {
                        path,
                        size: meta.len(),
                    },
                ));
            }
        }
        newest.map(|(_, file)| file)
    }
}

#[async_trait]
impl FolderPickup for PollingFolderPickup {
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn pick_up(&self, since: SystemTime) -> Option<PickedFile> {
        let deadline = Instant::now() + self.timeout;
        let mut previous: Option<PickedFile> = None;

        loop {
            let current = self.newest_since(since).await;
            if let (Some(prev), Some(cur)) = (&previous, &current)
                && prev == cur
                && cur.size > 0
            {
                debug!(path = %cur.path.display(), size = cur.size, "picked up stable file");
                return current;
            }
            previous = current;

            if Instant::now() + self.poll_interval > deadline {
                debug!("folder pickup timed out");
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn pickup(dir: &Path) -> PollingFolderPickup {
        PollingFolderPickup::new(dir, ["pdf", ".HWP"], Duration::from_millis(400))
            .with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_picks_up_stable_file() {
        let dir = TempDir::new().unwrap();
        let since = SystemTime::now() - Duration::from_secs(5);
        std::fs::write(dir.path().join("report.pdf"), vec![1u8; 2048]).unwrap();

        let picked = pickup(dir.path()).pick_up(since).await.unwrap();
        assert_eq!(picked.file_name(), Some("report.pdf"));
        assert_eq!(picked.size, 2048);
    }

    #[tokio::test]
    async fn test_ignores_partial_and_foreign_extensions() {
        let dir = TempDir::new().unwrap();
        let since = SystemTime::now() - Duration::from_secs(5);
        std::fs::write(dir.path().join("report.pdf.crdownload"), vec![1u8; 10]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), vec![1u8; 10]).unwrap();

        assert!(pickup(dir.path()).pick_up(since).await.is_none());
    }

    #[tokio::test]
    async fn test_ignores_files_older_than_click() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.pdf"), vec![1u8; 10]).unwrap();
        let since = SystemTime::now() + Duration::from_secs(60);

        assert!(pickup(dir.path()).pick_up(since).await.is_none());
    }

    #[test]
    fn test_extension_matching_is_case_insensitive() {
        let p = pickup(Path::new("/tmp"));
        assert!(p.accepts(Path::new("/tmp/등기.HWP")));
        assert!(p.accepts(Path::new("/tmp/a.Pdf")));
        assert!(!p.accepts(Path::new("/tmp/a.pdf.part")));
    }
}

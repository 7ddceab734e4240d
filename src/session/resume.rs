//! Transcript discovery for resuming after a restart
//!
//! Best effort only: the newest transcript whose file name ends with
//! `-<sessionId>.jsonl` is taken as the record. Nothing ties the file to the
//! conversation beyond the name.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub session_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResumeLocator {
    root: PathBuf,
}

impl ResumeLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Newest transcript for `session_id`; absence is not an error
    pub fn find(&self, session_id: &str) -> Option<ResumeRecord> {
        if session_id.is_empty() || !self.root.is_dir() {
            return None;
        }
        let suffix = format!("-{}.jsonl", session_id);

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .file_name()
                .to_str()
                .map(|name| name.ends_with(&suffix))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                newest = Some((modified, entry.into_path()));
            }
        }

        newest.map(|(_, path)| ResumeRecord {
            session_id: session_id.to_string(),
            path,
        })
    }

    /// [`find`](Self::find) off the async runtime
    pub async fn find_async(&self, session_id: &str) -> Option<ResumeRecord> {
        let locator = self.clone();
        let session_id = session_id.to_string();
        match tokio::task::spawn_blocking(move || locator.find(&session_id)).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Transcript lookup failed: {}", e);
                None
            }
        }
    }
}

//! Live-state document: one entry per job, rewritten on every progress report.

use crate::save::ProgressSink;
use crate::types::{JobState, OperatorStatus, ProgressEvent, ProgressReport, StatusLookup};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Current state of one job as published to observers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LiveState {
    pub name: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub state: JobState,
    pub action: String,
    pub total_files: u64,
    pub total_bytes: u64,
    pub files_remaining: u64,
    pub bytes_remaining: u64,
    pub progress: u8,
    pub timestamp: DateTime<Local>,
}

impl LiveState {
    fn from_report(report: &ProgressReport) -> Self {
        Self {
            name: report.job_name.clone(),
            source: report.source.clone(),
            target: report.target.clone(),
            state: report.state,
            action: report.action.clone(),
            total_files: report.total_files,
            total_bytes: report.total_bytes,
            files_remaining: report.files_remaining,
            bytes_remaining: report.bytes_remaining,
            progress: report.progress,
            timestamp: Local::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LiveStateDocument {
    #[serde(default)]
    pub states: Vec<LiveState>,
}

/// Writes the live-state document. Shared by all workers of a manager.
#[derive(Debug)]
pub struct LiveStateStore {
    path: PathBuf,
    document: Mutex<LiveStateDocument>,
}

impl LiveStateStore {
    /// Opens the store, keeping entries of a previous readable document.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let document = read_document(&path).unwrap_or_default();
        Self {
            path,
            document: Mutex::new(document),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn update(&self, report: &ProgressReport) -> io::Result<()> {
        let mut document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = LiveState::from_report(report);
        match document.states.iter_mut().find(|s| s.name == entry.name) {
            Some(existing) => *existing = entry,
            None => document.states.push(entry),
        }
        write_document(&self.path, &document)
    }
}

impl ProgressSink for LiveStateStore {
    fn emit(&self, event: &ProgressEvent) {
        if let ProgressEvent::Progress(report) = event {
            if let Err(e) = self.update(report) {
                warn!("Failed to write live state {:?}: {}", self.path, e);
            }
        }
    }
}

fn write_document(path: &Path, document: &LiveStateDocument) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(document).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

fn read_document(path: &Path) -> Option<LiveStateDocument> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Looks `job_name` up in the document at `path`.
///
/// A missing document or entry means the job has not started. A document
/// that cannot be read or parsed yields [`StatusLookup::Unreadable`]; it is
/// usually mid-write and the caller should retry.
pub fn read_status(path: &Path, job_name: &str) -> StatusLookup {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return StatusLookup::NotStarted,
        Err(e) => {
            debug!("Live state {:?} unreadable: {}", path, e);
            return StatusLookup::Unreadable;
        }
    };
    let document: LiveStateDocument = match serde_json::from_str(&content) {
        Ok(document) => document,
        Err(e) => {
            debug!("Live state {:?} unparsable: {}", path, e);
            return StatusLookup::Unreadable;
        }
    };
    match document.states.iter().find(|s| s.name == job_name) {
        Some(state) => StatusLookup::Live {
            status: OperatorStatus::from(state.state),
            progress: state.progress,
        },
        None => StatusLookup::NotStarted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn report(name: &str, state: JobState, progress: u8) -> ProgressReport {
        ProgressReport {
            job_name: name.to_string(),
            source: PathBuf::from("/src"),
            target: PathBuf::from("/dst"),
            action: "Copy".to_string(),
            state,
            progress,
            total_files: 4,
            total_bytes: 400,
            files_remaining: 2,
            bytes_remaining: 200,
        }
    }

    #[test]
    fn test_store_upserts_by_name() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state/state.json");
        let store = LiveStateStore::open(&path);

        store.emit(&ProgressEvent::Progress(report("docs", JobState::Running, 50)));
        store.emit(&ProgressEvent::Progress(report("music", JobState::Starting, 0)));
        store.emit(&ProgressEvent::Progress(report("docs", JobState::Done, 100)));

        let document = read_document(&path).unwrap();
        assert_eq!(document.states.len(), 2);
        assert_eq!(
            read_status(&path, "docs"),
            StatusLookup::Live {
                status: OperatorStatus::Completed,
                progress: 100
            }
        );
        assert_eq!(
            read_status(&path, "music"),
            StatusLookup::Live {
                status: OperatorStatus::Pending,
                progress: 0
            }
        );
    }

    #[test]
    fn test_missing_document_and_entry_mean_not_started() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");
        assert_eq!(read_status(&path, "docs"), StatusLookup::NotStarted);

        let store = LiveStateStore::open(&path);
        store.update(&report("music", JobState::Running, 10)).unwrap();
        assert_eq!(read_status(&path, "docs"), StatusLookup::NotStarted);
    }

    #[test]
    fn test_half_written_document_is_unreadable() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, r#"{"states":[{"name":"docs","sta"#).unwrap();
        assert_eq!(read_status(&path, "docs"), StatusLookup::Unreadable);
    }

    #[test]
    fn test_reopen_keeps_previous_entries() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");
        LiveStateStore::open(&path)
            .update(&report("docs", JobState::Cancelled, 30))
            .unwrap();

        let store = LiveStateStore::open(&path);
        store.update(&report("music", JobState::Running, 5)).unwrap();
        assert_eq!(
            read_status(&path, "docs"),
            StatusLookup::Live {
                status: OperatorStatus::Stopped,
                progress: 30
            }
        );
    }
}

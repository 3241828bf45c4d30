use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque unique identifier of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// How a job mirrors its source into a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStrategy {
    /// Copy every entry into a fresh snapshot.
    #[default]
    Full,
    /// Copy only entries modified after the most recent snapshot.
    Differential,
}

impl fmt::Display for SaveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveStrategy::Full => f.write_str("full"),
            SaveStrategy::Differential => f.write_str("differential"),
        }
    }
}

impl FromStr for SaveStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SaveStrategy::Full),
            "differential" | "diff" => Ok(SaveStrategy::Differential),
            other => Err(format!("unknown save strategy: {}", other)),
        }
    }
}

/// A configured backup job.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Job {
    /// Unique identifier, generated when missing from the job list.
    #[serde(default)]
    pub id: JobId,
    /// Display name, also the prefix of every snapshot directory.
    pub name: String,
    /// File or directory to back up.
    pub source: PathBuf,
    /// Directory the snapshots are created under.
    pub target: PathBuf,
    #[serde(default)]
    pub strategy: SaveStrategy,
    /// Start time of the last successful run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Local>>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        strategy: SaveStrategy,
    ) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            source: source.into(),
            target: target.into(),
            strategy,
            last_run: None,
        }
    }
}

/// Lifecycle state published in progress reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Starting,
    Running,
    Done,
    /// Waiting for a blocking process to exit.
    Blocked,
    Cancelled,
    /// The run ended with a non-zero status.
    Failed,
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Starting => "STARTING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Blocked => "BLOCKED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
        }
    }
}

/// Snapshot of a running job's progress.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProgressReport {
    pub job_name: String,
    pub source: PathBuf,
    pub target: PathBuf,
    /// What the worker is doing, e.g. `Copy`, `CreateDir`, `Encryption`.
    pub action: String,
    pub state: JobState,
    /// Percent complete, 0-100.
    pub progress: u8,
    pub total_files: u64,
    pub total_bytes: u64,
    pub files_remaining: u64,
    pub bytes_remaining: u64,
}

/// Timing of one copy or directory creation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TransferRecord {
    pub job_name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bytes: u64,
    pub elapsed_ms: u64,
    pub success: bool,
}

/// Outcome of the snapshot encryption round trip.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EncryptionRecord {
    pub job_name: String,
    pub snapshot: PathBuf,
    /// Generated per run; required to decrypt the snapshot later.
    pub key: String,
    pub elapsed_ms: Option<u64>,
    pub exit_code: i32,
}

/// Event emitted by a running save strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(ProgressReport),
    Transfer(TransferRecord),
    Encryption(EncryptionRecord),
}

/// Operator-facing job status derived from the live-state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorStatus {
    Pending,
    Active,
    Paused,
    Blocked,
    Completed,
    Stopped,
    Failed,
}

impl From<JobState> for OperatorStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Starting => OperatorStatus::Pending,
            JobState::Running => OperatorStatus::Active,
            JobState::Blocked => OperatorStatus::Blocked,
            JobState::Done => OperatorStatus::Completed,
            JobState::Cancelled => OperatorStatus::Stopped,
            JobState::Failed => OperatorStatus::Failed,
        }
    }
}

impl fmt::Display for OperatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperatorStatus::Pending => "Pending",
            OperatorStatus::Active => "In progress",
            OperatorStatus::Paused => "Paused",
            OperatorStatus::Blocked => "Blocked",
            OperatorStatus::Completed => "Completed",
            OperatorStatus::Stopped => "Stopped",
            OperatorStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Result of looking a job up in the live-state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLookup {
    /// No live-state entry exists for the job yet.
    NotStarted,
    /// The document exists but could not be parsed, usually because it is
    /// being rewritten. Retry.
    Unreadable,
    Live {
        status: OperatorStatus,
        progress: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_wire_labels() {
        let json = serde_json::to_string(&JobState::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
        let state: JobState = serde_json::from_str("\"BLOCKED\"").unwrap();
        assert_eq!(state, JobState::Blocked);
        assert_eq!(state.label(), "BLOCKED");
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Full".parse::<SaveStrategy>().unwrap(), SaveStrategy::Full);
        assert_eq!(
            "differential".parse::<SaveStrategy>().unwrap(),
            SaveStrategy::Differential
        );
        assert!("incremental".parse::<SaveStrategy>().is_err());
    }

    #[test]
    fn test_job_id_roundtrip_through_text() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_ne!(JobId::new(), JobId::new());
    }
}

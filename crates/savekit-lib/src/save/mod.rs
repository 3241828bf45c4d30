//! Backup strategies.
//!
//! A run goes `Validate -> CreateSnapshotDir -> Traverse&Copy -> [Encrypt] ->
//! Done | Failed(code)`. Both strategies share the breadth-first planner and
//! executor in [`walk`]; they differ only in which entries they keep.

pub mod differential;
pub mod full;
mod walk;

use crate::config::GlobalConfig;
use crate::crypto::ExtensionFilter;
use crate::gates::{Cancelled, RunControl, SharedGates};
use crate::ipc::{exit_codes, CryptoResponse, IpcError};
use crate::process::ProcessProbe;
use crate::types::{EncryptionRecord, Job, JobState, ProgressEvent, SaveStrategy};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

pub(crate) use walk::Tracker;

/// Format of the timestamp suffix of snapshot directory names.
pub const SNAPSHOT_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

const GENERATED_KEY_LEN: usize = 32;

/// Receives progress events from running jobs.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Encrypts a finished snapshot, normally through the crypto server.
pub trait SnapshotEncryptor: Send + Sync {
    fn encrypt_snapshot(
        &self,
        snapshot: &Path,
        key: &str,
        filter: &ExtensionFilter,
    ) -> Result<CryptoResponse, IpcError>;
}

/// Time source for snapshot names and run timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Final status of a run. The numeric codes are what operators see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Ok,
    SourceNotFound,
    CopyError,
    DirCreateError,
    EncryptionError,
    Cancelled,
}

impl SaveStatus {
    pub fn code(&self) -> i32 {
        match self {
            SaveStatus::Ok => 0,
            SaveStatus::SourceNotFound => 1,
            SaveStatus::CopyError => 2,
            SaveStatus::DirCreateError => 3,
            SaveStatus::EncryptionError => 4,
            SaveStatus::Cancelled => 5,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SaveStatus::Ok)
    }
}

impl From<Cancelled> for SaveStatus {
    fn from(_: Cancelled) -> Self {
        SaveStatus::Cancelled
    }
}

/// What a run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub status: SaveStatus,
    pub snapshot: Option<PathBuf>,
    pub files_copied: u64,
    pub bytes_copied: u64,
    /// Key the snapshot was encrypted with. It is not stored anywhere else.
    pub encryption_key: Option<String>,
}

impl SaveOutcome {
    pub(crate) fn failed(status: SaveStatus, snapshot: Option<PathBuf>) -> Self {
        Self {
            status,
            snapshot,
            files_copied: 0,
            bytes_copied: 0,
            encryption_key: None,
        }
    }
}

/// Per-run settings derived from the global config.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub blocked_processes: Vec<String>,
    /// `None` when no extension is prioritised.
    pub priority: Option<ExtensionFilter>,
    pub large_file_threshold: u64,
    /// `Some(filter)` when snapshots are encrypted.
    pub encryption: Option<ExtensionFilter>,
    pub blocked_poll: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_global(&GlobalConfig::default())
    }
}

impl RunSettings {
    pub fn from_global(global: &GlobalConfig) -> Self {
        let priority = ExtensionFilter::new(&global.priority_extensions);
        Self {
            blocked_processes: global.blocked_processes.clone(),
            priority: (!priority.is_any()).then_some(priority),
            large_file_threshold: global.large_file_threshold_kb.saturating_mul(1024),
            encryption: global
                .encryption
                .enabled
                .then(|| ExtensionFilter::new(&global.encryption.extensions)),
            blocked_poll: Duration::from_millis(global.blocked_poll_millis.max(10)),
        }
    }

    pub fn is_priority(&self, path: &Path) -> bool {
        self.priority.as_ref().is_some_and(|f| f.allows(path))
    }
}

/// Everything a strategy needs besides the job itself.
pub struct SaveContext<'a> {
    pub control: &'a RunControl,
    pub gates: &'a SharedGates,
    pub settings: &'a RunSettings,
    pub sink: &'a dyn ProgressSink,
    pub encryptor: &'a dyn SnapshotEncryptor,
    pub probe: &'a dyn ProcessProbe,
    pub clock: &'a dyn Clock,
}

/// Runs `job` with its configured strategy. On success `job.last_run` is
/// set to the run's start time.
pub fn run(job: &mut Job, ctx: &SaveContext<'_>) -> SaveOutcome {
    match job.strategy {
        SaveStrategy::Full => full::run(job, ctx),
        SaveStrategy::Differential => differential::run(job, ctx),
    }
}

/// Snapshot directory name for a run of `job_name` started at `at`.
pub fn snapshot_name(job_name: &str, at: DateTime<Local>) -> String {
    format!("{}-{}", job_name, at.format(SNAPSHOT_TIME_FORMAT))
}

/// Parses the timestamp of a snapshot directory belonging to `job_name`.
///
/// The name must be exactly `<job_name>-<14 digits>`, so a job named `Docs`
/// never claims the snapshots of `Docs-Archive`.
pub fn parse_snapshot_time(job_name: &str, dir_name: &str) -> Option<DateTime<Local>> {
    let stamp = dir_name.strip_prefix(job_name)?.strip_prefix('-')?;
    if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(stamp, SNAPSHOT_TIME_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Most recent snapshot of `job_name` under `target`.
pub fn latest_snapshot(target: &Path, job_name: &str) -> Option<(PathBuf, DateTime<Local>)> {
    let entries = fs::read_dir(target).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name();
            let at = parse_snapshot_time(job_name, name.to_str()?)?;
            Some((entry.path(), at))
        })
        .max_by_key(|(_, at)| *at)
}

/// Creates a fresh snapshot directory for a run started at `at`.
///
/// The directory itself must not exist yet: a run started within the same
/// second as an earlier one fails with `DirCreateError` instead of writing
/// into that earlier snapshot.
pub(crate) fn create_snapshot(job: &Job, at: DateTime<Local>) -> Result<PathBuf, SaveStatus> {
    let snapshot = job.target.join(snapshot_name(&job.name, at));
    fs::create_dir_all(&job.target)
        .and_then(|()| fs::create_dir(&snapshot))
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists && snapshot.is_dir() {
                error!("Snapshot {:?} already exists, job {} ran twice within a second", snapshot, job.name);
            } else {
                error!("Cannot create snapshot {:?}: {}", snapshot, e);
            }
            SaveStatus::DirCreateError
        })?;
    Ok(snapshot)
}

fn generate_key() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(GENERATED_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Reports a run that ended before copying completed.
pub(crate) fn abort(tracker: &Tracker<'_>, status: SaveStatus, snapshot: Option<PathBuf>) -> SaveOutcome {
    let state = if status == SaveStatus::Cancelled {
        info!("Job {} cancelled", tracker.job_name());
        JobState::Cancelled
    } else {
        error!("Job {} failed with status {}", tracker.job_name(), status.code());
        JobState::Failed
    };
    tracker.report("Stopped", state);
    SaveOutcome::failed(status, snapshot)
}

/// Encrypts the snapshot when enabled, publishes the final state and
/// records the run on the job.
pub(crate) fn complete(
    job: &mut Job,
    ctx: &SaveContext<'_>,
    tracker: &Tracker<'_>,
    snapshot: PathBuf,
    started: DateTime<Local>,
) -> SaveOutcome {
    let mut outcome = SaveOutcome {
        status: SaveStatus::Ok,
        snapshot: Some(snapshot.clone()),
        files_copied: tracker.files_done(),
        bytes_copied: tracker.bytes_done(),
        encryption_key: None,
    };

    if let Some(filter) = &ctx.settings.encryption {
        let key = generate_key();
        tracker.report("Encryption", JobState::Running);
        info!(
            "Encrypting snapshot {:?} of job {} with key {} (required for decryption)",
            snapshot, job.name, key
        );

        let result = ctx.encryptor.encrypt_snapshot(&snapshot, &key, filter);
        let (exit_code, elapsed_ms) = match &result {
            Ok(response) => {
                if !response.is_success() {
                    error!(
                        "Crypto server rejected snapshot {:?}: {}",
                        snapshot, response.error
                    );
                }
                (response.exit_code, response.elapsed_ms())
            }
            Err(e) => {
                error!("Encryption round trip for {:?} failed: {}", snapshot, e);
                (exit_codes::ROUND_TRIP_ERROR, None)
            }
        };
        ctx.sink.emit(&ProgressEvent::Encryption(EncryptionRecord {
            job_name: job.name.clone(),
            snapshot: snapshot.clone(),
            key: key.clone(),
            elapsed_ms,
            exit_code,
        }));

        outcome.encryption_key = Some(key);
        if exit_code != exit_codes::OK {
            warn!("Snapshot {:?} left unencrypted", snapshot);
            outcome.status = SaveStatus::EncryptionError;
            tracker.report("Encryption", JobState::Failed);
            return outcome;
        }
    }

    job.last_run = Some(started);
    tracker.report("Done", JobState::Done);
    info!(
        "Job {} done: {} file(s), {} byte(s) into {:?}",
        job.name, outcome.files_copied, outcome.bytes_copied, snapshot
    );
    outcome
}

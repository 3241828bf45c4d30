//! Breadth-first planning and execution shared by both strategies.

use super::{ProgressSink, SaveContext, SaveStatus};
use crate::gates::PriorityGate;
use crate::process::first_blocked;
use crate::types::{Job, JobState, ProgressEvent, ProgressReport, TransferRecord};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One planned I/O operation. `target` lies inside the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    CreateDir { source: PathBuf, target: PathBuf },
    CopyFile { source: PathBuf, target: PathBuf, size: u64 },
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub(crate) steps: Vec<Step>,
    pub(crate) total_files: u64,
    pub(crate) total_bytes: u64,
}

impl Plan {
    pub(crate) fn single_file(source: PathBuf, target: PathBuf, size: u64) -> Self {
        let mut plan = Self::default();
        plan.push_file(source, target, size);
        plan
    }

    fn push_file(&mut self, source: PathBuf, target: PathBuf, size: u64) {
        self.total_files += 1;
        self.total_bytes += size;
        self.steps.push(Step::CopyFile { source, target, size });
    }
}

/// Walks `source_root` breadth-first and plans the mirror of every entry
/// `keep` accepts under `snapshot`.
///
/// Directories are always descended into, whether kept or not. Each
/// directory is visited once by canonical path, so symlink loops terminate.
pub(crate) fn plan_tree<F>(
    source_root: &Path,
    snapshot: &Path,
    ctx: &SaveContext<'_>,
    mut keep: F,
) -> Result<Plan, SaveStatus>
where
    F: FnMut(&Path, &fs::Metadata) -> bool,
{
    let mut plan = Plan::default();
    let mut visited = HashSet::new();
    let root = fs::canonicalize(source_root).map_err(|e| {
        error!("Cannot resolve source {:?}: {}", source_root, e);
        SaveStatus::SourceNotFound
    })?;
    visited.insert(root);

    let mut queue = VecDeque::from([(source_root.to_path_buf(), snapshot.to_path_buf())]);
    while let Some((dir, mirror)) = queue.pop_front() {
        ctx.control.check()?;

        let mut entries: Vec<_> = fs::read_dir(&dir)
            .map_err(|e| {
                error!("Cannot list {:?}: {}", dir, e);
                SaveStatus::CopyError
            })?
            .filter_map(Result::ok)
            .collect();
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };
            let target = mirror.join(entry.file_name());

            if metadata.is_dir() {
                let canonical = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
                if !visited.insert(canonical) {
                    debug!("Already visited {:?}", path);
                    continue;
                }
                if keep(&path, &metadata) {
                    plan.steps.push(Step::CreateDir {
                        source: path.clone(),
                        target: target.clone(),
                    });
                }
                queue.push_back((path, target));
            } else if metadata.is_file() && keep(&path, &metadata) {
                plan.push_file(path, target, metadata.len());
            }
        }
    }
    Ok(plan)
}

/// Publishes progress for one run.
pub(crate) struct Tracker<'a> {
    sink: &'a dyn ProgressSink,
    job_name: String,
    source: PathBuf,
    target: PathBuf,
    total_files: u64,
    total_bytes: u64,
    files_done: u64,
    bytes_done: u64,
}

impl<'a> Tracker<'a> {
    pub(crate) fn new(job: &Job, sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            job_name: job.name.clone(),
            source: job.source.clone(),
            target: job.target.clone(),
            total_files: 0,
            total_bytes: 0,
            files_done: 0,
            bytes_done: 0,
        }
    }

    pub(crate) fn job_name(&self) -> &str {
        &self.job_name
    }

    pub(crate) fn files_done(&self) -> u64 {
        self.files_done
    }

    pub(crate) fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    fn percent(&self) -> u8 {
        if self.total_files == 0 {
            return 0;
        }
        (self.files_done.min(self.total_files) * 100 / self.total_files) as u8
    }

    pub(crate) fn report(&self, action: &str, state: JobState) {
        let progress = if state == JobState::Done { 100 } else { self.percent() };
        self.sink.emit(&ProgressEvent::Progress(ProgressReport {
            job_name: self.job_name.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            action: action.to_string(),
            state,
            progress,
            total_files: self.total_files,
            total_bytes: self.total_bytes,
            files_remaining: self.total_files.saturating_sub(self.files_done),
            bytes_remaining: self.total_bytes.saturating_sub(self.bytes_done),
        }));
    }

    fn transfer(&self, source: &Path, destination: &Path, bytes: u64, started: Instant, success: bool) {
        self.sink.emit(&ProgressEvent::Transfer(TransferRecord {
            job_name: self.job_name.clone(),
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            bytes,
            elapsed_ms: started.elapsed().as_millis() as u64,
            success,
        }));
    }
}

/// Priority units a run registered and has not yet released.
struct PriorityClaim<'a> {
    gate: &'a PriorityGate,
    remaining: u64,
}

impl<'a> PriorityClaim<'a> {
    fn new(gate: &'a PriorityGate, units: u64) -> Self {
        gate.add_priority(units);
        Self {
            gate,
            remaining: units,
        }
    }

    fn release_one(&mut self) {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.gate.remove_priority(1);
        }
    }
}

impl Drop for PriorityClaim<'_> {
    fn drop(&mut self) {
        self.gate.remove_priority(self.remaining);
    }
}

fn is_deferred(step: &Step, ctx: &SaveContext<'_>) -> bool {
    matches!(step, Step::CopyFile { source, .. } if !ctx.settings.is_priority(source))
}

/// Runs `plan`, stopping at the first failed operation.
///
/// Directories and priority files go first, then the remaining files, each
/// class in planned order. A job therefore holds no priority units of its
/// own by the time it waits on other jobs' units.
pub(crate) fn execute(mut plan: Plan, ctx: &SaveContext<'_>, tracker: &mut Tracker<'_>) -> Result<(), SaveStatus> {
    tracker.total_files = plan.total_files;
    tracker.total_bytes = plan.total_bytes;

    plan.steps.sort_by_key(|step| is_deferred(step, ctx));
    let priority_files = plan
        .steps
        .iter()
        .filter(|step| matches!(step, Step::CopyFile { .. }) && !is_deferred(step, ctx))
        .count() as u64;
    let mut claim = PriorityClaim::new(&ctx.gates.priority, priority_files);
    if priority_files > 0 {
        debug!("Job {} holds {} priority file(s)", tracker.job_name, priority_files);
    }

    for step in &plan.steps {
        checkpoint(ctx, tracker)?;
        match step {
            Step::CreateDir { source, target } => create_dir(tracker, source, target)?,
            Step::CopyFile { source, target, size } => {
                let is_priority = ctx.settings.is_priority(source);
                if !is_priority {
                    ctx.gates.priority.wait_for_others(ctx.control, claim.remaining);
                    ctx.control.check()?;
                }
                copy_file(ctx, tracker, source, target, *size)?;
                if is_priority {
                    claim.release_one();
                }
            }
        }
    }
    Ok(())
}

/// Cancellation, blocked processes and pause, checked before each operation.
fn checkpoint(ctx: &SaveContext<'_>, tracker: &Tracker<'_>) -> Result<(), SaveStatus> {
    ctx.control.check()?;

    let mut announced = false;
    while let Some(process) = first_blocked(ctx.probe, &ctx.settings.blocked_processes) {
        if !announced {
            warn!("Job {} blocked while {} is running", tracker.job_name, process);
            tracker.report(&format!("Blocked by {}", process), JobState::Blocked);
            announced = true;
        }
        ctx.control.sleep(ctx.settings.blocked_poll)?;
    }
    if announced {
        info!("Job {} unblocked", tracker.job_name);
    }

    ctx.control.wait_while_paused()?;
    Ok(())
}

fn create_dir(tracker: &Tracker<'_>, source: &Path, target: &Path) -> Result<(), SaveStatus> {
    if target.is_dir() {
        return Ok(());
    }
    tracker.report("CreateDir", JobState::Running);
    let started = Instant::now();
    let result = fs::create_dir_all(target);
    tracker.transfer(source, target, 0, started, result.is_ok());
    result.map_err(|e| {
        error!("Cannot create {:?}: {}", target, e);
        SaveStatus::DirCreateError
    })
}

fn copy_file(
    ctx: &SaveContext<'_>,
    tracker: &mut Tracker<'_>,
    source: &Path,
    target: &Path,
    size: u64,
) -> Result<(), SaveStatus> {
    if let Some(parent) = target.parent() {
        if !parent.is_dir() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Cannot create {:?}: {}", parent, e);
                SaveStatus::DirCreateError
            })?;
        }
    }

    let _permit = (size >= ctx.settings.large_file_threshold).then(|| {
        debug!("Waiting for transfer slot for {:?} ({} bytes)", source, size);
        ctx.gates.throttle.acquire()
    });

    tracker.report("Copy", JobState::Running);
    let started = Instant::now();
    let result = fs::copy(source, target);
    tracker.transfer(source, target, size, started, result.is_ok());

    match result {
        Ok(bytes) => {
            tracker.files_done += 1;
            tracker.bytes_done += bytes;
            Ok(())
        }
        Err(e) => {
            error!("Cannot copy {:?} to {:?}: {}", source, target, e);
            Err(SaveStatus::CopyError)
        }
    }
}

//! Differential backup: copies only what changed since the last snapshot.

use super::walk::{self, Plan, Tracker};
use super::{abort, complete, create_snapshot, full, latest_snapshot, SaveContext, SaveOutcome, SaveStatus};
use crate::types::{Job, JobState};
use chrono::{DateTime, Local};
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

fn modified(metadata: &fs::Metadata) -> Option<DateTime<Local>> {
    metadata.modified().ok().map(DateTime::<Local>::from)
}

/// Entries without a readable mtime count as changed.
fn newer_than(metadata: &fs::Metadata, reference: DateTime<Local>) -> bool {
    modified(metadata).map_or(true, |at| at > reference)
}

pub fn run(job: &mut Job, ctx: &SaveContext<'_>) -> SaveOutcome {
    let prior = latest_snapshot(&job.target, &job.name);
    let (prior_dir, reference): (Option<PathBuf>, DateTime<Local>) = match (prior, job.last_run) {
        (Some((dir, at)), _) => (Some(dir), at),
        (None, Some(last_run)) => (None, last_run),
        (None, None) => {
            info!("No previous run of {}, falling back to a full backup", job.name);
            return full::run(job, ctx);
        }
    };

    let mut tracker = Tracker::new(job, ctx.sink);
    tracker.report("Validate", JobState::Starting);

    let started = ctx.clock.now();
    if !job.source.exists() {
        error!("Source {:?} of job {} not found", job.source, job.name);
        return abort(&tracker, SaveStatus::SourceNotFound, None);
    }

    let snapshot = match create_snapshot(job, started) {
        Ok(snapshot) => snapshot,
        Err(status) => return abort(&tracker, status, None),
    };
    info!(
        "Differential backup of {} into {:?}, changes since {}",
        job.name,
        snapshot,
        reference.format("%Y-%m-%d %H:%M:%S")
    );

    let plan = if job.source.is_file() {
        plan_single_file(job, &snapshot, prior_dir, reference)
    } else {
        walk::plan_tree(&job.source, &snapshot, ctx, |_, metadata| {
            newer_than(metadata, reference)
        })
    };

    let result = plan.and_then(|plan| walk::execute(plan, ctx, &mut tracker));
    match result {
        Ok(()) => complete(job, ctx, &tracker, snapshot, started),
        Err(status) => abort(&tracker, status, Some(snapshot)),
    }
}

/// A single source file is compared with its copy in the prior snapshot,
/// or with the reference time when no snapshot survives.
fn plan_single_file(
    job: &Job,
    snapshot: &std::path::Path,
    prior_dir: Option<PathBuf>,
    reference: DateTime<Local>,
) -> Result<Plan, SaveStatus> {
    let name = job.source.file_name().ok_or(SaveStatus::SourceNotFound)?;
    let metadata = fs::metadata(&job.source).map_err(|e| {
        error!("Cannot stat {:?}: {}", job.source, e);
        SaveStatus::SourceNotFound
    })?;

    let changed = match prior_dir {
        Some(dir) => match fs::metadata(dir.join(name)) {
            Ok(previous) => match (modified(&metadata), modified(&previous)) {
                (Some(current), Some(previous)) => current > previous,
                _ => true,
            },
            Err(_) => true,
        },
        None => newer_than(&metadata, reference),
    };

    if changed {
        Ok(Plan::single_file(job.source.clone(), snapshot.join(name), metadata.len()))
    } else {
        Ok(Plan::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::testing::Harness;
    use crate::save::{parse_snapshot_time, snapshot_name};
    use crate::types::SaveStrategy;
    use chrono::Duration as ChronoDuration;
    use std::path::Path;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("sub/deep")).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("sub/b.txt"), b"b").unwrap();
        fs::write(root.join("sub/deep/c.txt"), b"c").unwrap();
    }

    fn job(src: &Path, dst: &Path) -> Job {
        Job::new("Docs", src, dst, SaveStrategy::Differential)
    }

    fn file_count(root: &Path) -> usize {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_first_run_is_full() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        populate(&src);

        let harness = Harness::new();
        let mut job = job(&src, &tmp.path().join("dst"));
        let outcome = run(&mut job, &harness.ctx());

        assert_eq!(outcome.status, SaveStatus::Ok);
        assert_eq!(outcome.files_copied, 3);
        assert_eq!(file_count(&outcome.snapshot.unwrap()), 3);
        assert!(job.last_run.is_some());
    }

    #[test]
    fn test_second_run_without_changes_copies_nothing() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        populate(&src);

        let harness = Harness::new();
        let now = Local::now();
        let mut job = job(&src, &dst);

        harness.clock.set(now + ChronoDuration::hours(1));
        assert_eq!(run(&mut job, &harness.ctx()).files_copied, 3);

        harness.clock.set(now + ChronoDuration::hours(2));
        let second = run(&mut job, &harness.ctx());
        assert_eq!(second.status, SaveStatus::Ok);
        assert_eq!(second.files_copied, 0);
        let snapshot = second.snapshot.unwrap();
        assert!(snapshot.is_dir());
        assert_eq!(file_count(&snapshot), 0);
        assert_eq!(job.last_run, Some(now + ChronoDuration::hours(2)));
    }

    #[test]
    fn test_changed_files_since_snapshot_are_copied() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        populate(&src);

        // A snapshot taken an hour ago predates every file's mtime.
        let earlier = Local::now() - ChronoDuration::hours(1);
        fs::create_dir_all(dst.join(snapshot_name("Docs", earlier))).unwrap();

        let harness = Harness::new();
        let mut job = job(&src, &dst);
        let outcome = run(&mut job, &harness.ctx());

        assert_eq!(outcome.status, SaveStatus::Ok);
        assert_eq!(outcome.files_copied, 3);
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(fs::read(snapshot.join("sub/deep/c.txt")).unwrap(), b"c");
    }

    #[test]
    fn test_reference_ignores_other_jobs_snapshots() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        populate(&src);

        let later = Local::now() + ChronoDuration::hours(5);
        let earlier = Local::now() - ChronoDuration::hours(1);
        fs::create_dir_all(dst.join(snapshot_name("Docs-Archive", later))).unwrap();
        fs::create_dir_all(dst.join(snapshot_name("Docs", earlier))).unwrap();

        let harness = Harness::new();
        let outcome = run(&mut job(&src, &dst), &harness.ctx());
        assert_eq!(outcome.files_copied, 3);
    }

    #[test]
    fn test_falls_back_to_last_run_without_snapshots() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        populate(&src);

        let harness = Harness::new();
        let mut job = job(&src, &tmp.path().join("dst"));
        job.last_run = Some(Local::now() + ChronoDuration::hours(1));
        harness.clock.set(Local::now() + ChronoDuration::hours(2));

        let outcome = run(&mut job, &harness.ctx());
        assert_eq!(outcome.status, SaveStatus::Ok);
        assert_eq!(outcome.files_copied, 0);
        let name = outcome.snapshot.unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert!(parse_snapshot_time("Docs", &name).is_some());
    }

    #[test]
    fn test_single_file_compared_with_prior_copy() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("notes.md");
        let dst = tmp.path().join("dst");
        fs::write(&file, b"v1").unwrap();

        let harness = Harness::new();
        let now = Local::now();
        let mut job = job(&file, &dst);

        harness.clock.set(now + ChronoDuration::hours(1));
        assert_eq!(run(&mut job, &harness.ctx()).files_copied, 1);

        harness.clock.set(now + ChronoDuration::hours(2));
        assert_eq!(run(&mut job, &harness.ctx()).files_copied, 0);

        // The prior snapshot lost its copy: copy again.
        let prior = latest_snapshot(&dst, "Docs").unwrap().0;
        let first = dst.join(snapshot_name("Docs", now + ChronoDuration::hours(1)));
        fs::remove_dir_all(&prior).unwrap();
        fs::remove_file(first.join("notes.md")).unwrap();
        harness.clock.set(now + ChronoDuration::hours(3));
        assert_eq!(run(&mut job, &harness.ctx()).files_copied, 1);
    }

    #[test]
    fn test_rerun_within_same_second_keeps_prior_snapshot() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        populate(&src);

        let harness = Harness::new();
        let mut job = job(&src, &dst);
        let first = run(&mut job, &harness.ctx());
        assert_eq!(first.status, SaveStatus::Ok);
        let first_run = job.last_run;

        fs::write(src.join("a.txt"), b"a2").unwrap();
        let second = run(&mut job, &harness.ctx());
        assert_eq!(second.status, SaveStatus::DirCreateError);
        assert!(second.snapshot.is_none());
        assert_eq!(job.last_run, first_run);
        assert_eq!(fs::read(first.snapshot.unwrap().join("a.txt")).unwrap(), b"a");
    }
}

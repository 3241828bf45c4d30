//! Full backup: a fresh snapshot mirroring the whole source.

use super::walk::{self, Plan, Tracker};
use super::{abort, complete, create_snapshot, SaveContext, SaveOutcome, SaveStatus};
use crate::types::{Job, JobState};
use std::fs;
use tracing::{error, info};

pub fn run(job: &mut Job, ctx: &SaveContext<'_>) -> SaveOutcome {
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
    info!("Full backup of {} into {:?}", job.name, snapshot);

    let plan = if job.source.is_file() {
        let size = fs::metadata(&job.source).map(|m| m.len()).unwrap_or(0);
        match job.source.file_name() {
            Some(name) => Ok(Plan::single_file(job.source.clone(), snapshot.join(name), size)),
            None => Err(SaveStatus::SourceNotFound),
        }
    } else {
        walk::plan_tree(&job.source, &snapshot, ctx, |_, _| true)
    };

    let result = plan.and_then(|plan| walk::execute(plan, ctx, &mut tracker));
    match result {
        Ok(()) => complete(job, ctx, &tracker, snapshot, started),
        Err(status) => abort(&tracker, status, Some(snapshot)),
    }
}

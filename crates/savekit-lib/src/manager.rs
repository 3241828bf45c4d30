//! Owns the job list and runs selected jobs on their own threads.

use crate::config::{validate_job, Config, ConfigError};
use crate::gates::{RunControl, SharedGates};
use crate::ipc::CryptoClient;
use crate::live_state::{self, LiveStateStore};
use crate::paths;
use crate::process::{first_blocked, ProcessProbe, ProcfsProbe};
use crate::save::{
    self, Clock, ProgressSink, RunSettings, SaveContext, SaveOutcome, SaveStatus, SnapshotEncryptor,
    SystemClock,
};
use crate::selection::{parse_selection, SelectionError};
use crate::types::{Job, JobId, OperatorStatus, StatusLookup};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("A job named '{0}' already exists")]
    DuplicateName(String),
    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Blocked process is running: {0}")]
    ProcessBlocked(String),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

type Registry = Arc<Mutex<HashMap<JobId, Arc<RunControl>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A job started by [`JobManager::start_selection`].
#[derive(Debug)]
pub struct RunHandle {
    pub job_id: JobId,
    pub job_name: String,
    handle: JoinHandle<SaveOutcome>,
}

impl RunHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the run to end. A panicking worker counts as a copy failure.
    pub fn join(self) -> SaveOutcome {
        self.handle.join().unwrap_or_else(|_| {
            error!("Worker for job {} panicked", self.job_name);
            SaveOutcome::failed(SaveStatus::CopyError, None)
        })
    }
}

/// Removes a job from the registry when its worker exits, however it exits.
struct Registration {
    running: Registry,
    id: JobId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.id);
    }
}

pub struct JobManager {
    jobs: Arc<Mutex<Vec<Job>>>,
    running: Registry,
    gates: Arc<SharedGates>,
    settings: Arc<RunSettings>,
    sink: Arc<dyn ProgressSink>,
    encryptor: Arc<dyn SnapshotEncryptor>,
    probe: Arc<dyn ProcessProbe>,
    clock: Arc<dyn Clock>,
    live_state_path: PathBuf,
}

impl JobManager {
    /// Builds a manager over `config`'s jobs, publishing to the live-state
    /// store and encrypting through the crypto server's socket.
    pub fn new(config: &Config) -> Self {
        let live_state_path = config
            .global
            .live_state_path
            .clone()
            .unwrap_or_else(paths::live_state_path);
        let timeout = Duration::from_secs(config.global.ipc_timeout_secs.max(1));
        Self {
            jobs: Arc::new(Mutex::new(config.jobs.clone())),
            running: Arc::new(Mutex::new(HashMap::new())),
            gates: Arc::new(SharedGates::new()),
            settings: Arc::new(RunSettings::from_global(&config.global)),
            sink: Arc::new(LiveStateStore::open(&live_state_path)),
            encryptor: Arc::new(CryptoClient::new(paths::socket_path(), timeout)),
            probe: Arc::new(ProcfsProbe::new()),
            clock: Arc::new(SystemClock),
            live_state_path,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn SnapshotEncryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn live_state_path(&self) -> &PathBuf {
        &self.live_state_path
    }

    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.jobs).clone()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Job> {
        lock(&self.jobs).iter().find(|j| j.name == name).cloned()
    }

    pub fn add_job(&self, job: Job) -> Result<(), ManagerError> {
        validate_job(&job)?;
        let mut jobs = lock(&self.jobs);
        if jobs.iter().any(|j| j.name == job.name) {
            return Err(ManagerError::DuplicateName(job.name));
        }
        info!("Added job {} ({})", job.name, job.strategy);
        jobs.push(job);
        Ok(())
    }

    /// Replaces the job with the same id.
    pub fn update_job(&self, job: Job) -> Result<(), ManagerError> {
        validate_job(&job)?;
        let mut jobs = lock(&self.jobs);
        if jobs.iter().any(|j| j.name == job.name && j.id != job.id) {
            return Err(ManagerError::DuplicateName(job.name));
        }
        let slot = jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| ManagerError::UnknownJob(job.id.to_string()))?;
        info!("Updated job {}", job.name);
        *slot = job;
        Ok(())
    }

    pub fn delete_job(&self, id: JobId) -> Result<Job, ManagerError> {
        let mut jobs = lock(&self.jobs);
        let index = jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| ManagerError::UnknownJob(id.to_string()))?;
        let job = jobs.remove(index);
        info!("Deleted job {}", job.name);
        Ok(job)
    }

    /// Starts the jobs selected by `expr` (`n`, `a-b` or `a;b;c`, zero-based).
    ///
    /// Nothing starts when a blocked process is running or the expression
    /// is invalid. Jobs that are already running are skipped.
    pub fn start_selection(&self, expr: &str) -> Result<Vec<RunHandle>, StartError> {
        if let Some(process) = first_blocked(self.probe.as_ref(), &self.settings.blocked_processes) {
            warn!("Not starting jobs while {} is running", process);
            return Err(StartError::ProcessBlocked(process));
        }

        let jobs = self.jobs();
        let indices = parse_selection(expr, jobs.len())?;
        let mut handles = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(handle) = self.start_job(jobs[index].clone())? {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    fn start_job(&self, job: Job) -> Result<Option<RunHandle>, StartError> {
        let control = Arc::new(RunControl::new());
        {
            let mut running = lock(&self.running);
            if running.contains_key(&job.id) {
                warn!("Job {} is already running, skipping", job.name);
                return Ok(None);
            }
            running.insert(job.id, Arc::clone(&control));
        }

        let job_id = job.id;
        let job_name = job.name.clone();
        let worker = Worker {
            jobs: Arc::clone(&self.jobs),
            running: Arc::clone(&self.running),
            gates: Arc::clone(&self.gates),
            settings: Arc::clone(&self.settings),
            sink: Arc::clone(&self.sink),
            encryptor: Arc::clone(&self.encryptor),
            probe: Arc::clone(&self.probe),
            clock: Arc::clone(&self.clock),
        };

        let spawned = thread::Builder::new()
            .name(format!("save-{}", job_name))
            .spawn(move || worker.run(job, control));
        match spawned {
            Ok(handle) => {
                info!("Started job {}", job_name);
                Ok(Some(RunHandle {
                    job_id,
                    job_name,
                    handle,
                }))
            }
            Err(e) => {
                lock(&self.running).remove(&job_id);
                Err(StartError::Spawn(e))
            }
        }
    }

    fn control(&self, id: JobId) -> Option<Arc<RunControl>> {
        lock(&self.running).get(&id).cloned()
    }

    /// Returns false when the job is not running.
    pub fn pause(&self, id: JobId) -> bool {
        self.control(id).map(|c| c.pause()).is_some()
    }

    pub fn resume(&self, id: JobId) -> bool {
        self.control(id).map(|c| c.resume()).is_some()
    }

    /// Cancels the job, waking it if paused.
    pub fn stop(&self, id: JobId) -> bool {
        self.control(id).map(|c| c.cancel()).is_some()
    }

    pub fn is_paused(&self, id: JobId) -> bool {
        self.control(id).is_some_and(|c| c.is_paused())
    }

    pub fn is_running(&self, id: JobId) -> bool {
        lock(&self.running).contains_key(&id)
    }

    /// Status as published in the live-state store. A running job that is
    /// paused reports `Paused`.
    pub fn get_status(&self, id: JobId) -> StatusLookup {
        let Some(name) = lock(&self.jobs).iter().find(|j| j.id == id).map(|j| j.name.clone()) else {
            return StatusLookup::NotStarted;
        };
        let lookup = live_state::read_status(&self.live_state_path, &name);
        if !self.is_paused(id) {
            return lookup;
        }
        let progress = match lookup {
            StatusLookup::Live { progress, .. } => progress,
            _ => 0,
        };
        StatusLookup::Live {
            status: OperatorStatus::Paused,
            progress,
        }
    }
}

/// What a worker thread needs, cloned out of the manager.
struct Worker {
    jobs: Arc<Mutex<Vec<Job>>>,
    running: Registry,
    gates: Arc<SharedGates>,
    settings: Arc<RunSettings>,
    sink: Arc<dyn ProgressSink>,
    encryptor: Arc<dyn SnapshotEncryptor>,
    probe: Arc<dyn ProcessProbe>,
    clock: Arc<dyn Clock>,
}

impl Worker {
    fn run(self, mut job: Job, control: Arc<RunControl>) -> SaveOutcome {
        let _registration = Registration {
            running: Arc::clone(&self.running),
            id: job.id,
        };
        let ctx = SaveContext {
            control: &control,
            gates: &self.gates,
            settings: &self.settings,
            sink: self.sink.as_ref(),
            encryptor: self.encryptor.as_ref(),
            probe: self.probe.as_ref(),
            clock: self.clock.as_ref(),
        };

        let outcome = save::run(&mut job, &ctx);
        debug!("Job {} ended with status {}", job.name, outcome.status.code());

        if outcome.status.is_ok() {
            if let Some(stored) = lock(&self.jobs).iter_mut().find(|j| j.id == job.id) {
                stored.last_run = job.last_run;
            }
        }
        outcome
    }
}

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use savekit_lib::config::{self, Config};
use savekit_lib::manager::{JobManager, RunHandle};
use savekit_lib::paths;
use savekit_lib::save::{SaveOutcome, SaveStatus};
use savekit_lib::types::{Job, SaveStrategy, StatusLookup};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Attempts made while the live-state document is being rewritten.
const STATUS_READ_ATTEMPTS: usize = 10;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Show results in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all configured jobs with their index
    List,
    /// Add a backup job
    Add {
        name: String,
        /// File or directory to back up
        source: PathBuf,
        /// Directory that receives the snapshots
        target: PathBuf,
        /// `full` or `differential`
        #[arg(long, default_value = "full")]
        strategy: SaveStrategy,
    },
    /// Change an existing job
    Update {
        name: String,
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        target: Option<PathBuf>,
        #[arg(long)]
        strategy: Option<SaveStrategy>,
        /// New name for the job
        #[arg(long)]
        rename: Option<String>,
    },
    /// Remove a job (its snapshots are kept)
    Delete { name: String },
    /// Run jobs by index: `3`, `1-4` or `0;2;5`
    ///
    /// While jobs run, type `pause <job>`, `resume <job>`, `stop <job>` or
    /// `status` on stdin.
    Run { selection: String },
    /// Show the live status of a job
    Status { name: String },
}

fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let json = cli.json;
    let quiet = cli.quiet;
    let config_path = paths::active_config_path();

    match cli.command {
        Commands::List => handle_list(&config_path, json, quiet),
        Commands::Add {
            name,
            source,
            target,
            strategy,
        } => handle_add(&config_path, Job::new(name, source, target, strategy), quiet),
        Commands::Update {
            name,
            source,
            target,
            strategy,
            rename,
        } => handle_update(&config_path, &name, source, target, strategy, rename, quiet),
        Commands::Delete { name } => handle_delete(&config_path, &name, quiet),
        Commands::Run { selection } => handle_run(&config_path, &selection, json, quiet),
        Commands::Status { name } => handle_status(&config_path, &name, json),
    }
}

fn load(path: &Path) -> Config {
    match config::load_or_default(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(2);
        }
    }
}

/// Writes the manager's job list back into the config file.
fn persist(path: &Path, mut config: Config, manager: &JobManager) -> anyhow::Result<()> {
    config.jobs = manager.jobs();
    config::save_config(path, &config)
        .with_context(|| format!("Failed to save configuration to {}", path.display()))
}

fn format_last_run(job: &Job) -> String {
    job.last_run
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn handle_list(path: &Path, json: bool, quiet: bool) -> anyhow::Result<()> {
    let config = load(path);

    if json {
        println!("{}", serde_json::to_string_pretty(&config.jobs)?);
    } else if !quiet {
        if config.jobs.is_empty() {
            println!("No jobs configured.");
            return Ok(());
        }

        println!(
            "{:<6} {:<15} {:<13} {:<30} {:<30} {:<20}",
            "INDEX", "NAME", "STRATEGY", "SOURCE", "TARGET", "LAST RUN"
        );
        println!("{}", "-".repeat(119));
        for (index, job) in config.jobs.iter().enumerate() {
            println!(
                "{:<6} {:<15} {:<13} {:<30} {:<30} {:<20}",
                index,
                job.name,
                job.strategy.to_string(),
                job.source.display(),
                job.target.display(),
                format_last_run(job)
            );
        }
    }

    Ok(())
}

fn handle_add(path: &Path, job: Job, quiet: bool) -> anyhow::Result<()> {
    let config = load(path);
    let manager = JobManager::new(&config);
    let name = job.name.clone();
    manager.add_job(job)?;
    persist(path, config, &manager)?;
    if !quiet {
        println!("Added job {}.", name);
    }
    Ok(())
}

fn handle_update(
    path: &Path,
    name: &str,
    source: Option<PathBuf>,
    target: Option<PathBuf>,
    strategy: Option<SaveStrategy>,
    rename: Option<String>,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = load(path);
    let manager = JobManager::new(&config);
    let mut job = manager
        .find_by_name(name)
        .ok_or_else(|| anyhow!("Unknown job: {}", name))?;

    if let Some(source) = source {
        job.source = source;
    }
    if let Some(target) = target {
        job.target = target;
    }
    if let Some(strategy) = strategy {
        job.strategy = strategy;
    }
    if let Some(rename) = rename {
        job.name = rename;
    }
    let updated = job.name.clone();
    manager.update_job(job)?;
    persist(path, config, &manager)?;
    if !quiet {
        println!("Updated job {}.", updated);
    }
    Ok(())
}

fn handle_delete(path: &Path, name: &str, quiet: bool) -> anyhow::Result<()> {
    let config = load(path);
    let manager = JobManager::new(&config);
    let job = manager
        .find_by_name(name)
        .ok_or_else(|| anyhow!("Unknown job: {}", name))?;
    manager.delete_job(job.id)?;
    persist(path, config, &manager)?;
    if !quiet {
        println!("Deleted job {}. Existing snapshots under {} were kept.", name, job.target.display());
    }
    Ok(())
}

fn handle_status(path: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let config = load(path);
    let manager = JobManager::new(&config);
    let job = manager
        .find_by_name(name)
        .ok_or_else(|| anyhow!("Unknown job: {}", name))?;

    let mut lookup = manager.get_status(job.id);
    for _ in 1..STATUS_READ_ATTEMPTS {
        if lookup != StatusLookup::Unreadable {
            break;
        }
        thread::sleep(Duration::from_millis(100));
        lookup = manager.get_status(job.id);
    }

    match lookup {
        StatusLookup::Live { status, progress } => {
            if json {
                let value = serde_json::json!({
                    "job": name,
                    "status": status,
                    "progress": progress,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}: {} ({}%)", name, status, progress);
            }
        }
        StatusLookup::NotStarted => {
            if json {
                println!("{}", serde_json::json!({ "job": name, "status": null }));
            } else {
                println!("{}: not started", name);
            }
        }
        StatusLookup::Unreadable => {
            eprintln!("Error: live state at {} is unreadable, try again.", manager.live_state_path().display());
            std::process::exit(1);
        }
    }
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

fn handle_control(manager: &JobManager, handles: &[RunHandle], line: &str, quiet: bool) {
    let mut parts = line.split_whitespace();
    let (command, name) = (parts.next(), parts.next());
    let Some(command) = command else {
        return;
    };

    if command == "status" {
        for handle in handles.iter().filter(|h| name.map_or(true, |n| n == h.job_name)) {
            match manager.get_status(handle.job_id) {
                StatusLookup::Live { status, progress } => {
                    println!("{}: {} ({}%)", handle.job_name, status, progress)
                }
                StatusLookup::NotStarted => println!("{}: not started", handle.job_name),
                StatusLookup::Unreadable => println!("{}: status unavailable", handle.job_name),
            }
        }
        return;
    }

    let Some(name) = name else {
        eprintln!("Usage: {} <job>", command);
        return;
    };
    let Some(handle) = handles.iter().find(|h| h.job_name == name) else {
        eprintln!("Job {} is not part of this run", name);
        return;
    };

    let applied = match command {
        "pause" => manager.pause(handle.job_id),
        "resume" => manager.resume(handle.job_id),
        "stop" => manager.stop(handle.job_id),
        other => {
            eprintln!("Unknown command: {} (pause, resume, stop, status)", other);
            return;
        }
    };
    if !applied {
        eprintln!("Job {} is no longer running", name);
    } else if !quiet {
        println!("{}: {}", name, command);
    }
}

fn describe(status: SaveStatus) -> &'static str {
    match status {
        SaveStatus::Ok => "completed",
        SaveStatus::SourceNotFound => "source not found",
        SaveStatus::CopyError => "copy failed",
        SaveStatus::DirCreateError => "cannot create directory",
        SaveStatus::EncryptionError => "encryption failed",
        SaveStatus::Cancelled => "stopped",
    }
}

fn print_results(results: &[(String, SaveOutcome)], json: bool, quiet: bool) -> anyhow::Result<()> {
    if json {
        let values: Vec<_> = results
            .iter()
            .map(|(name, outcome)| {
                serde_json::json!({
                    "job": name,
                    "status": outcome.status.code(),
                    "snapshot": outcome.snapshot,
                    "files_copied": outcome.files_copied,
                    "bytes_copied": outcome.bytes_copied,
                    "encryption_key": outcome.encryption_key,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    for (name, outcome) in results {
        if !quiet {
            let snapshot = outcome
                .snapshot
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}: {} (code {}), {} file(s), {} byte(s) -> {}",
                name,
                describe(outcome.status),
                outcome.status.code(),
                outcome.files_copied,
                outcome.bytes_copied,
                snapshot
            );
        }
        // Printed even in quiet mode: without it the snapshot cannot be decrypted.
        if let Some(key) = &outcome.encryption_key {
            println!("{}: encryption key {}", name, key);
        }
    }
    Ok(())
}

fn handle_run(path: &Path, selection: &str, json: bool, quiet: bool) -> anyhow::Result<()> {
    let config = load(path);
    let manager = JobManager::new(&config);

    let handles = match manager.start_selection(selection) {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if handles.is_empty() {
        if !quiet && !json {
            println!("No jobs started.");
        }
        return Ok(());
    }

    if !quiet && !json {
        let names: Vec<_> = handles.iter().map(|h| h.job_name.as_str()).collect();
        println!("Started {}", names.join(", "));
    }

    let commands = spawn_stdin_reader();
    let mut stdin_open = true;
    while handles.iter().any(|h| !h.is_finished()) {
        if !stdin_open {
            thread::sleep(Duration::from_millis(200));
            continue;
        }
        match commands.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => handle_control(&manager, &handles, &line, quiet || json),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => stdin_open = false,
        }
    }

    let results: Vec<(String, SaveOutcome)> = handles
        .into_iter()
        .map(|h| (h.job_name.clone(), h.join()))
        .collect();
    persist(path, config, &manager)?;
    print_results(&results, json, quiet)
}

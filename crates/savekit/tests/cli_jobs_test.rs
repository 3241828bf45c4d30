use assert_cmd::prelude::*;
use predicates::prelude::*;
use savekit_lib::config::load_config_from;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{tempdir, TempDir};

struct Workspace {
    temp: TempDir,
    config_path: PathBuf,
}

impl Workspace {
    fn new(extra_global: &str) -> Self {
        let temp = tempdir().unwrap();
        let source = temp.path().join("docs");
        fs::create_dir_all(source.join("letters")).unwrap();
        fs::write(source.join("todo.txt"), "water the plants").unwrap();
        fs::write(source.join("letters/mum.txt"), "hello").unwrap();
        fs::write(source.join("letters/photo.jpg"), [0u8, 1, 2, 3]).unwrap();

        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            format!(
                r#"
[global]
live_state_path = "{state}"
{extra_global}

[[job]]
name = "Docs"
source = "{source}"
target = "{target}"

[[job]]
name = "Music"
source = "{missing}"
target = "{target}"
strategy = "differential"
"#,
                state = temp.path().join("state.json").display(),
                source = source.display(),
                target = temp.path().join("backup").display(),
                missing = temp.path().join("music").display(),
            ),
        )
        .unwrap();
        Self { temp, config_path }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo_bin!("savekit"));
        cmd.env("SAVEKIT_CONFIG", &self.config_path)
            .env("XDG_DATA_HOME", self.temp.path().join("data"))
            .env("XDG_RUNTIME_DIR", self.temp.path().join("runtime"));
        cmd
    }

    fn backup_dir(&self) -> PathBuf {
        self.temp.path().join("backup")
    }
}

fn snapshots(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn test_list_table_and_json() {
    let ws = Workspace::new("");

    ws.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("INDEX"))
        .stdout(predicate::str::contains("Docs"))
        .stdout(predicate::str::contains("differential"))
        .stdout(predicate::str::contains("never"));

    ws.cmd()
        .arg("--json")
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""name": "Docs""#))
        .stdout(predicate::str::contains(r#""strategy": "differential""#));

    ws.cmd().arg("--quiet").arg("list").assert().success().stdout("");
}

#[test]
fn test_run_creates_snapshot_and_records_last_run() {
    let ws = Workspace::new("");

    ws.cmd()
        .arg("run")
        .arg("0")
        .assert()
        .success()
        .stdout(predicate::str::contains("Docs: completed (code 0), 3 file(s)"));

    let snaps = snapshots(&ws.backup_dir());
    assert_eq!(snaps.len(), 1);
    let name = snaps[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("Docs-"));
    assert_eq!(name.len(), "Docs-".len() + 14);
    assert_eq!(fs::read_to_string(snaps[0].join("letters/mum.txt")).unwrap(), "hello");

    let config = load_config_from(&ws.config_path).unwrap();
    assert!(config.jobs[0].last_run.is_some());
    assert!(config.jobs[1].last_run.is_none());

    ws.cmd()
        .arg("status")
        .arg("Docs")
        .assert()
        .success()
        .stdout(predicate::str::contains("Docs: Completed (100%)"));
    ws.cmd()
        .arg("status")
        .arg("Music")
        .assert()
        .success()
        .stdout(predicate::str::contains("not started"));
}

#[test]
fn test_run_reports_missing_source() {
    let ws = Workspace::new("");

    ws.cmd()
        .arg("--json")
        .arg("run")
        .arg("0;1")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""job": "Music""#))
        .stdout(predicate::str::contains(r#""status": 1"#));

    ws.cmd()
        .arg("status")
        .arg("Music")
        .assert()
        .success()
        .stdout(predicate::str::contains("Failed"));
}

#[test]
fn test_out_of_range_selection_exits_1() {
    let ws = Workspace::new("");

    ws.cmd()
        .arg("run")
        .arg("11")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("out of range"));
    ws.cmd().arg("run").arg("1-0").assert().code(1);
    assert!(snapshots(&ws.backup_dir()).is_empty());
}

#[test]
fn test_encryption_without_server_is_status_4() {
    let ws = Workspace::new(
        r#"ipc_timeout_secs = 1

[global.encryption]
enabled = true
extensions = ["*.txt"]"#,
    );

    ws.cmd()
        .arg("run")
        .arg("0")
        .assert()
        .success()
        .stdout(predicate::str::contains("encryption failed (code 4)"))
        .stdout(predicate::str::contains("Docs: encryption key "));

    // The snapshot stays readable.
    let snaps = snapshots(&ws.backup_dir());
    assert_eq!(fs::read_to_string(snaps[0].join("todo.txt")).unwrap(), "water the plants");
}

#[test]
fn test_add_update_delete() {
    let ws = Workspace::new("");
    let photos = ws.temp.path().join("photos");

    ws.cmd()
        .args(["add", "Photos"])
        .arg(&photos)
        .arg(ws.backup_dir())
        .args(["--strategy", "diff"])
        .assert()
        .success();
    ws.cmd()
        .args(["add", "Docs", "/a", "/b"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    ws.cmd()
        .args(["update", "Photos", "--rename", "Pictures", "--strategy", "full"])
        .assert()
        .success();
    let config = load_config_from(&ws.config_path).unwrap();
    let job = config.jobs.iter().find(|j| j.name == "Pictures").unwrap();
    assert_eq!(job.source, photos);
    assert_eq!(job.strategy.to_string(), "full");

    ws.cmd().args(["delete", "Pictures"]).assert().success();
    ws.cmd().args(["delete", "Pictures"]).assert().failure();
    assert_eq!(load_config_from(&ws.config_path).unwrap().jobs.len(), 2);
}

#[test]
fn test_invalid_config_exits_2() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("config.toml");
    fs::write(&config_path, "[[job]]\nname = \"\"\nsource = \"/a\"\ntarget = \"/b\"\n").unwrap();

    let mut cmd = Command::new(assert_cmd::cargo_bin!("savekit"));
    cmd.env("SAVEKIT_CONFIG", &config_path)
        .arg("list")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error loading configuration"));
}

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the project directories for savekit.
fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "savekit")
}

fn home_fallback(parts: &[&str]) -> PathBuf {
    let mut path = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    for part in parts {
        path.push(part);
    }
    path
}

/// Returns the configuration directory: `~/.config/savekit/`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| home_fallback(&[".config", "savekit"]))
}

/// Returns the path to the config file: `~/.config/savekit/config.toml`
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Returns the active configuration path, respecting the `SAVEKIT_CONFIG` environment variable.
pub fn active_config_path() -> PathBuf {
    std::env::var("SAVEKIT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_path())
}

/// Returns the data directory: `~/.local/share/savekit/`
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| home_fallback(&[".local", "share", "savekit"]))
}

/// Returns the live-state document path: `~/.local/share/savekit/state.json`
pub fn live_state_path() -> PathBuf {
    data_dir().join("state.json")
}

/// Returns the directory the crypto server writes its rolling logs into.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn runtime_file(name: &str, ext: &str) -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join(format!("{}.{}", name, ext))
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}.{}", name, uid, ext))
    }
}

/// Returns the crypto server's Unix socket path.
/// Respects `$XDG_RUNTIME_DIR/savekit-crypto.sock` with fallback to `/tmp/savekit-crypto-$UID.sock`.
pub fn socket_path() -> PathBuf {
    runtime_file("savekit-crypto", "sock")
}

/// Returns the crypto server's instance lock path.
/// Respects `$XDG_RUNTIME_DIR/savekit-crypto.lock` with fallback to `/tmp/savekit-crypto-$UID.lock`.
pub fn lock_path() -> PathBuf {
    runtime_file("savekit-crypto", "lock")
}

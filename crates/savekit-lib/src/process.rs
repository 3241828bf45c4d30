use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Source of the names of currently running processes.
pub trait ProcessProbe: Send + Sync {
    fn running_names(&self) -> Vec<String>;
}

/// Reads process names from `/proc/<pid>/comm`.
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    root: PathBuf,
}

impl ProcfsProbe {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for ProcfsProbe {
    fn running_names(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {:?}: {}", self.root, e);
                return Vec::new();
            }
        };

        entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| name.bytes().all(|b| b.is_ascii_digit()))
                    .unwrap_or(false)
            })
            // Processes can exit between listing and reading; skip them.
            .filter_map(|entry| fs::read_to_string(entry.path().join("comm")).ok())
            .map(|comm| comm.trim().to_string())
            .filter(|comm| !comm.is_empty())
            .collect()
    }
}

/// A fixed process list.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    names: Vec<String>,
}

impl StaticProbe {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl ProcessProbe for StaticProbe {
    fn running_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

fn normalize(name: &str) -> String {
    let name = name.trim().to_lowercase();
    name.strip_suffix(".exe").map(str::to_string).unwrap_or(name)
}

/// Returns the first entry of `blocked` that is currently running.
/// Names compare case-insensitively and ignore a trailing `.exe`.
pub fn first_blocked(probe: &dyn ProcessProbe, blocked: &[String]) -> Option<String> {
    if blocked.is_empty() {
        return None;
    }
    let running: Vec<String> = probe.running_names().iter().map(|n| normalize(n)).collect();
    blocked
        .iter()
        .find(|b| {
            let wanted = normalize(b);
            !wanted.is_empty() && running.iter().any(|r| *r == wanted)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_blocked_matches_case_insensitively() {
        let probe = StaticProbe::new(["bash", "Calculator"]);
        let blocked = vec!["notepad.exe".to_string(), "calculator.exe".to_string()];
        assert_eq!(first_blocked(&probe, &blocked), Some("calculator.exe".to_string()));
    }

    #[test]
    fn test_nothing_blocked() {
        let probe = StaticProbe::new(["bash"]);
        assert_eq!(first_blocked(&probe, &["vim".to_string()]), None);
        assert_eq!(first_blocked(&probe, &[]), None);
    }

    #[test]
    fn test_procfs_lists_something_on_linux() {
        if !std::path::Path::new("/proc/self/comm").exists() {
            return;
        }
        let names = ProcfsProbe::new().running_names();
        assert!(!names.is_empty());
    }
}

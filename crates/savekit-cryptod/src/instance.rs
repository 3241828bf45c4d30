use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("Crypto server is already running (PID {0})")]
    AlreadyRunning(String),
    #[error("Lock file error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive `flock` on the lock file, held for the life of the server.
/// The file holds the owner's PID.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, InstanceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                let mut owner = String::new();
                let _ = file.read_to_string(&mut owner);
                return Err(InstanceError::AlreadyRunning(owner.trim().to_string()));
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        info!("Acquired instance lock {:?}", path);

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Only the owner removes the file; the lock itself is released on close.
        if let Ok(content) = fs::read_to_string(&self.path) {
            if content.trim() == std::process::id().to_string() {
                debug!("Removing lock file {:?}", self.path);
                let _ = fs::remove_file(&self.path);
            }
        }
        let _ = self.file.flush();
    }
}

use crate::crypto::ExtensionFilter;
use crate::save::SnapshotEncryptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Exit codes carried by [`CryptoResponse::exit_code`].
pub mod exit_codes {
    pub const OK: i32 = 0;
    /// Unknown action, missing path or malformed request.
    pub const UNKNOWN_ACTION: i32 = 1;
    pub const NOT_FOUND: i32 = 1;
    pub const EXTENSION_NOT_ALLOWED: i32 = 2;
    pub const RUNTIME_ERROR: i32 = 3;
    /// Set by clients when the round trip itself failed.
    pub const ROUND_TRIP_ERROR: i32 = 4;
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed by crypto server")]
    ConnectionClosed,
    #[error("Timed out after {0:?} connecting to the crypto server")]
    ConnectTimeout(Duration),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Operation requested from the crypto server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoAction {
    Encrypt,
    Decrypt,
}

impl CryptoAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoAction::Encrypt => "encrypt",
            CryptoAction::Decrypt => "decrypt",
        }
    }
}

impl fmt::Display for CryptoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CryptoAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "encrypt" => Ok(CryptoAction::Encrypt),
            "decrypt" => Ok(CryptoAction::Decrypt),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// IPC request from a save worker (or any client) to the crypto server.
///
/// `action` stays a string on the wire so an unknown action still parses and
/// can be answered with exit code 1.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CryptoRequest {
    pub action: String,
    /// File or directory to process in place.
    pub source: PathBuf,
    /// Password, sent in clear over the local socket only.
    pub key: String,
    /// Optional comma-separated extension allow-list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<String>,
}

impl CryptoRequest {
    pub fn new(action: CryptoAction, source: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            action: action.as_str().to_string(),
            source: source.into(),
            key: key.into(),
            extensions: None,
        }
    }

    pub fn with_extensions(mut self, filter: &ExtensionFilter) -> Self {
        self.extensions = if filter.is_any() {
            None
        } else {
            Some(filter.to_list())
        };
        self
    }

    pub fn parsed_action(&self) -> Result<CryptoAction, String> {
        self.action.parse()
    }

    pub fn filter(&self) -> ExtensionFilter {
        self.extensions
            .as_deref()
            .map(ExtensionFilter::parse)
            .unwrap_or_default()
    }

    /// Rejects requests that cannot be served. Line framing itself is safe:
    /// serde_json escapes every control character, newlines included.
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.source.as_os_str().is_empty() {
            return Err(IpcError::InvalidRequest("source is empty".into()));
        }
        if self.key.is_empty() {
            return Err(IpcError::InvalidRequest("key is empty".into()));
        }
        Ok(())
    }
}

/// IPC response from the crypto server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CryptoResponse {
    pub exit_code: i32,
    /// Human text; its last non-blank line is the elapsed time in ms.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

impl CryptoResponse {
    pub fn success(summary: &str, elapsed_ms: u64) -> Self {
        Self {
            exit_code: exit_codes::OK,
            output: format!("{}\n{}\n", summary, elapsed_ms),
            error: String::new(),
        }
    }

    pub fn failure(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: String::new(),
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == exit_codes::OK
    }

    /// Parses the elapsed milliseconds from the last non-blank output line.
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.output
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| line.trim().parse().ok())
    }
}

/// Encodes a message as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, IpcError> {
    Ok(serde_json::to_string(message)? + "\n")
}

/// Blocking client for the crypto server. One connection per request.
#[derive(Debug, Clone)]
pub struct CryptoClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl CryptoClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connects on a helper thread so a server with a full accept backlog
    /// cannot hold the caller past `timeout`.
    fn connect(&self) -> Result<UnixStream, IpcError> {
        let (tx, rx) = mpsc::channel();
        let path = self.socket_path.clone();
        thread::Builder::new()
            .name("crypto-connect".into())
            .spawn(move || {
                let _ = tx.send(UnixStream::connect(path));
            })?;
        match rx.recv_timeout(self.timeout) {
            Ok(result) => Ok(result?),
            Err(RecvTimeoutError::Timeout) => Err(IpcError::ConnectTimeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(IpcError::ConnectionClosed),
        }
    }

    pub fn send(&self, request: &CryptoRequest) -> Result<CryptoResponse, IpcError> {
        request.validate()?;

        let mut stream = self.connect()?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        debug!(
            "Sending {} request for {:?} to {:?}",
            request.action, request.source, self.socket_path
        );
        stream.write_all(encode_line(request)?.as_bytes())?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim().is_empty() {
            return Err(IpcError::ConnectionClosed);
        }
        Ok(serde_json::from_str(&line)?)
    }
}

impl SnapshotEncryptor for CryptoClient {
    fn encrypt_snapshot(
        &self,
        snapshot: &Path,
        key: &str,
        filter: &ExtensionFilter,
    ) -> Result<CryptoResponse, IpcError> {
        let request = CryptoRequest::new(CryptoAction::Encrypt, snapshot, key).with_extensions(filter);
        self.send(&request)
    }
}

use anyhow::{Context, Result};
use savekit_lib::ipc::{encode_line, exit_codes, CryptoRequest, CryptoResponse};
use savekit_lib::service;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Accept loop of the crypto server. Construct it only while holding the
/// instance lock: binding replaces any socket file left at the path.
pub struct CryptoServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl CryptoServer {
    pub fn bind(socket_path: &Path) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            warn!("Removing stale socket {:?}", socket_path);
            fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path).context("Failed to bind Unix socket")?;
        info!("Crypto server listening on {:?}", socket_path);
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serves connections until `shutdown` completes, then removes the socket.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accept_res = self.listener.accept() => {
                    match accept_res {
                        Ok((stream, _)) => {
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream).await {
                                    error!("Error handling client: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down crypto server");
                    break;
                }
            }
        }

        if let Err(e) = fs::remove_file(&self.socket_path) {
            debug!("Socket {:?} already gone: {}", self.socket_path, e);
        }
        Ok(())
    }
}

/// Answers every request line on the connection with one response line.
pub async fn handle_client(mut stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<CryptoRequest>(&line) {
            Ok(request) => {
                debug!("Received {} request for {:?}", request.action, request.source);
                match tokio::task::spawn_blocking(move || service::execute(&request)).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!("Crypto task failed: {}", e);
                        CryptoResponse::failure(exit_codes::RUNTIME_ERROR, e.to_string())
                    }
                }
            }
            Err(e) => {
                warn!("Malformed request: {}", e);
                CryptoResponse::failure(
                    exit_codes::UNKNOWN_ACTION,
                    format!("Failed to parse JSON: {}", e),
                )
            }
        };
        line.clear();

        writer.write_all(encode_line(&response)?.as_bytes()).await?;
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use savekit_cryptod::instance::InstanceLock;
use savekit_cryptod::logging;
use savekit_cryptod::server::CryptoServer;
use savekit_lib::paths;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Parser)]
#[command(name = "savekit-cryptod", version, about = "Savekit crypto server")]
struct Args {
    /// Socket to listen on (default: $XDG_RUNTIME_DIR/savekit-crypto.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log to stderr only
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_dir = (!args.no_log_file).then(paths::log_dir);
    let _log_guard = logging::init("info", log_dir.as_deref());

    let (socket_path, lock_path) = match args.socket {
        Some(socket) => {
            let lock = socket.with_extension("lock");
            (socket, lock)
        }
        None => (paths::socket_path(), paths::lock_path()),
    };

    let _lock = InstanceLock::acquire(&lock_path)
        .with_context(|| format!("Cannot start crypto server ({})", lock_path.display()))?;
    let server = CryptoServer::bind(&socket_path)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    server
        .run(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            }
        })
        .await
}

//! Standalone encrypt/decrypt tool. The last line on stdout is always the
//! elapsed time in milliseconds.

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use savekit_cryptod::logging;
use savekit_lib::crypto::{self, CryptoError, ExtensionFilter};
use savekit_lib::ipc::exit_codes;
use savekit_lib::service::exit_code_for;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "savekit-crypt", version, about = "Encrypt or decrypt files with a password")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt one file into <DESTINATION>
    Encrypt {
        source: PathBuf,
        destination: PathBuf,
        key: String,
        /// Comma-separated extensions the source must match
        extensions: Option<String>,
    },
    /// Decrypt one file into <DESTINATION>
    Decrypt {
        source: PathBuf,
        destination: PathBuf,
        key: String,
    },
    /// Encrypt matching files under a directory in place
    EncryptDir {
        dir: PathBuf,
        key: String,
        extensions: String,
    },
    /// Decrypt matching files under a directory in place
    DecryptDir {
        dir: PathBuf,
        key: String,
        extensions: String,
    },
}

fn main() {
    let _ = logging::init("warn", None);
    let started = Instant::now();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::OK,
                _ => exit_codes::UNKNOWN_ACTION,
            };
            println!("{}", started.elapsed().as_millis());
            process::exit(code);
        }
    };

    let code = match execute(cli.command) {
        Ok(summary) => {
            println!("{}", summary);
            exit_codes::OK
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_code_for(&e)
        }
    };
    println!("{}", started.elapsed().as_millis());
    process::exit(code);
}

fn require_file(path: &Path) -> Result<(), CryptoError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CryptoError::NotFound(path.to_path_buf()))
    }
}

fn execute(command: Commands) -> Result<String, CryptoError> {
    match command {
        Commands::Encrypt {
            source,
            destination,
            key,
            extensions,
        } => {
            require_file(&source)?;
            if let Some(list) = extensions {
                if !ExtensionFilter::parse(&list).allows(&source) {
                    return Err(CryptoError::ExtensionNotAllowed(source));
                }
            }
            crypto::encrypt_file(&source, &destination, &key)?;
            Ok(format!("Encrypted {} -> {}", source.display(), destination.display()))
        }
        Commands::Decrypt {
            source,
            destination,
            key,
        } => {
            crypto::decrypt_file(&source, &destination, &key)?;
            Ok(format!("Decrypted {} -> {}", source.display(), destination.display()))
        }
        Commands::EncryptDir {
            dir,
            key,
            extensions,
        } => {
            let report = crypto::encrypt_directory(&dir, &key, &ExtensionFilter::parse(&extensions))?;
            Ok(format!(
                "Encrypted {} file(s) under {}",
                report.files_processed,
                dir.display()
            ))
        }
        Commands::DecryptDir {
            dir,
            key,
            extensions,
        } => {
            let report = crypto::decrypt_directory(&dir, &key, &ExtensionFilter::parse(&extensions))?;
            Ok(format!(
                "Decrypted {} file(s) under {}",
                report.files_processed,
                dir.display()
            ))
        }
    }
}

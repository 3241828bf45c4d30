//! Serves a [`CryptoRequest`] with the crypto core.

use crate::crypto::{self, CryptoError};
use crate::ipc::{exit_codes, CryptoAction, CryptoRequest, CryptoResponse};
use tracing::{info, warn};

/// Maps a crypto failure to the exit code used on the wire and by the CLI tool.
pub fn exit_code_for(err: &CryptoError) -> i32 {
    match err {
        CryptoError::NotFound(_) => exit_codes::NOT_FOUND,
        CryptoError::ExtensionNotAllowed(_) => exit_codes::EXTENSION_NOT_ALLOWED,
        CryptoError::BadKey | CryptoError::CorruptData(_) | CryptoError::Io(_) => {
            exit_codes::RUNTIME_ERROR
        }
    }
}

/// Runs one request. Directories are processed recursively with the
/// request's filter; a single file is processed in place when the filter
/// allows it.
pub fn execute(request: &CryptoRequest) -> CryptoResponse {
    if let Err(e) = request.validate() {
        return CryptoResponse::failure(exit_codes::UNKNOWN_ACTION, e.to_string());
    }
    let action = match request.parsed_action() {
        Ok(action) => action,
        Err(e) => return CryptoResponse::failure(exit_codes::UNKNOWN_ACTION, e),
    };
    let filter = request.filter();
    let source = request.source.as_path();

    let result = if source.is_dir() {
        let report = match action {
            CryptoAction::Encrypt => crypto::encrypt_directory(source, &request.key, &filter),
            CryptoAction::Decrypt => crypto::decrypt_directory(source, &request.key, &filter),
        };
        report.map(|r| {
            (
                format!("{}ed {} file(s) under {}", action, r.files_processed, source.display()),
                r.elapsed_ms,
            )
        })
    } else if source.is_file() {
        if filter.allows(source) {
            let elapsed = match action {
                CryptoAction::Encrypt => crypto::encrypt_in_place(source, &request.key),
                CryptoAction::Decrypt => crypto::decrypt_in_place(source, &request.key),
            };
            elapsed.map(|ms| (format!("{}ed {}", action, source.display()), ms))
        } else {
            Err(CryptoError::ExtensionNotAllowed(source.to_path_buf()))
        }
    } else {
        Err(CryptoError::NotFound(source.to_path_buf()))
    };

    match result {
        Ok((summary, elapsed_ms)) => {
            info!("{} ({}ms)", summary, elapsed_ms);
            CryptoResponse::success(&summary, elapsed_ms)
        }
        Err(e) => {
            warn!("{} request for {:?} failed: {}", action, source, e);
            CryptoResponse::failure(exit_code_for(&e), e.to_string())
        }
    }
}

//! File encryption core.
//!
//! Every encrypted file uses the same envelope:
//!
//! ```text
//! salt (16 bytes) || iv (16 bytes) || AES-256-CBC ciphertext (PKCS#7 padded)
//! ```
//!
//! The key is derived from the password and the per-file salt with
//! PBKDF2-HMAC-SHA256. Salt and IV come from the OS random source and are
//! never reused, so encrypting the same file twice yields different bytes.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN;
pub const KEY_LEN: usize = 32;
pub const PBKDF2_ITERATIONS: u32 = 100_000;
const BLOCK_LEN: usize = 16;
const CHUNK_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Source not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Extension not allowed: {0:?}")]
    ExtensionNotAllowed(PathBuf),
    #[error("Wrong key or corrupted data")]
    BadKey,
    #[error("Corrupt encrypted data: {0}")]
    CorruptData(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Aggregate result of a directory-wide operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryReport {
    pub elapsed_ms: u64,
    /// Files processed successfully; failures are not counted.
    pub files_processed: u64,
}

/// Case-insensitive allow-list of file extensions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtensionFilter {
    /// Normalised entries (`.txt`). Empty means every file is allowed.
    extensions: Vec<String>,
}

impl ExtensionFilter {
    /// A filter that allows every file.
    pub fn any() -> Self {
        Self::default()
    }

    /// Builds a filter from entries such as `txt`, `.TXT` or `*.txt`.
    /// `*` and `*.*` widen the filter to every file.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut extensions = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" || entry == "*.*" {
                return Self::any();
            }
            let bare = entry.trim_start_matches('*').trim_start_matches('.');
            if bare.is_empty() {
                continue;
            }
            let normalized = format!(".{}", bare.to_lowercase());
            if !extensions.contains(&normalized) {
                extensions.push(normalized);
            }
        }
        Self { extensions }
    }

    /// Parses a comma-separated allow-list.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn is_any(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn allows(&self, path: &Path) -> bool {
        if self.is_any() {
            return true;
        }
        match path.extension() {
            Some(ext) => {
                let ext = format!(".{}", ext.to_string_lossy().to_lowercase());
                self.extensions.iter().any(|e| *e == ext)
            }
            None => false,
        }
    }

    /// Comma-separated form used on the IPC wire.
    pub fn to_list(&self) -> String {
        self.extensions.join(",")
    }
}

/// Derives the 32-byte AES key for `password` and `salt`.
pub fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypts `source` into `destination`, returning the elapsed milliseconds.
pub fn encrypt_file(source: &Path, destination: &Path, password: &str) -> Result<u64, CryptoError> {
    let started = Instant::now();
    if !source.is_file() {
        return Err(CryptoError::NotFound(source.to_path_buf()));
    }
    create_parent(destination)?;

    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);
    let key = derive_key(password, &salt);

    let reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(destination)?);
    writer.write_all(&salt)?;
    writer.write_all(&iv)?;
    let result = encrypt_stream(reader, &mut writer, &key, &iv).and_then(|_| {
        writer.flush()?;
        Ok(())
    });
    if let Err(e) = result {
        drop(writer);
        let _ = fs::remove_file(destination);
        return Err(e);
    }

    let elapsed = started.elapsed().as_millis() as u64;
    debug!("Encrypted {:?} -> {:?} in {}ms", source, destination, elapsed);
    Ok(elapsed)
}

/// Decrypts `source` into `destination`, returning the elapsed milliseconds.
///
/// A wrong password surfaces as [`CryptoError::BadKey`]; the partial
/// destination is removed.
pub fn decrypt_file(source: &Path, destination: &Path, password: &str) -> Result<u64, CryptoError> {
    let started = Instant::now();
    if !source.is_file() {
        return Err(CryptoError::NotFound(source.to_path_buf()));
    }

    let mut reader = BufReader::new(File::open(source)?);
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(CryptoError::CorruptData("missing salt/IV header".into()));
        }
        return Err(e.into());
    }
    let (salt, iv) = header.split_at(SALT_LEN);
    let key = derive_key(password, salt);

    create_parent(destination)?;
    let mut writer = BufWriter::new(File::create(destination)?);
    let result = decrypt_stream(reader, &mut writer, &key, iv).and_then(|_| {
        writer.flush()?;
        Ok(())
    });
    if let Err(e) = result {
        drop(writer);
        let _ = fs::remove_file(destination);
        return Err(e);
    }

    let elapsed = started.elapsed().as_millis() as u64;
    debug!("Decrypted {:?} -> {:?} in {}ms", source, destination, elapsed);
    Ok(elapsed)
}

fn create_parent(path: &Path) -> Result<(), CryptoError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn encrypt_stream(
    mut reader: impl Read,
    writer: &mut impl Write,
    key: &[u8; KEY_LEN],
    iv: &[u8],
) -> Result<(), CryptoError> {
    let mut cipher = Aes256CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    let mut chunk = vec![0u8; CHUNK_LEN];

    loop {
        let n = read_full(&mut reader, &mut chunk)?;
        if n < CHUNK_LEN {
            // Final chunk: whole blocks as-is, the tail goes through the padder.
            let whole = n - n % BLOCK_LEN;
            for block in chunk[..whole].chunks_exact_mut(BLOCK_LEN) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&chunk[..whole])?;

            let tail_len = n - whole;
            let mut last = [0u8; BLOCK_LEN];
            last[..tail_len].copy_from_slice(&chunk[whole..n]);
            let padded = cipher
                .encrypt_padded_mut::<Pkcs7>(&mut last, tail_len)
                .map_err(|_| CryptoError::CorruptData("padding failed".into()))?;
            writer.write_all(padded)?;
            return Ok(());
        }

        for block in chunk.chunks_exact_mut(BLOCK_LEN) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&chunk)?;
    }
}

fn decrypt_stream(
    mut reader: impl Read,
    writer: &mut impl Write,
    key: &[u8; KEY_LEN],
    iv: &[u8],
) -> Result<(), CryptoError> {
    let mut cipher = Aes256CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    let mut chunk = vec![0u8; CHUNK_LEN];
    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_LEN + BLOCK_LEN);

    loop {
        let n = read_full(&mut reader, &mut chunk)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..n]);

        // The last block carries the padding; hold it back until EOF.
        if pending.len() > BLOCK_LEN {
            let ready = ((pending.len() - 1) / BLOCK_LEN) * BLOCK_LEN;
            for block in pending[..ready].chunks_exact_mut(BLOCK_LEN) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&pending[..ready])?;
            pending.drain(..ready);
        }
    }

    if pending.len() != BLOCK_LEN {
        return Err(CryptoError::CorruptData(format!(
            "ciphertext length is not a multiple of {} bytes",
            BLOCK_LEN
        )));
    }
    let plain = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut pending)
        .map_err(|_| CryptoError::BadKey)?;
    writer.write_all(plain)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    fn temp_suffix(self) -> &'static str {
        match self {
            Direction::Encrypt => ".enc.tmp",
            Direction::Decrypt => ".dec.tmp",
        }
    }

    fn apply(self, source: &Path, destination: &Path, password: &str) -> Result<u64, CryptoError> {
        match self {
            Direction::Encrypt => encrypt_file(source, destination, password),
            Direction::Decrypt => decrypt_file(source, destination, password),
        }
    }
}

fn temp_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Encrypts `path` where it lies: the ciphertext replaces the original file.
pub fn encrypt_in_place(path: &Path, password: &str) -> Result<u64, CryptoError> {
    process_in_place(Direction::Encrypt, path, password)
}

/// Decrypts `path` where it lies: the plaintext replaces the encrypted file.
pub fn decrypt_in_place(path: &Path, password: &str) -> Result<u64, CryptoError> {
    process_in_place(Direction::Decrypt, path, password)
}

fn process_in_place(direction: Direction, path: &Path, password: &str) -> Result<u64, CryptoError> {
    let temp = temp_sibling(path, direction.temp_suffix());
    let result = direction.apply(path, &temp, password).and_then(|elapsed| {
        fs::remove_file(path)?;
        fs::rename(&temp, path)?;
        Ok(elapsed)
    });
    if result.is_err() && temp.exists() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Encrypts, in place, every file under `root` allowed by `filter`.
pub fn encrypt_directory(
    root: &Path,
    password: &str,
    filter: &ExtensionFilter,
) -> Result<DirectoryReport, CryptoError> {
    process_directory(Direction::Encrypt, root, password, filter)
}

/// Decrypts, in place, every file under `root` allowed by `filter`.
pub fn decrypt_directory(
    root: &Path,
    password: &str,
    filter: &ExtensionFilter,
) -> Result<DirectoryReport, CryptoError> {
    process_directory(Direction::Decrypt, root, password, filter)
}

fn process_directory(
    direction: Direction,
    root: &Path,
    password: &str,
    filter: &ExtensionFilter,
) -> Result<DirectoryReport, CryptoError> {
    let started = Instant::now();
    if !root.is_dir() {
        return Err(CryptoError::NotFound(root.to_path_buf()));
    }

    // Collect first so renames never disturb the walk.
    let files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", root, e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| filter.allows(path))
        .collect();

    let mut files_processed = 0;
    for file in files {
        match process_in_place(direction, &file, password) {
            Ok(_) => files_processed += 1,
            Err(e) => warn!("Failed to {:?} {:?}: {}", direction, file, e),
        }
    }

    Ok(DirectoryReport {
        elapsed_ms: started.elapsed().as_millis() as u64,
        files_processed,
    })
}

//! Decrypt a password-protected Office document to a new path, or copy it verbatim when it is
//! not encrypted.
//!
//! The output is always written atomically: a failed run leaves the output path exactly as it
//! was before.

pub mod cli;
mod error;

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use unlock_fs::{atomic_write, AtomicWriteError};
use unlock_offcrypto::{OfficeFile, OffcryptoError};

pub use crate::error::UnlockError;

/// What a successful run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The input was encrypted; `bytes` of plaintext were written.
    Decrypted { bytes: u64 },
    /// The input was not encrypted and was copied unchanged.
    Copied { bytes: u64 },
}

/// Decrypt `input` with `password` into `output`, or copy it if it is not encrypted.
///
/// The password is verified before the output is touched. Input that is not an Office document
/// (neither a ZIP package nor a recognised compound file) is an error and is not copied.
pub fn decrypt_or_copy(input: &Path, output: &Path, password: &str) -> Result<Outcome, UnlockError> {
    let file = open_input(input)?;
    let mut doc = OfficeFile::from_reader(file).map_err(|err| match err {
        OffcryptoError::Io(source) if source.kind() != io::ErrorKind::InvalidData => {
            UnlockError::InputUnreadable {
                path: input.to_path_buf(),
                source,
            }
        }
        other => UnlockError::DecryptionFailed(other),
    })?;
    log::debug!(
        "{}: {} (encrypted: {})",
        input.display(),
        doc.format(),
        doc.is_encrypted()
    );

    if doc.is_encrypted() {
        doc.unlock(password).map_err(UnlockError::DecryptionFailed)?;
        let bytes = atomic_write(output, |file| -> Result<u64, OffcryptoError> {
            let mut writer = BufWriter::new(file);
            let n = doc.decrypt_into(&mut writer)?;
            writer.flush()?;
            Ok(n)
        })
        .map_err(|err| write_error(output, err))?;
        log::info!(
            "decrypted {} to {} ({bytes} bytes)",
            input.display(),
            output.display()
        );
        Ok(Outcome::Decrypted { bytes })
    } else {
        let mut inner = doc.into_inner();
        inner
            .seek(SeekFrom::Start(0))
            .map_err(|source| UnlockError::InputUnreadable {
                path: input.to_path_buf(),
                source,
            })?;
        let bytes = atomic_write(output, |file| {
            io::copy(&mut inner, file).map_err(OffcryptoError::from)
        })
        .map_err(|err| write_error(output, err))?;
        log::info!(
            "{} is not encrypted; copied to {} ({bytes} bytes)",
            input.display(),
            output.display()
        );
        Ok(Outcome::Copied { bytes })
    }
}

fn open_input(input: &Path) -> Result<File, UnlockError> {
    let unreadable = |source: io::Error| UnlockError::InputUnreadable {
        path: input.to_path_buf(),
        source,
    };
    let file = File::open(input).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => UnlockError::InputNotFound {
            path: input.to_path_buf(),
        },
        _ => unreadable(source),
    })?;
    if file.metadata().map_err(unreadable)?.is_dir() {
        return Err(unreadable(io::Error::other("is a directory")));
    }
    Ok(file)
}

fn write_error(output: &Path, err: AtomicWriteError<OffcryptoError>) -> UnlockError {
    match err {
        AtomicWriteError::Create { source, .. } | AtomicWriteError::Commit { source, .. } => {
            UnlockError::OutputNotWritable {
                path: output.to_path_buf(),
                source,
            }
        }
        AtomicWriteError::Writer(OffcryptoError::Io(err)) => {
            UnlockError::Unexpected(format!("I/O error while writing {}: {err}", output.display()))
        }
        AtomicWriteError::Writer(other) => UnlockError::DecryptionFailed(other),
    }
}

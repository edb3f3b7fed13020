use std::io;
use std::path::PathBuf;

use unlock_offcrypto::OffcryptoError;

/// Every way a decrypt-or-copy run can fail.
#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error("input file not found: {}", path.display())]
    InputNotFound { path: PathBuf },
    #[error("cannot read input file {}: {source}", path.display())]
    InputUnreadable { path: PathBuf, source: io::Error },
    #[error("cannot write output file {}: {source}", path.display())]
    OutputNotWritable { path: PathBuf, source: io::Error },
    /// Wrong password, or a corrupt or unsupported document.
    #[error("decryption failed: {0}")]
    DecryptionFailed(#[source] OffcryptoError),
    /// The password operand cannot be converted to UTF-16 for key derivation.
    #[error("password is not valid Unicode")]
    PasswordNotUnicode,
    #[error("{0}")]
    Unexpected(String),
}

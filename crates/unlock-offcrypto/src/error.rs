use thiserror::Error;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum OffcryptoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// `unlock`/`decrypt_into` was called on a document that is not encrypted.
    #[error("document is not encrypted")]
    NotEncrypted,
    /// `decrypt_into` was called before a password was accepted by `unlock`.
    #[error("no key loaded (unlock the document with a password first)")]
    KeyNotLoaded,
    /// Password/key did not pass the verifier check.
    #[error("invalid password")]
    InvalidPassword,
    /// Agile `dataIntegrity` HMAC did not match the `EncryptedPackage` stream.
    #[error("integrity check failed (EncryptedPackage HMAC mismatch)")]
    IntegrityCheckFailed,
    /// The document is encrypted with a scheme this crate can detect but not decrypt.
    #[error("unsupported encryption: {0}")]
    UnsupportedEncryption(String),
    #[error("unsupported EncryptionInfo version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("unsupported encryption algorithm id 0x{0:08X}")]
    UnsupportedAlgorithm(u32),
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),
    /// The stream contents are structurally invalid (e.g. missing required attributes).
    #[error("invalid EncryptionInfo: {context}")]
    InvalidEncryptionInfo { context: &'static str },
    /// The `.xls` `FILEPASS` record is missing or malformed.
    #[error("invalid FILEPASS record: {context}")]
    InvalidFilePass { context: &'static str },
    /// The input is neither an OLE compound file nor a ZIP package.
    #[error("unsupported file format")]
    UnsupportedFileFormat,
    /// An OLE compound file that is not an Office document this crate recognises.
    #[error("unrecognized OLE file format")]
    UnrecognizedOleFormat,
    /// Not enough bytes to parse or decrypt the requested structure.
    #[error("truncated data while reading {context}")]
    Truncated { context: &'static str },
    #[error("invalid AES key length {len}; expected 16, 24, or 32 bytes")]
    InvalidKeyLength { len: usize },
    #[error("ciphertext length must be a multiple of 16 bytes, got {len}")]
    InvalidCiphertextLength { len: usize },
}

//! Detection and decryption of password-protected Office documents.
//!
//! This crate supports:
//! - Classifying a document as a plain OOXML ZIP package, an MS-OFFCRYPTO `EncryptedPackage`
//!   OLE/CFB wrapper, or a legacy 97-2003 binary (`.xls`/`.doc`/`.ppt`) with its encryption flag
//! - MS-OFFCRYPTO "Agile Encryption" (XML descriptor, Office 2010+), including the optional
//!   `dataIntegrity` HMAC check
//! - MS-OFFCRYPTO / ECMA-376 "Standard Encryption" (binary descriptor, AES-ECB)
//! - BIFF8 `.xls` workbooks protected with RC4 or RC4 CryptoAPI (`FILEPASS`)
//!
//! Anything else (text files, unrelated compound files) is rejected when opened.
//!
//! Decryption streams the `EncryptedPackage` segment by segment into any [`Write`] sink; a
//! legacy workbook is decrypted in memory and written out as a new compound file. The password
//! is verified in [`OfficeFile::unlock`], before anything is written.
//!
//! ```no_run
//! use unlock_offcrypto::OfficeFile;
//!
//! # fn main() -> Result<(), unlock_offcrypto::OffcryptoError> {
//! let mut doc = OfficeFile::open("protected.xlsx")?;
//! if doc.is_encrypted() {
//!     doc.unlock("hunter2")?;
//!     let mut out = Vec::new();
//!     doc.decrypt_into(&mut out)?;
//! }
//! # Ok(())
//! # }
//! ```

mod agile;
mod biff;
mod container;
mod crypto;
mod encryption_info;
mod error;
mod package;
mod rc4;
mod standard;

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use cfb::CompoundFile;

use crate::agile::IntegrityKeys;
use crate::biff::WorkbookKey;
use crate::container::{ENCRYPTED_PACKAGE_STREAM, ENCRYPTION_INFO_STREAM};
use crate::package::{PackageKey, SIZE_PREFIX_LEN};

pub use crate::container::OLE_MAGIC;
pub use crate::crypto::HashAlgorithm;
pub use crate::encryption_info::{
    parse_encryption_info, AgileDataIntegrity, AgileEncryptionInfo, AgileKeyData,
    AgilePasswordKey, EncryptionInfo, EncryptionVersionInfo, StandardEncryptionHeader,
    StandardEncryptionVerifier, MAX_SPIN_COUNT,
};
pub use crate::error::OffcryptoError;
pub use crate::standard::{derive_key as standard_derive_key, verify_key as standard_verify_key};

/// Container classification established when a document is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// A ZIP container, e.g. an unencrypted `.xlsx`/`.docx`/`.pptx`. Never encrypted.
    Zip,
    /// OLE/CFB wrapper holding `EncryptionInfo` + `EncryptedPackage`.
    EncryptedPackage,
    LegacyExcel,
    LegacyWord,
    LegacyPowerPoint,
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentFormat::Zip => "ZIP package",
            DocumentFormat::EncryptedPackage => "OOXML EncryptedPackage",
            DocumentFormat::LegacyExcel => "legacy Excel workbook (.xls)",
            DocumentFormat::LegacyWord => "legacy Word document (.doc)",
            DocumentFormat::LegacyPowerPoint => "legacy PowerPoint presentation (.ppt)",
        })
    }
}

/// Options for [`OfficeFile::decrypt_into_with_options`].
///
/// The default does not check integrity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecryptOptions {
    /// Check the Agile `dataIntegrity` HMAC over the whole `EncryptedPackage` stream before
    /// writing any plaintext. Ignored for Standard and legacy encryption, which have no HMAC.
    pub verify_integrity: bool,
}

enum Container<F> {
    Raw(F),
    Compound(CompoundFile<F>),
}

enum UnlockedKey {
    Package {
        package: PackageKey,
        integrity: Option<IntegrityKeys>,
    },
    Workbook {
        stream: &'static str,
        key: WorkbookKey,
    },
}

/// An opened document: queryable for its encryption state and unlockable with a password.
pub struct OfficeFile<F> {
    format: DocumentFormat,
    encrypted: bool,
    container: Container<F>,
    key: Option<UnlockedKey>,
}

impl<F> fmt::Debug for OfficeFile<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeFile")
            .field("format", &self.format)
            .field("encrypted", &self.encrypted)
            .field("unlocked", &self.key.is_some())
            .finish()
    }
}

impl OfficeFile<File> {
    /// Open the document at `path` for reading and classify it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OffcryptoError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }
}

impl<F: Read + Seek> OfficeFile<F> {
    /// Classify the document behind `inner`.
    ///
    /// A ZIP container is [`DocumentFormat::Zip`] and never encrypted. Input that is neither a
    /// ZIP nor a compound file fails with [`OffcryptoError::UnsupportedFileFormat`], and a
    /// compound file without recognised Office streams with
    /// [`OffcryptoError::UnrecognizedOleFormat`].
    pub fn from_reader(mut inner: F) -> Result<Self, OffcryptoError> {
        inner.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; OLE_MAGIC.len()];
        let n = container::read_prefix(&mut inner, &mut magic)?;
        inner.seek(SeekFrom::Start(0))?;
        let prefix = &magic[..n];

        if container::is_zip(prefix) {
            log::debug!("input is a ZIP container");
            return Ok(Self {
                format: DocumentFormat::Zip,
                encrypted: false,
                container: Container::Raw(inner),
                key: None,
            });
        }
        if prefix != OLE_MAGIC {
            log::debug!("input is neither a ZIP nor an OLE compound file ({n} byte prefix)");
            return Err(OffcryptoError::UnsupportedFileFormat);
        }

        let mut ole = CompoundFile::open(inner)?;
        let (format, encrypted) = container::classify(&mut ole)?;
        log::debug!("classified input as {format} (encrypted: {encrypted})");
        Ok(Self {
            format,
            encrypted,
            container: Container::Compound(ole),
            key: None,
        })
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Read and parse the `EncryptionInfo` stream of an `EncryptedPackage` document.
    pub fn encryption_info(&mut self) -> Result<EncryptionInfo, OffcryptoError> {
        let ole = self.encrypted_package_container()?;
        let mut bytes = Vec::new();
        ole.open_stream(ENCRYPTION_INFO_STREAM)?
            .read_to_end(&mut bytes)?;
        parse_encryption_info(&bytes)
    }

    /// Derive the document key from `password` and verify it against the stored verifier.
    ///
    /// A wrong password fails with [`OffcryptoError::InvalidPassword`]. The key stays loaded
    /// for subsequent [`decrypt_into`](Self::decrypt_into) calls. Encrypted `.doc`/`.ppt` files
    /// and XOR-obfuscated workbooks fail with [`OffcryptoError::UnsupportedEncryption`].
    pub fn unlock(&mut self, password: &str) -> Result<(), OffcryptoError> {
        if !self.encrypted {
            return Err(OffcryptoError::NotEncrypted);
        }
        let key = match self.format {
            DocumentFormat::LegacyExcel => self.unlock_workbook(password)?,
            _ => self.unlock_package(password)?,
        };
        self.key = Some(key);
        Ok(())
    }

    fn unlock_workbook(&mut self, password: &str) -> Result<UnlockedKey, OffcryptoError> {
        let Container::Compound(ole) = &mut self.container else {
            return Err(OffcryptoError::NotEncrypted);
        };
        let stream = container::workbook_stream(ole).ok_or(OffcryptoError::InvalidFilePass {
            context: "no workbook stream",
        })?;
        let workbook = container::read_stream(ole, stream)?;
        let filepass = biff::read_filepass(&workbook)?;
        let key = biff::unlock(&filepass, password)?;
        Ok(UnlockedKey::Workbook { stream, key })
    }

    fn unlock_package(&mut self, password: &str) -> Result<UnlockedKey, OffcryptoError> {
        let info = self.encryption_info()?;
        self.check_declared_size()?;

        let key = match info {
            EncryptionInfo::Standard {
                header, verifier, ..
            } => {
                let key = standard::derive_key(&header, &verifier, password)?;
                standard::verify_key(&verifier, &key)?;
                log::debug!("unlocked Standard encryption ({} bits)", header.key_size_bits);
                UnlockedKey::Package {
                    package: PackageKey::StandardEcb { key },
                    integrity: None,
                }
            }
            EncryptionInfo::Agile { info, .. } => {
                let secret = agile::secret_key_from_password(&info, password)?;
                let integrity = info
                    .data_integrity
                    .as_ref()
                    .map(|di| agile::integrity_keys(&info, di, &secret))
                    .transpose()?;
                log::debug!(
                    "unlocked Agile encryption ({:?}, {} key bytes)",
                    info.key_data.hash_algorithm,
                    secret.len()
                );
                UnlockedKey::Package {
                    package: PackageKey::Agile {
                        key: secret,
                        salt: info.key_data.salt,
                        hash_alg: info.key_data.hash_algorithm,
                        block_size: info.key_data.block_size,
                    },
                    integrity,
                }
            }
            EncryptionInfo::Unsupported { version } => {
                return Err(OffcryptoError::UnsupportedVersion {
                    major: version.major,
                    minor: version.minor,
                })
            }
        };
        Ok(key)
    }

    /// Write the decrypted document into `writer` with default [`DecryptOptions`].
    pub fn decrypt_into<W: Write + ?Sized>(&mut self, writer: &mut W) -> Result<u64, OffcryptoError> {
        self.decrypt_into_with_options(writer, DecryptOptions::default())
    }

    /// Write the decrypted document into `writer`, returning the plaintext length.
    pub fn decrypt_into_with_options<W: Write + ?Sized>(
        &mut self,
        writer: &mut W,
        options: DecryptOptions,
    ) -> Result<u64, OffcryptoError> {
        if !self.encrypted {
            return Err(OffcryptoError::NotEncrypted);
        }
        let key = self.key.as_ref().ok_or(OffcryptoError::KeyNotLoaded)?;
        let Container::Compound(ole) = &mut self.container else {
            return Err(OffcryptoError::KeyNotLoaded);
        };

        let (package, integrity) = match key {
            UnlockedKey::Package { package, integrity } => (package, integrity),
            UnlockedKey::Workbook { stream, key } => {
                let mut workbook = container::read_stream(ole, stream)?;
                biff::decrypt_workbook_stream(&mut workbook, key)?;
                let bytes = container::rewrite_with_stream(ole, stream, &workbook)?;
                writer.write_all(&bytes)?;
                log::debug!("decrypted {stream} stream ({} bytes)", workbook.len());
                return Ok(bytes.len() as u64);
            }
        };

        if options.verify_integrity {
            if let Some(integrity) = integrity {
                let mac = crypto::HmacState::new(integrity.hash_algorithm, &integrity.hmac_key)?;
                let mut stream = ole.open_stream(ENCRYPTED_PACKAGE_STREAM)?;
                let computed = package::hmac_stream(mac, &mut stream)?;
                if !agile::digest_prefix_matches(&computed, &integrity.expected_hmac) {
                    return Err(OffcryptoError::IntegrityCheckFailed);
                }
                log::debug!("EncryptedPackage HMAC verified");
            }
        }

        let mut stream = ole.open_stream(ENCRYPTED_PACKAGE_STREAM)?;
        package::decrypt_package(package, &mut stream, writer)
    }

    /// Give back the underlying reader. Its position is unspecified.
    pub fn into_inner(self) -> F {
        match self.container {
            Container::Raw(inner) => inner,
            Container::Compound(ole) => ole.into_inner(),
        }
    }

    fn encrypted_package_container(&mut self) -> Result<&mut CompoundFile<F>, OffcryptoError> {
        if !self.encrypted {
            return Err(OffcryptoError::NotEncrypted);
        }
        match (&mut self.container, self.format) {
            (Container::Compound(ole), DocumentFormat::EncryptedPackage) => Ok(ole),
            (_, format) => Err(OffcryptoError::UnsupportedEncryption(format!(
                "{format} encryption is detected but not decrypted"
            ))),
        }
    }

    /// The declared plaintext size must be backed by enough ciphertext.
    fn check_declared_size(&mut self) -> Result<(), OffcryptoError> {
        let ole = self.encrypted_package_container()?;
        let mut stream = ole.open_stream(ENCRYPTED_PACKAGE_STREAM)?;
        let available = stream.len().saturating_sub(SIZE_PREFIX_LEN);
        let declared = package::read_declared_size(&mut stream)?;
        if declared > available || package::required_ciphertext_len(declared) > available {
            log::warn!("EncryptedPackage declares {declared} bytes but holds {available}");
            return Err(OffcryptoError::Truncated {
                context: "EncryptedPackage (ciphertext shorter than declared size)",
            });
        }
        Ok(())
    }
}

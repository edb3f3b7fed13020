//! Streaming decryption of the `EncryptedPackage` stream.
//!
//! The stream starts with an 8-byte little-endian plaintext size followed by ciphertext. The
//! ciphertext is processed in 4096-byte segments; the last one is rounded up to the AES block
//! size and its plaintext truncated to the declared size.

use std::fmt;
use std::io::{self, Read, Write};

use zeroize::Zeroizing;

use crate::crypto::{
    aes_cbc_decrypt_in_place, aes_ecb_decrypt_in_place, derive_iv, HashAlgorithm, HmacState,
    AES_BLOCK_SIZE,
};
use crate::OffcryptoError;

pub(crate) const SEGMENT_LEN: usize = 0x1000;
pub(crate) const SIZE_PREFIX_LEN: u64 = 8;

/// Key material for the package, resolved by a successful unlock.
pub(crate) enum PackageKey {
    /// Standard (CryptoAPI) encryption: AES-ECB, no IV, no chaining.
    StandardEcb { key: Zeroizing<Vec<u8>> },
    /// Agile encryption: segment `i` is AES-CBC with IV `Truncate(blockSize, Hash(salt || LE32(i)))`.
    Agile {
        key: Zeroizing<Vec<u8>>,
        salt: Vec<u8>,
        hash_alg: HashAlgorithm,
        block_size: usize,
    },
}

impl fmt::Debug for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageKey::StandardEcb { key } => f
                .debug_struct("StandardEcb")
                .field("key_len", &key.len())
                .finish(),
            PackageKey::Agile {
                key,
                hash_alg,
                block_size,
                ..
            } => f
                .debug_struct("Agile")
                .field("key_len", &key.len())
                .field("hash_alg", hash_alg)
                .field("block_size", block_size)
                .finish_non_exhaustive(),
        }
    }
}

impl PackageKey {
    fn decrypt_segment(&self, index: u32, buf: &mut [u8]) -> Result<(), OffcryptoError> {
        match self {
            PackageKey::StandardEcb { key } => aes_ecb_decrypt_in_place(key, buf),
            PackageKey::Agile {
                key,
                salt,
                hash_alg,
                block_size,
            } => {
                let iv = derive_iv(salt, &index.to_le_bytes(), *block_size, *hash_alg);
                aes_cbc_decrypt_in_place(key, &iv, buf)
            }
        }
    }
}

fn round_up_to_multiple(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

/// Ciphertext bytes needed after the size prefix to recover `declared` plaintext bytes.
pub(crate) fn required_ciphertext_len(declared: u64) -> u64 {
    round_up_to_multiple(declared, AES_BLOCK_SIZE as u64)
}

fn map_eof(err: io::Error, context: &'static str) -> OffcryptoError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        OffcryptoError::Truncated { context }
    } else {
        OffcryptoError::Io(err)
    }
}

pub(crate) fn read_declared_size<R: Read>(reader: &mut R) -> Result<u64, OffcryptoError> {
    let mut prefix = [0u8; SIZE_PREFIX_LEN as usize];
    reader
        .read_exact(&mut prefix)
        .map_err(|err| map_eof(err, "EncryptedPackage size prefix"))?;
    Ok(u64::from_le_bytes(prefix))
}

/// Decrypt a full `EncryptedPackage` stream from `reader` into `writer`.
///
/// Returns the number of plaintext bytes written, which equals the declared size.
pub(crate) fn decrypt_package<R: Read, W: Write + ?Sized>(
    key: &PackageKey,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, OffcryptoError> {
    let declared = read_declared_size(reader)?;
    let mut remaining = declared;
    let mut scratch = Zeroizing::new(vec![0u8; SEGMENT_LEN]);
    let mut index: u32 = 0;

    while remaining > 0 {
        let plain_len = remaining.min(SEGMENT_LEN as u64) as usize;
        let cipher_len = required_ciphertext_len(plain_len as u64) as usize;
        let buf = &mut scratch[..cipher_len];
        reader
            .read_exact(buf)
            .map_err(|err| map_eof(err, "EncryptedPackage ciphertext"))?;
        key.decrypt_segment(index, buf)?;
        writer.write_all(&buf[..plain_len])?;

        remaining -= plain_len as u64;
        index = index.checked_add(1).ok_or(OffcryptoError::InvalidEncryptionInfo {
            context: "EncryptedPackage has too many segments",
        })?;
    }

    writer.flush()?;
    log::debug!("decrypted {declared} bytes in {index} segment(s)");
    Ok(declared)
}

/// HMAC over every byte of `reader` (the whole `EncryptedPackage` stream, size prefix included).
pub(crate) fn hmac_stream<R: Read>(mut mac: HmacState, reader: &mut R) -> Result<Vec<u8>, OffcryptoError> {
    let mut buf = vec![0u8; 0x2000];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        mac.update(&buf[..n]);
    }
    Ok(mac.finalize())
}

//! BIFF8 workbook-stream encryption (`.xls`, `FILEPASS` record).
//!
//! Two password schemes are decrypted, both RC4 based:
//! - RC4 with an MD5 key derivation (`FILEPASS` version 1.1)
//! - RC4 CryptoAPI with a SHA-1 key derivation (`FILEPASS` versions 2.2, 3.2 and 4.2)
//!
//! XOR obfuscation is recognised and reported as unsupported.
//!
//! Record headers are never encrypted. Record payloads are encrypted with a keystream addressed
//! by absolute stream offset: the key is rederived for every 1024-byte block of the stream, and
//! a payload byte at offset `p` uses keystream byte `p % 1024` of block `p / 1024`.

use std::fmt;

use md5::Md5;
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

use crate::crypto::{ct_eq, password_utf16le};
use crate::encryption_info::{Reader, CALG_SHA1};
use crate::rc4::Rc4;
use crate::OffcryptoError;

pub(crate) const RECORD_FILEPASS: u16 = 0x002F;
pub(crate) const RECORD_EOF: u16 = 0x000A;
pub(crate) const BOF_RECORD_IDS: [u16; 4] = [0x0809, 0x0409, 0x0209, 0x0009];

const RECORD_BOUNDSHEET8: u16 = 0x0085;
/// Written over the `FILEPASS` record id once the stream is decrypted.
const MASKED_RECORD_ID: u16 = 0xFFFF;

/// Records whose payloads stay in the clear: BOF, FILEPASS, USREXCL, FILELOCK, INTERFACEHDR,
/// RRDINFO and RRDHEAD.
const CLEARTEXT_RECORD_IDS: [u16; 8] = [
    0x0809,
    0x0009,
    RECORD_FILEPASS,
    0x0194,
    0x0195,
    0x00E1,
    0x0196,
    0x0138,
];
/// `BoundSheet8.lbPlyPos` is never encrypted.
const BOUNDSHEET_CLEAR_PREFIX: usize = 4;

const RECORD_HEADER_LEN: usize = 4;
const REKEY_BLOCK_LEN: usize = 1024;

const ENCRYPTION_TYPE_XOR: u16 = 0x0000;
const ENCRYPTION_TYPE_RC4: u16 = 0x0001;

const CALG_RC4: u32 = 0x0000_6801;

const SALT_LEN: usize = 16;
const VERIFIER_LEN: usize = 16;
const MD5_LEN: usize = 16;
const SHA1_LEN: usize = 20;

/// Parsed `FILEPASS` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FilePass {
    Xor,
    Rc4 {
        salt: [u8; SALT_LEN],
        encrypted_verifier: [u8; VERIFIER_LEN],
        encrypted_verifier_hash: [u8; MD5_LEN],
    },
    CryptoApi {
        key_bits: u32,
        salt: [u8; SALT_LEN],
        encrypted_verifier: [u8; VERIFIER_LEN],
        encrypted_verifier_hash: [u8; SHA1_LEN],
    },
}

/// Key material for the per-block RC4 keys of a workbook stream.
pub(crate) enum WorkbookKey {
    /// Truncated `H1` of the MD5 derivation.
    Rc4 { h1: Zeroizing<[u8; 5]> },
    /// `H0 = SHA1(salt || password)`.
    CryptoApi {
        h0: Zeroizing<Vec<u8>>,
        key_len: usize,
    },
}

impl fmt::Debug for WorkbookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkbookKey::Rc4 { .. } => f.debug_struct("Rc4").finish_non_exhaustive(),
            WorkbookKey::CryptoApi { key_len, .. } => f
                .debug_struct("CryptoApi")
                .field("key_len", key_len)
                .finish_non_exhaustive(),
        }
    }
}

impl WorkbookKey {
    fn block_key(&self, block: u32) -> Zeroizing<Vec<u8>> {
        match self {
            WorkbookKey::Rc4 { h1 } => {
                let mut hasher = Md5::new();
                hasher.update(&h1[..]);
                hasher.update(block.to_le_bytes());
                Zeroizing::new(hasher.finalize().to_vec())
            }
            WorkbookKey::CryptoApi { h0, key_len } => {
                let mut hasher = Sha1::new();
                hasher.update(&h0[..]);
                hasher.update(block.to_le_bytes());
                let digest = hasher.finalize();
                let mut key = digest[..*key_len].to_vec();
                // 40-bit keys are used as 128-bit RC4 keys with zero padding.
                if *key_len == 5 {
                    key.resize(16, 0);
                }
                Zeroizing::new(key)
            }
        }
    }
}

struct RecordHeader {
    offset: usize,
    id: u16,
    end: usize,
}

impl RecordHeader {
    fn payload_start(&self) -> usize {
        self.offset + RECORD_HEADER_LEN
    }
}

/// The record starting at `offset`, or `None` once fewer than a header's worth of bytes remain.
fn record_at(stream: &[u8], offset: usize) -> Result<Option<RecordHeader>, OffcryptoError> {
    let Some(header) = stream.get(offset..offset + RECORD_HEADER_LEN) else {
        return Ok(None);
    };
    let id = u16::from_le_bytes([header[0], header[1]]);
    let len = usize::from(u16::from_le_bytes([header[2], header[3]]));
    let end = offset + RECORD_HEADER_LEN + len;
    if end > stream.len() {
        return Err(OffcryptoError::Truncated {
            context: "BIFF record",
        });
    }
    Ok(Some(RecordHeader { offset, id, end }))
}

/// Locate the `FILEPASS` record in the workbook-globals substream.
fn find_filepass(stream: &[u8]) -> Result<RecordHeader, OffcryptoError> {
    let mut offset = 0;
    while let Some(record) = record_at(stream, offset)? {
        match record.id {
            RECORD_FILEPASS => return Ok(record),
            RECORD_EOF => break,
            id if BOF_RECORD_IDS.contains(&id) && offset != 0 => break,
            _ => {}
        }
        offset = record.end;
    }
    Err(OffcryptoError::InvalidFilePass {
        context: "no FILEPASS record in the workbook globals",
    })
}

/// Find and parse the `FILEPASS` record of a workbook stream.
pub(crate) fn read_filepass(stream: &[u8]) -> Result<FilePass, OffcryptoError> {
    let record = find_filepass(stream)?;
    parse_filepass(&stream[record.payload_start()..record.end])
}

pub(crate) fn parse_filepass(payload: &[u8]) -> Result<FilePass, OffcryptoError> {
    let mut r = Reader::new(payload);
    match r.read_u16_le("FILEPASS.wEncryptionType")? {
        ENCRYPTION_TYPE_XOR => return Ok(FilePass::Xor),
        ENCRYPTION_TYPE_RC4 => {}
        other => {
            return Err(OffcryptoError::UnsupportedEncryption(format!(
                "FILEPASS encryption type 0x{other:04X}"
            )))
        }
    }

    let major = r.read_u16_le("FILEPASS.vMajor")?;
    let minor = r.read_u16_le("FILEPASS.vMinor")?;
    match (major, minor) {
        (1, 1) => Ok(FilePass::Rc4 {
            salt: fixed(r.take(SALT_LEN, "FILEPASS RC4 salt")?),
            encrypted_verifier: fixed(r.take(VERIFIER_LEN, "FILEPASS RC4 verifier")?),
            encrypted_verifier_hash: fixed(r.take(MD5_LEN, "FILEPASS RC4 verifier hash")?),
        }),
        (2..=4, 2) => parse_cryptoapi(&mut r),
        _ => Err(OffcryptoError::UnsupportedEncryption(format!(
            "FILEPASS RC4 version {major}.{minor}"
        ))),
    }
}

fn parse_cryptoapi(r: &mut Reader<'_>) -> Result<FilePass, OffcryptoError> {
    let _flags = r.read_u32_le("FILEPASS CryptoAPI flags")?;
    let header_size = r.read_u32_le("FILEPASS CryptoAPI header size")?;
    let header_size = usize::try_from(header_size).map_err(|_| OffcryptoError::InvalidFilePass {
        context: "CryptoAPI header size",
    })?;

    let mut header = Reader::new(r.take(header_size, "FILEPASS CryptoAPI header")?);
    let _header_flags = header.read_u32_le("EncryptionHeader.flags")?;
    let _size_extra = header.read_u32_le("EncryptionHeader.sizeExtra")?;
    let alg_id = header.read_u32_le("EncryptionHeader.algID")?;
    let alg_id_hash = header.read_u32_le("EncryptionHeader.algIDHash")?;
    let key_bits = match header.read_u32_le("EncryptionHeader.keySize")? {
        0 => 40,
        bits => bits,
    };

    if alg_id != CALG_RC4 && alg_id != 0 {
        return Err(OffcryptoError::UnsupportedAlgorithm(alg_id));
    }
    if alg_id_hash != CALG_SHA1 && alg_id_hash != 0 {
        return Err(OffcryptoError::UnsupportedAlgorithm(alg_id_hash));
    }
    if !(40..=128).contains(&key_bits) || key_bits % 8 != 0 {
        return Err(OffcryptoError::InvalidFilePass {
            context: "CryptoAPI key size",
        });
    }

    if r.read_u32_le("EncryptionVerifier.saltSize")? as usize != SALT_LEN {
        return Err(OffcryptoError::InvalidFilePass {
            context: "CryptoAPI salt size",
        });
    }
    let salt = fixed(r.take(SALT_LEN, "EncryptionVerifier.salt")?);
    let encrypted_verifier = fixed(r.take(VERIFIER_LEN, "EncryptionVerifier.encryptedVerifier")?);
    if r.read_u32_le("EncryptionVerifier.verifierHashSize")? as usize != SHA1_LEN {
        return Err(OffcryptoError::InvalidFilePass {
            context: "CryptoAPI verifier hash size",
        });
    }
    let encrypted_verifier_hash =
        fixed(r.take(SHA1_LEN, "EncryptionVerifier.encryptedVerifierHash")?);

    Ok(FilePass::CryptoApi {
        key_bits,
        salt,
        encrypted_verifier,
        encrypted_verifier_hash,
    })
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Derive the workbook key from `password` and check it against the `FILEPASS` verifier.
pub(crate) fn unlock(filepass: &FilePass, password: &str) -> Result<WorkbookKey, OffcryptoError> {
    let password = password_utf16le(password);
    let (key, verified) = match filepass {
        FilePass::Xor => {
            return Err(OffcryptoError::UnsupportedEncryption(
                "XOR obfuscation (.xls) is detected but not decrypted".to_string(),
            ))
        }
        FilePass::Rc4 {
            salt,
            encrypted_verifier,
            encrypted_verifier_hash,
        } => {
            let h0 = Md5::digest(&password[..]);
            let mut buf = Zeroizing::new(Vec::with_capacity(16 * (5 + SALT_LEN)));
            for _ in 0..16 {
                buf.extend_from_slice(&h0[..5]);
                buf.extend_from_slice(salt);
            }
            let h1 = Md5::digest(&buf[..]);
            let key = WorkbookKey::Rc4 {
                h1: Zeroizing::new(fixed(&h1[..5])),
            };
            let verified =
                verifier_matches::<Md5>(&key, encrypted_verifier, encrypted_verifier_hash);
            (key, verified)
        }
        FilePass::CryptoApi {
            key_bits,
            salt,
            encrypted_verifier,
            encrypted_verifier_hash,
        } => {
            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(&password[..]);
            let key = WorkbookKey::CryptoApi {
                h0: Zeroizing::new(hasher.finalize().to_vec()),
                key_len: *key_bits as usize / 8,
            };
            let verified =
                verifier_matches::<Sha1>(&key, encrypted_verifier, encrypted_verifier_hash);
            (key, verified)
        }
    };

    if !verified {
        return Err(OffcryptoError::InvalidPassword);
    }
    log::debug!("unlocked BIFF8 workbook encryption ({key:?})");
    Ok(key)
}

/// The verifier and its hash are encrypted as one RC4 stream under the block 0 key.
fn verifier_matches<D: Digest>(
    key: &WorkbookKey,
    encrypted_verifier: &[u8; VERIFIER_LEN],
    encrypted_verifier_hash: &[u8],
) -> bool {
    let mut buf = Zeroizing::new([&encrypted_verifier[..], encrypted_verifier_hash].concat());
    Rc4::new(&key.block_key(0)).apply_keystream(&mut buf);
    let (verifier, hash) = buf.split_at(VERIFIER_LEN);
    ct_eq(&D::digest(verifier), hash)
}

/// RC4 keystream addressed by absolute stream offset.
struct OffsetKeystream<'k> {
    key: &'k WorkbookKey,
    current: Option<(u32, usize, Rc4)>,
}

impl<'k> OffsetKeystream<'k> {
    fn new(key: &'k WorkbookKey) -> Self {
        Self { key, current: None }
    }

    fn apply_at(&mut self, mut offset: usize, data: &mut [u8]) {
        let mut done = 0;
        while done < data.len() {
            let block = (offset / REKEY_BLOCK_LEN) as u32;
            let in_block = offset % REKEY_BLOCK_LEN;
            let n = (REKEY_BLOCK_LEN - in_block).min(data.len() - done);

            let reusable = matches!(&self.current, Some((b, pos, _)) if *b == block && *pos <= in_block);
            if !reusable {
                self.current = Some((block, 0, Rc4::new(&self.key.block_key(block))));
            }
            if let Some((_, pos, rc4)) = &mut self.current {
                rc4.skip(in_block - *pos);
                rc4.apply_keystream(&mut data[done..done + n]);
                *pos = in_block + n;
            }

            done += n;
            offset += n;
        }
    }
}

/// Decrypt every encrypted record payload of `stream` in place and mask the `FILEPASS` record id
/// so the result reads as an unencrypted workbook.
pub(crate) fn decrypt_workbook_stream(
    stream: &mut [u8],
    key: &WorkbookKey,
) -> Result<(), OffcryptoError> {
    let filepass = find_filepass(stream)?;
    let mut keystream = OffsetKeystream::new(key);

    let mut offset = filepass.end;
    while let Some(record) = record_at(stream, offset)? {
        if !CLEARTEXT_RECORD_IDS.contains(&record.id) {
            let mut start = record.payload_start();
            if record.id == RECORD_BOUNDSHEET8 {
                start = (start + BOUNDSHEET_CLEAR_PREFIX).min(record.end);
            }
            keystream.apply_at(start, &mut stream[start..record.end]);
        }
        offset = record.end;
    }

    stream[filepass.offset..filepass.offset + 2].copy_from_slice(&MASKED_RECORD_ID.to_le_bytes());
    Ok(())
}

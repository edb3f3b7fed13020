//! Hashing, key derivation and AES helpers shared by the Standard and Agile schemes.
//!
//! References:
//! - MS-OFFCRYPTO: https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-offcrypto/

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use cbc::Decryptor;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq as _;
use zeroize::Zeroizing;

use crate::OffcryptoError;

pub(crate) const AES_BLOCK_SIZE: usize = 16;

/// Hash algorithm identifiers used by MS-OFFCRYPTO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Parse a hash algorithm name as used in the Agile XML descriptor.
    ///
    /// Names are case-insensitive and tolerate separators (`SHA512`, `sha-256`, `SHA_1`).
    pub fn parse_offcrypto_name(name: &str) -> Result<Self, OffcryptoError> {
        let normalized = name.trim().to_ascii_lowercase().replace(['-', '_'], "");
        match normalized.as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(OffcryptoError::UnsupportedHashAlgorithm(name.trim().to_string())),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        self.hash_two(data, &[])
    }

    pub(crate) fn hash_two(self, a: &[u8], b: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut h = Sha1::new();
                h.update(a);
                h.update(b);
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut h = Sha256::new();
                h.update(a);
                h.update(b);
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha384 => {
                let mut h = Sha384::new();
                h.update(a);
                h.update(b);
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha512 => {
                let mut h = Sha512::new();
                h.update(a);
                h.update(b);
                h.finalize().to_vec()
            }
        }
    }
}

/// UTF-16LE with no BOM and no terminator.
pub(crate) fn password_utf16le(password: &str) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(password.len().saturating_mul(2)));
    for unit in password.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Compute the Agile password *iterated hash*.
///
/// 1. `H = Hash(salt || password_utf16le)`
/// 2. For `i in 0..spin_count`: `H = Hash(LE32(i) || H)`
pub(crate) fn iterated_hash(
    password: &str,
    salt: &[u8],
    spin_count: u32,
    hash_alg: HashAlgorithm,
) -> Zeroizing<Vec<u8>> {
    let pw = password_utf16le(password);
    let mut h = Zeroizing::new(hash_alg.hash_two(salt, &pw));
    for i in 0..spin_count {
        let next = hash_alg.hash_two(&i.to_le_bytes(), &h);
        h.copy_from_slice(&next);
    }
    h
}

/// `Hash(h || block_key)`, truncated to `key_len` or padded with `0x00` up to it.
pub(crate) fn derive_key(
    h: &[u8],
    block_key: &[u8],
    key_len: usize,
    hash_alg: HashAlgorithm,
) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(hash_alg.hash_two(h, block_key));
    out.resize(key_len, 0u8);
    out
}

/// `Hash(salt || block_key)`, truncated to `iv_len` or padded with `0x00` up to it.
pub(crate) fn derive_iv(
    salt: &[u8],
    block_key: &[u8],
    iv_len: usize,
    hash_alg: HashAlgorithm,
) -> Vec<u8> {
    let mut out = hash_alg.hash_two(salt, block_key);
    out.resize(iv_len, 0u8);
    out
}

pub(crate) fn aes_ecb_decrypt_in_place(key: &[u8], buf: &mut [u8]) -> Result<(), OffcryptoError> {
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(OffcryptoError::InvalidCiphertextLength { len: buf.len() });
    }

    fn decrypt_with<C>(key: &[u8], buf: &mut [u8]) -> Result<(), OffcryptoError>
    where
        C: BlockDecrypt + KeyInit,
    {
        let cipher =
            C::new_from_slice(key).map_err(|_| OffcryptoError::InvalidKeyLength { len: key.len() })?;
        for block in buf.chunks_mut(AES_BLOCK_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    match key.len() {
        16 => decrypt_with::<Aes128>(key, buf),
        24 => decrypt_with::<Aes192>(key, buf),
        32 => decrypt_with::<Aes256>(key, buf),
        len => Err(OffcryptoError::InvalidKeyLength { len }),
    }
}

/// In-place AES-CBC decryption without padding removal.
///
/// Callers truncate the plaintext to the semantic length stored elsewhere in the format.
pub(crate) fn aes_cbc_decrypt_in_place(
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), OffcryptoError> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "AES-CBC IV must be 16 bytes",
        });
    }
    let len = buf.len();
    if len % AES_BLOCK_SIZE != 0 {
        return Err(OffcryptoError::InvalidCiphertextLength { len });
    }
    if len == 0 {
        return Ok(());
    }

    let bad_key = |_| OffcryptoError::InvalidKeyLength { len: key.len() };
    let bad_len = |_| OffcryptoError::InvalidCiphertextLength { len };
    match key.len() {
        16 => {
            Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(bad_len)?;
        }
        24 => {
            Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(bad_len)?;
        }
        32 => {
            Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(bad_len)?;
        }
        len => return Err(OffcryptoError::InvalidKeyLength { len }),
    }
    Ok(())
}

pub(crate) fn aes_cbc_decrypt(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, OffcryptoError> {
    let mut out = Zeroizing::new(ciphertext.to_vec());
    aes_cbc_decrypt_in_place(key, iv, &mut out)?;
    Ok(out)
}

/// Constant-time equality; slices of different lengths compare unequal.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

/// Incremental HMAC over one of the supported hash algorithms.
pub(crate) enum HmacState {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
}

impl HmacState {
    pub(crate) fn new(hash_alg: HashAlgorithm, key: &[u8]) -> Result<Self, OffcryptoError> {
        let invalid = |_| OffcryptoError::InvalidKeyLength { len: key.len() };
        Ok(match hash_alg {
            HashAlgorithm::Sha1 => {
                HmacState::Sha1(<Hmac<Sha1> as Mac>::new_from_slice(key).map_err(invalid)?)
            }
            HashAlgorithm::Sha256 => {
                HmacState::Sha256(<Hmac<Sha256> as Mac>::new_from_slice(key).map_err(invalid)?)
            }
            HashAlgorithm::Sha384 => {
                HmacState::Sha384(<Hmac<Sha384> as Mac>::new_from_slice(key).map_err(invalid)?)
            }
            HashAlgorithm::Sha512 => {
                HmacState::Sha512(<Hmac<Sha512> as Mac>::new_from_slice(key).map_err(invalid)?)
            }
        })
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            HmacState::Sha1(mac) => mac.update(data),
            HmacState::Sha256(mac) => mac.update(data),
            HmacState::Sha384(mac) => mac.update(data),
            HmacState::Sha512(mac) => mac.update(data),
        }
    }

    pub(crate) fn finalize(self) -> Vec<u8> {
        match self {
            HmacState::Sha1(mac) => mac.finalize().into_bytes().to_vec(),
            HmacState::Sha256(mac) => mac.finalize().into_bytes().to_vec(),
            HmacState::Sha384(mac) => mac.finalize().into_bytes().to_vec(),
            HmacState::Sha512(mac) => mac.finalize().into_bytes().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_decode(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).expect("valid hex byte"))
            .collect()
    }

    #[test]
    fn password_utf16le_encoding_no_bom_no_terminator() {
        assert_eq!(password_utf16le("A").as_slice(), &[0x41, 0x00]);
        assert_eq!(password_utf16le("AB").as_slice(), &[0x41, 0x00, 0x42, 0x00]);
        assert!(password_utf16le("").is_empty());

        // Non-BMP char (U+1F600) encodes as surrogate pair D83D DE00.
        assert_eq!(
            password_utf16le("\u{1F600}").as_slice(),
            &[0x3D, 0xD8, 0x00, 0xDE]
        );
    }

    #[test]
    fn spin_count_changes_password_hash() {
        let salt = [0x11u8; 16];
        let h0 = iterated_hash("password", &salt, 0, HashAlgorithm::Sha256);
        let h1 = iterated_hash("password", &salt, 1, HashAlgorithm::Sha256);
        assert_ne!(h0.as_slice(), h1.as_slice());
        assert_eq!(h0.len(), HashAlgorithm::Sha256.digest_len());

        let pw = password_utf16le("password");
        let expected_h1 = HashAlgorithm::Sha256.hash_two(&0u32.to_le_bytes(), &h0);
        assert_eq!(h0.as_slice(), HashAlgorithm::Sha256.hash_two(&salt, &pw).as_slice());
        assert_eq!(h1.as_slice(), expected_h1.as_slice());
    }

    #[test]
    fn derive_key_truncates_and_pads_with_zeros() {
        let h = vec![0x22u8; 32];
        let block = [0xFE, 0xA7, 0xD2, 0x76, 0x3B, 0x4B, 0x9E, 0x79];
        let full = derive_key(&h, &block, 20, HashAlgorithm::Sha1);
        let trunc = derive_key(&h, &block, 16, HashAlgorithm::Sha1);
        let padded = derive_key(&h, &block, 24, HashAlgorithm::Sha1);

        assert_eq!(&full[..16], &trunc[..]);
        assert_eq!(padded.len(), 24);
        assert_eq!(&padded[..20], &full[..]);
        assert_eq!(&padded[20..], &[0u8; 4]);
    }

    #[test]
    fn derive_iv_for_segment_uses_le32_block_key() {
        let salt = [0x44u8; 16];
        let a = derive_iv(&salt, &7u32.to_le_bytes(), 16, HashAlgorithm::Sha512);
        let b = HashAlgorithm::Sha512.hash_two(&salt, &[7, 0, 0, 0]);
        assert_eq!(a.as_slice(), &b[..16]);
    }

    #[test]
    fn parse_hash_algorithm_name() {
        assert_eq!(
            HashAlgorithm::parse_offcrypto_name("SHA1").unwrap(),
            HashAlgorithm::Sha1
        );
        assert_eq!(
            HashAlgorithm::parse_offcrypto_name("sha512").unwrap(),
            HashAlgorithm::Sha512
        );
        assert_eq!(
            HashAlgorithm::parse_offcrypto_name(" SHA-256 ").unwrap(),
            HashAlgorithm::Sha256
        );
        let err = HashAlgorithm::parse_offcrypto_name("MD5").unwrap_err();
        assert!(matches!(err, OffcryptoError::UnsupportedHashAlgorithm(name) if name == "MD5"));
    }

    // NIST SP 800-38A F.1.1 (ECB-AES128.Decrypt), first block.
    #[test]
    fn aes_128_ecb_decrypt_matches_nist_vector() {
        let key = hex_decode("2b7e151628aed2a6abf7158809cf4f3c");
        let mut buf = hex_decode("3ad77bb40d7a3660a89ecaf32466ef97");
        aes_ecb_decrypt_in_place(&key, &mut buf).expect("decrypt");
        assert_eq!(buf, hex_decode("6bc1bee22e409f96e93d7e117393172a"));
    }

    // NIST SP 800-38A F.2.2 (CBC-AES128.Decrypt), first two blocks.
    #[test]
    fn aes_128_cbc_decrypt_matches_nist_vector() {
        let key = hex_decode("2b7e151628aed2a6abf7158809cf4f3c");
        let iv = hex_decode("000102030405060708090a0b0c0d0e0f");
        let ciphertext = hex_decode(concat!(
            "7649abac8119b246cee98e9b12e9197d",
            "5086cb9b507219ee95db113a917678b2",
        ));
        let plain = aes_cbc_decrypt(&key, &iv, &ciphertext).expect("decrypt");
        assert_eq!(
            plain.as_slice(),
            hex_decode(concat!(
                "6bc1bee22e409f96e93d7e117393172a",
                "ae2d8a571e03ac9c9eb76fac45af8e51",
            ))
            .as_slice()
        );
    }

    #[test]
    fn aes_rejects_bad_lengths() {
        let mut buf = [0u8; 15];
        let err = aes_ecb_decrypt_in_place(&[0u8; 16], &mut buf).unwrap_err();
        assert!(matches!(err, OffcryptoError::InvalidCiphertextLength { len: 15 }));

        let mut buf = [0u8; 16];
        let err = aes_ecb_decrypt_in_place(&[0u8; 17], &mut buf).unwrap_err();
        assert!(matches!(err, OffcryptoError::InvalidKeyLength { len: 17 }));

        let err = aes_cbc_decrypt(&[0u8; 20], &[0u8; 16], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, OffcryptoError::InvalidKeyLength { len: 20 }));
    }

    // RFC 2202 test case 2 / RFC 4231 test case 2.
    #[test]
    fn hmac_matches_rfc_vectors() {
        let data = b"what do ya want for nothing?";

        let mut mac = HmacState::new(HashAlgorithm::Sha1, b"Jefe").unwrap();
        mac.update(&data[..10]);
        mac.update(&data[10..]);
        assert_eq!(
            mac.finalize(),
            hex_decode("effcdf6ae5eb2fa2d27416d5f184df9c259a7c79")
        );

        let mut mac = HmacState::new(HashAlgorithm::Sha256, b"Jefe").unwrap();
        mac.update(data);
        assert_eq!(
            mac.finalize(),
            hex_decode("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
        );
    }

    #[test]
    fn ct_eq_requires_equal_lengths() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }
}

//! ECMA-376 Standard Encryption (CryptoAPI AES) key derivation and verification.

use sha1::{Digest as _, Sha1};
use zeroize::Zeroizing;

use crate::crypto::{aes_ecb_decrypt_in_place, ct_eq, password_utf16le};
use crate::encryption_info::{StandardEncryptionHeader, StandardEncryptionVerifier};
use crate::OffcryptoError;

const SHA1_LEN: usize = 20;
const ITER_COUNT: u32 = 50_000;

fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    Sha1::digest(data).into()
}

/// Password to AES key, per MS-OFFCRYPTO 2.3.4.7.
pub fn derive_key(
    header: &StandardEncryptionHeader,
    verifier: &StandardEncryptionVerifier,
    password: &str,
) -> Result<Zeroizing<Vec<u8>>, OffcryptoError> {
    let key_len = (header.key_size_bits / 8) as usize;
    let password_utf16 = password_utf16le(password);

    let mut hasher = Sha1::new();
    hasher.update(&verifier.salt);
    hasher.update(password_utf16.as_slice());
    let mut h: Zeroizing<[u8; SHA1_LEN]> = Zeroizing::new(hasher.finalize().into());

    let mut buf = Zeroizing::new([0u8; 4 + SHA1_LEN]);
    for i in 0..ITER_COUNT {
        buf[..4].copy_from_slice(&i.to_le_bytes());
        buf[4..].copy_from_slice(h.as_slice());
        *h = sha1(buf.as_slice());
    }

    let mut buf0 = Zeroizing::new([0u8; SHA1_LEN + 4]);
    buf0[..SHA1_LEN].copy_from_slice(h.as_slice());
    let hfinal = Zeroizing::new(sha1(buf0.as_slice()));

    let mut buf1 = Zeroizing::new([0x36u8; 64]);
    let mut buf2 = Zeroizing::new([0x5cu8; 64]);
    for i in 0..SHA1_LEN {
        buf1[i] ^= hfinal[i];
        buf2[i] ^= hfinal[i];
    }

    let mut out = Zeroizing::new(Vec::with_capacity(SHA1_LEN * 2));
    out.extend_from_slice(&sha1(buf1.as_slice()));
    out.extend_from_slice(&sha1(buf2.as_slice()));
    if key_len > out.len() {
        return Err(OffcryptoError::InvalidKeyLength { len: key_len });
    }
    out.truncate(key_len);
    Ok(out)
}

/// Check a derived key against the stored verifier.
pub fn verify_key(verifier: &StandardEncryptionVerifier, key: &[u8]) -> Result<(), OffcryptoError> {
    let mut plain_verifier = Zeroizing::new(verifier.encrypted_verifier);
    aes_ecb_decrypt_in_place(key, plain_verifier.as_mut_slice())?;
    let expected_hash = sha1(plain_verifier.as_slice());

    let mut verifier_hash = Zeroizing::new(verifier.encrypted_verifier_hash.clone());
    aes_ecb_decrypt_in_place(key, &mut verifier_hash)?;
    if verifier_hash.len() < SHA1_LEN {
        return Err(OffcryptoError::Truncated {
            context: "EncryptionVerifier.encryptedVerifierHash",
        });
    }

    if ct_eq(&expected_hash, &verifier_hash[..SHA1_LEN]) {
        Ok(())
    } else {
        Err(OffcryptoError::InvalidPassword)
    }
}

//! Agile encryption password verification and data-integrity keys.
//!
//! Password verification decrypts `encryptedVerifierHashInput` and `encryptedVerifierHashValue`
//! with keys derived from the password and checks `Hash(verifierHashInput) == verifierHashValue`.
//! Both values are AES-CBC ciphertext and may decrypt to a buffer padded to a 16-byte boundary
//! (SHA1 = 20 bytes), so only the digest prefix is compared.
//!
//! The iterated password hash is computed once per attempt and reused for the three block keys:
//! - block 1: `encryptedVerifierHashInput`
//! - block 2: `encryptedVerifierHashValue`
//! - block 3: `encryptedKeyValue` (the secret/package key)

use zeroize::Zeroizing;

use crate::crypto::{aes_cbc_decrypt, ct_eq, derive_iv, derive_key, iterated_hash, HashAlgorithm};
use crate::encryption_info::{AgileDataIntegrity, AgileEncryptionInfo};
use crate::OffcryptoError;

const VERIFIER_HASH_INPUT_BLOCK: [u8; 8] = [0xFE, 0xA7, 0xD2, 0x76, 0x3B, 0x4B, 0x9E, 0x79];
const VERIFIER_HASH_VALUE_BLOCK: [u8; 8] = [0xD7, 0xAA, 0x0F, 0x6D, 0x30, 0x61, 0x34, 0x4E];
const KEY_VALUE_BLOCK: [u8; 8] = [0x14, 0x6E, 0x0B, 0xE7, 0xAB, 0xAC, 0xD0, 0xD6];
const HMAC_KEY_BLOCK: [u8; 8] = [0x5F, 0xB2, 0xAD, 0x01, 0x0C, 0xB9, 0xE1, 0xF6];
const HMAC_VALUE_BLOCK: [u8; 8] = [0xA0, 0x67, 0x7F, 0x02, 0xB2, 0x2C, 0x84, 0x33];

const VERIFIER_HASH_INPUT_LEN: usize = 16;

fn key_len_from_bits(bits: usize, context: &'static str) -> Result<usize, OffcryptoError> {
    if bits == 0 || bits % 8 != 0 {
        return Err(OffcryptoError::InvalidEncryptionInfo { context });
    }
    Ok(bits / 8)
}

/// Compare a computed digest against a decrypted (possibly block-padded) stored value.
pub(crate) fn digest_prefix_matches(computed: &[u8], decrypted: &[u8]) -> bool {
    decrypted
        .get(..computed.len())
        .is_some_and(|expected| ct_eq(computed, expected))
}

/// Derive the package secret key from `password`, verifying it against the stored verifier.
pub fn secret_key_from_password(
    info: &AgileEncryptionInfo,
    password: &str,
) -> Result<Zeroizing<Vec<u8>>, OffcryptoError> {
    let pk = &info.password_key;
    if pk.salt.len() != 16 {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "encryptedKey.saltValue must be 16 bytes",
        });
    }
    let wrapping_key_len =
        key_len_from_bits(pk.key_bits, "encryptedKey.keyBits is not a multiple of 8")?;
    let secret_key_len = key_len_from_bits(
        info.key_data.key_bits.unwrap_or(pk.key_bits),
        "keyData.keyBits is not a multiple of 8",
    )?;

    let h = iterated_hash(password, &pk.salt, pk.spin_count, pk.hash_algorithm);

    let key1 = derive_key(&h, &VERIFIER_HASH_INPUT_BLOCK, wrapping_key_len, pk.hash_algorithm);
    let verifier_hash_input = aes_cbc_decrypt(&key1, &pk.salt, &pk.encrypted_verifier_hash_input)?;
    if verifier_hash_input.len() < VERIFIER_HASH_INPUT_LEN {
        return Err(OffcryptoError::Truncated {
            context: "decrypted verifierHashInput",
        });
    }

    let key2 = derive_key(&h, &VERIFIER_HASH_VALUE_BLOCK, wrapping_key_len, pk.hash_algorithm);
    let verifier_hash_value = aes_cbc_decrypt(&key2, &pk.salt, &pk.encrypted_verifier_hash_value)?;

    let digest = pk
        .hash_algorithm
        .digest(&verifier_hash_input[..VERIFIER_HASH_INPUT_LEN]);
    if !digest_prefix_matches(&digest, &verifier_hash_value) {
        return Err(OffcryptoError::InvalidPassword);
    }

    let key3 = derive_key(&h, &KEY_VALUE_BLOCK, wrapping_key_len, pk.hash_algorithm);
    let key_value = aes_cbc_decrypt(&key3, &pk.salt, &pk.encrypted_key_value)?;
    if key_value.len() < secret_key_len {
        return Err(OffcryptoError::Truncated {
            context: "decrypted encryptedKeyValue",
        });
    }
    Ok(Zeroizing::new(key_value[..secret_key_len].to_vec()))
}

/// Decrypted `dataIntegrity` material: the HMAC key and the expected HMAC of the package stream.
pub(crate) struct IntegrityKeys {
    pub(crate) hash_algorithm: HashAlgorithm,
    pub(crate) hmac_key: Zeroizing<Vec<u8>>,
    pub(crate) expected_hmac: Zeroizing<Vec<u8>>,
}

pub(crate) fn integrity_keys(
    info: &AgileEncryptionInfo,
    integrity: &AgileDataIntegrity,
    secret_key: &[u8],
) -> Result<IntegrityKeys, OffcryptoError> {
    let hash_alg = info.key_data.hash_algorithm;
    let digest_len = hash_alg.digest_len();
    let block_size = info.key_data.block_size;

    let iv = derive_iv(&info.key_data.salt, &HMAC_KEY_BLOCK, block_size, hash_alg);
    let mut hmac_key = aes_cbc_decrypt(secret_key, &iv, &integrity.encrypted_hmac_key)?;
    if hmac_key.len() < digest_len {
        return Err(OffcryptoError::Truncated {
            context: "decrypted encryptedHmacKey",
        });
    }
    hmac_key.truncate(digest_len);

    let iv = derive_iv(&info.key_data.salt, &HMAC_VALUE_BLOCK, block_size, hash_alg);
    let mut expected_hmac = aes_cbc_decrypt(secret_key, &iv, &integrity.encrypted_hmac_value)?;
    if expected_hmac.len() < digest_len {
        return Err(OffcryptoError::Truncated {
            context: "decrypted encryptedHmacValue",
        });
    }
    expected_hmac.truncate(digest_len);

    Ok(IntegrityKeys {
        hash_algorithm: hash_alg,
        hmac_key,
        expected_hmac,
    })
}

use std::io::{Cursor, Read as _, Write};

use cfb::CompoundFile;
use ms_offcrypto_writer::Ecma376AgileWriter;
use pretty_assertions::assert_eq;
use rand::{rngs::StdRng, SeedableRng as _};
use sha1::{Digest as _, Sha1};

use office_unlock::{decrypt_or_copy, Outcome, UnlockError};
use unlock_offcrypto::OffcryptoError;

fn encrypt(plain: &[u8], password: &str) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut rng = StdRng::from_seed([7u8; 32]);
    let mut agile =
        Ecma376AgileWriter::create(&mut rng, password, &mut cursor).expect("create agile writer");
    agile.write_all(plain).expect("write plaintext");
    agile.finalize().expect("finalize agile writer");
    cursor.into_inner()
}

fn record(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn workbook_cfb(workbook: &[u8]) -> Vec<u8> {
    let mut ole = CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb");
    ole.create_stream("Workbook")
        .expect("create stream")
        .write_all(workbook)
        .expect("write stream");
    ole.into_inner().into_inner()
}

const BOF_GLOBALS: [u8; 16] = [0x00, 0x06, 0x05, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

fn xor_obfuscated_xls() -> Vec<u8> {
    let mut workbook = record(0x0809, &BOF_GLOBALS);
    workbook.extend(record(0x002F, &[0x00, 0x00, 0x34, 0x12, 0x78, 0x56]));
    workbook.extend(record(0x000A, &[]));
    workbook_cfb(&workbook)
}

fn rc4(key: &[u8], data: &mut [u8]) {
    let mut s: Vec<u8> = (0..=255u8).collect();
    let mut j = 0u8;
    for i in 0..256 {
        j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
        s.swap(i, j as usize);
    }
    let (mut i, mut j) = (0u8, 0u8);
    for b in data {
        i = i.wrapping_add(1);
        j = j.wrapping_add(s[i as usize]);
        s.swap(i as usize, j as usize);
        *b ^= s[s[i as usize].wrapping_add(s[j as usize]) as usize];
    }
}

/// A 128-bit RC4 CryptoAPI workbook small enough to fit one 1024-byte key block, with its
/// plaintext Workbook stream (FILEPASS id masked).
fn rc4_cryptoapi_xls(password: &str) -> (Vec<u8>, Vec<u8>) {
    let salt = [0x5Au8; 16];
    let mut h0 = Sha1::new();
    h0.update(salt);
    for unit in password.encode_utf16() {
        h0.update(unit.to_le_bytes());
    }
    let h0 = h0.finalize();
    let key = Sha1::new()
        .chain_update(h0)
        .chain_update(0u32.to_le_bytes())
        .finalize()[..16]
        .to_vec();

    let verifier = [0x11u8; 16];
    let mut sealed = verifier.to_vec();
    sealed.extend_from_slice(&Sha1::digest(verifier));
    rc4(&key, &mut sealed);

    let mut filepass = Vec::new();
    for v in [1u16, 4, 2] {
        filepass.extend_from_slice(&v.to_le_bytes());
    }
    filepass.extend_from_slice(&0x04u32.to_le_bytes());
    filepass.extend_from_slice(&32u32.to_le_bytes());
    for v in [0x04u32, 0, 0x6801, 0x8004, 128, 1, 0, 0] {
        filepass.extend_from_slice(&v.to_le_bytes());
    }
    filepass.extend_from_slice(&16u32.to_le_bytes());
    filepass.extend_from_slice(&salt);
    filepass.extend_from_slice(&sealed[..16]);
    filepass.extend_from_slice(&20u32.to_le_bytes());
    filepass.extend_from_slice(&sealed[16..]);

    let mut plain = record(0x0809, &BOF_GLOBALS);
    plain.extend(record(0x002F, &filepass));
    let encrypted_from = plain.len();
    plain.extend(record(0x0042, &1200u16.to_le_bytes()));
    plain.extend(record(0x0031, b"\xC8\x00\x00\x00\xFF\x7F\x90\x01Arial"));
    plain.extend(record(0x000A, &[]));

    // One keystream over the stream from offset 0; headers and cleartext records skip it.
    let mut keystream = vec![0u8; plain.len()];
    rc4(&key, &mut keystream);
    let mut encrypted = plain.clone();
    let mut offset = encrypted_from;
    while offset < plain.len() {
        let len = usize::from(u16::from_le_bytes([plain[offset + 2], plain[offset + 3]]));
        for pos in offset + 4..offset + 4 + len {
            encrypted[pos] ^= keystream[pos];
        }
        offset += 4 + len;
    }

    plain[20..22].copy_from_slice(&0xFFFFu16.to_le_bytes());
    (workbook_cfb(&encrypted), plain)
}

#[test]
fn reports_decrypted_and_copied_outcomes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let plain = b"PK\x03\x04 not really a zip, but bytes are bytes".to_vec();

    let encrypted = tmp.path().join("enc.docx");
    std::fs::write(&encrypted, encrypt(&plain, "pw")).expect("write encrypted");
    let out = tmp.path().join("dec.docx");
    let outcome = decrypt_or_copy(&encrypted, &out, "pw").expect("decrypt");
    assert_eq!(
        outcome,
        Outcome::Decrypted {
            bytes: plain.len() as u64
        }
    );
    assert_eq!(std::fs::read(&out).expect("read"), plain);

    let copied_out = tmp.path().join("copy.docx");
    let outcome = decrypt_or_copy(&out, &copied_out, "ignored").expect("copy");
    assert_eq!(
        outcome,
        Outcome::Copied {
            bytes: plain.len() as u64
        }
    );
    assert_eq!(std::fs::read(&copied_out).expect("read"), plain);
}

#[test]
fn empty_and_text_inputs_are_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    for (name, contents) in [("empty.xlsx", &b""[..]), ("notes.xlsx", &b"date,amount\n"[..])] {
        let input = tmp.path().join(name);
        std::fs::write(&input, contents).expect("write");
        let out = tmp.path().join("out.xlsx");

        let err = decrypt_or_copy(&input, &out, "").expect_err("not an Office document");
        assert!(
            matches!(err, UnlockError::DecryptionFailed(OffcryptoError::UnsupportedFileFormat)),
            "{name}: got {err:?}"
        );
        assert!(!out.exists());
    }
}

#[test]
fn unrecognized_compound_file_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("random.xls");
    let mut ole = CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb");
    ole.create_stream("Random")
        .expect("create stream")
        .write_all(b"payload")
        .expect("write stream");
    std::fs::write(&input, ole.into_inner().into_inner()).expect("write");
    let out = tmp.path().join("out.xls");

    let err = decrypt_or_copy(&input, &out, "pw").expect_err("unrecognized OLE");
    assert!(
        matches!(err, UnlockError::DecryptionFailed(OffcryptoError::UnrecognizedOleFormat)),
        "got {err:?}"
    );
    assert_eq!(err.to_string(), "decryption failed: unrecognized OLE file format");
    assert!(!out.exists());
}

#[test]
fn wrong_password_is_a_decryption_failure() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("enc.xlsx");
    std::fs::write(&input, encrypt(b"secret", "right")).expect("write");
    let out = tmp.path().join("out.xlsx");

    let err = decrypt_or_copy(&input, &out, "wrong").expect_err("wrong password");
    assert!(
        matches!(err, UnlockError::DecryptionFailed(OffcryptoError::InvalidPassword)),
        "got {err:?}"
    );
    assert!(!out.exists());
}

#[test]
fn missing_input_is_not_found() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("missing.xlsx");
    let err = decrypt_or_copy(&input, &tmp.path().join("out.xlsx"), "pw").expect_err("missing");
    assert!(
        matches!(&err, UnlockError::InputNotFound { path } if path == &input),
        "got {err:?}"
    );
}

#[test]
fn directory_input_is_unreadable() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = decrypt_or_copy(tmp.path(), &tmp.path().join("out.xlsx"), "pw")
        .expect_err("directory input");
    assert!(
        matches!(err, UnlockError::InputUnreadable { .. }),
        "got {err:?}"
    );
    assert!(!tmp.path().join("out.xlsx").exists());
}

#[test]
fn missing_output_directory_is_not_writable() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("enc.xlsx");
    std::fs::write(&input, encrypt(b"payload", "pw")).expect("write");
    let out = tmp.path().join("nope").join("out.xlsx");

    let err = decrypt_or_copy(&input, &out, "pw").expect_err("missing output dir");
    match &err {
        UnlockError::OutputNotWritable { path, source } => {
            assert_eq!(path, &out);
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn rc4_cryptoapi_workbook_is_decrypted() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (encrypted, plain_workbook) = rc4_cryptoapi_xls("kakeibo");
    let input = tmp.path().join("legacy.xls");
    std::fs::write(&input, encrypted).expect("write");
    let out = tmp.path().join("out.xls");

    let err = decrypt_or_copy(&input, &out, "wrong").expect_err("wrong password");
    assert!(
        matches!(err, UnlockError::DecryptionFailed(OffcryptoError::InvalidPassword)),
        "got {err:?}"
    );
    assert!(!out.exists());

    let outcome = decrypt_or_copy(&input, &out, "kakeibo").expect("decrypt");
    let written = std::fs::read(&out).expect("read output");
    assert_eq!(
        outcome,
        Outcome::Decrypted {
            bytes: written.len() as u64
        }
    );

    let mut ole = CompoundFile::open(Cursor::new(written)).expect("output is a compound file");
    let mut workbook = Vec::new();
    ole.open_stream("Workbook")
        .expect("Workbook stream")
        .read_to_end(&mut workbook)
        .expect("read Workbook");
    assert_eq!(workbook, plain_workbook);
}

#[test]
fn xor_obfuscated_workbook_is_reported_not_copied() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = tmp.path().join("legacy.xls");
    std::fs::write(&input, xor_obfuscated_xls()).expect("write");
    let out = tmp.path().join("out.xls");

    let err = decrypt_or_copy(&input, &out, "VelvetSweatshop").expect_err("legacy encryption");
    assert!(
        matches!(&err, UnlockError::DecryptionFailed(OffcryptoError::UnsupportedEncryption(_))),
        "got {err:?}"
    );
    assert!(err.to_string().starts_with("decryption failed: "), "{err}");
    assert!(!out.exists());
}

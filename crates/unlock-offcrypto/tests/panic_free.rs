use std::io::{Cursor, Write as _};

use cfb::CompoundFile;

use unlock_offcrypto::{parse_encryption_info, OfficeFile, OLE_MAGIC};

fn next_u64(state: &mut u64) -> u64 {
    // Deterministic LCG (same parameters as PCG32 without the output permutation).
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    *state
}

fn pseudorandom_bytes(state: &mut u64, max_len: usize) -> Vec<u8> {
    let len = (next_u64(state) as usize) % max_len;
    let mut buf = vec![0u8; len];
    for b in &mut buf {
        *b = (next_u64(state) >> 56) as u8;
    }
    buf
}

#[test]
fn parse_encryption_info_is_panic_free_on_pseudorandom_inputs() {
    let mut state = 0x0123_4567_89ab_cdef;

    for i in 0..1024 {
        let mut buf = pseudorandom_bytes(&mut state, 4096);
        // Steer a share of the inputs into the Standard and Agile branches.
        if buf.len() >= 4 {
            match i % 3 {
                0 => buf[..4].copy_from_slice(&[3, 0, 2, 0]),
                1 => buf[..4].copy_from_slice(&[4, 0, 4, 0]),
                _ => {}
            }
        }

        let len = buf.len();
        assert!(
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _ = parse_encryption_info(&buf);
            }))
            .is_ok(),
            "parse_encryption_info panicked on len={len}"
        );
    }
}

#[test]
fn open_is_panic_free_on_pseudorandom_inputs() {
    let mut state = 0xfeed_f00d_dead_beef;

    for i in 0..256 {
        let mut buf = pseudorandom_bytes(&mut state, 8192);
        if i % 2 == 0 && buf.len() >= OLE_MAGIC.len() {
            buf[..OLE_MAGIC.len()].copy_from_slice(&OLE_MAGIC);
        }

        let len = buf.len();
        assert!(
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                if let Ok(mut doc) = OfficeFile::from_reader(Cursor::new(buf)) {
                    if doc.is_encrypted() {
                        let _ = doc.unlock("password");
                    }
                }
            }))
            .is_ok(),
            "OfficeFile::from_reader panicked on len={len}"
        );
    }
}

#[test]
fn workbook_unlock_is_panic_free_on_pseudorandom_filepass() {
    let mut state = 0x5eed_0f_b1ff_0008;

    for i in 0..256 {
        let mut payload = pseudorandom_bytes(&mut state, 256);
        // Steer inputs into the RC4 and CryptoAPI FILEPASS layouts.
        if payload.len() >= 6 {
            match i % 3 {
                0 => payload[..6].copy_from_slice(&[1, 0, 1, 0, 1, 0]),
                1 => payload[..6].copy_from_slice(&[1, 0, 4, 0, 2, 0]),
                _ => {}
            }
        }
        let mut workbook = vec![0x09, 0x08, 0x10, 0x00];
        workbook.extend_from_slice(&[0u8; 16]);
        workbook.extend_from_slice(&0x002Fu16.to_le_bytes());
        workbook.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        workbook.extend_from_slice(&payload);
        workbook.extend(pseudorandom_bytes(&mut state, 2048));

        let mut ole = CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb");
        ole.create_stream("Workbook")
            .expect("create stream")
            .write_all(&workbook)
            .expect("write stream");
        let bytes = ole.into_inner().into_inner();

        assert!(
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                if let Ok(mut doc) = OfficeFile::from_reader(Cursor::new(bytes)) {
                    if doc.unlock("password").is_ok() {
                        let _ = doc.decrypt_into(&mut Vec::new());
                    }
                }
            }))
            .is_ok(),
            "workbook unlock panicked on iteration {i}"
        );
    }
}

//! OLE/CFB container classification and legacy binary encryption detection.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use cfb::CompoundFile;

use crate::biff::{BOF_RECORD_IDS, RECORD_EOF, RECORD_FILEPASS};
use crate::{DocumentFormat, OffcryptoError};

/// Compound File Binary signature.
pub const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// ZIP local file header, empty archive and spanned archive signatures.
const ZIP_SIGNATURES: [[u8; 4]; 3] = [*b"PK\x03\x04", *b"PK\x05\x06", *b"PK\x07\x08"];

pub(crate) const ENCRYPTION_INFO_STREAM: &str = "EncryptionInfo";
pub(crate) const ENCRYPTED_PACKAGE_STREAM: &str = "EncryptedPackage";

/// Workbook stream names: BIFF8 and later, then BIFF5.
pub(crate) const WORKBOOK_STREAMS: [&str; 2] = ["Workbook", "Book"];

// Word FIB.
const WORD_FIB_IDENT: u16 = 0xA5EC;
const WORD_FIB_FLAGS_OFFSET: usize = 0x0A;
const WORD_F_ENCRYPTED: u16 = 0x0100;

// PowerPoint CurrentUserAtom.
const PPT_ENCRYPTED_HEADER_TOKEN: u32 = 0xF3D1C4DF;

fn stream_exists<F: Read + Seek>(ole: &mut CompoundFile<F>, name: &str) -> bool {
    ole.open_stream(name).is_ok()
}

pub(crate) fn is_zip(prefix: &[u8]) -> bool {
    ZIP_SIGNATURES.iter().any(|sig| prefix.starts_with(sig))
}

pub(crate) fn workbook_stream<F: Read + Seek>(ole: &mut CompoundFile<F>) -> Option<&'static str> {
    WORKBOOK_STREAMS
        .into_iter()
        .find(|name| stream_exists(ole, name))
}

pub(crate) fn read_stream<F: Read + Seek>(
    ole: &mut CompoundFile<F>,
    name: impl AsRef<Path>,
) -> Result<Vec<u8>, OffcryptoError> {
    let mut stream = ole.open_stream(name)?;
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Serialize a copy of `ole` with the root-level stream `name` replaced by `data`.
///
/// Storages keep their CLSIDs; every other stream is copied byte for byte.
pub(crate) fn rewrite_with_stream<F: Read + Seek>(
    ole: &mut CompoundFile<F>,
    name: &str,
    data: &[u8],
) -> Result<Vec<u8>, OffcryptoError> {
    let replaced = Path::new("/").join(name);
    let entries: Vec<_> = ole
        .walk()
        .map(|entry| (entry.path().to_path_buf(), entry.is_stream(), *entry.clsid()))
        .collect();

    let mut out = CompoundFile::create(Cursor::new(Vec::new()))?;
    for (path, is_stream, clsid) in entries {
        if is_stream {
            let bytes = if path == replaced {
                data.to_vec()
            } else {
                read_stream(ole, &path)?
            };
            out.create_stream(&path)?.write_all(&bytes)?;
        } else {
            if path != Path::new("/") {
                out.create_storage_all(&path)?;
            }
            out.set_storage_clsid(&path, clsid)?;
        }
    }
    out.flush()?;
    Ok(out.into_inner().into_inner())
}

pub(crate) fn read_prefix<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Classify an opened compound file and report whether it is encrypted.
pub(crate) fn classify<F: Read + Seek>(
    ole: &mut CompoundFile<F>,
) -> Result<(DocumentFormat, bool), OffcryptoError> {
    if stream_exists(ole, ENCRYPTION_INFO_STREAM) && stream_exists(ole, ENCRYPTED_PACKAGE_STREAM) {
        return Ok((DocumentFormat::EncryptedPackage, true));
    }

    for name in WORKBOOK_STREAMS {
        if let Ok(mut stream) = ole.open_stream(name) {
            let encrypted = biff_has_filepass(&mut stream)?;
            return Ok((DocumentFormat::LegacyExcel, encrypted));
        }
    }

    if let Ok(mut stream) = ole.open_stream("WordDocument") {
        let encrypted = word_fib_encrypted(&mut stream)?;
        return Ok((DocumentFormat::LegacyWord, encrypted));
    }

    if stream_exists(ole, "PowerPoint Document") {
        let encrypted = match ole.open_stream("Current User") {
            Ok(mut stream) => ppt_current_user_encrypted(&mut stream)?,
            Err(_) => {
                log::warn!("PowerPoint document has no `Current User` stream");
                false
            }
        };
        return Ok((DocumentFormat::LegacyPowerPoint, encrypted));
    }

    log::debug!("compound file holds no recognised Office streams");
    Err(OffcryptoError::UnrecognizedOleFormat)
}

/// Scan the workbook-globals substream for a `FILEPASS` record.
///
/// The scan stops at the globals `EOF` record or at the next `BOF`, whichever comes first.
fn biff_has_filepass<R: Read + Seek>(stream: &mut R) -> Result<bool, OffcryptoError> {
    let mut first = true;
    loop {
        let mut header = [0u8; 4];
        if read_prefix(stream, &mut header)? < header.len() {
            return Ok(false);
        }
        let id = u16::from_le_bytes([header[0], header[1]]);
        let len = u16::from_le_bytes([header[2], header[3]]);

        match id {
            RECORD_FILEPASS => return Ok(true),
            RECORD_EOF => return Ok(false),
            id if BOF_RECORD_IDS.contains(&id) && !first => return Ok(false),
            _ => {}
        }
        first = false;
        // A record running past the end of the stream ends the scan.
        if stream.seek(SeekFrom::Current(i64::from(len))).is_err() {
            return Ok(false);
        }
    }
}

fn word_fib_encrypted<R: Read>(stream: &mut R) -> Result<bool, OffcryptoError> {
    let mut fib = [0u8; WORD_FIB_FLAGS_OFFSET + 2];
    if read_prefix(stream, &mut fib)? < fib.len() {
        return Ok(false);
    }
    let ident = u16::from_le_bytes([fib[0], fib[1]]);
    let flags = u16::from_le_bytes([fib[WORD_FIB_FLAGS_OFFSET], fib[WORD_FIB_FLAGS_OFFSET + 1]]);
    Ok(ident == WORD_FIB_IDENT && flags & WORD_F_ENCRYPTED != 0)
}

/// `Current User` holds a record header (8 bytes), `size` (4) and then `headerToken` (4).
fn ppt_current_user_encrypted<R: Read>(stream: &mut R) -> Result<bool, OffcryptoError> {
    let mut atom = [0u8; 16];
    if read_prefix(stream, &mut atom)? < atom.len() {
        return Ok(false);
    }
    let token = u32::from_le_bytes([atom[12], atom[13], atom[14], atom[15]]);
    Ok(token == PPT_ENCRYPTED_HEADER_TOKEN)
}

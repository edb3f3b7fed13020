//! Atomic replacement of an output file.
//!
//! [`atomic_write`] writes into a temp file created next to the destination (so the final rename
//! never crosses devices), flushes and syncs it, then renames it over the destination. Until the
//! rename succeeds the destination keeps whatever it held before, or stays absent.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::Builder;

const TEMP_PREFIX: &str = ".office-unlock-";

#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError<E> {
    /// The temp file could not be created next to the destination (missing or read-only
    /// directory, permissions).
    #[error("cannot create a file in {}: {source}", dir.display())]
    Create { dir: PathBuf, source: io::Error },
    /// The caller's writer failed; nothing was committed.
    #[error("{0}")]
    Writer(E),
    /// Flushing, syncing or renaming the finished temp file failed.
    #[error("cannot replace {}: {source}", dest.display())]
    Commit { dest: PathBuf, source: io::Error },
}

impl<E> AtomicWriteError<E> {
    /// The I/O error behind a `Create`/`Commit` failure.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            AtomicWriteError::Create { source, .. } | AtomicWriteError::Commit { source, .. } => {
                Some(source)
            }
            AtomicWriteError::Writer(_) => None,
        }
    }
}

/// `Path::parent` is `Some("")` for bare relative names like `out.xlsx`; that means `.`.
fn parent_dir_or_dot(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Atomically write `dest` with the bytes produced by `write_fn`.
///
/// The destination directory must already exist. If `write_fn` fails, the temp file is removed
/// and `dest` is left untouched.
pub fn atomic_write<T, E>(
    dest: impl AsRef<Path>,
    write_fn: impl FnOnce(&mut File) -> Result<T, E>,
) -> Result<T, AtomicWriteError<E>> {
    let dest = dest.as_ref();
    let dir = parent_dir_or_dot(dest);

    let mut tmp = Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|source| AtomicWriteError::Create {
            dir: dir.to_path_buf(),
            source,
        })?;
    log::trace!("writing {} via {}", dest.display(), tmp.path().display());

    let out = write_fn(tmp.as_file_mut()).map_err(AtomicWriteError::Writer)?;

    let commit = |source| AtomicWriteError::Commit {
        dest: dest.to_path_buf(),
        source,
    };
    tmp.as_file_mut().flush().map_err(commit)?;
    tmp.as_file().sync_all().map_err(commit)?;

    let tmp_path = tmp.into_temp_path();
    replace_file(tmp_path.as_ref(), dest).map_err(commit)?;
    // The rename consumed the temp file; nothing is left for `TempPath` to delete.
    let _ = tmp_path.keep();

    // Best-effort: the file is already in place.
    if let Err(err) = sync_parent_dir(dest) {
        log::debug!("could not sync directory of {}: {err}", dest.display());
    }

    Ok(out)
}

fn sync_parent_dir(path: &Path) -> io::Result<()> {
    // Opening a directory as a file works on most Unix platforms, not on Windows.
    File::open(parent_dir_or_dot(path))?.sync_all()
}

fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt as _;
        use windows_sys::Win32::Storage::FileSystem::{MoveFileExW, MOVEFILE_REPLACE_EXISTING};

        fn to_wide_null(path: &Path) -> Vec<u16> {
            let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
            wide.push(0);
            wide
        }

        let from_w = to_wide_null(from);
        let to_w = to_wide_null(to);
        let ok = unsafe { MoveFileExW(from_w.as_ptr(), to_w.as_ptr(), MOVEFILE_REPLACE_EXISTING) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(windows))]
    {
        fs::rename(from, to)
    }
}

//! Crash-safe replacement of a single file.
//!
//! The new content goes to `<path>.tmp`, is fsynced, read back and decoded,
//! and only then renamed over `<path>`. Until the rename, `<path>` is
//! untouched; stale `.tmp` files are swept on the next mount.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::codec::{self, Envelope};
use crate::error::StoreError;

pub const TMP_SUFFIX: &str = ".tmp";

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(TMP_SUFFIX);
    PathBuf::from(s)
}

/// Encode `record`, write it beside `path`, verify by readback, then rename.
pub fn write_record<T: Envelope>(path: &Path, record: &T) -> Result<(), StoreError> {
    let bytes = codec::encode(record)?;
    let tmp = tmp_path(path);

    let staged = write_synced(&tmp, &bytes)
        .map_err(StoreError::from)
        .and_then(|()| verify_readback(&tmp, record));
    if let Err(e) = staged {
        discard(&tmp);
        return Err(e);
    }

    replace(&tmp, path).map_err(|e| {
        discard(&tmp);
        StoreError::from(e)
    })?;
    debug!(path = %path.display(), kind = T::KIND, "atomic: replaced");
    Ok(())
}

/// Same protocol for raw bytes without an envelope (counter, manifest).
pub fn write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    let result = write_synced(&tmp, bytes).and_then(|()| {
        let back = fs::read(&tmp)?;
        if back != bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "readback differs from written bytes",
            ));
        }
        replace(&tmp, path)
    });
    if result.is_err() {
        discard(&tmp);
    }
    result
}

fn write_synced(tmp: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

fn verify_readback<T: Envelope>(tmp: &Path, record: &T) -> Result<(), StoreError> {
    let back = fs::read(tmp)?;
    let decoded: T = codec::decode(&back)?;
    if decoded != *record {
        return Err(StoreError::VerifyMismatch(tmp.display().to_string()));
    }
    Ok(())
}

/// Move `tmp` over `path`. Rename replaces atomically where the filesystem
/// allows it; otherwise the old file is unlinked first.
fn replace(tmp: &Path, path: &Path) -> io::Result<()> {
    match fs::rename(tmp, path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            remove_if_exists(path)?;
            fs::rename(tmp, path)
        }
        Err(e) => Err(e),
    }
}

/// Remove `path`, treating "does not exist" as success. Returns whether a
/// file was actually removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn discard(tmp: &Path) {
    if let Err(e) = remove_if_exists(tmp) {
        warn!(path = %tmp.display(), "atomic: failed to remove temp file: {e}");
    }
}

/// Delete every `*.tmp` directly inside `dir`. Returns how many were removed.
pub fn sweep_tmp(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_tmp = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.ends_with(TMP_SUFFIX));
        if is_tmp && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        warn!(dir = %dir.display(), removed, "atomic: swept stale temp files");
    }
    Ok(removed)
}

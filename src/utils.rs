//! Filesystem helpers for the write path

use crate::error::WriteError;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Get a unique path for a file by appending " (1)", " (2)", ... to the stem
///
/// # Examples
///
/// ```
/// use usenet_writer::utils::get_unique_path;
/// use std::path::Path;
///
/// let path = Path::new("/tmp/usenet-writer-doc/movie.mkv");
/// let unique = get_unique_path(path).unwrap();
/// // If movie.mkv exists, returns movie (1).mkv
/// // If that exists too, returns movie (2).mkv, etc.
/// # assert_eq!(unique, path);
/// ```
pub fn get_unique_path(path: &Path) -> Result<PathBuf, WriteError> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| WriteError::FileCollision {
            path: path.to_path_buf(),
            reason: "cannot extract file stem".to_string(),
        })?;
    let extension = path.extension().and_then(|e| e.to_str());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    for i in 1..=MAX_RENAME_ATTEMPTS {
        let new_name = match extension {
            Some(ext) => format!("{} ({}).{}", stem, i, ext),
            None => format!("{} ({})", stem, i),
        };
        let new_path = parent.join(new_name);
        if !new_path.exists() {
            return Ok(new_path);
        }
    }

    Err(WriteError::FileCollision {
        path: path.to_path_buf(),
        reason: format!(
            "could not find unique filename after {} attempts",
            MAX_RENAME_ATTEMPTS
        ),
    })
}

/// Create a directory and all of its parents
///
/// Fails if the path (or one of its parents) exists but is not a directory.
pub fn force_directories(path: &Path) -> Result<(), WriteError> {
    if path.as_os_str().is_empty() || path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(WriteError::CreateDirectory {
            path: path.to_path_buf(),
            reason: "path is not a directory".to_string(),
        });
    }
    std::fs::create_dir_all(path).map_err(|e| WriteError::CreateDirectory {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Create `path` with a length of `size` bytes
///
/// A sparse file only sets the length; a non-sparse one reserves the blocks up
/// front (on Unix via `posix_fallocate`), which avoids fragmentation when
/// segments are written straight to disk.
pub fn allocate_file(path: &Path, size: u64, sparse: bool) -> Result<(), WriteError> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| WriteError::CreateFile {
            path: path.to_path_buf(),
            source: e,
        })?;

    if !sparse && size > 0 {
        reserve_blocks(&file, size).map_err(|e| WriteError::Allocate {
            path: path.to_path_buf(),
            size,
            reason: e.to_string(),
        })?;
    }

    file.set_len(size).map_err(|e| WriteError::Allocate {
        path: path.to_path_buf(),
        size,
        reason: e.to_string(),
    })
}

#[cfg(unix)]
fn reserve_blocks(file: &File, size: u64) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let len = libc::off_t::try_from(size)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "file too large"))?;
    // SAFETY: the descriptor is owned by `file`, which outlives the call.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    match rc {
        0 => Ok(()),
        // Filesystems without fallocate support fall back to set_len
        libc::EOPNOTSUPP | libc::EINVAL => Ok(()),
        errno => Err(std::io::Error::from_raw_os_error(errno)),
    }
}

#[cfg(not(unix))]
fn reserve_blocks(_file: &File, _size: u64) -> std::io::Result<()> {
    Ok(())
}

/// Move a file, falling back to copy + delete across filesystems
pub fn move_file(source: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            std::fs::copy(source, dest)?;
            std::fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}

/// Delete a file, treating "not found" as success
pub fn delete_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Whether a directory exists and has no entries
#[must_use]
pub fn dir_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Remove `dir` if it is empty, then each now-empty ancestor up to (excluding) `stop_at`
pub fn remove_empty_dirs(dir: &Path, stop_at: &Path) {
    let mut current = Some(dir);
    while let Some(path) = current {
        if path == stop_at || !path.starts_with(stop_at) || !dir_empty(path) {
            break;
        }
        if let Err(e) = std::fs::remove_dir(path) {
            tracing::debug!(path = %path.display(), error = %e, "Could not remove empty directory");
            break;
        }
        current = path.parent();
    }
}

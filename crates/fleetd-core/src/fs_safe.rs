//! Filesystem helpers hardened against symlink swaps and partial writes.
//!
//! State the daemons persist (sequence counters, signing keys, PID files)
//! is small but must never be observed half-written and must never follow
//! an attacker-planted symlink. All helpers here:
//!
//! - refuse to operate through symlinks (checked with `symlink_metadata`,
//!   so the link itself is never followed)
//! - create files with mode 0600 and fresh directories with mode 0700
//! - write via a temporary file in the same directory, fsync, then rename,
//!   so readers see either the old content or the new content in full

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Errors from the hardened filesystem helpers.
#[derive(Debug, thiserror::Error)]
pub enum FsSafeError {
    /// The target path is a symlink. Operating through it would let a
    /// less-privileged writer redirect the operation.
    #[error("refusing to operate on symlink at {}", path.display())]
    SymlinkRefused {
        /// The offending path.
        path: PathBuf,
    },

    /// A file exceeded the caller's size bound.
    #[error("{} is {size} bytes, exceeding the {max}-byte bound", path.display())]
    TooLarge {
        /// The offending path.
        path: PathBuf,
        /// Actual size on disk.
        size: u64,
        /// The enforced bound.
        max: u64,
    },

    /// The path exists but is not the expected kind of entry.
    #[error("{} exists but is not a {expected}", path.display())]
    WrongKind {
        /// The offending path.
        path: PathBuf,
        /// What the caller needed ("file" or "directory").
        expected: &'static str,
    },

    /// An underlying I/O operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// The path being operated on.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

impl FsSafeError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Ensures `path` is a directory, creating it with mode 0700 if absent.
///
/// Permissions of pre-existing directories are left untouched so a
/// misconfigured path cannot clobber system directories.
///
/// # Errors
///
/// Returns [`FsSafeError::SymlinkRefused`] if the path is a symlink, or
/// [`FsSafeError::WrongKind`] if it exists and is not a directory.
pub fn ensure_private_dir(path: &Path) -> Result<(), FsSafeError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(FsSafeError::SymlinkRefused {
                    path: path.to_path_buf(),
                });
            }
            if !metadata.is_dir() {
                return Err(FsSafeError::WrongKind {
                    path: path.to_path_buf(),
                    expected: "directory",
                });
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|err| FsSafeError::io(path, err))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(0o700))
                    .map_err(|err| FsSafeError::io(path, err))?;
            }
            Ok(())
        }
        Err(err) => Err(FsSafeError::io(path, err)),
    }
}

/// Atomically replaces the contents of `path` with `bytes`.
///
/// The data is written to a temporary file in the same directory (created
/// with mode 0600), flushed to disk, then renamed over the target. The
/// parent directory is created with mode 0700 if it does not exist.
///
/// # Errors
///
/// Returns [`FsSafeError::SymlinkRefused`] if `path` is a symlink, or
/// [`FsSafeError::Io`] if any step of the write fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), FsSafeError> {
    refuse_symlink(path)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_private_dir(parent)?;

    let mut temp =
        tempfile::NamedTempFile::new_in(parent).map_err(|err| FsSafeError::io(parent, err))?;
    temp.write_all(bytes)
        .map_err(|err| FsSafeError::io(path, err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| FsSafeError::io(path, err))?;
    temp.persist(path)
        .map_err(|err| FsSafeError::io(path, err.error))?;

    // Make the rename itself durable. Failure here leaves the new content
    // in place, just without the directory entry flushed.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Reads the contents of `path`, refusing symlinks and files larger than
/// `max` bytes.
///
/// # Errors
///
/// Returns [`FsSafeError::SymlinkRefused`], [`FsSafeError::TooLarge`], or
/// [`FsSafeError::Io`] (with `ErrorKind::NotFound` preserved for callers
/// that treat a missing file as a default).
pub fn bounded_read(path: &Path, max: u64) -> Result<Vec<u8>, FsSafeError> {
    let metadata = fs::symlink_metadata(path).map_err(|err| FsSafeError::io(path, err))?;
    if metadata.file_type().is_symlink() {
        return Err(FsSafeError::SymlinkRefused {
            path: path.to_path_buf(),
        });
    }
    if !metadata.is_file() {
        return Err(FsSafeError::WrongKind {
            path: path.to_path_buf(),
            expected: "file",
        });
    }
    if metadata.len() > max {
        return Err(FsSafeError::TooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max,
        });
    }

    let file = fs::File::open(path).map_err(|err| FsSafeError::io(path, err))?;
    let mut bytes = Vec::with_capacity(metadata.len() as usize);
    // The bound is re-applied during the read in case the file grew
    // between stat and open.
    file.take(max + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| FsSafeError::io(path, err))?;
    if bytes.len() as u64 > max {
        return Err(FsSafeError::TooLarge {
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            max,
        });
    }
    Ok(bytes)
}

/// Returns `true` if the error is a missing-file condition, letting
/// callers substitute a default without matching on `io::ErrorKind`.
#[must_use]
pub fn is_not_found(err: &FsSafeError) -> bool {
    matches!(err, FsSafeError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
}

fn refuse_symlink(path: &Path) -> Result<(), FsSafeError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => Err(FsSafeError::SymlinkRefused {
            path: path.to_path_buf(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn atomic_write_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("counter");

        atomic_write(&path, b"1").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"1");

        atomic_write(&path, b"2").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"2");
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_creates_private_parent() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh").join("value");
        atomic_write(&path, b"x").unwrap();

        let mode = fs::metadata(dir.path().join("fresh"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_refuses_symlink_target() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        let link = dir.path().join("link");
        fs::write(&real, b"orig").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = atomic_write(&link, b"evil").unwrap_err();
        assert!(matches!(err, FsSafeError::SymlinkRefused { .. }));
        assert_eq!(fs::read(&real).unwrap(), b"orig");
    }

    #[test]
    fn bounded_read_enforces_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, vec![0u8; 64]).unwrap();

        assert_eq!(bounded_read(&path, 64).unwrap().len(), 64);
        let err = bounded_read(&path, 63).unwrap_err();
        assert!(matches!(err, FsSafeError::TooLarge { .. }));
    }

    #[test]
    fn bounded_read_missing_file_is_detectable() {
        let dir = TempDir::new().unwrap();
        let err = bounded_read(&dir.path().join("absent"), 16).unwrap_err();
        assert!(is_not_found(&err));
    }

    #[cfg(unix)]
    #[test]
    fn ensure_private_dir_rejects_symlinked_dir() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real_dir");
        let link = dir.path().join("link_dir");
        fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = ensure_private_dir(&link).unwrap_err();
        assert!(matches!(err, FsSafeError::SymlinkRefused { .. }));
    }
}

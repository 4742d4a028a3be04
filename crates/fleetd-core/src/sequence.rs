//! Durable monotonic sequence counter.
//!
//! Every signed envelope carries a `seq` that must be strictly greater
//! than any value the backend has already accepted from this device, even
//! across agent restarts. The counter persists each increment to a small
//! state file; persistence is best-effort by design. A failed write keeps
//! the in-memory counter advancing, so issued values never repeat within
//! a process lifetime, and a lost write can only make the next restart
//! resume from a lower value, which the backend rejects as replay rather
//! than accepts silently.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::fs_safe;

/// Counter state files are a short decimal string; anything bigger is
/// corrupt.
const MAX_STATE_FILE_LEN: u64 = 64;

/// Error raised when persisting the counter fails through both the atomic
/// and the direct write path.
#[derive(Debug, thiserror::Error)]
#[error("failed to persist sequence counter to {}", path.display())]
pub struct SequenceStoreError {
    /// The state file path.
    pub path: PathBuf,
    /// The direct-write error; the atomic-path error was already logged.
    #[source]
    pub source: std::io::Error,
}

/// Monotonic counter with best-effort durability.
#[derive(Debug)]
pub struct SequenceCounter {
    path: PathBuf,
    value: Mutex<u64>,
}

impl SequenceCounter {
    /// Loads the counter from its state file.
    ///
    /// A missing file starts the counter at zero. An unreadable or
    /// unparsable file also starts at zero, with a warning: resuming too
    /// low is refused by the backend, whereas failing to start the agent
    /// would take the device offline entirely.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let value = match fs_safe::bounded_read(&path, MAX_STATE_FILE_LEN) {
            Ok(bytes) => match std::str::from_utf8(&bytes)
                .map_err(|_| ())
                .and_then(|text| text.trim().parse::<u64>().map_err(|_| ()))
            {
                Ok(value) => {
                    debug!(path = %path.display(), value, "loaded sequence counter");
                    value
                }
                Err(()) => {
                    warn!(
                        path = %path.display(),
                        "sequence state file is unparsable; restarting counter at 0"
                    );
                    0
                }
            },
            Err(ref err) if fs_safe::is_not_found(err) => 0,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "sequence state file is unreadable; restarting counter at 0"
                );
                0
            }
        };
        Self {
            path,
            value: Mutex::new(value),
        }
    }

    /// The most recently issued value (zero if none was issued yet).
    #[must_use]
    pub fn current(&self) -> u64 {
        *self.lock()
    }

    /// Issues the next value: increments, persists, and returns it.
    ///
    /// The increment and the read-back of the new value happen under one
    /// lock, so concurrent callers each get a distinct value. Persistence
    /// failures are logged and do not fail the caller.
    pub fn next(&self) -> u64 {
        let mut guard = self.lock();
        *guard += 1;
        let value = *guard;
        drop(guard);

        if let Err(err) = self.persist(value) {
            warn!(
                path = %self.path.display(),
                value,
                error = %err,
                "sequence persist failed; counter advanced in memory only"
            );
        }
        value
    }

    /// State file location, for diagnostics.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, value: u64) -> Result<(), SequenceStoreError> {
        let text = value.to_string();
        match fs_safe::atomic_write(&self.path, text.as_bytes()) {
            Ok(()) => Ok(()),
            Err(atomic_err) => {
                // Rename can be unavailable (exotic mounts); fall back to
                // a plain truncate-and-write before giving up.
                debug!(
                    path = %self.path.display(),
                    error = %atomic_err,
                    "atomic sequence write failed; trying direct write"
                );
                std::fs::write(&self.path, text.as_bytes()).map_err(|source| {
                    SequenceStoreError {
                        path: self.path.clone(),
                        source,
                    }
                })
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        // A poisoned lock only means another thread panicked mid-increment;
        // the u64 inside is still coherent.
        self.value
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

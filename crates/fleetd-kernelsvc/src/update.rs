//! Staged update lifecycle: stage, commit, rollback, self-repair.
//!
//! The manager owns one directory tree:
//!
//! ```text
//! <root>/
//!   stage/sandbox/<sandbox-id>/<package>   staged, isolated
//!   stage/direct/<sandbox-id>/<package>    staged, direct mode
//!   current/<package>                      active packages
//!   snapshots/<package>                    rollback sources
//!   logs/agent.log                         service log (truncation target)
//!   service.lock                           stale lock marker
//! ```
//!
//! The hard invariant: a transition that fails partway leaves the tree in
//! a previously-valid state. Commit renames the outgoing active package to
//! `.bak` before activating and keeps that backup on failure; rollback
//! restores its backup when the copy fails and only deletes it after the
//! restored package is verified in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Logs larger than this are truncated by self-repair.
pub const MAX_LOG_LEN: u64 = 100 * 1024 * 1024;

/// Suffix given to the outgoing active package during commit.
const BACKUP_SUFFIX: &str = ".bak";

/// Prefix given to the active package's safety copy during rollback.
const ROLLBACK_BACKUP_PREFIX: &str = "rollback_backup_";

/// Update lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The candidate package does not exist or is not a regular file.
    #[error("package not found at {}", path.display())]
    PackageMissing {
        /// The rejected path.
        path: PathBuf,
    },

    /// The sandbox id is not in the generated form. Ids are produced by
    /// staging and must round-trip unmodified; anything else is treated
    /// as hostile.
    #[error("sandbox id {sandbox_id:?} is not in the sandbox-<16 hex> form")]
    InvalidSandboxId {
        /// The rejected id.
        sandbox_id: String,
    },

    /// The snapshot id contains path separators or is empty.
    #[error("snapshot id {snapshot_id:?} must be a bare name")]
    InvalidSnapshotId {
        /// The rejected id.
        snapshot_id: String,
    },

    /// No staged package exists under the given sandbox id.
    #[error("no staged package under sandbox id {sandbox_id}")]
    StagedPackageMissing {
        /// The id that matched nothing.
        sandbox_id: String,
    },

    /// No snapshot matches the given id.
    #[error("no snapshot named {snapshot_id}")]
    SnapshotMissing {
        /// The id that matched nothing.
        snapshot_id: String,
    },

    /// The snapshot's content already matches the active package, so the
    /// rollback would be a no-op; refused to avoid a pointless destructive
    /// window.
    #[error("snapshot {snapshot_id} already matches the active package")]
    SnapshotEquivalent {
        /// The refused snapshot.
        snapshot_id: String,
    },

    /// Commit's final rename failed. The `.bak` made beforehand, if any,
    /// is left in place.
    #[error("failed to activate {}: {source}", staged.display())]
    Activate {
        /// The staged package that could not be moved.
        staged: PathBuf,
        /// The underlying rename error.
        #[source]
        source: io::Error,
    },

    /// Rollback's restore copy failed. The pre-rollback backup has been
    /// moved back into place.
    #[error("failed to restore snapshot over {}: {source}", target.display())]
    Restore {
        /// The active location that could not be written.
        target: PathBuf,
        /// The underlying copy error.
        #[source]
        source: io::Error,
    },

    /// The active package is missing after the restore copy reported
    /// success; the backup is kept.
    #[error("active package missing after restoring snapshot {snapshot_id}")]
    RestoreVerify {
        /// The snapshot being restored.
        snapshot_id: String,
    },

    /// Any other filesystem failure.
    #[error("update tree I/O error at {}: {source}", path.display())]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// What staging produced.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Generated sandbox id, `sandbox-<16 hex>`.
    pub sandbox_id: String,
    /// Where the package copy landed.
    pub staged_path: PathBuf,
}

/// What commit produced.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// The now-active package.
    pub active_path: PathBuf,
    /// The outgoing package's backup, when one existed.
    pub backup_path: Option<PathBuf>,
}

/// What rollback produced.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    /// The restored active package.
    pub active_path: PathBuf,
}

/// What self-repair found and did.
#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    /// Number of repair actions actually performed.
    pub actions_taken: u32,
    /// Critical binaries that are absent. Reported, never fixed.
    pub missing_binaries: Vec<String>,
}

/// Owns the update tree and its transitions.
#[derive(Debug)]
pub struct UpdateManager {
    root: PathBuf,
    critical_binaries: Vec<PathBuf>,
}

impl UpdateManager {
    /// Manager over `root` with the default critical-binary set.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            critical_binaries: vec![
                PathBuf::from("/usr/local/bin/fleetd-kernelsvc"),
                PathBuf::from("/usr/local/bin/fleetd-agent"),
            ],
        }
    }

    /// Replaces the critical-binary presence list checked by self-repair.
    #[must_use]
    pub fn with_critical_binaries(mut self, binaries: Vec<PathBuf>) -> Self {
        self.critical_binaries = binaries;
        self
    }

    /// The update tree root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copies a candidate package into a fresh sandbox. The source and the
    /// active tree are never touched.
    ///
    /// # Errors
    ///
    /// [`UpdateError::PackageMissing`] when the source is absent, plus
    /// filesystem failures.
    pub fn stage(&self, package_path: &Path, sandbox: bool) -> Result<StageOutcome, UpdateError> {
        if !package_path.is_file() {
            return Err(UpdateError::PackageMissing {
                path: package_path.to_path_buf(),
            });
        }
        let Some(file_name) = package_path.file_name() else {
            return Err(UpdateError::PackageMissing {
                path: package_path.to_path_buf(),
            });
        };

        let sandbox_id = format!("sandbox-{:016x}", rand::random::<u64>());
        let mode = if sandbox { "sandbox" } else { "direct" };
        let sandbox_dir = self.root.join("stage").join(mode).join(&sandbox_id);
        fs::create_dir_all(&sandbox_dir).map_err(|source| UpdateError::Io {
            path: sandbox_dir.clone(),
            source,
        })?;

        let staged_path = sandbox_dir.join(file_name);
        fs::copy(package_path, &staged_path).map_err(|source| UpdateError::Io {
            path: staged_path.clone(),
            source,
        })?;

        info!(
            sandbox_id = %sandbox_id,
            staged_path = %staged_path.display(),
            mode,
            "package staged"
        );
        Ok(StageOutcome {
            sandbox_id,
            staged_path,
        })
    }

    /// Moves a staged package into the active location.
    ///
    /// An active package of the same name is renamed to `.bak` first and
    /// survives a failed commit; it is only dropped by the next successful
    /// commit of the same name.
    ///
    /// # Errors
    ///
    /// [`UpdateError::StagedPackageMissing`] when the id matches nothing,
    /// [`UpdateError::Activate`] when the final rename fails, plus
    /// filesystem failures.
    pub fn commit(&self, sandbox_id: &str) -> Result<CommitOutcome, UpdateError> {
        validate_sandbox_id(sandbox_id)?;
        let (sandbox_dir, staged_path) = self.find_staged(sandbox_id)?;
        let Some(file_name) = staged_path.file_name() else {
            return Err(UpdateError::StagedPackageMissing {
                sandbox_id: sandbox_id.to_string(),
            });
        };

        let active_dir = self.root.join("current");
        fs::create_dir_all(&active_dir).map_err(|source| UpdateError::Io {
            path: active_dir.clone(),
            source,
        })?;
        let active_path = active_dir.join(file_name);

        // Preserve the outgoing package before anything destructive.
        let backup_path = if active_path.exists() {
            let backup = active_dir.join(format!(
                "{}{BACKUP_SUFFIX}",
                file_name.to_string_lossy()
            ));
            if backup.exists() {
                fs::remove_file(&backup).map_err(|source| UpdateError::Io {
                    path: backup.clone(),
                    source,
                })?;
            }
            fs::rename(&active_path, &backup).map_err(|source| UpdateError::Io {
                path: backup.clone(),
                source,
            })?;
            Some(backup)
        } else {
            None
        };

        if let Err(source) = fs::rename(&staged_path, &active_path) {
            warn!(
                sandbox_id = %sandbox_id,
                backup_preserved = backup_path.is_some(),
                "commit rename failed; previous active package untouched"
            );
            return Err(UpdateError::Activate {
                staged: staged_path,
                source,
            });
        }

        // The emptied sandbox is cosmetic; its removal must not fail the
        // commit that already happened.
        if let Err(err) = fs::remove_dir_all(&sandbox_dir) {
            warn!(
                sandbox_dir = %sandbox_dir.display(),
                error = %err,
                "could not remove emptied sandbox"
            );
        }

        info!(
            sandbox_id = %sandbox_id,
            active_path = %active_path.display(),
            backed_up = backup_path.is_some(),
            "package committed"
        );
        Ok(CommitOutcome {
            active_path,
            backup_path,
        })
    }

    /// Restores a snapshot over the active package of the same name.
    ///
    /// Refused when the snapshot's content already matches the active
    /// package. The active package is backed up first; the backup is
    /// restored if the copy fails and deleted only after the restored
    /// package is verified in place.
    ///
    /// # Errors
    ///
    /// [`UpdateError::SnapshotMissing`], [`UpdateError::SnapshotEquivalent`],
    /// [`UpdateError::Restore`], [`UpdateError::RestoreVerify`], plus
    /// filesystem failures.
    pub fn rollback(&self, snapshot_id: &str) -> Result<RollbackOutcome, UpdateError> {
        validate_snapshot_id(snapshot_id)?;
        let snapshot_path = self.find_snapshot(snapshot_id)?;
        let Some(file_name) = snapshot_path.file_name() else {
            return Err(UpdateError::SnapshotMissing {
                snapshot_id: snapshot_id.to_string(),
            });
        };

        let active_dir = self.root.join("current");
        fs::create_dir_all(&active_dir).map_err(|source| UpdateError::Io {
            path: active_dir.clone(),
            source,
        })?;
        let active_path = active_dir.join(file_name);

        if active_path.exists() && file_digest(&snapshot_path)? == file_digest(&active_path)? {
            return Err(UpdateError::SnapshotEquivalent {
                snapshot_id: snapshot_id.to_string(),
            });
        }

        let backup_path = active_dir.join(format!(
            "{ROLLBACK_BACKUP_PREFIX}{}",
            file_name.to_string_lossy()
        ));
        if backup_path.exists() {
            fs::remove_file(&backup_path).map_err(|source| UpdateError::Io {
                path: backup_path.clone(),
                source,
            })?;
        }

        let had_active = active_path.exists();
        if had_active {
            fs::rename(&active_path, &backup_path).map_err(|source| UpdateError::Io {
                path: backup_path.clone(),
                source,
            })?;
        }

        if let Err(source) = fs::copy(&snapshot_path, &active_path) {
            if had_active {
                if let Err(err) = fs::rename(&backup_path, &active_path) {
                    warn!(
                        backup_path = %backup_path.display(),
                        error = %err,
                        "backup restore failed; backup left in place"
                    );
                }
            }
            return Err(UpdateError::Restore {
                target: active_path,
                source,
            });
        }

        if !active_path.exists() {
            return Err(UpdateError::RestoreVerify {
                snapshot_id: snapshot_id.to_string(),
            });
        }
        if had_active {
            if let Err(err) = fs::remove_file(&backup_path) {
                warn!(
                    backup_path = %backup_path.display(),
                    error = %err,
                    "restored successfully but the backup could not be removed"
                );
            }
        }

        info!(
            snapshot_id = %snapshot_id,
            active_path = %active_path.display(),
            "snapshot restored"
        );
        Ok(RollbackOutcome { active_path })
    }

    /// Conservative, idempotent repair pass: removes a stale lock marker,
    /// resets the staging root, truncates an oversized log, and reports
    /// (without fixing) missing critical binaries.
    ///
    /// # Errors
    ///
    /// Filesystem failures; a clean tree yields `Ok` with zero actions.
    pub fn self_repair(&self) -> Result<RepairReport, UpdateError> {
        let mut report = RepairReport::default();

        let lock_path = self.root.join("service.lock");
        if lock_path.exists() {
            fs::remove_file(&lock_path).map_err(|source| UpdateError::Io {
                path: lock_path.clone(),
                source,
            })?;
            info!(lock_path = %lock_path.display(), "removed stale lock marker");
            report.actions_taken += 1;
        }

        let stage_root = self.root.join("stage");
        let stage_dirty = match fs::read_dir(&stage_root) {
            Ok(mut entries) => entries.next().is_some(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(source) => {
                return Err(UpdateError::Io {
                    path: stage_root,
                    source,
                })
            }
        };
        if stage_dirty {
            if stage_root.exists() {
                fs::remove_dir_all(&stage_root).map_err(|source| UpdateError::Io {
                    path: stage_root.clone(),
                    source,
                })?;
            }
            fs::create_dir_all(&stage_root).map_err(|source| UpdateError::Io {
                path: stage_root.clone(),
                source,
            })?;
            info!("staging root reset");
            report.actions_taken += 1;
        }

        let log_path = self.root.join("logs").join("agent.log");
        if let Ok(metadata) = fs::metadata(&log_path) {
            if metadata.len() > MAX_LOG_LEN {
                let file = fs::OpenOptions::new()
                    .write(true)
                    .open(&log_path)
                    .map_err(|source| UpdateError::Io {
                        path: log_path.clone(),
                        source,
                    })?;
                file.set_len(0).map_err(|source| UpdateError::Io {
                    path: log_path.clone(),
                    source,
                })?;
                info!(
                    log_path = %log_path.display(),
                    previous_len = metadata.len(),
                    "truncated oversized log"
                );
                report.actions_taken += 1;
            }
        }

        for binary in &self.critical_binaries {
            if !binary.exists() {
                report
                    .missing_binaries
                    .push(binary.to_string_lossy().into_owned());
            }
        }
        if !report.missing_binaries.is_empty() {
            warn!(
                missing = ?report.missing_binaries,
                "critical binaries absent; reporting only"
            );
        }

        info!(actions_taken = report.actions_taken, "self-repair finished");
        Ok(report)
    }

    /// Locates a staged package by sandbox id across both staging modes.
    fn find_staged(&self, sandbox_id: &str) -> Result<(PathBuf, PathBuf), UpdateError> {
        for mode in ["sandbox", "direct"] {
            let dir = self.root.join("stage").join(mode).join(sandbox_id);
            if !dir.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(&dir)
                .map_err(|source| UpdateError::Io {
                    path: dir.clone(),
                    source,
                })?
                .flatten();
            if let Some(entry) = entries.next() {
                return Ok((dir, entry.path()));
            }
        }
        Err(UpdateError::StagedPackageMissing {
            sandbox_id: sandbox_id.to_string(),
        })
    }

    /// Locates a snapshot whose file name or stem equals `snapshot_id`.
    fn find_snapshot(&self, snapshot_id: &str) -> Result<PathBuf, UpdateError> {
        let snapshot_root = self.root.join("snapshots");
        let entries = match fs::read_dir(&snapshot_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(UpdateError::SnapshotMissing {
                    snapshot_id: snapshot_id.to_string(),
                });
            }
            Err(source) => {
                return Err(UpdateError::Io {
                    path: snapshot_root,
                    source,
                });
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name_matches = path
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == snapshot_id);
            let stem_matches = path
                .file_stem()
                .is_some_and(|stem| stem.to_string_lossy() == snapshot_id);
            if name_matches || stem_matches {
                return Ok(path);
            }
        }
        Err(UpdateError::SnapshotMissing {
            snapshot_id: snapshot_id.to_string(),
        })
    }
}

/// Ids are only ever produced by [`UpdateManager::stage`]; anything that
/// does not match the generated form is refused before touching the tree.
fn validate_sandbox_id(sandbox_id: &str) -> Result<(), UpdateError> {
    let valid = sandbox_id
        .strip_prefix("sandbox-")
        .is_some_and(|hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(UpdateError::InvalidSandboxId {
            sandbox_id: sandbox_id.to_string(),
        })
    }
}

fn validate_snapshot_id(snapshot_id: &str) -> Result<(), UpdateError> {
    if snapshot_id.is_empty()
        || snapshot_id.contains('/')
        || snapshot_id.contains('\\')
        || snapshot_id == "."
        || snapshot_id == ".."
    {
        return Err(UpdateError::InvalidSnapshotId {
            snapshot_id: snapshot_id.to_string(),
        });
    }
    Ok(())
}

/// Content digest used for the rollback equivalence check. Two packages
/// are equivalent when their bytes hash the same, regardless of inode.
fn file_digest(path: &Path) -> Result<blake3::Hash, UpdateError> {
    let mut file = fs::File::open(path).map_err(|source| UpdateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(|source| UpdateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hasher.finalize())
}

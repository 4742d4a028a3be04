//! Privileged system actions behind the opcodes.
//!
//! The executor talks to this layer through [`PrivilegedOps`] so tests can
//! substitute a recording mock; [`SystemdOps`] is the production
//! implementation and drives `loginctl`/`systemctl`/`shutdown`.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How a screen lock was achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMethod {
    /// The caller's active session was locked.
    ActiveSession,
    /// Every session on the machine was locked; used when no single
    /// active session could be addressed.
    AllSessions,
}

impl LockMethod {
    /// Wire label reported back to the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ActiveSession => "active_session",
            Self::AllSessions => "all_sessions",
        }
    }
}

/// Failures from privileged actions.
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    /// The helper binary could not be spawned at all.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// The rendered command line.
        command: String,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The helper ran and reported failure.
    #[error("{command} failed with status {status:?}: {stderr}")]
    CommandFailed {
        /// The rendered command line.
        command: String,
        /// Exit code, when the process was not signal-killed.
        status: Option<i32>,
        /// Trimmed stderr capture.
        stderr: String,
    },
}

/// The privileged actions the executor can take.
#[async_trait]
pub trait PrivilegedOps: Send + Sync {
    /// Locks the screen, reporting how the lock was achieved.
    async fn lock_screen(&self) -> Result<LockMethod, OpsError>;

    /// Reboots the machine after `delay_seconds`.
    async fn reboot(&self, delay_seconds: u64) -> Result<(), OpsError>;

    /// Powers the machine off, forcing when asked.
    async fn shutdown(&self, force: bool) -> Result<(), OpsError>;

    /// Terminates the logged-in user sessions.
    async fn logout(&self) -> Result<(), OpsError>;
}

/// Production implementation for systemd-managed machines.
#[derive(Debug, Default)]
pub struct SystemdOps;

#[async_trait]
impl PrivilegedOps for SystemdOps {
    async fn lock_screen(&self) -> Result<LockMethod, OpsError> {
        // lock-session without an id addresses the caller's session; on a
        // headless or multi-seat box that fails, and locking everything is
        // the acceptable fallback.
        match run("loginctl", &["lock-session"]).await {
            Ok(()) => Ok(LockMethod::ActiveSession),
            Err(err) => {
                warn!(error = %err, "per-session lock failed; locking all sessions");
                run("loginctl", &["lock-sessions"]).await?;
                Ok(LockMethod::AllSessions)
            }
        }
    }

    async fn reboot(&self, delay_seconds: u64) -> Result<(), OpsError> {
        if delay_seconds == 0 {
            info!("rebooting now");
            return run("systemctl", &["reboot"]).await;
        }
        let minutes = delay_to_minutes(delay_seconds);
        info!(delay_seconds, minutes, "scheduling reboot");
        run("shutdown", &["-r", &format!("+{minutes}")]).await
    }

    async fn shutdown(&self, force: bool) -> Result<(), OpsError> {
        info!(force, "powering off");
        if force {
            run("systemctl", &["poweroff", "--force"]).await
        } else {
            run("systemctl", &["poweroff"]).await
        }
    }

    async fn logout(&self) -> Result<(), OpsError> {
        info!("terminating seat sessions");
        run("loginctl", &["terminate-seat", "seat0"]).await
    }
}

/// `shutdown(8)` takes whole minutes; round up so a short delay never
/// becomes an immediate reboot.
fn delay_to_minutes(delay_seconds: u64) -> u64 {
    delay_seconds.div_ceil(60).max(1)
}

async fn run(program: &str, args: &[&str]) -> Result<(), OpsError> {
    let command = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    debug!(command = %command, "running privileged helper");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| OpsError::Spawn {
            command: command.clone(),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(OpsError::CommandFailed {
            command,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

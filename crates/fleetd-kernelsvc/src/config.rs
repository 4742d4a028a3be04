//! Environment-driven service configuration.
//!
//! Every knob has a workable default; the service starts with an empty
//! environment and refuses nothing until an opcode actually needs the
//! missing piece. The two `1`-valued gates are deliberate opt-ins and
//! accept no other spelling.

use std::path::PathBuf;

use fleetd_core::crypto::KeySource;

/// Default IPC socket path.
pub const DEFAULT_IPC_SOCKET: &str = "/run/fleetd/kernelsvc.sock";

/// Default root of the staged-update tree.
pub const DEFAULT_UPDATE_ROOT: &str = "/var/lib/fleetd/updates";

/// Default state directory (generated keys, pid file).
pub const DEFAULT_STATE_DIR: &str = "/var/lib/fleetd";

/// Kernel service runtime configuration.
#[derive(Debug)]
pub struct KernelConfig {
    /// IPC socket the service listens on.
    pub socket_path: PathBuf,
    /// Root of the staged-update tree.
    pub update_root: PathBuf,
    /// State directory for generated keys and the pid file.
    pub state_dir: PathBuf,
    /// Where the response signing key comes from.
    pub kernel_key: KeySource,
    /// Whether destructive opcodes may actually run. Off means dry-run.
    pub allow_dangerous_ops: bool,
    /// Whether the one-shot `--once` entry point may be used.
    pub allow_exec_fallback: bool,
}

impl KernelConfig {
    /// Builds the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// The signing key resolves in precedence order:
    /// `FLEETD_KERNEL_KEY_B64` (inline seed), then
    /// `FLEETD_KERNEL_KEY_FILE`, then a key generated under
    /// `<state_dir>/keys` on first run.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let socket_path = get(&lookup, "FLEETD_IPC_SOCKET")
            .map_or_else(|| PathBuf::from(DEFAULT_IPC_SOCKET), PathBuf::from);
        let update_root = get(&lookup, "FLEETD_UPDATE_ROOT")
            .map_or_else(|| PathBuf::from(DEFAULT_UPDATE_ROOT), PathBuf::from);
        let state_dir = get(&lookup, "FLEETD_STATE_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_STATE_DIR), PathBuf::from);

        let kernel_key = match (
            get(&lookup, "FLEETD_KERNEL_KEY_B64"),
            get(&lookup, "FLEETD_KERNEL_KEY_FILE"),
        ) {
            (Some(seed), _) => KeySource::Inline(seed),
            (None, Some(path)) => KeySource::File(PathBuf::from(path)),
            (None, None) => KeySource::Platform {
                dir: state_dir.join("keys"),
                label: "kernel".to_string(),
            },
        };

        Self {
            socket_path,
            update_root,
            state_dir,
            kernel_key,
            allow_dangerous_ops: flag(&lookup, "FLEETD_ALLOW_DANGEROUS_OPS"),
            allow_exec_fallback: flag(&lookup, "FLEETD_ALLOW_EXEC_FALLBACK"),
        }
    }

    /// Path of the pid file written after daemonization.
    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("kernelsvc.pid")
    }
}

fn get(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Option<String> {
    lookup(name).filter(|value| !value.trim().is_empty())
}

/// Boolean gates accept exactly `"1"`; anything else leaves them closed.
fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> bool {
    lookup(name).as_deref() == Some("1")
}

//! Environment-driven agent configuration.
//!
//! All knobs come from `FLEETD_*` environment variables so the agent can run
//! under systemd, a container, or a test harness without a config file.
//! [`AgentConfig::from_lookup`] takes the lookup function as a parameter so
//! tests never touch the process environment.

use std::fmt;
use std::path::PathBuf;

use ed25519_dalek::VerifyingKey;
use fleetd_core::crypto::{self, KeySource};

/// Default agent state directory (sequence counter, generated keys).
pub const DEFAULT_STATE_DIR: &str = "/var/lib/fleetd";

/// Default kernel-service IPC socket path.
pub const DEFAULT_IPC_SOCKET: &str = "/run/fleetd/kernelsvc.sock";

/// Default kernel-service binary name, resolved via `PATH` when the
/// one-shot exec fallback is enabled.
pub const DEFAULT_KERNELSVC_BIN: &str = "fleetd-kernelsvc";

/// Configuration errors surfaced at startup, before any connection is made.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("required environment variable {name} is not set")]
    MissingVar {
        /// The variable's name.
        name: &'static str,
    },

    /// A variable is set but its value cannot be used.
    #[error("environment variable {name} is invalid: {reason}")]
    InvalidVar {
        /// The variable's name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Agent runtime configuration.
pub struct AgentConfig {
    /// Backend endpoint, e.g. `unix:///run/fleetd/backend.sock`.
    pub endpoint: String,
    /// Stable device identifier presented in every envelope.
    pub device_id: String,
    /// Enrollment token carried in the AUTH body.
    pub auth_token: String,
    /// Directory for the sequence counter and generated keys.
    pub state_dir: PathBuf,
    /// Sequence counter file override; defaults to `<state_dir>/seq`.
    pub seq_path: Option<PathBuf>,
    /// Kernel-service IPC socket path.
    pub kernel_socket: PathBuf,
    /// Where the agent signing key comes from.
    pub agent_key: KeySource,
    /// Backend public key for verifying inbound envelopes. When absent the
    /// agent accepts inbound frames unverified and says so in the log.
    pub backend_pubkey: Option<VerifyingKey>,
    /// Kernel-service public key for verifying response stamps.
    pub kernel_pubkey: Option<VerifyingKey>,
    /// Whether the one-shot exec fallback may be used when the kernel
    /// socket is unreachable.
    pub allow_exec_fallback: bool,
    /// Kernel-service binary invoked by the exec fallback.
    pub kernelsvc_binary: PathBuf,
}

impl AgentConfig {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// Empty and whitespace-only values count as unset. The agent signing
    /// key resolves in precedence order: `FLEETD_AGENT_KEY_B64` (inline
    /// seed), then `FLEETD_AGENT_KEY_FILE`, then a key generated under
    /// `<state_dir>/keys` on first run.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let endpoint = require(&lookup, "FLEETD_ENDPOINT")?;
        let device_id = require(&lookup, "FLEETD_DEVICE_ID")?;
        let auth_token = require(&lookup, "FLEETD_AUTH_TOKEN")?;

        let state_dir = get(&lookup, "FLEETD_STATE_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_STATE_DIR), PathBuf::from);
        let seq_path = get(&lookup, "FLEETD_SEQ_PATH").map(PathBuf::from);
        let kernel_socket = get(&lookup, "FLEETD_IPC_SOCKET")
            .map_or_else(|| PathBuf::from(DEFAULT_IPC_SOCKET), PathBuf::from);

        let agent_key = match (
            get(&lookup, "FLEETD_AGENT_KEY_B64"),
            get(&lookup, "FLEETD_AGENT_KEY_FILE"),
        ) {
            (Some(seed), _) => KeySource::Inline(seed),
            (None, Some(path)) => KeySource::File(PathBuf::from(path)),
            (None, None) => KeySource::Platform {
                dir: state_dir.join("keys"),
                label: "agent".to_string(),
            },
        };

        let backend_pubkey = optional_key(&lookup, "FLEETD_BACKEND_PUBKEY_B64")?;
        let kernel_pubkey = optional_key(&lookup, "FLEETD_KERNEL_PUBKEY_B64")?;

        let allow_exec_fallback = flag(&lookup, "FLEETD_ALLOW_EXEC_FALLBACK");
        let kernelsvc_binary = get(&lookup, "FLEETD_KERNELSVC_BIN")
            .map_or_else(|| PathBuf::from(DEFAULT_KERNELSVC_BIN), PathBuf::from);

        Ok(Self {
            endpoint,
            device_id,
            auth_token,
            state_dir,
            seq_path,
            kernel_socket,
            agent_key,
            backend_pubkey,
            kernel_pubkey,
            allow_exec_fallback,
            kernelsvc_binary,
        })
    }

    /// Path of the durable sequence counter file.
    #[must_use]
    pub fn sequence_path(&self) -> PathBuf {
        self.seq_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("seq"))
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("endpoint", &self.endpoint)
            .field("device_id", &self.device_id)
            .field("auth_token", &"<redacted>")
            .field("state_dir", &self.state_dir)
            .field("seq_path", &self.seq_path)
            .field("kernel_socket", &self.kernel_socket)
            .field("agent_key", &self.agent_key)
            .field("backend_pubkey_set", &self.backend_pubkey.is_some())
            .field("kernel_pubkey_set", &self.kernel_pubkey.is_some())
            .field("allow_exec_fallback", &self.allow_exec_fallback)
            .field("kernelsvc_binary", &self.kernelsvc_binary)
            .finish()
    }
}

fn get(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Option<String> {
    lookup(name).filter(|value| !value.trim().is_empty())
}

fn require(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    get(lookup, name).ok_or(ConfigError::MissingVar { name })
}

/// Boolean gates accept exactly `"1"`. Anything else, including `"true"`,
/// leaves the gate closed.
fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> bool {
    lookup(name).as_deref() == Some("1")
}

fn optional_key(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<VerifyingKey>, ConfigError> {
    get(lookup, name)
        .map(|value| {
            crypto::parse_verifying_key_b64(&value)
                .map_err(|err| ConfigError::InvalidVar { name, reason: err.to_string() })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use fleetd_core::crypto::Signer;

    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        }
    }

    const BASE: &[(&str, &str)] = &[
        ("FLEETD_ENDPOINT", "unix:///run/fleetd/backend.sock"),
        ("FLEETD_DEVICE_ID", "dev-42"),
        ("FLEETD_AUTH_TOKEN", "tok-secret"),
    ];

    #[test]
    fn minimal_environment_fills_defaults() {
        let config = AgentConfig::from_lookup(lookup_from(BASE)).unwrap();
        assert_eq!(config.endpoint, "unix:///run/fleetd/backend.sock");
        assert_eq!(config.device_id, "dev-42");
        assert_eq!(config.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(config.kernel_socket, PathBuf::from(DEFAULT_IPC_SOCKET));
        assert_eq!(config.kernelsvc_binary, PathBuf::from(DEFAULT_KERNELSVC_BIN));
        assert!(!config.allow_exec_fallback);
        assert!(config.backend_pubkey.is_none());
        assert_eq!(
            config.sequence_path(),
            PathBuf::from(DEFAULT_STATE_DIR).join("seq")
        );
        match config.agent_key {
            KeySource::Platform { ref dir, ref label } => {
                assert_eq!(dir, &PathBuf::from(DEFAULT_STATE_DIR).join("keys"));
                assert_eq!(label, "agent");
            }
            ref other => panic!("expected platform key source, got {other:?}"),
        }
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let err = AgentConfig::from_lookup(lookup_from(&[
            ("FLEETD_DEVICE_ID", "dev-42"),
            ("FLEETD_AUTH_TOKEN", "tok"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar { name: "FLEETD_ENDPOINT" }
        ));
    }

    #[test]
    fn empty_value_counts_as_unset() {
        let err = AgentConfig::from_lookup(lookup_from(&[
            ("FLEETD_ENDPOINT", "unix:///tmp/b.sock"),
            ("FLEETD_DEVICE_ID", "   "),
            ("FLEETD_AUTH_TOKEN", "tok"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { name: "FLEETD_DEVICE_ID" }));
    }

    #[test]
    fn seq_path_override_wins_over_state_dir() {
        let mut vars = BASE.to_vec();
        vars.push(("FLEETD_SEQ_PATH", "/var/lib/fleetd-alt/counter"));
        let config = AgentConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(
            config.sequence_path(),
            PathBuf::from("/var/lib/fleetd-alt/counter")
        );
    }

    #[test]
    fn inline_key_takes_precedence_over_file() {
        let mut vars = BASE.to_vec();
        vars.push(("FLEETD_AGENT_KEY_B64", "c2VlZA=="));
        vars.push(("FLEETD_AGENT_KEY_FILE", "/etc/fleetd/agent.key"));
        let config = AgentConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert!(matches!(config.agent_key, KeySource::Inline(_)));

        let mut vars = BASE.to_vec();
        vars.push(("FLEETD_AGENT_KEY_FILE", "/etc/fleetd/agent.key"));
        let config = AgentConfig::from_lookup(lookup_from(&vars)).unwrap();
        match config.agent_key {
            KeySource::File(ref path) => {
                assert_eq!(path, &PathBuf::from("/etc/fleetd/agent.key"));
            }
            ref other => panic!("expected file key source, got {other:?}"),
        }
    }

    #[test]
    fn valid_backend_pubkey_parses() {
        let signer = Signer::generate();
        let b64 = signer.verifying_key_b64();
        let mut vars = BASE.to_vec();
        vars.push(("FLEETD_BACKEND_PUBKEY_B64", b64.as_str()));
        let config = AgentConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.backend_pubkey, Some(signer.verifying_key()));
    }

    #[test]
    fn malformed_pubkey_is_rejected_with_variable_name() {
        let mut vars = BASE.to_vec();
        vars.push(("FLEETD_KERNEL_PUBKEY_B64", "not-base64!"));
        let err = AgentConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar { name: "FLEETD_KERNEL_PUBKEY_B64", .. }
        ));
    }

    #[test]
    fn fallback_flag_accepts_only_literal_one() {
        for (value, expected) in [("1", true), ("true", false), ("0", false), ("yes", false)] {
            let mut vars = BASE.to_vec();
            vars.push(("FLEETD_ALLOW_EXEC_FALLBACK", value));
            let config = AgentConfig::from_lookup(lookup_from(&vars)).unwrap();
            assert_eq!(config.allow_exec_fallback, expected, "value {value:?}");
        }
    }

    #[test]
    fn debug_output_redacts_the_auth_token() {
        let config = AgentConfig::from_lookup(lookup_from(BASE)).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("tok-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}

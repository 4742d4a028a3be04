//! Typed envelope bodies.
//!
//! Field sets here are wire contract; names match the protocol exactly.
//! Optional fields are `Option` and serialize as explicit `null` (the
//! envelope layer guarantees presence). Inbound bodies tolerate omitted
//! optionals with `#[serde(default)]` so a newer backend can drop a
//! field to `null`-or-absent without breaking older agents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `status` on a fresh [`CommandAckBody`].
pub const ACK_STATUS_RECEIVED: &str = "received";

/// `status` on a granted [`AuthAckBody`].
pub const AUTH_ACK_STATUS_OK: &str = "ok";

/// `execution_state` for a command that ran to completion.
pub const EXECUTION_COMPLETED: &str = "completed";

/// `execution_state` for a command that failed or was rejected.
pub const EXECUTION_FAILED: &str = "failed";

/// Full telemetry scope.
pub const TELEMETRY_SCOPE_STANDARD: &str = "standard";

/// Reduced scope reported while quarantined.
pub const TELEMETRY_SCOPE_QUARANTINE: &str = "quarantine_basic";

/// `phase` reported when the agent has seen an update announcement.
pub const UPDATE_PHASE_ANNOUNCED: &str = "announced";

/// Static facts about the agent installation, sent with `AUTH`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent build version.
    pub agent_version: String,
    /// Platform attestation measurement, when available.
    pub attestation_hash: Option<String>,
    /// Hash of the hardware identity.
    pub hwid_hash: String,
    /// OS build string.
    pub os_build: String,
}

/// Credentials presented with `AUTH`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthCredentials {
    /// Enrollment token.
    pub jwt: String,
    /// Fresh random nonce, hex-encoded.
    pub nonce: String,
}

/// `AUTH` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthBody {
    /// Installation facts.
    pub agent_info: AgentInfo,
    /// Token and nonce.
    pub auth: AuthCredentials,
}

impl AuthBody {
    /// Builds an auth body with a fresh 16-byte random nonce.
    #[must_use]
    pub fn new(jwt: impl Into<String>, agent_info: AgentInfo) -> Self {
        Self {
            agent_info,
            auth: AuthCredentials {
                jwt: jwt.into(),
                nonce: hex::encode(rand::random::<[u8; 16]>()),
            },
        }
    }
}

/// `AUTH_ACK` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthAckBody {
    /// Heartbeat cadence granted by the backend, in seconds.
    pub heartbeat_interval_seconds: u64,
    /// Policy hash the device must pin.
    pub policy_hash: String,
    /// Granted session id.
    pub session_id: String,
    /// `"ok"` on success.
    pub status: String,
    /// Telemetry cadence granted by the backend, in seconds.
    pub telemetry_interval_seconds: u64,
}

/// `HEARTBEAT` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatBody {
    /// `"ok"` unless the agent is limping.
    pub error_state: String,
    /// Always `"alive"`.
    pub status: String,
    /// Seconds since agent start.
    pub uptime_seconds: u64,
}

impl HeartbeatBody {
    /// A healthy heartbeat.
    #[must_use]
    pub fn new(uptime_seconds: u64) -> Self {
        Self {
            error_state: "ok".to_string(),
            status: "alive".to_string(),
            uptime_seconds,
        }
    }

    /// Overrides the error state for degraded operation.
    #[must_use]
    pub fn with_error_state(mut self, error_state: impl Into<String>) -> Self {
        self.error_state = error_state.into();
        self
    }
}

/// Metric sample carried by `TELEMETRY`.
///
/// Values are pre-formatted strings; the backend treats them as opaque
/// display values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    /// CPU utilization.
    pub cpu: String,
    /// Disk usage.
    pub disk_usage: String,
    /// Bytes received since last sample.
    pub network_rx: String,
    /// Bytes sent since last sample.
    pub network_tx: String,
    /// Memory utilization.
    pub ram: String,
}

impl Default for TelemetryMetrics {
    /// All-zero metrics; what an agent reports before a sampler is wired.
    fn default() -> Self {
        Self {
            cpu: "0".to_string(),
            disk_usage: "0".to_string(),
            network_rx: "0".to_string(),
            network_tx: "0".to_string(),
            ram: "0".to_string(),
        }
    }
}

/// `TELEMETRY` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBody {
    /// The sampled metrics.
    pub metrics: TelemetryMetrics,
    /// [`TELEMETRY_SCOPE_STANDARD`] or [`TELEMETRY_SCOPE_QUARANTINE`].
    pub telemetry_scope: String,
    /// Sample time, wire format.
    pub timestamp: String,
}

impl TelemetryBody {
    /// Wraps a sample taken now.
    #[must_use]
    pub fn new(metrics: TelemetryMetrics, telemetry_scope: impl Into<String>) -> Self {
        Self {
            metrics,
            telemetry_scope: telemetry_scope.into(),
            timestamp: super::now_timestamp(),
        }
    }
}

/// `COMMAND_DELIVERY` body (backend to agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDeliveryBody {
    /// Backend-assigned command id.
    pub command_id: String,
    /// Method name; kernel opcodes and agent-local methods share this
    /// namespace.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Option<Value>,
    /// Policy hash the command was issued under.
    #[serde(default)]
    pub policy_hash: Option<String>,
    /// Backend trace id for correlation.
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// `COMMAND_ACK` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAckBody {
    /// Command being acknowledged.
    pub command_id: String,
    /// Always [`ACK_STATUS_RECEIVED`].
    pub status: String,
    /// Trace id copied from the delivery.
    pub trace_id: Option<String>,
}

impl CommandAckBody {
    /// Receipt for a just-delivered command.
    #[must_use]
    pub fn for_delivery(delivery: &CommandDeliveryBody) -> Self {
        Self {
            command_id: delivery.command_id.clone(),
            status: ACK_STATUS_RECEIVED.to_string(),
            trace_id: delivery.trace_id.clone(),
        }
    }
}

/// `COMMAND_RESULT` body: exactly one per command, terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResultBody {
    /// Command this result closes out.
    pub command_id: String,
    /// Zero on success, protocol error code otherwise.
    pub error_code: i64,
    /// Diagnostic for failures.
    pub error_message: Option<String>,
    /// [`EXECUTION_COMPLETED`] or [`EXECUTION_FAILED`].
    pub execution_state: String,
    /// Free-text execution notes (assurance level, kernel exec id).
    pub notes: Option<String>,
    /// Primary result payload.
    pub result: Option<String>,
    /// Captured stderr, when the method ran a process.
    pub stderr: Option<String>,
    /// Captured stdout, when the method ran a process.
    pub stdout: Option<String>,
    /// Trace id copied from the delivery.
    pub trace_id: Option<String>,
}

impl CommandResultBody {
    /// A successful terminal result.
    #[must_use]
    pub fn completed(delivery: &CommandDeliveryBody, result: Option<String>) -> Self {
        Self {
            command_id: delivery.command_id.clone(),
            error_code: 0,
            error_message: None,
            execution_state: EXECUTION_COMPLETED.to_string(),
            notes: None,
            result,
            stderr: None,
            stdout: None,
            trace_id: delivery.trace_id.clone(),
        }
    }

    /// A failed terminal result.
    #[must_use]
    pub fn failed(
        delivery: &CommandDeliveryBody,
        error_code: i64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            command_id: delivery.command_id.clone(),
            error_code,
            error_message: Some(error_message.into()),
            execution_state: EXECUTION_FAILED.to_string(),
            notes: None,
            result: None,
            stderr: None,
            stdout: None,
            trace_id: delivery.trace_id.clone(),
        }
    }

    /// Attaches execution notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Attaches captured stdout.
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    /// Attaches captured stderr.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }
}

/// `UPDATE_ANNOUNCE` body (backend to agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAnnounceBody {
    /// Where to fetch the update manifest.
    pub manifest_url: String,
    /// Minimum OS build the release supports.
    #[serde(default)]
    pub min_os_build: Option<String>,
    /// Rollout policy blob, backend-defined.
    #[serde(default)]
    pub policy: Option<Value>,
    /// Release identifier.
    pub release_id: String,
    /// Expected package digest.
    pub sha256: String,
    /// Detached signature location, when published.
    #[serde(default)]
    pub signature_url: Option<String>,
    /// Human-readable version.
    pub version: String,
}

/// `UPDATE_STATUS` body (agent to backend).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatusBody {
    /// Zero unless the phase failed.
    pub error_code: i64,
    /// Diagnostic for failures.
    pub error_message: Option<String>,
    /// Lifecycle phase, e.g. [`UPDATE_PHASE_ANNOUNCED`].
    pub phase: String,
    /// Progress percentage, 0-100.
    pub progress: u64,
    /// Release the status refers to.
    pub release_id: String,
    /// Snapshot id involved in a rollback, if any.
    pub rollback_snapshot_id: Option<String>,
    /// Version string, when known.
    pub version: Option<String>,
}

impl UpdateStatusBody {
    /// Status acknowledging an announcement was received and recorded.
    #[must_use]
    pub fn announced(release_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            error_code: 0,
            error_message: None,
            phase: UPDATE_PHASE_ANNOUNCED.to_string(),
            progress: 0,
            release_id: release_id.into(),
            rollback_snapshot_id: None,
            version: Some(version.into()),
        }
    }
}

/// Quarantine directive inside `POLICY_UPDATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineDirective {
    /// Whether quarantine is being imposed or lifted.
    pub active: bool,
    /// Operator-facing reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POLICY_UPDATE` body (backend to agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdateBody {
    /// New policy hash to pin.
    pub policy_hash: String,
    /// Quarantine transition, when the backend is changing it.
    #[serde(default)]
    pub quarantine: Option<QuarantineDirective>,
}

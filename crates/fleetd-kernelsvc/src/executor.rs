//! Maps opcodes to privileged actions and seals the outcome into a
//! signed [`KernelResponse`].
//!
//! Execution order per request: resolve the opcode (unknown → 4004),
//! apply the dangerous-ops gate, parse opcode parameters, act. The gate
//! sits in front of parameter handling so a non-production host can
//! exercise the whole pipeline with any payload and zero side effects:
//! a gated opcode without the operator flag logs intent and reports a
//! `dry_run:<opcode>` success. `ping` and `lock_screen` are never gated.
//!
//! Every response, including rejections, is stamped: Ed25519 over the
//! canonical encoding of the response minus `sig` when a key is held,
//! BLAKE3 integrity fallback otherwise.

use std::path::PathBuf;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, warn};

use fleetd_core::crypto::{SignatureStamp, Signer};
use fleetd_core::envelope::now_timestamp;
use fleetd_core::ipc::{KernelRequest, KernelResponse, Opcode, STATUS_ERROR, STATUS_SUCCESS};
use fleetd_core::{canonical, codes};

use crate::ops::PrivilegedOps;
use crate::update::UpdateManager;

/// `stage_update` parameters.
#[derive(Debug, Deserialize)]
struct StageParams {
    package_path: PathBuf,
    #[serde(default = "default_true")]
    sandbox: bool,
}

/// `commit_update` parameters.
#[derive(Debug, Deserialize)]
struct CommitParams {
    sandbox_id: String,
}

/// `rollback_update` parameters.
#[derive(Debug, Deserialize)]
struct RollbackParams {
    snapshot_id: String,
}

/// `reboot` parameters.
#[derive(Debug, Default, Deserialize)]
struct RebootParams {
    #[serde(default)]
    delay_seconds: u64,
}

/// `shutdown` parameters.
#[derive(Debug, Default, Deserialize)]
struct ShutdownParams {
    #[serde(default)]
    force: bool,
}

fn default_true() -> bool {
    true
}

/// An opcode's outcome before sealing: the four response fields the
/// operation itself decides.
struct OpOutcome {
    status: &'static str,
    result: String,
    error_code: i64,
    error_message: String,
}

impl OpOutcome {
    fn success(result: impl Into<String>) -> Self {
        Self {
            status: STATUS_SUCCESS,
            result: result.into(),
            error_code: codes::OK,
            error_message: String::new(),
        }
    }

    fn error(result: impl Into<String>, error_code: i64, error_message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            result: result.into(),
            error_code,
            error_message: error_message.into(),
        }
    }
}

/// Executes opcodes against a [`PrivilegedOps`] implementation and an
/// [`UpdateManager`], sealing each outcome into a stamped response.
#[derive(Debug)]
pub struct OpcodeExecutor<P> {
    ops: P,
    updates: UpdateManager,
    signer: Option<Signer>,
    allow_dangerous_ops: bool,
}

impl<P: PrivilegedOps> OpcodeExecutor<P> {
    /// Executor with no signing key and the dangerous-ops gate closed.
    pub fn new(ops: P, updates: UpdateManager) -> Self {
        Self {
            ops,
            updates,
            signer: None,
            allow_dangerous_ops: false,
        }
    }

    /// Attaches the response-signing key.
    #[must_use]
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Opens or closes the dangerous-ops gate.
    #[must_use]
    pub const fn with_dangerous_ops(mut self, allow: bool) -> Self {
        self.allow_dangerous_ops = allow;
        self
    }

    /// Runs one request to completion and seals the response. Never
    /// fails: every problem becomes an error response with the
    /// appropriate code.
    pub async fn execute(&self, request: &KernelRequest) -> KernelResponse {
        let outcome = self.run(request).await;
        self.seal(&request.request_id, outcome)
    }

    async fn run(&self, request: &KernelRequest) -> OpOutcome {
        let Some(opcode) = Opcode::parse(&request.opcode) else {
            warn!(opcode = %request.opcode, request_id = %request.request_id, "unknown opcode");
            return OpOutcome::error(
                "unknown_opcode",
                codes::UNSUPPORTED_METHOD,
                "OPCODE_NOT_SUPPORTED",
            );
        };

        if opcode.is_dangerous() && !self.allow_dangerous_ops {
            info!(
                %opcode,
                request_id = %request.request_id,
                params = ?request.params,
                "dangerous op without operator opt-in; dry run"
            );
            return OpOutcome::success(format!("dry_run:{opcode}"));
        }

        match opcode {
            Opcode::Ping => ping(),
            Opcode::LockScreen => self.lock_screen().await,
            Opcode::Reboot => self.reboot(request).await,
            Opcode::Shutdown => self.shutdown(request).await,
            Opcode::Logout => self.logout().await,
            Opcode::StageUpdate => self.stage_update(request),
            Opcode::CommitUpdate => self.commit_update(request),
            Opcode::RollbackUpdate => self.rollback_update(request),
            Opcode::SelfRepair => self.self_repair(),
        }
    }

    async fn lock_screen(&self) -> OpOutcome {
        match self.ops.lock_screen().await {
            Ok(method) => OpOutcome::success(format!("locked:{}", method.as_str())),
            Err(err) => OpOutcome::error("failed", codes::LOCK_FAILED, err.to_string()),
        }
    }

    async fn reboot(&self, request: &KernelRequest) -> OpOutcome {
        let params: RebootParams = match parse_params(request) {
            Ok(params) => params,
            Err(err) => return invalid_params(codes::PRIVILEGED_ACTION_FAILED, &err),
        };
        match self.ops.reboot(params.delay_seconds).await {
            Ok(()) => OpOutcome::success("reboot_initiated"),
            Err(err) => OpOutcome::error("failed", codes::PRIVILEGED_ACTION_FAILED, err.to_string()),
        }
    }

    async fn shutdown(&self, request: &KernelRequest) -> OpOutcome {
        let params: ShutdownParams = match parse_params(request) {
            Ok(params) => params,
            Err(err) => return invalid_params(codes::PRIVILEGED_ACTION_FAILED, &err),
        };
        match self.ops.shutdown(params.force).await {
            Ok(()) => OpOutcome::success("shutdown_initiated"),
            Err(err) => OpOutcome::error("failed", codes::PRIVILEGED_ACTION_FAILED, err.to_string()),
        }
    }

    async fn logout(&self) -> OpOutcome {
        match self.ops.logout().await {
            Ok(()) => OpOutcome::success("logout_initiated"),
            Err(err) => OpOutcome::error("failed", codes::PRIVILEGED_ACTION_FAILED, err.to_string()),
        }
    }

    fn stage_update(&self, request: &KernelRequest) -> OpOutcome {
        let params: StageParams = match parse_params(request) {
            Ok(params) => params,
            Err(err) => return invalid_params(codes::UPDATE_OP_FAILED, &err),
        };
        match self.updates.stage(&params.package_path, params.sandbox) {
            Ok(outcome) => OpOutcome::success(
                json!({
                    "sandbox_id": outcome.sandbox_id,
                    "staged_path": outcome.staged_path.display().to_string(),
                })
                .to_string(),
            ),
            Err(err) => OpOutcome::error("failed", codes::UPDATE_OP_FAILED, err.to_string()),
        }
    }

    fn commit_update(&self, request: &KernelRequest) -> OpOutcome {
        let params: CommitParams = match parse_params(request) {
            Ok(params) => params,
            Err(err) => return invalid_params(codes::UPDATE_OP_FAILED, &err),
        };
        match self.updates.commit(&params.sandbox_id) {
            Ok(outcome) => OpOutcome::success(
                json!({
                    "active_path": outcome.active_path.display().to_string(),
                    "backup_path": outcome.backup_path.map(|p| p.display().to_string()),
                })
                .to_string(),
            ),
            Err(err) => OpOutcome::error("failed", codes::UPDATE_OP_FAILED, err.to_string()),
        }
    }

    fn rollback_update(&self, request: &KernelRequest) -> OpOutcome {
        let params: RollbackParams = match parse_params(request) {
            Ok(params) => params,
            Err(err) => return invalid_params(codes::UPDATE_OP_FAILED, &err),
        };
        match self.updates.rollback(&params.snapshot_id) {
            Ok(outcome) => OpOutcome::success(
                json!({
                    "active_path": outcome.active_path.display().to_string(),
                })
                .to_string(),
            ),
            Err(err) => OpOutcome::error("failed", codes::UPDATE_OP_FAILED, err.to_string()),
        }
    }

    fn self_repair(&self) -> OpOutcome {
        match self.updates.self_repair() {
            Ok(report) => OpOutcome::success(
                json!({
                    "actions_taken": report.actions_taken,
                    "missing_binaries": report.missing_binaries,
                })
                .to_string(),
            ),
            Err(err) => OpOutcome::error("failed", codes::UPDATE_OP_FAILED, err.to_string()),
        }
    }

    /// Wraps an outcome into a full response and stamps it. The signing
    /// value is flat strings and integers, so canonical encoding cannot
    /// fail on it; the compact fallback keeps the stamp well-formed if
    /// that ever changes.
    fn seal(&self, request_id: &str, outcome: OpOutcome) -> KernelResponse {
        let mut response = KernelResponse {
            request_id: request_id.to_string(),
            status: outcome.status.to_string(),
            kernel_exec_id: format!("kexec-{:08x}", rand::random::<u32>()),
            timestamp: now_timestamp(),
            result: outcome.result,
            error_code: outcome.error_code,
            error_message: outcome.error_message,
            sig: String::new(),
        };

        let signing_value = response.signing_value();
        let message = match canonical::encode_bytes(&signing_value) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "response canonicalization failed; stamping compact form");
                signing_value.to_string().into_bytes()
            }
        };
        let stamp = match &self.signer {
            Some(signer) => SignatureStamp::ed25519(signer, &message),
            None => SignatureStamp::blake3(&message),
        };
        response.sig = stamp.to_string();
        response
    }
}

/// Liveness echo. The result is the canonical JSON text the deployed
/// backend expects byte-for-byte.
fn ping() -> OpOutcome {
    let body = json!({
        "reply": "pong",
        "status": "ok",
        "ts": chrono::Utc::now().timestamp(),
    });
    OpOutcome::success(body.to_string())
}

/// Deserializes opcode parameters; an absent `params` object means all
/// defaults.
fn parse_params<T: DeserializeOwned>(request: &KernelRequest) -> Result<T, serde_json::Error> {
    let params = request
        .params
        .clone()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(params)
}

fn invalid_params(error_code: i64, err: &serde_json::Error) -> OpOutcome {
    OpOutcome::error("failed", error_code, format!("invalid params: {err}"))
}

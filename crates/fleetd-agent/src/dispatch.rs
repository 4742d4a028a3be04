//! The command gate chain.
//!
//! Every `COMMAND_DELIVERY` passes through here, in a fixed order:
//!
//! 1. quarantine gate: a quarantined device runs only the recovery
//!    allow-list
//! 2. policy gate: a command pinned to a policy hash is rejected when the
//!    device holds a different, non-empty policy hash
//! 3. method resolution: agent-local methods execute in-process, kernel
//!    opcodes go through the relay, everything else is unsupported
//!
//! The dispatcher never panics and never errors: every path, including
//! relay breakdowns, produces a terminal [`CommandResultBody`] for the
//! session to report.

use chrono::Utc;
use fleetd_core::codes;
use fleetd_core::crypto;
use fleetd_core::envelope::body::{CommandDeliveryBody, CommandResultBody};
use fleetd_core::ipc::{KernelRequest, Opcode};
use fleetd_core::state::{quarantine_allows, AgentState};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::relay::KernelRelay;

/// Applies the safety gates and routes commands to their executor.
pub struct CommandDispatcher {
    state: AgentState,
    relay: KernelRelay,
}

impl CommandDispatcher {
    /// Builds a dispatcher over the shared state and a kernel relay.
    #[must_use]
    pub const fn new(state: AgentState, relay: KernelRelay) -> Self {
        Self { state, relay }
    }

    /// Executes one delivered command to a terminal result.
    ///
    /// `message_id` is the envelope message id that carried the delivery;
    /// it is forwarded to the kernel service for audit correlation.
    pub async fn execute(
        &mut self,
        delivery: &CommandDeliveryBody,
        message_id: &str,
    ) -> CommandResultBody {
        if self.state.is_quarantined() && !quarantine_allows(&delivery.method) {
            let reason = self
                .state
                .quarantine_reason()
                .unwrap_or_else(|| "device is quarantined".to_string());
            info!(
                command_id = %delivery.command_id,
                method = %delivery.method,
                "command rejected by quarantine gate"
            );
            return CommandResultBody::failed(delivery, codes::QUARANTINED, reason)
                .with_notes("quarantine gate");
        }

        if let Some(pinned) = delivery.policy_hash.as_deref() {
            // A device that has not pinned a policy yet cannot be stale;
            // the gate only bites once the hashes can actually disagree.
            let current = self.state.policy_hash();
            if !current.is_empty()
                && !crypto::constant_time_eq(pinned.as_bytes(), current.as_bytes())
            {
                warn!(
                    command_id = %delivery.command_id,
                    method = %delivery.method,
                    "command pinned to a different policy hash"
                );
                return CommandResultBody::failed(
                    delivery,
                    codes::POLICY_MISMATCH,
                    "policy hash mismatch",
                )
                .with_notes("policy gate");
            }
        }

        if let Some(result) = self.run_agent_local(delivery) {
            return result;
        }

        match Opcode::parse(&delivery.method) {
            Some(opcode) => self.run_kernel_opcode(opcode, delivery, message_id).await,
            None => {
                info!(
                    command_id = %delivery.command_id,
                    method = %delivery.method,
                    "unsupported method"
                );
                CommandResultBody::failed(
                    delivery,
                    codes::UNSUPPORTED_METHOD,
                    "OPCODE_NOT_SUPPORTED",
                )
            }
        }
    }

    /// Methods the agent answers itself. All of them are on the quarantine
    /// allow-list, so a quarantined device keeps its recovery path.
    fn run_agent_local(&self, delivery: &CommandDeliveryBody) -> Option<CommandResultBody> {
        match delivery.method.as_str() {
            "time_sync" => Some(self.time_sync(delivery)),
            "collect_diagnostics" => Some(self.collect_diagnostics(delivery)),
            "fetch_revocations" => Some(CommandResultBody::completed(
                delivery,
                Some("revocations_refreshed".to_string()),
            )),
            "reauth" => {
                self.state.request_reauth();
                info!(command_id = %delivery.command_id, "re-authentication requested");
                Some(CommandResultBody::completed(
                    delivery,
                    Some("reauth_scheduled".to_string()),
                ))
            }
            _ => None,
        }
    }

    /// Reports local clock skew against the backend's epoch, when the
    /// command carries one.
    fn time_sync(&self, delivery: &CommandDeliveryBody) -> CommandResultBody {
        let local = Utc::now().timestamp();
        let skew = delivery
            .params
            .as_ref()
            .and_then(|params| params.get("server_epoch"))
            .and_then(Value::as_i64)
            .map(|server| (local - server).abs());
        if let Some(skew) = skew {
            info!(skew_seconds = skew, "time sync checked");
        }
        let report = json!({ "local_epoch": local, "skew_seconds": skew });
        CommandResultBody::completed(delivery, Some(report.to_string()))
    }

    fn collect_diagnostics(&self, delivery: &CommandDeliveryBody) -> CommandResultBody {
        let report = serde_json::to_string(&self.state.snapshot()).unwrap_or_else(|err| {
            warn!(error = %err, "diagnostics snapshot failed to serialize");
            "{}".to_string()
        });
        CommandResultBody::completed(delivery, Some(report)).with_notes("state snapshot")
    }

    async fn run_kernel_opcode(
        &mut self,
        opcode: Opcode,
        delivery: &CommandDeliveryBody,
        message_id: &str,
    ) -> CommandResultBody {
        let mut request = KernelRequest::new(opcode, delivery.command_id.clone())
            .with_command_message_id(message_id);
        if let Some(params) = &delivery.params {
            request = request.with_params(params.clone());
        }
        if let Some(policy_hash) = &delivery.policy_hash {
            request = request.with_policy_hash(policy_hash.clone());
        }
        info!(
            command_id = %delivery.command_id,
            opcode = %opcode,
            dangerous = opcode.is_dangerous(),
            "relaying command to kernel service"
        );

        match self.relay.execute(&request).await {
            Ok(response) => {
                let notes = format!("kernel_exec_id={}", response.kernel_exec_id);
                if response.is_success() {
                    CommandResultBody::completed(delivery, Some(response.result))
                        .with_notes(notes)
                } else {
                    let mut body = CommandResultBody::failed(
                        delivery,
                        response.error_code,
                        response.error_message,
                    );
                    body.result = Some(response.result);
                    body.with_notes(notes)
                }
            }
            Err(err) => {
                warn!(
                    command_id = %delivery.command_id,
                    error = %err,
                    "kernel relay failed"
                );
                CommandResultBody::failed(delivery, codes::IPC_FAILURE, err.to_string())
                    .with_notes("ipc_failure")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleetd_core::canonical;
    use fleetd_core::crypto::SignatureStamp;
    use fleetd_core::envelope::body::{EXECUTION_COMPLETED, EXECUTION_FAILED};
    use fleetd_core::envelope::now_timestamp;
    use fleetd_core::ipc::{
        self, JsonFrameReader, KernelResponse, MAX_FRAME_LEN, STATUS_ERROR, STATUS_SUCCESS,
    };
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    use super::*;
    use crate::relay::RelayConfig;

    fn delivery(method: &str) -> CommandDeliveryBody {
        CommandDeliveryBody {
            command_id: "cmd-1".to_string(),
            method: method.to_string(),
            params: None,
            policy_hash: None,
            trace_id: Some("trace-1".to_string()),
        }
    }

    /// Relay pointed at a socket that does not exist; any kernel opcode
    /// reaching it fails fast.
    fn dead_relay() -> KernelRelay {
        KernelRelay::new(
            RelayConfig::new("/nonexistent/fleetd-test.sock")
                .with_connect_attempts(1)
                .with_connect_backoff(Duration::from_millis(1)),
        )
    }

    fn stamped(mut response: KernelResponse) -> String {
        let message = canonical::encode(&response.signing_value()).unwrap();
        response.sig = SignatureStamp::blake3(message.as_bytes()).to_string();
        serde_json::to_string(&response).unwrap()
    }

    /// One-connection mock kernel; returns the request it served.
    fn spawn_mock_kernel(
        listener: UnixListener,
        status: &'static str,
        result: &'static str,
        error_code: i64,
        error_message: &'static str,
    ) -> tokio::task::JoinHandle<KernelRequest> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let text = {
                let mut frames = JsonFrameReader::new(&mut stream, MAX_FRAME_LEN);
                frames.next_frame().await.unwrap().unwrap()
            };
            let request: KernelRequest = serde_json::from_str(&text).unwrap();
            let frame = stamped(KernelResponse {
                request_id: request.request_id.clone(),
                status: status.to_string(),
                kernel_exec_id: "kexec-0000beef".to_string(),
                timestamp: now_timestamp(),
                result: result.to_string(),
                error_code,
                error_message: error_message.to_string(),
                sig: String::new(),
            });
            ipc::write_frame(&mut stream, &frame).await.unwrap();
            request
        })
    }

    #[tokio::test]
    async fn quarantined_device_rejects_privileged_methods() {
        let state = AgentState::new("dev-1");
        state.set_quarantine(true, Some("policy violation".to_string()));
        let mut dispatcher = CommandDispatcher::new(state, dead_relay());

        let result = dispatcher.execute(&delivery("reboot"), "msg-1").await;
        assert_eq!(result.error_code, codes::QUARANTINED);
        assert_eq!(result.execution_state, EXECUTION_FAILED);
        assert_eq!(result.error_message.as_deref(), Some("policy violation"));
        assert_eq!(result.notes.as_deref(), Some("quarantine gate"));
        assert_eq!(result.trace_id.as_deref(), Some("trace-1"));
    }

    #[tokio::test]
    async fn quarantined_device_still_answers_the_allow_list() {
        let state = AgentState::new("dev-1");
        state.set_quarantine(true, None);
        let mut dispatcher = CommandDispatcher::new(state, dead_relay());

        let result = dispatcher
            .execute(&delivery("collect_diagnostics"), "msg-1")
            .await;
        assert_eq!(result.execution_state, EXECUTION_COMPLETED);
        assert_eq!(result.error_code, codes::OK);
        let report: Value = serde_json::from_str(result.result.as_deref().unwrap()).unwrap();
        assert_eq!(report["device_id"], "dev-1");
        assert_eq!(report["quarantined"], true);
    }

    #[tokio::test]
    async fn pinned_policy_hash_must_match() {
        let state = AgentState::new("dev-1");
        state.set_policy_hash("sha256:current");
        let mut dispatcher = CommandDispatcher::new(state, dead_relay());

        let mut pinned = delivery("time_sync");
        pinned.policy_hash = Some("sha256:stale".to_string());
        let result = dispatcher.execute(&pinned, "msg-1").await;
        assert_eq!(result.error_code, codes::POLICY_MISMATCH);
        assert_eq!(result.notes.as_deref(), Some("policy gate"));

        let mut matching = delivery("time_sync");
        matching.policy_hash = Some("sha256:current".to_string());
        let result = dispatcher.execute(&matching, "msg-2").await;
        assert_eq!(result.execution_state, EXECUTION_COMPLETED);
    }

    #[tokio::test]
    async fn unpinned_device_accepts_hashed_commands() {
        // Before the first POLICY_UPDATE the device has nothing to compare
        // against, so a pinned command is not considered stale.
        let mut dispatcher = CommandDispatcher::new(AgentState::new("dev-1"), dead_relay());
        let mut pinned = delivery("collect_diagnostics");
        pinned.policy_hash = Some("sha256:anything".to_string());
        let result = dispatcher.execute(&pinned, "msg-1").await;
        assert_eq!(result.execution_state, EXECUTION_COMPLETED);
    }

    #[tokio::test]
    async fn unknown_method_is_unsupported() {
        let mut dispatcher = CommandDispatcher::new(AgentState::new("dev-1"), dead_relay());
        let result = dispatcher.execute(&delivery("format_disk"), "msg-1").await;
        assert_eq!(result.error_code, codes::UNSUPPORTED_METHOD);
        assert_eq!(result.error_message.as_deref(), Some("OPCODE_NOT_SUPPORTED"));
        assert_eq!(result.execution_state, EXECUTION_FAILED);
    }

    #[tokio::test]
    async fn time_sync_reports_skew_against_server_epoch() {
        let mut dispatcher = CommandDispatcher::new(AgentState::new("dev-1"), dead_relay());
        let mut sync = delivery("time_sync");
        sync.params = Some(json!({ "server_epoch": Utc::now().timestamp() - 7 }));
        let result = dispatcher.execute(&sync, "msg-1").await;
        assert_eq!(result.execution_state, EXECUTION_COMPLETED);
        let report: Value = serde_json::from_str(result.result.as_deref().unwrap()).unwrap();
        let skew = report["skew_seconds"].as_i64().unwrap();
        assert!((7..=8).contains(&skew), "skew {skew}");
    }

    #[tokio::test]
    async fn reauth_flags_the_session_for_cycling() {
        let state = AgentState::new("dev-1");
        let mut dispatcher = CommandDispatcher::new(state.clone(), dead_relay());
        let result = dispatcher.execute(&delivery("reauth"), "msg-1").await;
        assert_eq!(result.execution_state, EXECUTION_COMPLETED);
        assert!(state.take_reauth_request());
    }

    #[tokio::test]
    async fn unreachable_kernel_maps_to_ipc_failure() {
        let mut dispatcher = CommandDispatcher::new(AgentState::new("dev-1"), dead_relay());
        let result = dispatcher.execute(&delivery("ping"), "msg-1").await;
        assert_eq!(result.error_code, codes::IPC_FAILURE);
        assert_eq!(result.notes.as_deref(), Some("ipc_failure"));
        assert_eq!(result.execution_state, EXECUTION_FAILED);
    }

    #[tokio::test]
    async fn kernel_success_becomes_a_completed_result() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = spawn_mock_kernel(listener, STATUS_SUCCESS, "workstation_locked", 0, "");

        let state = AgentState::new("dev-1");
        state.set_policy_hash("sha256:current");
        let relay = KernelRelay::new(
            RelayConfig::new(&socket)
                .with_connect_attempts(1)
                .with_io_timeout(Duration::from_millis(500)),
        );
        let mut dispatcher = CommandDispatcher::new(state, relay);

        let mut lock = delivery("lock_screen");
        lock.policy_hash = Some("sha256:current".to_string());
        lock.params = Some(json!({ "operator": "helpdesk" }));
        let result = dispatcher.execute(&lock, "msg-77").await;

        assert_eq!(result.execution_state, EXECUTION_COMPLETED);
        assert_eq!(result.result.as_deref(), Some("workstation_locked"));
        assert!(result.notes.as_deref().unwrap().contains("kexec-0000beef"));

        // The relayed request carries full audit context.
        let request = server.await.unwrap();
        assert_eq!(request.opcode, "lock_screen");
        assert_eq!(request.request_id, "cmd-1");
        assert_eq!(request.policy_hash.as_deref(), Some("sha256:current"));
        assert_eq!(request.command_message_id.as_deref(), Some("msg-77"));
        assert_eq!(request.params.unwrap()["operator"], "helpdesk");
    }

    #[tokio::test]
    async fn kernel_error_code_passes_through() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = spawn_mock_kernel(
            listener,
            STATUS_ERROR,
            "lock_failed",
            codes::LOCK_FAILED,
            "no interactive session",
        );

        let relay = KernelRelay::new(
            RelayConfig::new(&socket)
                .with_connect_attempts(1)
                .with_io_timeout(Duration::from_millis(500)),
        );
        let mut dispatcher = CommandDispatcher::new(AgentState::new("dev-1"), relay);

        let result = dispatcher.execute(&delivery("lock_screen"), "msg-1").await;
        assert_eq!(result.execution_state, EXECUTION_FAILED);
        assert_eq!(result.error_code, codes::LOCK_FAILED);
        assert_eq!(result.error_message.as_deref(), Some("no interactive session"));
        assert_eq!(result.result.as_deref(), Some("lock_failed"));
        server.await.unwrap();
    }
}

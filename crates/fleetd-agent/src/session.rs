//! The backend session.
//!
//! One [`Session`] covers one connection: it sends `AUTH`, waits for the
//! grant, then runs the event loop, interleaving inbound envelopes with
//! the heartbeat and telemetry cadences granted in `AUTH_ACK`.
//!
//! Inbound ordering guarantees:
//!
//! - a frame that fails verification is dropped whole; it never touches
//!   session state or replay floors
//! - every command is acknowledged with `COMMAND_ACK` before execution
//!   starts, and closed with exactly one `COMMAND_RESULT`
//!
//! `run` returning `Ok(())` means the connection ended in an orderly way
//! (backend close or a requested re-auth cycle); the caller decides
//! whether to reconnect.

use std::time::Duration;

use fleetd_core::envelope::body::{
    AgentInfo, AuthAckBody, AuthBody, CommandAckBody, CommandDeliveryBody, HeartbeatBody,
    PolicyUpdateBody, TelemetryBody, UpdateAnnounceBody, UpdateStatusBody, AUTH_ACK_STATUS_OK,
    TELEMETRY_SCOPE_QUARANTINE, TELEMETRY_SCOPE_STANDARD,
};
use fleetd_core::envelope::{
    Envelope, EnvelopeBuilder, EnvelopeError, EnvelopeVerifier, MessageKind,
};
use fleetd_core::state::AgentState;
use serde::Serialize;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::dispatch::CommandDispatcher;
use crate::telemetry::{StaticTelemetrySource, TelemetrySource};
use crate::transport::{BackendTransport, TransportError};

/// How long the agent waits for `AUTH_ACK` before abandoning the
/// connection.
const AUTH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Session failures. Orderly closes are not errors; see [`Session::run`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An outbound envelope could not be built or serialized.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The backend closed the connection before granting a session.
    #[error("backend closed the connection before granting a session")]
    ClosedBeforeAuth,

    /// The backend never answered `AUTH`.
    #[error("backend did not answer AUTH within {timeout_secs}s")]
    AuthTimeout {
        /// The enforced deadline.
        timeout_secs: u64,
    },

    /// The backend answered `AUTH` with a non-ok status.
    #[error("backend rejected AUTH with status {status:?}")]
    AuthRejected {
        /// The status the backend returned.
        status: String,
    },
}

/// Identity facts and cadences for one session.
///
/// The interval fields are starting values; `AUTH_ACK` replaces them with
/// the backend's grant.
#[derive(Clone)]
pub struct SessionConfig {
    /// Enrollment token presented in `AUTH`.
    pub auth_token: String,
    /// Installation facts presented in `AUTH`.
    pub agent_info: AgentInfo,
    /// Heartbeat cadence until the backend grants one.
    pub heartbeat_interval: Duration,
    /// Telemetry cadence until the backend grants one.
    pub telemetry_interval: Duration,
}

impl SessionConfig {
    /// Defaults: 30s heartbeats, 60s telemetry.
    pub fn new(auth_token: impl Into<String>, agent_info: AgentInfo) -> Self {
        Self {
            auth_token: auth_token.into(),
            agent_info,
            heartbeat_interval: Duration::from_secs(30),
            telemetry_interval: Duration::from_secs(60),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("auth_token", &"<redacted>")
            .field("agent_info", &self.agent_info)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("telemetry_interval", &self.telemetry_interval)
            .finish()
    }
}

/// One backend connection, from `AUTH` to close.
pub struct Session<T> {
    transport: T,
    builder: EnvelopeBuilder,
    dispatcher: CommandDispatcher,
    state: AgentState,
    verifier: Option<EnvelopeVerifier>,
    telemetry: Box<dyn TelemetrySource>,
    config: SessionConfig,
    warned_unverified: bool,
}

impl<T: BackendTransport> Session<T> {
    /// Builds a session. Inbound verification and telemetry sourcing are
    /// attached with [`Session::with_verifier`] and
    /// [`Session::with_telemetry_source`].
    pub fn new(
        transport: T,
        builder: EnvelopeBuilder,
        dispatcher: CommandDispatcher,
        state: AgentState,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            builder,
            dispatcher,
            state,
            verifier: None,
            telemetry: Box::new(StaticTelemetrySource::new()),
            config,
            warned_unverified: false,
        }
    }

    /// Attaches an inbound envelope verifier. Without one, inbound frames
    /// are parsed but not authenticated.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Option<EnvelopeVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Replaces the telemetry source.
    #[must_use]
    pub fn with_telemetry_source(mut self, source: Box<dyn TelemetrySource>) -> Self {
        self.telemetry = source;
        self
    }

    /// Runs the session to completion.
    ///
    /// `Ok(())` means the connection ended in an orderly way: the backend
    /// closed it, or a `reauth` command asked for a fresh session. Session
    /// identity is cleared on every exit path.
    ///
    /// # Errors
    ///
    /// Transport breakdowns, envelope build failures, and `AUTH`
    /// rejection or timeout.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let outcome = self.drive().await;
        self.builder.set_session(None);
        self.state.clear_session();
        outcome
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        self.authenticate().await?;
        self.pump().await
    }

    async fn authenticate(&mut self) -> Result<(), SessionError> {
        let auth = AuthBody::new(&self.config.auth_token, self.config.agent_info.clone());
        self.send(MessageKind::Auth, &auth).await?;
        info!("AUTH sent; awaiting session grant");

        let deadline = Instant::now() + AUTH_ACK_TIMEOUT;
        let granted = loop {
            let frame = tokio::time::timeout_at(deadline, self.transport.recv())
                .await
                .map_err(|_| SessionError::AuthTimeout {
                    timeout_secs: AUTH_ACK_TIMEOUT.as_secs(),
                })??;
            let Some(text) = frame else {
                return Err(SessionError::ClosedBeforeAuth);
            };
            let Some(envelope) = self.decode(&text) else {
                continue;
            };
            if envelope.kind == MessageKind::AuthAck {
                break envelope;
            }
            debug!(kind = %envelope.kind, "ignoring pre-session envelope");
        };

        let ack: AuthAckBody = granted.body_as()?;
        if ack.status != AUTH_ACK_STATUS_OK {
            return Err(SessionError::AuthRejected { status: ack.status });
        }

        self.builder.set_session(Some(ack.session_id.clone()));
        self.state.set_session_id(&ack.session_id);
        self.state.set_policy_hash(&ack.policy_hash);
        // A zero-second grant would make tokio's interval panic; clamp.
        self.config.heartbeat_interval =
            Duration::from_secs(ack.heartbeat_interval_seconds.max(1));
        self.config.telemetry_interval =
            Duration::from_secs(ack.telemetry_interval_seconds.max(1));
        info!(
            session_id = %ack.session_id,
            policy_hash = %ack.policy_hash,
            heartbeat_secs = ack.heartbeat_interval_seconds,
            telemetry_secs = ack.telemetry_interval_seconds,
            "session established"
        );
        Ok(())
    }

    async fn pump(&mut self) -> Result<(), SessionError> {
        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut telemetry = interval_at(
            Instant::now() + self.config.telemetry_interval,
            self.config.telemetry_interval,
        );

        loop {
            tokio::select! {
                frame = self.transport.recv() => match frame? {
                    Some(text) => {
                        self.handle_frame(&text).await?;
                        if self.state.take_reauth_request() {
                            info!("re-authentication requested; cycling session");
                            return Ok(());
                        }
                    }
                    None => {
                        info!("backend closed the connection");
                        return Ok(());
                    }
                },
                _ = heartbeat.tick() => self.send_heartbeat().await?,
                _ = telemetry.tick() => self.send_telemetry().await?,
            }
        }
    }

    /// Parses (and, when a backend key is pinned, verifies) one inbound
    /// frame. A rejected frame is dropped whole: no state change, no
    /// replay-floor movement.
    fn decode(&mut self, text: &str) -> Option<Envelope> {
        let outcome = match &self.verifier {
            Some(verifier) => verifier.verify_text(text),
            None => {
                if !self.warned_unverified {
                    warn!("no backend public key configured; accepting inbound envelopes unverified");
                    self.warned_unverified = true;
                }
                Envelope::parse(text)
            }
        };
        match outcome {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(error = %err, "dropping inbound envelope");
                None
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) -> Result<(), SessionError> {
        let Some(envelope) = self.decode(text) else {
            return Ok(());
        };
        match envelope.kind {
            MessageKind::CommandDelivery => self.handle_command(&envelope).await?,
            MessageKind::PolicyUpdate => self.handle_policy_update(&envelope),
            MessageKind::UpdateAnnounce => self.handle_update_announce(&envelope).await?,
            MessageKind::AuthAck => debug!("duplicate AUTH_ACK ignored"),
            kind => debug!(kind = %kind, "ignoring unexpected envelope kind"),
        }
        Ok(())
    }

    /// ACK first, execute second, report exactly one terminal result.
    async fn handle_command(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        let delivery: CommandDeliveryBody = match envelope.body_as() {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(
                    message_id = %envelope.message_id,
                    error = %err,
                    "command delivery body malformed; dropping"
                );
                return Ok(());
            }
        };
        info!(
            command_id = %delivery.command_id,
            method = %delivery.method,
            "command received"
        );
        self.send(
            MessageKind::CommandAck,
            &CommandAckBody::for_delivery(&delivery),
        )
        .await?;

        let result = self.dispatcher.execute(&delivery, &envelope.message_id).await;
        info!(
            command_id = %delivery.command_id,
            execution_state = %result.execution_state,
            error_code = result.error_code,
            "command finished"
        );
        self.send(MessageKind::CommandResult, &result).await
    }

    fn handle_policy_update(&mut self, envelope: &Envelope) {
        let update: PolicyUpdateBody = match envelope.body_as() {
            Ok(update) => update,
            Err(err) => {
                warn!(
                    message_id = %envelope.message_id,
                    error = %err,
                    "policy update body malformed; dropping"
                );
                return;
            }
        };
        info!(policy_hash = %update.policy_hash, "policy hash pinned");
        self.state.set_policy_hash(&update.policy_hash);
        if let Some(directive) = update.quarantine {
            if directive.active {
                warn!(
                    reason = directive.reason.as_deref().unwrap_or("unspecified"),
                    "device quarantined by backend"
                );
            } else {
                info!("quarantine lifted by backend");
            }
            self.state.set_quarantine(directive.active, directive.reason);
        }
    }

    async fn handle_update_announce(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        let announce: UpdateAnnounceBody = match envelope.body_as() {
            Ok(announce) => announce,
            Err(err) => {
                warn!(
                    message_id = %envelope.message_id,
                    error = %err,
                    "update announcement body malformed; dropping"
                );
                return Ok(());
            }
        };
        info!(
            release_id = %announce.release_id,
            version = %announce.version,
            "update announced"
        );
        self.state.set_last_release_id(&announce.release_id);
        let status = UpdateStatusBody::announced(&announce.release_id, &announce.version);
        self.send(MessageKind::UpdateStatus, &status).await
    }

    async fn send_heartbeat(&mut self) -> Result<(), SessionError> {
        let body = HeartbeatBody::new(self.state.uptime_secs());
        self.send(MessageKind::Heartbeat, &body).await
    }

    async fn send_telemetry(&mut self) -> Result<(), SessionError> {
        let scope = if self.state.is_quarantined() {
            TELEMETRY_SCOPE_QUARANTINE
        } else {
            TELEMETRY_SCOPE_STANDARD
        };
        let body = TelemetryBody::new(self.telemetry.sample(), scope);
        self.send(MessageKind::Telemetry, &body).await
    }

    async fn send<B: Serialize>(
        &mut self,
        kind: MessageKind,
        body: &B,
    ) -> Result<(), SessionError> {
        let envelope = self.builder.build(kind, body)?;
        let wire = envelope.to_wire()?;
        self.transport.send(&wire).await?;
        debug!(kind = %kind, seq = envelope.seq, "envelope sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fleetd_core::crypto::Signer;
    use fleetd_core::envelope::ROLE_CONTROLLER;
    use fleetd_core::sequence::SequenceCounter;
    use tempfile::TempDir;

    use super::*;
    use crate::relay::{KernelRelay, RelayConfig};
    use crate::transport::{duplex_pair, DuplexTransport};

    fn test_agent_info() -> AgentInfo {
        AgentInfo {
            agent_version: "0.1.0".to_string(),
            attestation_hash: None,
            hwid_hash: "hw-test".to_string(),
            os_build: "linux-test".to_string(),
        }
    }

    fn agent_session(
        transport: DuplexTransport,
        dir: &TempDir,
    ) -> (Session<DuplexTransport>, AgentState) {
        let signer = Arc::new(Signer::generate());
        let sequence = Arc::new(SequenceCounter::load(dir.path().join("agent-seq")));
        let builder = EnvelopeBuilder::new("dev-1", signer, sequence);
        let state = AgentState::new("dev-1");
        let relay = KernelRelay::new(
            RelayConfig::new("/nonexistent/kernel.sock")
                .with_connect_attempts(1)
                .with_connect_backoff(Duration::from_millis(1)),
        );
        let dispatcher = CommandDispatcher::new(state.clone(), relay);
        let config = SessionConfig::new("tok-test", test_agent_info());
        let session = Session::new(transport, builder, dispatcher, state.clone(), config);
        (session, state)
    }

    fn backend_builder(dir: &TempDir) -> EnvelopeBuilder {
        let signer = Arc::new(Signer::generate());
        let sequence = Arc::new(SequenceCounter::load(dir.path().join("backend-seq")));
        EnvelopeBuilder::new("dev-1", signer, sequence).with_role(ROLE_CONTROLLER)
    }

    fn ack_body(status: &str) -> AuthAckBody {
        AuthAckBody {
            heartbeat_interval_seconds: 30,
            policy_hash: "sha256:policy".to_string(),
            session_id: "sess-1".to_string(),
            status: status.to_string(),
            telemetry_interval_seconds: 60,
        }
    }

    #[tokio::test]
    async fn rejected_auth_fails_the_session() {
        let dir = TempDir::new().unwrap();
        let (agent_transport, mut backend) = duplex_pair(64 * 1024);
        let (mut session, _state) = agent_session(agent_transport, &dir);
        let mut builder = backend_builder(&dir);

        let (outcome, ()) = tokio::join!(session.run(), async {
            let text = backend.recv().await.unwrap().unwrap();
            let auth = Envelope::parse(&text).unwrap();
            assert_eq!(auth.kind, MessageKind::Auth);
            assert_eq!(auth.session_id, None);

            builder.set_session(Some("sess-1".to_string()));
            let ack = builder
                .build(MessageKind::AuthAck, &ack_body("denied"))
                .unwrap();
            backend.send(&ack.to_wire().unwrap()).await.unwrap();
        });

        match outcome.unwrap_err() {
            SessionError::AuthRejected { status } => assert_eq!(status, "denied"),
            other => panic!("expected auth rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_before_grant_is_reported() {
        let dir = TempDir::new().unwrap();
        let (agent_transport, mut backend) = duplex_pair(64 * 1024);
        let (mut session, _state) = agent_session(agent_transport, &dir);

        let (outcome, ()) = tokio::join!(session.run(), async {
            let _auth = backend.recv().await.unwrap().unwrap();
            drop(backend);
        });
        assert!(matches!(
            outcome.unwrap_err(),
            SessionError::ClosedBeforeAuth
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_times_out_auth() {
        let dir = TempDir::new().unwrap();
        let (agent_transport, mut backend) = duplex_pair(64 * 1024);
        let (mut session, _state) = agent_session(agent_transport, &dir);

        // Hold the peer open without ever answering.
        let peer = tokio::spawn(async move {
            let _auth = backend.recv().await;
            std::future::pending::<()>().await;
        });

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, SessionError::AuthTimeout { timeout_secs: 10 }));
        peer.abort();
    }

    #[tokio::test]
    async fn session_state_is_cleared_after_backend_close() {
        let dir = TempDir::new().unwrap();
        let (agent_transport, mut backend) = duplex_pair(64 * 1024);
        let (mut session, state) = agent_session(agent_transport, &dir);
        let mut builder = backend_builder(&dir);

        let (outcome, ()) = tokio::join!(session.run(), async {
            let _auth = backend.recv().await.unwrap().unwrap();
            builder.set_session(Some("sess-1".to_string()));
            let ack = builder.build(MessageKind::AuthAck, &ack_body("ok")).unwrap();
            backend.send(&ack.to_wire().unwrap()).await.unwrap();
            drop(backend);
        });

        outcome.unwrap();
        assert_eq!(state.session_id(), None);
        // Policy hash survives the close; it is device state, not session
        // state.
        assert_eq!(state.policy_hash(), "sha256:policy");
    }
}

//! Kernel-service client.
//!
//! The relay owns the agent side of the kernel IPC channel: it connects to
//! the kernel service's Unix socket on demand, keeps the connection cached
//! between commands, and re-establishes it when the peer goes away. Every
//! response is checked for request correlation and its signature stamp is
//! verified before the dispatcher sees it.
//!
//! When the socket is unreachable and the operator has explicitly enabled
//! it, the relay falls back to spawning the kernel-service binary in
//! one-shot mode. The fallback carries only the opcode and request id, so
//! parameterized operations cannot rely on it.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use fleetd_core::canonical::{self, CanonicalError};
use fleetd_core::crypto::{CryptoError, SignatureStamp, StampAssurance};
use fleetd_core::ipc::{
    self, IpcError, JsonFrameReader, KernelRequest, KernelResponse, MAX_FRAME_LEN,
};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::DEFAULT_KERNELSVC_BIN;

/// Relay failures.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No connection could be established within the attempt budget.
    #[error("kernel channel unavailable after {attempts} connect attempts")]
    Unavailable {
        /// How many attempts were made.
        attempts: u32,
    },

    /// The kernel accepted the request but never answered in time.
    #[error("kernel did not respond within {timeout_ms}ms")]
    Timeout {
        /// The enforced deadline.
        timeout_ms: u64,
    },

    /// Framing or stream failure on an established connection.
    #[error(transparent)]
    Frame(#[from] IpcError),

    /// The response answers a different request than the one sent.
    #[error("kernel response correlates to {got:?}, expected {expected:?}")]
    CorrelationMismatch {
        /// The request id the relay sent.
        expected: String,
        /// The request id the response carried.
        got: String,
    },

    /// The response's signature stamp failed verification.
    #[error("kernel response stamp rejected: {0}")]
    ResponseStamp(#[source] CryptoError),

    /// The response could not be canonically re-encoded for verification.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// The one-shot exec fallback itself failed.
    #[error("one-shot exec fallback failed: {reason}")]
    FallbackFailed {
        /// What went wrong.
        reason: String,
    },
}

impl RelayError {
    /// Channel failures are the class the exec fallback may paper over:
    /// the request never reached a kernel service. Protocol rejections
    /// (bad stamp, wrong correlation) are final.
    #[must_use]
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Frame(_)
        )
    }
}

/// Connection and verification knobs for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Kernel-service socket path.
    pub socket_path: PathBuf,
    /// Connect attempts per request before giving up.
    pub connect_attempts: u32,
    /// Pause between connect attempts.
    pub connect_backoff: Duration,
    /// Deadline for one full request/response exchange.
    pub io_timeout: Duration,
    /// Whether the one-shot exec fallback is permitted.
    pub allow_exec_fallback: bool,
    /// Binary spawned by the exec fallback.
    pub kernelsvc_binary: PathBuf,
    /// Kernel public key for verifying Ed25519 response stamps.
    pub kernel_verifying_key: Option<VerifyingKey>,
}

impl RelayConfig {
    /// Defaults: 3 connect attempts, 200ms backoff, 5s exchange deadline,
    /// fallback disabled.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(200),
            io_timeout: Duration::from_secs(5),
            allow_exec_fallback: false,
            kernelsvc_binary: PathBuf::from(DEFAULT_KERNELSVC_BIN),
            kernel_verifying_key: None,
        }
    }

    /// Overrides the connect attempt budget (clamped to at least 1).
    #[must_use]
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Overrides the pause between connect attempts.
    #[must_use]
    pub const fn with_connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    /// Overrides the exchange deadline.
    #[must_use]
    pub const fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Enables the one-shot exec fallback through `binary`.
    #[must_use]
    pub fn with_exec_fallback(mut self, binary: impl Into<PathBuf>) -> Self {
        self.allow_exec_fallback = true;
        self.kernelsvc_binary = binary.into();
        self
    }

    /// Pins the kernel public key; Ed25519 stamps must then verify.
    #[must_use]
    pub const fn with_kernel_verifying_key(mut self, key: VerifyingKey) -> Self {
        self.kernel_verifying_key = Some(key);
        self
    }
}

/// Where the relay currently stands with the kernel service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No cached connection.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// A cached connection is believed healthy.
    Connected,
}

/// The agent's client for the kernel-service socket.
pub struct KernelRelay {
    config: RelayConfig,
    state: RelayState,
    stream: Option<UnixStream>,
}

impl KernelRelay {
    /// Creates a disconnected relay; connections are made on first use.
    #[must_use]
    pub const fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: RelayState::Disconnected,
            stream: None,
        }
    }

    /// Current channel state.
    #[must_use]
    pub const fn state(&self) -> RelayState {
        self.state
    }

    /// Sends `request` to the kernel service and returns its verified
    /// response.
    ///
    /// # Errors
    ///
    /// Channel failures surface as [`RelayError::Unavailable`],
    /// [`RelayError::Timeout`] or [`RelayError::Frame`] unless the exec
    /// fallback is enabled, in which case the fallback's outcome is
    /// returned instead. Correlation and stamp failures are always final.
    pub async fn execute(
        &mut self,
        request: &KernelRequest,
    ) -> Result<KernelResponse, RelayError> {
        match self.execute_on_channel(request).await {
            Ok(response) => Ok(response),
            Err(err) if self.config.allow_exec_fallback && err.is_channel_failure() => {
                warn!(
                    opcode = %request.opcode,
                    error = %err,
                    "kernel channel failed; attempting one-shot exec fallback"
                );
                self.execute_via_fallback(request).await
            }
            Err(err) => Err(err),
        }
    }

    async fn execute_on_channel(
        &mut self,
        request: &KernelRequest,
    ) -> Result<KernelResponse, RelayError> {
        let frame = encode_request(request)?;
        let fresh = self.ensure_connected().await?;
        let text = match self.exchange_frame(&frame).await {
            Ok(text) => text,
            Err(err) => {
                self.disconnect();
                if fresh || !err.is_channel_failure() {
                    return Err(err);
                }
                // The cached connection died between the health probe and
                // the write. One retry on a fresh connection.
                debug!(error = %err, "reused kernel channel failed mid-exchange; retrying once");
                self.ensure_connected().await?;
                match self.exchange_frame(&frame).await {
                    Ok(text) => text,
                    Err(err) => {
                        self.disconnect();
                        return Err(err);
                    }
                }
            }
        };
        self.finish(request, &text)
    }

    /// Parses, correlates, and stamp-checks a raw response frame.
    fn finish(
        &self,
        request: &KernelRequest,
        text: &str,
    ) -> Result<KernelResponse, RelayError> {
        let response: KernelResponse = serde_json::from_str(text).map_err(|err| {
            RelayError::Frame(IpcError::Malformed {
                reason: err.to_string(),
            })
        })?;
        if response.request_id != request.request_id {
            return Err(RelayError::CorrelationMismatch {
                expected: request.request_id.clone(),
                got: response.request_id,
            });
        }
        self.verify_stamp(&response)?;
        Ok(response)
    }

    /// Returns `Ok(true)` when a new connection was just established,
    /// `Ok(false)` when a cached one is being reused.
    async fn ensure_connected(&mut self) -> Result<bool, RelayError> {
        match self.stream.as_ref() {
            Some(stream) if is_healthy(stream) => return Ok(false),
            Some(_) => {
                debug!("cached kernel channel went stale; reconnecting");
                self.disconnect();
            }
            None => {}
        }

        self.state = RelayState::Connecting;
        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => {
                    debug!(
                        attempt,
                        socket = %self.config.socket_path.display(),
                        "kernel channel connected"
                    );
                    self.stream = Some(stream);
                    self.state = RelayState::Connected;
                    return Ok(true);
                }
                Err(err) => {
                    debug!(
                        attempt,
                        error = %err,
                        socket = %self.config.socket_path.display(),
                        "kernel connect attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.connect_backoff).await;
                    }
                }
            }
        }
        self.state = RelayState::Disconnected;
        Err(RelayError::Unavailable { attempts })
    }

    /// One write-then-read exchange on the cached stream, under the
    /// configured deadline.
    async fn exchange_frame(&mut self, frame: &str) -> Result<String, RelayError> {
        let io_timeout = self.config.io_timeout;
        let timeout_ms = u64::try_from(io_timeout.as_millis()).unwrap_or(u64::MAX);
        let Some(stream) = self.stream.as_mut() else {
            return Err(RelayError::Unavailable { attempts: 0 });
        };
        let exchange = async {
            ipc::write_frame(stream, frame).await?;
            let mut frames = JsonFrameReader::new(&mut *stream, MAX_FRAME_LEN);
            match frames.next_frame().await? {
                Some(text) => Ok(text),
                None => Err(IpcError::UnexpectedEof { received: 0 }),
            }
        };
        match tokio::time::timeout(io_timeout, exchange).await {
            Ok(result) => result.map_err(RelayError::Frame),
            Err(_) => Err(RelayError::Timeout { timeout_ms }),
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.state = RelayState::Disconnected;
    }

    fn verify_stamp(&self, response: &KernelResponse) -> Result<(), RelayError> {
        let stamp = SignatureStamp::parse(&response.sig).map_err(RelayError::ResponseStamp)?;
        let message = canonical::encode(&response.signing_value())?;
        match stamp.verify(message.as_bytes(), self.config.kernel_verifying_key.as_ref()) {
            Ok(StampAssurance::Signed) => {
                debug!(
                    kernel_exec_id = %response.kernel_exec_id,
                    "kernel response signature verified"
                );
                Ok(())
            }
            Ok(StampAssurance::IntegrityOnly) => {
                warn!(
                    kernel_exec_id = %response.kernel_exec_id,
                    "kernel response carries an integrity-only stamp; authenticity not proven"
                );
                Ok(())
            }
            Err(CryptoError::VerifyingKeyUnavailable) => {
                warn!(
                    kernel_exec_id = %response.kernel_exec_id,
                    "kernel response is signed but no kernel public key is configured; accepting unverified"
                );
                Ok(())
            }
            Err(err) => Err(RelayError::ResponseStamp(err)),
        }
    }

    async fn execute_via_fallback(
        &self,
        request: &KernelRequest,
    ) -> Result<KernelResponse, RelayError> {
        let timeout_ms = u64::try_from(self.config.io_timeout.as_millis()).unwrap_or(u64::MAX);
        let spawned = Command::new(&self.config.kernelsvc_binary)
            .arg("--once")
            .arg(&request.opcode)
            .arg(&request.request_id)
            .env("FLEETD_ALLOW_EXEC_FALLBACK", "1")
            .output();
        let output = tokio::time::timeout(self.config.io_timeout, spawned)
            .await
            .map_err(|_| RelayError::Timeout { timeout_ms })?
            .map_err(|err| RelayError::FallbackFailed {
                reason: format!("spawn failed: {err}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::FallbackFailed {
                reason: format!("exited with {}: {}", output.status, stderr.trim()),
            });
        }
        let response: KernelResponse =
            serde_json::from_slice(&output.stdout).map_err(|err| RelayError::FallbackFailed {
                reason: format!("unparsable response: {err}"),
            })?;
        if response.request_id != request.request_id {
            return Err(RelayError::CorrelationMismatch {
                expected: request.request_id.clone(),
                got: response.request_id,
            });
        }
        self.verify_stamp(&response)?;
        debug!(
            kernel_exec_id = %response.kernel_exec_id,
            "one-shot exec fallback completed"
        );
        Ok(response)
    }
}

fn encode_request(request: &KernelRequest) -> Result<String, RelayError> {
    serde_json::to_string(request).map_err(|err| {
        RelayError::Frame(IpcError::Malformed {
            reason: err.to_string(),
        })
    })
}

/// A cached stream is healthy when a non-blocking probe finds neither EOF
/// nor unsolicited bytes. The kernel never speaks unprompted, so any
/// readable byte means the channel is desynchronized.
fn is_healthy(stream: &UnixStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Ok(0) => false,
        Ok(_) => false,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    use fleetd_core::crypto::Signer;
    use fleetd_core::envelope::now_timestamp;
    use fleetd_core::ipc::{Opcode, STATUS_SUCCESS};
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    use super::*;

    fn signed_response(request_id: &str, signer: Option<&Signer>) -> String {
        let mut response = KernelResponse {
            request_id: request_id.to_string(),
            status: STATUS_SUCCESS.to_string(),
            kernel_exec_id: "kexec-00000001".to_string(),
            timestamp: now_timestamp(),
            result: "pong".to_string(),
            error_code: 0,
            error_message: String::new(),
            sig: String::new(),
        };
        let message = canonical::encode(&response.signing_value()).unwrap();
        response.sig = match signer {
            Some(signer) => SignatureStamp::ed25519(signer, message.as_bytes()).to_string(),
            None => SignatureStamp::blake3(message.as_bytes()).to_string(),
        };
        serde_json::to_string(&response).unwrap()
    }

    /// Accepts `connections` sequential clients, answering each with
    /// `reply` and closing, the way the real kernel service does.
    fn spawn_mock_kernel(
        listener: UnixListener,
        connections: usize,
        reply: impl Fn(&KernelRequest) -> String + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            for _ in 0..connections {
                let (mut stream, _) = listener.accept().await.unwrap();
                let text = {
                    let mut frames = JsonFrameReader::new(&mut stream, MAX_FRAME_LEN);
                    frames.next_frame().await.unwrap().unwrap()
                };
                let request: KernelRequest = serde_json::from_str(&text).unwrap();
                let frame = reply(&request);
                ipc::write_frame(&mut stream, &frame).await.unwrap();
            }
        })
    }

    fn quick_config(socket: &std::path::Path) -> RelayConfig {
        RelayConfig::new(socket)
            .with_connect_attempts(2)
            .with_connect_backoff(Duration::from_millis(5))
            .with_io_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn executes_request_over_the_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = spawn_mock_kernel(listener, 1, |req| {
            signed_response(&req.request_id, None)
        });

        let mut relay = KernelRelay::new(quick_config(&socket));
        let response = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-1"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.request_id, "req-1");
        assert_eq!(relay.state(), RelayState::Connected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_kernel_closed_the_connection() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = spawn_mock_kernel(listener, 2, |req| {
            signed_response(&req.request_id, None)
        });

        let mut relay = KernelRelay::new(quick_config(&socket));
        for id in ["req-1", "req-2"] {
            let response = relay
                .execute(&KernelRequest::new(Opcode::Ping, id))
                .await
                .unwrap();
            assert_eq!(response.request_id, id);
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_correlation_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = spawn_mock_kernel(listener, 1, |_| signed_response("req-other", None));

        let mut relay = KernelRelay::new(quick_config(&socket));
        let err = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::CorrelationMismatch { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ed25519_stamp_verifies_against_the_pinned_key() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let kernel_signer = Arc::new(Signer::generate());
        let server = {
            let signer = Arc::clone(&kernel_signer);
            spawn_mock_kernel(listener, 1, move |req| {
                signed_response(&req.request_id, Some(&signer))
            })
        };

        let config = quick_config(&socket).with_kernel_verifying_key(kernel_signer.verifying_key());
        let mut relay = KernelRelay::new(config);
        let response = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-1"))
            .await
            .unwrap();
        assert!(response.is_success());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stamp_from_the_wrong_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let rogue = Arc::new(Signer::generate());
        let server = {
            let signer = Arc::clone(&rogue);
            spawn_mock_kernel(listener, 1, move |req| {
                signed_response(&req.request_id, Some(&signer))
            })
        };

        let pinned = Signer::generate().verifying_key();
        let mut relay = KernelRelay::new(quick_config(&socket).with_kernel_verifying_key(pinned));
        let err = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ResponseStamp(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_socket_reports_the_attempt_budget() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("missing.sock");
        let mut relay = KernelRelay::new(quick_config(&socket));
        let err = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unavailable { attempts: 2 }));
        assert_eq!(relay.state(), RelayState::Disconnected);
    }

    #[tokio::test]
    async fn silent_kernel_times_out() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut frames = JsonFrameReader::new(&mut stream, MAX_FRAME_LEN);
            let _ = frames.next_frame().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = quick_config(&socket).with_io_timeout(Duration::from_millis(100));
        let mut relay = KernelRelay::new(config);
        let err = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout { timeout_ms: 100 }));
        assert_eq!(relay.state(), RelayState::Disconnected);
        server.abort();
    }

    #[tokio::test]
    async fn channel_failure_without_fallback_stays_a_channel_failure() {
        let dir = TempDir::new().unwrap();
        let mut relay = KernelRelay::new(quick_config(&dir.path().join("missing.sock")));
        let err = relay
            .execute(&KernelRequest::new(Opcode::Reboot, "req-1"))
            .await
            .unwrap_err();
        assert!(err.is_channel_failure());
        assert!(!matches!(err, RelayError::FallbackFailed { .. }));
    }

    #[tokio::test]
    async fn exec_fallback_runs_the_binary_and_parses_stdout() {
        let dir = TempDir::new().unwrap();
        let response_json = signed_response("req-9", None);
        let bin = dir.path().join("fake-kernelsvc");
        let script = format!(
            "#!/bin/sh\n\
             [ \"$1\" = \"--once\" ] || exit 9\n\
             [ \"$2\" = \"ping\" ] || exit 9\n\
             [ \"$3\" = \"req-9\" ] || exit 9\n\
             printf '%s' '{response_json}'\n"
        );
        fs::write(&bin, script).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();

        let config = quick_config(&dir.path().join("missing.sock")).with_exec_fallback(&bin);
        let mut relay = KernelRelay::new(config);
        let response = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-9"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.request_id, "req-9");
    }

    #[tokio::test]
    async fn exec_fallback_spawn_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = quick_config(&dir.path().join("missing.sock"))
            .with_exec_fallback("/nonexistent/fleetd-kernelsvc");
        let mut relay = KernelRelay::new(config);
        let err = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-1"))
            .await
            .unwrap_err();
        match err {
            RelayError::FallbackFailed { reason } => assert!(reason.contains("spawn")),
            other => panic!("expected fallback failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_fallback_nonzero_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("failing-kernelsvc");
        fs::write(&bin, "#!/bin/sh\necho boom >&2\nexit 3\n").unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();

        let config = quick_config(&dir.path().join("missing.sock")).with_exec_fallback(&bin);
        let mut relay = KernelRelay::new(config);
        let err = relay
            .execute(&KernelRequest::new(Opcode::Ping, "req-1"))
            .await
            .unwrap_err();
        match err {
            RelayError::FallbackFailed { reason } => {
                assert!(reason.contains("exited"), "reason: {reason}");
                assert!(reason.contains("boom"), "reason: {reason}");
            }
            other => panic!("expected fallback failure, got {other:?}"),
        }
    }
}

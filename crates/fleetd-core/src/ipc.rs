//! Kernel IPC wire types and framing.
//!
//! The agent talks to the kernel service over a local stream socket with
//! one JSON document per message and no length prefix; a frame ends where
//! the document ends. [`JsonFrameReader`] accumulates bytes until a
//! complete document is buffered, enforcing a size bound so a wedged or
//! hostile peer cannot balloon memory.
//!
//! Requests are unsigned (the socket itself is the trust boundary, mode
//! 0660 in a 0700 directory). Responses are signed by the kernel service;
//! see [`crate::crypto::SignatureStamp`] for the tagged stamp format.
//!
//! # Wire shapes
//!
//! ```text
//! request:  {"opcode":"ping","request_id":"cmd-1", ...optional fields}
//! response: {"request_id":"cmd-1","status":"success","kernel_exec_id":
//!            "kexec-1a2b3c4d","timestamp":"2025-01-01T00:00:00Z",
//!            "result":"...","error_code":0,"error_message":"",
//!            "sig":"ed25519:..."}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Upper bound on a single IPC frame. Requests and responses are small;
/// anything approaching this is a protocol violation.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Default I/O timeout for a single IPC exchange, in milliseconds.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;

/// `status` value on successful responses.
pub const STATUS_SUCCESS: &str = "success";

/// `status` value on failed responses.
pub const STATUS_ERROR: &str = "error";

/// Errors on the kernel IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Socket-level read or write failure.
    #[error("I/O failure on IPC channel: {0}")]
    Io(#[from] std::io::Error),

    /// A frame grew past [`MAX_FRAME_LEN`] (or the caller's bound)
    /// without completing.
    #[error("frame exceeds {max}-byte bound without completing")]
    FrameTooLarge {
        /// The enforced bound.
        max: usize,
    },

    /// The peer closed the stream in the middle of a document.
    #[error("peer closed mid-frame after {received} bytes")]
    UnexpectedEof {
        /// Bytes buffered when the stream closed.
        received: usize,
    },

    /// The peer sent bytes that are not a JSON document.
    #[error("malformed frame: {reason}")]
    Malformed {
        /// Parser diagnostic.
        reason: String,
    },

    /// A complete frame was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The exchange did not complete in time.
    #[error("IPC operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The elapsed timeout.
        timeout_ms: u64,
    },
}

/// The closed set of operations the kernel service executes.
///
/// The wire carries opcodes as strings; unknown strings are handled by
/// the executor (rejected with `OPCODE_NOT_SUPPORTED`), which is why
/// [`KernelRequest::opcode`] is not typed as `Opcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Liveness probe; always safe.
    Ping,
    /// Lock the interactive session; safe, never gated.
    LockScreen,
    /// Reboot the host.
    Reboot,
    /// Power the host off.
    Shutdown,
    /// End the interactive user session.
    Logout,
    /// Copy an update package into the staging area.
    StageUpdate,
    /// Promote a staged package to active.
    CommitUpdate,
    /// Restore a snapshot over the active package.
    RollbackUpdate,
    /// Clear wedged state (stale locks, staging debris, oversized logs).
    SelfRepair,
}

impl Opcode {
    /// Wire string for this opcode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::LockScreen => "lock_screen",
            Self::Reboot => "reboot",
            Self::Shutdown => "shutdown",
            Self::Logout => "logout",
            Self::StageUpdate => "stage_update",
            Self::CommitUpdate => "commit_update",
            Self::RollbackUpdate => "rollback_update",
            Self::SelfRepair => "self_repair",
        }
    }

    /// Parses a wire string; `None` for anything outside the closed set.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "ping" => Some(Self::Ping),
            "lock_screen" => Some(Self::LockScreen),
            "reboot" => Some(Self::Reboot),
            "shutdown" => Some(Self::Shutdown),
            "logout" => Some(Self::Logout),
            "stage_update" => Some(Self::StageUpdate),
            "commit_update" => Some(Self::CommitUpdate),
            "rollback_update" => Some(Self::RollbackUpdate),
            "self_repair" => Some(Self::SelfRepair),
            _ => None,
        }
    }

    /// Returns `true` for opcodes held behind the dangerous-ops flag:
    /// everything that mutates the OS session or the update lifecycle.
    /// `ping` and `lock_screen` always execute.
    #[must_use]
    pub const fn is_dangerous(self) -> bool {
        !matches!(self, Self::Ping | Self::LockScreen)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request from the agent to the kernel service.
///
/// Optional fields are omitted (not `null`) when absent; requests are
/// unsigned, so their encoding does not need to be canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRequest {
    /// Operation to execute, as a wire string.
    pub opcode: String,
    /// Correlation id, echoed verbatim in the response. The dispatcher
    /// uses the backend command id here so kernel logs line up with
    /// backend traces.
    pub request_id: String,
    /// Operation parameters, opcode-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Policy hash the agent was operating under, for kernel-side audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_hash: Option<String>,
    /// Backend envelope message id that carried the command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_message_id: Option<String>,
}

impl KernelRequest {
    /// Builds a minimal request for `opcode`.
    #[must_use]
    pub fn new(opcode: Opcode, request_id: impl Into<String>) -> Self {
        Self {
            opcode: opcode.as_str().to_string(),
            request_id: request_id.into(),
            params: None,
            policy_hash: None,
            command_message_id: None,
        }
    }

    /// Attaches opcode parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Attaches the agent's current policy hash.
    #[must_use]
    pub fn with_policy_hash(mut self, policy_hash: impl Into<String>) -> Self {
        self.policy_hash = Some(policy_hash.into());
        self
    }

    /// Attaches the originating backend message id.
    #[must_use]
    pub fn with_command_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.command_message_id = Some(message_id.into());
        self
    }
}

/// A signed response from the kernel service.
///
/// All fields are always present; `sig` is a tagged stamp over the
/// canonical encoding of the response with `sig` removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelResponse {
    /// Correlation id echoed from the request.
    pub request_id: String,
    /// `"success"` or `"error"`.
    pub status: String,
    /// Kernel-generated execution id (`kexec-<hex>`), for audit trails.
    pub kernel_exec_id: String,
    /// UTC second-resolution timestamp of execution.
    pub timestamp: String,
    /// Operation result payload (free text or embedded JSON).
    pub result: String,
    /// Zero on success; protocol error code otherwise.
    pub error_code: i64,
    /// Empty on success; diagnostic otherwise.
    pub error_message: String,
    /// Tagged signature stamp (`ed25519:...` or `blake3:...`).
    pub sig: String,
}

impl KernelResponse {
    /// Returns `true` if the kernel reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS && self.error_code == 0
    }

    /// The response as a JSON value with `sig` removed; canonical
    /// encoding of this value is the signed message.
    #[must_use]
    pub fn signing_value(&self) -> Value {
        serde_json::json!({
            "request_id": self.request_id,
            "status": self.status,
            "kernel_exec_id": self.kernel_exec_id,
            "timestamp": self.timestamp,
            "result": self.result,
            "error_code": self.error_code,
            "error_message": self.error_message,
        })
    }
}

/// Incremental reader that yields one complete JSON document per call.
///
/// Works for both channel styles in the protocol: the kernel socket (one
/// document, then close) and the backend transport (many documents on a
/// long-lived stream).
#[derive(Debug)]
pub struct JsonFrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    max: usize,
}

impl<R: AsyncRead + Unpin> JsonFrameReader<R> {
    /// Wraps `reader` with the given frame size bound.
    pub fn new(reader: R, max: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            max,
        }
    }

    /// Reads until one complete JSON document is buffered and returns it.
    ///
    /// Returns `Ok(None)` on clean end-of-stream (no buffered bytes).
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::FrameTooLarge`] when the bound is exceeded,
    /// [`IpcError::UnexpectedEof`] when the peer closes mid-document, and
    /// [`IpcError::Malformed`] when the bytes cannot begin a document.
    pub async fn next_frame(&mut self) -> Result<Option<String>, IpcError> {
        loop {
            // Strip inter-frame whitespace so returned frames start at
            // the document.
            let lead = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if lead > 0 {
                self.buf.drain(..lead);
            }

            if !self.buf.is_empty() {
                if let Some(frame) = self.try_extract()? {
                    return Ok(Some(frame));
                }
            }

            if self.buf.len() >= self.max {
                return Err(IpcError::FrameTooLarge { max: self.max });
            }

            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(IpcError::UnexpectedEof {
                    received: self.buf.len(),
                });
            }
        }
    }

    /// Attempts to split one complete document off the front of the
    /// buffer. `Ok(None)` means more bytes are needed.
    fn try_extract(&mut self) -> Result<Option<String>, IpcError> {
        let mut stream = serde_json::Deserializer::from_slice(&self.buf)
            .into_iter::<serde::de::IgnoredAny>();
        match stream.next() {
            Some(Ok(_)) => {
                let end = stream.byte_offset();
                let frame: Vec<u8> = self.buf.drain(..end).collect();
                Ok(Some(String::from_utf8(frame)?))
            }
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => Err(IpcError::Malformed {
                reason: err.to_string(),
            }),
            None => Ok(None),
        }
    }
}

/// Writes one frame and flushes.
///
/// # Errors
///
/// Returns [`IpcError::Io`] on write failure.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &str,
) -> Result<(), IpcError> {
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn minimal_request_omits_absent_fields() {
        let request = KernelRequest::new(Opcode::Ping, "req-1");
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"opcode":"ping","request_id":"req-1"}"#
        );
    }

    #[test]
    fn full_request_roundtrips() {
        let request = KernelRequest::new(Opcode::StageUpdate, "cmd-42")
            .with_params(json!({"package_path": "/var/tmp/pkg.bin", "sandbox": true}))
            .with_policy_hash("sha256:abc")
            .with_command_message_id("msg-9");

        let text = serde_json::to_string(&request).unwrap();
        let parsed: KernelRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.params.unwrap()["package_path"], "/var/tmp/pkg.bin");
    }

    #[test]
    fn response_roundtrips_and_reports_success() {
        let response = KernelResponse {
            request_id: "cmd-1".to_string(),
            status: STATUS_SUCCESS.to_string(),
            kernel_exec_id: "kexec-1a2b3c4d".to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            result: "pong".to_string(),
            error_code: 0,
            error_message: String::new(),
            sig: "blake3:00".to_string(),
        };
        let text = serde_json::to_string(&response).unwrap();
        let parsed: KernelResponse = serde_json::from_str(&text).unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed, response);

        let failed = KernelResponse {
            status: STATUS_ERROR.to_string(),
            error_code: 4004,
            ..response
        };
        assert!(!failed.is_success());
    }

    #[test]
    fn signing_value_excludes_sig() {
        let response = KernelResponse {
            request_id: "r".to_string(),
            status: STATUS_SUCCESS.to_string(),
            kernel_exec_id: "kexec-1".to_string(),
            timestamp: "t".to_string(),
            result: "ok".to_string(),
            error_code: 0,
            error_message: String::new(),
            sig: "ed25519:xyz".to_string(),
        };
        let value = response.signing_value();
        assert!(value.get("sig").is_none());
        assert_eq!(value["request_id"], "r");
        assert_eq!(value["error_code"], 0);
    }

    #[test]
    fn opcode_wire_strings_are_stable() {
        let all = [
            (Opcode::Ping, "ping"),
            (Opcode::LockScreen, "lock_screen"),
            (Opcode::Reboot, "reboot"),
            (Opcode::Shutdown, "shutdown"),
            (Opcode::Logout, "logout"),
            (Opcode::StageUpdate, "stage_update"),
            (Opcode::CommitUpdate, "commit_update"),
            (Opcode::RollbackUpdate, "rollback_update"),
            (Opcode::SelfRepair, "self_repair"),
        ];
        for (opcode, text) in all {
            assert_eq!(opcode.as_str(), text);
            assert_eq!(Opcode::parse(text), Some(opcode));
        }
        assert_eq!(Opcode::parse("format_disk"), None);
        assert_eq!(Opcode::parse(""), None);
    }

    #[test]
    fn dangerous_set_spares_ping_and_lock_screen() {
        assert!(!Opcode::Ping.is_dangerous());
        assert!(!Opcode::LockScreen.is_dangerous());
        for opcode in [
            Opcode::Reboot,
            Opcode::Shutdown,
            Opcode::Logout,
            Opcode::StageUpdate,
            Opcode::CommitUpdate,
            Opcode::RollbackUpdate,
            Opcode::SelfRepair,
        ] {
            assert!(opcode.is_dangerous(), "{opcode} must be gated");
        }
    }

    #[tokio::test]
    async fn frame_reader_yields_single_document() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = JsonFrameReader::new(server, MAX_FRAME_LEN);

        write_frame(&mut client, r#"{"opcode":"ping","request_id":"r1"}"#)
            .await
            .unwrap();
        drop(client);

        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"opcode":"ping","request_id":"r1"}"#);
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn frame_reader_splits_pipelined_documents() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = JsonFrameReader::new(server, MAX_FRAME_LEN);

        write_frame(&mut client, "{\"a\":1} {\"b\":2}\n{\"c\":3}")
            .await
            .unwrap();
        drop(client);

        assert_eq!(reader.next_frame().await.unwrap().unwrap(), r#"{"a":1}"#);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), r#"{"b":2}"#);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), r#"{"c":3}"#);
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn frame_reader_waits_for_split_writes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = JsonFrameReader::new(server, MAX_FRAME_LEN);

        let writer = tokio::spawn(async move {
            client.write_all(b"{\"opcode\":\"pi").await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client.write_all(b"ng\"}").await.unwrap();
            client.flush().await.unwrap();
        });

        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"opcode":"ping"}"#);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn frame_reader_rejects_oversize_frames() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = JsonFrameReader::new(server, 32);

        let big = format!("{{\"pad\":\"{}\"}}", "x".repeat(64));
        tokio::spawn(async move {
            let _ = client.write_all(big.as_bytes()).await;
        });

        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { max: 32 }));
    }

    #[tokio::test]
    async fn frame_reader_reports_mid_frame_close() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = JsonFrameReader::new(server, MAX_FRAME_LEN);

        client.write_all(b"{\"opcode\":").await.unwrap();
        drop(client);

        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, IpcError::UnexpectedEof { .. }));
    }

    #[tokio::test]
    async fn frame_reader_rejects_non_json() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = JsonFrameReader::new(server, MAX_FRAME_LEN);

        client.write_all(b"hello there").await.unwrap();
        drop(client);

        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, IpcError::Malformed { .. }));
    }
}

//! The backend connection as a framed JSON stream.
//!
//! The session layer only needs two verbs, send a frame and receive a frame,
//! so the transport is a small trait over any split async stream. Production
//! uses a Unix socket (`unix://<path>` endpoints); tests use an in-memory
//! duplex pipe with a scripted peer on the other end.

use std::io;

use async_trait::async_trait;
use fleetd_core::ipc::{self, IpcError, JsonFrameReader, MAX_FRAME_LEN};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Transport-level failures. Frame-level problems from the shared reader
/// pass through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint string is not a scheme this build supports.
    #[error("unsupported backend endpoint {endpoint:?}; expected unix://<path>")]
    UnsupportedEndpoint {
        /// The offending endpoint string.
        endpoint: String,
    },

    /// The initial connection failed.
    #[error("failed to connect to backend at {endpoint:?}: {source}")]
    ConnectFailed {
        /// The endpoint the agent tried to reach.
        endpoint: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A framing or I/O failure on an established connection.
    #[error(transparent)]
    Frame(#[from] IpcError),
}

/// A bidirectional stream of JSON document frames to the backend.
#[async_trait]
pub trait BackendTransport: Send {
    /// Writes one complete frame and flushes it.
    async fn send(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Reads the next complete frame. `Ok(None)` is an orderly close by
    /// the peer.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;
}

/// [`BackendTransport`] over any split async byte stream.
#[derive(Debug)]
pub struct StreamTransport<R, W> {
    frames: JsonFrameReader<R>,
    writer: W,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps a read half and a write half.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            frames: JsonFrameReader::new(reader, MAX_FRAME_LEN),
            writer,
        }
    }
}

#[async_trait]
impl<R, W> BackendTransport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        ipc::write_frame(&mut self.writer, frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.frames.next_frame().await?)
    }
}

/// The production transport: a connected Unix socket, split.
pub type UnixBackendTransport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

/// Connects to a `unix://<path>` backend endpoint.
pub async fn connect(endpoint: &str) -> Result<UnixBackendTransport, TransportError> {
    let Some(path) = endpoint.strip_prefix("unix://") else {
        return Err(TransportError::UnsupportedEndpoint {
            endpoint: endpoint.to_string(),
        });
    };
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::ConnectFailed {
            endpoint: endpoint.to_string(),
            source,
        })?;
    let (reader, writer) = stream.into_split();
    Ok(StreamTransport::new(reader, writer))
}

/// In-memory transport, used by the integration tests and local harnesses.
pub type DuplexTransport = StreamTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Builds a connected pair of in-memory transports. Frames sent on one side
/// arrive on the other.
#[must_use]
pub fn duplex_pair(capacity: usize) -> (DuplexTransport, DuplexTransport) {
    let (left, right) = tokio::io::duplex(capacity);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        StreamTransport::new(left_read, left_write),
        StreamTransport::new(right_read, right_write),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_pair_delivers_frames_both_ways() {
        let (mut left, mut right) = duplex_pair(4096);
        left.send(r#"{"dir":"l2r"}"#).await.unwrap();
        assert_eq!(right.recv().await.unwrap().unwrap(), r#"{"dir":"l2r"}"#);
        right.send(r#"{"dir":"r2l"}"#).await.unwrap();
        assert_eq!(left.recv().await.unwrap().unwrap(), r#"{"dir":"r2l"}"#);
    }

    #[tokio::test]
    async fn dropped_peer_reads_as_orderly_close() {
        let (mut left, right) = duplex_pair(4096);
        drop(right);
        assert!(left.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_unix_endpoint_is_rejected() {
        let err = connect("tcp://127.0.0.1:9000").await.unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedEndpoint { .. }));
    }

    #[tokio::test]
    async fn connect_failure_names_the_endpoint() {
        let err = connect("unix:///nonexistent/fleetd/backend.sock")
            .await
            .unwrap_err();
        match err {
            TransportError::ConnectFailed { endpoint, .. } => {
                assert!(endpoint.contains("backend.sock"));
            }
            other => panic!("expected connect failure, got {other:?}"),
        }
    }
}

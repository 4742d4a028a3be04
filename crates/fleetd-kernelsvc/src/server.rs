//! Single-connection IPC server over a Unix socket.
//!
//! One connection is served fully before the next is accepted: read
//! exactly one request, execute it, write exactly one response, close.
//! Privileged operations are serialized by construction, with no locking
//! around destructive actions.
//!
//! Socket hygiene on bind: the parent directory is created mode 0700 when
//! missing (existing directories are left untouched, and symlinks are
//! refused), a stale socket file is removed only after verifying it
//! really is a socket, and the bound socket is set to mode 0660. The
//! socket file is removed again on drop.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use fleetd_core::ipc::{
    self, DEFAULT_IO_TIMEOUT_MS, IpcError, JsonFrameReader, KernelRequest, MAX_FRAME_LEN,
};

use crate::executor::OpcodeExecutor;
use crate::ops::PrivilegedOps;

/// Socket file mode: owner and group may connect.
const SOCKET_MODE: u32 = 0o660;

/// Mode for socket directories this server creates.
const DIRECTORY_MODE: u32 = 0o700;

/// Correlation id used when a request is too malformed to carry one.
const UNKNOWN_REQUEST_ID: &str = "req-unknown";

/// Socket setup and accept failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The socket directory path is a symlink.
    #[error("{} is a symlink; refusing to use as socket directory", path.display())]
    SymlinkDirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// Something that is not a directory sits at the socket directory
    /// path.
    #[error("{} exists but is not a directory", path.display())]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// Something that is not a socket sits at the socket path; it is not
    /// ours to delete.
    #[error("{} exists but is not a socket", path.display())]
    NotASocket {
        /// The offending path.
        path: PathBuf,
    },

    /// Binding the listener failed.
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Any other filesystem or accept failure.
    #[error("socket I/O failure at {}: {source}", path.display())]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Bound IPC listener that serves requests strictly sequentially.
#[derive(Debug)]
pub struct IpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
    io_timeout: Duration,
}

impl IpcServer {
    /// Prepares the socket directory, clears a stale socket, binds, and
    /// sets the socket to mode 0660.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::SymlinkDirectory`] / [`ServerError::NotADirectory`]
    /// for an unusable directory path, [`ServerError::NotASocket`] when a
    /// foreign file occupies the socket path, and [`ServerError::Bind`] when
    /// the listener cannot be created.
    pub fn bind(socket_path: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            ensure_directory(parent)?;
        }
        cleanup_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path).map_err(|source| ServerError::Bind {
            path: socket_path.clone(),
            source,
        })?;
        set_socket_permissions(&socket_path, SOCKET_MODE)?;

        info!(socket = %socket_path.display(), "IPC server bound");
        Ok(Self {
            socket_path,
            listener,
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        })
    }

    /// Overrides the per-exchange read/write timeout.
    #[must_use]
    pub const fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// The bound socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts and serves connections forever, one at a time. Returns
    /// only when `accept` itself fails; per-connection failures are
    /// logged and the loop continues.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] when the listener breaks.
    pub async fn serve<P: PrivilegedOps>(
        &self,
        executor: &OpcodeExecutor<P>,
    ) -> Result<(), ServerError> {
        loop {
            let (stream, _addr) = self.listener.accept().await.map_err(|source| ServerError::Io {
                path: self.socket_path.clone(),
                source,
            })?;
            self.serve_connection(stream, executor).await;
        }
    }

    /// One request in, one response out, then close. A request that is
    /// not parseable still gets a stamped 4004 response under the
    /// synthesized id, so callers are never left hanging on bad input; a
    /// peer that times out, floods, or hangs up mid-frame is dropped.
    async fn serve_connection<P: PrivilegedOps>(
        &self,
        stream: UnixStream,
        executor: &OpcodeExecutor<P>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = JsonFrameReader::new(read_half, MAX_FRAME_LEN);

        let request = match tokio::time::timeout(self.io_timeout, reader.next_frame()).await {
            Ok(Ok(Some(frame))) => match serde_json::from_str::<KernelRequest>(&frame) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "request is not a valid kernel request");
                    synthesized_request()
                }
            },
            Ok(Ok(None)) => {
                debug!("peer connected and closed without a request");
                return;
            }
            Ok(Err(IpcError::Malformed { reason })) => {
                warn!(%reason, "request frame is not JSON");
                synthesized_request()
            }
            Ok(Err(err)) => {
                warn!(error = %err, "dropping unusable connection");
                return;
            }
            Err(_) => {
                warn!(timeout_ms = %self.io_timeout.as_millis(), "request read timed out");
                return;
            }
        };

        let response = executor.execute(&request).await;
        let frame = match serde_json::to_string(&response) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "response serialization failed");
                return;
            }
        };
        match tokio::time::timeout(self.io_timeout, ipc::write_frame(&mut write_half, &frame)).await
        {
            Ok(Ok(())) => debug!(
                opcode = %request.opcode,
                request_id = %response.request_id,
                status = %response.status,
                "request served"
            ),
            Ok(Err(err)) => warn!(error = %err, "failed to write response"),
            Err(_) => warn!("response write timed out"),
        }
    }

    fn cleanup(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            warn!(error = %err, "failed to remove socket file on shutdown");
        }
    }
}

/// Stand-in request for input that never parsed; the executor turns it
/// into a stamped `unknown_opcode` response.
fn synthesized_request() -> KernelRequest {
    KernelRequest {
        opcode: String::new(),
        request_id: UNKNOWN_REQUEST_ID.to_string(),
        params: None,
        policy_hash: None,
        command_message_id: None,
    }
}

/// Creates the socket directory when missing (mode 0700); an existing
/// directory's permissions are left alone, and symlinks are refused.
fn ensure_directory(path: &Path) -> Result<(), ServerError> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(ServerError::SymlinkDirectory {
                    path: path.to_path_buf(),
                });
            }
            if !metadata.is_dir() {
                return Err(ServerError::NotADirectory {
                    path: path.to_path_buf(),
                });
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|source| ServerError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE))
                    .map_err(|source| ServerError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
            }
            Ok(())
        }
        Err(source) => Err(ServerError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Removes a stale socket file, refusing to delete anything that is not
/// actually a socket.
fn cleanup_socket(path: &Path) -> Result<(), ServerError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(ServerError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(ServerError::NotASocket {
                path: path.to_path_buf(),
            });
        }
    }

    std::fs::remove_file(path).map_err(|source| ServerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "removed stale socket file");
    Ok(())
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path, mode: u32) -> Result<(), ServerError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        ServerError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path, _mode: u32) -> Result<(), ServerError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn bind_creates_the_directory_and_sets_modes() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("run").join("kernelsvc.sock");

        let server = IpcServer::bind(&socket).unwrap();
        assert_eq!(server.socket_path(), socket.as_path());

        let dir_mode = std::fs::metadata(socket.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, DIRECTORY_MODE);

        let socket_mode = std::fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
        assert_eq!(socket_mode, SOCKET_MODE);
    }

    #[tokio::test]
    async fn drop_removes_the_socket_file() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernelsvc.sock");

        let server = IpcServer::bind(&socket).unwrap();
        assert!(socket.exists());
        drop(server);
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_on_bind() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernelsvc.sock");

        // A previous process that died uncleanly leaves its socket file.
        let stale = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        drop(stale);
        assert!(socket.exists());

        IpcServer::bind(&socket).unwrap();
    }

    #[tokio::test]
    async fn foreign_file_at_socket_path_is_refused() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("kernelsvc.sock");
        std::fs::write(&socket, "precious data").unwrap();

        let err = IpcServer::bind(&socket).unwrap_err();
        assert!(matches!(err, ServerError::NotASocket { .. }));
        assert_eq!(
            std::fs::read_to_string(&socket).unwrap(),
            "precious data",
            "foreign file must not be deleted"
        );
    }

    #[tokio::test]
    async fn symlinked_socket_directory_is_refused() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = IpcServer::bind(link.join("kernelsvc.sock")).unwrap_err();
        assert!(matches!(err, ServerError::SymlinkDirectory { .. }));
    }

    #[tokio::test]
    async fn existing_directory_permissions_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let parent = dir.path().join("run");
        std::fs::create_dir(&parent).unwrap();
        std::fs::set_permissions(&parent, std::fs::Permissions::from_mode(0o755)).unwrap();

        IpcServer::bind(parent.join("kernelsvc.sock")).unwrap();

        let mode = std::fs::metadata(&parent).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
}

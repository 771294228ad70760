//! Unix Socket Transport
//!
//! Local IPC over Unix domain sockets. Each endpoint is a socket file named
//! after the connection: `<base_dir>/<name>.sock`, or
//! `<base_dir>/<name><client_id>.sock` for per-client pool endpoints.
//!
//! # Security
//!
//! - Socket files are created with 0600 permissions
//! - `unmask_permissions` opens them to every local user (0777)

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};

use super::traits::{BoxedConnection, ListenOptions, Listener, Transport, TransportError};

/// Directory socket files are created in when none is configured
pub const DEFAULT_SOCKET_DIR: &str = "/tmp";

/// Unix domain socket transport
#[derive(Clone, Debug)]
pub struct UnixSocketTransport {
    base_dir: PathBuf,
}

impl UnixSocketTransport {
    /// Create a transport placing socket files in `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the directory socket files live in
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Socket path for an endpoint
    pub fn socket_path(&self, name: &str, client_id: u32) -> PathBuf {
        if client_id > 0 {
            self.base_dir.join(format!("{name}{client_id}.sock"))
        } else {
            self.base_dir.join(format!("{name}.sock"))
        }
    }
}

impl Default for UnixSocketTransport {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_DIR)
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn connect(&self, name: &str, client_id: u32) -> Result<BoxedConnection, TransportError> {
        let path = self.socket_path(name, client_id);
        let stream = UnixStream::connect(&path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to connect to {path:?}: {e}"))
        })?;
        Ok(Box::new(stream))
    }

    async fn listen(
        &self,
        name: &str,
        client_id: u32,
        options: ListenOptions,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let path = self.socket_path(name, client_id);

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {parent:?}: {e}"),
                ))
            })?;
        }

        // Remove a stale socket file left by a previous run
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = ?path, "Removed stale socket file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to remove old socket {path:?}: {e}"),
                )))
            }
        }

        let listener = UnixListener::bind(&path)?;

        let mode = if options.unmask_permissions { 0o777 } else { 0o600 };
        tokio::fs::set_permissions(&path, Permissions::from_mode(mode)).await?;

        tracing::debug!(path = ?path, mode = format!("{mode:o}"), "Listening on Unix socket");

        Ok(Box::new(UnixSocketListener { listener, path }))
    }
}

struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
}

#[async_trait]
impl Listener for UnixSocketListener {
    async fn accept(&self) -> Result<BoxedConnection, TransportError> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = ?self.path, error = %e, "Failed to remove socket file");
            }
        }
    }
}

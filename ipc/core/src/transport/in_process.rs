//! In-Process Transport
//!
//! Endpoints that live inside one process, backed by `tokio::io::duplex`
//! pipes. Used when client and server are embedded in the same program and
//! throughout the test suite.
//!
//! Endpoints are scoped to one [`InProcessTransport`] value and its clones:
//! two independently created transports never see each other.
//!
//! # Usage
//!
//! ```ignore
//! let transport = Arc::new(InProcessTransport::new());
//!
//! let server = Server::start_with_transport(ServerConfig::new("demo"), transport.clone()).await?;
//! let client = Client::start_with_transport(ClientConfig::new("demo"), transport).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

use super::traits::{BoxedConnection, ListenOptions, Listener, Transport, TransportError};

/// Default pipe buffer per direction
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Pending connections queued per endpoint
const BACKLOG: usize = 16;

type Endpoints = Arc<DashMap<String, mpsc::Sender<DuplexStream>>>;

/// In-process transport using tokio duplex pipes
#[derive(Clone, Debug)]
pub struct InProcessTransport {
    endpoints: Endpoints,
    pipe_capacity: usize,
}

impl InProcessTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Create with custom pipe capacity
    #[must_use]
    pub fn with_capacity(pipe_capacity: usize) -> Self {
        Self {
            endpoints: Arc::new(DashMap::new()),
            pipe_capacity,
        }
    }

    fn endpoint_key(name: &str, client_id: u32) -> String {
        if client_id > 0 {
            format!("{name}{client_id}")
        } else {
            name.to_string()
        }
    }

    /// Number of currently bound endpoints
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn connect(&self, name: &str, client_id: u32) -> Result<BoxedConnection, TransportError> {
        let key = Self::endpoint_key(name, client_id);

        // Clone the sender so no map guard is held across the await
        let acceptor = self
            .endpoints
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no listener for {key}")))?;

        let (local, remote) = tokio::io::duplex(self.pipe_capacity);
        acceptor
            .send(remote)
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("listener for {key} is gone")))?;

        Ok(Box::new(local))
    }

    async fn listen(
        &self,
        name: &str,
        client_id: u32,
        _options: ListenOptions,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let key = Self::endpoint_key(name, client_id);
        let (tx, rx) = mpsc::channel(BACKLOG);

        match self.endpoints.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Err(TransportError::AddressInUse(key));
                }
                // Previous listener went away without cleaning up
                entry.insert(tx.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(tx.clone());
            }
        }

        tracing::debug!(endpoint = %key, "In-process endpoint bound");

        Ok(Box::new(InProcessListener {
            key,
            sender: tx,
            incoming: Mutex::new(rx),
            endpoints: Arc::clone(&self.endpoints),
        }))
    }
}

struct InProcessListener {
    key: String,
    sender: mpsc::Sender<DuplexStream>,
    incoming: Mutex<mpsc::Receiver<DuplexStream>>,
    endpoints: Endpoints,
}

#[async_trait]
impl Listener for InProcessListener {
    async fn accept(&self) -> Result<BoxedConnection, TransportError> {
        let stream = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ListenerClosed)?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> String {
        format!("in-process:{}", self.key)
    }
}

impl Drop for InProcessListener {
    fn drop(&mut self) {
        // Only unregister if the endpoint still points at this listener
        self.endpoints
            .remove_if(&self.key, |_, sender| sender.same_channel(&self.sender));
    }
}

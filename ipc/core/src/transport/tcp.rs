//! TCP Transport
//!
//! Loopback or LAN transport over TCP. Endpoint `name`/`client_id` maps to
//! `host:(port(name) + client_id)`, where `port(name)` comes from a
//! [`PortRegistry`] handed to the transport at construction.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};

use super::traits::{BoxedConnection, ListenOptions, Listener, Transport, TransportError};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7100;

/// Width of the window random ports are drawn from, starting at the base port
pub const RANDOM_PORT_SPAN: u16 = 200;

/// Assigns base ports to connection names
///
/// With randomization off every name uses the base port. With it on, each
/// name gets a port drawn once from `[base, base + RANDOM_PORT_SPAN)` and
/// keeps it for the life of the registry, so a server and a client sharing
/// the registry agree on it.
#[derive(Debug)]
pub struct PortRegistry {
    base_port: u16,
    randomize: bool,
    assigned: DashMap<String, u16>,
}

impl PortRegistry {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            randomize: false,
            assigned: DashMap::new(),
        }
    }

    pub fn randomized(base_port: u16) -> Self {
        Self {
            randomize: true,
            ..Self::new(base_port)
        }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Port for `name`, assigning one on first use
    pub fn port_for(&self, name: &str) -> u16 {
        if !self.randomize {
            return self.base_port;
        }
        *self.assigned.entry(name.to_string()).or_insert_with(|| {
            let span = RANDOM_PORT_SPAN.min(u16::MAX - self.base_port).max(1);
            self.base_port + rand::thread_rng().gen_range(0..span)
        })
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

/// TCP transport
#[derive(Clone, Debug)]
pub struct TcpTransport {
    host: String,
    registry: Arc<PortRegistry>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, registry: Arc<PortRegistry>) -> Self {
        Self {
            host: host.into(),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    /// Address for an endpoint
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidState` if the port would overflow.
    pub fn address(&self, name: &str, client_id: u32) -> Result<String, TransportError> {
        let port = u32::from(self.registry.port_for(name)) + client_id;
        let port = u16::try_from(port).map_err(|_| {
            TransportError::InvalidState(format!("client id {client_id} exceeds the port range"))
        })?;
        Ok(format!("{}:{port}", self.host))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, Arc::new(PortRegistry::default()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, name: &str, client_id: u32) -> Result<BoxedConnection, TransportError> {
        let addr = self.address(name, client_id)?;
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to connect to {addr}: {e}"))
        })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn listen(
        &self,
        name: &str,
        client_id: u32,
        _options: ListenOptions,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let addr = self.address(name, client_id)?;
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(addr.clone())
            } else {
                TransportError::IoError(e)
            }
        })?;
        tracing::debug!(addr = %addr, "Listening on TCP");
        Ok(Box::new(TcpSocketListener { listener, addr }))
    }
}

struct TcpSocketListener {
    listener: TcpListener,
    addr: String,
}

#[async_trait]
impl Listener for TcpSocketListener {
    async fn accept(&self) -> Result<BoxedConnection, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::trace!(peer = %peer, "Accepted TCP connection");
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

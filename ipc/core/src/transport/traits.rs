//! Transport Traits
//!
//! The capability the connection engine needs from a backend: dial a named
//! endpoint, bind a named endpoint, and accept byte streams on it. Reading,
//! writing and closing go through the returned stream's `AsyncRead` /
//! `AsyncWrite` implementation; dropping a stream or a listener closes it.

use std::fmt;
use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream produced by a transport
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConnection = Box<dyn Connection>;

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to peer failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Endpoint is already bound by another listener
    #[error("Address in use: {0}")]
    AddressInUse(String),

    /// Listener was shut down
    #[error("Listener closed")]
    ListenerClosed,

    /// IO error from underlying transport
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Per-listener options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Make the endpoint accessible to every local user
    pub unmask_permissions: bool,
}

/// Backend used by clients and servers to reach each other
///
/// `client_id` is `0` for single-client endpoints and the pool-assigned
/// identifier for per-client endpoints; implementations derive a distinct
/// address from it.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Dial the endpoint for `name`/`client_id`
    async fn connect(&self, name: &str, client_id: u32) -> Result<BoxedConnection, TransportError>;

    /// Bind the endpoint for `name`/`client_id`
    async fn listen(
        &self,
        name: &str,
        client_id: u32,
        options: ListenOptions,
    ) -> Result<Box<dyn Listener>, TransportError>;
}

/// A bound endpoint
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next incoming connection
    async fn accept(&self) -> Result<BoxedConnection, TransportError>;

    /// Where this listener is bound, for logging
    fn local_addr(&self) -> String;
}

//! Transport Layer
//!
//! Provides abstraction over different transport mechanisms:
//! - `InProcess`: duplex pipes inside one process (embedding, tests)
//! - `UnixSocket`: local IPC via Unix domain sockets
//! - `Tcp`: TCP sockets with an explicit port registry
//!
//! The connection engine only sees the [`Transport`] and [`Listener`]
//! traits; the backend is picked at startup from [`TransportType`].
//!
//! # Security
//!
//! - Socket files are created with 0600 permissions
//! - TCP binds loopback by default

pub mod config;
pub mod factory;
pub mod in_process;
pub mod tcp;
pub mod traits;
#[cfg(unix)]
pub mod unix_socket;

// Re-exports for convenience
pub use config::TransportType;
pub use factory::create_transport;
pub use in_process::InProcessTransport;
pub use tcp::{PortRegistry, TcpTransport};
pub use traits::{
    BoxedConnection, Connection, ListenOptions, Listener, Transport, TransportError,
};

#[cfg(unix)]
pub use unix_socket::UnixSocketTransport;

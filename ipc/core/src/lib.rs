//! IPC Core - Message-Oriented Connection Engine
//!
//! Connects one server process to one or more client processes over a
//! pluggable byte-stream transport. Applications exchange typed messages;
//! the crate handles framing, the connection handshake, optional encryption,
//! client reconnection and per-client connection pooling.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                      ┌──────────────────────┐
//! │        Client        │                      │        Server        │
//! │  dial / reconnect    │                      │  listen / accept     │
//! │  ┌────────────────┐  │                      │  ┌────────────────┐  │
//! │  │     Actor      │  │   [len][type|data]   │  │     Actor      │  │
//! │  │ read loop  ◄───┼──┼──────────────────────┼──┼─── write loop  │  │
//! │  │ write loop ────┼──┼──────────────────────┼──┼──► read loop   │  │
//! │  └────────────────┘  │                      │  └────────────────┘  │
//! └──────────┬───────────┘                      └──────────┬───────────┘
//!            │                 Transport                   │
//!            └────── Unix socket │ TCP │ in-process ───────┘
//! ```
//!
//! # Key Types
//!
//! - [`Server`] / [`Client`]: the two ends of a link
//! - [`Message`]: user data or an internal status/error notification
//! - [`Status`]: connection state, announced on every change
//! - [`ConnectionPool`]: per-client endpoints behind one pooled server
//! - [`Transport`]: the backend capability, see [`transport`]
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use ipc_core::{Client, ClientConfig, InProcessTransport, Server, ServerConfig};
//!
//! let transport = Arc::new(InProcessTransport::new());
//! let server = Server::start_with_transport(ServerConfig::new("demo"), transport.clone()).await?;
//! let client = Client::start_with_transport(ClientConfig::new("demo"), transport).await?;
//!
//! client.write(7, "ping").await?;
//! loop {
//!     let msg = server.read().await?;
//!     if msg.msg_type == 7 {
//!         break;
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`status`]: connection states and legal transitions
//! - [`message`]: the unit delivered by `read`
//! - [`frame`]: wire framing
//! - [`handshake`]: per-connection negotiation
//! - [`crypto`]: session cipher and key agreement
//! - [`transport`]: Unix socket, TCP and in-process backends
//! - [`pool`]: multi-client pooling
//! - [`config`]: typed configuration, TOML and environment loading
//! - [`logging`]: `tracing` subscriber setup

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod actor;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod logging;
pub mod message;
pub mod pool;
pub mod server;
pub mod status;
pub mod transport;

// Re-exports for convenience
pub use client::Client;
pub use config::{
    load_config_from_path, ClientConfig, ConfigError, ConfigSource, IpcConfigFile, LogLevel,
    ServerConfig,
};
pub use crypto::{AesGcmCipher, Cipher, CryptoError, KeyExchange};
pub use error::{HandshakeError, IpcError};
pub use logging::init_logging;
pub use message::{Message, MessageKind};
pub use pool::ConnectionPool;
pub use server::Server;
pub use status::Status;
pub use transport::{
    create_transport, InProcessTransport, Listener, TcpTransport, Transport, TransportError,
    TransportType,
};

#[cfg(unix)]
pub use transport::UnixSocketTransport;

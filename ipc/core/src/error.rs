//! Error types for the connection engine

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::status::Status;
use crate::transport::TransportError;

/// Errors surfaced by clients, servers and the pool
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("ipc name cannot be an empty string")]
    EmptyName,

    #[error("message type {0} is reserved")]
    ReservedType(i32),

    #[error("message exceeds maximum message length ({size} > {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("cannot write under current status: {0}")]
    InvalidStatus(Status),

    #[error("gave up waiting to write while {0}")]
    NotReady(Status),

    #[error("the received channel has been closed")]
    ChannelClosed,

    #[error("timed out trying to connect")]
    ConnectTimeout,

    #[error("timed out trying to re-connect")]
    ReconnectTimeout,

    #[error("client has closed the connection")]
    ClientClosed,

    #[error("server has closed the connection")]
    ServerClosed,

    #[error("connection is closing")]
    Closing,

    /// Payload of the sentinel message returned by a timed read
    #[error("timed_out")]
    TimedOut,

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures of the connection handshake, from either side
#[derive(Debug, Error)]
pub enum HandshakeError {
    // Detected by the server
    #[error("unable to send handshake")]
    SendFailed(#[source] io::Error),

    #[error("failed to receive handshake reply")]
    ReplyFailed(#[source] io::Error),

    #[error("client has a different VERSION number")]
    VersionMismatch,

    #[error("client and server disagree on encryption")]
    EncryptionMismatch,

    #[error("client failed to read the handshake")]
    ClientReadFailed,

    #[error("other error - handshake failed (reply {0})")]
    Unknown(u8),

    #[error("unable to send max message length")]
    MaxLengthSendFailed(#[source] io::Error),

    #[error("did not receive message length reply")]
    MaxLengthReplyFailed(#[source] io::Error),

    // Detected by the client
    #[error("connection refused by server")]
    Refused,

    #[error("failed to receive handshake message")]
    ReceiveFailed(#[source] io::Error),

    #[error("server has sent a different VERSION number (server {server}, client {client})")]
    ServerVersionMismatch { server: u8, client: u8 },

    #[error("server encryption policy does not match (server {server}, client {client})")]
    ServerEncryptionMismatch { server: bool, client: bool },

    #[error("failed to receive max message length")]
    MaxLengthReceiveFailed,

    #[error("unable to reply to handshake")]
    ReplySendFailed(#[source] io::Error),

    // Either side
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    #[error("handshake timed out")]
    TimedOut,
}

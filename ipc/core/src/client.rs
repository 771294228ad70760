//! Client
//!
//! Dials a named server, keeps the connection alive across peer restarts and
//! exposes the actor's read/write API.
//!
//! # Dialing
//!
//! `dial` retries the transport every retry interval until the handshake
//! completes. With a timeout configured the whole attempt loop is bounded by
//! it; dropping the loop on expiry also discards an attempt still in flight.
//!
//! # Reconnecting
//!
//! When the read loop sees the peer go away the client moves to ReConnecting
//! and dials again with the same timeout. The old connection is shut down
//! first, so a server that is still alive sees the hang-up. The write loop is
//! kept; messages queued before the loss are sent on the new connection or
//! dropped. A reconnect that times out is terminal.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::actor::{Actor, ConnectionHandle, ReadExit, Role};
use crate::config::{check_name, ClientConfig};
use crate::error::{HandshakeError, IpcError};
use crate::handshake::{self, Negotiated};
use crate::message::Message;
use crate::pool;
use crate::status::Status;
use crate::transport::{create_transport, BoxedConnection, Transport};

struct ClientInner {
    actor: Arc<Actor>,
    config: ClientConfig,
    client_id: u32,
    transport: Arc<dyn Transport>,
}

/// Connected end of an IPC link
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect using the transport named in `config`
    ///
    /// # Errors
    ///
    /// Fails on an empty name, an unusable transport selection, a dial
    /// timeout or a handshake error.
    pub async fn start(config: ClientConfig) -> Result<Self, IpcError> {
        let transport = create_transport(&config.transport)?;
        Self::start_with_transport(config, transport).await
    }

    /// Connect over an existing transport
    ///
    /// With `multi_client` set this first asks the server's pool manager for a
    /// client id and then connects to that client's dedicated endpoint.
    ///
    /// # Errors
    ///
    /// Same as [`Client::start`].
    pub async fn start_with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, IpcError> {
        check_name(&config.name)?;
        if config.multi_client {
            return pool::start_client_pool(config, transport).await;
        }
        Self::start_with_id(config, transport, 0).await
    }

    /// Connect to the endpoint for `client_id`
    pub(crate) async fn start_with_id(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        client_id: u32,
    ) -> Result<Self, IpcError> {
        check_name(&config.name)?;

        // Ceiling is replaced by the server's value during the handshake
        let actor = Actor::new(Role::Client, format!("Client({client_id})"), 0);
        let client = Self {
            inner: Arc::new(ClientInner {
                actor,
                config,
                client_id,
                transport,
            }),
        };

        client.connect().await?;
        Ok(client)
    }

    async fn connect(&self) -> Result<(), IpcError> {
        let actor = &self.inner.actor;
        actor.dispatch_status(Status::Connecting);

        match self.dial().await {
            Ok((conn, negotiated)) => {
                tracing::info!(
                    client = %self,
                    name = %self.inner.config.name,
                    encrypted = negotiated.cipher.is_some(),
                    max_msg_size = negotiated.max_msg_size,
                    "Connected to server"
                );
                self.attach(conn, negotiated);
                Ok(())
            }
            Err(e) => {
                let status = match e {
                    IpcError::ConnectTimeout => Status::Timeout,
                    _ => Status::Error,
                };
                actor.report("connect", &e);
                actor.dispatch_status(status);
                actor.close_channels();
                Err(e)
            }
        }
    }

    /// Dial until connected and handshaken, bounded by the configured timeout
    async fn dial(&self) -> Result<(BoxedConnection, Negotiated), IpcError> {
        match self.inner.config.dial_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.dial_attempts())
                .await
                .unwrap_or(Err(IpcError::ConnectTimeout)),
            None => self.dial_attempts().await,
        }
    }

    async fn dial_attempts(&self) -> Result<(BoxedConnection, Negotiated), IpcError> {
        let inner = &self.inner;
        let retry = inner.config.effective_retry_interval();

        loop {
            if inner.actor.is_closing() {
                return Err(IpcError::Closing);
            }

            match inner
                .transport
                .connect(&inner.config.name, inner.client_id)
                .await
            {
                Ok(mut conn) => {
                    match handshake::client_handshake(&mut conn, inner.config.encryption).await {
                        Ok(negotiated) => return Ok((conn, negotiated)),
                        Err(HandshakeError::Refused) => {
                            tracing::trace!(client = %self, "Server busy, retrying");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    tracing::trace!(client = %self, error = %e, "Dial attempt failed");
                }
            }

            tokio::time::sleep(retry).await;
        }
    }

    /// Install a fresh connection and start reading from it
    fn attach(&self, conn: BoxedConnection, negotiated: Negotiated) {
        let actor = &self.inner.actor;
        actor.set_max_msg_size(negotiated.max_msg_size);
        let (reader, handle) = actor.install(conn, negotiated.cipher);

        if !actor.dispatch_status(Status::Connected) {
            // Closed while the dial was finishing
            drop(reader);
            let actor = Arc::clone(actor);
            tokio::spawn(async move {
                actor.release(&handle).await;
                actor.finish_close();
            });
            return;
        }
        actor.ensure_write_loop();

        let client = self.clone();
        tokio::spawn(async move {
            let exit = client.inner.actor.read_loop(reader, &handle).await;
            client.on_read_exit(exit, &handle).await;
        });
    }

    async fn on_read_exit(&self, exit: ReadExit, handle: &Arc<ConnectionHandle>) {
        let actor = &self.inner.actor;
        match &exit {
            ReadExit::Failed(e) => actor.report("read", e),
            ReadExit::Protocol(reason) => actor.report("read", reason),
            ReadExit::Shutdown | ReadExit::PeerClosed => {}
        }
        if !matches!(exit, ReadExit::Shutdown) {
            actor.release(handle).await;
        }

        if actor.is_closing() {
            actor.finish_close();
            return;
        }
        self.reconnect().await;
    }

    async fn reconnect(&self) {
        let actor = &self.inner.actor;
        if !actor.dispatch_status(Status::ReConnecting) {
            if actor.is_closing() {
                actor.finish_close();
            }
            return;
        }
        tracing::info!(client = %self, "Connection lost, reconnecting");

        tokio::time::sleep(self.inner.config.effective_retry_interval()).await;

        match self.dial().await {
            Ok((conn, negotiated)) => {
                tracing::info!(client = %self, "Reconnected to server");
                self.attach(conn, negotiated);
            }
            Err(_) if actor.is_closing() => actor.finish_close(),
            Err(IpcError::ConnectTimeout) => {
                actor.dispatch_failure(Status::Timeout, IpcError::ReconnectTimeout);
            }
            Err(e) => actor.dispatch_failure(Status::Error, e),
        }
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Wait for the next message
    ///
    /// Status changes arrive as internal messages. An error message is
    /// returned as `Err` and closes the client's queues.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` once the client has been torn down, or the error
    /// carried by the next message.
    pub async fn read(&self) -> Result<Message, IpcError> {
        self.inner.actor.read().await
    }

    /// Like [`Client::read`], returning [`Message::timed_out`] after `timeout`
    ///
    /// # Errors
    ///
    /// Same as [`Client::read`].
    pub async fn read_timed(&self, timeout: Duration) -> Result<Message, IpcError> {
        self.inner.actor.read_timed(timeout).await
    }

    /// Queue a message for the server
    ///
    /// # Errors
    ///
    /// Rejects reserved types, payloads above the negotiated ceiling and
    /// writes in a status other than Connected.
    pub async fn write(&self, msg_type: i32, data: impl Into<Vec<u8>>) -> Result<(), IpcError> {
        self.inner.actor.write(msg_type, data.into()).await
    }

    /// Queue a copy of `msg`
    ///
    /// # Errors
    ///
    /// Same as [`Client::write`].
    pub async fn write_message(&self, msg: &Message) -> Result<(), IpcError> {
        self.write(msg.msg_type, msg.data.clone()).await
    }

    /// Close the connection
    ///
    /// Consumers observe Closing, then Closed followed by a "client has
    /// closed the connection" error. Calling it again has no effect.
    pub async fn close(&self) {
        if self.inner.actor.close().await {
            tracing::info!(client = %self, "Client closed");
        }
    }

    pub fn status(&self) -> Status {
        self.inner.actor.status()
    }

    pub fn status_str(&self) -> &'static str {
        self.status().as_str()
    }

    /// Identity assigned by the pool manager, `0` outside pooled mode
    pub fn client_id(&self) -> u32 {
        self.inner.client_id
    }

    /// Largest payload the server accepts
    pub fn max_msg_size(&self) -> usize {
        self.inner.actor.max_msg_size()
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.actor, f)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.config.name)
            .field("client_id", &self.inner.client_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessTransport, TransportType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(name: &str) -> ClientConfig {
        ClientConfig::new(name)
            .with_encryption(false)
            .with_timeout(Duration::from_millis(200))
            .with_retry_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let transport = Arc::new(InProcessTransport::new());
        let result = Client::start_with_transport(ClientConfig::new(""), transport).await;
        assert!(matches!(result, Err(IpcError::EmptyName)));
    }

    #[tokio::test]
    async fn test_in_process_needs_shared_transport() {
        let cfg = config("shared").with_transport(TransportType::InProcess);
        assert!(matches!(
            Client::start(cfg).await,
            Err(IpcError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_times_out_without_server() {
        let transport = Arc::new(InProcessTransport::new());
        let result = Client::start_with_transport(config("nobody"), transport).await;
        assert!(matches!(result, Err(IpcError::ConnectTimeout)));
    }

    #[tokio::test]
    async fn test_handshake_error_is_not_retried() {
        let transport = Arc::new(InProcessTransport::new());
        let listener = transport
            .listen("bad-version", 0, Default::default())
            .await
            .unwrap();

        let fake_server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            conn.write_all(&[handshake::PROTOCOL_VERSION + 1, 0])
                .await
                .unwrap();
            // Hold the connection until the client has replied
            let mut reply = [0u8; 1];
            let _ = conn.read_exact(&mut reply).await;
        });

        let cfg = config("bad-version").with_timeout(Duration::from_secs(5));
        let result = Client::start_with_transport(cfg, transport).await;
        assert!(matches!(
            result,
            Err(IpcError::Handshake(HandshakeError::ServerVersionMismatch { .. }))
        ));
        fake_server.await.unwrap();
    }

    /// Connect a client to a hand-driven listener, returning both ends
    async fn fake_server_pair(
        name: &str,
    ) -> (Client, Box<dyn crate::transport::Listener>, BoxedConnection) {
        let transport = Arc::new(InProcessTransport::new());
        let listener = transport.listen(name, 0, Default::default()).await.unwrap();

        let cfg = config(name).with_timeout(Duration::from_secs(5));
        let connecting = tokio::spawn(Client::start_with_transport(cfg, transport));
        let mut conn = listener.accept().await.unwrap();
        handshake::server_handshake(&mut conn, false, 1024)
            .await
            .unwrap();
        let client = connecting.await.unwrap().unwrap();
        assert_eq!(client.status(), Status::Connected);
        (client, listener, conn)
    }

    async fn expect_hang_up(conn: &mut BoxedConnection) {
        let mut rest = Vec::new();
        let eof = tokio::time::timeout(Duration::from_secs(2), conn.read_to_end(&mut rest)).await;
        assert!(eof.is_ok(), "connection still open 2s later");
    }

    #[tokio::test]
    async fn test_close_during_redial_hangs_up() {
        let (client, listener, first) = fake_server_pair("late").await;

        // Losing the server sends the client back to dialing
        drop(first);
        let mut second = listener.accept().await.unwrap();

        client.close().await;
        assert_eq!(client.status(), Status::Closed);

        // The redial completes after the close and must not be kept
        handshake::server_handshake(&mut second, false, 1024)
            .await
            .unwrap();
        expect_hang_up(&mut second).await;
        assert_eq!(client.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_connection_and_redials() {
        let (client, listener, mut first) = fake_server_pair("flood").await;

        first.write_all(&100_000u32.to_be_bytes()).await.unwrap();
        expect_hang_up(&mut first).await;

        let redial = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(matches!(redial, Ok(Ok(_))), "client did not dial again");
        client.close().await;
    }
}

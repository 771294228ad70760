//! Server
//!
//! Binds a named endpoint and serves one client connection at a time. While a
//! client is connected further connections are dropped unanswered, which the
//! dialing client treats as "busy" and retries. When the client goes away the
//! server moves to Disconnected and accepts the next one.
//!
//! A failed handshake is terminal: the server moves to Error and stops
//! listening.
//!
//! For several simultaneous clients start the server with `multi_client`,
//! see [`crate::pool`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::actor::{Actor, ConnectionHandle, ReadExit, Role};
use crate::config::{check_name, ServerConfig};
use crate::crypto::Cipher;
use crate::error::IpcError;
use crate::handshake;
use crate::message::Message;
use crate::pool::{self, ConnectionPool};
use crate::status::Status;
use crate::transport::{
    create_transport, BoxedConnection, ListenOptions, Listener, Transport, TransportError,
};

/// Pause after an accept error before accepting again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

struct ServerInner {
    actor: Arc<Actor>,
    config: ServerConfig,
    client_id: u32,
    listener_shutdown: watch::Sender<bool>,
    /// Set on the primary member of a pooled server
    pool: Mutex<Option<Arc<ConnectionPool>>>,
}

/// Listening end of an IPC link
///
/// Cheap to clone; every clone drives the same endpoint.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Listen using the transport named in `config`
    ///
    /// # Errors
    ///
    /// Fails on an empty name, an unusable transport selection or when the
    /// endpoint cannot be bound.
    pub async fn start(config: ServerConfig) -> Result<Self, IpcError> {
        let transport = create_transport(&config.transport)?;
        Self::start_with_transport(config, transport).await
    }

    /// Listen over an existing transport
    ///
    /// With `multi_client` set this starts a connection pool and returns its
    /// primary member (client id 1).
    ///
    /// # Errors
    ///
    /// Same as [`Server::start`].
    pub async fn start_with_transport(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, IpcError> {
        check_name(&config.name)?;
        if config.multi_client {
            return pool::start_server_pool(config, transport).await;
        }
        Self::run(config, transport, 0).await
    }

    /// Bind the endpoint for `client_id` and start accepting
    pub(crate) async fn run(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        client_id: u32,
    ) -> Result<Self, IpcError> {
        check_name(&config.name)?;

        let label = if client_id == 0 {
            format!("Server({})", config.name)
        } else {
            format!("Server({}{client_id})", config.name)
        };
        let actor = Actor::new(Role::Server, label, config.effective_max_msg_size());

        let options = ListenOptions {
            unmask_permissions: config.unmask_permissions,
        };
        let listener = transport.listen(&config.name, client_id, options).await?;

        let server = Self {
            inner: Arc::new(ServerInner {
                actor,
                config,
                client_id,
                listener_shutdown: watch::Sender::new(false),
                pool: Mutex::new(None),
            }),
        };

        server.inner.actor.dispatch_status(Status::Listening);
        tracing::info!(server = %server, address = %listener.local_addr(), "Listening");

        tokio::spawn(server.clone().accept_loop(listener));
        Ok(server)
    }

    async fn accept_loop(self, listener: Box<dyn Listener>) {
        let actor = &self.inner.actor;
        let mut shutdown = self.inner.listener_shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => accepted,
            };

            let mut conn = match accepted {
                Ok(conn) => conn,
                Err(TransportError::ListenerClosed) => break,
                Err(e) => {
                    actor.report("accept", &e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let status = actor.status();
            if !matches!(status, Status::Listening | Status::Disconnected) {
                tracing::debug!(server = %self, "Busy, dropping extra connection");
                continue;
            }

            // Dropping `conn` on shutdown hangs up on the peer mid-handshake
            let negotiated = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                negotiated = handshake::server_handshake(
                    &mut conn,
                    self.inner.config.encryption,
                    actor.max_msg_size(),
                ) => negotiated,
            };

            match negotiated {
                Ok(cipher) => self.attach(conn, cipher),
                Err(e) => {
                    actor.dispatch_failure(Status::Error, e.into());
                    break;
                }
            }
        }

        tracing::debug!(server = %self, "Accept loop finished");
    }

    fn attach(&self, conn: BoxedConnection, cipher: Option<Arc<dyn Cipher>>) {
        let actor = &self.inner.actor;
        let encrypted = cipher.is_some();
        let (reader, handle) = actor.install(conn, cipher);

        if !actor.dispatch_status(Status::Connected) {
            // Closed while the handshake was finishing
            drop(reader);
            let actor = Arc::clone(actor);
            tokio::spawn(async move {
                actor.release(&handle).await;
                if actor.is_closing() {
                    actor.finish_close();
                }
            });
            return;
        }
        tracing::info!(server = %self, encrypted, "Client connected");
        actor.ensure_write_loop();

        let server = self.clone();
        tokio::spawn(async move {
            let exit = server.inner.actor.read_loop(reader, &handle).await;
            server.on_read_exit(exit, &handle).await;
        });
    }

    async fn on_read_exit(&self, exit: ReadExit, handle: &Arc<ConnectionHandle>) {
        let actor = &self.inner.actor;
        match &exit {
            ReadExit::Failed(e) => actor.report("read", e),
            ReadExit::Protocol(reason) => actor.report("read", reason),
            ReadExit::Shutdown | ReadExit::PeerClosed => {}
        }
        // The peer only learns about a read fault once the write half goes
        if !matches!(exit, ReadExit::Shutdown) {
            actor.release(handle).await;
        }

        if actor.is_closing() {
            actor.finish_close();
        } else if actor.dispatch_status(Status::Disconnected) {
            tracing::info!(server = %self, "Client disconnected");
        }
    }

    pub(crate) fn set_pool(&self, pool: Arc<ConnectionPool>) {
        *self.inner.pool.lock() = Some(pool);
    }

    /// Stop listening and close this endpoint only
    pub(crate) async fn close_endpoint(&self) {
        self.inner.listener_shutdown.send_replace(true);
        if self.inner.actor.close().await {
            tracing::info!(server = %self, "Server closed");
        }
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Wait for the next message from the connected client
    ///
    /// # Errors
    ///
    /// `ChannelClosed` once torn down, or the error carried by the next
    /// message.
    pub async fn read(&self) -> Result<Message, IpcError> {
        self.inner.actor.read().await
    }

    /// Like [`Server::read`], returning [`Message::timed_out`] after `timeout`
    ///
    /// # Errors
    ///
    /// Same as [`Server::read`].
    pub async fn read_timed(&self, timeout: Duration) -> Result<Message, IpcError> {
        self.inner.actor.read_timed(timeout).await
    }

    /// Queue a message for the connected client
    ///
    /// Written before any client has connected, the call waits for one.
    ///
    /// # Errors
    ///
    /// Rejects reserved types, payloads above the configured ceiling and
    /// writes in a status other than Listening or Connected.
    pub async fn write(&self, msg_type: i32, data: impl Into<Vec<u8>>) -> Result<(), IpcError> {
        self.inner.actor.write(msg_type, data.into()).await
    }

    /// Queue a copy of `msg`
    ///
    /// # Errors
    ///
    /// Same as [`Server::write`].
    pub async fn write_message(&self, msg: &Message) -> Result<(), IpcError> {
        self.write(msg.msg_type, msg.data.clone()).await
    }

    /// Stop listening and close the connection
    ///
    /// On a pooled server this closes every member of the pool.
    pub async fn close(&self) {
        let pool = self.inner.pool.lock().take();
        match pool {
            Some(pool) => pool.close().await,
            None => self.close_endpoint().await,
        }
    }

    pub fn status(&self) -> Status {
        self.inner.actor.status()
    }

    pub fn status_str(&self) -> &'static str {
        self.status().as_str()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Pool slot served by this endpoint, `0` outside pooled mode
    pub fn client_id(&self) -> u32 {
        self.inner.client_id
    }

    /// The pool this server is the primary member of
    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.inner.pool.lock().clone()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.inner.actor.is_closing()
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.actor, f)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.config.name)
            .field("client_id", &self.inner.client_id)
            .field("status", &self.status())
            .finish()
    }
}

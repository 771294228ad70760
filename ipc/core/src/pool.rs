//! Connection Pool
//!
//! Serves many clients under one name by giving each client its own server
//! endpoint.
//!
//! ```text
//!   slot 0   "<name>_manager"   hands out client ids
//!   slot 1   "<name>" id 1      bound at start, first client
//!   slot n   "<name>" id n      bound when the n-th id is handed out
//! ```
//!
//! A pooled client first connects to the manager, sends
//! [`CLIENT_CONNECT_MSG_TYPE`] with [`CLIENT_ID_REQUEST`], reads back its id as
//! a big-endian `u32`, drops the manager connection and dials the endpoint for
//! that id. The manager binds the endpoint before replying, so the dial finds
//! it. Ids are handed out once, in increasing order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::Client;
use crate::config::{ClientConfig, ServerConfig};
use crate::error::IpcError;
use crate::message::Message;
use crate::server::Server;
use crate::transport::Transport;

/// Message type of id requests and replies on the manager connection
pub const CLIENT_CONNECT_MSG_TYPE: i32 = 12;

/// Payload of an id request
pub const CLIENT_ID_REQUEST: &[u8] = b"client_id_request";

/// How long a client waits per poll for its id
const CLIENT_ID_POLL: Duration = Duration::from_secs(5);

const MANAGER_SUFFIX: &str = "_manager";

fn manager_name(name: &str) -> String {
    format!("{name}{MANAGER_SUFFIX}")
}

/// Servers making up one pooled endpoint
///
/// Slot 0 is the manager and is left out of the read operations.
pub struct ConnectionPool {
    servers: Mutex<Vec<Server>>,
    closing: AtomicBool,
}

impl ConnectionPool {
    fn new(manager: Server, primary: Server) -> Self {
        Self {
            servers: Mutex::new(vec![manager, primary]),
            closing: AtomicBool::new(false),
        }
    }

    /// Append a member, refused once the pool is closing
    fn push(&self, server: Server) -> Result<(), Server> {
        let mut servers = self.servers.lock();
        if self.closing.load(Ordering::SeqCst) {
            return Err(server);
        }
        servers.push(server);
        Ok(())
    }

    /// Every member, manager included
    pub fn servers(&self) -> Vec<Server> {
        self.servers.lock().clone()
    }

    /// Members serving clients
    pub fn members(&self) -> Vec<Server> {
        self.servers.lock().iter().skip(1).cloned().collect()
    }

    /// Number of members serving clients
    pub fn len(&self) -> usize {
        self.servers.lock().len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read once from every member and pass each result to `callback`
    ///
    /// Returns when every member has produced a message.
    pub async fn read<F>(&self, callback: F)
    where
        F: Fn(&Server, Result<Message, IpcError>),
    {
        let members = self.members();
        let callback = &callback;
        let reads = members.iter().map(|server| async move {
            let result = server.read().await;
            callback(server, result);
        });
        join_all(reads).await;
    }

    /// Like [`ConnectionPool::read`] with a per-member deadline
    pub async fn read_timed<F>(&self, timeout: Duration, callback: F)
    where
        F: Fn(&Server, Result<Message, IpcError>),
    {
        let members = self.members();
        let callback = &callback;
        let reads = members.iter().map(|server| async move {
            let result = server.read_timed(timeout).await;
            callback(server, result);
        });
        join_all(reads).await;
    }

    /// Timed read on every member, returning after the first callback ran
    ///
    /// The remaining reads keep running in the background and still reach
    /// `callback`.
    pub async fn read_timed_fastest<F>(&self, timeout: Duration, callback: F)
    where
        F: Fn(&Server, Result<Message, IpcError>) + Send + Sync + 'static,
    {
        let members = self.members();
        let callback = Arc::new(callback);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(members.len().max(1));

        for server in members {
            let callback = Arc::clone(&callback);
            let done = done_tx.clone();
            tokio::spawn(async move {
                let result = server.read_timed(timeout).await;
                callback(&server, result);
                let _ = done.try_send(());
            });
        }
        drop(done_tx);

        let _ = done_rx.recv().await;
    }

    /// Close every member, the primary last
    pub async fn close(&self) {
        let servers = {
            let servers = self.servers.lock();
            self.closing.store(true, Ordering::SeqCst);
            servers.clone()
        };

        let others = servers
            .iter()
            .enumerate()
            .filter(|(slot, _)| *slot != 1)
            .map(|(_, server)| server.close_endpoint());
        join_all(others).await;

        if let Some(primary) = servers.get(1) {
            primary.close_endpoint().await;
        }
        tracing::info!(members = servers.len(), "Connection pool closed");
    }
}

/// Start the manager and the first member, returning the first member
pub(crate) async fn start_server_pool(
    config: ServerConfig,
    transport: Arc<dyn Transport>,
) -> Result<Server, IpcError> {
    let manager_config = ServerConfig {
        name: manager_name(&config.name),
        multi_client: false,
        ..config.clone()
    };
    let manager = Server::run(manager_config, Arc::clone(&transport), 0).await?;

    let primary = match Server::run(config.clone(), Arc::clone(&transport), 1).await {
        Ok(primary) => primary,
        Err(e) => {
            manager.close_endpoint().await;
            return Err(e);
        }
    };

    let pool = Arc::new(ConnectionPool::new(manager.clone(), primary.clone()));
    primary.set_pool(Arc::clone(&pool));
    tokio::spawn(register_clients(manager, pool, config, transport));

    Ok(primary)
}

/// Answer id requests on the manager until it closes
async fn register_clients(
    manager: Server,
    pool: Arc<ConnectionPool>,
    config: ServerConfig,
    transport: Arc<dyn Transport>,
) {
    let mut next_id: u32 = 1;

    loop {
        let msg = match manager.read().await {
            Ok(msg) => msg,
            Err(IpcError::ChannelClosed) => break,
            Err(_) if manager.is_closing() || manager.status().is_terminal() => break,
            Err(e) => {
                tracing::debug!(manager = %manager, error = %e, "Manager error");
                continue;
            }
        };

        if let Some(status) = msg.status {
            if status.is_terminal() {
                break;
            }
            continue;
        }
        if msg.msg_type != CLIENT_CONNECT_MSG_TYPE || msg.data != CLIENT_ID_REQUEST {
            tracing::debug!(manager = %manager, msg_type = msg.msg_type, "Ignoring message");
            continue;
        }

        let id = next_id;
        if id > 1 {
            let server = match Server::run(config.clone(), Arc::clone(&transport), id).await {
                Ok(server) => server,
                Err(e) => {
                    tracing::error!(client_id = id, error = %e, "Failed to start pool member");
                    continue;
                }
            };
            if let Err(server) = pool.push(server) {
                server.close_endpoint().await;
                break;
            }
        }
        next_id += 1;

        tracing::info!(client_id = id, "Assigned client id");
        if let Err(e) = manager
            .write(CLIENT_CONNECT_MSG_TYPE, id.to_be_bytes().to_vec())
            .await
        {
            tracing::warn!(client_id = id, error = %e, "Failed to send client id");
        }
    }

    tracing::debug!("Pool registration finished");
}

/// Obtain an id from the manager, then connect to that id's endpoint
pub(crate) async fn start_client_pool(
    config: ClientConfig,
    transport: Arc<dyn Transport>,
) -> Result<Client, IpcError> {
    let manager_config = ClientConfig {
        name: manager_name(&config.name),
        multi_client: false,
        ..config.clone()
    };
    let manager = Client::start_with_id(manager_config, Arc::clone(&transport), 0).await?;

    let id = request_client_id(&manager, config.dial_timeout()).await;
    manager.close().await;
    let id = id?;

    tracing::debug!(client_id = id, name = %config.name, "Received client id");
    Client::start_with_id(config, transport, id).await
}

async fn request_client_id(manager: &Client, limit: Option<Duration>) -> Result<u32, IpcError> {
    manager
        .write(CLIENT_CONNECT_MSG_TYPE, CLIENT_ID_REQUEST)
        .await?;

    let deadline = limit.map(|limit| Instant::now() + limit);
    loop {
        let poll = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(IpcError::ConnectTimeout);
                }
                remaining.min(CLIENT_ID_POLL)
            }
            None => CLIENT_ID_POLL,
        };

        let msg = manager.read_timed(poll).await?;
        if msg.is_timeout() {
            tracing::debug!("Still waiting for a client id");
            continue;
        }
        if msg.msg_type != CLIENT_CONNECT_MSG_TYPE {
            continue;
        }

        let bytes: [u8; 4] = msg.data.as_slice().try_into().map_err(|_| {
            IpcError::Protocol(format!("client id reply of {} bytes", msg.data.len()))
        })?;
        return Ok(u32::from_be_bytes(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use crate::transport::InProcessTransport;
    use std::collections::BTreeSet;

    fn server_config(name: &str) -> ServerConfig {
        ServerConfig::new(name)
            .with_encryption(false)
            .with_multi_client(true)
    }

    fn client_config(name: &str) -> ClientConfig {
        ClientConfig::new(name)
            .with_encryption(false)
            .with_multi_client(true)
            .with_timeout(Duration::from_secs(10))
            .with_retry_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_manager_name() {
        assert_eq!(manager_name("svc"), "svc_manager");
    }

    #[tokio::test]
    async fn test_pool_starts_manager_and_primary() {
        let transport = Arc::new(InProcessTransport::new());
        let primary = Server::start_with_transport(server_config("pooled"), transport.clone())
            .await
            .unwrap();

        assert_eq!(primary.client_id(), 1);
        let pool = primary.pool().expect("primary holds the pool");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.servers()[0].name(), "pooled_manager");
        assert_eq!(transport.endpoint_count(), 2);
    }

    #[tokio::test]
    async fn test_sequential_ids() {
        let transport = Arc::new(InProcessTransport::new());
        let primary = Server::start_with_transport(server_config("seq"), transport.clone())
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let client = Client::start_with_transport(client_config("seq"), transport.clone())
                .await
                .unwrap();
            ids.push(client.client_id());
        }
        assert_eq!(ids, vec![1, 2, 3]);

        let pool = primary.pool().unwrap();
        let member_ids: BTreeSet<u32> = pool.members().iter().map(Server::client_id).collect();
        assert_eq!(member_ids, BTreeSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_close_closes_every_member() {
        let transport = Arc::new(InProcessTransport::new());
        let primary = Server::start_with_transport(server_config("shut"), transport.clone())
            .await
            .unwrap();
        let _client = Client::start_with_transport(client_config("shut"), transport.clone())
            .await
            .unwrap();

        let pool = primary.pool().unwrap();
        primary.close().await;

        assert!(primary.pool().is_none());
        // Members with a live connection finish closing on their read task
        for server in pool.servers() {
            assert!(
                matches!(server.status(), Status::Closing | Status::Closed),
                "{server}"
            );
        }
    }

    #[tokio::test]
    async fn test_read_timed_fastest_returns_early() {
        let transport = Arc::new(InProcessTransport::new());
        let primary = Server::start_with_transport(server_config("fast"), transport.clone())
            .await
            .unwrap();
        let pool = primary.pool().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.read_timed_fastest(Duration::from_millis(50), move |server, result| {
            let _ = tx.send((server.client_id(), result.is_ok()));
        })
        .await;

        // First message on the primary is its Listening status
        assert_eq!(rx.recv().await, Some((1, true)));
    }

    #[tokio::test]
    async fn test_read_joins_every_member_but_the_manager() {
        let transport = Arc::new(InProcessTransport::new());
        let primary = Server::start_with_transport(server_config("join"), transport.clone())
            .await
            .unwrap();
        let first = Client::start_with_transport(client_config("join"), transport.clone())
            .await
            .unwrap();
        let second = Client::start_with_transport(client_config("join"), transport.clone())
            .await
            .unwrap();
        let pool = primary.pool().unwrap();
        assert_eq!(pool.len(), 2);

        let seen = Mutex::new(Vec::new());
        pool.read(|server, result| {
            assert!(result.is_ok(), "{server}");
            seen.lock().push(server.client_id());
        })
        .await;
        let mut ids = seen.into_inner();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);

        first.write(9, "from one").await.unwrap();
        second.write(9, "from two").await.unwrap();

        // Each member only ever sees its own client's payload
        let received = Mutex::new(BTreeSet::new());
        for _ in 0..20 {
            pool.read_timed(Duration::from_millis(200), |server, result| {
                assert_ne!(server.client_id(), 0, "manager passed to callback");
                let msg = result.unwrap();
                if msg.msg_type == 9 {
                    received.lock().insert((server.client_id(), msg.data));
                }
            })
            .await;
            if received.lock().len() == 2 {
                break;
            }
        }
        assert_eq!(
            received.into_inner(),
            BTreeSet::from([(1, b"from one".to_vec()), (2, b"from two".to_vec())])
        );
    }
}

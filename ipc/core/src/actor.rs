//! Actor Engine
//!
//! The connection engine shared by [`Client`](crate::Client) and
//! [`Server`](crate::Server). An actor owns one physical connection at a
//! time and runs two loops over it:
//!
//! - the read loop decodes frames and pushes them onto the inbound queue
//! - the write loop drains the outbound queue onto the connection
//!
//! Status changes and errors are announced on the inbound queue as internal
//! messages, so consumers observe the whole lifecycle through `read`.
//!
//! # Locking
//!
//! Status and the connection handle sit behind one `parking_lot::Mutex` that
//! is only held for the field access, never across an await point.
//!
//! # Teardown
//!
//! The inbound queue is never dropped while the actor is alive; instead a
//! `watch` flag marks it closed. Every blocked reader and every pending
//! notification selects on that flag, so closing wakes them all.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::crypto::Cipher;
use crate::error::IpcError;
use crate::frame::{self, ReadFrame, FRAME_OVERHEAD};
use crate::message::{Message, CONTROL_MSG_TYPE};
use crate::status::Status;
use crate::transport::BoxedConnection;

/// Depth of the inbound and outbound queues
pub const CHANNEL_CAPACITY: usize = 64;

/// First wait when a server is written to before a peer connects
const SERVER_SETUP_BACKOFF: Duration = Duration::from_millis(2);

/// First wait when a client is written to while still dialing
const CLIENT_SETUP_BACKOFF: Duration = Duration::from_millis(100);

const MAX_SETUP_BACKOFF: Duration = Duration::from_millis(500);

/// Longest a write waits for a setup status to resolve
pub const SETUP_WAIT_LIMIT: Duration = Duration::from_secs(60);

/// Longest `close` waits to shut the write half down
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

/// Why a read loop stopped
#[derive(Debug)]
pub(crate) enum ReadExit {
    /// Local shutdown of this connection
    Shutdown,
    /// Peer closed or reset the connection
    PeerClosed,
    /// Any other I/O failure
    Failed(io::Error),
    /// Peer violated the framing rules
    Protocol(String),
}

/// One physical connection owned by an actor
pub(crate) struct ConnectionHandle {
    writer: tokio::sync::Mutex<WriteHalf<BoxedConnection>>,
    cipher: Option<Arc<dyn Cipher>>,
    shutdown: watch::Sender<bool>,
    /// True from installation until the read loop for it has exited
    reading: AtomicBool,
}

impl ConnectionHandle {
    fn new(writer: WriteHalf<BoxedConnection>, cipher: Option<Arc<dyn Cipher>>) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            cipher,
            shutdown: watch::Sender::new(false),
            reading: AtomicBool::new(true),
        }
    }

    pub(crate) fn cipher(&self) -> Option<&dyn Cipher> {
        self.cipher.as_deref()
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    async fn write_frame(&self, frame: &[u8], flush: bool) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        if flush {
            writer.flush().await?;
        }
        Ok(())
    }

    /// Stop the read loop without touching the write half
    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop the read loop and shut the write half down
    pub(crate) async fn shutdown(&self) {
        self.signal_shutdown();
        let close_writer = async {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        };
        if tokio::time::timeout(CLOSE_GRACE, close_writer).await.is_err() {
            tracing::debug!("Write half still busy at close, leaving it to drop");
        }
    }
}

struct ActorState {
    status: Status,
    connection: Option<Arc<ConnectionHandle>>,
}

/// Connection engine state shared between the public handle and its tasks
pub(crate) struct Actor {
    role: Role,
    label: String,
    state: Mutex<ActorState>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    outbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    /// Taken by the write loop when it starts
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    closed: watch::Sender<bool>,
    /// Downgrades error reports once a local close started
    quiet: AtomicBool,
    /// Server: configured ceiling. Client: ceiling negotiated at handshake
    max_msg_size: AtomicUsize,
}

impl Actor {
    pub(crate) fn new(role: Role, label: String, max_msg_size: usize) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Arc::new(Self {
            role,
            label,
            state: Mutex::new(ActorState {
                status: Status::NotConnected,
                connection: None,
            }),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            closed: watch::Sender::new(false),
            quiet: AtomicBool::new(false),
            max_msg_size: AtomicUsize::new(max_msg_size),
        })
    }

    // =========================================================================
    // State
    // =========================================================================

    pub(crate) fn status(&self) -> Status {
        self.state.lock().status
    }

    pub(crate) fn max_msg_size(&self) -> usize {
        self.max_msg_size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_max_msg_size(&self, size: usize) {
        self.max_msg_size.store(size, Ordering::SeqCst);
    }

    pub(crate) fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.state.lock().connection.clone()
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(self.status(), Status::Closing | Status::Closed)
    }

    /// Apply a legal status change, returning whether it happened
    fn transition(&self, next: Status) -> bool {
        let mut state = self.state.lock();
        let current = state.status;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            drop(state);
            tracing::debug!(actor = %self.label, from = %current, to = %next, "Ignoring status change");
            return false;
        }
        state.status = next;
        drop(state);

        tracing::debug!(actor = %self.label, from = %current, to = %next, "Status changed");
        true
    }

    /// Replace the connection handle, returning the read half to drive
    pub(crate) fn install(
        &self,
        conn: BoxedConnection,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> (ReadHalf<BoxedConnection>, Arc<ConnectionHandle>) {
        let (reader, writer) = tokio::io::split(conn);
        let handle = Arc::new(ConnectionHandle::new(writer, cipher));
        let previous = self.state.lock().connection.replace(Arc::clone(&handle));
        if let Some(previous) = previous {
            previous.signal_shutdown();
        }
        (reader, handle)
    }

    /// Forget `handle` if it is still current and shut it down
    ///
    /// The peer reads EOF once this returns.
    pub(crate) async fn release(&self, handle: &Arc<ConnectionHandle>) {
        {
            let mut state = self.state.lock();
            if state
                .connection
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, handle))
            {
                state.connection = None;
            }
        }
        handle.shutdown().await;
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Queue internal messages without blocking the caller
    ///
    /// Messages go straight onto the inbound queue while it has room; once it
    /// is full the rest are handed, in order, to a spawned task. Anything
    /// still pending when the queue is closed is dropped.
    fn notify(self: &Arc<Self>, messages: Vec<Message>) {
        let mut pending = messages.into_iter();
        while let Some(msg) = pending.next() {
            if *self.closed.borrow() {
                return;
            }
            match self.inbound_tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(msg)) => {
                    let actor = Arc::clone(self);
                    let rest: Vec<Message> = std::iter::once(msg).chain(pending).collect();
                    tokio::spawn(async move {
                        for msg in rest {
                            if !actor.deliver(msg).await {
                                break;
                            }
                        }
                    });
                    return;
                }
            }
        }
    }

    /// Change status and announce it without blocking
    pub(crate) fn dispatch_status(self: &Arc<Self>, next: Status) -> bool {
        if !self.transition(next) {
            return false;
        }
        self.notify(vec![Message::from_status(next)]);
        true
    }

    /// Change status and announce it together with a terminal error
    pub(crate) fn dispatch_failure(self: &Arc<Self>, next: Status, err: IpcError) {
        self.report("connection", &err);
        if self.transition(next) {
            self.notify(vec![Message::from_status(next), Message::from_error(err)]);
        } else {
            self.notify(vec![Message::from_error(err)]);
        }
    }

    pub(crate) fn dispatch_error(self: &Arc<Self>, err: IpcError) {
        self.notify(vec![Message::from_error(err)]);
    }

    /// Wait until `msg` is queued; false if the queue closed first
    async fn deliver(&self, msg: Message) -> bool {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => false,
            sent = self.inbound_tx.send(msg) => sent.is_ok(),
        }
    }

    /// Log an error, at debug level once a local close has started
    pub(crate) fn report(&self, context: &str, err: &dyn fmt::Display) {
        if self.quiet.load(Ordering::SeqCst) {
            tracing::debug!(actor = %self, context, error = %err, "Suppressed error after close");
        } else {
            tracing::error!(actor = %self, context, error = %err, "IPC error");
        }
    }

    // =========================================================================
    // Consumer API
    // =========================================================================

    /// Wait for the next inbound message
    pub(crate) async fn read(&self) -> Result<Message, IpcError> {
        let mut closed = self.closed.subscribe();
        let next = async { self.inbound_rx.lock().await.recv().await };

        let msg = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => None,
            msg = next => msg,
        };
        let mut msg = msg.ok_or(IpcError::ChannelClosed)?;

        if let Some(err) = msg.error.take() {
            self.report("read", &err);
            if self.role == Role::Client {
                self.close_channels();
            }
            return Err(err);
        }
        Ok(msg)
    }

    /// Read with a deadline
    ///
    /// On expiry the timeout sentinel is returned. The receive is cancel-safe,
    /// so a message arriving later stays queued for the next read.
    pub(crate) async fn read_timed(&self, timeout: Duration) -> Result<Message, IpcError> {
        match tokio::time::timeout(timeout, self.read()).await {
            Ok(result) => result,
            Err(_) => Ok(Message::timed_out()),
        }
    }

    /// Validate and enqueue an outbound message
    pub(crate) async fn write(&self, msg_type: i32, data: Vec<u8>) -> Result<(), IpcError> {
        if msg_type <= CONTROL_MSG_TYPE {
            return Err(IpcError::ReservedType(msg_type));
        }

        self.wait_until_writable().await?;

        let max = self.max_msg_size();
        if data.len() > max {
            return Err(IpcError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }

        let sender = self
            .outbound_tx
            .lock()
            .clone()
            .ok_or(IpcError::ChannelClosed)?;
        sender
            .send(Message::new(msg_type, data))
            .await
            .map_err(|_| IpcError::ChannelClosed)
    }

    async fn wait_until_writable(&self) -> Result<(), IpcError> {
        let (setup, mut backoff) = match self.role {
            Role::Server => (Status::Listening, SERVER_SETUP_BACKOFF),
            Role::Client => (Status::Connecting, CLIENT_SETUP_BACKOFF),
        };
        let deadline = Instant::now() + SETUP_WAIT_LIMIT;

        loop {
            let status = self.status();
            if status == Status::Connected {
                return Ok(());
            }
            if status != setup {
                return Err(IpcError::InvalidStatus(status));
            }
            if Instant::now() >= deadline {
                return Err(IpcError::NotReady(status));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_SETUP_BACKOFF);
        }
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Start the write loop unless it is already running
    pub(crate) fn ensure_write_loop(self: &Arc<Self>) {
        let Some(outbound) = self.outbound_rx.lock().take() else {
            return;
        };
        let actor = Arc::clone(self);
        tokio::spawn(actor.write_loop(outbound));
    }

    async fn write_loop(self: Arc<Self>, mut outbound: mpsc::Receiver<Message>) {
        while let Some(msg) = outbound.recv().await {
            let Some(handle) = self.connection() else {
                self.report("write", &"no connection to write to");
                continue;
            };

            let frame = match frame::encode(msg.msg_type, &msg.data, handle.cipher()) {
                Ok(frame) => frame,
                Err(e) => {
                    self.report("encode", &e);
                    self.dispatch_error(e);
                    continue;
                }
            };

            let flush = self.status().is_flushable();
            if let Err(e) = handle.write_frame(&frame, flush).await {
                self.report("write", &e);
            }
        }
        tracing::debug!(actor = %self, "Write loop finished");
    }

    /// Decode frames from `reader` until the connection ends
    pub(crate) async fn read_loop(
        &self,
        mut reader: ReadHalf<BoxedConnection>,
        handle: &ConnectionHandle,
    ) -> ReadExit {
        let mut shutdown = handle.shutdown.subscribe();

        let exit = loop {
            let limit = self.max_msg_size().saturating_add(FRAME_OVERHEAD);
            let frame = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => None,
                frame = frame::read_frame(&mut reader, limit) => Some(frame),
            };

            let payload = match frame {
                None => break ReadExit::Shutdown,
                Some(Ok(ReadFrame::Payload(payload))) => payload,
                Some(Ok(ReadFrame::Oversized { len, limit })) => {
                    break ReadExit::Protocol(format!("frame of {len} bytes exceeds {limit}"))
                }
                Some(Err(e)) if is_peer_closed(&e) => break ReadExit::PeerClosed,
                Some(Err(e)) => break ReadExit::Failed(e),
            };

            match frame::decode(&payload, handle.cipher()) {
                Ok((CONTROL_MSG_TYPE, _)) => {
                    tracing::trace!(actor = %self, "Skipped control frame");
                }
                Ok((msg_type, data)) => {
                    let mut closed = self.closed.subscribe();
                    let stopped = tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => true,
                        _ = closed.wait_for(|closed| *closed) => false,
                        _ = self.inbound_tx.send(Message::new(msg_type, data)) => false,
                    };
                    if stopped {
                        break ReadExit::Shutdown;
                    }
                }
                Err(e) => {
                    self.report("decode", &e);
                    self.dispatch_error_now(e);
                }
            }
        };

        handle.reading.store(false, Ordering::SeqCst);
        tracing::debug!(actor = %self, exit = ?exit, "Read loop finished");
        exit
    }

    fn dispatch_error_now(&self, err: IpcError) {
        if *self.closed.borrow() {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.inbound_tx.try_send(Message::from_error(err)) {
            tracing::warn!(actor = %self, "Inbound queue full, dropped error notification");
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Error delivered after Closed
    fn close_error(&self) -> IpcError {
        match self.role {
            Role::Server => IpcError::ServerClosed,
            Role::Client => IpcError::ClientClosed,
        }
    }

    /// Begin a local close
    ///
    /// Returns false if a close was already under way.
    pub(crate) async fn close(self: &Arc<Self>) -> bool {
        self.quiet.store(true, Ordering::SeqCst);
        if !self.dispatch_status(Status::Closing) {
            return false;
        }

        match self.connection() {
            Some(handle) => {
                handle.shutdown().await;
                // A live read loop reports Closed when it observes the shutdown
                if !handle.is_reading() {
                    self.finish_close();
                }
            }
            None => self.finish_close(),
        }
        true
    }

    /// Move Closing to Closed and announce it, once
    pub(crate) fn finish_close(self: &Arc<Self>) {
        if !self.transition(Status::Closed) {
            return;
        }
        // Ends the write loop once in-flight writes drain
        self.outbound_tx.lock().take();
        self.notify(vec![
            Message::from_status(Status::Closed),
            Message::from_error(self.close_error()),
        ]);
    }

    /// Close both queues; blocked readers return `ChannelClosed`
    pub(crate) fn close_channels(&self) {
        self.closed.send_replace(true);
        self.outbound_tx.lock().take();
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label, self.status())
    }
}

fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

//! Per-socket read/write state machine.
//!
//! A [`Connection`] owns one TCP socket, an outbound [`BlockingQueue`] of pending messages and
//! a reference to the endpoint's shared inbound queue. Once started it runs two tasks on the
//! endpoint's I/O thread:
//!
//! - the read loop: header, then body if `body_len > 0`, then push the completed message onto
//!   the inbound queue and re-arm;
//! - the write loop: header, then body if non-empty, then pop the sent message and continue
//!   until the outbound queue drains, then park until [`Connection::send`] signals the
//!   empty-to-busy transition.
//!
//! Any read or write failure closes the connection for good; there is no reconnect. The only
//! externally visible signal is [`Connection::is_connected`] turning `false`.
//!
//! The role chosen at construction decides which start operation is legal:
//! [`Connection::connect_to_server`] for client-side connections and
//! [`Connection::connect_to_client`] for server-side ones. Calling the other one does nothing.
use std::{
    fmt,
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use log::{debug, info, trace, warn};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    sync::{Notify, watch},
};

use super::{
    BlockingQueue, Message, MessageKind, OwnedMessage,
    transport::{FrameReader, FrameWriter, TransportError},
};

/// Identity assigned to a server-side connection by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    AwaitingHeader = 1,
    AwaitingBody = 2,
    Writing = 3,
    Closed = 4,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::AwaitingHeader,
            2 => ConnectionState::AwaitingBody,
            3 => ConnectionState::Writing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Idle,
        }
    }
}

pub struct Connection<T> {
    id: AtomicU32,
    role: Role,
    handle: Handle,
    max_body_len: usize,
    /// Socket waiting for the read/write loops to take it over.
    socket: Mutex<Option<TcpStream>>,
    peer: OnceLock<SocketAddr>,
    /// Set by the first start operation; the read/write loops exist at most once.
    started: AtomicBool,
    read_state: AtomicU8,
    writing: AtomicBool,
    open: AtomicBool,
    outbound: BlockingQueue<Message<T>>,
    inbound: Arc<BlockingQueue<OwnedMessage<T>>>,
    write_ready: Notify,
    closed: watch::Sender<bool>,
}

impl<T: MessageKind> Connection<T> {
    fn new(
        role: Role,
        handle: Handle,
        socket: Option<TcpStream>,
        inbound: Arc<BlockingQueue<OwnedMessage<T>>>,
        max_body_len: usize,
    ) -> Self {
        let peer = OnceLock::new();
        if let Some(addr) = socket.as_ref().and_then(|s| s.peer_addr().ok()) {
            let _ = peer.set(addr);
        }

        let (closed, _) = watch::channel(false);
        Self {
            id: AtomicU32::new(0),
            role,
            handle,
            max_body_len,
            open: AtomicBool::new(socket.is_some()),
            socket: Mutex::new(socket),
            peer,
            started: AtomicBool::new(false),
            read_state: AtomicU8::new(ConnectionState::Idle as u8),
            writing: AtomicBool::new(false),
            outbound: BlockingQueue::new(),
            inbound,
            write_ready: Notify::new(),
            closed,
        }
    }

    /// Creates a client-side connection with no socket yet.
    pub fn client(
        handle: Handle,
        inbound: Arc<BlockingQueue<OwnedMessage<T>>>,
        max_body_len: usize,
    ) -> Arc<Self> {
        Arc::new(Self::new(Role::Client, handle, None, inbound, max_body_len))
    }

    /// Wraps a socket handed over by an acceptor.
    pub fn server(
        handle: Handle,
        socket: TcpStream,
        inbound: Arc<BlockingQueue<OwnedMessage<T>>>,
        max_body_len: usize,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            Role::Server,
            handle,
            Some(socket),
            inbound,
            max_body_len,
        ))
    }

    pub fn id(&self) -> ConnectionId {
        ConnectionId(self.id.load(Ordering::Acquire))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.get().copied()
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if *self.closed.borrow() {
            ConnectionState::Closed
        } else if self.writing.load(Ordering::Acquire) {
            ConnectionState::Writing
        } else {
            self.read_state.load(Ordering::Acquire).into()
        }
    }

    /// Number of messages queued but not yet fully written.
    pub fn pending_writes(&self) -> usize {
        self.outbound.count()
    }

    /// Assigns the registry id and starts the read/write loops on an accepted socket.
    ///
    /// No-op for client-side connections and for connections already started or closed.
    pub fn connect_to_client(self: &Arc<Self>, id: ConnectionId) {
        if self.role != Role::Server {
            debug!("[{}] connect_to_client called on a client-side connection", id);
            return;
        }

        if self.started.swap(true, Ordering::AcqRel) {
            debug!("[{}] connect_to_client on a connection already started", id);
            return;
        }

        let Some(socket) = self.lock_socket().take() else {
            debug!("[{}] connect_to_client without a pending socket", id);
            return;
        };

        self.id.store(id.0, Ordering::Release);
        self.start(socket);
    }

    /// Connects to the first reachable address in `addrs`, then starts the read/write loops.
    ///
    /// No-op for server-side connections and for connections already started, whether or not
    /// that earlier attempt succeeded.
    pub async fn connect_to_server(
        self: Arc<Self>,
        addrs: Vec<SocketAddr>,
        timeout: Duration,
    ) -> io::Result<()> {
        if self.role != Role::Client {
            debug!("[{}] connect_to_server called on a server-side connection", self.id());
            return Ok(());
        }

        if self.started.swap(true, Ordering::AcqRel) {
            debug!("connect_to_server on a connection already started");
            return Ok(());
        }

        let attempt = tokio::time::timeout(timeout, TcpStream::connect(&addrs[..])).await;
        let socket = match attempt {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.close();
                return Err(e);
            }
            Err(_) => {
                self.close();
                return Err(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("connect timed out after {timeout:?}"),
                ));
            }
        };

        if let Ok(addr) = socket.peer_addr() {
            let _ = self.peer.set(addr);
        }
        info!("connected to {:?}", self.peer_addr());

        self.open.store(true, Ordering::Release);
        self.start(socket);
        Ok(())
    }

    /// Queues `msg` for sending. Dropped if the connection is not open.
    pub fn send(&self, msg: Message<T>) {
        if !self.is_connected() {
            debug!("[{}] dropping {msg} on closed connection", self.id());
            return;
        }

        if self.outbound.push_back_was_empty(msg) {
            self.write_ready.notify_one();
        }
    }

    /// Requests the connection be closed.
    ///
    /// The I/O tasks observe the request and release the socket on the I/O thread, so a
    /// completion already in flight never races a close.
    pub fn disconnect(&self) {
        if self.is_connected() {
            self.close();
        }
    }

    pub(crate) fn close(&self) {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        self.closed.send_replace(true);
        self.writing.store(false, Ordering::Release);
        self.read_state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.outbound.clear();
        drop(self.lock_socket().take());

        if was_open {
            info!("[{}] connection closed", self.id());
        }
    }

    fn lock_socket(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self) -> Option<ConnectionId> {
        match self.role {
            Role::Server => Some(self.id()),
            Role::Client => None,
        }
    }

    fn set_read_state(&self, state: ConnectionState) {
        self.read_state.store(state as u8, Ordering::Release);
    }

    fn start(self: &Arc<Self>, socket: TcpStream) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!("[{}] failed to set TCP_NODELAY: {e}", self.id());
        }

        let (read_half, write_half) = socket.into_split();
        self.set_read_state(ConnectionState::AwaitingHeader);

        let reader = FrameReader::new(read_half, self.max_body_len);
        self.handle.spawn(Arc::clone(self).read_loop(reader));
        self.handle
            .spawn(Arc::clone(self).write_loop(FrameWriter::new(write_half)));
    }

    async fn read_message(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<Message<T>, TransportError> {
        self.set_read_state(ConnectionState::AwaitingHeader);
        let (kind, len) = reader.read_header::<T>().await?;

        let body = if len > 0 {
            self.set_read_state(ConnectionState::AwaitingBody);
            reader.read_body(len).await?
        } else {
            Vec::new()
        };

        Ok(Message::with_body(kind, body)?)
    }

    async fn read_loop(self: Arc<Self>, mut reader: FrameReader<OwnedReadHalf>) {
        let mut closed = self.closed.subscribe();

        loop {
            tokio::select! {
                res = self.read_message(&mut reader) => match res {
                    Ok(message) => {
                        trace!("[{}] received {message}", self.id());
                        self.inbound.push_back(OwnedMessage {
                            sender: self.sender(),
                            message,
                        });
                    }
                    Err(TransportError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                        info!("[{}] peer closed the connection", self.id());
                        break;
                    }
                    Err(e) => {
                        warn!("[{}] read failed: {e}", self.id());
                        break;
                    }
                },
                _ = closed_signal(&mut closed) => break,
            }
        }

        self.close();
    }

    async fn write_loop(self: Arc<Self>, mut writer: FrameWriter<OwnedWriteHalf>) {
        let mut closed = self.closed.subscribe();

        'chain: loop {
            while let Ok(msg) = self.outbound.front() {
                self.writing.store(true, Ordering::Release);

                let res = tokio::select! {
                    res = writer.write_message(&msg) => res,
                    _ = closed_signal(&mut closed) => break 'chain,
                };

                match res {
                    Ok(()) => {
                        trace!("[{}] sent {msg}", self.id());
                        let _ = self.outbound.pop_front();
                    }
                    Err(e) => {
                        warn!("[{}] write failed: {e}", self.id());
                        self.close();
                        return;
                    }
                }
            }
            self.writing.store(false, Ordering::Release);

            tokio::select! {
                _ = self.write_ready.notified() => {}
                _ = closed_signal(&mut closed) => break,
            }
        }

        self.writing.store(false, Ordering::Release);
    }
}

/// Resolves once the connection has been asked to close.
async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id.load(Ordering::Relaxed))
            .field("role", &self.role)
            .field("peer", &self.peer.get())
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::{IoContext, transport::DEFAULT_MAX_BODY_LEN};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    struct Pair {
        context: IoContext,
        client: Arc<Connection<u32>>,
        client_inbox: Arc<BlockingQueue<OwnedMessage<u32>>>,
        server: Arc<Connection<u32>>,
        server_inbox: Arc<BlockingQueue<OwnedMessage<u32>>>,
    }

    fn connected_pair() -> Pair {
        let context = IoContext::start("connection-test").unwrap();
        let handle = context.handle().clone();

        let listener = context
            .run_blocking(TcpListener::bind("127.0.0.1:0"))
            .unwrap()
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client_inbox = Arc::new(BlockingQueue::new());
        let client = Connection::client(
            handle.clone(),
            Arc::clone(&client_inbox),
            DEFAULT_MAX_BODY_LEN,
        );
        context
            .run_blocking(Arc::clone(&client).connect_to_server(vec![addr], TIMEOUT))
            .unwrap()
            .unwrap();

        let (socket, _) = context
            .run_blocking(async move { listener.accept().await })
            .unwrap()
            .unwrap();

        let server_inbox = Arc::new(BlockingQueue::new());
        let server = Connection::server(
            handle,
            socket,
            Arc::clone(&server_inbox),
            DEFAULT_MAX_BODY_LEN,
        );
        server.connect_to_client(ConnectionId(10_000));

        Pair {
            context,
            client,
            client_inbox,
            server,
            server_inbox,
        }
    }

    #[test]
    fn messages_flow_both_ways() {
        let pair = connected_pair();
        assert_eq!(pair.client.role(), Role::Client);
        assert_eq!(pair.server.role(), Role::Server);
        assert_eq!(pair.server.id(), ConnectionId(10_000));
        assert!(pair.client.peer_addr().is_some());

        pair.client
            .send(Message::with_body(1, b"ping".to_vec()).unwrap());
        pair.client.send(Message::new(2));

        assert!(wait_until(|| pair.server_inbox.count() == 2));
        let first = pair.server_inbox.pop_front().unwrap();
        assert_eq!(first.sender, Some(ConnectionId(10_000)));
        assert_eq!(first.message.kind(), 1);
        assert_eq!(first.message.body(), b"ping");
        let second = pair.server_inbox.pop_front().unwrap();
        assert_eq!(second.message.kind(), 2);
        assert!(second.message.is_empty());

        pair.server
            .send(Message::with_body(3, b"pong".to_vec()).unwrap());
        assert!(pair.client_inbox.wait_for(TIMEOUT));
        let reply = pair.client_inbox.pop_front().unwrap();
        assert_eq!(reply.sender, None);
        assert_eq!(reply.message.body(), b"pong");
    }

    #[test]
    fn send_order_is_preserved() {
        let pair = connected_pair();
        for i in 0..200u32 {
            let mut msg = Message::new(7);
            msg.push(i).unwrap();
            pair.client.send(msg);
        }

        assert!(wait_until(|| pair.server_inbox.count() == 200));
        for i in 0..200u32 {
            let mut owned = pair.server_inbox.pop_front().unwrap();
            assert_eq!(owned.message.pop::<u32>().unwrap(), i);
        }
    }

    #[test]
    fn wrong_role_operations_are_no_ops() {
        let pair = connected_pair();

        pair.client.connect_to_client(ConnectionId(99));
        assert_eq!(pair.client.id(), ConnectionId(0));

        let addr = pair.client.peer_addr().unwrap();
        let server = Arc::clone(&pair.server);
        pair.context
            .run_blocking(server.connect_to_server(vec![addr], TIMEOUT))
            .unwrap()
            .unwrap();
        assert_eq!(pair.server.id(), ConnectionId(10_000));
        assert!(pair.server.is_connected());
    }

    #[test]
    fn second_connect_to_server_keeps_original_session() {
        let pair = connected_pair();
        let other = pair
            .context
            .run_blocking(TcpListener::bind("127.0.0.1:0"))
            .unwrap()
            .unwrap();
        let other_addr = other.local_addr().unwrap();

        pair.context
            .run_blocking(Arc::clone(&pair.client).connect_to_server(vec![other_addr], TIMEOUT))
            .unwrap()
            .unwrap();

        for i in 0..6u32 {
            let mut msg = Message::new(8);
            msg.push(i).unwrap();
            pair.client.send(msg);

            assert!(pair.server_inbox.wait_for(TIMEOUT));
            let mut owned = pair.server_inbox.pop_front().unwrap();
            assert_eq!(owned.message.pop::<u32>().unwrap(), i);
        }
        assert!(pair.client.is_connected());
    }

    #[test]
    fn failed_second_connect_does_not_close_session() {
        let pair = connected_pair();
        let refused = pair
            .context
            .run_blocking(TcpListener::bind("127.0.0.1:0"))
            .unwrap()
            .unwrap();
        let refused_addr = refused.local_addr().unwrap();
        drop(refused);

        let res = pair
            .context
            .run_blocking(Arc::clone(&pair.client).connect_to_server(vec![refused_addr], TIMEOUT))
            .unwrap();
        assert!(res.is_ok());
        assert!(pair.client.is_connected());

        pair.client
            .send(Message::with_body(1, b"still here".to_vec()).unwrap());
        assert!(pair.server_inbox.wait_for(TIMEOUT));
        let owned = pair.server_inbox.pop_front().unwrap();
        assert_eq!(owned.message.body(), b"still here");
    }

    #[test]
    fn disconnect_mid_write() {
        let pair = connected_pair();
        for _ in 0..64 {
            pair.server.send(Message::with_body(5, vec![0xab; 64 * 1024]).unwrap());
        }

        pair.server.disconnect();
        assert!(!pair.server.is_connected());
        assert_eq!(pair.server.state(), ConnectionState::Closed);
        assert_eq!(pair.server.pending_writes(), 0);

        // Further sends are dropped, not written.
        pair.server.send(Message::new(5));
        assert_eq!(pair.server.pending_writes(), 0);

        assert!(wait_until(|| !pair.client.is_connected()));
        assert_eq!(pair.client.state(), ConnectionState::Closed);
    }

    #[test]
    fn connect_failure_closes_connection() {
        let context = IoContext::start("connection-test").unwrap();
        let listener = context
            .run_blocking(TcpListener::bind("127.0.0.1:0"))
            .unwrap()
            .unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client: Arc<Connection<u32>> = Connection::client(
            context.handle().clone(),
            Arc::new(BlockingQueue::new()),
            DEFAULT_MAX_BODY_LEN,
        );
        let res = context
            .run_blocking(Arc::clone(&client).connect_to_server(vec![addr], TIMEOUT))
            .unwrap();

        assert!(res.is_err());
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}

use std::{
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
    time::Duration,
};

use log::{info, warn};
use thiserror::Error;
use tokio::{net::TcpListener, runtime::Handle};

use super::{
    BlockingQueue, Connection, ConnectionId, IoContext, Message, MessageKind, OwnedMessage,
    Registry, ServerHooks, transport::DEFAULT_MAX_BODY_LEN,
};

/// First id handed out by a server; everything below is reserved.
pub const FIRST_CONNECTION_ID: u32 = 10_000;

/// Pause before re-arming the acceptor after a failed accept, e.g. when out of descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to start I/O context: {0}")]
    Runtime(#[from] io::Error),
    #[error("server already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub first_id: u32,
    pub max_body_len: usize,
}

impl ServerConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            ..Default::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 60_000)),
            first_id: FIRST_CONNECTION_ID,
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }
}

/// A listening endpoint serving many clients.
///
/// Accepting and all socket I/O happen on the server's own I/O thread. The application
/// consumes inbound traffic by calling [`Server::update`] on its own thread, which hands every
/// message to [`ServerHooks::on_message`] in arrival order across all connections.
pub struct Server<T: MessageKind> {
    config: ServerConfig,
    registry: Arc<Registry<T>>,
    inbound: Arc<BlockingQueue<OwnedMessage<T>>>,
    context: Option<IoContext>,
    local_addr: Option<SocketAddr>,
}

impl<T: MessageKind> Server<T> {
    pub fn new<H: ServerHooks<T>>(config: ServerConfig, hooks: Arc<H>) -> Self {
        let registry = Registry::new(config.first_id, hooks);
        Self {
            config,
            registry: Arc::new(registry),
            inbound: Arc::new(BlockingQueue::new()),
            context: None,
            local_addr: None,
        }
    }

    /// Binds the listener and starts accepting on a dedicated I/O thread.
    ///
    /// Returns the bound address, which differs from the configured one for port 0.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.context.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = self.config.addr;
        let bind_error = |source| ServerError::Bind { addr, source };

        let context = IoContext::start("framelink-server")?;
        let listener = StdTcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let listener = {
            let _guard = context.handle().enter();
            TcpListener::from_std(listener).map_err(bind_error)?
        };
        let local_addr = listener.local_addr().map_err(bind_error)?;

        context.handle().spawn(accept_loop(
            listener,
            Arc::clone(&self.registry),
            Arc::clone(&self.inbound),
            context.handle().clone(),
            self.config.max_body_len,
        ));

        info!("[SERVER] started on {local_addr}");
        self.context = Some(context);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops the I/O thread and closes every connection. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut context) = self.context.take() {
            context.stop();
            self.registry.close_all();
            self.local_addr = None;
            info!("[SERVER] stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.context.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> &Registry<T> {
        &self.registry
    }

    pub fn incoming(&self) -> &BlockingQueue<OwnedMessage<T>> {
        &self.inbound
    }

    pub fn message_client(&self, client: &Arc<Connection<T>>, msg: &Message<T>) {
        self.registry.message_client(client, msg);
    }

    pub fn message_client_id(&self, id: ConnectionId, msg: &Message<T>) {
        self.registry.message_client_id(id, msg);
    }

    pub fn message_all_clients(&self, msg: &Message<T>, except: Option<ConnectionId>) {
        self.registry.message_all_clients(msg, except);
    }

    /// Drains up to `max_messages` inbound messages into [`ServerHooks::on_message`].
    ///
    /// With `wait` set, first blocks up to `timeout` for at least one message. Returns the
    /// number of messages handled.
    pub fn update(&self, max_messages: usize, wait: bool, timeout: Duration) -> usize {
        if wait {
            self.inbound.wait_for(timeout);
        }

        let mut handled = 0;
        while handled < max_messages {
            let Ok(owned) = self.inbound.pop_front() else {
                break;
            };

            match owned.sender {
                Some(sender) => {
                    self.registry
                        .hooks()
                        .on_message(&self.registry, sender, owned.message)
                }
                None => warn!("dropping untagged message {}", owned.message),
            }
            handled += 1;
        }
        handled
    }
}

impl<T: MessageKind> Drop for Server<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop<T: MessageKind>(
    listener: TcpListener,
    registry: Arc<Registry<T>>,
    inbound: Arc<BlockingQueue<OwnedMessage<T>>>,
    handle: Handle,
    max_body_len: usize,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!("[SERVER] new connection: {peer}");
                let candidate =
                    Connection::server(handle.clone(), socket, Arc::clone(&inbound), max_body_len);
                registry.admit(candidate);
            }
            Err(e) => accept_failed(&e).await,
        }
    }
}

async fn accept_failed(e: &io::Error) {
    warn!("[SERVER] new connection error: {e}");
    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
}

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use thiserror::Error;

use super::{
    BlockingQueue, Connection, IoContext, Message, MessageKind, OwnedMessage,
    transport::DEFAULT_MAX_BODY_LEN,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("{host}:{port} did not resolve to any address")]
    NoAddress { host: String, port: u16 },
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),
    #[error("failed to start I/O context: {0}")]
    Runtime(#[source] io::Error),
    #[error("I/O context stopped before the connect attempt finished")]
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_body_len: usize,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_body_len: DEFAULT_MAX_BODY_LEN,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// An endpoint holding a single connection to a server.
///
/// Received messages land in [`Client::incoming`] untagged; the application drains them with
/// the queue's `wait`/`wait_for`/`pop_front`.
pub struct Client<T: MessageKind> {
    config: ClientConfig,
    inbound: Arc<BlockingQueue<OwnedMessage<T>>>,
    connection: Option<Arc<Connection<T>>>,
    context: Option<IoContext>,
}

impl<T: MessageKind> Client<T> {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            inbound: Arc::new(BlockingQueue::new()),
            connection: None,
            context: None,
        }
    }

    /// Resolves `host` and connects to the first address that accepts.
    ///
    /// Any existing connection is torn down first, and messages still queued from it are
    /// discarded.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| ClientError::Resolve {
                host: host.to_string(),
                port,
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ClientError::NoAddress {
                host: host.to_string(),
                port,
            });
        }

        self.connect_addrs(addrs)
    }

    pub fn connect_addr(&mut self, addr: SocketAddr) -> Result<(), ClientError> {
        self.connect_addrs(vec![addr])
    }

    fn connect_addrs(&mut self, addrs: Vec<SocketAddr>) -> Result<(), ClientError> {
        self.disconnect();
        self.inbound.clear();

        let context = IoContext::start("framelink-client").map_err(ClientError::Runtime)?;
        let connection = Connection::client(
            context.handle().clone(),
            Arc::clone(&self.inbound),
            self.config.max_body_len,
        );

        debug!("connecting to {addrs:?}");
        let attempt = Arc::clone(&connection).connect_to_server(addrs, self.config.connect_timeout);
        match context.run_blocking(attempt) {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(ClientError::Connect(e)),
            None => return Err(ClientError::Interrupted),
        }

        self.connection = Some(connection);
        self.context = Some(context);
        Ok(())
    }

    /// Closes the connection, stops the I/O thread and releases the connection, in that
    /// order. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(connection) = &self.connection {
            connection.disconnect();
        }

        if let Some(mut context) = self.context.take() {
            context.stop();
            info!("disconnected");
        }

        self.connection = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().and_then(|c| c.peer_addr())
    }

    pub fn connection(&self) -> Option<&Arc<Connection<T>>> {
        self.connection.as_ref()
    }

    /// Queues `msg` for the server. Dropped when not connected.
    pub fn send(&self, msg: Message<T>) {
        match &self.connection {
            Some(connection) if connection.is_connected() => connection.send(msg),
            _ => debug!("not connected, dropping {msg}"),
        }
    }

    pub fn incoming(&self) -> &BlockingQueue<OwnedMessage<T>> {
        &self.inbound
    }
}

impl<T: MessageKind> Default for Client<T> {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl<T: MessageKind> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

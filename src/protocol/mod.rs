//! Typed message passing over TCP.
//!
//! This module holds everything needed to build client and server endpoints that exchange
//! framed messages: the wire codec, the per-connection I/O state machine, the inter-thread
//! queue that hands received messages to the application, and the server-side registry.
//!
//! # Overview
//!
//! Each endpoint owns an [`IoContext`]: a single-threaded event loop on a dedicated thread
//! that runs the accept loop and every connection's read and write loops. The application
//! never blocks that thread. It sends by queueing onto a connection and receives by draining
//! the endpoint's inbound [`BlockingQueue`] on its own thread, either directly
//! ([`Client::incoming`]) or through [`Server::update`].
//!
//! Messages sent on one connection arrive in send order. Messages from different connections
//! interleave in whatever order their reads complete.
//!
//! # Key Components
//!
//! - [`Message`]: header (kind + body length) and an opaque body, with framing helpers.
//! - [`BlockingQueue`]: mutex + condition variable deque with blocking and timed waits.
//! - [`Connection`]: role-tagged socket driving the read/write loops.
//! - [`Registry`]: live server connections, id assignment, targeted and broadcast sends.
//! - [`Server`] / [`Client`]: endpoints that own the I/O thread.
//!
//! # Binary Format
//!
//! See [`transport`] for the frame layout. Integers in the header are little-endian; no
//! encryption, authentication, acknowledgement or multiplexing is layered on top.
mod client;
mod connection;
mod context;
mod message;
mod queue;
mod registry;
mod server;
pub mod transport;

pub use client::{Client, ClientConfig, ClientError};
pub use connection::{Connection, ConnectionId, ConnectionState, Role};
pub use context::IoContext;
pub use message::{
    FramingError, MAX_BODY_LEN, Message, MessageHeader, MessageKind, MessageReader,
    MessageWriter, OwnedMessage,
};
pub use queue::{BlockingQueue, QueueError};
pub use registry::{Registry, ServerHooks};
pub use server::{FIRST_CONNECTION_ID, Server, ServerConfig, ServerError};

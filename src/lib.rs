pub mod cli;
pub mod protocol;

pub use cli::{Command, DemoKind, prompt};
pub use protocol::{
    BlockingQueue, Client, ClientConfig, Connection, ConnectionId, Message, MessageKind,
    OwnedMessage, Registry, Server, ServerConfig, ServerHooks,
};

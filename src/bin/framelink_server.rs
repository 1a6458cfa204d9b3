use std::{
    error::Error,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use framelink::{
    Connection, ConnectionId, DemoKind, Message, Registry, Server, ServerConfig, ServerHooks,
    protocol::transport::DEFAULT_MAX_BODY_LEN,
};
use log::{debug, info};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "0.0.0.0:60000")]
    address: SocketAddr,
    /// Largest message body accepted from a client, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_LEN)]
    max_body_len: usize,
}

/// Answers pings and relays text to every other client.
struct Relay;

impl ServerHooks<DemoKind> for Relay {
    fn on_client_connect(&self, candidate: &Connection<DemoKind>) -> bool {
        info!("accepting {:?}", candidate.peer_addr());
        true
    }

    fn on_client_disconnect(&self, client: &Connection<DemoKind>) {
        info!("removing client [{}]", client.id());
    }

    fn on_message(
        &self,
        registry: &Registry<DemoKind>,
        sender: ConnectionId,
        mut message: Message<DemoKind>,
    ) {
        match message.kind() {
            DemoKind::Ping => {
                debug!("[{sender}] ping");
                message.set_kind(DemoKind::Pong);
                registry.message_client_id(sender, &message);
            }
            DemoKind::Text => {
                if message.push(sender.0).is_ok() {
                    registry.message_all_clients(&message, Some(sender));
                }
            }
            DemoKind::Pong => debug!("[{sender}] unexpected pong"),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))?;
    }

    let config = ServerConfig {
        addr: cli.address,
        max_body_len: cli.max_body_len,
        ..Default::default()
    };
    let mut server = Server::new(config, Arc::new(Relay));
    let addr = server.start()?;
    println!("listening at {addr}");

    while running.load(Ordering::SeqCst) {
        server.update(usize::MAX, true, Duration::from_millis(250));
    }

    server.stop();
    Ok(())
}

use std::{
    error::Error,
    io,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use framelink::{BlockingQueue, Client, Command, DemoKind, Message, OwnedMessage, prompt};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server host name or address
    #[arg(default_value = "127.0.0.1")]
    host: String,
    /// Server port
    #[arg(default_value_t = 60000)]
    port: u16,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn print_message(owned: OwnedMessage<DemoKind>) {
    let mut message = owned.message;
    match message.kind() {
        DemoKind::Pong => match message.pop::<u64>() {
            Ok(sent) => println!("pong: {}ms", now_millis().saturating_sub(sent)),
            Err(e) => eprintln!("malformed pong: {e}"),
        },
        DemoKind::Text => {
            let text = message
                .pop::<u32>()
                .and_then(|origin| Ok((origin, message.reader().read_str()?)));
            match text {
                Ok((origin, text)) => println!("[{origin}] {text}"),
                Err(e) => eprintln!("malformed text: {e}"),
            }
        }
        DemoKind::Ping => println!("{message}"),
    }
}

fn drain(inbox: &BlockingQueue<OwnedMessage<DemoKind>>, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        if inbox.wait_for(Duration::from_millis(200)) {
            while let Ok(owned) = inbox.pop_front() {
                print_message(owned);
            }
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut client = Client::<DemoKind>::default();
    client.connect(&cli.host, cli.port)?;
    println!("connected to {}:{}", cli.host, cli.port);

    let running = AtomicBool::new(true);
    let inbox = client.incoming();
    thread::scope(|scope| {
        scope.spawn(|| drain(inbox, &running));

        while client.is_connected() {
            let cmd = match prompt(io::stdin().lock(), io::stdout().lock()) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("{e}");
                    continue;
                }
            };

            let mut message = match cmd {
                Command::Exit => break,
                Command::Ping => Message::new(DemoKind::Ping),
                Command::Say(text) => {
                    let mut message = Message::new(DemoKind::Text);
                    if let Err(e) = message.writer().write_str(&text) {
                        eprintln!("{e}");
                        continue;
                    }
                    message
                }
            };

            if message.kind() == DemoKind::Ping {
                if let Err(e) = message.push(now_millis()) {
                    eprintln!("{e}");
                    continue;
                }
            }
            client.send(message);
        }

        running.store(false, Ordering::SeqCst);
    });

    client.disconnect();
    Ok(())
}

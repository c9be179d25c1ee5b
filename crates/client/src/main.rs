mod net;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::Parser;

use net::{ChatClient, ClientConfig, ClientState};

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Chat client for tether-server")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:27015",
        help = "Server address to connect to"
    )]
    server: String,

    #[arg(short, long, default_value = "anonymous")]
    name: String,

    #[arg(long, help = "Line to send once connected; may be repeated")]
    say: Vec<String>,

    #[arg(long, help = "Token expected by the server")]
    secret: Option<String>,

    #[arg(long, default_value_t = 250, help = "Ping interval in ms")]
    ping_ms: u64,

    #[arg(long, default_value_t = 10, help = "Handshake attempts before giving up")]
    connect_attempts: u32,

    #[arg(long, default_value_t = 500, help = "Delay between handshake attempts in ms")]
    attempt_interval_ms: u64,

    #[arg(long, default_value_t = 10, help = "Disconnect after this many seconds")]
    duration: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_addr: SocketAddr = args
        .server
        .parse()
        .with_context(|| format!("invalid server address {}", args.server))?;

    let config = ClientConfig {
        name: args.name,
        ping_interval: Duration::from_millis(args.ping_ms),
        secret: args.secret,
        peer: tether::Config {
            max_connect_attempts: args.connect_attempts,
            connect_attempt_interval: Duration::from_millis(args.attempt_interval_ms),
            ..Default::default()
        },
    };

    let mut client = ChatClient::bind(config)?;
    client.connect(server_addr, Instant::now())?;
    for line in args.say {
        client.say(line, Instant::now());
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    while Instant::now() < deadline {
        client.update(Instant::now());

        for message in client.drain_chat() {
            println!("<{}> {}", message.sender, message.text);
        }

        match client.state() {
            ClientState::Failed => {
                let reason = client
                    .failure()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                bail!("connection to {} failed: {}", server_addr, reason);
            }
            ClientState::Disconnected => break,
            _ => {}
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    if let Some(rtt) = client.last_rtt() {
        log::info!("Last RTT: {} ms", rtt.as_millis());
    }
    client.disconnect(Instant::now());

    Ok(())
}

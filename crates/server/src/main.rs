mod config;
mod events;
mod server;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::{DEFAULT_PORT, ServerConfig, load_peer_config};
use server::ChatServer;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Chat relay over tether connections")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 10_000, help = "Idle time before a client is dropped, in ms")]
    timeout_ms: u64,

    #[arg(long, default_value_t = 1_000, help = "Keep-alive interval in ms")]
    keep_alive_ms: u64,

    #[arg(long, default_value_t = 0.02, help = "Resend after this fraction of the timeout")]
    resend_fraction: f32,

    #[arg(long, default_value_t = 256, help = "Unacknowledged reliable messages per client")]
    max_in_flight: usize,

    #[arg(
        long,
        conflicts_with_all = [
            "max_clients",
            "timeout_ms",
            "keep_alive_ms",
            "resend_fraction",
            "max_in_flight",
        ],
        help = "Read connection tunables from a JSON file instead of flags"
    )]
    config: Option<PathBuf>,

    #[arg(long, help = "Only admit clients presenting this token")]
    secret: Option<String>,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let peer = match &args.config {
        Some(path) => load_peer_config(path)?,
        None => tether::Config {
            max_connections: args.max_clients,
            disconnect_timeout: Duration::from_millis(args.timeout_ms),
            keep_alive_interval: Duration::from_millis(args.keep_alive_ms),
            resend_fraction: args.resend_fraction,
            max_in_flight: args.max_in_flight,
            ..Default::default()
        },
    };

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        peer,
        secret: args.secret,
    };

    let mut server = ChatServer::bind(&bind_addr, config)?;
    log::info!("Server started on {}", server.peer().local_addr()?);

    server.run(args.duration.map(Duration::from_secs));
    log::info!("Server shutting down after relaying {} messages", server.relayed());

    Ok(())
}

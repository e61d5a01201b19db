mod arena;
mod config;
mod gobs;
mod host;
mod join;

use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::DriverConfig;

#[derive(Parser)]
#[command(name = "arena-server")]
#[command(about = "Headless arena host and client")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value_t = 0.0, global = true, help = "Datagram loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, global = true, help = "Stop after this many frames")]
    frames: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Host an arena and replicate it to every client that joins.
    Host {
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        #[arg(short, long, default_value_t = arena_net::DEFAULT_PORT)]
        port: u16,

        #[arg(short, long, default_value_t = 32)]
        max_clients: usize,

        #[arg(long, default_value_t = 1)]
        arena: u32,
    },
    /// Join a host and fly a ship.
    Join {
        addr: SocketAddr,

        #[arg(short, long, default_value = "pilot")]
        name: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Host {
            bind,
            port,
            max_clients,
            arena,
        } => {
            let mut config = DriverConfig::new(port, max_clients, args.loss_percent);
            config.max_frames = args.frames;
            host::run(bind, arena, config)
        }
        Command::Join { addr, name } => {
            let mut config = DriverConfig::new(addr.port(), 1, args.loss_percent);
            config.max_frames = args.frames;
            join::run(addr, name, config)
        }
    }
}

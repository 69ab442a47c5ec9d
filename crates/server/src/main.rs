mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::Parser;

use rollnet::ServerConfig;
use server::GameServer;

#[derive(Parser)]
#[command(name = "rollnet-server")]
#[command(about = "Authoritative server for the rollnet demo game")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = rollnet::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, help = "JSON file overriding the default server settings")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info", help = "Log filter used when RUST_LOG is unset")]
    log_level: String,
}

fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig> {
    let Some(path) = path else {
        return Ok(ServerConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    ServerConfig::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str())).init();

    let config = load_config(args.config.as_ref())?;
    let bind_addr = format!("{}:{}", args.bind, args.port);
    let mut server = GameServer::new(&bind_addr, config)?;

    let running = Arc::new(AtomicBool::new(true));
    server::spawn_shutdown_listener(Arc::clone(&running))?;

    log::info!("Server started on {}", server.local_addr());
    server.run(&running)?;
    log::info!("Server shutting down after frame {}", server.stats().frame_index);
    Ok(())
}

mod bot;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use bot::Bot;
use rollnet::ClientConfig;
use rollnet_demo::GameButtons;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Button {
    Up,
    Down,
    Left,
    Right,
}

impl From<Button> for GameButtons {
    fn from(button: Button) -> Self {
        match button {
            Button::Up => GameButtons::UP,
            Button::Down => GameButtons::DOWN,
            Button::Left => GameButtons::LEFT,
            Button::Right => GameButtons::RIGHT,
        }
    }
}

#[derive(Parser)]
#[command(name = "rollnet-client")]
#[command(about = "Headless player for the rollnet demo game")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short, long, default_value_t = rollnet::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = 1)]
    player_id: u32,

    #[arg(long, value_enum, value_delimiter = ',', default_value = "up")]
    hold: Vec<Button>,

    #[arg(long, help = "Disconnect after this many seconds")]
    duration_s: Option<f64>,

    #[arg(short, long, help = "JSON file overriding the default client settings")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info", help = "Log filter used when RUST_LOG is unset")]
    log_level: String,
}

fn load_config(path: Option<&PathBuf>) -> Result<ClientConfig> {
    let Some(path) = path else {
        return Ok(ClientConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    ClientConfig::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn resolve(server: &str, port: u16) -> Result<SocketAddr> {
    (server, port)
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("{}:{} did not resolve", server, port))
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str())).init();

    let config = load_config(args.config.as_ref())?;
    let server_addr = resolve(&args.server, args.port)?;
    let buttons = args
        .hold
        .iter()
        .fold(GameButtons::empty(), |acc, &button| acc | GameButtons::from(button));
    let duration = args
        .duration_s
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("invalid --duration-s")?;

    let running = Arc::new(AtomicBool::new(true));
    bot::spawn_shutdown_listener(Arc::clone(&running))?;

    let mut bot = Bot::connect(server_addr, args.player_id, config, buttons)?;
    bot.run(&running, duration)?;
    log::info!("Disconnected");
    Ok(())
}

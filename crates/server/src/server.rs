use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;

use rollnet::net::udp::{self, MAX_DATAGRAM_SIZE};
use rollnet::server::ServerStats;
use rollnet::{ConnectionRequest, PlayerId, Rejection, ServerConfig, ServerEngine, ServerEvent, UdpTransport};

const PLAYER_HEADER: &str = "player";
const STATS_INTERVAL: Duration = Duration::from_secs(5);

fn authenticate(request: &ConnectionRequest) -> Result<PlayerId, Rejection> {
    let value = request
        .headers
        .get(PLAYER_HEADER)
        .ok_or_else(|| Rejection::new(401, "missing player id"))?;
    value
        .parse()
        .map_err(|_| Rejection::new(400, format!("invalid player id {:?}", value)))
}

/// Drives a [`ServerEngine`] from one nonblocking UDP socket shared by
/// every player.
pub struct GameServer {
    socket: Rc<UdpSocket>,
    local_addr: SocketAddr,
    engine: ServerEngine,
    players: HashMap<SocketAddr, PlayerId>,
    recv_buffer: Vec<u8>,
    start_time: Instant,
    last_stats_time: Instant,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> Result<Self> {
        let socket = udp::bind_nonblocking(bind_addr)?;
        let local_addr = socket.local_addr()?;
        let simulation = rollnet_demo::build_simulation(config.sim_fps)?;

        Ok(Self {
            socket: Rc::new(socket),
            local_addr,
            engine: ServerEngine::new(config, simulation, authenticate),
            players: HashMap::new(),
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            start_time: Instant::now(),
            last_stats_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        self.engine.stats()
    }

    fn now_s(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            self.tick_once()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        self.engine.shutdown();
        self.handle_events();
        Ok(())
    }

    pub fn tick_once(&mut self) -> Result<()> {
        let now_s = self.now_s();
        for (data, addr) in udp::receive_all(&self.socket, &mut self.recv_buffer)? {
            self.handle_datagram(&data, addr, now_s);
        }

        self.engine.update(now_s)?;
        self.handle_events();

        if self.last_stats_time.elapsed() >= STATS_INTERVAL {
            self.last_stats_time = Instant::now();
            let stats = self.engine.stats();
            log::info!(
                "Frame {} ({:.1}s): {} players, {} entities",
                stats.frame_index,
                stats.simulation_time_s,
                stats.player_count,
                stats.entity_count
            );
        }
        Ok(())
    }

    fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr, now_s: f64) {
        let hello = udp::decode_hello(data);
        if let Some(&player_id) = self.players.get(&addr) {
            // Hellos keep coming until the client sees our handshake.
            if hello.is_none() {
                self.engine.receive(player_id, data, now_s);
            }
            return;
        }

        let Some(player_id) = hello else {
            log::debug!("Ignoring {} bytes from unknown address {}", data.len(), addr);
            return;
        };
        let request = ConnectionRequest::new(addr.to_string()).with_header(PLAYER_HEADER, player_id.to_string());
        let transport = UdpTransport::new(Rc::clone(&self.socket), addr);
        if let Ok(player_id) = self.engine.accept(&request, Box::new(transport), now_s) {
            self.players.insert(addr, player_id);
        }
    }

    fn handle_events(&mut self) {
        let events: Vec<ServerEvent> = self.engine.drain_events().collect();
        for event in events {
            match event {
                ServerEvent::PlayerConnected { player_id, peer } => {
                    log::info!("Player {} joined from {}", player_id, peer);
                }
                ServerEvent::PlayerDisconnected { player_id, reason } => {
                    self.players.retain(|_, id| *id != player_id);
                    log::info!("Player {} left: {}", player_id, reason.as_str());
                }
                ServerEvent::ConnectionRejected { peer, rejection } => {
                    log::warn!(
                        "Connection from {} denied ({}): {}",
                        peer,
                        rejection.status,
                        rejection.reason
                    );
                }
            }
        }
    }
}

/// Flips `running` off on Ctrl-C.
pub fn spawn_shutdown_listener(running: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    std::thread::spawn(move || {
        runtime.block_on(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => running.store(false, Ordering::SeqCst),
                Err(e) => log::error!("Failed to listen for Ctrl-C: {}", e),
            }
        });
    });
    Ok(())
}

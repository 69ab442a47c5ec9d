use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use glam::Vec2;

use rollnet::net::udp::{self, MAX_DATAGRAM_SIZE};
use rollnet::{ClientConfig, ClientEngine, ClientState, InputFrame, UdpTransport};
use rollnet_demo::{GameButtons, GameButtonsInput, player_position};

const HELLO_INTERVAL_S: f64 = 0.1;
const REPORT_INTERVAL_S: f64 = 1.0;

/// A headless player that holds a fixed set of buttons and logs where the
/// predicted simulation puts it.
pub struct Bot {
    socket: Rc<UdpSocket>,
    server_addr: SocketAddr,
    client: ClientEngine,
    recv_buffer: Vec<u8>,
    start_time: Instant,
    last_hello_s: Option<f64>,
    last_report_s: f64,
}

impl Bot {
    pub fn connect(server_addr: SocketAddr, player_id: u32, config: ClientConfig, buttons: GameButtons) -> Result<Self> {
        let socket = Rc::new(udp::bind_nonblocking("0.0.0.0:0")?);
        let simulation = rollnet_demo::build_simulation(config.sim_fps)?;
        let transport = UdpTransport::new(Rc::clone(&socket), server_addr);
        let mut client = ClientEngine::new(config, simulation, player_id, Box::new(transport), 0.0)?;
        client.set_input(InputFrame::new().with(GameButtonsInput::new(buttons)));

        log::info!("Connecting to {} as player {}", server_addr, player_id);
        Ok(Self {
            socket,
            server_addr,
            client,
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            start_time: Instant::now(),
            last_hello_s: None,
            last_report_s: 0.0,
        })
    }

    fn now_s(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn run(&mut self, running: &AtomicBool, duration: Option<Duration>) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            if duration.is_some_and(|limit| self.start_time.elapsed() >= limit) {
                break;
            }
            self.tick_once()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        self.client.disconnect();
        Ok(())
    }

    pub fn tick_once(&mut self) -> Result<()> {
        let now_s = self.now_s();
        for (data, addr) in udp::receive_all(&self.socket, &mut self.recv_buffer)? {
            if addr != self.server_addr {
                log::debug!("Ignoring datagram from {}", addr);
                continue;
            }
            self.client.receive(&data, now_s)?;
        }

        if self.client.state() == ClientState::Connecting {
            self.send_hello(now_s);
        }
        self.client.update(now_s)?;

        if now_s - self.last_report_s >= REPORT_INTERVAL_S {
            self.last_report_s = now_s;
            self.report(now_s);
        }
        Ok(())
    }

    fn send_hello(&mut self, now_s: f64) {
        if self.last_hello_s.is_some_and(|last| now_s - last < HELLO_INTERVAL_S) {
            return;
        }
        self.last_hello_s = Some(now_s);
        let hello = udp::encode_hello(self.client.player_id());
        if let Err(e) = self.socket.send_to(&hello, self.server_addr) {
            log::debug!("Hello to {} failed: {}", self.server_addr, e);
        }
    }

    /// Interpolated position at the prediction time.
    fn predicted_position(&self, now_s: f64) -> Option<Vec2> {
        let time_s = self.client.prediction_target_time_s(now_s)?;
        let frames = self.client.simulation().get_simulation_frames(time_s)?;
        let player_id = self.client.player_id();
        let previous = player_position(&frames.previous.state, player_id)?.as_vec2();
        let next = player_position(&frames.next.state, player_id).map_or(previous, |p| p.as_vec2());
        Some(previous.lerp(next, frames.alpha as f32))
    }

    fn report(&self, now_s: f64) {
        let simulation = self.client.simulation();
        let rtt_ms = self.client.rtt_s().map_or(0.0, |rtt| rtt * 1000.0);
        match self.predicted_position(now_s) {
            Some(position) => log::info!(
                "Frame {}: position ({:.2}, {:.2}), rtt {:.1} ms, {} stale updates",
                simulation.newest_frame_index(),
                position.x,
                position.y,
                rtt_ms,
                simulation.discarded_stale()
            ),
            None => log::info!("Waiting for the simulation ({:?})", self.client.state()),
        }
    }
}

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

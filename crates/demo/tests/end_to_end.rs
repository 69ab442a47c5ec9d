use std::collections::BTreeMap;

use rollnet::{
    ClientConfig, ClientEngine, ConnectionRequest, InputFrame, MemoryEndpoint, PlayerId, Rejection, ServerConfig,
    ServerEngine, memory_link,
};
use rollnet_demo::{GameButtons, GameButtonsInput, PLAYER_SPEED, build_simulation, player_position};

const SIM_FPS: u32 = 20;
const WALL_FPS: u32 = 60;

struct Harness {
    server: ServerEngine,
    client: ClientEngine,
    player_id: PlayerId,
    server_end: MemoryEndpoint,
    client_end: MemoryEndpoint,
    /// Serialized server state by frame index, captured after every tick.
    server_states: BTreeMap<u32, Vec<u8>>,
}

impl Harness {
    fn new() -> Self {
        let mut server = ServerEngine::new(
            ServerConfig::default(),
            build_simulation(SIM_FPS).unwrap(),
            |_: &ConnectionRequest| -> Result<PlayerId, Rejection> { Ok(1) },
        );
        let (server_end, client_end) = memory_link(Default::default(), Default::default());
        let player_id = server
            .accept(&ConnectionRequest::new("memory"), Box::new(server_end.transport.clone()), 0.0)
            .unwrap();
        let mut client = ClientEngine::new(
            ClientConfig::default(),
            build_simulation(SIM_FPS).unwrap(),
            player_id,
            Box::new(client_end.transport.clone()),
            0.0,
        )
        .unwrap();
        client.set_input(InputFrame::new().with(GameButtonsInput::new(GameButtons::UP)));

        let mut server_states = BTreeMap::new();
        server_states.insert(0, server.current_frame().state.serialize().unwrap());
        Self {
            server,
            client,
            player_id,
            server_end,
            client_end,
            server_states,
        }
    }

    fn step(&mut self, now_s: f64) {
        self.client.update(now_s).unwrap();
        for datagram in self.server_end.receiver.drain() {
            self.server.receive(self.player_id, &datagram, now_s);
        }

        self.server.update(now_s).unwrap();
        let frame = self.server.current_frame();
        self.server_states
            .insert(frame.frame_index, frame.state.serialize().unwrap());

        for datagram in self.client_end.receiver.drain() {
            self.client.receive(&datagram, now_s).unwrap();
        }
    }

    fn run_until(&mut self, end_s: f64) -> f64 {
        let mut now_s = 0.0;
        let mut i = 0u32;
        while now_s < end_s {
            now_s = f64::from(i) / f64::from(WALL_FPS);
            self.step(now_s);
            i += 1;
        }
        now_s
    }
}

fn server_y(state: &[u8]) -> f32 {
    let engine = build_simulation(SIM_FPS).unwrap();
    let mut db = engine.new_state();
    db.deserialize(state).unwrap();
    player_position(&db, 1).map(|p| p.y).unwrap_or(0.0)
}

#[test]
fn test_held_input_moves_exactly_one_step_per_tick() {
    let mut harness = Harness::new();
    harness.run_until(3.0);
    assert!(harness.client.is_connected());

    let first_moved = harness
        .server_states
        .iter()
        .find(|(_, state)| server_y(state) > 0.0)
        .map(|(&frame, _)| frame)
        .expect("the player never moved");
    let after_one_second = first_moved + SIM_FPS - 1;
    let state = harness
        .server_states
        .get(&after_one_second)
        .expect("frame not captured");

    let mut expected = 0.0f32;
    for _ in 0..SIM_FPS {
        expected += PLAYER_SPEED * (1.0f64 / f64::from(SIM_FPS)) as f32;
    }
    assert_eq!(server_y(state), expected);
}

#[test]
fn test_client_converges_to_server_state() {
    let mut harness = Harness::new();
    let now_s = harness.run_until(3.0);
    harness.client.update(now_s).unwrap();

    let simulation = harness.client.simulation();
    let newest_server_frame = harness.server.frame_index();
    let mut compared = 0;
    for frame in simulation.frames() {
        if frame.frame_index + 5 > newest_server_frame {
            continue;
        }
        let Some(server_state) = harness.server_states.get(&frame.frame_index) else {
            continue;
        };
        assert_eq!(
            &frame.state.serialize().unwrap(),
            server_state,
            "frame {} diverged",
            frame.frame_index
        );
        compared += 1;
    }
    assert!(compared > 10, "only compared {} frames", compared);
}

#[test]
fn test_client_predicts_ahead_of_server() {
    let mut harness = Harness::new();
    harness.run_until(2.0);

    let client_newest = harness.client.simulation().newest_frame_index();
    assert!(client_newest > harness.server.frame_index());
    let predicted = harness.client.simulation().newest_frame().unwrap();
    let server_position = player_position(&harness.server.current_frame().state, 1).unwrap();
    let client_position = player_position(&predicted.state, 1).unwrap();
    assert!(client_position.y > server_position.y);
}

#[test]
fn test_server_drops_backlog_after_a_stall() {
    let mut harness = Harness::new();
    harness.server.update(0.0).unwrap();

    assert_eq!(harness.server.update(1.0).unwrap(), 1);
    assert_eq!(harness.server.frame_index(), 1);
    assert!(harness.server.time_offset_s() < -0.9);
}

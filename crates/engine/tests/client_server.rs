use std::rc::Rc;

use rkyv::{Archive, Deserialize, Serialize};
use rollnet::net::DEFAULT_MTU;
use rollnet::protocol::{TimeSyncRequest, TimeSyncResponse};
use rollnet::{
    ClientConfig, ClientEngine, Component, Connection, ConnectionRequest, Input, InputFrame, MemoryEndpoint, Message,
    PacketLossSimulation, PlayerId, Rejection, ServerConfig, ServerEngine, SimulationEngine, SimulationError,
    StepContext, memory_link,
};

const SIM_FPS: u32 = 20;
const WALL_FPS: u32 = 60;
const COUNTER_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
struct Counter(u32);

impl Component for Counter {
    const NAME: &'static str = "test.Counter";
}

#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
struct Push(u32);

impl Input for Push {
    const NAME: &'static str = "test.Push";
}

fn spawn_counter(ctx: &mut StepContext<'_>) -> Result<(), SimulationError> {
    if ctx.frame_index == 1 {
        let entity = ctx.state.create_entity()?;
        ctx.state.insert(entity, Counter(0))?;
    }
    Ok(())
}

fn count_pushes(ctx: &mut StepContext<'_>) -> Result<(), SimulationError> {
    let pushes: u32 = ctx.inputs.values().map(|frame| frame.get_or_default::<Push>().0).sum();
    for entity in ctx.state.entities_with::<Counter>() {
        let Some(counter) = ctx.state.get_mut::<Counter>(entity) else {
            continue;
        };
        counter.0 += pushes;
        if counter.0 >= COUNTER_LIMIT {
            ctx.state.delete_entity(entity)?;
        }
    }
    Ok(())
}

fn count_pushes_unbounded(ctx: &mut StepContext<'_>) -> Result<(), SimulationError> {
    let pushes: u32 = ctx.inputs.values().map(|frame| frame.get_or_default::<Push>().0).sum();
    for entity in ctx.state.entities_with::<Counter>() {
        if let Some(counter) = ctx.state.get_mut::<Counter>(entity) {
            counter.0 += pushes;
        }
    }
    Ok(())
}

fn simulation(limit_counter: bool) -> SimulationEngine {
    let builder = SimulationEngine::builder(SIM_FPS)
        .unwrap()
        .component::<Counter>()
        .unwrap()
        .input::<Push>()
        .unwrap()
        .system(spawn_counter);
    let builder = if limit_counter {
        builder.system(count_pushes)
    } else {
        builder.system(count_pushes_unbounded)
    };
    builder.build().unwrap()
}

struct Session {
    server: ServerEngine,
    client: ClientEngine,
    player_id: PlayerId,
    server_end: MemoryEndpoint,
    client_end: MemoryEndpoint,
    counters: Vec<(u32, Option<u32>)>,
}

impl Session {
    fn new(limit_counter: bool, up: PacketLossSimulation, down: PacketLossSimulation) -> Self {
        let mut server = ServerEngine::new(
            ServerConfig::default(),
            simulation(limit_counter),
            |_: &ConnectionRequest| -> Result<PlayerId, Rejection> { Ok(7) },
        );
        let (server_end, client_end) = memory_link(down, up);
        let player_id = server
            .accept(&ConnectionRequest::new("memory"), Box::new(server_end.transport.clone()), 0.0)
            .unwrap();
        let mut client = ClientEngine::new(
            ClientConfig::default(),
            simulation(limit_counter),
            player_id,
            Box::new(client_end.transport.clone()),
            0.0,
        )
        .unwrap();
        client.set_input(InputFrame::new().with(Push(1)));
        Self {
            server,
            client,
            player_id,
            server_end,
            client_end,
            counters: vec![(0, None)],
        }
    }

    fn run(&mut self, seconds: u32) -> f64 {
        let mut now_s = 0.0;
        for i in 0..=seconds * WALL_FPS {
            now_s = f64::from(i) / f64::from(WALL_FPS);
            self.client.update(now_s).unwrap();
            for datagram in self.server_end.receiver.drain() {
                self.server.receive(self.player_id, &datagram, now_s);
            }
            self.server.update(now_s).unwrap();
            let frame = self.server.current_frame();
            self.counters
                .push((frame.frame_index, counter_value(&frame.state)));
            for datagram in self.client_end.receiver.drain() {
                self.client.receive(&datagram, now_s).unwrap();
            }
        }
        now_s
    }
}

fn counter_value(state: &rollnet::EntityComponentDb) -> Option<u32> {
    state.view().query::<Counter>().map(|(_, counter)| counter.0).next()
}

#[test]
fn test_reliable_messages_survive_loss() {
    let engine = simulation(false);
    let (a_end, b_end) = memory_link(PacketLossSimulation::lossy(25.0, 1), PacketLossSimulation::lossy(25.0, 2));
    let mut a = Connection::new(Box::new(a_end.transport.clone()), Rc::clone(engine.registry()), DEFAULT_MTU, 8).unwrap();
    let mut b = Connection::new(Box::new(b_end.transport.clone()), Rc::clone(engine.registry()), DEFAULT_MTU, 8).unwrap();

    for i in 0..40u32 {
        a.send(&TimeSyncRequest { client_time_s: f64::from(i) }, None).unwrap();
        b.send(
            &TimeSyncResponse {
                client_time_s: f64::from(i),
                server_time_s: 0.0,
            },
            None,
        )
        .unwrap();
    }

    let mut at_b = vec![0u32; 40];
    let mut at_a = vec![0u32; 40];
    for round in 0..300u32 {
        let now_s = f64::from(round) * 0.01;
        a.flush(now_s).unwrap();
        b.flush(now_s).unwrap();
        for datagram in b_end.receiver.drain() {
            for message in b.receive(&datagram, now_s).unwrap().messages {
                if let Message::TimeSyncRequest(request) = message {
                    at_b[request.client_time_s as usize] += 1;
                }
            }
        }
        for datagram in a_end.receiver.drain() {
            for message in a.receive(&datagram, now_s).unwrap().messages {
                if let Message::TimeSyncResponse(response) = message {
                    at_a[response.client_time_s as usize] += 1;
                }
            }
        }
    }

    assert!(a.is_handshake_complete() && b.is_handshake_complete());
    assert!(at_b.iter().all(|&count| count == 1), "{:?}", at_b);
    assert!(at_a.iter().all(|&count| count == 1), "{:?}", at_a);
    assert!(a_end.receiver.dropped() + b_end.receiver.dropped() > 0);
    a.flush(3.0).unwrap();
    assert_eq!(a.pending_messages(), 0);
}

#[test]
fn test_session_converges_over_lossy_link() {
    let mut session = Session::new(
        false,
        PacketLossSimulation::lossy(10.0, 3),
        PacketLossSimulation::lossy(10.0, 4),
    );
    let now_s = session.run(4);
    session.client.update(now_s).unwrap();

    assert!(session.client.is_connected());
    assert!(session.server.is_connected(session.player_id));
    let server_frame = session.server.frame_index();
    assert!(server_frame >= 4 * SIM_FPS - 1);

    let checked = server_frame - 10;
    let expected = session
        .counters
        .iter()
        .find(|(frame, _)| *frame == checked)
        .and_then(|(_, value)| *value);
    let client_frame = session
        .client
        .simulation()
        .frame(checked)
        .expect("frame still in the client history");
    assert!(expected.is_some());
    assert_eq!(counter_value(&client_frame.state), expected);
}

#[test]
fn test_deletions_reach_the_client() {
    let mut session = Session::new(true, Default::default(), Default::default());
    let now_s = session.run(3);
    session.client.update(now_s).unwrap();

    assert!(session.counters.iter().any(|(_, value)| value.is_some()));
    assert_eq!(session.server.current_frame().state.entity_count(), 0);

    let newest = session.client.simulation().newest_frame().unwrap();
    assert_eq!(newest.state.entity_count(), 0);
    let history_matches = session.client.simulation().frames().all(|frame| {
        session
            .counters
            .iter()
            .filter(|(index, _)| *index == frame.frame_index)
            .all(|(_, value)| counter_value(&frame.state) == *value)
    });
    assert!(history_matches);
}

#[test]
fn test_time_sync_tracks_server_clock() {
    let mut session = Session::new(false, Default::default(), Default::default());
    let now_s = session.run(2);

    let server_time_s = session.server.target_simulation_time_s(now_s);
    let estimate_s = session.client.time_sync().server_time_s(now_s).unwrap();
    assert!((server_time_s - estimate_s).abs() < 1e-6);
    assert!(session.client.time_sync().sample_count() > 1);
}

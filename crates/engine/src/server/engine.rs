use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::codec::CodecError;
use crate::net::{Connection, MessageHandle, NetError, NetworkStats, Transport};
use crate::protocol::{
    ComponentRef, ComponentStateMessage, ComponentUpdate, DeletionsMessage, InputsUsedMessage, Message,
    PlayerInputs, TimeSyncResponse,
};
use crate::simulation::{PlayerId, SimulationEngine, SimulationFrameData};

use super::config::ServerConfig;
use super::error::ServerError;
use super::events::{Authenticator, ConnectionRequest, DisconnectReason, Rejection, ServerEvent};
use super::input::ServerInputHandler;
use super::replication::{ComponentReplicationChooser, ReplicatedComponent};

/// Component-state messages whose ack is still worth waiting for.
const MAX_PENDING_COMPONENT_ACKS: usize = 256;
const TIME_EPSILON_S: f64 = 1e-9;

/// Everything one tick sends, serialized once and shared by all peers.
struct OutgoingFrame {
    frame_index: u32,
    simulation_time_s: f64,
    inputs_used: InputsUsedMessage,
    live: Vec<ReplicatedComponent>,
    deletions: DeletionsMessage,
}

struct ServerPeer {
    peer: String,
    connection: Connection,
    chooser: ComponentReplicationChooser,
    pending_component_acks: BTreeMap<MessageHandle, Vec<ReplicatedComponent>>,
    last_inputs_used: Option<MessageHandle>,
    last_component_state: Option<MessageHandle>,
    last_receive_s: f64,
}

impl ServerPeer {
    fn send_frame(
        &mut self,
        outgoing: &OutgoingFrame,
        simulation: &SimulationEngine,
        now_s: f64,
    ) -> Result<(), NetError> {
        if let Some(handle) = self.last_inputs_used.take() {
            self.connection.expire(handle);
        }
        self.last_inputs_used = Some(self.connection.send(&outgoing.inputs_used, None)?);

        let budget_bytes = self.connection.mtu() / 2;
        let chosen = self.chooser.choose_components(&outgoing.live, budget_bytes);
        if let Some(handle) = self.last_component_state.take() {
            self.connection.expire(handle);
        }
        if !chosen.is_empty() {
            let message = ComponentStateMessage {
                frame_index: outgoing.frame_index,
                simulation_time_s: outgoing.simulation_time_s,
                components: chosen
                    .iter()
                    .filter_map(|component| {
                        let short_id = simulation.component_short_id(component.id.type_id)?;
                        Some(ComponentUpdate {
                            short_type_id: short_id.0,
                            owner_id: component.id.owner.0,
                            bytes: component.bytes.to_vec(),
                        })
                    })
                    .collect(),
            };
            let handle = self.connection.send(&message, None)?;
            self.pending_component_acks.insert(handle, chosen);
            while self.pending_component_acks.len() > MAX_PENDING_COMPONENT_ACKS {
                self.pending_component_acks.pop_first();
            }
            self.last_component_state = Some(handle);
        }

        if !outgoing.deletions.is_empty() {
            self.connection.send(&outgoing.deletions, None)?;
        }

        self.connection.flush(now_s)
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub frame_index: u32,
    pub simulation_time_s: f64,
    pub player_count: usize,
    pub entity_count: usize,
}

/// The authoritative loop. Owns the current frame, one connection per
/// player, and the wall-clock to simulation-time mapping.
pub struct ServerEngine {
    config: ServerConfig,
    simulation: SimulationEngine,
    authenticator: Box<dyn Authenticator>,
    peers: BTreeMap<PlayerId, ServerPeer>,
    input_handler: ServerInputHandler,
    current: SimulationFrameData,
    start_time_s: Option<f64>,
    time_offset_s: f64,
    pending_events: VecDeque<ServerEvent>,
}

impl ServerEngine {
    pub fn new(config: ServerConfig, simulation: SimulationEngine, authenticator: impl Authenticator + 'static) -> Self {
        if config.sim_fps != simulation.sim_fps() {
            log::warn!(
                "Configured sim_fps {} differs from the simulation's {}; using {}",
                config.sim_fps,
                simulation.sim_fps(),
                simulation.sim_fps()
            );
        }
        let current = simulation.new_frame(0);
        Self {
            input_handler: ServerInputHandler::new(config.max_input_lead_s),
            config,
            simulation,
            authenticator: Box::new(authenticator),
            peers: BTreeMap::new(),
            current,
            start_time_s: None,
            time_offset_s: 0.0,
            pending_events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn simulation(&self) -> &SimulationEngine {
        &self.simulation
    }

    pub fn current_frame(&self) -> &SimulationFrameData {
        &self.current
    }

    /// For seeding the world before the first tick.
    pub fn current_frame_mut(&mut self) -> &mut SimulationFrameData {
        &mut self.current
    }

    pub fn frame_index(&self) -> u32 {
        self.current.frame_index
    }

    pub fn time_offset_s(&self) -> f64 {
        self.time_offset_s
    }

    pub fn player_ids(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.peers.keys().copied()
    }

    pub fn is_connected(&self, player_id: PlayerId) -> bool {
        self.peers.contains_key(&player_id)
    }

    pub fn network_stats(&self, player_id: PlayerId) -> Option<&NetworkStats> {
        self.peers.get(&player_id).map(|peer| peer.connection.stats())
    }

    pub fn rtt_s(&self, player_id: PlayerId) -> Option<f64> {
        self.peers.get(&player_id)?.connection.rtt_s()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            frame_index: self.current.frame_index,
            simulation_time_s: self.current.simulation_time_s,
            player_count: self.peers.len(),
            entity_count: self.current.state.entity_count(),
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Wall-clock time mapped onto the simulation timeline.
    pub fn target_simulation_time_s(&self, now_s: f64) -> f64 {
        match self.start_time_s {
            Some(start_s) => (now_s - start_s) * self.config.global_simulation_rate_multiplier + self.time_offset_s,
            None => self.current.simulation_time_s,
        }
    }

    pub fn accept(
        &mut self,
        request: &ConnectionRequest,
        transport: Box<dyn Transport>,
        now_s: f64,
    ) -> Result<PlayerId, Rejection> {
        let player_id = match self.authenticator.authenticate(request) {
            Ok(player_id) => player_id,
            Err(rejection) => return Err(self.reject(request, rejection)),
        };
        if self.peers.contains_key(&player_id) {
            let rejection = Rejection::new(409, format!("player {} is already connected", player_id));
            return Err(self.reject(request, rejection));
        }

        let connection = match Connection::new(
            transport,
            Rc::clone(self.simulation.registry()),
            self.config.mtu,
            self.config.replication.pack_slack_bytes,
        ) {
            Ok(connection) => connection,
            Err(e) => return Err(self.reject(request, Rejection::new(500, e.to_string()))),
        };

        self.peers.insert(
            player_id,
            ServerPeer {
                peer: request.peer.clone(),
                connection,
                chooser: ComponentReplicationChooser::new(self.config.replication.clone()),
                pending_component_acks: BTreeMap::new(),
                last_inputs_used: None,
                last_component_state: None,
                last_receive_s: now_s,
            },
        );
        self.input_handler.add_player(player_id);

        log::info!("Player {} connected from {}", player_id, request.peer);
        self.pending_events.push_back(ServerEvent::PlayerConnected {
            player_id,
            peer: request.peer.clone(),
        });
        Ok(player_id)
    }

    fn reject(&mut self, request: &ConnectionRequest, rejection: Rejection) -> Rejection {
        log::info!(
            "Rejected connection from {}: {} {}",
            request.peer,
            rejection.status,
            rejection.reason
        );
        self.pending_events.push_back(ServerEvent::ConnectionRejected {
            peer: request.peer.clone(),
            rejection: rejection.clone(),
        });
        rejection
    }

    /// Feeds one inbound datagram. A protocol violation disconnects the player.
    pub fn receive(&mut self, player_id: PlayerId, data: &[u8], now_s: f64) {
        if !self.peers.contains_key(&player_id) {
            log::debug!("Ignoring datagram for unknown player {}", player_id);
            return;
        }
        if let Err(e) = self.handle_datagram(player_id, data, now_s) {
            log::warn!("Protocol error from player {}: {}", player_id, e);
            self.disconnect(player_id, DisconnectReason::ProtocolError(e.to_string()));
        }
    }

    fn handle_datagram(&mut self, player_id: PlayerId, data: &[u8], now_s: f64) -> Result<(), ServerError> {
        let current_time_s = self.current.simulation_time_s;
        let server_time_s = self.target_simulation_time_s(now_s);
        let peer = self
            .peers
            .get_mut(&player_id)
            .ok_or(ServerError::UnknownPlayer(player_id))?;
        peer.last_receive_s = now_s;

        let events = peer.connection.receive(data, now_s)?;
        if events.handshake_completed {
            log::debug!("Handshake with player {} complete", player_id);
        }
        for handle in events.acked {
            if let Some(components) = peer.pending_component_acks.remove(&handle) {
                peer.chooser.on_components_acked(&components);
            }
        }

        let mut answered_time_sync = false;
        for message in events.messages {
            match message {
                Message::TimeSyncRequest(request) => {
                    let response = TimeSyncResponse {
                        client_time_s: request.client_time_s,
                        server_time_s,
                    };
                    peer.connection.send(&response, Some(1))?;
                    answered_time_sync = true;
                }
                Message::InputFrame(input) => {
                    let frame = self.simulation.decode_input_frame(&input.input_frame)?;
                    self.input_handler.on_input(
                        player_id,
                        input.target_simulation_time_s,
                        frame,
                        input.sequence_number,
                        current_time_s,
                    );
                }
                other => return Err(NetError::UnhandledMessage { name: other.name() }.into()),
            }
        }

        // Answer time sync now rather than on the next tick to keep the
        // round trip tight.
        if answered_time_sync {
            peer.connection.flush(now_s)?;
        }
        Ok(())
    }

    /// Runs every tick owed at `now_s` and returns how many ran.
    pub fn update(&mut self, now_s: f64) -> Result<u32, ServerError> {
        self.start_time_s.get_or_insert(now_s);
        let dt_s = self.simulation.dt_s();

        let owed_s = self.target_simulation_time_s(now_s) - self.current.simulation_time_s;
        let max_backlog_s = f64::from(self.config.max_backlog_ticks) * dt_s;
        if owed_s > max_backlog_s + TIME_EPSILON_S {
            let discarded_s = owed_s - dt_s;
            self.time_offset_s -= discarded_s;
            log::warn!(
                "Simulation is {:.1} ticks behind; dropping {:.3}s of simulation time",
                owed_s / dt_s,
                discarded_s
            );
        }

        let mut ticks = 0;
        while self.target_simulation_time_s(now_s) - self.current.simulation_time_s >= dt_s - TIME_EPSILON_S {
            self.tick(now_s)?;
            ticks += 1;
        }

        self.disconnect_timed_out(now_s);
        Ok(ticks)
    }

    fn tick(&mut self, now_s: f64) -> Result<(), ServerError> {
        let mut next = self.simulation.new_frame(self.current.frame_index + 1);
        next.inputs = self.input_handler.get_inputs_for_sim_time(next.simulation_time_s);
        self.simulation.step_simulation(&self.current, &mut next)?;
        self.simulation.quantize(&mut next)?;
        self.current = next;

        let outgoing = self.prepare_outgoing()?;
        let mut failed = Vec::new();
        for (player_id, peer) in &mut self.peers {
            if let Err(e) = peer.send_frame(&outgoing, &self.simulation, now_s) {
                failed.push((*player_id, e));
            }
        }
        for (player_id, e) in failed {
            log::warn!("Failed to send frame to player {}: {}", player_id, e);
            let reason = match e {
                NetError::Transport(_) | NetError::Closed => DisconnectReason::TransportClosed,
                other => DisconnectReason::ProtocolError(other.to_string()),
            };
            self.disconnect(player_id, reason);
        }

        self.current.state.release_deleted_state();
        Ok(())
    }

    fn prepare_outgoing(&self) -> Result<OutgoingFrame, ServerError> {
        let frame = &self.current;

        let mut live = Vec::new();
        for id in frame.state.live_components() {
            if self.simulation.component_short_id(id.type_id).is_none() {
                continue;
            }
            if let Some(bytes) = frame.state.encode_component(id)? {
                live.push(ReplicatedComponent::new(id, bytes));
            }
        }

        let inputs = frame
            .inputs
            .iter()
            .map(|(player_id, input)| {
                Ok(PlayerInputs {
                    player_id: *player_id,
                    input_frame: input.encode()?,
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;

        let (deleted_components, deleted_entities) = frame.state.deletions();
        let deletions = DeletionsMessage {
            frame_index: frame.frame_index,
            simulation_time_s: frame.simulation_time_s,
            component_ids: deleted_components
                .into_iter()
                .filter_map(|id| {
                    let short_id = self.simulation.component_short_id(id.type_id)?;
                    Some(ComponentRef {
                        short_type_id: short_id.0,
                        owner_id: id.owner.0,
                    })
                })
                .collect(),
            entity_ids: deleted_entities.into_iter().map(|entity| entity.0).collect(),
        };

        Ok(OutgoingFrame {
            frame_index: frame.frame_index,
            simulation_time_s: frame.simulation_time_s,
            inputs_used: InputsUsedMessage {
                frame_index: frame.frame_index,
                simulation_time_s: frame.simulation_time_s,
                inputs,
            },
            live,
            deletions,
        })
    }

    fn disconnect_timed_out(&mut self, now_s: f64) {
        let timed_out: Vec<PlayerId> = self
            .peers
            .iter()
            .filter(|(_, peer)| now_s - peer.last_receive_s > self.config.peer_timeout_s)
            .map(|(player_id, _)| *player_id)
            .collect();
        for player_id in timed_out {
            self.disconnect(player_id, DisconnectReason::Timeout);
        }
    }

    /// Closes the player's connection and queues a disconnect event. Returns
    /// `false` if the player was already gone.
    pub fn disconnect(&mut self, player_id: PlayerId, reason: DisconnectReason) -> bool {
        let Some(mut peer) = self.peers.remove(&player_id) else {
            return false;
        };
        peer.connection.close();
        self.input_handler.remove_player(player_id);

        log::info!("Player {} ({}) disconnected: {}", player_id, peer.peer, reason.as_str());
        self.pending_events
            .push_back(ServerEvent::PlayerDisconnected { player_id, reason });
        true
    }

    pub fn shutdown(&mut self) {
        let player_ids: Vec<PlayerId> = self.peers.keys().copied().collect();
        for player_id in player_ids {
            self.disconnect(player_id, DisconnectReason::Graceful);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::Component;
    use crate::net::{DEFAULT_MTU, MemoryEndpoint, memory_link};
    use crate::protocol::{InputFrameMessage, TimeSyncRequest};
    use crate::simulation::{Input, InputFrame, SimulationError, StepContext};
    use rkyv::{Archive, Deserialize, Serialize};

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

    fn count_pushes(ctx: &mut StepContext<'_>) -> Result<(), SimulationError> {
        let pushes: u32 = ctx.inputs.values().map(|frame| frame.get_or_default::<Push>().0).sum();
        for entity in ctx.state.entities_with::<Counter>() {
            if let Some(counter) = ctx.state.get_mut::<Counter>(entity) {
                counter.0 += pushes;
            }
        }
        Ok(())
    }

    fn simulation() -> SimulationEngine {
        SimulationEngine::builder(20)
            .unwrap()
            .component::<Counter>()
            .unwrap()
            .input::<Push>()
            .unwrap()
            .system(count_pushes)
            .build()
            .unwrap()
    }

    fn server() -> ServerEngine {
        ServerEngine::new(
            ServerConfig::default(),
            simulation(),
            |request: &ConnectionRequest| -> Result<PlayerId, Rejection> {
                match request.headers.get("player") {
                    Some(id) => id.parse().map_err(|_| Rejection::new(400, "bad player id")),
                    None => Err(Rejection::new(401, "missing player header")),
                }
            },
        )
    }

    fn connect(server: &mut ServerEngine, player: &str) -> (PlayerId, Connection, MemoryEndpoint, MemoryEndpoint) {
        let (server_end, client_end) = memory_link(Default::default(), Default::default());
        let request = ConnectionRequest::new("memory").with_header("player", player);
        let player_id = server
            .accept(&request, Box::new(server_end.transport.clone()), 0.0)
            .unwrap();
        let client = Connection::new(
            Box::new(client_end.transport.clone()),
            Rc::clone(server.simulation().registry()),
            DEFAULT_MTU,
            8,
        )
        .unwrap();
        (player_id, client, server_end, client_end)
    }

    fn pump(server: &mut ServerEngine, player_id: PlayerId, server_end: &MemoryEndpoint, now_s: f64) {
        for datagram in server_end.receiver.drain() {
            server.receive(player_id, &datagram, now_s);
        }
    }

    fn client_messages(client: &mut Connection, client_end: &MemoryEndpoint) -> Vec<Message> {
        let mut messages = Vec::new();
        for datagram in client_end.receiver.drain() {
            messages.extend(client.receive(&datagram, 0.0).unwrap().messages);
        }
        messages
    }

    #[test]
    fn test_backlog_is_clamped_to_one_tick() {
        let mut server = server();
        let dt = 1.0 / 20.0;
        assert_eq!(server.update(0.0).unwrap(), 0);

        assert_eq!(server.update(10.0 * dt).unwrap(), 1);
        assert_eq!(server.frame_index(), 1);
        assert!((server.time_offset_s() + 9.0 * dt).abs() < 1e-9);

        // The slipped clock then advances normally.
        assert_eq!(server.update(11.0 * dt).unwrap(), 1);
        assert_eq!(server.frame_index(), 2);
    }

    #[test]
    fn test_backlog_within_limit_is_worked_off() {
        let mut server = server();
        let dt = 1.0 / 20.0;
        server.update(0.0).unwrap();
        assert_eq!(server.update(4.0 * dt).unwrap(), 4);
        assert_eq!(server.time_offset_s(), 0.0);
    }

    #[test]
    fn test_rejection_is_reported() {
        let mut server = server();
        let (server_end, _client_end) = memory_link(Default::default(), Default::default());
        let rejection = server
            .accept(&ConnectionRequest::new("anon"), Box::new(server_end.transport), 0.0)
            .unwrap_err();
        assert_eq!(rejection.status, 401);
        let events: Vec<ServerEvent> = server.drain_events().collect();
        assert!(matches!(events[..], [ServerEvent::ConnectionRejected { .. }]));
    }

    #[test]
    fn test_duplicate_player_is_rejected() {
        let mut server = server();
        let _first = connect(&mut server, "3");
        let (server_end, _client_end) = memory_link(Default::default(), Default::default());
        let request = ConnectionRequest::new("memory").with_header("player", "3");
        let rejection = server
            .accept(&request, Box::new(server_end.transport), 0.0)
            .unwrap_err();
        assert_eq!(rejection.status, 409);
    }

    #[test]
    fn test_time_sync_is_answered_immediately() {
        let mut server = server();
        let (player_id, mut client, server_end, client_end) = connect(&mut server, "1");

        client.send(&TimeSyncRequest { client_time_s: 1.5 }, None).unwrap();
        client.flush(0.0).unwrap();
        pump(&mut server, player_id, &server_end, 0.0);

        let messages = client_messages(&mut client, &client_end);
        assert!(matches!(
            messages[..],
            [Message::TimeSyncResponse(TimeSyncResponse { client_time_s, .. })] if client_time_s == 1.5
        ));
    }

    #[test]
    fn test_inputs_drive_the_simulation_and_are_echoed() {
        let mut server = server();
        let entity = server.current_frame_mut().state.create_entity().unwrap();
        server.current_frame_mut().state.insert(entity, Counter(0)).unwrap();
        let (player_id, mut client, server_end, client_end) = connect(&mut server, "1");

        let input = InputFrameMessage {
            target_simulation_time_s: 0.0,
            input_frame: InputFrame::new().with(Push(2)).encode().unwrap(),
            sequence_number: 1,
        };
        client.send(&input, None).unwrap();
        client.flush(0.0).unwrap();
        pump(&mut server, player_id, &server_end, 0.0);

        let dt = 1.0 / 20.0;
        server.update(0.0).unwrap();
        assert_eq!(server.update(3.0 * dt).unwrap(), 3);
        assert_eq!(server.current_frame().state.get::<Counter>(entity), Some(&Counter(6)));

        let messages = client_messages(&mut client, &client_end);
        assert!(messages.iter().any(|message| matches!(
            message,
            Message::InputsUsed(used) if used.inputs.iter().any(|inputs| inputs.player_id == player_id)
        )));
        assert!(
            messages
                .iter()
                .any(|message| matches!(message, Message::ComponentState(state) if !state.components.is_empty()))
        );
    }

    #[test]
    fn test_deletions_are_sent_once_and_released() {
        let mut server = server();
        let entity = server.current_frame_mut().state.create_entity().unwrap();
        server.current_frame_mut().state.insert(entity, Counter(0)).unwrap();
        let (_player_id, mut client, _server_end, client_end) = connect(&mut server, "1");

        server.update(0.0).unwrap();
        server.current_frame_mut().state.delete_entity(entity).unwrap();
        // The deletion is replicated by the next tick's frame, which copies it.
        server.update(1.0 / 20.0).unwrap();

        assert!(!server.current_frame().state.contains_entity(entity));
        let messages = client_messages(&mut client, &client_end);
        assert!(messages.iter().any(|message| matches!(
            message,
            Message::Deletions(deletions) if deletions.entity_ids == vec![entity.0]
        )));
    }

    #[test]
    fn test_unhandled_message_disconnects_once() {
        let mut server = server();
        let (player_id, mut client, server_end, _client_end) = connect(&mut server, "5");
        server.drain_events().for_each(drop);

        let echo = InputsUsedMessage {
            frame_index: 0,
            simulation_time_s: 0.0,
            inputs: Vec::new(),
        };
        client.send(&echo, None).unwrap();
        client.flush(0.0).unwrap();
        pump(&mut server, player_id, &server_end, 0.0);

        assert!(!server.is_connected(player_id));
        assert!(!server.disconnect(player_id, DisconnectReason::Kicked));
        let events: Vec<ServerEvent> = server.drain_events().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ServerEvent::PlayerDisconnected { reason: DisconnectReason::ProtocolError(_), .. }
        ));
    }

    #[test]
    fn test_silent_player_times_out() {
        let mut server = server();
        let (player_id, _client, _server_end, _client_end) = connect(&mut server, "2");
        server.update(0.0).unwrap();
        server.update(5.0).unwrap();
        assert!(server.is_connected(player_id));
        server.update(10.5).unwrap();
        assert!(!server.is_connected(player_id));
    }
}

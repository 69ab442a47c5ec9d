use std::collections::BTreeMap;
use std::rc::Rc;

use crate::ecs::{ComponentId, EntityId};
use crate::net::{Connection, NetError, NetworkStats, Transport};
use crate::protocol::{InputFrameMessage, Message};
use crate::simulation::{InputFrame, PlayerId, SimulationEngine, SimulationError};

use super::config::ClientConfig;
use super::error::ClientError;
use super::simulation::ClientSimulation;
use super::time_sync::TimeSync;

const TIME_EPSILON_S: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnected,
}

/// Owns the server connection and the predicted simulation.
///
/// Call [`ClientEngine::receive`] for every inbound datagram and
/// [`ClientEngine::update`] once per local frame.
pub struct ClientEngine {
    config: ClientConfig,
    player_id: PlayerId,
    connection: Connection,
    simulation: ClientSimulation,
    time_sync: TimeSync,
    state: ClientState,
    connect_started_s: f64,
    local_input: InputFrame,
    next_input_sequence: u32,
    last_input_frame: Option<u32>,
}

impl ClientEngine {
    pub fn new(
        config: ClientConfig,
        engine: SimulationEngine,
        player_id: PlayerId,
        transport: Box<dyn Transport>,
        now_s: f64,
    ) -> Result<Self, ClientError> {
        let connection = Connection::new(
            transport,
            Rc::clone(engine.registry()),
            config.mtu,
            config.pack_slack_bytes,
        )?;
        let time_sync = TimeSync::new(config.time_sync_interval_s, config.time_sync_samples);
        let simulation = ClientSimulation::new(engine, config.history_s, player_id);
        Ok(Self {
            config,
            player_id,
            connection,
            simulation,
            time_sync,
            state: ClientState::Connecting,
            connect_started_s: now_s,
            local_input: InputFrame::new(),
            next_input_sequence: 1,
            last_input_frame: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn simulation(&self) -> &ClientSimulation {
        &self.simulation
    }

    pub fn time_sync(&self) -> &TimeSync {
        &self.time_sync
    }

    pub fn stats(&self) -> &NetworkStats {
        self.connection.stats()
    }

    pub fn rtt_s(&self) -> Option<f64> {
        self.time_sync.rtt_s().or_else(|| self.connection.rtt_s())
    }

    /// Continuous input: it is resent for every new frame until replaced.
    pub fn set_input(&mut self, input: InputFrame) {
        self.local_input = input;
    }

    /// Where local prediction runs: the estimated server time, plus the time
    /// an input needs to reach the server, plus a safety margin.
    pub fn prediction_target_time_s(&self, now_s: f64) -> Option<f64> {
        let server_time_s = self.time_sync.server_time_s(now_s)?;
        let rtt_s = self.time_sync.rtt_s().unwrap_or(0.0);
        Some(server_time_s + rtt_s / 2.0 + self.config.input_lead_s)
    }

    pub fn update(&mut self, now_s: f64) -> Result<(), ClientError> {
        match self.state {
            ClientState::Disconnected => return Err(ClientError::Disconnected),
            ClientState::Connecting if now_s - self.connect_started_s > self.config.connect_timeout_s => {
                log::warn!("Timed out waiting for the server handshake");
                self.disconnect();
                return Err(ClientError::ConnectTimeout {
                    timeout_s: self.config.connect_timeout_s,
                });
            }
            _ => {}
        }

        let result = self.update_connected(now_s);
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    fn update_connected(&mut self, now_s: f64) -> Result<(), ClientError> {
        if let Some(request) = self.time_sync.poll_request(now_s) {
            self.connection.send(&request, Some(1))?;
        }

        if self.state == ClientState::Connected
            && let Some(target_s) = self.prediction_target_time_s(now_s)
        {
            self.submit_input(target_s)?;
            self.simulation.do_simulation_work(target_s)?;
        }

        self.connection.flush(now_s)?;
        Ok(())
    }

    fn submit_input(&mut self, target_s: f64) -> Result<(), ClientError> {
        let engine = self.simulation.engine();
        let frame_index = (target_s.max(0.0) * f64::from(engine.sim_fps()) + TIME_EPSILON_S).floor() as u32;
        if self.last_input_frame.is_some_and(|last| frame_index <= last) {
            return Ok(());
        }

        let message = InputFrameMessage {
            target_simulation_time_s: engine.frame_time_s(frame_index),
            input_frame: engine.encode_input_frame(&self.local_input)?,
            sequence_number: self.next_input_sequence,
        };
        self.next_input_sequence = self.next_input_sequence.wrapping_add(1);
        self.connection.send(&message, Some(self.config.input_ttl_sends))?;
        self.simulation.set_predicted_input(frame_index, self.local_input.clone());
        self.last_input_frame = Some(frame_index);
        Ok(())
    }

    pub fn receive(&mut self, data: &[u8], now_s: f64) -> Result<(), ClientError> {
        if self.state == ClientState::Disconnected {
            return Err(ClientError::Disconnected);
        }
        let result = self.handle_datagram(data, now_s);
        if let Err(e) = &result {
            log::warn!("Dropping connection: {}", e);
            self.disconnect();
        }
        result
    }

    fn handle_datagram(&mut self, data: &[u8], now_s: f64) -> Result<(), ClientError> {
        let events = self.connection.receive(data, now_s)?;
        if events.handshake_completed && self.state == ClientState::Connecting {
            log::info!("Connected as player {}", self.player_id);
            self.state = ClientState::Connected;
        }
        for message in events.messages {
            self.handle_message(message, now_s)?;
        }
        Ok(())
    }

    fn handle_message(&mut self, message: Message, now_s: f64) -> Result<(), ClientError> {
        match message {
            Message::TimeSyncResponse(response) => {
                self.time_sync.on_response(&response, now_s);
            }
            Message::InputsUsed(used) => {
                let engine = self.simulation.engine();
                let inputs = used
                    .inputs
                    .iter()
                    .map(|player| Ok((player.player_id, engine.decode_input_frame(&player.input_frame)?)))
                    .collect::<Result<BTreeMap<_, _>, SimulationError>>()?;
                self.simulation.on_inputs_used(used.frame_index, inputs);
            }
            Message::ComponentState(state) => {
                let updates = state
                    .components
                    .into_iter()
                    .map(|update| Ok((self.component_id(update.short_type_id, update.owner_id)?, update.bytes)))
                    .collect::<Result<Vec<_>, ClientError>>()?;
                self.simulation.on_component_state(state.frame_index, updates);
            }
            Message::Deletions(deletions) => {
                let components = deletions
                    .component_ids
                    .iter()
                    .map(|component| self.component_id(component.short_type_id, component.owner_id))
                    .collect::<Result<Vec<_>, ClientError>>()?;
                let entities = deletions.entity_ids.iter().copied().map(EntityId).collect();
                self.simulation
                    .on_deletions(deletions.frame_index, components, entities);
            }
            other => return Err(NetError::UnhandledMessage { name: other.name() }.into()),
        }
        Ok(())
    }

    /// Maps a component reference in the server's numbering to ours.
    fn component_id(&self, remote_short_id: u16, owner: u32) -> Result<ComponentId, ClientError> {
        let remote = self.connection.remote_classes().ok_or(ClientError::Disconnected)?;
        let local = remote.resolve(remote_short_id)?;
        let type_id = self
            .simulation
            .engine()
            .component_type_of(local)
            .ok_or(ClientError::NotAComponent(remote_short_id))?;
        Ok(ComponentId::new(type_id, EntityId(owner)))
    }

    /// Returns `true` only on the call that actually disconnected.
    pub fn disconnect(&mut self) -> bool {
        if self.state == ClientState::Disconnected {
            return false;
        }
        self.state = ClientState::Disconnected;
        self.connection.close();
        log::info!("Disconnected");
        true
    }
}

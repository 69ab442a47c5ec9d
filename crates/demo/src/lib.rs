//! A minimal top-down game: every connected player owns one entity that
//! walks in the direction of the held buttons.

use std::collections::BTreeMap;

use glam::Vec2;
use rkyv::{Archive, Deserialize, Serialize};
use rollnet::{
    Component, EntityComponentDb, EntityId, Input, PlayerId, SimulationEngine, SimulationError, StepContext,
};

/// Units per second.
pub const PLAYER_SPEED: f32 = 1.0;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GameButtons: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct GameButtonsInput {
    bits: u8,
}

impl GameButtonsInput {
    pub fn new(buttons: GameButtons) -> Self {
        Self { bits: buttons.bits() }
    }

    pub fn buttons(&self) -> GameButtons {
        GameButtons::from_bits_truncate(self.bits)
    }

    pub fn is_down(&self, button: GameButtons) -> bool {
        self.buttons().contains(button)
    }

    pub fn direction(&self) -> Vec2 {
        let buttons = self.buttons();
        let mut direction = Vec2::ZERO;
        if buttons.contains(GameButtons::UP) {
            direction.y += 1.0;
        }
        if buttons.contains(GameButtons::DOWN) {
            direction.y -= 1.0;
        }
        if buttons.contains(GameButtons::LEFT) {
            direction.x -= 1.0;
        }
        if buttons.contains(GameButtons::RIGHT) {
            direction.x += 1.0;
        }
        direction.normalize_or_zero()
    }
}

impl Input for GameButtonsInput {
    const NAME: &'static str = "demo.GameButtonsInput";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Player {
    pub player_id: PlayerId,
}

impl Component for Player {
    const NAME: &'static str = "demo.Player";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn as_vec2(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

impl From<Vec2> for Position {
    fn from(v: Vec2) -> Self {
        Self { x: v.x, y: v.y }
    }
}

impl Component for Position {
    const NAME: &'static str = "demo.Position";
}

/// Gives each player with an input slot an entity, and removes entities of
/// players that are gone.
pub fn spawn_players(ctx: &mut StepContext<'_>) -> Result<(), SimulationError> {
    let inputs = ctx.inputs;
    let present: BTreeMap<PlayerId, EntityId> = ctx
        .state
        .query::<Player>()
        .map(|(entity, player)| (player.player_id, entity))
        .collect();

    for &player_id in inputs.keys() {
        if present.contains_key(&player_id) {
            continue;
        }
        let entity = ctx.state.create_entity()?;
        ctx.state.insert(entity, Player { player_id })?;
        ctx.state.insert(entity, Position::default())?;
        log::debug!("Spawned {} for player {}", entity, player_id);
    }

    for (player_id, entity) in present {
        if !inputs.contains_key(&player_id) {
            ctx.state.delete_entity(entity)?;
            log::debug!("Despawned {} of player {}", entity, player_id);
        }
    }
    Ok(())
}

pub fn move_players(ctx: &mut StepContext<'_>) -> Result<(), SimulationError> {
    let inputs = ctx.inputs;
    let dt = ctx.dt_s as f32;
    for entity in ctx.state.entities_with::<Player>() {
        let Some(player_id) = ctx.state.get::<Player>(entity).map(|player| player.player_id) else {
            continue;
        };
        let direction = inputs
            .get(&player_id)
            .map(|frame| frame.get_or_default::<GameButtonsInput>().direction())
            .unwrap_or(Vec2::ZERO);
        if direction == Vec2::ZERO {
            continue;
        }
        if let Some(position) = ctx.state.get_mut::<Position>(entity) {
            *position = Position::from(position.as_vec2() + direction * PLAYER_SPEED * dt);
        }
    }
    Ok(())
}

/// The demo game, identical on server and client.
pub fn build_simulation(sim_fps: u32) -> Result<SimulationEngine, SimulationError> {
    SimulationEngine::builder(sim_fps)?
        .component::<Player>()?
        .component::<Position>()?
        .input::<GameButtonsInput>()?
        .system(spawn_players)
        .system(move_players)
        .build()
}

pub fn player_entity(state: &EntityComponentDb, player_id: PlayerId) -> Option<EntityId> {
    state
        .view()
        .query::<Player>()
        .find(|(_, player)| player.player_id == player_id)
        .map(|(entity, _)| entity)
}

pub fn player_position(state: &EntityComponentDb, player_id: PlayerId) -> Option<Position> {
    state.get::<Position>(player_entity(state, player_id)?).copied()
}

use std::collections::HashMap;

use bytes::Bytes;

use crate::ecs::ComponentId;

use super::config::ReplicationConfig;

/// Approximate archived size of a `ComponentUpdate` beyond its payload.
pub const COMPONENT_UPDATE_OVERHEAD_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Unsent,
    Sent,
    Acked,
}

/// A live component and its freshly serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedComponent {
    pub id: ComponentId,
    pub bytes: Bytes,
}

impl ReplicatedComponent {
    pub fn new(id: ComponentId, bytes: impl Into<Bytes>) -> Self {
        Self { id, bytes: bytes.into() }
    }

    fn wire_size(&self) -> usize {
        self.bytes.len() + COMPONENT_UPDATE_OVERHEAD_BYTES
    }
}

#[derive(Debug, Clone)]
struct ComponentReplicationState {
    alive_marker: bool,
    bytes: Bytes,
    ack_state: AckState,
    priority: u32,
}

/// Picks which components one peer receives each tick.
#[derive(Debug)]
pub struct ComponentReplicationChooser {
    config: ReplicationConfig,
    /// Keyed by [`ComponentId::pack`].
    states: HashMap<u64, ComponentReplicationState>,
    alive_marker: bool,
}

impl ComponentReplicationChooser {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            alive_marker: false,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn ack_state(&self, id: ComponentId) -> Option<AckState> {
        self.states.get(&id.pack()).map(|state| state.ack_state)
    }

    pub fn priority(&self, id: ComponentId) -> Option<u32> {
        self.states.get(&id.pack()).map(|state| state.priority)
    }

    /// Refreshes per-component state from `live` and returns the subset that
    /// fits into `budget_bytes`, highest priority first.
    pub fn choose_components(&mut self, live: &[ReplicatedComponent], budget_bytes: usize) -> Vec<ReplicatedComponent> {
        self.alive_marker = !self.alive_marker;
        let marker = self.alive_marker;

        for component in live {
            match self.states.get_mut(&component.id.pack()) {
                Some(state) => {
                    state.alive_marker = marker;
                    if state.bytes != component.bytes {
                        state.bytes = component.bytes.clone();
                        state.ack_state = AckState::Unsent;
                    }
                }
                None => {
                    self.states.insert(
                        component.id.pack(),
                        ComponentReplicationState {
                            alive_marker: marker,
                            bytes: component.bytes.clone(),
                            ack_state: AckState::Unsent,
                            priority: self.config.initial_priority,
                        },
                    );
                }
            }
        }

        self.states.retain(|_, state| state.alive_marker == marker);

        let config = &self.config;
        for state in self.states.values_mut() {
            let growth = match state.ack_state {
                AckState::Unsent => config.unsent_growth,
                AckState::Sent => config.sent_growth,
                AckState::Acked => config.acked_growth,
            };
            state.priority = state.priority.saturating_add(growth);
        }

        let mut candidates: Vec<(u32, u64)> = self
            .states
            .iter()
            .filter(|(_, state)| state.priority >= self.config.min_priority)
            .map(|(&key, state)| (state.priority, key))
            .collect();
        // Ties fall back to key order so every peer sees the same ranking.
        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut chosen = Vec::new();
        let mut used = 0usize;
        for (_, key) in candidates {
            if budget_bytes.saturating_sub(used) <= self.config.pack_slack_bytes && !chosen.is_empty() {
                break;
            }
            let Some(state) = self.states.get_mut(&key) else {
                continue;
            };
            let component = ReplicatedComponent {
                id: ComponentId::unpack(key),
                bytes: state.bytes.clone(),
            };
            let size = component.wire_size();
            if !chosen.is_empty() && used + size > budget_bytes {
                continue;
            }

            used += size;
            state.priority = 0;
            if state.ack_state == AckState::Unsent {
                state.ack_state = AckState::Sent;
            }
            chosen.push(component);
        }

        log::trace!(
            "Chose {} of {} components ({} / {} bytes)",
            chosen.len(),
            self.states.len(),
            used,
            budget_bytes
        );
        chosen
    }

    /// Stale acks for bytes that have since changed are ignored.
    pub fn on_components_acked(&mut self, acked: &[ReplicatedComponent]) {
        for component in acked {
            if let Some(state) = self.states.get_mut(&component.id.pack())
                && state.bytes == component.bytes
            {
                state.ack_state = AckState::Acked;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{ComponentTypeId, EntityId};

    fn id(owner: u32) -> ComponentId {
        ComponentId::new(ComponentTypeId(1), EntityId(owner))
    }

    fn component(owner: u32, bytes: &'static [u8]) -> ReplicatedComponent {
        ReplicatedComponent::new(id(owner), Bytes::from_static(bytes))
    }

    #[test]
    fn test_stable_component_reaches_acked() {
        let mut chooser = ComponentReplicationChooser::new(ReplicationConfig::default());
        let live = vec![component(1, b"abcd")];

        for _ in 0..20 {
            let sent = chooser.choose_components(&live, 600);
            chooser.on_components_acked(&sent);
            // Once acked, a resend must not regress it.
            if chooser.ack_state(id(1)) == Some(AckState::Acked) {
                chooser.choose_components(&live, 600);
                assert_eq!(chooser.ack_state(id(1)), Some(AckState::Acked));
            }
        }
        assert_eq!(chooser.ack_state(id(1)), Some(AckState::Acked));
    }

    #[test]
    fn test_flipping_component_never_stabilizes() {
        let mut chooser = ComponentReplicationChooser::new(ReplicationConfig::default());
        let a = vec![component(1, b"aaaa")];
        let b = vec![component(1, b"bbbb")];

        let mut previous: Vec<ReplicatedComponent> = Vec::new();
        for tick in 0..40 {
            let live = if tick % 2 == 0 { &a } else { &b };
            let sent = chooser.choose_components(live, 600);
            // The ack for last tick's bytes lands after the value flipped.
            chooser.on_components_acked(&previous);
            assert_ne!(chooser.ack_state(id(1)), Some(AckState::Acked));
            previous = sent;
        }
    }

    #[test]
    fn test_dead_components_are_purged() {
        let mut chooser = ComponentReplicationChooser::new(ReplicationConfig::default());
        chooser.choose_components(&[component(1, b"x"), component(2, b"y")], 600);
        assert_eq!(chooser.len(), 2);
        chooser.choose_components(&[component(2, b"y")], 600);
        assert_eq!(chooser.len(), 1);
        assert!(chooser.ack_state(id(1)).is_none());
    }

    #[test]
    fn test_budget_accepts_first_oversized_item_only() {
        let mut chooser = ComponentReplicationChooser::new(ReplicationConfig::default());
        let big = ReplicatedComponent::new(id(1), vec![0u8; 100]);
        let small = ReplicatedComponent::new(id(2), vec![0u8; 4]);
        let sent = chooser.choose_components(&[big, small], 50);
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn test_acked_components_fall_below_floor() {
        let mut chooser = ComponentReplicationChooser::new(ReplicationConfig::default());
        let live = vec![component(1, b"data")];
        let sent = chooser.choose_components(&live, 600);
        chooser.on_components_acked(&sent);

        // Acked growth is 1 per tick, so it waits for the floor of 50.
        for _ in 0..49 {
            assert!(chooser.choose_components(&live, 600).is_empty());
        }
        assert_eq!(chooser.choose_components(&live, 600).len(), 1);
        assert_eq!(chooser.ack_state(id(1)), Some(AckState::Acked));
    }

    #[test]
    fn test_higher_priority_is_sent_first() {
        let mut chooser = ComponentReplicationChooser::new(ReplicationConfig::default());
        let live = vec![component(1, b"aaaaaaaa"), component(2, b"bbbbbbbb")];
        // Room for exactly one item per tick.
        let first = chooser.choose_components(&live, 30);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, id(1));
        let second = chooser.choose_components(&live, 30);
        assert_eq!(second[0].id, id(2));
    }

    #[test]
    fn test_components_of_one_entity_are_tracked_apart() {
        let mut chooser = ComponentReplicationChooser::new(ReplicationConfig::default());
        let position = ComponentId::new(ComponentTypeId(1), EntityId(3));
        let player = ComponentId::new(ComponentTypeId(2), EntityId(3));
        let live = vec![
            ReplicatedComponent::new(position, Bytes::from_static(b"pos")),
            ReplicatedComponent::new(player, Bytes::from_static(b"ply")),
        ];

        let sent = chooser.choose_components(&live, 600);
        let ids: Vec<ComponentId> = sent.iter().map(|component| component.id).collect();
        assert_eq!(ids, vec![position, player]);

        chooser.on_components_acked(&sent[..1]);
        assert_eq!(chooser.ack_state(position), Some(AckState::Acked));
        assert_eq!(chooser.ack_state(player), Some(AckState::Sent));
    }
}

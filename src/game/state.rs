//! Canonical world state owned by the server simulation
//!
//! Entities are a tagged variant (shared header + [`EntityKind`] payload)
//! stored densely in an [`EntityRegistry`] with an id -> index map. The
//! client mirrors the same ids but never holds these types directly.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::constants::{limits, movement, stamina};
use crate::util::vec2::Vec2;

/// Unique entity identifier, shared by server registry and client mirrors
pub type EntityId = Uuid;

/// Server-assigned identifier for one transport connection
pub type ConnectionId = u64;

/// Wire tag for an entity's kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKindTag {
    Player,
    HostileUnit,
    AlliedUnit,
    Structure,
}

/// Per-player authoritative state
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    /// Connection whose inputs drive this player
    pub connection: ConnectionId,
    /// Normalized movement intent from the last applied command
    pub intent: Vec2,
    /// Aim / facing angle in radians
    pub facing: f32,
    pub health: f32,
    pub health_max: f32,
    pub stamina: f32,
    pub stamina_max: f32,
    /// Base speed in px/s
    pub speed: f32,

    // Flags
    pub sprint_held: bool,
    pub sprinting: bool,
    pub dashing: bool,
    pub ability_active: bool,
    pub exhausted: bool,
    pub ads: bool,

    // Timers (seconds)
    pub dash_remaining: f32,
    pub dash_cooldown: f32,
    pub ability_remaining: f32,
    pub exhaustion_timer: f32,

    pub dash_direction: Vec2,
    /// Knockback velocity in px/s, applied while `knockback_remaining > 0`
    pub knockback: Vec2,
    pub knockback_remaining: f32,

    /// Watermark of the last input applied to this player
    pub last_processed_input_seq: u64,
    /// Test / invincibility flag: stamina drains are skipped
    pub unlimited_stamina: bool,
    /// Simplified breadcrumb path, oldest first
    pub trail: Vec<Vec2>,
}

impl PlayerState {
    pub fn new(connection: ConnectionId, health: f32, speed: f32) -> Self {
        Self {
            connection,
            intent: Vec2::ZERO,
            facing: 0.0,
            health,
            health_max: health,
            stamina: stamina::DEFAULT_MAX,
            stamina_max: stamina::DEFAULT_MAX,
            speed,
            sprint_held: false,
            sprinting: false,
            dashing: false,
            ability_active: false,
            exhausted: false,
            ads: false,
            dash_remaining: 0.0,
            dash_cooldown: 0.0,
            ability_remaining: 0.0,
            exhaustion_timer: 0.0,
            dash_direction: Vec2::ZERO,
            knockback: Vec2::ZERO,
            knockback_remaining: 0.0,
            last_processed_input_seq: 0,
            unlimited_stamina: false,
            trail: Vec::new(),
        }
    }

    #[inline]
    pub fn knockback_active(&self) -> bool {
        self.knockback_remaining > 0.0
    }
}

impl Default for PlayerState {
    fn default() -> Self {
        Self::new(0, limits::DEFAULT_HEALTH, movement::DEFAULT_SPEED)
    }
}

/// Hostile or allied unit state. Behavior lives outside the core; the
/// simulation only integrates `velocity` through collision.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitState {
    pub health: f32,
    pub health_max: f32,
    pub velocity: Vec2,
    pub facing: f32,
}

impl UnitState {
    pub fn new(health: f32, velocity: Vec2) -> Self {
        Self {
            health,
            health_max: health,
            velocity,
            facing: velocity.angle(),
        }
    }
}

/// Deployed structure (turret, ward, barricade...)
#[derive(Debug, Clone, PartialEq)]
pub struct StructureState {
    pub owner: Option<EntityId>,
    pub type_tag: String,
    pub health: f32,
    pub health_max: f32,
    /// Simulation tick at which this structure expires; `None` never expires
    pub expires_at_tick: Option<u64>,
    /// Depletable ammo / charge; `None` never depletes
    pub resource: Option<f32>,
    pub trigger_radius: f32,
    pub damage: f32,
    pub trigger_cooldown: f32,
    /// Removed together with its owner
    pub owner_scoped: bool,
}

impl StructureState {
    #[inline]
    pub fn can_trigger(&self) -> bool {
        self.trigger_radius > 0.0 && self.damage > 0.0 && self.trigger_cooldown <= 0.0
    }
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    Player(PlayerState),
    Hostile(UnitState),
    Allied(UnitState),
    Structure(StructureState),
}

/// An entity in the canonical registry
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub position: Vec2,
    pub radius: f32,
    pub alive: bool,
    pub kind: EntityKind,
}

impl Entity {
    pub fn new(id: EntityId, position: Vec2, radius: f32, kind: EntityKind) -> Self {
        Self {
            id,
            position,
            radius,
            alive: true,
            kind,
        }
    }

    pub fn kind_tag(&self) -> EntityKindTag {
        match self.kind {
            EntityKind::Player(_) => EntityKindTag::Player,
            EntityKind::Hostile(_) => EntityKindTag::HostileUnit,
            EntityKind::Allied(_) => EntityKindTag::AlliedUnit,
            EntityKind::Structure(_) => EntityKindTag::Structure,
        }
    }

    pub fn as_player(&self) -> Option<&PlayerState> {
        match &self.kind {
            EntityKind::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut PlayerState> {
        match &mut self.kind {
            EntityKind::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&StructureState> {
        match &self.kind {
            EntityKind::Structure(s) => Some(s),
            _ => None,
        }
    }

    /// (health, health_max) for any kind
    pub fn health(&self) -> (f32, f32) {
        match &self.kind {
            EntityKind::Player(p) => (p.health, p.health_max),
            EntityKind::Hostile(u) | EntityKind::Allied(u) => (u.health, u.health_max),
            EntityKind::Structure(s) => (s.health, s.health_max),
        }
    }

    /// Apply damage, returning the new health
    pub fn apply_damage(&mut self, amount: f32) -> f32 {
        let health = match &mut self.kind {
            EntityKind::Player(p) => &mut p.health,
            EntityKind::Hostile(u) | EntityKind::Allied(u) => &mut u.health,
            EntityKind::Structure(s) => &mut s.health,
        };
        *health = (*health - amount.max(0.0)).max(0.0);
        if *health <= 0.0 {
            self.alive = false;
        }
        *health
    }

    /// Facing angle used as the wire rotation
    pub fn rotation(&self) -> f32 {
        match &self.kind {
            EntityKind::Player(p) => p.facing,
            EntityKind::Hostile(u) | EntityKind::Allied(u) => u.facing,
            EntityKind::Structure(_) => 0.0,
        }
    }
}

/// Dense entity store with id -> index lookup
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: Vec<Entity>,
    index: HashMap<EntityId, usize>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity. Returns false (and drops it) if the id is taken.
    pub fn insert(&mut self, entity: Entity) -> bool {
        if self.index.contains_key(&entity.id) {
            return false;
        }
        self.index.insert(entity.id, self.entities.len());
        self.entities.push(entity);
        true
    }

    /// Remove by id, keeping the store dense
    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        let idx = self.index.remove(id)?;
        let removed = self.entities.swap_remove(idx);
        if let Some(moved) = self.entities.get(idx) {
            self.index.insert(moved.id, idx);
        }
        Some(removed)
    }

    #[inline]
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.index.get(id).map(|&i| &self.entities[i])
    }

    #[inline]
    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut Entity> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.entities[i]),
            None => None,
        }
    }

    #[inline]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.index.contains_key(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.iter_mut()
    }

    /// Dense slice for bulk (parallel) passes; ids must not be changed
    pub fn as_mut_slice(&mut self) -> &mut [Entity] {
        &mut self.entities
    }

    pub fn as_slice(&self) -> &[Entity] {
        &self.entities
    }

    pub fn player_count(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| matches!(e.kind, EntityKind::Player(_)))
            .count()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(pos: Vec2) -> Entity {
        Entity::new(
            Uuid::new_v4(),
            pos,
            10.0,
            EntityKind::Hostile(UnitState::new(50.0, Vec2::ZERO)),
        )
    }

    #[test]
    fn test_registry_insert_and_lookup() {
        let mut registry = EntityRegistry::new();
        let e = unit(Vec2::new(1.0, 2.0));
        let id = e.id;
        assert!(registry.insert(e.clone()));
        assert!(!registry.insert(e));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).map(|e| e.position), Some(Vec2::new(1.0, 2.0)));
    }

    #[test]
    fn test_registry_swap_remove_fixes_index() {
        let mut registry = EntityRegistry::new();
        let ids: Vec<_> = (0..4)
            .map(|i| {
                let e = unit(Vec2::new(i as f32, 0.0));
                let id = e.id;
                registry.insert(e);
                id
            })
            .collect();

        let removed = registry.remove(&ids[0]).unwrap();
        assert_eq!(removed.id, ids[0]);
        assert!(registry.remove(&ids[0]).is_none());

        for (i, id) in ids.iter().enumerate().skip(1) {
            assert_eq!(registry.get(id).unwrap().position.x, i as f32);
        }
    }

    #[test]
    fn test_apply_damage_kills_at_zero() {
        let mut e = unit(Vec2::ZERO);
        assert_eq!(e.apply_damage(20.0), 30.0);
        assert!(e.alive);
        assert_eq!(e.apply_damage(100.0), 0.0);
        assert!(!e.alive);
    }

    #[test]
    fn test_kind_tag() {
        let e = Entity::new(
            Uuid::new_v4(),
            Vec2::ZERO,
            16.0,
            EntityKind::Player(PlayerState::default()),
        );
        assert_eq!(e.kind_tag(), EntityKindTag::Player);
        assert!(e.as_player().is_some());
        assert!(e.as_structure().is_none());
    }
}

//! Authoritative server simulation
//!
//! One [`ServerSimulation`] per room. The room's tick loop owns it
//! exclusively; connection tasks only reach it through queued commands.
//!
//! Per tick:
//! 1. apply deferred removals (disconnects, owner-scoped structures)
//! 2. snapshot structure obstacles, pull at most one input per player
//! 3. step every entity in parallel against that shared obstacle view
//! 4. sanitize non-finite state, refresh the spatial index
//! 5. age and fire structures

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use rand::Rng;
use rayon::prelude::*;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::game::geometry::Obstacle;
use crate::game::input_buffer::{InputDisposition, InputPipeline, PipelineStats};
use crate::game::spatial::{SpatialEntry, SpatialIndex};
use crate::game::state::{
    ConnectionId, Entity, EntityId, EntityKind, EntityRegistry, PlayerState, StructureState,
    UnitState,
};
use crate::game::systems::collision::{move_circle, resolve_overlap, ObstacleView};
use crate::game::constants::movement::ABILITY_DURATION;
use crate::game::constants::stamina::ABILITY_COST;
use crate::game::systems::stamina::{self, DrainResult};
use crate::game::systems::{breadcrumbs, movement, structures};
use crate::game::validation::{sanitize_ability, sanitize_descriptor, InputViolation};
use crate::net::protocol::{
    AbilityArgs, AbilityRequest, EntityState, ExpiryReason, InputCommand, PlayerDescriptor,
    ServerMessage,
};
use crate::util::vec2::Vec2;

/// Radius around the origin used when a join omits its position
const SPAWN_RADIUS: f32 = 200.0;

/// Something other systems or clients need to hear about
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationEvent {
    EntityJoined {
        state: EntityState,
    },
    EntityLeft {
        id: EntityId,
    },
    HealthChanged {
        id: EntityId,
        health: f32,
        damage: Option<f32>,
        source: Option<String>,
    },
    AbilityCreated {
        ability_id: EntityId,
        owner_id: Option<EntityId>,
        type_tag: String,
        args: AbilityArgs,
    },
    AbilityExpired {
        ability_id: EntityId,
        owner_id: Option<EntityId>,
        type_tag: String,
        reason: ExpiryReason,
    },
    AbilityTriggered {
        ability_id: EntityId,
        owner_id: Option<EntityId>,
        type_tag: String,
        target_id: EntityId,
    },
    /// A player's drain failed and exhaustion engaged
    Exhausted {
        id: EntityId,
    },
}

impl SimulationEvent {
    /// Wire message for clients; `None` for server-internal events
    pub fn to_message(&self) -> Option<ServerMessage> {
        Some(match self.clone() {
            SimulationEvent::EntityJoined { state } => ServerMessage::EntityJoined {
                id: state.id,
                descriptor: state,
            },
            SimulationEvent::EntityLeft { id } => ServerMessage::EntityLeft { id },
            SimulationEvent::HealthChanged {
                id,
                health,
                damage,
                source,
            } => ServerMessage::EntityHealthUpdate {
                id,
                health,
                damage,
                source,
            },
            SimulationEvent::AbilityCreated {
                ability_id,
                owner_id,
                type_tag,
                args,
            } => ServerMessage::AbilityCreated {
                ability_id,
                owner_id,
                type_tag,
                args,
            },
            SimulationEvent::AbilityExpired {
                ability_id,
                owner_id,
                type_tag,
                reason,
            } => ServerMessage::AbilityExpired {
                ability_id,
                owner_id,
                type_tag,
                reason,
            },
            SimulationEvent::AbilityTriggered {
                ability_id,
                owner_id,
                type_tag,
                target_id,
            } => ServerMessage::AbilityTriggered {
                ability_id,
                owner_id,
                type_tag,
                target_id,
            },
            SimulationEvent::Exhausted { .. } => return None,
        })
    }
}

/// Which side a non-player unit fights on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSide {
    Hostile,
    Allied,
}

/// Per-entity result of the parallel step
#[derive(Debug, Default)]
struct StepReport {
    id: Option<EntityId>,
    exhausted: bool,
    /// Distance between the client's predicted and our resolved position
    divergence: Option<f32>,
}

/// Diagnostics counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationStats {
    /// Client predictions further than the report threshold from authority
    pub divergence_reports: u64,
    /// Entities repaired by the sanitize pass
    pub sanitized: u64,
}

/// Authoritative simulation for one room
pub struct ServerSimulation {
    tick: u64,
    tick_rate: u32,
    dt: f32,
    extent: f32,
    registry: EntityRegistry,
    spatial: SpatialIndex,
    geometry: Vec<Obstacle>,
    pipeline: InputPipeline,
    /// Connection -> its player entity
    connections: HashMap<ConnectionId, EntityId>,
    pending_removals: Vec<EntityId>,
    events: Vec<SimulationEvent>,
    query_scratch: Vec<EntityId>,
    divergence_threshold: f32,
    max_structures_per_owner: usize,
    stats: SimulationStats,
}

impl ServerSimulation {
    pub fn new(config: &SyncConfig, geometry: Vec<Obstacle>) -> Self {
        Self {
            tick: 0,
            tick_rate: config.tick_rate.max(1),
            dt: config.tick_dt(),
            extent: config.world_extent,
            registry: EntityRegistry::new(),
            spatial: SpatialIndex::new(config.grid_cell_size, config.world_extent),
            geometry,
            pipeline: InputPipeline::new(config.input_rate, config.input_retention()),
            connections: HashMap::new(),
            pending_removals: Vec::new(),
            events: Vec::new(),
            query_scratch: Vec::new(),
            divergence_threshold: crate::game::constants::net::DIVERGENCE_REPORT_PX,
            max_structures_per_owner: config.max_structures_per_owner.max(1),
            stats: SimulationStats::default(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    #[inline]
    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    #[inline]
    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn extent(&self) -> f32 {
        self.extent
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn spatial(&self) -> &SpatialIndex {
        &self.spatial
    }

    pub fn geometry(&self) -> &[Obstacle] {
        &self.geometry
    }

    pub fn entity_for(&self, connection: ConnectionId) -> Option<EntityId> {
        self.connections.get(&connection).copied()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Watermark echoed to a connection in its snapshots
    pub fn last_processed_input_seq(&self, connection: ConnectionId) -> u64 {
        self.entity_for(connection)
            .and_then(|id| self.registry.get(&id))
            .and_then(Entity::as_player)
            .map_or(0, |p| p.last_processed_input_seq)
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn stats(&self) -> SimulationStats {
        self.stats
    }

    /// Quantized wire view of every entity
    pub fn entity_states(&self) -> Vec<EntityState> {
        self.registry.iter().map(EntityState::from_entity).collect()
    }

    // ========================================================================
    // Mutations (called by the tick loop between ticks)
    // ========================================================================

    /// Create the player for a connection. A connection that already has a
    /// player keeps it.
    pub fn add_player(&mut self, connection: ConnectionId, descriptor: &PlayerDescriptor) -> EntityId {
        if let Some(id) = self.entity_for(connection) {
            self.pipeline.register(connection);
            return id;
        }
        let params = sanitize_descriptor(descriptor, self.extent);
        let position = params.position.unwrap_or_else(|| {
            let r = SPAWN_RADIUS.min(self.extent);
            let mut rng = rand::thread_rng();
            Vec2::new(rng.gen_range(-r..=r), rng.gen_range(-r..=r))
        });
        let view = ObstacleView::new(&self.geometry, &[], self.extent);
        let position = resolve_overlap(&view, position, params.radius);

        let mut player = PlayerState::new(connection, params.health, params.speed);
        player.trail.push(position);
        let entity = Entity::new(Uuid::new_v4(), position, params.radius, EntityKind::Player(player));
        let id = entity.id;

        self.insert_entity(entity);
        self.pipeline.register(connection);
        self.connections.insert(connection, id);
        tracing::debug!(connection, %id, "player added");
        id
    }

    /// Stop consuming a connection's input now; its player goes away at the
    /// next tick boundary
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.pipeline.disconnect(connection);
        if let Some(id) = self.connections.remove(&connection) {
            self.pending_removals.push(id);
        }
    }

    pub fn queue_input(
        &mut self,
        connection: ConnectionId,
        cmd: InputCommand,
        now: Instant,
    ) -> InputDisposition {
        self.pipeline.accept(connection, cmd, now)
    }

    pub fn spawn_unit(
        &mut self,
        side: UnitSide,
        position: Vec2,
        radius: f32,
        health: f32,
        velocity: Vec2,
    ) -> EntityId {
        let unit = UnitState::new(health, velocity.finite_or_zero());
        let kind = match side {
            UnitSide::Hostile => EntityKind::Hostile(unit),
            UnitSide::Allied => EntityKind::Allied(unit),
        };
        let position = position.finite_or_zero().clamp_to_extent(self.extent);
        let entity = Entity::new(Uuid::new_v4(), position, radius.max(1.0), kind);
        let id = entity.id;
        self.insert_entity(entity);
        id
    }

    /// Deploy a validated structure
    pub fn deploy_structure(
        &mut self,
        owner: Option<EntityId>,
        type_tag: String,
        args: AbilityArgs,
    ) -> EntityId {
        let structure = StructureState {
            owner,
            type_tag: type_tag.clone(),
            health: crate::game::constants::limits::DEFAULT_HEALTH,
            health_max: crate::game::constants::limits::DEFAULT_HEALTH,
            expires_at_tick: args
                .lifetime
                .map(|s| self.tick + structures::lifetime_ticks(s, self.tick_rate)),
            resource: args.resource,
            trigger_radius: args.trigger_radius,
            damage: args.damage,
            trigger_cooldown: 0.0,
            owner_scoped: args.owner_scoped,
        };
        let entity = Entity::new(
            Uuid::new_v4(),
            args.position,
            args.radius,
            EntityKind::Structure(structure),
        );
        let id = entity.id;
        self.registry.insert(entity);
        if let Some(e) = self.registry.get(&id) {
            self.spatial.insert(&SpatialEntry::new(id, e.position, e.radius));
        }
        self.events.push(SimulationEvent::AbilityCreated {
            ability_id: id,
            owner_id: owner,
            type_tag,
            args,
        });
        id
    }

    /// Validate and deploy a client's structure request.
    ///
    /// A deploy is an ability use: it is refused while the owner's ability
    /// is still active or once they own `max_structures_per_owner` live
    /// structures, and otherwise costs [`ABILITY_COST`] stamina.
    pub fn request_ability(
        &mut self,
        connection: ConnectionId,
        request: &AbilityRequest,
    ) -> Result<EntityId, InputViolation> {
        let owner = self
            .entity_for(connection)
            .ok_or(InputViolation::UnknownConnection)?;
        let (type_tag, args) = sanitize_ability(request, self.extent)?;

        let cap = self.max_structures_per_owner;
        if self.structures_owned_by(&owner) >= cap {
            return Err(InputViolation::StructureLimit(cap));
        }
        let player = self
            .registry
            .get_mut(&owner)
            .and_then(Entity::as_player_mut)
            .ok_or(InputViolation::UnknownConnection)?;
        if player.ability_active {
            return Err(InputViolation::AbilityBusy);
        }
        match stamina::try_drain(player, ABILITY_COST) {
            DrainResult::Paid => {
                player.ability_active = true;
                player.ability_remaining = ABILITY_DURATION;
            }
            DrainResult::Exhausted => {
                self.events.push(SimulationEvent::Exhausted { id: owner });
                return Err(InputViolation::Exhausted);
            }
            DrainResult::Locked => return Err(InputViolation::Exhausted),
        }
        Ok(self.deploy_structure(Some(owner), type_tag, args))
    }

    /// Live structures deployed by `owner`
    pub fn structures_owned_by(&self, owner: &EntityId) -> usize {
        self.registry
            .iter()
            .filter(|e| matches!(&e.kind, EntityKind::Structure(s) if s.owner.as_ref() == Some(owner)))
            .count()
    }

    /// Returns false if `id` is not a player
    pub fn apply_knockback(&mut self, id: &EntityId, velocity: Vec2, duration: f32) -> bool {
        match self.registry.get_mut(id).and_then(Entity::as_player_mut) {
            Some(player) => {
                movement::apply_knockback(player, velocity, duration);
                true
            }
            None => false,
        }
    }

    /// Returns false if `id` is not a player
    pub fn set_unlimited_stamina(&mut self, id: &EntityId, enabled: bool) -> bool {
        match self.registry.get_mut(id).and_then(Entity::as_player_mut) {
            Some(player) => {
                player.unlimited_stamina = enabled;
                true
            }
            None => false,
        }
    }

    fn insert_entity(&mut self, entity: Entity) {
        let entry = SpatialEntry::new(entity.id, entity.position, entity.radius);
        let state = EntityState::from_entity(&entity);
        if self.registry.insert(entity) {
            self.spatial.insert(&entry);
            self.events.push(SimulationEvent::EntityJoined { state });
        }
    }

    fn remove_entity(&mut self, id: &EntityId) -> Option<Entity> {
        let entity = self.registry.remove(id)?;
        self.spatial.remove(id);
        Some(entity)
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Advance one tick using the current time for input ordering
    pub fn tick(&mut self) -> Vec<SimulationEvent> {
        self.tick_at(Instant::now())
    }

    /// Advance one tick. `now` drives input gap and retention timing.
    pub fn tick_at(&mut self, now: Instant) -> Vec<SimulationEvent> {
        self.tick += 1;

        self.apply_pending_removals();

        // Structures block movement as circles, captured before anyone moves
        let dynamic: Vec<Obstacle> = self
            .registry
            .iter()
            .filter(|e| e.alive && matches!(e.kind, EntityKind::Structure(_)))
            .map(|e| Obstacle::Circle {
                center: e.position,
                radius: e.radius,
            })
            .collect();

        let commands: Vec<Option<InputCommand>> = {
            let pipeline = &mut self.pipeline;
            self.registry
                .iter()
                .map(|e| match &e.kind {
                    EntityKind::Player(p) => pipeline.next_for(p.connection, now),
                    _ => None,
                })
                .collect()
        };

        let dt = self.dt;
        let view = ObstacleView::new(&self.geometry, &dynamic, self.extent);
        let reports: Vec<StepReport> = self
            .registry
            .as_mut_slice()
            .par_iter_mut()
            .zip(commands.par_iter())
            .map(|(entity, cmd)| step_entity(entity, cmd.as_ref(), dt, &view))
            .collect();

        for report in reports {
            let Some(id) = report.id else {
                continue;
            };
            if report.exhausted {
                self.events.push(SimulationEvent::Exhausted { id });
            }
            if let Some(distance) = report.divergence {
                if distance > self.divergence_threshold {
                    self.stats.divergence_reports += 1;
                    tracing::debug!(%id, distance, tick = self.tick, "client prediction diverged");
                }
            }
        }

        self.sanitize();
        for entity in self.registry.iter() {
            self.spatial
                .update(&SpatialEntry::new(entity.id, entity.position, entity.radius));
        }

        self.update_structures();

        std::mem::take(&mut self.events)
    }

    fn apply_pending_removals(&mut self) {
        if self.pending_removals.is_empty() {
            return;
        }
        let removals = std::mem::take(&mut self.pending_removals);
        for id in &removals {
            if self.remove_entity(id).is_some() {
                self.events.push(SimulationEvent::EntityLeft { id: *id });
            }
        }

        // Owner-scoped structures leave with their owner
        let orphaned: Vec<(EntityId, Option<EntityId>, String)> = self
            .registry
            .iter()
            .filter_map(|e| match &e.kind {
                EntityKind::Structure(s)
                    if s.owner_scoped && s.owner.is_some_and(|o| removals.contains(&o)) =>
                {
                    Some((e.id, s.owner, s.type_tag.clone()))
                }
                _ => None,
            })
            .collect();
        for (ability_id, owner_id, type_tag) in orphaned {
            self.remove_entity(&ability_id);
            self.events.push(SimulationEvent::AbilityExpired {
                ability_id,
                owner_id,
                type_tag,
                reason: ExpiryReason::OwnerLeft,
            });
        }
    }

    /// Replace non-finite state with safe values
    fn sanitize(&mut self) {
        let extent = self.extent;
        let mut repaired = 0u64;
        for entity in self.registry.iter_mut() {
            let mut bad = false;
            if !entity.position.is_finite() {
                entity.position = entity.position.finite_or_zero().clamp_to_extent(extent);
                bad = true;
            }
            match &mut entity.kind {
                EntityKind::Player(p) => {
                    if !(p.intent.is_finite() && p.knockback.is_finite() && p.dash_direction.is_finite())
                    {
                        p.intent = Vec2::ZERO;
                        p.knockback = Vec2::ZERO;
                        p.knockback_remaining = 0.0;
                        p.dash_direction = Vec2::ZERO;
                        bad = true;
                    }
                    if !p.stamina.is_finite() {
                        p.stamina = 0.0;
                        bad = true;
                    }
                }
                EntityKind::Hostile(u) | EntityKind::Allied(u) => {
                    if !u.velocity.is_finite() {
                        u.velocity = Vec2::ZERO;
                        bad = true;
                    }
                }
                EntityKind::Structure(_) => {}
            }
            if bad {
                repaired += 1;
                tracing::warn!(id = %entity.id, "non-finite entity state repaired");
            }
        }
        self.stats.sanitized += repaired;
    }

    fn update_structures(&mut self) {
        let structure_ids: Vec<EntityId> = self
            .registry
            .iter()
            .filter(|e| matches!(e.kind, EntityKind::Structure(_)))
            .map(|e| e.id)
            .collect();

        for id in structure_ids {
            if self.expire_if_due(&id) {
                continue;
            }

            let dt = self.dt;
            let Some((origin, trigger_radius)) = self.registry.get_mut(&id).and_then(|e| {
                let position = e.position;
                match &mut e.kind {
                    EntityKind::Structure(s) => {
                        structures::cool_down(s, dt);
                        s.can_trigger().then_some((position, s.trigger_radius))
                    }
                    _ => None,
                }
            }) else {
                continue;
            };

            let Some(target_id) = structures::nearest_hostile(
                &self.spatial,
                &self.registry,
                origin,
                trigger_radius,
                &mut self.query_scratch,
            ) else {
                continue;
            };

            let Some((owner_id, type_tag, damage)) = self.registry.get_mut(&id).and_then(|e| {
                match &mut e.kind {
                    EntityKind::Structure(s) => {
                        structures::fire(s);
                        Some((s.owner, s.type_tag.clone(), s.damage))
                    }
                    _ => None,
                }
            }) else {
                continue;
            };

            self.events.push(SimulationEvent::AbilityTriggered {
                ability_id: id,
                owner_id,
                type_tag: type_tag.clone(),
                target_id,
            });

            if let Some(target) = self.registry.get_mut(&target_id) {
                let health = target.apply_damage(damage);
                let dead = !target.alive;
                self.events.push(SimulationEvent::HealthChanged {
                    id: target_id,
                    health,
                    damage: Some(damage),
                    source: Some(type_tag),
                });
                if dead {
                    self.remove_entity(&target_id);
                    self.events.push(SimulationEvent::EntityLeft { id: target_id });
                }
            }

            self.expire_if_due(&id);
        }
    }

    /// Remove a structure whose lifetime or resource ran out. One event per
    /// structure, whatever the reason.
    fn expire_if_due(&mut self, id: &EntityId) -> bool {
        let Some(reason) = self
            .registry
            .get(id)
            .and_then(Entity::as_structure)
            .and_then(|s| structures::expiry(s, self.tick))
        else {
            return false;
        };
        if let Some(entity) = self.remove_entity(id) {
            if let EntityKind::Structure(s) = entity.kind {
                self.events.push(SimulationEvent::AbilityExpired {
                    ability_id: *id,
                    owner_id: s.owner,
                    type_tag: s.type_tag,
                    reason,
                });
            }
        }
        true
    }

    /// Wall-clock length of one tick
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }
}

/// Step one entity; runs on a rayon worker
fn step_entity(
    entity: &mut Entity,
    cmd: Option<&InputCommand>,
    dt: f32,
    view: &ObstacleView<'_>,
) -> StepReport {
    if !entity.alive {
        return StepReport::default();
    }
    let (position, radius) = (entity.position, entity.radius);
    match &mut entity.kind {
        EntityKind::Player(player) => {
            let outcome = movement::step_player(position, radius, player, cmd, dt, view);
            if let Some(cmd) = cmd {
                player.last_processed_input_seq = cmd.sequence;
            }
            breadcrumbs::record(&mut player.trail, outcome.position, view);
            entity.position = outcome.position;
            StepReport {
                id: Some(entity.id),
                exhausted: outcome.exhausted,
                divergence: cmd
                    .and_then(|c| c.predicted_position)
                    .map(|p| p.distance_to(outcome.position)),
            }
        }
        EntityKind::Hostile(unit) | EntityKind::Allied(unit) => {
            if unit.velocity.length_sq() > 0.0 {
                unit.facing = unit.velocity.angle();
                entity.position = move_circle(view, position, radius, unit.velocity * dt);
            }
            StepReport::default()
        }
        EntityKind::Structure(_) => StepReport::default(),
    }
}

//! Deployed structure bookkeeping: lifetime, resource, trigger targeting

use crate::game::constants::structures::{TRIGGER_COOLDOWN, TRIGGER_COST};
use crate::game::spatial::SpatialIndex;
use crate::game::state::{EntityId, EntityKind, EntityRegistry, StructureState};
use crate::net::protocol::ExpiryReason;
use crate::util::vec2::Vec2;

/// Lifetime in whole ticks for a duration in seconds
#[inline]
pub fn lifetime_ticks(seconds: f32, tick_rate: u32) -> u64 {
    (seconds * tick_rate as f32).round().max(1.0) as u64
}

/// Why this structure should go away at `tick`, if it should.
/// Lifetime wins when both conditions hit on the same tick.
pub fn expiry(structure: &StructureState, tick: u64) -> Option<ExpiryReason> {
    if structure.expires_at_tick.is_some_and(|at| tick >= at) {
        return Some(ExpiryReason::Lifetime);
    }
    if structure.resource.is_some_and(|r| r <= 0.0) {
        return Some(ExpiryReason::Depleted);
    }
    if structure.health <= 0.0 {
        return Some(ExpiryReason::Destroyed);
    }
    None
}

pub fn cool_down(structure: &mut StructureState, dt: f32) {
    structure.trigger_cooldown = (structure.trigger_cooldown - dt).max(0.0);
}

/// Nearest live hostile whose body overlaps the trigger radius
pub fn nearest_hostile(
    spatial: &SpatialIndex,
    registry: &EntityRegistry,
    origin: Vec2,
    trigger_radius: f32,
    scratch: &mut Vec<EntityId>,
) -> Option<EntityId> {
    scratch.clear();
    spatial.query_circle_into(origin.x, origin.y, trigger_radius, scratch);

    let mut best: Option<(EntityId, f32)> = None;
    for id in scratch.iter() {
        let Some(entity) = registry.get(id) else {
            continue;
        };
        if !entity.alive || !matches!(entity.kind, EntityKind::Hostile(_)) {
            continue;
        }
        let reach = trigger_radius + entity.radius;
        let dist_sq = entity.position.distance_sq_to(origin);
        if dist_sq > reach * reach {
            continue;
        }
        if best.map_or(true, |(_, d)| dist_sq < d) {
            best = Some((entity.id, dist_sq));
        }
    }
    best.map(|(id, _)| id)
}

/// Spend one trigger: consume resource and restart the cooldown
pub fn fire(structure: &mut StructureState) {
    if let Some(resource) = structure.resource.as_mut() {
        *resource = (*resource - TRIGGER_COST).max(0.0);
    }
    structure.trigger_cooldown = TRIGGER_COOLDOWN;
}

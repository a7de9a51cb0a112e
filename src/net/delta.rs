//! Delta compression for snapshot broadcasts
//!
//! A delta lists only the fields that differ from a baseline table, plus
//! the ids that disappeared. Optional fields that become unset are named
//! in `cleared`. Values are quantized before they reach this module, so
//! change detection is an exact comparison and a chain of deltas applied
//! to a mirror reproduces the full snapshot bit for bit.

use hashbrown::{HashMap, HashSet};

use crate::game::state::EntityId;
use crate::net::protocol::{DeltaState, EntityDelta, EntityState, FullState, OptionalField};

/// Baseline / mirror keyed by entity id
pub type EntityTable = HashMap<EntityId, EntityState>;

// ============================================================================
// Field Lists
// ============================================================================

// Fields present on every entity (plain in EntityState, optional in EntityDelta)
macro_rules! for_header_fields {
    ($m:ident, $($args:tt)*) => {
        $m!($($args)*; position, rotation, radius, alive, health, health_max);
    };
}

// Kind-specific fields (optional on both sides), with their clear marker
macro_rules! for_optional_fields {
    ($m:ident, $($args:tt)*) => {
        $m!($($args)*;
            stamina => Stamina, stamina_max => StaminaMax, speed => Speed,
            intent => Intent, flags => Flags, dash_direction => DashDirection,
            dash_remaining => DashRemaining, dash_cooldown => DashCooldown,
            ability_remaining => AbilityRemaining, exhaustion_timer => ExhaustionTimer,
            knockback => Knockback, knockback_remaining => KnockbackRemaining,
            trail => Trail, owner_id => OwnerId, type_tag => TypeTag,
            resource => Resource, expires_at_tick => ExpiresAtTick);
    };
}

macro_rules! diff_header {
    ($base:ident, $cur:ident, $delta:ident, $changed:ident; $($f:ident),*) => {
        $(
            if $base.$f != $cur.$f {
                $delta.$f = Some($cur.$f.clone());
                $changed = true;
            }
        )*
    };
}

macro_rules! diff_optional {
    ($base:ident, $cur:ident, $delta:ident, $changed:ident; $($f:ident => $v:ident),*) => {
        $(
            if $base.$f != $cur.$f {
                match &$cur.$f {
                    Some(v) => $delta.$f = Some(v.clone()),
                    None => $delta.cleared.push(OptionalField::$v),
                }
                $changed = true;
            }
        )*
    };
}

macro_rules! copy_header {
    ($src:ident, $delta:ident; $($f:ident),*) => {
        $( $delta.$f = Some($src.$f.clone()); )*
    };
}

macro_rules! copy_optional {
    ($src:ident, $delta:ident; $($f:ident => $v:ident),*) => {
        $( $delta.$f = $src.$f.clone(); )*
    };
}

macro_rules! apply_header {
    ($state:ident, $delta:ident; $($f:ident),*) => {
        $(
            if let Some(v) = &$delta.$f {
                $state.$f = v.clone();
            }
        )*
    };
}

macro_rules! apply_optional {
    ($state:ident, $delta:ident; $($f:ident => $v:ident),*) => {
        $(
            if let Some(v) = &$delta.$f {
                $state.$f = Some(v.clone());
            }
        )*
    };
}

macro_rules! clear_optional {
    ($state:ident, $field:ident; $($f:ident => $v:ident),*) => {
        match $field {
            $( OptionalField::$v => $state.$f = None, )*
        }
    };
}

// Header fields of `from` fill the gaps in `into`
macro_rules! merge_header {
    ($into:ident, $from:ident; $($f:ident),*) => {
        $(
            if $into.$f.is_none() {
                $into.$f = $from.$f.take();
            }
        )*
    };
}

macro_rules! merge_optional {
    ($into:ident, $from:ident; $($f:ident => $v:ident),*) => {
        $(
            if $into.$f.is_none() {
                $into.$f = $from.$f.take();
            }
        )*
    };
}

// ============================================================================
// Delta Generation
// ============================================================================

/// Statistics about delta generation for metrics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeltaStats {
    pub entities_changed: usize,
    pub entities_unchanged: usize,
    pub entities_added: usize,
    pub entities_removed: usize,
}

/// Changed fields of `current` relative to `base`; `None` when identical
pub fn entity_delta(base: &EntityState, current: &EntityState) -> Option<EntityDelta> {
    let mut delta = EntityDelta {
        id: current.id,
        ..Default::default()
    };
    let mut changed = false;

    if base.kind != current.kind {
        delta.kind = Some(current.kind);
        changed = true;
    }
    for_header_fields!(diff_header, base, current, delta, changed);
    for_optional_fields!(diff_optional, base, current, delta, changed);

    changed.then_some(delta)
}

/// Delta carrying every field of `state`
pub fn full_delta(state: &EntityState) -> EntityDelta {
    let mut delta = EntityDelta {
        id: state.id,
        kind: Some(state.kind),
        ..Default::default()
    };
    for_header_fields!(copy_header, state, delta);
    for_optional_fields!(copy_optional, state, delta);
    delta
}

/// Diff the current interest set against a connection's baseline.
///
/// Entities absent from the baseline are sent with every field; baseline
/// ids missing from `current` are reported as removed.
pub fn generate_delta(
    baseline: &EntityTable,
    current: &[EntityState],
) -> (Vec<EntityDelta>, Vec<EntityId>, DeltaStats) {
    let mut stats = DeltaStats::default();
    let mut deltas = Vec::with_capacity(current.len());

    for state in current {
        match baseline.get(&state.id) {
            Some(base) => match entity_delta(base, state) {
                Some(d) => {
                    stats.entities_changed += 1;
                    deltas.push(d);
                }
                None => stats.entities_unchanged += 1,
            },
            None => {
                stats.entities_added += 1;
                deltas.push(full_delta(state));
            }
        }
    }

    let present: HashSet<EntityId> = current.iter().map(|s| s.id).collect();
    let removed: Vec<EntityId> = baseline
        .keys()
        .filter(|id| !present.contains(*id))
        .copied()
        .collect();
    stats.entities_removed = removed.len();

    (deltas, removed, stats)
}

// ============================================================================
// Delta Application
// ============================================================================

/// Apply the present fields of `delta` onto `state`
pub fn apply_delta(state: &mut EntityState, delta: &EntityDelta) {
    if let Some(kind) = delta.kind {
        state.kind = kind;
    }
    for_header_fields!(apply_header, state, delta);
    for_optional_fields!(apply_optional, state, delta);
    for field in &delta.cleared {
        for_optional_fields!(clear_optional, state, field);
    }
}

/// Fold `from` into `into` for the same entity. Both must describe the
/// same current state, so a field present in either is taken as is.
pub fn merge_delta(into: &mut EntityDelta, mut from: EntityDelta) {
    debug_assert_eq!(into.id, from.id);
    if into.kind.is_none() {
        into.kind = from.kind;
    }
    for_header_fields!(merge_header, into, from);
    for_optional_fields!(merge_optional, into, from);
    for field in from.cleared {
        if !into.cleared.contains(&field) {
            into.cleared.push(field);
        }
    }
}

/// Build a state from a delta that lists at least the header fields.
/// Returns `None` for a partial delta of an entity the receiver never saw.
pub fn state_from_delta(delta: &EntityDelta) -> Option<EntityState> {
    let mut state = EntityState::bare(delta.id, delta.kind?, delta.position?, delta.radius?);
    state.rotation = delta.rotation?;
    state.alive = delta.alive?;
    state.health = delta.health?;
    state.health_max = delta.health_max?;
    for_optional_fields!(apply_optional, state, delta);
    Some(state)
}

/// Replace a mirror with a full snapshot
pub fn apply_full_state(mirror: &mut EntityTable, full: &FullState) {
    mirror.clear();
    for state in &full.entities {
        mirror.insert(state.id, state.clone());
    }
}

/// Apply a delta snapshot to a mirror.
///
/// Returns ids of partial deltas for entities the mirror does not know;
/// the caller should ask for a full snapshot when this is non-empty.
pub fn apply_delta_state(mirror: &mut EntityTable, delta: &DeltaState) -> Vec<EntityId> {
    let mut unknown = Vec::new();

    if delta.is_full {
        let listed: HashSet<EntityId> = delta.entities.iter().map(|d| d.id).collect();
        mirror.retain(|id, _| listed.contains(id));
    }

    for d in &delta.entities {
        match mirror.get_mut(&d.id) {
            Some(state) => apply_delta(state, d),
            None => match state_from_delta(d) {
                Some(state) => {
                    mirror.insert(state.id, state);
                }
                None => unknown.push(d.id),
            },
        }
    }

    for id in &delta.removed {
        mirror.remove(id);
    }

    unknown
}

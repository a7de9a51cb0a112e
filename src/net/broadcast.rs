//! Snapshot broadcaster
//!
//! Runs on the room's tick loop but at its own cadence: a time
//! accumulator decides when a broadcast is due, independent of the tick
//! rate. For each connection it keeps one baseline per snapshot sent since
//! the last acknowledged one. A delta names every field that differs from
//! any of them, so it applies cleanly to whichever of those states the
//! client holds, including after a lost frame. Acks trim the history.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};

use crate::game::constants::net::{ACK_LAG_SECS, MAX_UNACKED_SNAPSHOTS};
use crate::game::state::{ConnectionId, EntityId};
use crate::net::delta::{entity_delta, full_delta, merge_delta, EntityTable};
use crate::net::protocol::{DeltaState, EntityDelta, EntityState, FullState, ServerMessage};

/// Broadcast counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub full_snapshots: u64,
    pub delta_snapshots: u64,
    /// `is_full` deltas forced by lagging acknowledgements
    pub forced_resyncs: u64,
    /// Snapshot frames the outbound queue refused
    pub dropped_snapshots: u64,
}

/// What one connection was sent at `tick`
#[derive(Debug)]
struct SentBaseline {
    tick: u64,
    table: EntityTable,
    /// Full snapshot or `is_full` delta: the receiver discards older state
    resets: bool,
}

#[derive(Debug, Default)]
struct ConnectionView {
    /// Oldest first; the front is the last acknowledged snapshot once acks arrive
    history: VecDeque<SentBaseline>,
    last_acked_tick: Option<u64>,
    needs_full: bool,
}

impl ConnectionView {
    fn record(&mut self, tick: u64, states: &[EntityState], resets: bool) {
        if resets {
            self.history.clear();
        }
        self.history.push_back(SentBaseline {
            tick,
            table: states.iter().map(|s| (s.id, s.clone())).collect(),
            resets,
        });
    }

    /// Ids the client may still hold that are gone from `present`
    fn removed_since(&self, present: &HashSet<EntityId>) -> Vec<EntityId> {
        let mut removed = HashSet::new();
        for baseline in &self.history {
            removed.extend(baseline.table.keys().filter(|id| !present.contains(*id)).copied());
        }
        removed.into_iter().collect()
    }
}

/// Per-room snapshot scheduler and delta encoder
pub struct SnapshotBroadcaster {
    interval: f64,
    accumulator: f64,
    /// Ack lag in ticks that forces a resync
    ack_lag_ticks: u64,
    views: HashMap<ConnectionId, ConnectionView>,
    stats: BroadcastStats,
}

impl SnapshotBroadcaster {
    pub fn new(broadcast_rate: u32, tick_rate: u32) -> Self {
        Self {
            interval: 1.0 / broadcast_rate.max(1) as f64,
            accumulator: 0.0,
            ack_lag_ticks: (ACK_LAG_SECS * tick_rate.max(1) as f32).ceil() as u64,
            views: HashMap::new(),
            stats: BroadcastStats::default(),
        }
    }

    /// Add elapsed time; true when a broadcast is due. At most one
    /// broadcast fires per call, and a long stall does not cause a burst.
    pub fn advance(&mut self, elapsed_secs: f64) -> bool {
        if elapsed_secs.is_finite() && elapsed_secs > 0.0 {
            self.accumulator += elapsed_secs;
        }
        if self.accumulator + 1e-9 < self.interval {
            return false;
        }
        self.accumulator = (self.accumulator - self.interval).min(self.interval);
        true
    }

    /// Track a connection; its next message is a full snapshot. Re-adding
    /// an existing connection (rejoin) resets its baselines.
    pub fn add_connection(&mut self, connection: ConnectionId) {
        self.views.insert(
            connection,
            ConnectionView {
                needs_full: true,
                ..Default::default()
            },
        );
    }

    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.views.remove(&connection);
    }

    pub fn connection_count(&self) -> usize {
        self.views.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.views.keys().copied()
    }

    /// Send a full snapshot on the next broadcast
    pub fn request_full(&mut self, connection: ConnectionId) {
        if let Some(view) = self.views.get_mut(&connection) {
            view.needs_full = true;
        }
    }

    /// Record a client acknowledgement and forget the baselines before it
    pub fn record_ack(&mut self, connection: ConnectionId, tick: u64) {
        let Some(view) = self.views.get_mut(&connection) else {
            return;
        };
        view.last_acked_tick = Some(view.last_acked_tick.map_or(tick, |t| t.max(tick)));
        if let Some(pos) = view.history.iter().position(|b| b.tick == tick) {
            view.history.drain(..pos);
        }
    }

    /// The snapshot sent for `tick` never reached the wire. A lost delta
    /// only loses its baseline; a lost reset needs a fresh full snapshot.
    pub fn snapshot_dropped(&mut self, connection: ConnectionId, tick: u64) {
        let Some(view) = self.views.get_mut(&connection) else {
            return;
        };
        let Some(pos) = view.history.iter().position(|b| b.tick == tick) else {
            return;
        };
        self.stats.dropped_snapshots += 1;
        if view.history[pos].resets {
            view.history.clear();
            view.needs_full = true;
        } else {
            view.history.remove(pos);
        }
    }

    pub fn last_acked_tick(&self, connection: ConnectionId) -> Option<u64> {
        self.views.get(&connection).and_then(|v| v.last_acked_tick)
    }

    /// Baselines still waiting on an acknowledgement, including the acked one
    pub fn baselines_held(&self, connection: ConnectionId) -> usize {
        self.views.get(&connection).map_or(0, |v| v.history.len())
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }

    /// Build this connection's snapshot of `states` and record it as a
    /// baseline. Returns `None` for unknown connections.
    pub fn snapshot_for(
        &mut self,
        connection: ConnectionId,
        tick: u64,
        timestamp: u64,
        last_processed_input_seq: u64,
        states: &[EntityState],
    ) -> Option<ServerMessage> {
        let view = self.views.get_mut(&connection)?;

        if view.needs_full || view.history.is_empty() {
            view.needs_full = false;
            view.record(tick, states, true);
            self.stats.full_snapshots += 1;
            return Some(ServerMessage::FullState(FullState {
                tick,
                timestamp,
                last_processed_input_seq,
                entities: states.to_vec(),
            }));
        }

        let present: HashSet<EntityId> = states.iter().map(|s| s.id).collect();
        let lagging = view
            .last_acked_tick
            .is_some_and(|acked| tick.saturating_sub(acked) > self.ack_lag_ticks)
            || view.history.len() >= MAX_UNACKED_SNAPSHOTS;

        let delta = if lagging {
            tracing::debug!(connection, tick, "acks lagging, forcing resync");
            self.stats.forced_resyncs += 1;
            // Grace period before the next forced resync
            view.last_acked_tick = Some(tick);
            let removed = view.removed_since(&present);
            view.record(tick, states, true);
            DeltaState {
                tick,
                timestamp,
                last_processed_input_seq,
                entities: states.iter().map(full_delta).collect(),
                removed,
                is_full: true,
            }
        } else {
            let (entities, listed_in_full) = delta_against(&view.history, states);
            let removed = view.removed_since(&present);
            // Every entity listed with every field: the delta is already complete
            let is_full = !states.is_empty() && listed_in_full == states.len();
            view.record(tick, states, is_full);
            DeltaState {
                tick,
                timestamp,
                last_processed_input_seq,
                entities,
                removed,
                is_full,
            }
        };

        self.stats.delta_snapshots += 1;
        Some(ServerMessage::DeltaState(delta))
    }
}

/// Changes of `states` relative to every baseline in `history`. Returns
/// the deltas and how many of them list every field.
fn delta_against(
    history: &VecDeque<SentBaseline>,
    states: &[EntityState],
) -> (Vec<EntityDelta>, usize) {
    let mut deltas = Vec::with_capacity(states.len());
    let mut listed_in_full = 0;

    for state in states {
        let unseen = history.iter().any(|b| !b.table.contains_key(&state.id));
        if unseen {
            listed_in_full += 1;
            deltas.push(full_delta(state));
            continue;
        }

        let mut merged: Option<EntityDelta> = None;
        for baseline in history {
            let Some(base) = baseline.table.get(&state.id) else {
                continue;
            };
            if let Some(d) = entity_delta(base, state) {
                match merged.as_mut() {
                    Some(m) => merge_delta(m, d),
                    None => merged = Some(d),
                }
            }
        }
        deltas.extend(merged);
    }

    (deltas, listed_in_full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{Entity, EntityKind, UnitState};
    use crate::net::delta::{apply_delta_state, apply_full_state};
    use crate::util::vec2::Vec2;
    use uuid::Uuid;

    fn unit(x: f32) -> Entity {
        Entity::new(
            Uuid::new_v4(),
            Vec2::new(x, 0.0),
            10.0,
            EntityKind::Hostile(UnitState::new(20.0, Vec2::ZERO)),
        )
    }

    fn states(entities: &[Entity]) -> Vec<EntityState> {
        entities.iter().map(EntityState::from_entity).collect()
    }

    #[test]
    fn test_accumulator_cadence() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        let tick = 1.0 / 30.0;
        let fired: Vec<bool> = (0..6).map(|_| b.advance(tick)).collect();
        assert_eq!(fired, vec![false, true, false, true, false, true]);
    }

    #[test]
    fn test_accumulator_no_burst_after_stall() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        assert!(b.advance(2.0));
        assert!(b.advance(0.0));
        assert!(!b.advance(0.0));
    }

    #[test]
    fn test_first_send_full_then_delta() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(1);
        let mut world = vec![unit(0.0), unit(50.0)];

        let first = b.snapshot_for(1, 1, 0, 0, &states(&world)).unwrap();
        assert!(matches!(first, ServerMessage::FullState(ref f) if f.entities.len() == 2));

        world[0].position.x += 5.0;
        match b.snapshot_for(1, 3, 66, 4, &states(&world)).unwrap() {
            ServerMessage::DeltaState(d) => {
                assert_eq!(d.entities.len(), 1);
                assert_eq!(d.entities[0].id, world[0].id);
                assert_eq!(d.last_processed_input_seq, 4);
                assert!(!d.is_full);
            }
            other => panic!("expected delta, got {other:?}"),
        }

        // Nothing changed since the acked snapshot: an empty delta still goes out
        b.record_ack(1, 3);
        match b.snapshot_for(1, 5, 133, 4, &states(&world)).unwrap() {
            ServerMessage::DeltaState(d) => {
                assert!(d.entities.is_empty());
                assert!(d.removed.is_empty());
            }
            other => panic!("expected delta, got {other:?}"),
        }
        assert_eq!(b.stats().full_snapshots, 1);
        assert_eq!(b.stats().delta_snapshots, 2);
    }

    #[test]
    fn test_request_full_and_rejoin() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(1);
        let world = states(&[unit(0.0)]);
        b.snapshot_for(1, 1, 0, 0, &world);
        b.request_full(1);
        assert!(matches!(
            b.snapshot_for(1, 2, 0, 0, &world),
            Some(ServerMessage::FullState(_))
        ));
        b.add_connection(1);
        assert!(matches!(
            b.snapshot_for(1, 3, 0, 0, &world),
            Some(ServerMessage::FullState(_))
        ));
        assert!(b.snapshot_for(2, 3, 0, 0, &world).is_none());
    }

    #[test]
    fn test_ack_lag_forces_full_delta() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(1);
        let mut world = vec![unit(0.0), unit(10.0)];
        b.snapshot_for(1, 1, 0, 0, &states(&world));

        // Never acked: no resync
        match b.snapshot_for(1, 500, 0, 0, &states(&world)).unwrap() {
            ServerMessage::DeltaState(d) => assert!(!d.is_full),
            other => panic!("{other:?}"),
        }

        b.record_ack(1, 10);
        world.pop();
        match b.snapshot_for(1, 10 + 121, 0, 0, &states(&world)).unwrap() {
            ServerMessage::DeltaState(d) => {
                assert!(d.is_full);
                assert_eq!(d.entities.len(), 1);
                assert_eq!(d.removed.len(), 1);
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(b.stats().forced_resyncs, 1);
    }

    fn apply(mirror: &mut EntityTable, message: ServerMessage) -> u64 {
        match message {
            ServerMessage::FullState(f) => {
                apply_full_state(mirror, &f);
                f.tick
            }
            ServerMessage::DeltaState(d) => {
                assert!(apply_delta_state(mirror, &d).is_empty());
                d.tick
            }
            other => panic!("{other:?}"),
        }
    }

    fn table(states: &[EntityState]) -> EntityTable {
        states.iter().map(|s| (s.id, s.clone())).collect()
    }

    #[test]
    fn test_lost_delta_removal_recovered() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(1);
        let mut world = vec![unit(0.0), unit(10.0), unit(20.0)];
        let mut mirror = EntityTable::new();

        let tick = apply(&mut mirror, b.snapshot_for(1, 1, 0, 0, &states(&world)).unwrap());
        b.record_ack(1, tick);

        // The removal goes out at tick 3 and is lost in transit
        let ghost = world.remove(1).id;
        b.snapshot_for(1, 3, 0, 0, &states(&world)).unwrap();

        for tick in (5..40).step_by(2) {
            world[0].position.x += 1.0;
            let acked = apply(&mut mirror, b.snapshot_for(1, tick, 0, 0, &states(&world)).unwrap());
            b.record_ack(1, acked);
            assert!(!mirror.contains_key(&ghost), "ghost still present at tick {tick}");
            assert_eq!(mirror, table(&states(&world)));
        }
        assert_eq!(b.baselines_held(1), 1);
    }

    #[test]
    fn test_field_reverting_after_unacked_send() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(1);
        let mut world = vec![unit(0.0)];
        let mut mirror = EntityTable::new();
        let tick = apply(&mut mirror, b.snapshot_for(1, 1, 0, 0, &states(&world)).unwrap());
        b.record_ack(1, tick);

        // Received but not yet acked, then the value returns to the acked one
        world[0].position.x = 5.0;
        apply(&mut mirror, b.snapshot_for(1, 3, 0, 0, &states(&world)).unwrap());
        world[0].position.x = 0.0;
        apply(&mut mirror, b.snapshot_for(1, 5, 0, 0, &states(&world)).unwrap());

        assert_eq!(mirror, table(&states(&world)));
    }

    #[test]
    fn test_ack_trims_baselines() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(1);
        let world = states(&[unit(0.0)]);
        for tick in 1..=4 {
            b.snapshot_for(1, tick, 0, 0, &world);
        }
        assert_eq!(b.baselines_held(1), 4);
        b.record_ack(1, 3);
        assert_eq!(b.baselines_held(1), 2);
        // Unknown tick: nothing to trim
        b.record_ack(1, 99);
        assert_eq!(b.baselines_held(1), 2);
    }

    #[test]
    fn test_dropped_full_snapshot_resent() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(1);
        let world = states(&[unit(0.0)]);
        b.snapshot_for(1, 1, 0, 0, &world);
        b.snapshot_dropped(1, 1);
        assert!(matches!(
            b.snapshot_for(1, 3, 0, 0, &world),
            Some(ServerMessage::FullState(_))
        ));

        // A dropped delta just loses its baseline
        b.snapshot_for(1, 5, 0, 0, &world);
        b.snapshot_dropped(1, 5);
        assert_eq!(b.baselines_held(1), 1);
        assert!(matches!(
            b.snapshot_for(1, 7, 0, 0, &world),
            Some(ServerMessage::DeltaState(_))
        ));
        assert_eq!(b.stats().dropped_snapshots, 2);
    }

    #[test]
    fn test_unacked_history_bounded() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(1);
        let world = states(&[unit(0.0)]);
        for tick in 1..=200 {
            b.snapshot_for(1, tick, 0, 0, &world);
            assert!(b.baselines_held(1) <= MAX_UNACKED_SNAPSHOTS);
        }
        assert!(b.stats().forced_resyncs >= 1);
    }

    #[test]
    fn test_mirror_tracks_broadcasts() {
        let mut b = SnapshotBroadcaster::new(15, 30);
        b.add_connection(7);
        let mut world = vec![unit(0.0), unit(10.0), unit(20.0)];
        let mut mirror = EntityTable::new();

        for tick in 1..20u64 {
            world[0].position.x += 1.37;
            if tick == 5 {
                world.remove(1);
            }
            if tick == 9 {
                world.push(unit(-40.0));
            }
            if tick % 4 == 0 {
                world[0].apply_damage(1.0);
            }
            let current = states(&world);
            match b.snapshot_for(7, tick, 0, 0, &current).unwrap() {
                ServerMessage::FullState(f) => apply_full_state(&mut mirror, &f),
                ServerMessage::DeltaState(d) => {
                    assert!(apply_delta_state(&mut mirror, &d).is_empty());
                }
                other => panic!("{other:?}"),
            }
            let expected: EntityTable = current.iter().map(|s| (s.id, s.clone())).collect();
            assert_eq!(mirror, expected, "diverged at tick {tick}");
        }
    }
}

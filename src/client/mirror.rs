//! Read-only client mirror of the server's entities
//!
//! Snapshots are applied here and nowhere else. Event messages that name
//! an entity the mirror has not seen yet wait in a retry queue, since a
//! gameplay event can overtake the snapshot that introduces its entity.
//! Everything the content layer should react to ends up in the feedback
//! queue, whose batches are leased from an [`ObjectPool`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::client::reconciliation::CorrectionTier;
use crate::game::constants::client::{
    MAX_FEEDBACK_EVENTS, MAX_PENDING_EVENTS, PENDING_RETRY_MS, PENDING_WINDOW_MS,
};
use crate::game::state::{EntityId, EntityKindTag};
use crate::net::delta::{apply_delta_state, apply_full_state, EntityTable};
use crate::net::protocol::{DeltaState, EntityState, FullState, ServerMessage};
use crate::util::pool::{ObjectPool, PoolStats};
use crate::util::vec2::Vec2;

/// Something the content layer (VFX, audio, UI) should react to
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackEvent {
    /// A server event whose referenced entities are all known
    Server(ServerMessage),
    /// The local player started a dash
    DashStarted,
    /// The local player started an ability
    AbilityStarted,
    /// A local drain failed and exhaustion engaged
    Exhausted,
    /// The local player was visibly corrected
    Corrected { tier: CorrectionTier, error: f32 },
}

pub type FeedbackBatch = Vec<FeedbackEvent>;

#[derive(Debug)]
struct PendingEvent {
    message: ServerMessage,
    first_seen: Instant,
    next_retry: Instant,
}

/// Counters for the retry queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MirrorStats {
    pub deferred: u64,
    pub resolved: u64,
    pub expired: u64,
    pub feedback_dropped: u64,
}

pub struct RemoteMirror {
    entities: EntityTable,
    last_tick: Option<u64>,
    pending: VecDeque<PendingEvent>,
    feedback: FeedbackBatch,
    pool: ObjectPool<FeedbackBatch>,
    stats: MirrorStats,
}

impl Default for RemoteMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteMirror {
    pub fn new() -> Self {
        let mut pool: ObjectPool<FeedbackBatch> = ObjectPool::with_prewarmed(
            || Vec::with_capacity(MAX_FEEDBACK_EVENTS),
            2,
            4,
        );
        let feedback = pool.acquire();
        Self {
            entities: EntityTable::new(),
            last_tick: None,
            pending: VecDeque::new(),
            feedback,
            pool,
            stats: MirrorStats::default(),
        }
    }

    // ========================================================================
    // Read accessors
    // ========================================================================

    pub fn get(&self, id: &EntityId) -> Option<&EntityState> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Tick of the newest applied snapshot
    pub fn last_tick(&self) -> Option<u64> {
        self.last_tick
    }

    /// Live structures as (center, radius), for local collision
    pub fn structures(&self) -> impl Iterator<Item = (Vec2, f32)> + '_ {
        self.entities
            .values()
            .filter(|e| e.alive && e.kind == EntityKindTag::Structure)
            .map(|e| (e.position, e.radius))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> MirrorStats {
        self.stats
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    fn accept_tick(&mut self, tick: u64) -> bool {
        if self.last_tick.is_some_and(|last| tick < last) {
            tracing::debug!(tick, last = ?self.last_tick, "stale snapshot ignored");
            return false;
        }
        self.last_tick = Some(tick);
        true
    }

    /// Replace the mirror with a full snapshot. Returns false for a
    /// snapshot older than the one already applied.
    pub fn apply_full(&mut self, full: &FullState) -> bool {
        if !self.accept_tick(full.tick) {
            return false;
        }
        apply_full_state(&mut self.entities, full);
        true
    }

    /// Apply a delta. Returns `None` for a stale snapshot, otherwise the
    /// ids it could not apply; a non-empty list means the mirror has lost
    /// track and needs a full snapshot.
    pub fn apply_delta(&mut self, delta: &DeltaState) -> Option<Vec<EntityId>> {
        if !self.accept_tick(delta.tick) {
            return None;
        }
        Some(apply_delta_state(&mut self.entities, delta))
    }

    pub fn insert(&mut self, state: EntityState) {
        self.entities.insert(state.id, state);
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<EntityState> {
        self.entities.remove(id)
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.pending.clear();
        self.last_tick = None;
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Route a server event to feedback, or park it until the entities
    /// it names show up
    pub fn push_event(&mut self, message: ServerMessage, now: Instant) {
        if self.references_known(&message) {
            self.push_feedback(FeedbackEvent::Server(message));
            return;
        }
        self.stats.deferred += 1;
        self.pending.push_back(PendingEvent {
            message,
            first_seen: now,
            next_retry: now + Duration::from_millis(PENDING_RETRY_MS),
        });
        if self.pending.len() > MAX_PENDING_EVENTS {
            self.pending.pop_front();
            self.stats.expired += 1;
        }
    }

    /// Retry parked events that are due. Events still unresolved after
    /// the retry window are dropped silently.
    pub fn retry_pending(&mut self, now: Instant) {
        let window = Duration::from_millis(PENDING_WINDOW_MS);
        let retry = Duration::from_millis(PENDING_RETRY_MS);

        let mut remaining = VecDeque::with_capacity(self.pending.len());
        while let Some(mut event) = self.pending.pop_front() {
            if now < event.next_retry {
                remaining.push_back(event);
                continue;
            }
            if self.references_known(&event.message) {
                self.stats.resolved += 1;
                self.push_feedback(FeedbackEvent::Server(event.message));
            } else if now.saturating_duration_since(event.first_seen) >= window {
                self.stats.expired += 1;
                tracing::trace!("unresolved event dropped");
            } else {
                event.next_retry = now + retry;
                remaining.push_back(event);
            }
        }
        self.pending = remaining;
    }

    pub fn push_feedback(&mut self, event: FeedbackEvent) {
        if self.feedback.len() >= MAX_FEEDBACK_EVENTS {
            self.feedback.remove(0);
            self.stats.feedback_dropped += 1;
        }
        self.feedback.push(event);
    }

    /// Hand the current feedback batch to the caller
    pub fn take_feedback(&mut self) -> FeedbackBatch {
        let fresh = self.pool.acquire();
        std::mem::replace(&mut self.feedback, fresh)
    }

    /// Give a drained batch back for reuse
    pub fn recycle_feedback(&mut self, batch: FeedbackBatch) {
        self.pool.release(batch);
    }

    fn references_known(&self, message: &ServerMessage) -> bool {
        referenced_ids(message)
            .iter()
            .all(|id| self.entities.contains_key(id))
    }
}

/// Entities an event must be able to resolve before it is surfaced
fn referenced_ids(message: &ServerMessage) -> SmallVec<[EntityId; 2]> {
    let mut ids = SmallVec::new();
    match message {
        ServerMessage::EntityHealthUpdate { id, .. } => ids.push(*id),
        ServerMessage::AbilityCreated { ability_id, .. } => ids.push(*ability_id),
        ServerMessage::AbilityTriggered {
            ability_id,
            target_id,
            ..
        } => {
            ids.push(*ability_id);
            ids.push(*target_id);
        }
        _ => {}
    }
    ids
}

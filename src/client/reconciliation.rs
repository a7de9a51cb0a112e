//! Reconciliation of the predicted player against server snapshots
//!
//! Each snapshot that lists the local player is compared with what the
//! predictor recorded for the echoed sequence. Small errors are ignored,
//! large ones snap, and everything in between becomes a correction that
//! [`ReconciliationEngine::apply_frame`] spreads over the following
//! frames. Rotation follows the same tiers on the short arc.

use crate::client::predictor::ClientPredictor;
use crate::config::SyncConfig;
use crate::game::constants::client::{
    CORRECTION_EPSILON, IDLE_TICK_SLACK, ROTATION_IGNORE, ROTATION_SNAP, TELEPORT_MIN_PX,
};
use crate::game::constants::movement::DASH_MULTIPLIER;
use crate::net::protocol::EntityState;
use crate::util::vec2::{shortest_angle_delta, wrap_angle, Vec2};

/// How a measured error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrectionTier {
    #[default]
    Ignore,
    Blend,
    Snap,
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reconciliation {
    pub tier: CorrectionTier,
    /// Position error in px
    pub error: f32,
    pub rotation_tier: CorrectionTier,
    /// Shortest signed rotation error in radians
    pub rotation_error: f32,
    /// Unacknowledged commands replayed on top of the server state
    pub replayed: usize,
    /// The server position jumped farther than movement allows
    pub teleported: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationStats {
    pub ignored: u64,
    pub blended: u64,
    pub snapped: u64,
}

pub struct ReconciliationEngine {
    ignore_px: f32,
    snap_px: f32,
    dash_snap_px: f32,
    blend_rate: f32,
    dash_blend_rate: f32,
    dt: f32,

    correction: Vec2,
    rotation_correction: f32,
    active_blend_rate: f32,
    /// Last authoritative position and the sequence it reflected
    last_authoritative: Option<(Vec2, u64)>,
    stats: ReconciliationStats,
}

impl ReconciliationEngine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            ignore_px: config.reconcile_ignore_px,
            snap_px: config.reconcile_snap_px,
            dash_snap_px: config.reconcile_dash_snap_px,
            blend_rate: config.reconcile_blend_rate,
            dash_blend_rate: config.reconcile_dash_blend_rate,
            dt: config.tick_dt(),
            correction: Vec2::ZERO,
            rotation_correction: 0.0,
            active_blend_rate: config.reconcile_blend_rate,
            last_authoritative: None,
            stats: ReconciliationStats::default(),
        }
    }

    /// Remaining position correction still to be blended in
    pub fn pending_correction(&self) -> Vec2 {
        self.correction
    }

    pub fn pending_rotation(&self) -> f32 {
        self.rotation_correction
    }

    pub fn stats(&self) -> ReconciliationStats {
        self.stats
    }

    /// Forget corrections and history, e.g. after a rejoin
    pub fn reset(&mut self) {
        self.correction = Vec2::ZERO;
        self.rotation_correction = 0.0;
        self.last_authoritative = None;
    }

    /// Reconcile the predictor with an authoritative snapshot of the
    /// local player
    pub fn reconcile(
        &mut self,
        predictor: &mut ClientPredictor,
        server: &EntityState,
        last_processed_seq: u64,
    ) -> Reconciliation {
        let Some(mut server_state) = server.to_player_state() else {
            tracing::debug!(id = %server.id, "reconcile skipped for non-player state");
            return Reconciliation::default();
        };

        let local = predictor.player().clone();
        let dashing = local.state.dashing || server_state.dashing;
        let snap_px = if dashing { self.dash_snap_px } else { self.snap_px };
        self.active_blend_rate = if dashing {
            self.dash_blend_rate
        } else {
            self.blend_rate
        };

        let teleported = self.is_teleport(server.position, last_processed_seq, server_state.speed);
        self.last_authoritative = Some((server.position, last_processed_seq));

        let acked = predictor.acknowledge(last_processed_seq);
        let replayed = predictor.pending_len();

        // Client-only bookkeeping that never travels on the wire
        server_state.connection = local.state.connection;
        server_state.unlimited_stamina = local.state.unlimited_stamina;
        server_state.last_processed_input_seq = last_processed_seq;

        let (target, target_rotation) = predictor.rewind_and_replay(server.position, server_state);

        let error = match &acked {
            Some(pending) => server.position.distance_to(pending.position),
            None => target.distance_to(local.position),
        };
        let tier = if teleported || error > snap_px {
            CorrectionTier::Snap
        } else if error < self.ignore_px {
            CorrectionTier::Ignore
        } else {
            CorrectionTier::Blend
        };

        match tier {
            CorrectionTier::Snap => {
                self.correction = Vec2::ZERO;
                self.stats.snapped += 1;
                tracing::info!(
                    error,
                    teleported,
                    sequence = last_processed_seq,
                    "reconcile snap"
                );
            }
            CorrectionTier::Blend => {
                predictor.set_position(local.position);
                self.correction = target - local.position;
                self.stats.blended += 1;
            }
            CorrectionTier::Ignore => {
                predictor.set_position(local.position);
                self.correction = Vec2::ZERO;
                self.stats.ignored += 1;
            }
        }

        let rotation_error = shortest_angle_delta(local.rotation(), target_rotation);
        let rotation_tier = if tier == CorrectionTier::Snap || rotation_error.abs() > ROTATION_SNAP {
            CorrectionTier::Snap
        } else if rotation_error.abs() < ROTATION_IGNORE {
            CorrectionTier::Ignore
        } else {
            CorrectionTier::Blend
        };
        match rotation_tier {
            CorrectionTier::Snap => self.rotation_correction = 0.0,
            CorrectionTier::Blend => {
                predictor.set_rotation(local.rotation());
                self.rotation_correction = rotation_error;
            }
            CorrectionTier::Ignore => {
                predictor.set_rotation(local.rotation());
                self.rotation_correction = 0.0;
            }
        }

        Reconciliation {
            tier,
            error,
            rotation_tier,
            rotation_error,
            replayed,
            teleported,
        }
    }

    /// Move a fraction of the outstanding correction into the predictor.
    /// Returns the position offset applied this frame.
    pub fn apply_frame(&mut self, predictor: &mut ClientPredictor) -> Vec2 {
        if self.correction == Vec2::ZERO && self.rotation_correction == 0.0 {
            return Vec2::ZERO;
        }

        let mut step = self.correction * self.active_blend_rate;
        let mut remaining = self.correction - step;
        if remaining.length() < CORRECTION_EPSILON {
            step = self.correction;
            remaining = Vec2::ZERO;
        }

        let mut turn = self.rotation_correction * self.active_blend_rate;
        let mut turn_left = self.rotation_correction - turn;
        if turn_left.abs() < ROTATION_IGNORE * 0.1 {
            turn = self.rotation_correction;
            turn_left = 0.0;
        }

        predictor.nudge(step, turn);
        predictor.set_rotation(wrap_angle(predictor.player().rotation()));
        self.correction = remaining;
        self.rotation_correction = turn_left;
        step
    }

    /// True when the authoritative position moved farther since the last
    /// snapshot than the newly acknowledged commands could have carried it
    fn is_teleport(&self, position: Vec2, sequence: u64, speed: f32) -> bool {
        let Some((previous, previous_seq)) = self.last_authoritative else {
            return false;
        };
        let jump = position.distance_to(previous);
        if jump < TELEPORT_MIN_PX {
            return false;
        }
        let steps = sequence.saturating_sub(previous_seq) + IDLE_TICK_SLACK;
        let reachable = steps as f32 * speed * DASH_MULTIPLIER * self.dt;
        jump > reachable
    }
}

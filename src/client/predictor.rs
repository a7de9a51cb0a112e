//! Client-side prediction for the local player
//!
//! Every sampled input is applied immediately with the same
//! [`step_player`] the server runs, then kept until the server echoes its
//! sequence back. The buffered commands are what reconciliation replays
//! on top of an authoritative state.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::config::SyncConfig;
use crate::game::constants::client::MAX_PENDING_INPUTS;
use crate::game::geometry::Obstacle;
use crate::game::state::{EntityId, EntityKindTag, PlayerState};
use crate::game::systems::collision::ObstacleView;
use crate::game::systems::movement::{step_player, StepOutcome};
use crate::game::validation::sanitize_command;
use crate::net::protocol::{EntityState, InputAction, InputCommand};
use crate::util::vec2::Vec2;

/// Raw input sampled by the input layer for one command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputIntent {
    pub movement: Vec2,
    pub aim: f32,
    pub actions: SmallVec<[InputAction; 2]>,
    pub sprint: bool,
    pub ads: bool,
}

/// A sent command and where the local model ended up after it
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInput {
    pub command: InputCommand,
    pub position: Vec2,
    pub rotation: f32,
}

/// Local copy of the player being predicted
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedPlayer {
    pub id: EntityId,
    pub position: Vec2,
    pub radius: f32,
    pub state: PlayerState,
}

impl PredictedPlayer {
    #[inline]
    pub fn rotation(&self) -> f32 {
        self.state.facing
    }
}

pub struct ClientPredictor {
    player: PredictedPlayer,
    pending: VecDeque<PendingInput>,
    next_sequence: u64,
    dt: f32,
    extent: f32,
    geometry: Vec<Obstacle>,
    structures: Vec<Obstacle>,
    last_outcome: StepOutcome,
}

impl ClientPredictor {
    pub fn new(player: PredictedPlayer, geometry: Vec<Obstacle>, config: &SyncConfig) -> Self {
        Self {
            player,
            pending: VecDeque::with_capacity(MAX_PENDING_INPUTS),
            next_sequence: 1,
            dt: config.tick_dt(),
            extent: config.world_extent,
            geometry,
            structures: Vec::new(),
            last_outcome: StepOutcome::default(),
        }
    }

    /// Start predicting from the first snapshot that lists the local
    /// player. Sequences continue after the server's watermark.
    pub fn from_state(
        state: &EntityState,
        last_processed_seq: u64,
        geometry: Vec<Obstacle>,
        config: &SyncConfig,
    ) -> Option<Self> {
        if state.kind != EntityKindTag::Player {
            return None;
        }
        let player = PredictedPlayer {
            id: state.id,
            position: state.position,
            radius: state.radius,
            state: state.to_player_state()?,
        };
        let mut predictor = Self::new(player, geometry, config);
        predictor.next_sequence = last_processed_seq + 1;
        Some(predictor)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn player(&self) -> &PredictedPlayer {
        &self.player
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingInput> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sequence of the most recently allocated command (0 before any)
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Outcome of the most recent local step
    pub fn last_outcome(&self) -> StepOutcome {
        self.last_outcome
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    // ========================================================================
    // Prediction
    // ========================================================================

    /// Wrap an intent in a command carrying the next sequence
    pub fn next_command(&mut self, intent: &InputIntent, timestamp: f64) -> InputCommand {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        InputCommand {
            sequence,
            timestamp,
            movement: intent.movement,
            aim: intent.aim,
            actions: intent.actions.clone(),
            sprint: intent.sprint,
            ads: intent.ads,
            predicted_position: None,
        }
    }

    /// Apply one command to the local model and buffer it for replay
    pub fn apply_input(&mut self, mut cmd: InputCommand) -> &PredictedPlayer {
        sanitize_command(&mut cmd, self.player.state.facing);

        let view = ObstacleView::new(&self.geometry, &self.structures, self.extent);
        let outcome = step_player(
            self.player.position,
            self.player.radius,
            &mut self.player.state,
            Some(&cmd),
            self.dt,
            &view,
        );
        self.player.position = outcome.position;
        self.player.state.last_processed_input_seq = cmd.sequence;
        self.last_outcome = outcome;

        cmd.predicted_position = Some(outcome.position);
        self.pending.push_back(PendingInput {
            command: cmd,
            position: outcome.position,
            rotation: self.player.state.facing,
        });
        if self.pending.len() > MAX_PENDING_INPUTS {
            self.pending.pop_front();
            tracing::debug!("pending input buffer full, oldest command dropped");
        }
        &self.player
    }

    /// Sample, apply and return the command to transmit
    pub fn predict(&mut self, intent: &InputIntent, timestamp: f64) -> InputCommand {
        let cmd = self.next_command(intent, timestamp);
        self.apply_input(cmd.clone());
        self.pending
            .back()
            .map_or(cmd, |pending| pending.command.clone())
    }

    // ========================================================================
    // Reconciliation hooks
    // ========================================================================

    /// Drop every buffered command the server has processed. Returns the
    /// newest dropped entry, which is the prediction for `sequence`.
    pub fn acknowledge(&mut self, sequence: u64) -> Option<PendingInput> {
        let mut acked = None;
        while self
            .pending
            .front()
            .is_some_and(|p| p.command.sequence <= sequence)
        {
            acked = self.pending.pop_front();
        }
        acked
    }

    /// Reset to an authoritative state and replay the remaining buffered
    /// commands, rewriting their recorded predictions. Returns the
    /// resulting position and rotation.
    pub fn rewind_and_replay(&mut self, position: Vec2, state: PlayerState) -> (Vec2, f32) {
        self.player.position = position;
        self.player.state = state;

        let view = ObstacleView::new(&self.geometry, &self.structures, self.extent);
        for pending in self.pending.iter_mut() {
            let outcome = step_player(
                self.player.position,
                self.player.radius,
                &mut self.player.state,
                Some(&pending.command),
                self.dt,
                &view,
            );
            self.player.position = outcome.position;
            self.player.state.last_processed_input_seq = pending.command.sequence;
            pending.position = outcome.position;
            pending.rotation = self.player.state.facing;
        }
        (self.player.position, self.player.state.facing)
    }

    pub(crate) fn set_position(&mut self, position: Vec2) {
        self.player.position = position;
    }

    pub(crate) fn set_rotation(&mut self, rotation: f32) {
        self.player.state.facing = rotation;
    }

    pub(crate) fn nudge(&mut self, offset: Vec2, rotation: f32) {
        self.player.position += offset;
        self.player.state.facing += rotation;
    }

    /// Replace the structure obstacles known from the mirror
    pub fn set_structures(&mut self, structures: impl IntoIterator<Item = (Vec2, f32)>) {
        self.structures.clear();
        self.structures.extend(
            structures
                .into_iter()
                .map(|(center, radius)| Obstacle::Circle { center, radius }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::constants::stamina::DASH_COST;
    use smallvec::smallvec;
    use uuid::Uuid;

    fn predictor_at(position: Vec2, geometry: Vec<Obstacle>) -> ClientPredictor {
        ClientPredictor::new(
            PredictedPlayer {
                id: Uuid::new_v4(),
                position,
                radius: 10.0,
                state: PlayerState::default(),
            },
            geometry,
            &SyncConfig::default(),
        )
    }

    fn right() -> InputIntent {
        InputIntent {
            movement: Vec2::RIGHT,
            ..Default::default()
        }
    }

    #[test]
    fn test_predict_moves_immediately() {
        let mut p = predictor_at(Vec2::new(100.0, 100.0), Vec::new());
        let cmd = p.predict(&right(), 0.0);
        assert_eq!(cmd.sequence, 1);
        assert!(p.player().position.approx_eq(Vec2::new(106.0, 100.0), 1e-3));
        assert_eq!(cmd.predicted_position, Some(p.player().position));
        assert_eq!(p.pending_len(), 1);
    }

    #[test]
    fn test_sequences_are_strictly_increasing() {
        let mut p = predictor_at(Vec2::ZERO, Vec::new());
        let seqs: Vec<u64> = (0..5).map(|i| p.predict(&right(), i as f64).sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(p.last_sequence(), 5);
    }

    #[test]
    fn test_from_state_continues_after_watermark() {
        let mut state = EntityState::bare(Uuid::new_v4(), EntityKindTag::Player, Vec2::new(5.0, 5.0), 16.0);
        state.health = 100.0;
        state.health_max = 100.0;
        state.speed = Some(180.0);
        state.stamina = Some(80.0);
        let mut p = ClientPredictor::from_state(&state, 41, Vec::new(), &SyncConfig::default()).unwrap();
        assert_eq!(p.player().state.stamina, 80.0);
        assert_eq!(p.predict(&right(), 0.0).sequence, 42);

        let unit = EntityState::bare(Uuid::new_v4(), EntityKindTag::HostileUnit, Vec2::ZERO, 16.0);
        assert!(ClientPredictor::from_state(&unit, 0, Vec::new(), &SyncConfig::default()).is_none());
    }

    #[test]
    fn test_wall_blocks_prediction() {
        let walls = vec![Obstacle::Rect {
            min: Vec2::new(112.0, -500.0),
            max: Vec2::new(132.0, 500.0),
        }];
        let mut p = predictor_at(Vec2::new(100.0, 100.0), walls);
        p.predict(&right(), 0.0);
        assert!(p.player().position.approx_eq(Vec2::new(102.0, 100.0), 1e-3));
    }

    #[test]
    fn test_structures_block_prediction() {
        let mut p = predictor_at(Vec2::ZERO, Vec::new());
        p.set_structures([(Vec2::new(20.0, 0.0), 8.0)]);
        for _ in 0..10 {
            p.predict(&right(), 0.0);
        }
        assert!(p.player().position.x <= 2.1);
    }

    #[test]
    fn test_dash_is_predicted_once() {
        let mut p = predictor_at(Vec2::ZERO, Vec::new());
        let dash = InputIntent {
            movement: Vec2::RIGHT,
            actions: smallvec![InputAction::Dash],
            ..Default::default()
        };
        p.predict(&dash, 0.0);
        assert!(p.last_outcome().dash_started);
        assert_eq!(p.player().state.stamina, 100.0 - DASH_COST);
    }

    #[test]
    fn test_acknowledge_returns_prediction_for_sequence() {
        let mut p = predictor_at(Vec2::ZERO, Vec::new());
        for _ in 0..4 {
            p.predict(&right(), 0.0);
        }
        let acked = p.acknowledge(2).unwrap();
        assert_eq!(acked.command.sequence, 2);
        assert!((acked.position.x - 12.0).abs() < 1e-3);
        assert_eq!(p.pending_len(), 2);
        assert!(p.acknowledge(2).is_none());
        assert_eq!(p.pending_len(), 2);
    }

    #[test]
    fn test_rewind_and_replay() {
        let mut p = predictor_at(Vec2::ZERO, Vec::new());
        for _ in 0..3 {
            p.predict(&right(), 0.0);
        }
        p.acknowledge(1);
        // Server says the first step landed 10px lower
        let (position, _) = p.rewind_and_replay(Vec2::new(6.0, 10.0), PlayerState::default());
        assert!(position.approx_eq(Vec2::new(18.0, 10.0), 1e-3));
        let recorded: Vec<Vec2> = p.pending().map(|x| x.position).collect();
        assert!(recorded[0].approx_eq(Vec2::new(12.0, 10.0), 1e-3));
        assert_eq!(p.player().position, position);
    }

    #[test]
    fn test_pending_buffer_is_bounded() {
        let mut p = predictor_at(Vec2::ZERO, Vec::new());
        for _ in 0..(MAX_PENDING_INPUTS + 10) {
            p.predict(&InputIntent::default(), 0.0);
        }
        assert_eq!(p.pending_len(), MAX_PENDING_INPUTS);
        assert_eq!(p.pending().next().unwrap().command.sequence, 11);
    }

    #[test]
    fn test_sanitizes_before_stepping() {
        let mut p = predictor_at(Vec2::ZERO, Vec::new());
        let wild = InputIntent {
            movement: Vec2::new(f32::NAN, 5.0),
            aim: f32::INFINITY,
            ..Default::default()
        };
        let cmd = p.predict(&wild, 0.0);
        assert!(cmd.movement.length() <= 1.0 + 1e-6);
        assert!(p.player().position.is_finite());
        assert_eq!(p.player().rotation(), 0.0);
    }
}

//! Single-threaded client driver
//!
//! Owns the predictor, the reconciliation engine, the interpolator and
//! the mirror, and routes server messages between them. The host calls
//! [`ClientSession::handle_message`] for every decoded message,
//! [`ClientSession::sample_input`] at the input rate and
//! [`ClientSession::frame`] once per rendered frame; messages to send are
//! collected in an outbox.

use std::time::Instant;

use crate::client::interpolation::{EntityInterpolator, InterpolatedPose};
use crate::client::mirror::{FeedbackBatch, FeedbackEvent, RemoteMirror};
use crate::client::predictor::{ClientPredictor, InputIntent, PredictedPlayer};
use crate::client::reconciliation::{CorrectionTier, Reconciliation, ReconciliationEngine};
use crate::config::SyncConfig;
use crate::game::geometry::Obstacle;
use crate::game::state::EntityId;
use crate::net::protocol::{ClientMessage, InputCommand, PlayerDescriptor, ServerMessage};

pub struct ClientSession {
    config: SyncConfig,
    geometry: Vec<Obstacle>,
    local_id: Option<EntityId>,
    room_id: Option<String>,
    scene: Option<String>,
    predictor: Option<ClientPredictor>,
    engine: ReconciliationEngine,
    interpolator: EntityInterpolator,
    mirror: RemoteMirror,
    outbox: Vec<ClientMessage>,
    last_reconciliation: Option<Reconciliation>,
}

impl ClientSession {
    pub fn new(config: SyncConfig, geometry: Vec<Obstacle>) -> Self {
        Self {
            engine: ReconciliationEngine::new(&config),
            interpolator: EntityInterpolator::new(&config),
            config,
            geometry,
            local_id: None,
            room_id: None,
            scene: None,
            predictor: None,
            mirror: RemoteMirror::new(),
            outbox: Vec::new(),
            last_reconciliation: None,
        }
    }

    // ========================================================================
    // Read accessors
    // ========================================================================

    pub fn local_id(&self) -> Option<EntityId> {
        self.local_id
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn scene(&self) -> Option<&str> {
        self.scene.as_deref()
    }

    /// Static obstacles used for prediction
    pub fn geometry(&self) -> &[Obstacle] {
        &self.geometry
    }

    /// The predicted local player, once the first snapshot has arrived
    pub fn local_player(&self) -> Option<&PredictedPlayer> {
        self.predictor.as_ref().map(ClientPredictor::player)
    }

    pub fn predictor(&self) -> Option<&ClientPredictor> {
        self.predictor.as_ref()
    }

    pub fn mirror(&self) -> &RemoteMirror {
        &self.mirror
    }

    pub fn reconciliation(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn last_reconciliation(&self) -> Option<Reconciliation> {
        self.last_reconciliation
    }

    /// Render pose of a remote entity. Entities without buffered samples
    /// pass through at their mirrored position.
    pub fn remote_pose(&self, id: &EntityId, now: Instant) -> Option<InterpolatedPose> {
        self.interpolator.sample(id, now).or_else(|| {
            self.mirror.get(id).map(|state| InterpolatedPose {
                position: state.position,
                rotation: state.rotation,
            })
        })
    }

    /// Render poses of every mirrored entity except the local player
    pub fn remote_poses(&self, now: Instant) -> Vec<(EntityId, InterpolatedPose)> {
        self.mirror
            .entities()
            .filter(|state| Some(state.id) != self.local_id)
            .filter_map(|state| self.remote_pose(&state.id, now).map(|pose| (state.id, pose)))
            .collect()
    }

    pub fn take_feedback(&mut self) -> FeedbackBatch {
        self.mirror.take_feedback()
    }

    pub fn recycle_feedback(&mut self, batch: FeedbackBatch) {
        self.mirror.recycle_feedback(batch);
    }

    /// Messages queued for the server since the last drain
    pub fn drain_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Queue a join for `room_id`
    pub fn join(&mut self, room_id: &str, descriptor: PlayerDescriptor) {
        self.outbox.push(ClientMessage::Join {
            room_id: room_id.to_string(),
            descriptor,
        });
    }

    pub fn handle_message(&mut self, message: ServerMessage, now: Instant) {
        match message {
            ServerMessage::JoinAccepted {
                entity_id,
                ref room_id,
                ref geometry,
                ..
            } => {
                tracing::info!(%entity_id, room = %room_id, obstacles = geometry.len(), "joined");
                if !geometry.is_empty() {
                    self.geometry = geometry.clone();
                }
                self.room_id = Some(room_id.clone());
                self.local_id = Some(entity_id);
                self.predictor = None;
                self.engine.reset();
                self.mirror.clear();
                self.interpolator.clear();
                self.mirror.push_feedback(FeedbackEvent::Server(message));
            }
            ServerMessage::JoinRejected { ref reason } => {
                tracing::warn!(%reason, "join rejected");
                self.mirror.push_feedback(FeedbackEvent::Server(message));
            }
            ServerMessage::FullState(full) => {
                if self.mirror.apply_full(&full) {
                    self.on_snapshot(full.tick, full.last_processed_input_seq, now);
                }
            }
            ServerMessage::DeltaState(delta) => {
                let Some(unknown) = self.mirror.apply_delta(&delta) else {
                    return;
                };
                if !unknown.is_empty() {
                    tracing::debug!(count = unknown.len(), "delta for unknown entities, requesting full");
                    self.outbox.push(ClientMessage::RequestFull);
                }
                self.on_snapshot(delta.tick, delta.last_processed_input_seq, now);
            }
            ServerMessage::EntityJoined { id, ref descriptor } => {
                if !self.mirror.contains(&id) {
                    self.mirror.insert(descriptor.clone());
                }
                self.mirror.push_feedback(FeedbackEvent::Server(message));
            }
            ServerMessage::EntityLeft { id } => {
                self.mirror.remove(&id);
                self.interpolator.remove(&id);
                self.mirror.push_feedback(FeedbackEvent::Server(message));
            }
            ServerMessage::SceneChanged { ref scene, .. } => {
                self.scene = Some(scene.clone());
                self.mirror.push_feedback(FeedbackEvent::Server(message));
            }
            other => self.mirror.push_event(other, now),
        }
    }

    fn on_snapshot(&mut self, tick: u64, last_processed_seq: u64, now: Instant) {
        self.outbox.push(ClientMessage::Ack { tick });

        for state in self.mirror.entities() {
            if Some(state.id) != self.local_id {
                self.interpolator
                    .push_sample(state.id, state.position, state.rotation, now);
            }
        }
        let mirror = &self.mirror;
        self.interpolator.retain(|id| mirror.contains(id));

        let Some(local) = self.local_id.and_then(|id| self.mirror.get(&id)).cloned() else {
            return;
        };
        match self.predictor.as_mut() {
            None => {
                self.predictor = ClientPredictor::from_state(
                    &local,
                    last_processed_seq,
                    self.geometry.clone(),
                    &self.config,
                );
            }
            Some(predictor) => {
                let result = self.engine.reconcile(predictor, &local, last_processed_seq);
                if result.tier != CorrectionTier::Ignore {
                    self.mirror.push_feedback(FeedbackEvent::Corrected {
                        tier: result.tier,
                        error: result.error,
                    });
                }
                self.last_reconciliation = Some(result);
            }
        }
        if let Some(predictor) = self.predictor.as_mut() {
            predictor.set_structures(self.mirror.structures());
        }
    }

    /// Predict one input sample and queue it for sending. Returns `None`
    /// until the local player has been seen in a snapshot.
    pub fn sample_input(&mut self, intent: &InputIntent, timestamp: f64) -> Option<InputCommand> {
        let predictor = self.predictor.as_mut()?;
        let cmd = predictor.predict(intent, timestamp);
        let outcome = predictor.last_outcome();

        if outcome.dash_started {
            self.mirror.push_feedback(FeedbackEvent::DashStarted);
        }
        if outcome.ability_started {
            self.mirror.push_feedback(FeedbackEvent::AbilityStarted);
        }
        if outcome.exhausted {
            self.mirror.push_feedback(FeedbackEvent::Exhausted);
        }
        self.outbox.push(ClientMessage::Input(cmd.clone()));
        Some(cmd)
    }

    /// Per-frame work: blend corrections and retry parked events
    pub fn frame(&mut self, now: Instant) {
        if let Some(predictor) = self.predictor.as_mut() {
            self.engine.apply_frame(predictor);
        }
        self.mirror.retry_pending(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::EntityKindTag;
    use crate::metrics::Metrics;
    use crate::net::protocol::{decode, EntityState, FullState};
    use crate::net::room::{Frame, Room, RoomCommand};
    use crate::util::vec2::Vec2;
    use smallvec::smallvec;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const CONNECTION: u64 = 1;

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode(&frame[4..]).unwrap());
        }
        out
    }

    fn forward(session: &mut ClientSession, room: &mut Room, now: Instant) -> usize {
        let mut inputs = 0;
        for message in session.drain_outbox() {
            let command = match message {
                ClientMessage::Input(command) => {
                    inputs += 1;
                    RoomCommand::Input {
                        connection: CONNECTION,
                        command,
                        received_at: now,
                    }
                }
                ClientMessage::Ack { tick } => RoomCommand::Ack {
                    connection: CONNECTION,
                    tick,
                },
                ClientMessage::RequestFull => RoomCommand::RequestFull {
                    connection: CONNECTION,
                },
                _ => continue,
            };
            room.handle_command(command, now);
        }
        inputs
    }

    fn player_state(id: EntityId, position: Vec2) -> EntityState {
        let mut state = EntityState::bare(id, EntityKindTag::Player, position, 16.0);
        state.health = 100.0;
        state.health_max = 100.0;
        state.speed = Some(180.0);
        state.stamina = Some(100.0);
        state.stamina_max = Some(100.0);
        state
    }

    fn accepted(session: &mut ClientSession, id: EntityId, now: Instant) {
        session.handle_message(
            ServerMessage::JoinAccepted {
                entity_id: id,
                room_id: "alpha".into(),
                tick_rate: 30,
                broadcast_rate: 15,
                input_rate: 30,
                geometry: Vec::new(),
            },
            now,
        );
    }

    #[test]
    fn test_room_round_trip_converges() {
        let config = SyncConfig::default();
        let geometry = vec![Obstacle::Rect {
            min: Vec2::new(150.0, -400.0),
            max: Vec2::new(170.0, 400.0),
        }];
        let mut room = Room::new(
            "alpha".into(),
            &config,
            geometry.clone(),
            4,
            Arc::new(Metrics::new()),
        );
        // Walls arrive with the join reply
        let mut session = ClientSession::new(config, Vec::new());

        let (tx, mut rx) = mpsc::channel(512);
        let mut now = Instant::now();
        room.handle_command(
            RoomCommand::Join {
                connection: CONNECTION,
                descriptor: PlayerDescriptor {
                    position: Some(Vec2::ZERO),
                    ..Default::default()
                },
                outbound: tx,
            },
            now,
        );

        for message in drain(&mut rx) {
            session.handle_message(message, now);
        }
        assert_eq!(session.geometry(), geometry.as_slice());

        let mut sent = 0;
        for tick in 0..120u32 {
            let intent = InputIntent {
                movement: Vec2::from_angle(tick as f32 * 0.03),
                aim: tick as f32 * 0.02,
                sprint: tick % 5 == 0,
                actions: if tick == 40 { smallvec![crate::net::protocol::InputAction::Dash] } else { smallvec![] },
                ..Default::default()
            };
            session.sample_input(&intent, tick as f64 * 33.0);
            sent += forward(&mut session, &mut room, now);

            room.step(now);
            for message in drain(&mut rx) {
                session.handle_message(message, now);
            }
            forward(&mut session, &mut room, now);
            session.frame(now);
            now += Duration::from_millis(34);
        }

        assert!(sent > 100);
        let local = session.local_player().unwrap();
        let server = room
            .simulation()
            .registry()
            .get(&local.id)
            .unwrap()
            .position;
        assert!(local.position.distance_to(server) < 5.0);
        assert_eq!(session.reconciliation().stats().snapped, 0);
        assert!(session.predictor().unwrap().pending_len() <= 2);
        assert!(session
            .take_feedback()
            .iter()
            .any(|e| *e == FeedbackEvent::DashStarted));
    }

    #[test]
    fn test_no_prediction_before_first_snapshot() {
        let mut session = ClientSession::new(SyncConfig::default(), Vec::new());
        let now = Instant::now();
        accepted(&mut session, Uuid::new_v4(), now);
        assert!(session.sample_input(&InputIntent::default(), 0.0).is_none());
        assert!(session.drain_outbox().is_empty());
    }

    #[test]
    fn test_snapshot_acks_and_starts_prediction() {
        let mut session = ClientSession::new(SyncConfig::default(), Vec::new());
        let now = Instant::now();
        let me = Uuid::new_v4();
        accepted(&mut session, me, now);
        session.handle_message(
            ServerMessage::FullState(FullState {
                tick: 7,
                timestamp: 0,
                last_processed_input_seq: 3,
                entities: vec![player_state(me, Vec2::new(10.0, 10.0))],
            }),
            now,
        );
        assert_eq!(session.drain_outbox(), vec![ClientMessage::Ack { tick: 7 }]);
        assert_eq!(session.local_player().unwrap().position, Vec2::new(10.0, 10.0));

        let cmd = session.sample_input(&InputIntent::default(), 0.0).unwrap();
        assert_eq!(cmd.sequence, 4);
        assert!(matches!(session.drain_outbox().as_slice(), [ClientMessage::Input(c)] if c.sequence == 4));
        // The local player is never interpolated
        assert!(session.remote_poses(now).is_empty());
    }

    #[test]
    fn test_unknown_delta_requests_full() {
        let mut session = ClientSession::new(SyncConfig::default(), Vec::new());
        let now = Instant::now();
        session.handle_message(
            ServerMessage::DeltaState(crate::net::protocol::DeltaState {
                tick: 2,
                timestamp: 0,
                last_processed_input_seq: 0,
                entities: vec![crate::net::protocol::EntityDelta {
                    id: Uuid::new_v4(),
                    position: Some(Vec2::ZERO),
                    ..Default::default()
                }],
                removed: Vec::new(),
                is_full: false,
            }),
            now,
        );
        let outbox = session.drain_outbox();
        assert!(outbox.contains(&ClientMessage::RequestFull));
        assert!(outbox.contains(&ClientMessage::Ack { tick: 2 }));
    }

    #[test]
    fn test_remote_entities_are_interpolated() {
        let mut session = ClientSession::new(SyncConfig::default(), Vec::new());
        let t0 = Instant::now();
        let other = Uuid::new_v4();
        for (i, x) in [0.0, 20.0].into_iter().enumerate() {
            session.handle_message(
                ServerMessage::FullState(FullState {
                    tick: i as u64,
                    timestamp: 0,
                    last_processed_input_seq: 0,
                    entities: vec![player_state(other, Vec2::new(x, 0.0))],
                }),
                t0 + Duration::from_millis(i as u64 * 100),
            );
        }
        let pose = session.remote_pose(&other, t0 + Duration::from_millis(150)).unwrap();
        assert!(pose.position.approx_eq(Vec2::new(10.0, 0.0), 1e-3));

        session.handle_message(ServerMessage::EntityLeft { id: other }, t0);
        assert!(session.remote_pose(&other, t0).is_none());
    }

    #[test]
    fn test_events_wait_for_their_entity() {
        let mut session = ClientSession::new(SyncConfig::default(), Vec::new());
        let t0 = Instant::now();
        let other = Uuid::new_v4();
        let hit = ServerMessage::EntityHealthUpdate {
            id: other,
            health: 90.0,
            damage: Some(10.0),
            source: None,
        };
        session.handle_message(hit.clone(), t0);
        assert!(session.take_feedback().is_empty());

        session.handle_message(
            ServerMessage::EntityJoined {
                id: other,
                descriptor: player_state(other, Vec2::ZERO),
            },
            t0 + Duration::from_millis(20),
        );
        session.frame(t0 + Duration::from_millis(60));
        let feedback = session.take_feedback();
        assert!(feedback.contains(&FeedbackEvent::Server(hit)));
    }

    #[test]
    fn test_rejoin_resets_prediction() {
        let mut session = ClientSession::new(SyncConfig::default(), Vec::new());
        let now = Instant::now();
        let me = Uuid::new_v4();
        accepted(&mut session, me, now);
        session.handle_message(
            ServerMessage::FullState(FullState {
                tick: 1,
                timestamp: 0,
                last_processed_input_seq: 0,
                entities: vec![player_state(me, Vec2::ZERO)],
            }),
            now,
        );
        assert!(session.local_player().is_some());

        accepted(&mut session, me, now);
        assert!(session.local_player().is_none());
        assert!(session.mirror().is_empty());
        assert_eq!(session.room_id(), Some("alpha"));
    }
}

//! Rooms: one simulation, one broadcaster and one tick-loop task each
//!
//! Connection tasks reach a room only through its [`RoomHandle`], which
//! pushes [`RoomCommand`]s into the room's lock-free command buffer. The
//! tick loop drains that buffer at the start of every tick, so canonical
//! state has exactly one writer. Outbound frames go back over each
//! connection's bounded mpsc queue with `try_send`; the tick loop never
//! awaits network I/O.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::game::constants::net::{COMMAND_QUEUE, ROOM_IDLE_SECS, STATS_LOG_SECS};
use crate::game::geometry::Obstacle;
use crate::game::input_buffer::{InputBuffer, InputBufferError, InputSender};
use crate::game::simulation::ServerSimulation;
use crate::game::state::{ConnectionId, EntityId};
use crate::game::validation::{validate_ready_timer, validate_scene, InputViolation};
use crate::metrics::Metrics;
use crate::net::broadcast::SnapshotBroadcaster;
use crate::net::framing::encode_frame;
use crate::net::protocol::{AbilityRequest, InputCommand, PlayerDescriptor, ServerMessage};

/// Encoded frame shared across outbound queues
pub type Frame = Arc<[u8]>;

/// Per-connection outbound queue
pub type Outbound = mpsc::Sender<Frame>;

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Room errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoomError {
    #[error("Room limit reached ({0})")]
    TooManyRooms(usize),
    #[error("Room is closed")]
    Closed,
    #[error("Room command queue is full")]
    Busy,
    #[error("Invalid request: {0}")]
    Invalid(#[from] InputViolation),
}

/// Mode-transition requests
#[derive(Debug, Clone, PartialEq)]
pub enum RoomAction {
    SceneChange { scene: String },
    ReadyTimerStart { seconds: f32 },
    ReadyTimerCancel,
    Ability(AbilityRequest),
}

/// Everything a connection task can ask of a room
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        connection: ConnectionId,
        descriptor: PlayerDescriptor,
        outbound: Outbound,
    },
    Input {
        connection: ConnectionId,
        command: InputCommand,
        received_at: Instant,
    },
    Action {
        connection: ConnectionId,
        action: RoomAction,
    },
    RequestFull {
        connection: ConnectionId,
    },
    Ack {
        connection: ConnectionId,
        tick: u64,
    },
    Leave {
        connection: ConnectionId,
    },
}

// ============================================================================
// Room state (owned by the tick loop)
// ============================================================================

/// One room's authoritative state
pub struct Room {
    id: String,
    tick_rate: u32,
    broadcast_rate: u32,
    input_rate: u32,
    max_players: usize,
    simulation: ServerSimulation,
    broadcaster: SnapshotBroadcaster,
    outbound: HashMap<ConnectionId, Outbound>,
    scene: Option<String>,
    /// Seconds left on the ready timer
    ready_timer: Option<f32>,
    empty_since: Option<Instant>,
    metrics: Arc<Metrics>,
    reported_entities: u64,
    reported_divergence: u64,
}

impl Room {
    pub fn new(
        id: String,
        config: &SyncConfig,
        geometry: Vec<Obstacle>,
        max_players: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            tick_rate: config.tick_rate,
            broadcast_rate: config.broadcast_rate,
            input_rate: config.input_rate,
            max_players,
            simulation: ServerSimulation::new(config, geometry),
            broadcaster: SnapshotBroadcaster::new(config.broadcast_rate, config.tick_rate),
            outbound: HashMap::new(),
            scene: None,
            ready_timer: None,
            empty_since: Some(Instant::now()),
            metrics,
            reported_entities: 0,
            reported_divergence: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn simulation(&self) -> &ServerSimulation {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut ServerSimulation {
        &mut self.simulation
    }

    pub fn scene(&self) -> Option<&str> {
        self.scene.as_deref()
    }

    pub fn ready_timer(&self) -> Option<f32> {
        self.ready_timer
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.len()
    }

    /// How long the room has had no connections
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.empty_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    pub fn handle_command(&mut self, command: RoomCommand, now: Instant) {
        match command {
            RoomCommand::Join {
                connection,
                descriptor,
                outbound,
            } => self.join(connection, &descriptor, outbound),

            RoomCommand::Input {
                connection,
                command,
                received_at,
            } => {
                let sequence = command.sequence;
                let disposition = self.simulation.queue_input(connection, command, received_at);
                self.metrics.record_input(&disposition);
                debug!(room = %self.id, connection, sequence, ?disposition, "input");
            }

            RoomCommand::Action { connection, action } => self.action(connection, action),

            RoomCommand::RequestFull { connection } => self.broadcaster.request_full(connection),

            RoomCommand::Ack { connection, tick } => self.broadcaster.record_ack(connection, tick),

            RoomCommand::Leave { connection } => self.leave(connection, now),
        }
    }

    fn join(&mut self, connection: ConnectionId, descriptor: &PlayerDescriptor, outbound: Outbound) {
        let rejoin = self.simulation.entity_for(connection).is_some();
        if !rejoin && self.simulation.connection_count() >= self.max_players {
            info!(room = %self.id, connection, "join rejected: room full");
            let reply = ServerMessage::JoinRejected {
                reason: format!("Room is full ({} players)", self.max_players),
            };
            if let Ok(frame) = encode_frame(&reply) {
                let _ = outbound.try_send(frame);
            }
            return;
        }

        let entity_id = self.simulation.add_player(connection, descriptor);
        self.outbound.insert(connection, outbound);
        self.broadcaster.add_connection(connection);
        self.empty_since = None;

        info!(room = %self.id, connection, %entity_id, rejoin, "player joined");
        self.send_to(
            connection,
            &ServerMessage::JoinAccepted {
                entity_id,
                room_id: self.id.clone(),
                tick_rate: self.tick_rate,
                broadcast_rate: self.broadcast_rate,
                input_rate: self.input_rate,
                geometry: self.simulation.geometry().to_vec(),
            },
        );
    }

    fn leave(&mut self, connection: ConnectionId, now: Instant) {
        self.simulation.remove_connection(connection);
        self.broadcaster.remove_connection(connection);
        if self.outbound.remove(&connection).is_some() {
            info!(room = %self.id, connection, "player left");
        }
        if self.outbound.is_empty() && self.empty_since.is_none() {
            self.empty_since = Some(now);
        }
    }

    fn action(&mut self, connection: ConnectionId, action: RoomAction) {
        let Some(requested_by) = self.simulation.entity_for(connection) else {
            debug!(room = %self.id, connection, "action from a connection without a player");
            return;
        };
        if let Err(e) = self.apply_action(requested_by, connection, action) {
            debug!(room = %self.id, connection, error = %e, "action refused");
        }
    }

    fn apply_action(
        &mut self,
        requested_by: EntityId,
        connection: ConnectionId,
        action: RoomAction,
    ) -> Result<(), InputViolation> {
        match action {
            RoomAction::SceneChange { scene } => {
                let scene = validate_scene(&scene)?;
                info!(room = %self.id, %scene, "scene change");
                self.scene = Some(scene.clone());
                self.broadcast(&ServerMessage::SceneChanged { scene, requested_by });
            }
            RoomAction::ReadyTimerStart { seconds } => {
                let seconds = validate_ready_timer(seconds)?;
                self.ready_timer = Some(seconds);
                self.broadcast(&ServerMessage::ReadyTimerStarted {
                    seconds,
                    requested_by,
                });
            }
            RoomAction::ReadyTimerCancel => {
                if self.ready_timer.take().is_some() {
                    self.broadcast(&ServerMessage::ReadyTimerCancelled { requested_by });
                }
            }
            RoomAction::Ability(request) => {
                self.simulation.request_ability(connection, &request)?;
            }
        }
        Ok(())
    }

    /// Run one tick, fan out its events, and broadcast snapshots when due
    pub fn step(&mut self, now: Instant) {
        let started = Instant::now();
        let events = self.simulation.tick_at(now);
        self.metrics.record_tick_time(started.elapsed());

        for event in &events {
            if let Some(message) = event.to_message() {
                self.broadcast(&message);
            }
        }

        if let Some(remaining) = self.ready_timer.as_mut() {
            *remaining -= self.simulation.dt();
            if *remaining <= 0.0 {
                self.ready_timer = None;
                info!(room = %self.id, "ready timer elapsed");
                self.broadcast(&ServerMessage::ReadyTimerElapsed);
            }
        }

        if self.broadcaster.advance(self.simulation.dt() as f64) {
            self.send_snapshots();
        }

        self.report_gauges();
    }

    fn send_snapshots(&mut self) {
        let states = self.simulation.entity_states();
        let tick = self.simulation.tick_count();
        let timestamp = unix_millis();
        let connections: Vec<ConnectionId> = self.outbound.keys().copied().collect();

        for connection in connections {
            let seq = self.simulation.last_processed_input_seq(connection);
            let Some(message) = self
                .broadcaster
                .snapshot_for(connection, tick, timestamp, seq, &states)
            else {
                continue;
            };
            let counter = match message {
                ServerMessage::FullState(_) => &self.metrics.snapshots_full,
                _ => &self.metrics.snapshots_delta,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            if !self.send_to(connection, &message) {
                self.broadcaster.snapshot_dropped(connection, tick);
            }
        }
    }

    fn report_gauges(&mut self) {
        let entities = self.simulation.registry().len() as u64;
        Metrics::shift_gauge(&self.metrics.entities, self.reported_entities, entities);
        self.reported_entities = entities;

        let divergence = self.simulation.stats().divergence_reports;
        self.metrics
            .divergence_reports
            .fetch_add(divergence - self.reported_divergence, Ordering::Relaxed);
        self.reported_divergence = divergence;
    }

    pub fn log_stats(&self) {
        let pipeline = self.simulation.pipeline_stats();
        let broadcast = self.broadcaster.stats();
        info!(
            room = %self.id,
            tick = self.simulation.tick_count(),
            players = self.simulation.connection_count(),
            entities = self.simulation.registry().len(),
            accepted = pipeline.accepted,
            stale = pipeline.stale + pipeline.duplicate,
            throttled = pipeline.throttled,
            rejected = pipeline.rejected,
            full = broadcast.full_snapshots,
            delta = broadcast.delta_snapshots,
            resyncs = broadcast.forced_resyncs,
            "room stats"
        );
    }

    /// Encode once and queue for every connection
    pub fn broadcast(&mut self, message: &ServerMessage) {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room = %self.id, "Failed to encode message for broadcast: {}", e);
                return;
            }
        };
        let connections: Vec<ConnectionId> = self.outbound.keys().copied().collect();
        for connection in connections {
            self.queue_frame(connection, frame.clone());
        }
    }

    /// Encode and queue one message; false when it was not queued
    fn send_to(&mut self, connection: ConnectionId, message: &ServerMessage) -> bool {
        match encode_frame(message) {
            Ok(frame) => self.queue_frame(connection, frame),
            Err(e) => {
                warn!(room = %self.id, connection, "Failed to encode message: {}", e);
                false
            }
        }
    }

    fn queue_frame(&mut self, connection: ConnectionId, frame: Frame) -> bool {
        let Some(outbound) = self.outbound.get(&connection) else {
            return false;
        };
        match outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(room = %self.id, connection, "outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Writer gone; the connection's Leave is on its way
                debug!(room = %self.id, connection, "outbound queue closed");
                false
            }
        }
    }

    /// Tell anyone still waiting that the room is gone
    fn reject_late(&mut self, command: RoomCommand) {
        if let RoomCommand::Join { outbound, .. } = command {
            if let Ok(frame) = encode_frame(&ServerMessage::JoinRejected {
                reason: "Room closed".to_string(),
            }) {
                let _ = outbound.try_send(frame);
            }
        }
    }

    fn shutdown(&mut self) {
        Metrics::shift_gauge(&self.metrics.entities, self.reported_entities, 0);
        self.reported_entities = 0;
        self.outbound.clear();
    }
}

// ============================================================================
// Tick loop task
// ============================================================================

/// Connection-side handle to a running room
#[derive(Clone)]
pub struct RoomHandle {
    id: String,
    sender: InputSender<RoomCommand>,
    closed: Arc<AtomicBool>,
}

impl RoomHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send(&self, command: RoomCommand) -> Result<(), RoomError> {
        if self.is_closed() {
            return Err(RoomError::Closed);
        }
        self.sender.try_send(command).map_err(|e| match e {
            InputBufferError::Full => RoomError::Busy,
            InputBufferError::Disconnected => RoomError::Closed,
        })
    }
}

/// Spawn a room's tick loop on the current runtime
pub fn spawn_room(room: Room) -> RoomHandle {
    let buffer = InputBuffer::new(COMMAND_QUEUE);
    let handle = RoomHandle {
        id: room.id.clone(),
        sender: buffer.sender(),
        closed: Arc::new(AtomicBool::new(false)),
    };
    tokio::spawn(run_room(room, buffer, handle.closed.clone()));
    handle
}

async fn run_room(mut room: Room, buffer: InputBuffer<RoomCommand>, closed: Arc<AtomicBool>) {
    let mut ticker = interval(room.simulation.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    room.metrics.rooms_active.fetch_add(1, Ordering::Relaxed);
    info!(room = %room.id, tick_rate = room.tick_rate, "room started");

    let stats_every = Duration::from_secs(STATS_LOG_SECS);
    let idle_limit = Duration::from_secs(ROOM_IDLE_SECS);
    let mut last_stats = Instant::now();

    loop {
        ticker.tick().await;
        let now = Instant::now();

        for command in buffer.drain() {
            room.handle_command(command, now);
        }
        room.step(now);

        if now.duration_since(last_stats) >= stats_every {
            room.log_stats();
            last_stats = now;
        }

        if room.idle_for(now) >= idle_limit {
            break;
        }
    }

    closed.store(true, Ordering::Release);
    for command in buffer.drain() {
        room.reject_late(command);
    }
    room.shutdown();
    room.metrics.rooms_active.fetch_sub(1, Ordering::Relaxed);
    info!(room = %room.id, "room closed after idle timeout");
}

// ============================================================================
// Registry
// ============================================================================

/// Room lookup and creation
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    config: SyncConfig,
    max_rooms: usize,
    max_players: usize,
    metrics: Arc<Metrics>,
    next_connection: AtomicU64,
    /// Static obstacles every new room starts with
    geometry: Vec<Obstacle>,
}

impl RoomRegistry {
    pub fn new(config: SyncConfig, max_rooms: usize, max_players: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            max_rooms,
            max_players,
            metrics,
            next_connection: AtomicU64::new(1),
            geometry: Vec::new(),
        }
    }

    /// Use `geometry` for every room created from now on
    pub fn with_geometry(mut self, geometry: Vec<Obstacle>) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn geometry(&self) -> &[Obstacle] {
        &self.geometry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Find a running room or start a new one
    pub async fn get_or_create(&self, room_id: &str) -> Result<RoomHandle, RoomError> {
        if let Some(handle) = self.rooms.read().await.get(room_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, handle| !handle.is_closed());
        if let Some(handle) = rooms.get(room_id) {
            return Ok(handle.clone());
        }
        if rooms.len() >= self.max_rooms {
            warn!(room = room_id, max = self.max_rooms, "room limit reached");
            return Err(RoomError::TooManyRooms(self.max_rooms));
        }

        let room = Room::new(
            room_id.to_string(),
            &self.config,
            self.geometry.clone(),
            self.max_players,
            self.metrics.clone(),
        );
        let handle = spawn_room(room);
        rooms.insert(room_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Number of rooms that have not closed
    pub async fn room_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::decode;
    use crate::util::vec2::Vec2;

    fn room(max_players: usize) -> Room {
        Room::new(
            "alpha".to_string(),
            &SyncConfig::default(),
            Vec::new(),
            max_players,
            Arc::new(Metrics::new()),
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode(&frame[4..]).unwrap());
        }
        out
    }

    fn join(room: &mut Room, connection: ConnectionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(64);
        room.handle_command(
            RoomCommand::Join {
                connection,
                descriptor: PlayerDescriptor {
                    position: Some(Vec2::new(connection as f32 * 100.0, 0.0)),
                    ..Default::default()
                },
                outbound: tx,
            },
            Instant::now(),
        );
        rx
    }

    #[test]
    fn test_join_then_full_then_delta() {
        let mut room = room(4);
        let mut rx = join(&mut room, 1);

        let accepted = drain(&mut rx);
        assert!(matches!(
            accepted.as_slice(),
            [ServerMessage::JoinAccepted { room_id, tick_rate: 30, .. }] if room_id == "alpha"
        ));

        let now = Instant::now();
        room.step(now);
        room.step(now);
        let messages = drain(&mut rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::EntityJoined { .. })));
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::FullState(f) if f.entities.len() == 1)));

        room.step(now);
        room.step(now);
        let messages = drain(&mut rx);
        assert!(matches!(messages.as_slice(), [ServerMessage::DeltaState(_)]));
    }

    #[tokio::test]
    async fn test_registry_geometry_reaches_joining_clients() {
        let wall = Obstacle::Rect {
            min: Vec2::new(40.0, -10.0),
            max: Vec2::new(60.0, 10.0),
        };
        let registry = RoomRegistry::new(SyncConfig::default(), 2, 8, Arc::new(Metrics::new()))
            .with_geometry(vec![wall]);
        assert_eq!(registry.geometry(), &[wall]);

        let mut room = Room::new(
            "walls".to_string(),
            registry.config(),
            registry.geometry().to_vec(),
            4,
            registry.metrics().clone(),
        );
        assert_eq!(room.simulation().geometry(), &[wall]);
        let mut rx = join(&mut room, 1);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::JoinAccepted { geometry, .. }] if geometry == &vec![wall]
        ));
    }

    #[test]
    fn test_room_full_rejects() {
        let mut room = room(1);
        let _first = join(&mut room, 1);
        let mut second = join(&mut room, 2);
        assert!(matches!(
            drain(&mut second).as_slice(),
            [ServerMessage::JoinRejected { .. }]
        ));
        assert_eq!(room.connection_count(), 1);
        assert_eq!(room.simulation().connection_count(), 1);
    }

    #[test]
    fn test_scene_and_ready_timer_broadcasts() {
        let mut room = room(4);
        let mut a = join(&mut room, 1);
        let mut b = join(&mut room, 2);
        drain(&mut a);
        drain(&mut b);
        let now = Instant::now();

        room.handle_command(
            RoomCommand::Action {
                connection: 1,
                action: RoomAction::SceneChange {
                    scene: "harbor".into(),
                },
            },
            now,
        );
        assert_eq!(room.scene(), Some("harbor"));
        assert!(matches!(
            drain(&mut b).as_slice(),
            [ServerMessage::SceneChanged { scene, .. }] if scene == "harbor"
        ));

        // Invalid timers are refused without a broadcast
        room.handle_command(
            RoomCommand::Action {
                connection: 2,
                action: RoomAction::ReadyTimerStart { seconds: -1.0 },
            },
            now,
        );
        assert!(room.ready_timer().is_none());

        room.handle_command(
            RoomCommand::Action {
                connection: 2,
                action: RoomAction::ReadyTimerStart { seconds: 0.1 },
            },
            now,
        );
        drain(&mut a);
        room.step(now);
        room.step(now);
        assert!(room.ready_timer().is_some());
        room.step(now);
        room.step(now);
        assert!(room.ready_timer().is_none());
        assert!(drain(&mut a)
            .iter()
            .any(|m| matches!(m, ServerMessage::ReadyTimerElapsed)));
    }

    #[test]
    fn test_ready_timer_cancel() {
        let mut room = room(4);
        let mut a = join(&mut room, 1);
        let now = Instant::now();
        let start = RoomCommand::Action {
            connection: 1,
            action: RoomAction::ReadyTimerStart { seconds: 5.0 },
        };
        room.handle_command(start, now);
        room.handle_command(
            RoomCommand::Action {
                connection: 1,
                action: RoomAction::ReadyTimerCancel,
            },
            now,
        );
        let messages = drain(&mut a);
        assert!(matches!(
            messages.as_slice(),
            [
                ServerMessage::JoinAccepted { .. },
                ServerMessage::ReadyTimerStarted { .. },
                ServerMessage::ReadyTimerCancelled { .. }
            ]
        ));
    }

    #[test]
    fn test_input_echoed_in_snapshot() {
        let mut room = room(4);
        let mut rx = join(&mut room, 1);
        let now = Instant::now();
        room.handle_command(
            RoomCommand::Input {
                connection: 1,
                command: InputCommand {
                    sequence: 1,
                    movement: Vec2::new(1.0, 0.0),
                    ..Default::default()
                },
                received_at: now,
            },
            now,
        );
        room.step(now);
        room.step(now);
        let seq = drain(&mut rx).into_iter().find_map(|m| match m {
            ServerMessage::FullState(f) => Some(f.last_processed_input_seq),
            _ => None,
        });
        assert_eq!(seq, Some(1));
        assert_eq!(room.metrics.inputs_accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_full_outbound_drops_frames() {
        let mut room = room(4);
        let (tx, _rx) = mpsc::channel(1);
        room.handle_command(
            RoomCommand::Join {
                connection: 1,
                descriptor: PlayerDescriptor::default(),
                outbound: tx,
            },
            Instant::now(),
        );
        let now = Instant::now();
        room.step(now);
        room.step(now);
        assert!(room.metrics.frames_dropped.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_client_converges_after_dropped_snapshot() {
        use crate::net::delta::{apply_delta_state, apply_full_state, EntityTable};

        let mut room = room(4);
        let (tx, mut rx) = mpsc::channel(8);
        let filler = tx.clone();
        room.handle_command(
            RoomCommand::Join {
                connection: 1,
                descriptor: PlayerDescriptor::default(),
                outbound: tx,
            },
            Instant::now(),
        );
        let _other = join(&mut room, 2);
        let leaving = room.simulation().entity_for(2).unwrap();
        let now = Instant::now();

        // Apply and ack every snapshot queued for connection 1
        fn receive(
            room: &mut Room,
            rx: &mut mpsc::Receiver<Frame>,
            mirror: &mut EntityTable,
            now: Instant,
        ) -> bool {
            let mut got_snapshot = false;
            while let Ok(frame) = rx.try_recv() {
                if frame.len() <= 4 {
                    continue;
                }
                let tick = match decode::<ServerMessage>(&frame[4..]).unwrap() {
                    ServerMessage::FullState(f) => {
                        apply_full_state(mirror, &f);
                        f.tick
                    }
                    ServerMessage::DeltaState(d) => {
                        assert!(apply_delta_state(mirror, &d).is_empty());
                        d.tick
                    }
                    _ => continue,
                };
                got_snapshot = true;
                room.handle_command(RoomCommand::Ack { connection: 1, tick }, now);
            }
            got_snapshot
        }

        let mut mirror = EntityTable::new();

        for _ in 0..4 {
            room.step(now);
            receive(&mut room, &mut rx, &mut mirror, now);
        }
        assert!(mirror.contains_key(&leaving));

        // Saturate connection 1's queue, then remove the other player
        while filler.try_send(Arc::from(&[0u8][..])).is_ok() {}
        room.handle_command(RoomCommand::Leave { connection: 2 }, now);
        room.step(now);
        room.step(now);
        assert!(room.metrics.frames_dropped.load(Ordering::Relaxed) >= 1);
        assert!(room.broadcaster.stats().dropped_snapshots >= 1);

        let mut converged = false;
        for _ in 0..6 {
            room.step(now);
            if receive(&mut room, &mut rx, &mut mirror, now) {
                let expected: EntityTable = room
                    .simulation()
                    .entity_states()
                    .into_iter()
                    .map(|s| (s.id, s))
                    .collect();
                assert_eq!(mirror, expected);
                converged = true;
            }
        }
        assert!(converged);
        assert!(!mirror.contains_key(&leaving));
    }

    #[test]
    fn test_leave_marks_room_idle() {
        let mut room = room(4);
        let _rx = join(&mut room, 1);
        let now = Instant::now();
        assert_eq!(room.idle_for(now), Duration::ZERO);
        room.handle_command(RoomCommand::Leave { connection: 1 }, now);
        assert_eq!(room.connection_count(), 0);
        room.step(now);
        assert_eq!(room.simulation().registry().len(), 0);
        assert!(room.idle_for(now + Duration::from_secs(31)) >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_registry_reuses_and_limits_rooms() {
        let registry = RoomRegistry::new(SyncConfig::default(), 2, 8, Arc::new(Metrics::new()));
        let a = registry.get_or_create("a").await.unwrap();
        let again = registry.get_or_create("a").await.unwrap();
        assert_eq!(a.id(), again.id());
        registry.get_or_create("b").await.unwrap();
        assert_eq!(
            registry.get_or_create("c").await.err(),
            Some(RoomError::TooManyRooms(2))
        );
        assert_eq!(registry.room_count().await, 2);
        assert_ne!(registry.next_connection_id(), registry.next_connection_id());
    }
}

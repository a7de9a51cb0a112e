//! Per-connection protocol handler
//!
//! Generic over the byte streams so the same code serves WebTransport
//! bidirectional streams and in-memory pipes in tests. The handler never
//! touches room state: it decodes frames, validates what it can, and
//! forwards [`RoomCommand`]s. A dedicated writer task drains the
//! connection's outbound queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::game::constants::net::OUTBOUND_QUEUE;
use crate::game::state::ConnectionId;
use crate::game::validation::validate_room_id;
use crate::metrics::Metrics;
use crate::net::framing::{encode_frame, read_message, write_frame, FramingError};
use crate::net::protocol::{decode, ClientMessage, PlayerDescriptor, ServerMessage};
use crate::net::room::{unix_millis, Frame, RoomAction, RoomCommand, RoomError, RoomHandle, RoomRegistry};

/// Attempts at delivering `Leave` to a busy room
const LEAVE_ATTEMPTS: usize = 20;

/// Serve one client until it leaves, disconnects or misbehaves.
/// Oversized frames end the connection with an error.
pub async fn serve_connection<R, W>(
    mut reader: R,
    writer: W,
    registry: Arc<RoomRegistry>,
) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let connection = registry.next_connection_id();
    let metrics = registry.metrics().clone();
    metrics.connections_active.fetch_add(1, Ordering::Relaxed);
    debug!(connection, "connection opened");

    let (outbound, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    tokio::spawn(write_loop(writer, outbound_rx, connection, metrics.clone()));

    let mut handler = ConnectionHandler {
        connection,
        registry,
        outbound,
        room: None,
    };

    let result = loop {
        let payload = match read_message(&mut reader).await {
            Ok(payload) => payload,
            Err(FramingError::ConnectionClosed) => break Ok(()),
            Err(e @ FramingError::MessageTooLarge(..)) => {
                warn!(connection, "closing connection: {}", e);
                break Err(e);
            }
            Err(e) => {
                debug!(connection, "stream read error: {}", e);
                break Err(e);
            }
        };
        metrics.record_received(payload.len() + 4);

        let message: ClientMessage = match decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection, "Failed to decode client message: {}", e);
                continue;
            }
        };

        if !handler.dispatch(message).await {
            break Ok(());
        }
    };

    handler.leave_room().await;
    metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
    debug!(connection, "connection closed");
    result
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    connection: ConnectionId,
    metrics: Arc<Metrics>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(connection, "stream write error: {}", e);
            break;
        }
        metrics.record_sent(frame.len());
    }
}

struct ConnectionHandler {
    connection: ConnectionId,
    registry: Arc<RoomRegistry>,
    outbound: mpsc::Sender<Frame>,
    room: Option<RoomHandle>,
}

impl ConnectionHandler {
    /// Handle one message; false ends the connection
    async fn dispatch(&mut self, message: ClientMessage) -> bool {
        let connection = self.connection;
        match message {
            ClientMessage::Join {
                room_id,
                descriptor,
            } => {
                if let Err(e) = self.join(&room_id, descriptor).await {
                    info!(connection, room = %room_id, "join rejected: {}", e);
                    self.reply(&ServerMessage::JoinRejected {
                        reason: e.to_string(),
                    });
                }
            }
            ClientMessage::Input(command) => self.forward(RoomCommand::Input {
                connection,
                command,
                received_at: Instant::now(),
            }),
            ClientMessage::SceneChange { scene } => self.forward(RoomCommand::Action {
                connection,
                action: RoomAction::SceneChange { scene },
            }),
            ClientMessage::ReadyTimerStart { seconds } => self.forward(RoomCommand::Action {
                connection,
                action: RoomAction::ReadyTimerStart { seconds },
            }),
            ClientMessage::ReadyTimerCancel => self.forward(RoomCommand::Action {
                connection,
                action: RoomAction::ReadyTimerCancel,
            }),
            ClientMessage::AbilityRequest(request) => self.forward(RoomCommand::Action {
                connection,
                action: RoomAction::Ability(request),
            }),
            ClientMessage::RequestFull => self.forward(RoomCommand::RequestFull { connection }),
            ClientMessage::Ack { tick } => self.forward(RoomCommand::Ack { connection, tick }),
            ClientMessage::Ping { client_time } => self.reply(&ServerMessage::Pong {
                client_time,
                server_time: unix_millis(),
            }),
            ClientMessage::Leave => {
                debug!(connection, "client requested leave");
                return false;
            }
        }
        true
    }

    async fn join(
        &mut self,
        room_id: &str,
        descriptor: PlayerDescriptor,
    ) -> Result<(), RoomError> {
        let room_id = validate_room_id(room_id)?;
        if self.room.as_ref().is_some_and(|room| room.id() != room_id) {
            self.leave_room().await;
        }

        let command = |outbound| RoomCommand::Join {
            connection: self.connection,
            descriptor: descriptor.clone(),
            outbound,
        };

        let mut handle = self.registry.get_or_create(&room_id).await?;
        if let Err(RoomError::Closed) = handle.send(command(self.outbound.clone())) {
            // Raced with an idle shutdown; the registry starts a fresh room
            handle = self.registry.get_or_create(&room_id).await?;
            handle.send(command(self.outbound.clone()))?;
        }
        self.room = Some(handle);
        Ok(())
    }

    fn forward(&self, command: RoomCommand) {
        let Some(room) = &self.room else {
            debug!(connection = self.connection, "message before join ignored");
            return;
        };
        if let Err(e) = room.send(command) {
            warn!(connection = self.connection, room = room.id(), "command dropped: {}", e);
        }
    }

    fn reply(&self, message: &ServerMessage) {
        match encode_frame(message) {
            Ok(frame) => {
                if self.outbound.try_send(frame).is_err() {
                    warn!(connection = self.connection, "outbound queue full, reply dropped");
                }
            }
            Err(e) => warn!(connection = self.connection, "Failed to encode reply: {}", e),
        }
    }

    /// Deliver `Leave`, retrying while the room's queue is full
    async fn leave_room(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        for _ in 0..LEAVE_ATTEMPTS {
            match room.send(RoomCommand::Leave {
                connection: self.connection,
            }) {
                Err(RoomError::Busy) => tokio::time::sleep(Duration::from_millis(10)).await,
                _ => return,
            }
        }
        warn!(connection = self.connection, room = room.id(), "could not deliver leave");
    }
}

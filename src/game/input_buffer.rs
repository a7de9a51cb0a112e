//! Input path from connections to the tick
//!
//! Two stages:
//! - [`InputBuffer`]: lock-free MPSC handoff (crossbeam-channel) from
//!   connection tasks to the room's tick loop. Connection tasks never
//!   touch simulation state; they only push messages here.
//! - [`InputPipeline`]: per-connection ordering owned by the tick loop.
//!   Validates, throttles, deduplicates and reorders input commands and
//!   hands out at most one per connection per tick.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use hashbrown::HashMap;

use crate::game::constants::input::{BUFFER_SLACK, GAP_SKIP_DEPTH, GAP_WAIT_MS, THROTTLE_TOLERANCE};
use crate::game::state::ConnectionId;
use crate::game::validation::{sanitize_command, validate_sequence, InputViolation};
use crate::net::protocol::{InputAction, InputCommand};

// ============================================================================
// Lock-free handoff
// ============================================================================

/// Lock-free bounded buffer drained once per tick
///
/// Multiple connection handlers submit without blocking; the tick loop
/// drains everything pending at the start of each tick.
pub struct InputBuffer<M> {
    /// Sender side - cloned to each connection handler
    sender: Sender<M>,
    /// Receiver side - used by the tick loop
    receiver: Receiver<M>,
    capacity: usize,
}

impl<M> InputBuffer<M> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Create a sender handle for a connection
    pub fn sender(&self) -> InputSender<M> {
        InputSender {
            sender: self.sender.clone(),
        }
    }

    /// Drain all pending messages for this tick
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Clonable sender handle for connection handlers
pub struct InputSender<M> {
    sender: Sender<M>,
}

impl<M> Clone for InputSender<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M> InputSender<M> {
    /// Submit without blocking; `Full` is backpressure
    #[inline]
    pub fn try_send(&self, message: M) -> Result<(), InputBufferError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => InputBufferError::Full,
            TrySendError::Disconnected(_) => InputBufferError::Disconnected,
        })
    }
}

/// Input buffer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InputBufferError {
    /// Buffer is full (backpressure)
    #[error("input buffer full")]
    Full,
    /// Channel disconnected (tick loop stopped)
    #[error("input buffer disconnected")]
    Disconnected,
}

// ============================================================================
// Ordering pipeline
// ============================================================================

/// What happened to a submitted command
#[derive(Debug, Clone, PartialEq)]
pub enum InputDisposition {
    /// Buffered for a future tick
    Accepted,
    /// Sequence at or below the watermark
    Stale,
    /// Same sequence already buffered
    Duplicate,
    /// Arrived faster than the declared input rate allows
    Throttled,
    Rejected(InputViolation),
}

/// Pipeline counters, cumulative over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub accepted: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub throttled: u64,
    pub rejected: u64,
    /// Expired by the retention window without being processed
    pub pruned: u64,
    /// Evicted because the buffer was full
    pub overflowed: u64,
    /// Consumed past a sequence gap
    pub gap_skips: u64,
}

#[derive(Debug, Clone)]
struct QueuedInput {
    cmd: InputCommand,
    received_at: Instant,
}

#[derive(Debug, Default)]
struct ConnectionInputs {
    buffer: BTreeMap<u64, QueuedInput>,
    /// Highest sequence consumed
    watermark: u64,
    last_accepted_at: Option<Instant>,
    /// Aim of the last consumed command; stands in for non-finite aims
    facing: f32,
}

/// Per-connection input ordering owned by the tick loop
pub struct InputPipeline {
    min_spacing: Duration,
    retention: Duration,
    capacity: usize,
    connections: HashMap<ConnectionId, ConnectionInputs>,
    stats: PipelineStats,
}

impl InputPipeline {
    /// `input_rate` is the declared client sample rate in Hz
    pub fn new(input_rate: u32, retention: Duration) -> Self {
        let rate = input_rate.max(1);
        let capacity = (rate as f64 * retention.as_secs_f64()).ceil() as usize + BUFFER_SLACK;
        Self {
            min_spacing: Duration::from_secs_f32(THROTTLE_TOLERANCE / rate as f32),
            retention,
            capacity,
            connections: HashMap::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Start accepting commands from a connection. Registering again (a
    /// rejoin) drops anything buffered and restarts the sequence at 1.
    pub fn register(&mut self, connection: ConnectionId) {
        self.connections.insert(connection, ConnectionInputs::default());
    }

    /// Stop consumption immediately and drop anything buffered
    pub fn disconnect(&mut self, connection: ConnectionId) {
        self.connections.remove(&connection);
    }

    pub fn is_registered(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    pub fn watermark(&self, connection: ConnectionId) -> Option<u64> {
        self.connections.get(&connection).map(|c| c.watermark)
    }

    pub fn pending(&self, connection: ConnectionId) -> usize {
        self.connections.get(&connection).map_or(0, |c| c.buffer.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Validate and buffer one command
    pub fn accept(
        &mut self,
        connection: ConnectionId,
        mut cmd: InputCommand,
        now: Instant,
    ) -> InputDisposition {
        let Some(conn) = self.connections.get_mut(&connection) else {
            self.stats.rejected += 1;
            return InputDisposition::Rejected(InputViolation::UnknownConnection);
        };

        if let Err(violation) = validate_sequence(conn.watermark, cmd.sequence) {
            self.stats.rejected += 1;
            return InputDisposition::Rejected(violation);
        }
        if cmd.sequence <= conn.watermark {
            self.stats.stale += 1;
            tracing::debug!(connection, sequence = cmd.sequence, "stale input discarded");
            return InputDisposition::Stale;
        }
        if conn.buffer.contains_key(&cmd.sequence) {
            self.stats.duplicate += 1;
            tracing::debug!(connection, sequence = cmd.sequence, "duplicate input discarded");
            return InputDisposition::Duplicate;
        }

        // Dash is latency-critical and never throttled
        let throttled = !cmd.has_action(InputAction::Dash)
            && conn
                .last_accepted_at
                .is_some_and(|t| now.saturating_duration_since(t) < self.min_spacing);
        if throttled {
            self.stats.throttled += 1;
            return InputDisposition::Throttled;
        }

        sanitize_command(&mut cmd, conn.facing);
        conn.buffer.insert(
            cmd.sequence,
            QueuedInput {
                cmd,
                received_at: now,
            },
        );
        conn.last_accepted_at = Some(now);

        while conn.buffer.len() > self.capacity {
            conn.buffer.pop_first();
            self.stats.overflowed += 1;
        }

        self.stats.accepted += 1;
        InputDisposition::Accepted
    }

    /// Next command to apply for `connection` this tick, if any.
    ///
    /// Returns the lowest buffered sequence when it directly follows the
    /// watermark, has waited past the gap timeout, or enough commands are
    /// queued behind it. Otherwise out-of-order arrivals keep waiting.
    pub fn next_for(&mut self, connection: ConnectionId, now: Instant) -> Option<InputCommand> {
        let conn = self.connections.get_mut(&connection)?;

        let before = conn.buffer.len();
        let retention = self.retention;
        conn.buffer
            .retain(|_, q| now.saturating_duration_since(q.received_at) <= retention);
        self.stats.pruned += (before - conn.buffer.len()) as u64;

        let (&seq, queued) = conn.buffer.first_key_value()?;
        let in_order = seq == conn.watermark + 1;
        let waited = now.saturating_duration_since(queued.received_at)
            >= Duration::from_millis(GAP_WAIT_MS);
        let backed_up = conn.buffer.len() >= GAP_SKIP_DEPTH;
        if !(in_order || waited || backed_up) {
            return None;
        }
        if !in_order {
            self.stats.gap_skips += 1;
            tracing::debug!(connection, watermark = conn.watermark, sequence = seq, "input gap skipped");
        }

        let (_, queued) = conn.buffer.pop_first()?;
        conn.watermark = seq;
        conn.facing = queued.cmd.aim;
        Some(queued.cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    const RATE: u32 = 30;

    fn pipeline() -> InputPipeline {
        let mut p = InputPipeline::new(RATE, Duration::from_secs(1));
        p.register(1);
        p
    }

    fn cmd(seq: u64) -> InputCommand {
        InputCommand {
            sequence: seq,
            ..Default::default()
        }
    }

    /// Arrival time for the n-th command at the declared rate
    fn at(t0: Instant, n: u64) -> Instant {
        t0 + Duration::from_millis(n * 1000 / RATE as u64)
    }

    #[test]
    fn test_input_buffer_submit_and_drain() {
        let buffer: InputBuffer<u64> = InputBuffer::new(10);
        let sender = buffer.sender();
        assert!(sender.try_send(1).is_ok());
        assert!(sender.clone().try_send(2).is_ok());
        assert_eq!(buffer.pending_count(), 2);
        assert_eq!(buffer.drain(), vec![1, 2]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_input_buffer_backpressure() {
        let buffer: InputBuffer<u64> = InputBuffer::new(2);
        let sender = buffer.sender();
        sender.try_send(1).unwrap();
        sender.try_send(2).unwrap();
        assert_eq!(sender.try_send(3), Err(InputBufferError::Full));
        buffer.drain();
        assert!(sender.try_send(3).is_ok());
    }

    #[test]
    fn test_input_buffer_disconnected() {
        let buffer: InputBuffer<u64> = InputBuffer::new(2);
        let sender = buffer.sender();
        drop(buffer);
        assert_eq!(sender.try_send(1), Err(InputBufferError::Disconnected));
    }

    #[test]
    fn test_in_order_consumption_one_per_call() {
        let mut p = pipeline();
        let t0 = Instant::now();
        for seq in 1..=3 {
            assert_eq!(p.accept(1, cmd(seq), at(t0, seq)), InputDisposition::Accepted);
        }
        let now = at(t0, 3);
        assert_eq!(p.next_for(1, now).map(|c| c.sequence), Some(1));
        assert_eq!(p.next_for(1, now).map(|c| c.sequence), Some(2));
        assert_eq!(p.next_for(1, now).map(|c| c.sequence), Some(3));
        assert_eq!(p.next_for(1, now), None);
        assert_eq!(p.watermark(1), Some(3));
    }

    #[test]
    fn test_out_of_order_applied_in_sequence() {
        let mut p = pipeline();
        let t0 = Instant::now();
        p.accept(1, cmd(2), at(t0, 1));
        // Sequence 1 is missing and 2 has not waited long: hold
        assert_eq!(p.next_for(1, at(t0, 1)), None);
        p.accept(1, cmd(1), at(t0, 2));
        assert_eq!(p.next_for(1, at(t0, 2)).map(|c| c.sequence), Some(1));
        assert_eq!(p.next_for(1, at(t0, 2)).map(|c| c.sequence), Some(2));
    }

    #[test]
    fn test_gap_skipped_after_wait() {
        let mut p = pipeline();
        let t0 = Instant::now();
        p.accept(1, cmd(2), t0);
        assert_eq!(p.next_for(1, t0 + Duration::from_millis(50)), None);
        let later = t0 + Duration::from_millis(GAP_WAIT_MS);
        assert_eq!(p.next_for(1, later).map(|c| c.sequence), Some(2));
        assert_eq!(p.stats().gap_skips, 1);

        // The skipped sequence is now stale
        assert_eq!(p.accept(1, cmd(1), later + Duration::from_millis(40)), InputDisposition::Stale);
    }

    #[test]
    fn test_gap_skipped_when_backed_up() {
        let mut p = pipeline();
        let t0 = Instant::now();
        for (i, seq) in [3u64, 4, 5].into_iter().enumerate() {
            p.accept(1, cmd(seq), at(t0, i as u64));
        }
        assert_eq!(p.next_for(1, at(t0, 2)).map(|c| c.sequence), Some(3));
    }

    #[test]
    fn test_duplicate_and_stale_have_no_effect() {
        let mut p = pipeline();
        let t0 = Instant::now();
        p.accept(1, cmd(1), at(t0, 0));
        assert_eq!(p.accept(1, cmd(1), at(t0, 1)), InputDisposition::Duplicate);
        p.next_for(1, at(t0, 1));
        assert_eq!(p.accept(1, cmd(1), at(t0, 2)), InputDisposition::Stale);
        assert_eq!(p.pending(1), 0);
        assert_eq!(p.watermark(1), Some(1));
    }

    #[test]
    fn test_throttle_except_dash() {
        let mut p = pipeline();
        let t0 = Instant::now();
        assert_eq!(p.accept(1, cmd(1), t0), InputDisposition::Accepted);
        // 5ms later is well under half the 33ms interval
        let soon = t0 + Duration::from_millis(5);
        assert_eq!(p.accept(1, cmd(2), soon), InputDisposition::Throttled);

        let mut dash = cmd(3);
        dash.actions = smallvec![InputAction::Dash];
        assert_eq!(p.accept(1, dash, soon), InputDisposition::Accepted);
        assert_eq!(p.stats().throttled, 1);
    }

    #[test]
    fn test_retention_prunes_old_entries() {
        let mut p = pipeline();
        let t0 = Instant::now();
        p.accept(1, cmd(5), t0);
        let later = t0 + Duration::from_millis(1500);
        assert_eq!(p.next_for(1, later), None);
        assert_eq!(p.pending(1), 0);
        assert_eq!(p.stats().pruned, 1);
        assert_eq!(p.watermark(1), Some(0));
    }

    #[test]
    fn test_buffer_bounded() {
        let mut p = pipeline();
        let t0 = Instant::now();
        let capacity = p.capacity();
        // A dash burst bypasses the throttle, so everything arrives at once
        for seq in 1..=(capacity as u64 + 5) {
            let mut c = cmd(seq);
            c.actions = smallvec![InputAction::Dash];
            p.accept(1, c, t0);
        }
        assert_eq!(p.pending(1), capacity);
        assert_eq!(p.stats().overflowed, 5);
        // Oldest were evicted first
        assert_eq!(p.next_for(1, t0).map(|c| c.sequence), Some(6));
    }

    #[test]
    fn test_disconnect_stops_consumption() {
        let mut p = pipeline();
        let t0 = Instant::now();
        p.accept(1, cmd(1), t0);
        p.disconnect(1);
        assert_eq!(p.next_for(1, t0), None);
        assert_eq!(
            p.accept(1, cmd(2), t0 + Duration::from_millis(50)),
            InputDisposition::Rejected(InputViolation::UnknownConnection)
        );
    }

    #[test]
    fn test_reregister_restarts_sequence() {
        let mut p = pipeline();
        let t0 = Instant::now();
        for seq in 1..=3 {
            p.accept(1, cmd(seq), at(t0, seq));
            p.next_for(1, at(t0, seq));
        }
        p.accept(1, cmd(4), at(t0, 4));
        assert_eq!(p.watermark(1), Some(3));

        p.register(1);
        assert_eq!(p.watermark(1), Some(0));
        assert_eq!(p.pending(1), 0);
        assert_eq!(p.accept(1, cmd(1), at(t0, 5)), InputDisposition::Accepted);
        assert_eq!(p.next_for(1, at(t0, 5)).map(|c| c.sequence), Some(1));
    }

    #[test]
    fn test_rejected_sequence() {
        let mut p = pipeline();
        let t0 = Instant::now();
        assert_eq!(
            p.accept(1, cmd(0), t0),
            InputDisposition::Rejected(InputViolation::ZeroSequence)
        );
        assert!(matches!(
            p.accept(1, cmd(50_000), t0),
            InputDisposition::Rejected(InputViolation::SequenceJump(0, 50_000))
        ));
    }
}

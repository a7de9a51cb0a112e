//! Gameplay and protocol constants
//!
//! Rates and thresholds that operators tune live in [`crate::config`];
//! these are the fixed rules shared by server and client simulation.

/// Simulation cadence defaults
pub mod sim {
    /// Default server tick rate in Hz
    pub const TICK_RATE: u32 = 30;
    /// Default snapshot broadcast rate in Hz
    pub const BROADCAST_RATE: u32 = 15;
    /// Default client input sample rate in Hz
    pub const INPUT_RATE: u32 = 30;
}

/// Player movement rules
pub mod movement {
    /// Default base speed in px/s
    pub const DEFAULT_SPEED: f32 = 180.0;
    /// Sprint speed multiplier
    pub const SPRINT_MULTIPLIER: f32 = 1.6;
    /// Dash speed multiplier
    pub const DASH_MULTIPLIER: f32 = 3.0;
    /// Dash duration in seconds
    pub const DASH_DURATION: f32 = 0.18;
    /// Dash cooldown in seconds, measured from dash start
    pub const DASH_COOLDOWN: f32 = 1.0;
    /// Ability wind-up during which the player is "in ability"
    pub const ABILITY_DURATION: f32 = 0.4;
    /// Longest single collision sub-step in px
    pub const MAX_SUBSTEP: f32 = 8.0;
    /// Upper bound on sub-steps for one displacement
    pub const MAX_SUBSTEPS: usize = 64;
    /// Depenetration passes per sub-step
    pub const RESOLVE_ITERATIONS: usize = 4;
}

/// Stamina economy
pub mod stamina {
    pub const DEFAULT_MAX: f32 = 100.0;
    /// Sprint drain per second
    pub const SPRINT_DRAIN: f32 = 20.0;
    pub const DASH_COST: f32 = 25.0;
    pub const ABILITY_COST: f32 = 30.0;
    /// Regeneration per second on ticks without a drain
    pub const REGEN: f32 = 15.0;
    /// Lockout after a failed drain, in seconds
    pub const EXHAUSTION_DURATION: f32 = 1.5;
}

/// Breadcrumb trail sampling
pub mod breadcrumbs {
    /// Minimum distance from the last point before sampling a new one
    pub const MIN_DISTANCE: f32 = 24.0;
    pub const MAX_POINTS: usize = 32;
}

/// Deployable structures
pub mod structures {
    /// Seconds between trigger firings
    pub const TRIGGER_COOLDOWN: f32 = 0.5;
    /// Resource consumed per trigger
    pub const TRIGGER_COST: f32 = 1.0;
}

/// Validation bounds for client-supplied fields
pub mod limits {
    pub const MIN_RADIUS: f32 = 4.0;
    pub const MAX_RADIUS: f32 = 64.0;
    pub const DEFAULT_RADIUS: f32 = 16.0;
    pub const MIN_HEALTH: f32 = 1.0;
    pub const MAX_HEALTH: f32 = 10_000.0;
    pub const DEFAULT_HEALTH: f32 = 100.0;
    pub const MAX_SPEED: f32 = 600.0;
    pub const MAX_ACTIONS: usize = 4;
    /// Largest forward jump accepted over the watermark
    pub const MAX_SEQUENCE_JUMP: u64 = 10_000;
    pub const MIN_LIFETIME: f32 = 0.1;
    pub const MAX_LIFETIME: f32 = 600.0;
    pub const MAX_RESOURCE: f32 = 10_000.0;
    pub const MIN_STRUCTURE_RADIUS: f32 = 4.0;
    pub const MAX_STRUCTURE_RADIUS: f32 = 128.0;
    pub const MAX_TRIGGER_RADIUS: f32 = 512.0;
    pub const MAX_DAMAGE: f32 = 1_000.0;
    pub const MAX_TYPE_TAG_LEN: usize = 32;
    pub const MAX_ROOM_ID_LEN: usize = 64;
    pub const MAX_SCENE_LEN: usize = 64;
    pub const MAX_READY_TIMER: f32 = 300.0;
    /// Spatial grid columns (and rows) allowed for one room
    pub const MAX_GRID_COLS: usize = 1024;
    /// Live structures one player may own
    pub const DEFAULT_STRUCTURES_PER_OWNER: usize = 16;
}

/// Input pipeline ordering rules
pub mod input {
    /// Fraction of the declared input interval enforced as minimum spacing
    pub const THROTTLE_TOLERANCE: f32 = 0.5;
    /// How long a sequence gap may hold back later commands
    pub const GAP_WAIT_MS: u64 = 100;
    /// Waiting commands that force a gap skip
    pub const GAP_SKIP_DEPTH: usize = 3;
    /// Slack on top of rate * retention for the per-connection buffer
    pub const BUFFER_SLACK: usize = 8;
}

/// Network constants
pub mod net {
    /// Maximum framed message size (64 KiB)
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
    /// Outbound frames queued per connection before frames are dropped
    pub const OUTBOUND_QUEUE: usize = 256;
    /// Room command channel capacity
    pub const COMMAND_QUEUE: usize = 4096;
    /// Client-reported prediction divergence worth a diagnostic
    pub const DIVERGENCE_REPORT_PX: f32 = 200.0;
    /// Acks older than this many seconds of broadcasts force a resync
    pub const ACK_LAG_SECS: f32 = 4.0;
    /// Unacknowledged snapshot baselines kept per connection before a resync
    pub const MAX_UNACKED_SNAPSHOTS: usize = 64;
    /// An empty room closes after this long
    pub const ROOM_IDLE_SECS: u64 = 30;
    /// Per-room stats log interval
    pub const STATS_LOG_SECS: u64 = 10;
}

/// Client-side bookkeeping
pub mod client {
    /// Unacknowledged commands kept for replay
    pub const MAX_PENDING_INPUTS: usize = 256;
    /// Remaining correction below which blending stops
    pub const CORRECTION_EPSILON: f32 = 0.5;
    pub const ROTATION_IGNORE: f32 = 0.05;
    pub const ROTATION_SNAP: f32 = 1.5;
    /// Authoritative jumps shorter than this are never treated as teleports
    pub const TELEPORT_MIN_PX: f32 = 100.0;
    /// Extra ticks of dash-speed travel allowed between two snapshots
    pub const IDLE_TICK_SLACK: u64 = 2;
    /// Retry interval for events that reference unknown entities
    pub const PENDING_RETRY_MS: u64 = 50;
    /// Total retry window before the event is dropped
    pub const PENDING_WINDOW_MS: u64 = 300;
    pub const MAX_PENDING_EVENTS: usize = 128;
    pub const MAX_FEEDBACK_EVENTS: usize = 256;
}

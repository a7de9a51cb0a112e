//! Wire protocol
//!
//! Every message is a JSON object `{"event": "<name>", "data": {...}}`
//! carried in a length-prefixed frame (see [`crate::net::framing`]).
//! Field names are camelCase, event names kebab-case.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::game::geometry::Obstacle;
use crate::game::state::{Entity, EntityId, EntityKind, EntityKindTag, PlayerState};
use crate::util::vec2::{quantize, Vec2};

// ============================================================================
// Client -> Server
// ============================================================================

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join (or create) a room
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        #[serde(default)]
        descriptor: PlayerDescriptor,
    },
    /// One sampled input command
    Input(InputCommand),
    #[serde(rename_all = "camelCase")]
    SceneChange { scene: String },
    #[serde(rename_all = "camelCase")]
    ReadyTimerStart { seconds: f32 },
    ReadyTimerCancel,
    /// Deploy a structure / ability
    AbilityRequest(AbilityRequest),
    /// Ask for a full snapshot on the next broadcast
    RequestFull,
    /// Acknowledge a received snapshot tick
    #[serde(rename_all = "camelCase")]
    Ack { tick: u64 },
    #[serde(rename_all = "camelCase")]
    Ping { client_time: f64 },
    Leave,
}

/// Latency-critical or one-shot actions carried by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputAction {
    Dash,
    Ability,
}

/// One sampled client input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputCommand {
    /// Strictly increasing per connection, starting at 1
    pub sequence: u64,
    /// Client clock in milliseconds
    #[serde(default)]
    pub timestamp: f64,
    /// Movement axes, length <= 1 after validation
    #[serde(default)]
    pub movement: Vec2,
    /// Aim angle in radians
    #[serde(default)]
    pub aim: f32,
    /// One-shot actions, each consumed exactly once with this command
    #[serde(default)]
    pub actions: SmallVec<[InputAction; 2]>,
    /// Sprint held
    #[serde(default)]
    pub sprint: bool,
    /// Aim-down-sights / posture held
    #[serde(default)]
    pub ads: bool,
    /// Client's predicted position, for divergence diagnostics only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_position: Option<Vec2>,
}

impl InputCommand {
    #[inline]
    pub fn has_action(&self, action: InputAction) -> bool {
        self.actions.contains(&action)
    }
}

/// Initial player descriptor sent with `join`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDescriptor {
    /// Spawn position; the server picks one near the origin when absent
    #[serde(default)]
    pub position: Option<Vec2>,
    #[serde(default)]
    pub radius: Option<f32>,
    #[serde(default)]
    pub health: Option<f32>,
    #[serde(default)]
    pub speed: Option<f32>,
}

/// Client request to deploy a structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityRequest {
    pub type_tag: String,
    pub position: Vec2,
    /// Seconds; `None` lives until depleted or removed
    #[serde(default)]
    pub lifetime: Option<f32>,
    /// Depletable ammo / charge; `None` never depletes
    #[serde(default)]
    pub resource: Option<f32>,
    #[serde(default)]
    pub radius: Option<f32>,
    #[serde(default)]
    pub trigger_radius: f32,
    #[serde(default)]
    pub damage: f32,
    /// Remove this structure when its owner leaves
    #[serde(default)]
    pub owner_scoped: bool,
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    JoinAccepted {
        entity_id: EntityId,
        room_id: String,
        tick_rate: u32,
        broadcast_rate: u32,
        input_rate: u32,
        /// Static world obstacles the client predicts against
        #[serde(default)]
        geometry: Vec<Obstacle>,
    },
    #[serde(rename_all = "camelCase")]
    JoinRejected { reason: String },
    FullState(FullState),
    DeltaState(DeltaState),
    #[serde(rename_all = "camelCase")]
    EntityJoined { id: EntityId, descriptor: EntityState },
    #[serde(rename_all = "camelCase")]
    EntityLeft { id: EntityId },
    #[serde(rename_all = "camelCase")]
    EntityHealthUpdate {
        id: EntityId,
        health: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        damage: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AbilityCreated {
        ability_id: EntityId,
        owner_id: Option<EntityId>,
        type_tag: String,
        args: AbilityArgs,
    },
    #[serde(rename_all = "camelCase")]
    AbilityExpired {
        ability_id: EntityId,
        owner_id: Option<EntityId>,
        type_tag: String,
        reason: ExpiryReason,
    },
    #[serde(rename_all = "camelCase")]
    AbilityTriggered {
        ability_id: EntityId,
        owner_id: Option<EntityId>,
        type_tag: String,
        target_id: EntityId,
    },
    #[serde(rename_all = "camelCase")]
    SceneChanged { scene: String, requested_by: EntityId },
    #[serde(rename_all = "camelCase")]
    ReadyTimerStarted { seconds: f32, requested_by: EntityId },
    #[serde(rename_all = "camelCase")]
    ReadyTimerCancelled { requested_by: EntityId },
    ReadyTimerElapsed,
    #[serde(rename_all = "camelCase")]
    Pong { client_time: f64, server_time: u64 },
}

/// Why a structure went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpiryReason {
    Lifetime,
    Depleted,
    Destroyed,
    OwnerLeft,
}

/// Validated construction arguments echoed in `ability-created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityArgs {
    pub position: Vec2,
    pub radius: f32,
    pub lifetime: Option<f32>,
    pub resource: Option<f32>,
    pub trigger_radius: f32,
    pub damage: f32,
    pub owner_scoped: bool,
}

/// Complete snapshot of a connection's interest set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullState {
    pub tick: u64,
    pub timestamp: u64,
    pub last_processed_input_seq: u64,
    pub entities: Vec<EntityState>,
}

/// Changes since the previous snapshot sent to this connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaState {
    pub tick: u64,
    pub timestamp: u64,
    pub last_processed_input_seq: u64,
    pub entities: Vec<EntityDelta>,
    #[serde(default)]
    pub removed: Vec<EntityId>,
    /// Every entity is listed with every field; receivers drop the rest
    #[serde(default)]
    pub is_full: bool,
}

/// Player status bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerFlags {
    pub sprint_held: bool,
    pub sprinting: bool,
    pub dashing: bool,
    pub ability_active: bool,
    pub exhausted: bool,
    pub ads: bool,
}

/// Wire view of one entity. Values are quantized to 0.01 so a baseline
/// built from sent values compares exactly with later states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub id: EntityId,
    pub kind: EntityKindTag,
    pub position: Vec2,
    pub rotation: f32,
    pub radius: f32,
    pub alive: bool,
    pub health: f32,
    pub health_max: f32,

    // Player-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamina: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamina_max: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<PlayerFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dash_direction: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dash_remaining: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dash_cooldown: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ability_remaining: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exhaustion_timer: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knockback: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knockback_remaining: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail: Option<Vec<Vec2>>,

    // Structure-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_tick: Option<u64>,
}

impl EntityState {
    /// Header-only state; kind-specific fields unset
    pub fn bare(id: EntityId, kind: EntityKindTag, position: Vec2, radius: f32) -> Self {
        Self {
            id,
            kind,
            position,
            rotation: 0.0,
            radius,
            alive: true,
            health: 0.0,
            health_max: 0.0,
            stamina: None,
            stamina_max: None,
            speed: None,
            intent: None,
            flags: None,
            dash_direction: None,
            dash_remaining: None,
            dash_cooldown: None,
            ability_remaining: None,
            exhaustion_timer: None,
            knockback: None,
            knockback_remaining: None,
            trail: None,
            owner_id: None,
            type_tag: None,
            resource: None,
            expires_at_tick: None,
        }
    }

    /// Build the quantized wire view of a canonical entity
    pub fn from_entity(entity: &Entity) -> Self {
        let (health, health_max) = entity.health();
        let mut state = Self::bare(
            entity.id,
            entity.kind_tag(),
            entity.position.quantized(),
            quantize(entity.radius),
        );
        state.rotation = quantize(entity.rotation());
        state.alive = entity.alive;
        state.health = quantize(health);
        state.health_max = quantize(health_max);

        match &entity.kind {
            EntityKind::Player(p) => {
                state.stamina = Some(quantize(p.stamina));
                state.stamina_max = Some(quantize(p.stamina_max));
                state.speed = Some(quantize(p.speed));
                state.intent = Some(p.intent.quantized());
                state.flags = Some(PlayerFlags {
                    sprint_held: p.sprint_held,
                    sprinting: p.sprinting,
                    dashing: p.dashing,
                    ability_active: p.ability_active,
                    exhausted: p.exhausted,
                    ads: p.ads,
                });
                state.dash_direction = Some(p.dash_direction.quantized());
                state.dash_remaining = Some(quantize(p.dash_remaining));
                state.dash_cooldown = Some(quantize(p.dash_cooldown));
                state.ability_remaining = Some(quantize(p.ability_remaining));
                state.exhaustion_timer = Some(quantize(p.exhaustion_timer));
                state.knockback = Some(p.knockback.quantized());
                state.knockback_remaining = Some(quantize(p.knockback_remaining));
                state.trail = Some(p.trail.iter().map(Vec2::quantized).collect());
            }
            EntityKind::Hostile(u) | EntityKind::Allied(u) => {
                state.intent = Some(u.velocity.quantized());
            }
            EntityKind::Structure(s) => {
                state.owner_id = s.owner;
                state.type_tag = Some(s.type_tag.clone());
                state.resource = s.resource.map(quantize);
                state.expires_at_tick = s.expires_at_tick;
            }
        }
        state
    }

    /// Rebuild the movement-relevant player state from a snapshot.
    /// Returns `None` for non-player entities.
    pub fn to_player_state(&self) -> Option<PlayerState> {
        if self.kind != EntityKindTag::Player {
            return None;
        }
        let mut p = PlayerState::new(0, self.health_max, self.speed.unwrap_or_default());
        p.health = self.health;
        p.facing = self.rotation;
        p.stamina = self.stamina.unwrap_or_default();
        p.stamina_max = self.stamina_max.unwrap_or(p.stamina_max);
        p.intent = self.intent.unwrap_or_default();
        let flags = self.flags.unwrap_or_default();
        p.sprint_held = flags.sprint_held;
        p.sprinting = flags.sprinting;
        p.dashing = flags.dashing;
        p.ability_active = flags.ability_active;
        p.exhausted = flags.exhausted;
        p.ads = flags.ads;
        p.dash_direction = self.dash_direction.unwrap_or_default();
        p.dash_remaining = self.dash_remaining.unwrap_or_default();
        p.dash_cooldown = self.dash_cooldown.unwrap_or_default();
        p.ability_remaining = self.ability_remaining.unwrap_or_default();
        p.exhaustion_timer = self.exhaustion_timer.unwrap_or_default();
        p.knockback = self.knockback.unwrap_or_default();
        p.knockback_remaining = self.knockback_remaining.unwrap_or_default();
        p.trail = self.trail.clone().unwrap_or_default();
        Some(p)
    }
}

/// Kind-specific `EntityState` field, named in a delta when it was unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OptionalField {
    Stamina,
    StaminaMax,
    Speed,
    Intent,
    Flags,
    DashDirection,
    DashRemaining,
    DashCooldown,
    AbilityRemaining,
    ExhaustionTimer,
    Knockback,
    KnockbackRemaining,
    Trail,
    OwnerId,
    TypeTag,
    Resource,
    ExpiresAtTick,
}

/// Changed fields of one entity; `None` means unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDelta {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntityKindTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_max: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamina: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamina_max: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<PlayerFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dash_direction: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dash_remaining: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dash_cooldown: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ability_remaining: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exhaustion_timer: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knockback: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knockback_remaining: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail: Option<Vec<Vec2>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_tick: Option<u64>,
    /// Fields that went from set to unset
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleared: Vec<OptionalField>,
}

// ============================================================================
// Codec
// ============================================================================

/// Errors from encoding or decoding wire messages
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Encode a message as JSON bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a message from JSON bytes
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
}

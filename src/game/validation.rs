//! Client field validation
//!
//! The server never trusts gameplay values from a client. Most fields are
//! repaired in place (clamped, wrapped, zeroed); only inputs that cannot be
//! repaired produce an [`InputViolation`].

use crate::game::constants::limits;
use crate::net::protocol::{AbilityArgs, AbilityRequest, InputCommand, PlayerDescriptor};
use crate::util::vec2::{wrap_angle, Vec2};

/// Client input that cannot be repaired
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputViolation {
    #[error("Connection is not registered with the input pipeline")]
    UnknownConnection,
    #[error("Sequence numbers start at 1")]
    ZeroSequence,
    #[error("Sequence jumped too far: watermark={0}, sequence={1}")]
    SequenceJump(u64, u64),
    #[error("Room id is empty")]
    EmptyRoomId,
    #[error("Scene name is empty")]
    EmptyScene,
    #[error("Ready timer out of range: {0}")]
    InvalidTimer(f32),
    #[error("Structure type tag is empty")]
    EmptyTypeTag,
    #[error("Non-finite structure position")]
    InvalidPosition,
    #[error("Ability still active")]
    AbilityBusy,
    #[error("Structure limit reached ({0} per player)")]
    StructureLimit(usize),
    #[error("Not enough stamina")]
    Exhausted,
}

/// Repair every field of a command in place.
/// `previous_facing` replaces a non-finite aim.
pub fn sanitize_command(cmd: &mut InputCommand, previous_facing: f32) {
    cmd.movement = cmd.movement.finite_or_zero().clamp_length(1.0);

    cmd.aim = if cmd.aim.is_finite() {
        wrap_angle(cmd.aim)
    } else {
        wrap_angle(previous_facing)
    };

    if !cmd.timestamp.is_finite() || cmd.timestamp < 0.0 {
        cmd.timestamp = 0.0;
    }

    if cmd.predicted_position.is_some_and(|p| !p.is_finite()) {
        cmd.predicted_position = None;
    }

    if cmd.actions.len() > 1 {
        let mut seen = smallvec::SmallVec::<[_; 4]>::new();
        cmd.actions.retain(|a| {
            if seen.contains(a) {
                false
            } else {
                seen.push(*a);
                true
            }
        });
    }
    cmd.actions.truncate(limits::MAX_ACTIONS);
}

/// Reject sequences that cannot be ordered against `watermark`
pub fn validate_sequence(watermark: u64, sequence: u64) -> Result<(), InputViolation> {
    if sequence == 0 {
        return Err(InputViolation::ZeroSequence);
    }
    if sequence > watermark.saturating_add(limits::MAX_SEQUENCE_JUMP) {
        return Err(InputViolation::SequenceJump(watermark, sequence));
    }
    Ok(())
}

/// Join descriptor after clamping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnParams {
    /// `None` lets the server choose
    pub position: Option<Vec2>,
    pub radius: f32,
    pub health: f32,
    pub speed: f32,
}

pub fn sanitize_descriptor(descriptor: &PlayerDescriptor, extent: f32) -> SpawnParams {
    let radius = clamp_or(descriptor.radius, limits::MIN_RADIUS, limits::MAX_RADIUS, limits::DEFAULT_RADIUS);
    let position = descriptor
        .position
        .map(|p| p.finite_or_zero().clamp_to_extent((extent - radius).max(0.0)));
    SpawnParams {
        position,
        radius,
        health: clamp_or(descriptor.health, limits::MIN_HEALTH, limits::MAX_HEALTH, limits::DEFAULT_HEALTH),
        speed: clamp_or(
            descriptor.speed,
            0.0,
            limits::MAX_SPEED,
            crate::game::constants::movement::DEFAULT_SPEED,
        ),
    }
}

/// Validate a structure request into its type tag and clamped arguments
pub fn sanitize_ability(
    request: &AbilityRequest,
    extent: f32,
) -> Result<(String, AbilityArgs), InputViolation> {
    let type_tag = truncate(request.type_tag.trim(), limits::MAX_TYPE_TAG_LEN);
    if type_tag.is_empty() {
        return Err(InputViolation::EmptyTypeTag);
    }
    if !request.position.is_finite() {
        return Err(InputViolation::InvalidPosition);
    }

    let radius = clamp_or(
        request.radius,
        limits::MIN_STRUCTURE_RADIUS,
        limits::MAX_STRUCTURE_RADIUS,
        limits::MIN_STRUCTURE_RADIUS,
    );
    // NaN lifetime or resource is treated as absent
    let lifetime = request
        .lifetime
        .filter(|l| l.is_finite())
        .map(|l| l.clamp(limits::MIN_LIFETIME, limits::MAX_LIFETIME));
    let resource = request
        .resource
        .filter(|r| r.is_finite())
        .map(|r| r.clamp(0.0, limits::MAX_RESOURCE));

    Ok((
        type_tag,
        AbilityArgs {
            position: request.position.clamp_to_extent((extent - radius).max(0.0)),
            radius,
            lifetime,
            resource,
            trigger_radius: clamp_finite(request.trigger_radius, 0.0, limits::MAX_TRIGGER_RADIUS),
            damage: clamp_finite(request.damage, 0.0, limits::MAX_DAMAGE),
            owner_scoped: request.owner_scoped,
        },
    ))
}

pub fn validate_room_id(room_id: &str) -> Result<String, InputViolation> {
    let id = truncate(room_id.trim(), limits::MAX_ROOM_ID_LEN);
    if id.is_empty() {
        return Err(InputViolation::EmptyRoomId);
    }
    Ok(id)
}

pub fn validate_scene(scene: &str) -> Result<String, InputViolation> {
    let scene = truncate(scene.trim(), limits::MAX_SCENE_LEN);
    if scene.is_empty() {
        return Err(InputViolation::EmptyScene);
    }
    Ok(scene)
}

pub fn validate_ready_timer(seconds: f32) -> Result<f32, InputViolation> {
    if !seconds.is_finite() || seconds <= 0.0 || seconds > limits::MAX_READY_TIMER {
        return Err(InputViolation::InvalidTimer(seconds));
    }
    Ok(seconds)
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn clamp_or(value: Option<f32>, min: f32, max: f32, default: f32) -> f32 {
    match value {
        Some(v) if v.is_finite() => v.clamp(min, max),
        _ => default,
    }
}

fn clamp_finite(value: f32, min: f32, max: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::InputAction;
    use smallvec::smallvec;
    use std::f32::consts::PI;

    #[test]
    fn test_sanitize_command_repairs_fields() {
        let mut cmd = InputCommand {
            sequence: 1,
            timestamp: f64::NAN,
            movement: Vec2::new(3.0, 4.0),
            aim: 3.0 * PI,
            actions: smallvec![InputAction::Dash, InputAction::Dash, InputAction::Ability],
            sprint: true,
            ads: false,
            predicted_position: Some(Vec2::new(f32::INFINITY, 0.0)),
        };
        sanitize_command(&mut cmd, 0.0);
        assert!((cmd.movement.length() - 1.0).abs() < 1e-5);
        assert!((cmd.aim - PI).abs() < 1e-4);
        assert_eq!(cmd.timestamp, 0.0);
        assert!(cmd.predicted_position.is_none());
        assert_eq!(cmd.actions.as_slice(), &[InputAction::Dash, InputAction::Ability]);
    }

    #[test]
    fn test_nan_movement_and_aim() {
        let mut cmd = InputCommand {
            sequence: 1,
            movement: Vec2::new(f32::NAN, 1.0),
            aim: f32::NAN,
            ..Default::default()
        };
        sanitize_command(&mut cmd, 1.25);
        assert_eq!(cmd.movement, Vec2::new(0.0, 1.0));
        assert_eq!(cmd.aim, 1.25);
    }

    #[test]
    fn test_validate_sequence() {
        assert_eq!(validate_sequence(0, 0), Err(InputViolation::ZeroSequence));
        assert!(validate_sequence(0, 1).is_ok());
        assert!(validate_sequence(5, 10_005).is_ok());
        assert_eq!(
            validate_sequence(5, 10_006),
            Err(InputViolation::SequenceJump(5, 10_006))
        );
    }

    #[test]
    fn test_descriptor_clamping() {
        let params = sanitize_descriptor(
            &PlayerDescriptor {
                position: Some(Vec2::new(1e9, f32::NAN)),
                radius: Some(500.0),
                health: Some(-5.0),
                speed: None,
            },
            1000.0,
        );
        assert_eq!(params.radius, limits::MAX_RADIUS);
        assert_eq!(params.health, limits::MIN_HEALTH);
        assert_eq!(params.speed, crate::game::constants::movement::DEFAULT_SPEED);
        assert_eq!(params.position, Some(Vec2::new(1000.0 - limits::MAX_RADIUS, 0.0)));

        let defaults = sanitize_descriptor(&PlayerDescriptor::default(), 1000.0);
        assert_eq!(defaults.position, None);
        assert_eq!(defaults.radius, limits::DEFAULT_RADIUS);
    }

    #[test]
    fn test_ability_request_clamping() {
        let request = AbilityRequest {
            type_tag: "  a-very-long-structure-type-tag-that-goes-on  ".into(),
            position: Vec2::new(10.0, 10.0),
            lifetime: Some(10_000.0),
            resource: Some(f32::NAN),
            radius: Some(1.0),
            trigger_radius: 9999.0,
            damage: -3.0,
            owner_scoped: true,
        };
        let (tag, args) = sanitize_ability(&request, 1000.0).unwrap();
        assert_eq!(tag.chars().count(), limits::MAX_TYPE_TAG_LEN);
        assert_eq!(args.lifetime, Some(limits::MAX_LIFETIME));
        assert_eq!(args.resource, None);
        assert_eq!(args.radius, limits::MIN_STRUCTURE_RADIUS);
        assert_eq!(args.trigger_radius, limits::MAX_TRIGGER_RADIUS);
        assert_eq!(args.damage, 0.0);

        let blank = AbilityRequest {
            type_tag: "   ".into(),
            ..request
        };
        assert_eq!(sanitize_ability(&blank, 1000.0), Err(InputViolation::EmptyTypeTag));
    }

    #[test]
    fn test_room_scene_timer() {
        assert_eq!(validate_room_id("  lobby-1 ").unwrap(), "lobby-1");
        assert_eq!(validate_room_id("   "), Err(InputViolation::EmptyRoomId));
        assert_eq!(validate_room_id(&"x".repeat(100)).unwrap().len(), limits::MAX_ROOM_ID_LEN);
        assert!(validate_scene("").is_err());
        assert!(validate_ready_timer(10.0).is_ok());
        assert!(validate_ready_timer(f32::NAN).is_err());
        assert!(validate_ready_timer(0.0).is_err());
    }
}

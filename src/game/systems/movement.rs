//! Player movement step
//!
//! One call advances one player by one tick. The server runs it inside
//! the simulation tick and the client predictor runs the very same code
//! against its local copy, which is what keeps prediction and authority
//! within the reconciliation tolerance.
//!
//! Order per step:
//! 1. decay timers
//! 2. adopt the command's hold state (intent, facing, sprint, ads)
//! 3. clear exhaustion if allowed
//! 4. one-shot actions (dash, ability)
//! 5. sprint drain, regeneration otherwise
//! 6. integrate displacement through the collision resolver

use crate::game::constants::movement::{
    ABILITY_DURATION, DASH_COOLDOWN, DASH_DURATION, DASH_MULTIPLIER, SPRINT_MULTIPLIER,
};
use crate::game::constants::stamina::{ABILITY_COST, DASH_COST, SPRINT_DRAIN};
use crate::game::state::PlayerState;
use crate::game::systems::collision::{move_circle, ObstacleView};
use crate::game::systems::stamina::{self, DrainResult};
use crate::net::protocol::{InputAction, InputCommand};
use crate::util::vec2::Vec2;

/// Result of one movement step
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepOutcome {
    /// Resolved position after collision
    pub position: Vec2,
    /// A dash started this step
    pub dash_started: bool,
    /// An ability started this step
    pub ability_started: bool,
    /// A drain failed this step and exhaustion engaged
    pub exhausted: bool,
}

/// Count down every player timer by `dt`, clearing flags that expire
pub fn decay_timers(player: &mut PlayerState, dt: f32) {
    player.exhaustion_timer = (player.exhaustion_timer - dt).max(0.0);
    player.dash_cooldown = (player.dash_cooldown - dt).max(0.0);
    player.dash_remaining = (player.dash_remaining - dt).max(0.0);
    player.ability_remaining = (player.ability_remaining - dt).max(0.0);
    player.knockback_remaining = (player.knockback_remaining - dt).max(0.0);

    if player.dash_remaining <= 0.0 {
        player.dashing = false;
    }
    if player.ability_remaining <= 0.0 {
        player.ability_active = false;
    }
    if player.knockback_remaining <= 0.0 {
        player.knockback = Vec2::ZERO;
    }
}

/// Start a knockback; cancels any dash in progress
pub fn apply_knockback(player: &mut PlayerState, velocity: Vec2, duration: f32) {
    if !velocity.is_finite() || !duration.is_finite() || duration <= 0.0 {
        return;
    }
    player.knockback = velocity;
    player.knockback_remaining = duration;
    player.dashing = false;
    player.dash_remaining = 0.0;
    player.sprinting = false;
}

/// Advance one player by one tick.
///
/// `cmd` is the command consumed this tick, if any. Idle ticks only
/// decay timers, regenerate and carry knockback.
pub fn step_player(
    position: Vec2,
    radius: f32,
    player: &mut PlayerState,
    cmd: Option<&InputCommand>,
    dt: f32,
    view: &ObstacleView<'_>,
) -> StepOutcome {
    let mut outcome = StepOutcome {
        position,
        ..Default::default()
    };

    decay_timers(player, dt);

    let Some(cmd) = cmd else {
        stamina::update_exhaustion(player);
        player.sprinting = false;
        stamina::regenerate(player, dt);
        if player.knockback_active() {
            outcome.position = move_circle(view, position, radius, player.knockback * dt);
        }
        return outcome;
    };

    player.intent = cmd.movement.clamp_length(1.0);
    player.facing = cmd.aim;
    player.ads = cmd.ads;
    player.sprint_held = cmd.sprint;
    stamina::update_exhaustion(player);

    let mut drained = false;

    if cmd.has_action(InputAction::Dash) && can_dash(player) {
        match stamina::try_drain(player, DASH_COST) {
            DrainResult::Paid => {
                player.dash_direction = if player.intent.length_sq() > 0.0 {
                    player.intent.normalize()
                } else {
                    Vec2::from_angle(player.facing)
                };
                player.dashing = true;
                player.dash_remaining = DASH_DURATION;
                player.dash_cooldown = DASH_COOLDOWN;
                outcome.dash_started = true;
                drained = true;
            }
            DrainResult::Exhausted => {
                outcome.exhausted = true;
                drained = true;
            }
            DrainResult::Locked => {}
        }
    }

    if cmd.has_action(InputAction::Ability) && !player.ability_active {
        match stamina::try_drain(player, ABILITY_COST) {
            DrainResult::Paid => {
                player.ability_active = true;
                player.ability_remaining = ABILITY_DURATION;
                outcome.ability_started = true;
                drained = true;
            }
            DrainResult::Exhausted => {
                outcome.exhausted = true;
                drained = true;
            }
            DrainResult::Locked => {}
        }
    }

    player.sprinting = false;
    let wants_sprint = player.sprint_held
        && player.intent.length_sq() > 0.0
        && !player.dashing
        && !player.knockback_active();
    if wants_sprint {
        match stamina::try_drain(player, SPRINT_DRAIN * dt) {
            DrainResult::Paid => {
                player.sprinting = true;
                drained = true;
            }
            DrainResult::Exhausted => {
                outcome.exhausted = true;
                drained = true;
            }
            DrainResult::Locked => {}
        }
    }

    if !drained {
        stamina::regenerate(player, dt);
    }

    outcome.position = move_circle(view, position, radius, velocity(player) * dt);
    outcome
}

fn can_dash(player: &PlayerState) -> bool {
    player.dash_cooldown <= 0.0 && !player.dashing && !player.knockback_active()
}

/// Velocity for the current movement mode: knockback, dash, sprint, walk
pub fn velocity(player: &PlayerState) -> Vec2 {
    if player.knockback_active() {
        player.knockback
    } else if player.dashing {
        player.dash_direction * player.speed * DASH_MULTIPLIER
    } else if player.sprinting {
        player.intent * player.speed * SPRINT_MULTIPLIER
    } else {
        player.intent * player.speed
    }
}

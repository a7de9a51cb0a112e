//! Stamina economy shared by the server tick and client prediction
//!
//! Rules:
//! - stamina always stays in `[0, stamina_max]`
//! - a drain that would go below zero is refused, zeroes stamina and
//!   engages exhaustion; a drain landing exactly on zero is allowed
//! - exhaustion blocks every costly action until its timer has run out
//!   *and* sprint is released
//! - `unlimited_stamina` skips drains but leaves cooldowns alone

use crate::game::constants::stamina::{EXHAUSTION_DURATION, REGEN};
use crate::game::state::PlayerState;

/// Outcome of a drain attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    /// Cost paid (or waived by `unlimited_stamina`)
    Paid,
    /// Player is already exhausted; nothing attempted
    Locked,
    /// Not enough stamina; exhaustion engaged by this attempt
    Exhausted,
}

impl DrainResult {
    #[inline]
    pub fn paid(self) -> bool {
        matches!(self, DrainResult::Paid)
    }
}

/// Attempt to spend `cost` stamina
pub fn try_drain(player: &mut PlayerState, cost: f32) -> DrainResult {
    if player.exhausted {
        return DrainResult::Locked;
    }
    if player.unlimited_stamina {
        return DrainResult::Paid;
    }
    let cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };
    let remaining = player.stamina - cost;
    if remaining < 0.0 {
        player.stamina = 0.0;
        player.exhausted = true;
        player.exhaustion_timer = EXHAUSTION_DURATION;
        return DrainResult::Exhausted;
    }
    player.stamina = remaining.min(player.stamina_max);
    DrainResult::Paid
}

/// Regenerate for one step without drains
pub fn regenerate(player: &mut PlayerState, dt: f32) {
    player.stamina = (player.stamina + REGEN * dt).clamp(0.0, player.stamina_max);
}

/// Clear exhaustion once the timer has elapsed and sprint is released
pub fn update_exhaustion(player: &mut PlayerState) {
    if player.exhausted && player.exhaustion_timer <= 0.0 && !player.sprint_held {
        player.exhausted = false;
    }
}

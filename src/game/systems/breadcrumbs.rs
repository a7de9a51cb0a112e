//! Breadcrumb trail recording
//!
//! Players leave a sparse path behind them that followers and content
//! layers can walk. Points are sampled by distance and simplified on
//! arrival: when the newest point can see the point two back, the one in
//! between carries no information and is dropped.

use crate::game::constants::breadcrumbs::{MAX_POINTS, MIN_DISTANCE};
use crate::game::systems::collision::{line_of_sight, ObstacleView};
use crate::util::vec2::Vec2;

/// Record `position` onto `trail` if it is far enough from the last point.
/// Returns true when a point was appended.
pub fn record(trail: &mut Vec<Vec2>, position: Vec2, view: &ObstacleView<'_>) -> bool {
    if !position.is_finite() {
        return false;
    }
    if let Some(last) = trail.last() {
        if last.distance_sq_to(position) < MIN_DISTANCE * MIN_DISTANCE {
            return false;
        }
    }

    let len = trail.len();
    if len >= 2 && line_of_sight(view, trail[len - 2], position) {
        trail.pop();
    }
    trail.push(position);

    if trail.len() > MAX_POINTS {
        let excess = trail.len() - MAX_POINTS;
        trail.drain(..excess);
    }
    true
}

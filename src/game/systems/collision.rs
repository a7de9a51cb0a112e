//! Circle-vs-world movement resolution
//!
//! Long displacements are split into short sub-steps so fast movers
//! (dash, sprint at a low tick rate) cannot tunnel through thin or
//! rotated walls. Each sub-step is depenetrated against every obstacle,
//! which keeps the tangential part of the motion and produces sliding.

use crate::game::constants::movement::{MAX_SUBSTEP, MAX_SUBSTEPS, RESOLVE_ITERATIONS};
use crate::game::geometry::Obstacle;
use crate::util::vec2::Vec2;

/// Obstacles visible to one tick: fixed world geometry plus dynamic
/// blockers (structures) captured before any entity moves.
#[derive(Debug, Clone, Copy)]
pub struct ObstacleView<'a> {
    pub fixed: &'a [Obstacle],
    pub dynamic: &'a [Obstacle],
    /// Half-size of the playable square
    pub extent: f32,
}

impl<'a> ObstacleView<'a> {
    pub fn new(fixed: &'a [Obstacle], dynamic: &'a [Obstacle], extent: f32) -> Self {
        Self {
            fixed,
            dynamic,
            extent,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Obstacle> {
        self.fixed.iter().chain(self.dynamic.iter())
    }
}

/// Move a circle by `displacement`, sliding along anything in the way
pub fn move_circle(view: &ObstacleView<'_>, start: Vec2, radius: f32, displacement: Vec2) -> Vec2 {
    if !displacement.is_finite() || !start.is_finite() {
        return clamp_to_world(view, start.finite_or_zero(), radius);
    }

    // A step never exceeds half the radius so thin walls always register
    let max_step = MAX_SUBSTEP.min((radius * 0.5).max(1.0));
    let distance = displacement.length();
    let steps = ((distance / max_step).ceil() as usize).clamp(1, MAX_SUBSTEPS);
    let step = displacement / steps as f32;

    let mut position = start;
    for _ in 0..steps {
        position = resolve_overlap(view, position + step, radius);
    }
    position
}

/// Push a circle out of every overlapping obstacle, then clamp to the world
pub fn resolve_overlap(view: &ObstacleView<'_>, mut position: Vec2, radius: f32) -> Vec2 {
    for _ in 0..RESOLVE_ITERATIONS {
        let mut moved = false;
        for obstacle in view.iter() {
            if let Some(push) = obstacle.push_out(position, radius) {
                position += push;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
    clamp_to_world(view, position, radius)
}

fn clamp_to_world(view: &ObstacleView<'_>, position: Vec2, radius: f32) -> Vec2 {
    let limit = (view.extent - radius).max(0.0);
    position.clamp_to_extent(limit)
}

/// True if nothing blocks the straight line `a -> b`
pub fn line_of_sight(view: &ObstacleView<'_>, a: Vec2, b: Vec2) -> bool {
    !view.iter().any(|o| o.intersects_segment(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall_at(x: f32, thickness: f32) -> Obstacle {
        Obstacle::Rect {
            min: Vec2::new(x, -500.0),
            max: Vec2::new(x + thickness, 500.0),
        }
    }

    #[test]
    fn test_free_movement() {
        let view = ObstacleView::new(&[], &[], 1000.0);
        let end = move_circle(&view, Vec2::new(100.0, 100.0), 10.0, Vec2::new(6.0, 0.0));
        assert!(end.approx_eq(Vec2::new(106.0, 100.0), 1e-4));
    }

    #[test]
    fn test_blocked_by_wall() {
        let walls = [wall_at(112.0, 20.0)];
        let view = ObstacleView::new(&walls, &[], 1000.0);
        let end = move_circle(&view, Vec2::new(100.0, 100.0), 10.0, Vec2::new(6.0, 0.0));
        // Circle edge stops at the wall face
        assert!(end.approx_eq(Vec2::new(102.0, 100.0), 1e-3));
    }

    #[test]
    fn test_slides_along_wall() {
        let walls = [wall_at(112.0, 20.0)];
        let view = ObstacleView::new(&walls, &[], 1000.0);
        let end = move_circle(&view, Vec2::new(102.0, 100.0), 10.0, Vec2::new(10.0, 10.0));
        assert!((end.x - 102.0).abs() < 1e-3);
        assert!((end.y - 110.0).abs() < 1e-3);
    }

    #[test]
    fn test_no_tunneling_through_thin_wall() {
        let walls = [wall_at(50.0, 1.0)];
        let view = ObstacleView::new(&walls, &[], 1000.0);
        // 200px in one tick would skip a 1px wall without sub-stepping
        let end = move_circle(&view, Vec2::new(0.0, 0.0), 5.0, Vec2::new(200.0, 0.0));
        assert!(end.x < 50.0);
    }

    #[test]
    fn test_clamped_to_world_extent() {
        let view = ObstacleView::new(&[], &[], 100.0);
        let end = move_circle(&view, Vec2::new(80.0, 0.0), 10.0, Vec2::new(50.0, 0.0));
        assert!(end.approx_eq(Vec2::new(90.0, 0.0), 1e-4));
    }

    #[test]
    fn test_non_finite_displacement_is_ignored() {
        let view = ObstacleView::new(&[], &[], 100.0);
        let end = move_circle(&view, Vec2::new(5.0, 5.0), 1.0, Vec2::new(f32::NAN, 1.0));
        assert_eq!(end, Vec2::new(5.0, 5.0));
    }

    #[test]
    fn test_line_of_sight() {
        let walls = [wall_at(50.0, 10.0)];
        let view = ObstacleView::new(&walls, &[], 1000.0);
        assert!(!line_of_sight(&view, Vec2::new(0.0, 0.0), Vec2::new(100.0, 0.0)));
        assert!(line_of_sight(&view, Vec2::new(0.0, 0.0), Vec2::new(40.0, 0.0)));
    }
}

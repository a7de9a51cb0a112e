//! Static world geometry primitives
//!
//! Every obstacle answers two questions: how far must a circle move to
//! stop overlapping it, and does a segment cross it. Rectangles are
//! handled in their local frame so axis-aligned and rotated boxes share
//! one code path.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::vec2::Vec2;

/// Collision shape in world space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "kebab-case")]
pub enum Obstacle {
    Circle { center: Vec2, radius: f32 },
    /// Axis-aligned box given by its corners
    Rect { min: Vec2, max: Vec2 },
    /// Box rotated by `angle` radians around its center
    OrientedRect { center: Vec2, half_extents: Vec2, angle: f32 },
}

impl Obstacle {
    /// Every coordinate finite and every size positive
    pub fn is_well_formed(&self) -> bool {
        match *self {
            Obstacle::Circle { center, radius } => center.is_finite() && radius.is_finite() && radius > 0.0,
            Obstacle::Rect { min, max } => {
                min.is_finite() && max.is_finite() && min.x < max.x && min.y < max.y
            }
            Obstacle::OrientedRect {
                center,
                half_extents,
                angle,
            } => {
                center.is_finite()
                    && half_extents.is_finite()
                    && angle.is_finite()
                    && half_extents.x > 0.0
                    && half_extents.y > 0.0
            }
        }
    }

    /// Correction that moves a circle out of this obstacle, if overlapping
    pub fn push_out(&self, center: Vec2, radius: f32) -> Option<Vec2> {
        match *self {
            Obstacle::Circle { center: c, radius: r } => {
                let delta = center - c;
                let dist_sq = delta.length_sq();
                let min_dist = r + radius;
                if dist_sq >= min_dist * min_dist {
                    return None;
                }
                let dist = dist_sq.sqrt();
                let normal = if dist > 1e-6 { delta / dist } else { Vec2::RIGHT };
                Some(normal * (min_dist - dist))
            }
            Obstacle::Rect { min, max } => {
                let box_center = (min + max) * 0.5;
                let half = (max - min) * 0.5;
                push_out_local_box(center - box_center, half, radius)
            }
            Obstacle::OrientedRect {
                center: c,
                half_extents,
                angle,
            } => {
                let local = (center - c).rotate(-angle);
                push_out_local_box(local, half_extents, radius).map(|v| v.rotate(angle))
            }
        }
    }

    /// True if the segment `a -> b` touches this obstacle
    pub fn intersects_segment(&self, a: Vec2, b: Vec2) -> bool {
        match *self {
            Obstacle::Circle { center, radius } => {
                distance_sq_to_segment(center, a, b) <= radius * radius
            }
            Obstacle::Rect { min, max } => {
                let c = (min + max) * 0.5;
                segment_hits_local_box(a - c, b - c, (max - min) * 0.5)
            }
            Obstacle::OrientedRect {
                center,
                half_extents,
                angle,
            } => segment_hits_local_box(
                (a - center).rotate(-angle),
                (b - center).rotate(-angle),
                half_extents,
            ),
        }
    }
}

/// Depenetration against a box centered at the origin
fn push_out_local_box(p: Vec2, half: Vec2, radius: f32) -> Option<Vec2> {
    let closest = Vec2::new(p.x.clamp(-half.x, half.x), p.y.clamp(-half.y, half.y));
    let delta = p - closest;
    let dist_sq = delta.length_sq();

    if dist_sq > 0.0 {
        if dist_sq >= radius * radius {
            return None;
        }
        let dist = dist_sq.sqrt();
        return Some(delta / dist * (radius - dist));
    }

    // Center inside the box: leave through the nearest face
    let to_right = half.x - p.x;
    let to_left = half.x + p.x;
    let to_bottom = half.y - p.y;
    let to_top = half.y + p.y;
    let min_face = to_right.min(to_left).min(to_bottom).min(to_top);

    Some(if min_face == to_right {
        Vec2::new(to_right + radius, 0.0)
    } else if min_face == to_left {
        Vec2::new(-(to_left + radius), 0.0)
    } else if min_face == to_bottom {
        Vec2::new(0.0, to_bottom + radius)
    } else {
        Vec2::new(0.0, -(to_top + radius))
    })
}

/// Slab test of a segment against a box centered at the origin
fn segment_hits_local_box(a: Vec2, b: Vec2, half: Vec2) -> bool {
    let d = b - a;
    let mut t_min = 0.0f32;
    let mut t_max = 1.0f32;

    for (start, dir, h) in [(a.x, d.x, half.x), (a.y, d.y, half.y)] {
        if dir.abs() < 1e-9 {
            if start < -h || start > h {
                return false;
            }
            continue;
        }
        let inv = 1.0 / dir;
        let mut t0 = (-h - start) * inv;
        let mut t1 = (h - start) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t_min = t_min.max(t0);
        t_max = t_max.min(t1);
        if t_min > t_max {
            return false;
        }
    }
    true
}

/// Parse a JSON array of obstacles, rejecting malformed shapes
pub fn parse_obstacles(json: &str) -> Result<Vec<Obstacle>> {
    let obstacles: Vec<Obstacle> =
        serde_json::from_str(json).context("World geometry is not a JSON array of obstacles")?;
    if let Some(index) = obstacles.iter().position(|o| !o.is_well_formed()) {
        bail!("World geometry obstacle {} is malformed", index);
    }
    Ok(obstacles)
}

/// Load the static world geometry file shared by every room
pub fn load_obstacles(path: impl AsRef<Path>) -> Result<Vec<Obstacle>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read world geometry from {}", path.display()))?;
    parse_obstacles(&json)
}

/// Squared distance from `p` to the segment `a -> b`
pub fn distance_sq_to_segment(p: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let len_sq = ab.length_sq();
    if len_sq <= f32::EPSILON {
        return p.distance_sq_to(a);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance_sq_to(a + ab * t)
}

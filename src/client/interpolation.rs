//! Remote entity interpolation
//!
//! Remote entities are drawn a fixed delay in the past, between the two
//! buffered snapshot samples that bracket that instant. Nothing is ever
//! extrapolated; without a bracketing pair the newest sample is used.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::config::SyncConfig;
use crate::game::state::EntityId;
use crate::util::vec2::{lerp_angle, Vec2};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    position: Vec2,
    rotation: f32,
    at: Instant,
}

/// Render pose of a remote entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedPose {
    pub position: Vec2,
    pub rotation: f32,
}

pub struct EntityInterpolator {
    buffers: HashMap<EntityId, VecDeque<Sample>>,
    window: Duration,
    delay: Duration,
    snap_distance: f32,
}

impl EntityInterpolator {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_params(config.interp_window(), config.interp_delay(), config.interp_snap_px)
    }

    pub fn with_params(window: Duration, delay: Duration, snap_distance: f32) -> Self {
        Self {
            buffers: HashMap::new(),
            window,
            delay,
            snap_distance,
        }
    }

    /// Entities with at least one buffered sample
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.buffers.contains_key(id)
    }

    /// Buffer a snapshot sample. Samples older than the newest one are
    /// ignored; samples past the window are evicted, keeping the newest.
    pub fn push_sample(&mut self, id: EntityId, position: Vec2, rotation: f32, now: Instant) {
        let buffer = self.buffers.entry(id).or_default();
        if buffer.back().is_some_and(|last| now < last.at) {
            return;
        }
        buffer.push_back(Sample {
            position,
            rotation,
            at: now,
        });

        let window = self.window;
        while buffer.len() > 1
            && buffer
                .front()
                .is_some_and(|s| now.saturating_duration_since(s.at) > window)
        {
            buffer.pop_front();
        }
    }

    /// Pose to render for `id` at `now`, or `None` when nothing is buffered
    pub fn sample(&self, id: &EntityId, now: Instant) -> Option<InterpolatedPose> {
        let buffer = self.buffers.get(id)?;
        let newest = buffer.back()?;
        let newest_pose = InterpolatedPose {
            position: newest.position,
            rotation: newest.rotation,
        };

        let Some(render_at) = now.checked_sub(self.delay) else {
            return Some(newest_pose);
        };

        let bracket = buffer
            .iter()
            .zip(buffer.iter().skip(1))
            .find(|(a, b)| a.at <= render_at && render_at <= b.at);
        let Some((a, b)) = bracket else {
            return Some(newest_pose);
        };

        if a.position.distance_to(b.position) > self.snap_distance {
            return Some(InterpolatedPose {
                position: b.position,
                rotation: b.rotation,
            });
        }

        let span = b.at.duration_since(a.at).as_secs_f32();
        let t = if span > 0.0 {
            render_at.duration_since(a.at).as_secs_f32() / span
        } else {
            1.0
        };
        Some(InterpolatedPose {
            position: a.position.lerp(b.position, t),
            rotation: lerp_angle(a.rotation, b.rotation, t),
        })
    }

    pub fn remove(&mut self, id: &EntityId) {
        self.buffers.remove(id);
    }

    /// Drop buffers for entities not accepted by `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&EntityId) -> bool) {
        self.buffers.retain(|id, _| keep(id));
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

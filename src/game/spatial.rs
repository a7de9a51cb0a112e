//! Incremental uniform grid over a fixed world extent
//!
//! Cells are addressed by a row-major index derived from clamped world
//! coordinates, so positions outside the extent land in a boundary cell
//! instead of being dropped. Each indexed entity caches its cell index;
//! `update` only touches buckets when that index changes.

use rustc_hash::FxHashMap;

use crate::game::constants::limits::MAX_GRID_COLS;
use crate::game::state::EntityId;
use crate::util::pool::{ObjectPool, PoolStats};
use crate::util::vec2::Vec2;

// ============================================================================
// Constants
// ============================================================================

/// Idle buckets kept around for reuse
const MAX_POOLED_BUCKETS: usize = 1024;

/// Buckets allocated up front
const PREWARMED_BUCKETS: usize = 64;

/// Entity data stored in a bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialEntry {
    pub id: EntityId,
    pub position: Vec2,
    pub radius: f32,
}

impl SpatialEntry {
    pub fn new(id: EntityId, position: Vec2, radius: f32) -> Self {
        Self { id, position, radius }
    }
}

/// Grid statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct SpatialIndexStats {
    pub entity_count: usize,
    pub occupied_cells: usize,
    pub max_bucket_len: usize,
    pub rebuckets: u64,
    pub pool: PoolStats,
}

/// Uniform grid partition with pooled buckets
pub struct SpatialIndex {
    cell_size: f32,
    extent: f32,
    /// Cells per axis
    cols: usize,
    /// Bucket per cell; `None` when empty (bucket returned to the pool)
    cells: Vec<Option<Vec<SpatialEntry>>>,
    /// Cached cell index per indexed entity
    cell_of: FxHashMap<EntityId, usize>,
    bucket_pool: ObjectPool<Vec<SpatialEntry>>,
    /// Largest radius ever indexed; widens queries so they stay sound
    max_entity_radius: f32,
    rebuckets: u64,
}

impl SpatialIndex {
    /// Create a grid covering `[-extent, extent]` on both axes
    pub fn new(cell_size: f32, extent: f32) -> Self {
        let cell_size = if cell_size.is_finite() { cell_size.max(1.0) } else { 1.0 };
        let extent = if extent.is_finite() { extent.max(cell_size) } else { cell_size };
        // Coarsen the grid rather than allocate past the column limit
        let cell_size = cell_size.max(2.0 * extent / MAX_GRID_COLS as f32);
        let cols = (((2.0 * extent) / cell_size).ceil().max(1.0) as usize).min(MAX_GRID_COLS);

        let mut cells = Vec::with_capacity(cols * cols);
        cells.resize_with(cols * cols, || None);

        Self {
            cell_size,
            extent,
            cols,
            cells,
            cell_of: FxHashMap::default(),
            bucket_pool: ObjectPool::with_prewarmed(Vec::new, PREWARMED_BUCKETS, MAX_POOLED_BUCKETS),
            max_entity_radius: 0.0,
            rebuckets: 0,
        }
    }

    #[inline]
    fn axis_cell(&self, coord: f32) -> usize {
        // NaN casts to 0 and lands in the first cell
        let raw = ((coord + self.extent) / self.cell_size).floor() as i64;
        raw.clamp(0, self.cols as i64 - 1) as usize
    }

    /// Row-major cell index for a world position
    #[inline]
    pub fn cell_index(&self, x: f32, y: f32) -> usize {
        self.axis_cell(y) * self.cols + self.axis_cell(x)
    }

    /// Cell index an entity is currently bucketed in
    #[inline]
    pub fn cached_cell(&self, id: &EntityId) -> Option<usize> {
        self.cell_of.get(id).copied()
    }

    #[inline]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.cell_of.contains_key(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cell_of.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cell_of.is_empty()
    }

    #[inline]
    pub fn max_entity_radius(&self) -> f32 {
        self.max_entity_radius
    }

    /// Index an entity. Inserting an already-indexed id behaves as `update`.
    pub fn insert(&mut self, entry: &SpatialEntry) {
        if self.cell_of.contains_key(&entry.id) {
            self.update(entry);
            return;
        }
        self.track_radius(entry.radius);
        let cell = self.cell_index(entry.position.x, entry.position.y);
        self.push_into(cell, *entry);
        self.cell_of.insert(entry.id, cell);
    }

    /// Remove an entity. Returns false when it was not indexed.
    pub fn remove(&mut self, id: &EntityId) -> bool {
        match self.cell_of.remove(id) {
            Some(cell) => {
                self.take_from(cell, id);
                true
            }
            None => false,
        }
    }

    /// Refresh an indexed entity. Only rebuckets if its cell changed;
    /// unknown ids are ignored.
    pub fn update(&mut self, entry: &SpatialEntry) {
        let Some(&old_cell) = self.cell_of.get(&entry.id) else {
            return;
        };
        self.track_radius(entry.radius);
        let new_cell = self.cell_index(entry.position.x, entry.position.y);

        if new_cell == old_cell {
            if let Some(slot) = self.cells[old_cell]
                .as_mut()
                .and_then(|bucket| bucket.iter_mut().find(|e| e.id == entry.id))
            {
                slot.position = entry.position;
                slot.radius = entry.radius;
            }
            return;
        }

        self.take_from(old_cell, &entry.id);
        self.push_into(new_cell, *entry);
        self.cell_of.insert(entry.id, new_cell);
        self.rebuckets += 1;
    }

    /// Candidates near a point. Never misses an entity within `radius`, and
    /// never returns one whose center is beyond `radius + max_entity_radius`.
    pub fn query_circle(&self, x: f32, y: f32, radius: f32) -> Vec<EntityId> {
        let mut out = Vec::new();
        self.query_circle_into(x, y, radius, &mut out);
        out
    }

    /// Allocation-free variant of [`query_circle`](Self::query_circle);
    /// appends to `out`.
    pub fn query_circle_into(&self, x: f32, y: f32, radius: f32, out: &mut Vec<EntityId>) {
        let reach = radius.max(0.0) + self.max_entity_radius;
        if !reach.is_finite() {
            return;
        }
        let reach_sq = reach * reach;
        let center = Vec2::new(x, y);

        let (x0, x1) = (self.axis_cell(x - reach), self.axis_cell(x + reach));
        let (y0, y1) = (self.axis_cell(y - reach), self.axis_cell(y + reach));

        for cy in y0..=y1 {
            let row = cy * self.cols;
            for cx in x0..=x1 {
                let Some(bucket) = &self.cells[row + cx] else {
                    continue;
                };
                out.extend(
                    bucket
                        .iter()
                        .filter(|e| e.position.distance_sq_to(center) <= reach_sq)
                        .map(|e| e.id),
                );
            }
        }
    }

    /// Drop all entities, returning buckets to the pool
    pub fn clear(&mut self) {
        for cell in self.cells.iter_mut() {
            if let Some(bucket) = cell.take() {
                self.bucket_pool.release(bucket);
            }
        }
        self.cell_of.clear();
        self.max_entity_radius = 0.0;
    }

    pub fn stats(&self) -> SpatialIndexStats {
        let mut stats = SpatialIndexStats {
            entity_count: self.cell_of.len(),
            rebuckets: self.rebuckets,
            pool: self.bucket_pool.stats(),
            ..Default::default()
        };
        for bucket in self.cells.iter().flatten() {
            stats.occupied_cells += 1;
            stats.max_bucket_len = stats.max_bucket_len.max(bucket.len());
        }
        stats
    }

    #[inline]
    fn track_radius(&mut self, radius: f32) {
        if radius.is_finite() && radius > self.max_entity_radius {
            self.max_entity_radius = radius;
        }
    }

    fn push_into(&mut self, cell: usize, entry: SpatialEntry) {
        let pool = &mut self.bucket_pool;
        self.cells[cell]
            .get_or_insert_with(|| pool.acquire())
            .push(entry);
    }

    fn take_from(&mut self, cell: usize, id: &EntityId) {
        let Some(bucket) = self.cells[cell].as_mut() else {
            return;
        };
        if let Some(pos) = bucket.iter().position(|e| e.id == *id) {
            bucket.swap_remove(pos);
        }
        if bucket.is_empty() {
            if let Some(empty) = self.cells[cell].take() {
                self.bucket_pool.release(empty);
            }
        }
    }
}

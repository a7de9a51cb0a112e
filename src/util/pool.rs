//! Generic object pool for short-lived, frequently recycled records
//!
//! Spatial index buckets and client feedback records churn every tick or
//! frame. Leasing them from an [`ObjectPool`] keeps their backing
//! allocations alive between uses instead of freeing and reallocating.

/// Types that can be returned to a pool and handed out again
pub trait Poolable {
    /// Clear the value back to its freshly-created state, keeping capacity
    fn reset(&mut self);
}

impl<T> Poolable for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Usage counters for a pool
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects built by the factory
    pub created: u64,
    /// Acquisitions served from the free list
    pub reused: u64,
    /// Released objects discarded because the free list was full
    pub discarded: u64,
}

/// Free-list allocator for [`Poolable`] values
pub struct ObjectPool<T: Poolable> {
    free: Vec<T>,
    factory: fn() -> T,
    max_retained: usize,
    stats: PoolStats,
}

impl<T: Poolable> ObjectPool<T> {
    /// Create a pool that keeps at most `max_retained` idle objects
    pub fn new(factory: fn() -> T, max_retained: usize) -> Self {
        Self {
            free: Vec::new(),
            factory,
            max_retained,
            stats: PoolStats::default(),
        }
    }

    /// Create a pool pre-filled with `count` idle objects
    pub fn with_prewarmed(factory: fn() -> T, count: usize, max_retained: usize) -> Self {
        let mut pool = Self::new(factory, max_retained.max(count));
        pool.free.extend((0..count).map(|_| factory()));
        pool.stats.created = count as u64;
        pool
    }

    /// Take an object from the free list, or build a new one
    pub fn acquire(&mut self) -> T {
        match self.free.pop() {
            Some(obj) => {
                self.stats.reused += 1;
                obj
            }
            None => {
                self.stats.created += 1;
                (self.factory)()
            }
        }
    }

    /// Reset an object and return it to the free list
    pub fn release(&mut self, mut obj: T) {
        if self.free.len() >= self.max_retained {
            self.stats.discarded += 1;
            return;
        }
        obj.reset();
        self.free.push(obj);
    }

    #[inline]
    pub fn idle_count(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_creates_then_reuses() {
        let mut pool: ObjectPool<Vec<u32>> = ObjectPool::new(Vec::new, 4);
        let mut a = pool.acquire();
        a.extend([1, 2, 3]);
        let cap = a.capacity();
        pool.release(a);

        let b = pool.acquire();
        assert!(b.is_empty());
        assert!(b.capacity() >= cap);
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_release_beyond_retention_discards() {
        let mut pool: ObjectPool<Vec<u8>> = ObjectPool::new(Vec::new, 1);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_prewarmed() {
        let mut pool: ObjectPool<Vec<u8>> = ObjectPool::with_prewarmed(Vec::new, 3, 2);
        assert_eq!(pool.idle_count(), 3);
        let _ = pool.acquire();
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.stats().created, 3);
    }
}

//! Bounded caches used while mining.

use lru::LruCache;

use crate::{mining::projection::PathProjection, ItemId, Utility};

/// The three LRU caches of a mining run, each with a hard size cap.
///
/// All keys are canonical (sorted) item lists. The projection cache holds
/// views into the master tree; entries are not proactively evicted when a
/// tree region is released, they simply stop validating.
pub struct MiningCaches {
    bounds: LruCache<Vec<ItemId>, Utility>,
    emitted: LruCache<Vec<ItemId>, bool>,
    projections: LruCache<Vec<ItemId>, PathProjection>,
}

impl MiningCaches {
    pub fn new(bounds_cap: usize, emitted_cap: usize, projections_cap: usize) -> Self {
        Self {
            bounds: LruCache::new(bounds_cap.max(1)),
            emitted: LruCache::new(emitted_cap.max(1)),
            projections: LruCache::new(projections_cap.max(1)),
        }
    }

    /// Records an upper bound on the utility of `items`.
    pub fn put_bound(&mut self, items: Vec<ItemId>, bound: Utility) {
        self.bounds.put(items, bound);
    }

    pub fn bound(&mut self, items: &[ItemId]) -> Option<Utility> {
        self.bounds.get(&items.to_vec()).copied()
    }

    /// Marks `items` as emitted; returns whether it had been marked
    /// before (duplicate suppression on diamond paths).
    pub fn mark_emitted(&mut self, items: Vec<ItemId>) -> bool {
        self.emitted.put(items, true).is_some()
    }

    pub fn was_emitted(&mut self, items: &[ItemId]) -> bool {
        self.emitted.get(&items.to_vec()).copied().unwrap_or(false)
    }

    pub fn put_projection(&mut self, items: Vec<ItemId>, projection: PathProjection) {
        self.projections.put(items, projection);
    }

    pub fn projection(&mut self, items: &[ItemId]) -> Option<PathProjection> {
        self.projections.get(&items.to_vec()).cloned()
    }
}

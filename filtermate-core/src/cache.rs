//! Statistics TTL cache and source-geometry memoization (spec §4.9, §5).
//!
//! Grounded on this crate's sibling tiling engine's use of `moka` for
//! its in-memory tile cache: a size/TTL-bounded async cache keyed by
//! layer id. The source-geometry cache is a plain FIFO (spec §6:
//! `Cache.source_geometry_max_entries`, eviction order matters more
//! than recency here since a run touches each source layer once).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use moka::future::Cache;

use crate::model::{Extent, LayerId, LayerStatistics};

/// TTL-bounded statistics cache (spec §3 `CachedStatistics`, §6
/// `Cache.stats_ttl_ms` default 300_000ms).
pub struct StatisticsCache {
    inner: Cache<LayerId, LayerStatistics>,
}

impl StatisticsCache {
    #[must_use]
    pub fn new(ttl_ms: u64) -> Self {
        StatisticsCache {
            inner: Cache::builder().time_to_live(Duration::from_millis(ttl_ms)).build(),
        }
    }

    pub async fn get(&self, layer_id: &LayerId) -> Option<LayerStatistics> {
        self.inner.get(layer_id).await
    }

    pub async fn insert(&self, layer_id: LayerId, stats: LayerStatistics) {
        self.inner.insert(layer_id, stats).await;
    }

    pub fn invalidate(&self, layer_id: &LayerId) {
        self.inner.invalidate(layer_id);
    }
}

/// Key identifying a memoized staged source geometry: the source
/// layer, the buffer value applied, and the target CRS it was
/// reprojected into (spec §4.9: "(source_fids, buffer_value,
/// target_crs) tuple").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceGeometryKey {
    pub source_layer_id: LayerId,
    pub source_fids: Vec<i64>,
    pub buffer_value_bits: u64,
    pub target_srid: i32,
}

impl SourceGeometryKey {
    #[must_use]
    pub fn new(source_layer_id: LayerId, mut source_fids: Vec<i64>, buffer_value: f64, target_srid: i32) -> Self {
        source_fids.sort_unstable();
        SourceGeometryKey {
            source_layer_id,
            source_fids,
            buffer_value_bits: buffer_value.to_bits(),
            target_srid,
        }
    }
}

/// A memoized staged source geometry, avoiding re-buffering across
/// target layers within one run (spec §4.9).
#[derive(Debug, Clone)]
pub struct MemoizedGeometry {
    pub wkt: String,
    pub srid: i32,
    pub bbox: Extent,
    pub feature_count: usize,
    /// WKB encoding, populated only when the run that staged this entry
    /// needed it for the in-process (OGR) executor's predicate test.
    pub wkb: Option<Vec<u8>>,
}

/// FIFO-bounded cache of staged source geometries (spec §6
/// `Cache.source_geometry_max_entries`, default 10).
pub struct SourceGeometryCache {
    max_entries: usize,
    order: Mutex<VecDeque<SourceGeometryKey>>,
    entries: Mutex<std::collections::HashMap<SourceGeometryKey, MemoizedGeometry>>,
}

impl SourceGeometryCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        SourceGeometryCache {
            max_entries,
            order: Mutex::new(VecDeque::new()),
            entries: Mutex::new(std::collections::HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, key: &SourceGeometryKey) -> Option<MemoizedGeometry> {
        self.entries.lock().expect("source geometry cache lock").get(key).cloned()
    }

    /// Inserts `geometry`, evicting the oldest entry first if the cache
    /// is already at capacity (spec §6: FIFO, not LRU).
    pub fn insert(&self, key: SourceGeometryKey, geometry: MemoizedGeometry) {
        let mut entries = self.entries.lock().expect("source geometry cache lock");
        let mut order = self.order.lock().expect("source geometry cache order lock");

        if entries.contains_key(&key) {
            entries.insert(key, geometry);
            return;
        }

        if order.len() >= self.max_entries {
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            }
        }
        order.push_back(key.clone());
        entries.insert(key, geometry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("source geometry cache lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: i64) -> SourceGeometryKey {
        SourceGeometryKey::new("layer".to_string(), vec![n], 10.0, 4326)
    }

    fn geom() -> MemoizedGeometry {
        MemoizedGeometry {
            wkt: "POINT(1 1)".to_string(),
            srid: 4326,
            bbox: Extent { xmin: 0.0, ymin: 0.0, xmax: 1.0, ymax: 1.0 },
            feature_count: 1,
            wkb: None,
        }
    }

    #[test]
    fn evicts_oldest_entry_past_capacity() {
        let cache = SourceGeometryCache::new(2);
        cache.insert(key(1), geom());
        cache.insert(key(2), geom());
        cache.insert(key(3), geom());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(3)).is_some());
    }

    #[test]
    fn reinserting_existing_key_does_not_evict() {
        let cache = SourceGeometryCache::new(2);
        cache.insert(key(1), geom());
        cache.insert(key(2), geom());
        cache.insert(key(1), geom());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(2)).is_some());
    }

    #[tokio::test]
    async fn statistics_cache_round_trips() {
        let cache = StatisticsCache::new(300_000);
        let stats = LayerStatistics {
            feature_count: 10,
            extent_area: 1.0,
            extent_bounds: None,
            has_spatial_index: true,
            geometry_type: None,
            avg_vertices_per_feature: 0.0,
            estimated_complexity: 0.0,
        };
        cache.insert("layer".to_string(), stats.clone()).await;
        let got = cache.get(&"layer".to_string()).await.unwrap();
        assert_eq!(got.feature_count, stats.feature_count);
    }
}

//! Recognized engine configuration (spec §6 "Configuration").
//!
//! Plain, serde-derived structs with the spec's literal defaults, the
//! way this crate's sibling tile server keeps its `srv` / `postgres`
//! config sections: one struct per concern, `Default` matching the
//! documented defaults, loaded from a config file or built
//! programmatically by an embedding host.

use serde::{Deserialize, Serialize};

use crate::model::BufferStyle;

/// Materialized-view / temp-table thresholds (spec §4.5, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MvConfig {
    pub feature_threshold_postgres: u64,
    pub complexity_threshold_postgres: f64,
    pub feature_threshold_spatialite: u64,
    pub complexity_threshold_spatialite: f64,
    /// Minimum feature count for an extra indexed bbox column on the MV
    /// (spec §4.5: true once features ≥ 10_000).
    pub bbox_column_min_features: u64,
    /// Feature-count band for the async `CLUSTER` path (spec §4.5:
    /// `[50_000, 100_000)`).
    pub async_cluster_min_features: u64,
    pub async_cluster_max_features: u64,
}

impl Default for MvConfig {
    fn default() -> Self {
        MvConfig {
            feature_threshold_postgres: 100_000,
            complexity_threshold_postgres: 5.0,
            feature_threshold_spatialite: 50_000,
            complexity_threshold_spatialite: 4.0,
            bbox_column_min_features: 10_000,
            async_cluster_min_features: 50_000,
            async_cluster_max_features: 100_000,
        }
    }
}

/// Buffer generation defaults (spec §4.2, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub simplify_before_buffer: bool,
    pub simplify_tolerance_factor: f64,
    pub min_tolerance: f64,
    pub max_tolerance: f64,
    pub default_segments: u32,
    pub endcap_style: BufferStyle,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            simplify_before_buffer: false,
            simplify_tolerance_factor: 0.1,
            min_tolerance: 0.5,
            max_tolerance: 10.0,
            default_segments: 5,
            endcap_style: BufferStyle::Round,
        }
    }
}

/// Cost-based predicate reordering; the cost table itself is fixed
/// (spec §4.3 `SpatialPredicate::cost_rank`) and not user-configurable,
/// matching spec §6's "immutable default" note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredicateOrderingConfig {
    pub enabled: bool,
}

impl Default for PredicateOrderingConfig {
    fn default() -> Self {
        PredicateOrderingConfig { enabled: true }
    }
}

/// Two-phase / progressive-cursor / chunked-IN thresholds (spec §4.4,
/// §4.8.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub two_phase_min_complexity: f64,
    pub lazy_cursor_chunk_size: usize,
    pub progressive_max_ids_per_in_clause: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            two_phase_min_complexity: 100.0,
            lazy_cursor_chunk_size: 5_000,
            progressive_max_ids_per_in_clause: 10_000,
        }
    }
}

/// Statistics and source-geometry cache sizing (spec §4.9, §5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub stats_ttl_ms: u64,
    pub source_geometry_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            stats_ttl_ms: 300_000,
            source_geometry_max_entries: 10,
        }
    }
}

/// Top-level engine configuration, the union of every recognized
/// option in spec §6.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mv: MvConfig,
    pub buffer: BufferConfig,
    pub predicate_ordering: PredicateOrderingConfig,
    pub execution: ExecutionConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Clamps a user-supplied buffer tolerance into
    /// `[min_tolerance, max_tolerance]` (spec §6).
    #[must_use]
    pub fn clamp_tolerance(&self, tolerance: f64) -> f64 {
        tolerance.clamp(self.buffer.min_tolerance, self.buffer.max_tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let cfg = Config::default();
        assert_eq!(cfg.mv.feature_threshold_postgres, 100_000);
        assert_eq!(cfg.mv.feature_threshold_spatialite, 50_000);
        assert_eq!(cfg.execution.two_phase_min_complexity, 100.0);
        assert_eq!(cfg.execution.progressive_max_ids_per_in_clause, 10_000);
        assert_eq!(cfg.cache.stats_ttl_ms, 300_000);
        assert_eq!(cfg.cache.source_geometry_max_entries, 10);
    }

    #[test]
    fn clamps_tolerance_into_configured_band() {
        let cfg = Config::default();
        assert_eq!(cfg.clamp_tolerance(0.1), 0.5);
        assert_eq!(cfg.clamp_tolerance(50.0), 10.0);
        assert_eq!(cfg.clamp_tolerance(2.0), 2.0);
    }
}

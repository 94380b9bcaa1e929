//! The `MaterializedViewPort` contract (C5).

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::model::ViewInfo;

/// Configuration shared by both MV adapters, ported from the engine's
/// `ViewConfig` dataclass (SPEC_FULL.md §C.3) with the defaults spec §6
/// calls out explicitly where they differ per backend.
#[derive(Debug, Clone)]
pub struct MvConfig {
    pub feature_threshold: u64,
    pub complexity_threshold: f64,
    pub with_data: bool,
    pub create_spatial_index: bool,
    pub create_btree_indexes: bool,
    pub auto_refresh: bool,
    pub refresh_on_change: bool,
    pub concurrent_refresh: bool,
    pub prefix: String,
    pub schema: String,
    pub enable_bbox_column: bool,
    pub enable_async_cluster: bool,
    pub use_rtree: bool,
    pub register_geometry: bool,
    /// Minimum feature count for the extra indexed bbox column (spec
    /// §4.5: enabled once `feature_count ≥ 10_000`).
    pub bbox_column_min_features: u64,
    /// Feature-count band for the asynchronous `CLUSTER` path (spec
    /// §4.5: `[50_000, 100_000)`; below it `CLUSTER` runs synchronously,
    /// at or above the upper bound it's skipped).
    pub async_cluster_min_features: u64,
    pub async_cluster_max_features: u64,
}

impl MvConfig {
    /// Defaults for the PostgreSQL materialized-view adapter (spec
    /// §4.5/§6: `feature_threshold=100_000`, `complexity_threshold=5`).
    #[must_use]
    pub fn postgres_defaults() -> Self {
        MvConfig {
            feature_threshold: 100_000,
            complexity_threshold: 5.0,
            with_data: true,
            create_spatial_index: true,
            create_btree_indexes: true,
            auto_refresh: true,
            refresh_on_change: true,
            concurrent_refresh: true,
            prefix: "fm_temp_mv_".to_string(),
            schema: "filtermate_temp".to_string(),
            enable_bbox_column: true,
            enable_async_cluster: true,
            use_rtree: false,
            register_geometry: false,
            bbox_column_min_features: 10_000,
            async_cluster_min_features: 50_000,
            async_cluster_max_features: 100_000,
        }
    }

    /// Defaults for the SpatiaLite temp-table adapter (spec §4.5/§6:
    /// `feature_threshold=50_000`, `complexity_threshold=4`).
    #[must_use]
    pub fn spatialite_defaults() -> Self {
        MvConfig {
            feature_threshold: 50_000,
            complexity_threshold: 4.0,
            with_data: true,
            create_spatial_index: true,
            create_btree_indexes: true,
            auto_refresh: false,
            refresh_on_change: false,
            concurrent_refresh: false,
            prefix: "fm_temp_tt_".to_string(),
            schema: String::new(),
            enable_bbox_column: false,
            enable_async_cluster: false,
            use_rtree: true,
            register_geometry: true,
            bbox_column_min_features: 10_000,
            async_cluster_min_features: 50_000,
            async_cluster_max_features: 100_000,
        }
    }

    /// Builds the PostgreSQL adapter's config from the engine-level,
    /// host-recognized [`crate::config::MvConfig`] (spec §6), so a
    /// loaded/overridden config actually reaches the adapter instead of
    /// only [`Self::postgres_defaults`]'s literals.
    #[must_use]
    pub fn from_postgres_config(cfg: &crate::config::MvConfig) -> Self {
        MvConfig {
            feature_threshold: cfg.feature_threshold_postgres,
            complexity_threshold: cfg.complexity_threshold_postgres,
            bbox_column_min_features: cfg.bbox_column_min_features,
            async_cluster_min_features: cfg.async_cluster_min_features,
            async_cluster_max_features: cfg.async_cluster_max_features,
            ..Self::postgres_defaults()
        }
    }

    /// Builds the SpatiaLite adapter's config from the engine-level,
    /// host-recognized [`crate::config::MvConfig`] (spec §6).
    #[must_use]
    pub fn from_spatialite_config(cfg: &crate::config::MvConfig) -> Self {
        MvConfig {
            feature_threshold: cfg.feature_threshold_spatialite,
            complexity_threshold: cfg.complexity_threshold_spatialite,
            ..Self::spatialite_defaults()
        }
    }
}

/// Abstract interface for materialized-view/temp-table lifecycle
/// management (spec §4.5). Implementations never panic on cleanup
/// failures; every drop is logged, not propagated (spec §4.5, §7).
#[async_trait]
pub trait MaterializedViewPort: Send + Sync {
    fn config(&self) -> &MvConfig;

    fn session_id(&self) -> &str;

    /// Whether a view/table would be worth creating for this source
    /// (spec §4.5 thresholds; spatial queries halve the feature
    /// threshold).
    fn should_use_view(&self, feature_count: u64, complexity: f64, is_spatial: bool) -> bool {
        let cfg = self.config();
        if feature_count >= cfg.feature_threshold {
            return true;
        }
        if complexity >= cfg.complexity_threshold {
            return true;
        }
        if is_spatial && feature_count >= cfg.feature_threshold / 2 {
            return true;
        }
        false
    }

    /// Creates (or reuses, if the `(query, session)` hash already
    /// exists) a view/table and returns its name.
    async fn create_view(
        &self,
        query: &str,
        source_table: &str,
        geometry_column: &str,
        srid: i32,
        indexes: &[String],
        session_scoped: bool,
    ) -> EngineResult<String>;

    async fn refresh_view(&self, view_name: &str) -> EngineResult<bool>;

    async fn drop_view(&self, view_name: &str, if_exists: bool) -> EngineResult<bool>;

    async fn view_exists(&self, view_name: &str) -> EngineResult<bool>;

    async fn get_view_info(&self, view_name: &str) -> EngineResult<Option<ViewInfo>>;

    async fn list_session_views(&self) -> EngineResult<Vec<ViewInfo>>;

    /// Drops every view/table created in the current session. MUST NOT
    /// fail on dangling entries (spec §4.5, §8 invariant: a no-op on a
    /// freshly created manager).
    async fn cleanup_session_views(&self) -> EngineResult<usize>;

    async fn get_feature_ids(&self, view_name: &str, primary_key: &str) -> EngineResult<Vec<i64>>;
}

/// Naming scheme shared by both adapters (spec §4.5): `fm_temp_<kind>_<session[:6]>_<md5(query)[:12]>`.
#[must_use]
pub fn view_name(prefix: &str, session_id: &str, query: &str) -> String {
    let digest = md5::compute(query.as_bytes());
    let hash = format!("{digest:x}");
    let session_part: String = session_id.chars().take(6).collect();
    format!("{prefix}{session_part}_{}", &hash[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_name_is_stable_for_same_query_and_session() {
        let a = view_name("fm_temp_mv_", "abcdef12", "SELECT 1");
        let b = view_name("fm_temp_mv_", "abcdef12", "SELECT 1");
        assert_eq!(a, b);
    }

    #[test]
    fn view_name_differs_for_different_queries() {
        let a = view_name("fm_temp_mv_", "abcdef12", "SELECT 1");
        let b = view_name("fm_temp_mv_", "abcdef12", "SELECT 2");
        assert_ne!(a, b);
    }

    #[test]
    fn view_name_truncates_session_to_six_chars() {
        let name = view_name("fm_temp_mv_", "abcdefghij", "SELECT 1");
        assert!(name.starts_with("fm_temp_mv_abcdef_"));
    }
}

//! The `Host` port: the boundary between the engine and whatever desktop
//! GIS application embeds it.
//!
//! The engine never talks to a specific application API directly. Every
//! operation that needs to read layer metadata, stage source features,
//! or apply a computed filter back onto a layer goes through this trait,
//! the way tile sources are abstracted behind [`crate`]-external
//! `Source` traits in this crate's sibling tiling engines.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::model::{BufferStyle, Extent, LayerId, LayerInfo, SpatialPredicate};

/// A single staged source feature: the geometry (and optional attribute
/// values) used to build a spatial predicate against other layers.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub wkt: String,
    pub srid: i32,
    /// WKB encoding of the same geometry, populated when the host can
    /// produce one cheaply. Only the in-process (OGR) executor needs
    /// this (spec §4.8.3); SQL-backed executors work from `wkt`.
    pub wkb: Option<Vec<u8>>,
}

/// One target-layer feature considered by the in-process executor: its
/// primary-key value and WKB geometry (spec §4.8.3).
#[derive(Debug, Clone)]
pub struct TargetFeature {
    pub fid: i64,
    pub wkb: Vec<u8>,
}

/// Request describing which features of a layer to stage as source
/// geometries (spec §4.2): either all selected features, or all
/// features, optionally limited.
#[derive(Debug, Clone, Default)]
pub struct FeatureRequest {
    pub selected_only: bool,
    pub limit: Option<usize>,
}

/// A lightweight handle identifying a layer the host knows about. Kept
/// separate from [`LayerInfo`] because a handle is cheap to pass around
/// while `LayerInfo` carries the full descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerHandle(pub LayerId);

/// Abstraction over the desktop GIS application hosting the engine.
///
/// Implementors supply layer metadata, stream source geometries, and
/// receive the resulting filter subset string to apply back to a layer.
/// All operations are async because a host may proxy them across a
/// plugin boundary or a worker thread.
#[async_trait]
pub trait Host: Send + Sync + Debug {
    /// Lists every layer the host currently exposes to the engine.
    async fn list_layers(&self) -> EngineResult<Vec<LayerInfo>>;

    /// Fetches the descriptor for a single layer.
    async fn layer_info(&self, layer: &LayerHandle) -> EngineResult<LayerInfo>;

    /// Full extent of a layer, in its native CRS.
    async fn layer_extent(&self, layer: &LayerHandle) -> EngineResult<Option<Extent>>;

    /// Streams source geometries from `source_layer` per `request`,
    /// reprojected into `target_srid` (spec §4.2 C2). Callers that need
    /// the geometries in the layer's own native CRS pass that layer's
    /// native SRID, making this a no-op reprojection.
    async fn stage_geometries(
        &self,
        source_layer: &LayerHandle,
        request: &FeatureRequest,
        target_srid: i32,
    ) -> EngineResult<Vec<Geometry>>;

    /// Reprojects a single geometry into `dst_srid` (spec §4.2 step 1/4,
    /// §6 Host interface `transform`). Used by the OGR/in-process path,
    /// which has no SQL engine to embed `ST_Transform` in.
    async fn transform(&self, geometry: &Geometry, dst_srid: i32) -> EngineResult<Geometry>;

    /// Buffers a single geometry by `distance` in the geometry's own
    /// units (spec §4.2 step 3, §6 Host interface `buffer`).
    async fn buffer(
        &self,
        geometry: &Geometry,
        distance: f64,
        segments: u32,
        style: BufferStyle,
    ) -> EngineResult<Geometry>;

    /// Repairs a geometry's validity (spec §6 Host interface
    /// `make_valid`). Called after every dissolve and buffer.
    async fn make_valid(&self, geometry: &Geometry) -> EngineResult<Geometry>;

    /// True when the geometry has no area/length/points left, used to
    /// detect a negative buffer that erodes a geometry to nothing (spec
    /// §4.2 step 3 guard, §6 Host interface `is_empty`).
    async fn is_empty(&self, geometry: &Geometry) -> EngineResult<bool>;

    /// Dissolves multiple geometries into one (spec §4.2 step 2, §6
    /// Host interface `union`). Called only when more than one feature
    /// was staged; a single staged feature needs no union.
    async fn union_geometries(&self, geometries: &[Geometry]) -> EngineResult<Geometry>;

    /// Bounding box of a single geometry, used as a cheap two-phase
    /// planning input (spec §4.2 step 5, §4.7 progressive/bbox
    /// strategies).
    async fn geometry_extent(&self, geometry: &Geometry) -> EngineResult<Extent>;

    /// Applies a computed subset string to a layer, replacing any filter
    /// currently shown by the host's own provider (the final, visible
    /// effect of a `filter` call).
    async fn apply_subset(&self, layer: &LayerHandle, subset_sql: Option<&str>) -> EngineResult<()>;

    /// Current subset string the host is showing for a layer, if any.
    /// Used to compose with a combine operator (spec §4.8.1).
    async fn current_subset(&self, layer: &LayerHandle) -> EngineResult<Option<String>>;

    /// Fetches one chunk of target-layer features for the in-process
    /// executor (spec §4.8.3), already restricted by `attribute_filter`
    /// when given. Callers page through with increasing `offset` until
    /// a chunk shorter than `chunk_size` comes back.
    async fn target_feature_chunk(
        &self,
        layer: &LayerHandle,
        attribute_filter: Option<&str>,
        chunk_size: usize,
        offset: usize,
    ) -> EngineResult<Vec<TargetFeature>>;

    /// Pure, thread-safe geometry predicate test against two WKB blobs
    /// (spec §4.8.3: dispatched to worker threads, no engine-owned
    /// geometry library involved). Synchronous because it's run from
    /// plain `rayon` worker threads, not the async task.
    fn evaluate_spatial_predicate(&self, predicate: SpatialPredicate, source_wkb: &[u8], target_wkb: &[u8]) -> bool;

    /// Reports progress/abort-checkable work to the host's UI. The
    /// default implementation does nothing, for hosts with no progress
    /// surface (e.g. a headless CLI run).
    async fn report_progress(&self, _layer: &LayerHandle, _fraction: f64, _message: &str) {}

    /// Cooperative cancellation check, polled between plan steps.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Boxed host trait object, used wherever the engine stores a host
/// without needing to know its concrete type.
pub type BoxedHost = Box<dyn Host>;

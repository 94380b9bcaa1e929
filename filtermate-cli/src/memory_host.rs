//! An in-memory reference [`Host`] implementation.
//!
//! Ships as test/demo tooling for the `filtermate` CLI, not as a product
//! feature: the engine's Non-goals explicitly keep it out of geometry
//! work, so *something* still has to do real transform/buffer/predicate
//! math to exercise the engine end to end. This host uses the `geo`
//! crate's DE-9IM support for spatial predicates and bounding boxes,
//! which is correct; CRS transforms are a flat degrees/meters scale
//! factor and buffering is a bounding-box expansion, which are not.
//! Good enough to drive the orchestrator's staging/planning logic
//! through its paces; not a substitute for a real GIS engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::convex_hull::ConvexHull;
use geo::algorithm::map_coords::MapCoords;
use geo::algorithm::relate::Relate;
use geo_types::{Coord, Geometry as GeoGeometry, LineString, MultiPoint, MultiPolygon, Point, Polygon, Rect};
use tracing::debug;
use wkt::{ToWkt, TryFromWkt};

use filtermate_core::error::{EngineError, EngineResult};
use filtermate_core::geom::is_geographic_srid;
use filtermate_core::host::{FeatureRequest, Geometry, Host, LayerHandle, TargetFeature};
use filtermate_core::model::{BufferStyle, Extent, LayerId, LayerInfo, SpatialPredicate};

use crate::expr::{self, AttrValue, Row};

/// Meters-per-degree at the equator, the only conversion factor this
/// host knows: a stand-in for a real CRS transform (see module docs).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// One feature of a [`MemoryHost`] layer.
#[derive(Debug, Clone)]
pub struct MemoryFeature {
    pub fid: i64,
    pub attrs: BTreeMap<String, AttrValue>,
    pub geometry: GeoGeometry<f64>,
}

impl MemoryFeature {
    #[must_use]
    pub fn new(fid: i64, geometry: GeoGeometry<f64>) -> Self {
        MemoryFeature {
            fid,
            attrs: BTreeMap::new(),
            geometry,
        }
    }

    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }
}

impl Row for MemoryFeature {
    fn fid(&self) -> i64 {
        self.fid
    }

    fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }
}

#[derive(Debug)]
struct MemoryLayer {
    info: LayerInfo,
    features: Vec<MemoryFeature>,
    subset: Option<String>,
    selection: HashSet<i64>,
}

/// In-memory [`Host`]: every layer's features live in a plain `Vec`,
/// subset strings are interpreted in-process by [`crate::expr`], and the
/// engine always routes filters for these layers through its OGR
/// executor (`filtermate_core::model::Backend::Memory` layers are never
/// handled by the PostgreSQL/SpatiaLite backends).
#[derive(Debug, Default)]
pub struct MemoryHost {
    layers: RwLock<HashMap<LayerId, MemoryLayer>>,
    cancelled: AtomicBool,
}

impl MemoryHost {
    #[must_use]
    pub fn new() -> Self {
        MemoryHost::default()
    }

    /// Registers a layer with its features, replacing any prior layer
    /// with the same id.
    pub fn add_layer(&self, info: LayerInfo, features: Vec<MemoryFeature>) {
        let layer = MemoryLayer {
            info,
            features,
            subset: None,
            selection: HashSet::new(),
        };
        self.layers.write().expect("layers lock").insert(layer.info.layer_id.clone(), layer);
    }

    /// Marks `fids` as the host's current map selection for `layer_id`,
    /// the set `stage_geometries` reads when a request asks for
    /// `selected_only` features.
    pub fn select_features(&self, layer_id: &str, fids: impl IntoIterator<Item = i64>) {
        if let Some(layer) = self.layers.write().expect("layers lock").get_mut(layer_id) {
            layer.selection = fids.into_iter().collect();
        }
    }

    /// Current subset string applied to a layer, for demo output.
    #[must_use]
    pub fn subset_of(&self, layer_id: &str) -> Option<String> {
        self.layers.read().expect("layers lock").get(layer_id).and_then(|l| l.subset.clone())
    }

    /// Flips the cooperative-cancellation flag [`Host::is_cancelled`]
    /// reports, for exercising the engine's abort path.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn with_layer<T>(&self, layer_id: &str, f: impl FnOnce(&MemoryLayer) -> EngineResult<T>) -> EngineResult<T> {
        let layers = self.layers.read().expect("layers lock");
        let layer = layers.get(layer_id).ok_or_else(|| unknown_layer(layer_id))?;
        f(layer)
    }
}

fn unknown_layer(layer_id: &str) -> EngineError {
    EngineError::UnsupportedLayer {
        layer_id: layer_id.to_string(),
        reason: "no such layer registered with the in-memory host".to_string(),
    }
}

fn staging_failed(reason: impl Into<String>) -> EngineError {
    EngineError::GeometryStagingFailed {
        layer_id: String::new(),
        reason: reason.into(),
    }
}

fn geometry_to_wire(geom: &GeoGeometry<f64>, srid: i32) -> Geometry {
    Geometry {
        wkt: geom.wkt_string(),
        srid,
        wkb: Some(encode_geometry(geom)),
    }
}

/// Encodes a geometry as the opaque bytes this host's own `wkb` field
/// carries. Not real WKB: a private envelope only [`decode_geometry`]
/// ever reads back. The engine never inspects `wkb` itself (spec §1
/// Non-goals); it only round-trips it between `stage_geometries` and
/// `evaluate_spatial_predicate`.
fn encode_geometry(geom: &GeoGeometry<f64>) -> Vec<u8> {
    serde_json::to_vec(geom).unwrap_or_default()
}

fn decode_geometry(wkb: &[u8]) -> Option<GeoGeometry<f64>> {
    serde_json::from_slice(wkb).ok()
}

fn parse_wkt(wkt: &str) -> EngineResult<GeoGeometry<f64>> {
    GeoGeometry::<f64>::try_from_wkt_str(wkt).map_err(|e| staging_failed(format!("invalid WKT: {e}")))
}

fn bounds_to_extent(rect: Rect<f64>) -> Extent {
    Extent {
        xmin: rect.min().x,
        ymin: rect.min().y,
        xmax: rect.max().x,
        ymax: rect.max().y,
    }
}

fn expand_rect(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        Coord {
            x: a.min().x.min(b.min().x),
            y: a.min().y.min(b.min().y),
        },
        Coord {
            x: a.max().x.max(b.max().x),
            y: a.max().y.max(b.max().y),
        },
    )
}

fn is_geom_empty(geom: &GeoGeometry<f64>) -> bool {
    match geom {
        GeoGeometry::Point(_) | GeoGeometry::Line(_) | GeoGeometry::Rect(_) | GeoGeometry::Triangle(_) => false,
        GeoGeometry::LineString(ls) => ls.0.is_empty(),
        GeoGeometry::Polygon(p) => p.exterior().0.is_empty(),
        GeoGeometry::MultiPoint(mp) => mp.0.is_empty(),
        GeoGeometry::MultiLineString(mls) => mls.0.is_empty(),
        GeoGeometry::MultiPolygon(mp) => mp.0.is_empty(),
        GeoGeometry::GeometryCollection(gc) => gc.0.is_empty(),
    }
}

/// Reprojects `geom` from `src_srid` to `dst_srid`, per module docs: a
/// flat scale factor between "geographic" and "projected", not a real
/// transform.
fn reproject(geom: GeoGeometry<f64>, src_srid: i32, dst_srid: i32) -> GeoGeometry<f64> {
    if src_srid == dst_srid {
        return geom;
    }
    let factor = match (is_geographic_srid(src_srid), is_geographic_srid(dst_srid)) {
        (true, false) => METERS_PER_DEGREE,
        (false, true) => 1.0 / METERS_PER_DEGREE,
        _ => 1.0,
    };
    geom.map_coords(|c| Coord { x: c.x * factor, y: c.y * factor })
}

/// Expands (or shrinks, for a negative `distance`) a geometry's bounding
/// box by `distance` in every direction, per module docs: a rectangular
/// stand-in for a real buffer algorithm. A negative buffer that erodes
/// the box to nothing yields an empty geometry, matching the real
/// buffer's behavior the orchestrator's negative-buffer guard expects.
fn buffer_geometry(geom: &GeoGeometry<f64>, distance: f64) -> GeoGeometry<f64> {
    let Some(rect) = geom.bounding_rect() else {
        return geom.clone();
    };
    let (xmin, ymin) = (rect.min().x - distance, rect.min().y - distance);
    let (xmax, ymax) = (rect.max().x + distance, rect.max().y + distance);
    if xmax <= xmin || ymax <= ymin {
        return GeoGeometry::MultiPolygon(MultiPolygon::new(Vec::new()));
    }
    let ring = LineString::from(vec![(xmin, ymin), (xmax, ymin), (xmax, ymax), (xmin, ymax), (xmin, ymin)]);
    GeoGeometry::Polygon(Polygon::new(ring, Vec::new()))
}

fn collect_coords(geom: &GeoGeometry<f64>, out: &mut Vec<Coord<f64>>) {
    match geom {
        GeoGeometry::Point(p) => out.push(p.0),
        GeoGeometry::Line(l) => out.extend([l.start, l.end]),
        GeoGeometry::LineString(ls) => out.extend(ls.0.iter().copied()),
        GeoGeometry::Polygon(p) => {
            out.extend(p.exterior().0.iter().copied());
            for interior in p.interiors() {
                out.extend(interior.0.iter().copied());
            }
        }
        GeoGeometry::MultiPoint(mp) => out.extend(mp.0.iter().map(|p| p.0)),
        GeoGeometry::MultiLineString(mls) => {
            for ls in &mls.0 {
                out.extend(ls.0.iter().copied());
            }
        }
        GeoGeometry::MultiPolygon(mp) => {
            for polygon in &mp.0 {
                out.extend(polygon.exterior().0.iter().copied());
            }
        }
        GeoGeometry::GeometryCollection(gc) => {
            for g in &gc.0 {
                collect_coords(g, out);
            }
        }
        GeoGeometry::Rect(r) => out.extend([r.min(), r.max()]),
        GeoGeometry::Triangle(t) => out.extend([t.0, t.1, t.2]),
    }
}

#[async_trait]
impl Host for MemoryHost {
    async fn list_layers(&self) -> EngineResult<Vec<LayerInfo>> {
        Ok(self.layers.read().expect("layers lock").values().map(|l| l.info.clone()).collect())
    }

    async fn layer_info(&self, layer: &LayerHandle) -> EngineResult<LayerInfo> {
        self.with_layer(&layer.0, |l| Ok(l.info.clone()))
    }

    async fn layer_extent(&self, layer: &LayerHandle) -> EngineResult<Option<Extent>> {
        self.with_layer(&layer.0, |l| {
            let combined = l.features.iter().filter_map(|f| f.geometry.bounding_rect()).reduce(expand_rect);
            Ok(combined.map(bounds_to_extent))
        })
    }

    async fn stage_geometries(
        &self,
        source_layer: &LayerHandle,
        request: &FeatureRequest,
        target_srid: i32,
    ) -> EngineResult<Vec<Geometry>> {
        let (native_srid, staged) = self.with_layer(&source_layer.0, |l| {
            let native_srid = l.info.srid();
            let mut selected: Vec<&MemoryFeature> = if request.selected_only {
                l.features.iter().filter(|f| l.selection.contains(&f.fid)).collect()
            } else {
                l.features.iter().collect()
            };
            if let Some(limit) = request.limit {
                selected.truncate(limit);
            }
            Ok((native_srid, selected.into_iter().map(|f| f.geometry.clone()).collect::<Vec<_>>()))
        })?;

        Ok(staged
            .into_iter()
            .map(|g| geometry_to_wire(&reproject(g, native_srid, target_srid), target_srid))
            .collect())
    }

    async fn transform(&self, geometry: &Geometry, dst_srid: i32) -> EngineResult<Geometry> {
        let geom = parse_wkt(&geometry.wkt)?;
        Ok(geometry_to_wire(&reproject(geom, geometry.srid, dst_srid), dst_srid))
    }

    async fn buffer(&self, geometry: &Geometry, distance: f64, _segments: u32, _style: BufferStyle) -> EngineResult<Geometry> {
        let geom = parse_wkt(&geometry.wkt)?;
        Ok(geometry_to_wire(&buffer_geometry(&geom, distance), geometry.srid))
    }

    async fn make_valid(&self, geometry: &Geometry) -> EngineResult<Geometry> {
        // This host never produces invalid geometry (no buffer/union path
        // self-intersects), so make_valid is a round trip through the
        // parser: good enough to catch a malformed WKT, nothing to repair.
        let geom = parse_wkt(&geometry.wkt)?;
        Ok(geometry_to_wire(&geom, geometry.srid))
    }

    async fn is_empty(&self, geometry: &Geometry) -> EngineResult<bool> {
        let geom = parse_wkt(&geometry.wkt)?;
        Ok(is_geom_empty(&geom))
    }

    async fn union_geometries(&self, geometries: &[Geometry]) -> EngineResult<Geometry> {
        let srid = geometries.first().map(|g| g.srid).unwrap_or(4326);
        let mut coords = Vec::new();
        for g in geometries {
            collect_coords(&parse_wkt(&g.wkt)?, &mut coords);
        }
        if coords.is_empty() {
            return Err(staging_failed("no coordinates to dissolve"));
        }
        // A convex hull stands in for a real dissolve/union: it covers
        // every input point, which is all the orchestrator's downstream
        // bbox/predicate checks need from a staged source geometry.
        let hull = MultiPoint::new(coords.into_iter().map(Point).collect()).convex_hull();
        Ok(geometry_to_wire(&GeoGeometry::Polygon(hull), srid))
    }

    async fn geometry_extent(&self, geometry: &Geometry) -> EngineResult<Extent> {
        let geom = parse_wkt(&geometry.wkt)?;
        geom.bounding_rect().map(bounds_to_extent).ok_or_else(|| staging_failed("geometry has no bounding box"))
    }

    async fn apply_subset(&self, layer: &LayerHandle, subset_sql: Option<&str>) -> EngineResult<()> {
        let mut layers = self.layers.write().expect("layers lock");
        let entry = layers.get_mut(&layer.0).ok_or_else(|| unknown_layer(&layer.0))?;
        entry.subset = subset_sql.map(str::to_string);
        Ok(())
    }

    async fn current_subset(&self, layer: &LayerHandle) -> EngineResult<Option<String>> {
        self.with_layer(&layer.0, |l| Ok(l.subset.clone()))
    }

    async fn target_feature_chunk(
        &self,
        layer: &LayerHandle,
        attribute_filter: Option<&str>,
        chunk_size: usize,
        offset: usize,
    ) -> EngineResult<Vec<TargetFeature>> {
        self.with_layer(&layer.0, |l| {
            let matching: Vec<&MemoryFeature> = l
                .features
                .iter()
                .filter(|f| attribute_filter.is_none_or(|e| expr::eval(e, *f)))
                .collect();
            Ok(matching
                .into_iter()
                .skip(offset)
                .take(chunk_size)
                .map(|f| TargetFeature {
                    fid: f.fid,
                    wkb: encode_geometry(&f.geometry),
                })
                .collect())
        })
    }

    fn evaluate_spatial_predicate(&self, predicate: SpatialPredicate, source_wkb: &[u8], target_wkb: &[u8]) -> bool {
        let (Some(source), Some(target)) = (decode_geometry(source_wkb), decode_geometry(target_wkb)) else {
            return false;
        };
        let matrix = source.relate(&target);
        match predicate {
            SpatialPredicate::Intersects => matrix.is_intersects(),
            SpatialPredicate::Within => matrix.is_within(),
            SpatialPredicate::Contains => matrix.is_contains(),
            SpatialPredicate::Overlaps => matrix.is_overlaps(),
            SpatialPredicate::Touches => matrix.is_touches(),
            SpatialPredicate::Crosses => matrix.is_crosses(),
            SpatialPredicate::Disjoint => matrix.is_disjoint(),
            SpatialPredicate::Equals => matrix.is_equal_topo(),
        }
    }

    async fn report_progress(&self, layer: &LayerHandle, fraction: f64, message: &str) {
        debug!(layer = %layer.0, progress = fraction, %message, "filter progress");
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wkt::TryFromWkt as _;

    fn point_layer(id: &str, points: &[(i64, f64, f64)]) -> (LayerInfo, Vec<MemoryFeature>) {
        let info = LayerInfo {
            layer_id: id.to_string(),
            name: id.to_string(),
            provider: filtermate_core::model::Backend::Memory,
            schema: None,
            table: None,
            geometry_column: None,
            pk_name: Some("fid".to_string()),
            pk_numeric: true,
            crs_authid: "EPSG:4326".to_string(),
            feature_count: points.len() as u64,
            extent: None,
            geometry_type: Some("Point".to_string()),
            has_spatial_index: false,
        };
        let features = points
            .iter()
            .map(|(fid, x, y)| MemoryFeature::new(*fid, GeoGeometry::Point(Point::new(*x, *y))))
            .collect();
        (info, features)
    }

    #[tokio::test]
    async fn list_and_fetch_layer_info() {
        let host = MemoryHost::new();
        let (info, features) = point_layer("points", &[(1, 0.0, 0.0)]);
        host.add_layer(info.clone(), features);

        let layers = host.list_layers().await.expect("list");
        assert_eq!(layers.len(), 1);

        let fetched = host.layer_info(&LayerHandle("points".to_string())).await.expect("info");
        assert_eq!(fetched.layer_id, info.layer_id);
    }

    #[tokio::test]
    async fn unknown_layer_is_an_error() {
        let host = MemoryHost::new();
        let result = host.layer_info(&LayerHandle("missing".to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn layer_extent_unions_feature_bboxes() {
        let host = MemoryHost::new();
        let (info, features) = point_layer("points", &[(1, -1.0, -1.0), (2, 2.0, 3.0)]);
        host.add_layer(info, features);

        let extent = host.layer_extent(&LayerHandle("points".to_string())).await.expect("extent").expect("some");
        assert_eq!(extent.xmin, -1.0);
        assert_eq!(extent.ymax, 3.0);
    }

    #[tokio::test]
    async fn stage_geometries_honors_selection_and_limit() {
        let host = MemoryHost::new();
        let (info, features) = point_layer("points", &[(1, 0.0, 0.0), (2, 1.0, 1.0), (3, 2.0, 2.0)]);
        host.add_layer(info, features);
        host.select_features("points", [1, 3]);

        let handle = LayerHandle("points".to_string());
        let selected = host
            .stage_geometries(&handle, &FeatureRequest { selected_only: true, limit: None }, 4326)
            .await
            .expect("stage");
        assert_eq!(selected.len(), 2);

        let limited = host
            .stage_geometries(&handle, &FeatureRequest { selected_only: false, limit: Some(2) }, 4326)
            .await
            .expect("stage");
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn transform_scales_geographic_to_projected() {
        let host = MemoryHost::new();
        let geometry = Geometry {
            wkt: "POINT(1 1)".to_string(),
            srid: 4326,
            wkb: None,
        };
        let transformed = host.transform(&geometry, 3857).await.expect("transform");
        let geom = GeoGeometry::<f64>::try_from_wkt_str(&transformed.wkt).expect("parse");
        let GeoGeometry::Point(p) = geom else { panic!("expected point") };
        assert!((p.x() - METERS_PER_DEGREE).abs() < 1e-6);
    }

    #[tokio::test]
    async fn buffer_expands_bbox_and_negative_buffer_can_empty_it() {
        let host = MemoryHost::new();
        let geometry = Geometry {
            wkt: "POINT(0 0)".to_string(),
            srid: 3857,
            wkb: None,
        };
        let buffered = host.buffer(&geometry, 5.0, 8, BufferStyle::Round).await.expect("buffer");
        assert!(!host.is_empty(&buffered).await.expect("is_empty"));

        let eroded = host.buffer(&buffered, -100.0, 8, BufferStyle::Round).await.expect("buffer");
        assert!(host.is_empty(&eroded).await.expect("is_empty"));
    }

    #[tokio::test]
    async fn union_geometries_covers_every_input_point() {
        let host = MemoryHost::new();
        let inputs = vec![
            Geometry { wkt: "POINT(0 0)".to_string(), srid: 4326, wkb: None },
            Geometry { wkt: "POINT(2 0)".to_string(), srid: 4326, wkb: None },
            Geometry { wkt: "POINT(1 2)".to_string(), srid: 4326, wkb: None },
        ];
        let unioned = host.union_geometries(&inputs).await.expect("union");
        let extent = host.geometry_extent(&unioned).await.expect("extent");
        assert_eq!(extent.xmin, 0.0);
        assert_eq!(extent.xmax, 2.0);
        assert_eq!(extent.ymax, 2.0);
    }

    #[test]
    fn evaluate_spatial_predicate_round_trips_through_wkb() {
        let host = MemoryHost::new();
        let a = GeoGeometry::<f64>::try_from_wkt_str("POLYGON((0 0, 4 0, 4 4, 0 4, 0 0))").expect("parse");
        let b = GeoGeometry::<f64>::try_from_wkt_str("POINT(2 2)").expect("parse");
        let wkb_a = encode_geometry(&a);
        let wkb_b = encode_geometry(&b);
        assert!(host.evaluate_spatial_predicate(SpatialPredicate::Contains, &wkb_a, &wkb_b));
        assert!(!host.evaluate_spatial_predicate(SpatialPredicate::Disjoint, &wkb_a, &wkb_b));
    }

    #[tokio::test]
    async fn apply_and_read_back_subset() {
        let host = MemoryHost::new();
        let (info, features) = point_layer("points", &[(1, 0.0, 0.0)]);
        host.add_layer(info, features);
        let handle = LayerHandle("points".to_string());

        host.apply_subset(&handle, Some("\"fid\" = 1")).await.expect("apply");
        assert_eq!(host.current_subset(&handle).await.expect("subset"), Some("\"fid\" = 1".to_string()));
    }

    #[tokio::test]
    async fn target_feature_chunk_filters_and_pages() {
        let host = MemoryHost::new();
        let (info, mut features) = point_layer("points", &[(1, 0.0, 0.0), (2, 1.0, 1.0), (3, 2.0, 2.0)]);
        features[1] = features[1].clone().with_attr("kind", AttrValue::Text("keep".to_string()));
        features[2] = features[2].clone().with_attr("kind", AttrValue::Text("keep".to_string()));
        host.add_layer(info, features);
        let handle = LayerHandle("points".to_string());

        let first_page = host
            .target_feature_chunk(&handle, Some("\"kind\" = 'keep'"), 1, 0)
            .await
            .expect("chunk");
        assert_eq!(first_page.len(), 1);
        assert_eq!(first_page[0].fid, 2);

        let second_page = host
            .target_feature_chunk(&handle, Some("\"kind\" = 'keep'"), 1, 1)
            .await
            .expect("chunk");
        assert_eq!(second_page[0].fid, 3);
    }

    #[test]
    fn cancellation_flag_round_trips() {
        let host = MemoryHost::new();
        assert!(!host.is_cancelled());
        host.cancel();
        assert!(host.is_cancelled());
    }
}

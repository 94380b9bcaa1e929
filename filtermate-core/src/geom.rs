//! CRS and geometry staging (C2).
//!
//! The engine never implements geometry algorithms itself (spec §1
//! Non-goals): transform, buffer, union, `make_valid`, `wkt`/`wkb` are
//! all delegated to the [`crate::host::Host`] the way tile sources here
//! delegate raw pixel decoding to format-specific codec crates. This
//! module only decides *which* transform/buffer sequence to run and in
//! what order.

use crate::error::{EngineError, EngineResult};
use crate::host::{FeatureRequest, Geometry, Host, LayerHandle};
use crate::model::{BufferStyle, Extent};

/// EPSG code the engine reprojects into for buffer-in-meters math when
/// the source CRS is geographic.
pub const METRIC_DETOUR_SRID: i32 = 3857;

/// A geographic CRS is recognized by an EPSG code in `4000..5000`,
/// following the convention used throughout geodetic EPSG numbering.
#[must_use]
pub fn is_geographic_srid(srid: i32) -> bool {
    (4000..5000).contains(&srid)
}

/// Plan describing which reprojection, if any, must happen before and
/// after a buffer is computed (spec §4.2 step 1 and step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprojectionPlan {
    /// No reprojection needed; buffer (if any) runs in the native CRS.
    Native,
    /// Detour through a metric CRS for buffer math, then transform back.
    MetricDetour { detour_srid: i32, native_srid: i32 },
}

impl ReprojectionPlan {
    /// Decides the plan for a source CRS and a requested buffer value.
    ///
    /// A zero buffer never needs a detour: there's nothing to measure in
    /// meters.
    #[must_use]
    pub fn decide(source_srid: i32, buffer_value: f64) -> Self {
        if buffer_value != 0.0 && is_geographic_srid(source_srid) {
            ReprojectionPlan::MetricDetour {
                detour_srid: METRIC_DETOUR_SRID,
                native_srid: source_srid,
            }
        } else {
            ReprojectionPlan::Native
        }
    }
}

/// Options controlling how a buffer is emitted into SQL.
#[derive(Debug, Clone, Copy)]
pub struct BufferOptions {
    pub value: f64,
    pub style: BufferStyle,
    pub segments: u32,
}

impl BufferOptions {
    #[must_use]
    pub fn endcap_args(&self) -> String {
        format!("quad_segs={} endcap={}", self.segments, self.style.endcap_name())
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.value < 0.0
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.value == 0.0
    }
}

/// Staged source geometry ready for encoding (C3) or direct embedding.
#[derive(Debug, Clone)]
pub struct StagedGeometry {
    pub wkt: String,
    pub srid: i32,
    pub bbox: Extent,
    pub feature_count: usize,
}

/// Wraps a buffered geometry SQL fragment with the mandatory
/// `ST_MakeValid`/`ST_IsEmpty` guard for negative buffers (spec §4.2
/// step 3, §6 wire surface, §8 invariant).
///
/// Positive and zero buffers only need `ST_MakeValid`, never the guard:
/// a non-negative buffer cannot legitimately vanish, so forcing a NULL
/// branch there would hide a real staging bug instead of a known
/// PostGIS/SpatiaLite edge case.
#[must_use]
pub fn wrap_buffered_geometry(buffered_sql: &str, buffer_value: f64) -> String {
    if buffer_value < 0.0 {
        format!(
            "CASE WHEN ST_IsEmpty(ST_MakeValid({buffered_sql})) THEN NULL ELSE ST_MakeValid({buffered_sql}) END"
        )
    } else {
        format!("ST_MakeValid({buffered_sql})")
    }
}

/// Applies the reprojection-detour / buffer / negative-buffer-guard
/// stack to an arbitrary geometry SQL expression `base` already known
/// to be valid and in `native_srid` (spec §4.2 steps 1-4), then a final
/// reprojection into `final_srid` when it differs from `native_srid` —
/// the target layer's predicate must compare geometries in the same
/// SRID as its own geometry column.
///
/// Shared by [`build_staging_sql`] (base = a `ST_GeomFromText` literal)
/// and the EXISTS-subquery encoding in [`crate::encoder`] (base = a
/// live source-table column reference): both need the identical
/// buffer/guard/reproject order, just rooted at a different geometry
/// expression.
#[must_use]
pub fn apply_buffer_stack(base: &str, native_srid: i32, buffer: Option<BufferOptions>, final_srid: i32) -> String {
    let staged = match buffer.filter(|b| !b.is_noop()) {
        None => base.to_string(),
        Some(buffer) => match ReprojectionPlan::decide(native_srid, buffer.value) {
            ReprojectionPlan::Native => {
                let buffered = format!("ST_Buffer({base}, {}, '{}')", buffer.value, buffer.endcap_args());
                wrap_buffered_geometry(&buffered, buffer.value)
            }
            ReprojectionPlan::MetricDetour {
                detour_srid,
                native_srid,
            } => {
                let transformed = format!("ST_Transform({base}, {detour_srid})");
                let buffered = format!(
                    "ST_Buffer({transformed}, {}, '{}')",
                    buffer.value,
                    buffer.endcap_args()
                );
                let guarded = wrap_buffered_geometry(&buffered, buffer.value);
                format!("ST_Transform({guarded}, {native_srid})")
            }
        },
    };

    if final_srid == native_srid {
        staged
    } else {
        format!("ST_Transform({staged}, {final_srid})")
    }
}

/// Builds the full staging SQL expression for a literal source geometry
/// (used by the literal-WKT encoding path in C3): wraps `wkt` in
/// `ST_MakeValid(ST_GeomFromText(...))` and runs it through
/// [`apply_buffer_stack`].
#[must_use]
pub fn build_staging_sql(wkt: &str, native_srid: i32, buffer: Option<BufferOptions>, final_srid: i32) -> String {
    let base = format!("ST_MakeValid(ST_GeomFromText('{wkt}', {native_srid}))");
    apply_buffer_stack(&base, native_srid, buffer, final_srid)
}

/// Computes a bounding box WKT-free from a set of `[Geometry]` staged by
/// the Host; the Host hands back WKB/WKT and bbox data already unioned,
/// so this just validates the dissolve produced something non-empty.
pub fn require_nonempty_union(
    layer_id: &str,
    geometries: &[Geometry],
) -> EngineResult<()> {
    if geometries.is_empty() {
        return Err(EngineError::GeometryStagingFailed {
            layer_id: layer_id.to_string(),
            reason: "no source features to stage".to_string(),
        });
    }
    Ok(())
}

/// Dissolves the selected features of a source layer into one geometry,
/// staged in the source layer's own (native) CRS (spec §4.2 steps 1-2).
///
/// The dissolve itself is delegated to the Host (`union_geometries`);
/// this function only orders the calls and validates the result is
/// non-empty. Buffering and the final reprojection into a target
/// layer's CRS happen downstream, either in generated SQL
/// ([`build_staging_sql`]) or, for backends with no SQL engine behind
/// them, via [`stage_buffered_geometry_for_ogr`].
pub async fn stage_union(
    host: &dyn Host,
    handle: &LayerHandle,
    request: &FeatureRequest,
    native_srid: i32,
    layer_id: &str,
) -> EngineResult<StagedGeometry> {
    let geometries = host.stage_geometries(handle, request, native_srid).await?;
    require_nonempty_union(layer_id, &geometries)?;
    let feature_count = geometries.len();

    let unioned = if geometries.len() == 1 {
        geometries.into_iter().next().expect("checked non-empty above")
    } else {
        host.union_geometries(&geometries).await?
    };
    let bbox = host.geometry_extent(&unioned).await?;

    Ok(StagedGeometry {
        wkt: unioned.wkt,
        srid: native_srid,
        bbox,
        feature_count,
    })
}

/// Computes the real buffered, reprojected geometry for the OGR/in-process
/// backend, which has no SQL engine to embed [`build_staging_sql`] in and
/// so must ask the Host to perform transform/buffer/`make_valid` itself.
///
/// Mirrors the SQL path's step order: detour to a metric CRS only when
/// the source CRS is geographic and the buffer is non-zero, buffer,
/// `make_valid`, then transform into `final_srid`.
pub async fn stage_buffered_geometry_for_ogr(
    host: &dyn Host,
    staged: &StagedGeometry,
    buffer: Option<BufferOptions>,
    final_srid: i32,
) -> EngineResult<Geometry> {
    let base = Geometry {
        wkt: staged.wkt.clone(),
        srid: staged.srid,
        wkb: None,
    };

    let mut geometry = match buffer.filter(|b| !b.is_noop()) {
        None => host.make_valid(&base).await?,
        Some(buffer) => {
            let plan = ReprojectionPlan::decide(staged.srid, buffer.value);
            let to_buffer = match plan {
                ReprojectionPlan::Native => base,
                ReprojectionPlan::MetricDetour { detour_srid, .. } => host.transform(&base, detour_srid).await?,
            };
            let mut buffered = host
                .buffer(&to_buffer, buffer.value, buffer.segments, buffer.style)
                .await?;
            buffered = host.make_valid(&buffered).await?;
            if let ReprojectionPlan::MetricDetour { native_srid, .. } = plan {
                buffered = host.transform(&buffered, native_srid).await?;
            }
            buffered
        }
    };

    if geometry.srid != final_srid {
        geometry = host.transform(&geometry, final_srid).await?;
    }
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geographic_srid_detection() {
        assert!(is_geographic_srid(4326));
        assert!(!is_geographic_srid(2154));
        assert!(!is_geographic_srid(3857));
    }

    #[test]
    fn zero_buffer_skips_detour() {
        assert_eq!(ReprojectionPlan::decide(4326, 0.0), ReprojectionPlan::Native);
    }

    #[test]
    fn geographic_nonzero_buffer_detours() {
        assert_eq!(
            ReprojectionPlan::decide(4326, 50.0),
            ReprojectionPlan::MetricDetour {
                detour_srid: 3857,
                native_srid: 4326
            }
        );
    }

    #[test]
    fn projected_crs_never_detours() {
        assert_eq!(ReprojectionPlan::decide(2154, -50.0), ReprojectionPlan::Native);
    }

    #[test]
    fn negative_buffer_gets_guard() {
        let sql = wrap_buffered_geometry("ST_Buffer(g, -5, '')", -5.0);
        assert!(sql.contains("ST_IsEmpty"));
        assert!(sql.contains("ST_MakeValid"));
    }

    #[test]
    fn positive_buffer_has_no_guard() {
        let sql = wrap_buffered_geometry("ST_Buffer(g, 5, '')", 5.0);
        assert!(!sql.contains("ST_IsEmpty"));
    }

    #[test]
    fn negative_buffer_on_geographic_crs_round_trips_srid() {
        let sql = build_staging_sql(
            "POINT(1 1)",
            4326,
            Some(BufferOptions {
                value: -50.0,
                style: BufferStyle::Round,
                segments: 5,
            }),
            4326,
        );
        assert!(sql.starts_with("ST_Transform("));
        assert!(sql.ends_with(", 4326)"));
        assert!(sql.contains("ST_Transform(ST_MakeValid(ST_GeomFromText('POINT(1 1)', 4326)), 3857)"));
        assert!(sql.contains("ST_IsEmpty"));
    }

    #[test]
    fn differing_final_srid_adds_trailing_transform() {
        let sql = build_staging_sql("POINT(1 1)", 2154, None, 4326);
        assert!(sql.starts_with("ST_Transform("));
        assert!(sql.ends_with(", 4326)"));
    }

    #[test]
    fn empty_source_features_fail_staging() {
        assert!(require_nonempty_union("layer1", &[]).is_err());
    }
}

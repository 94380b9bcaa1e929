//! The demo binary's input format: a JSON description of a handful of
//! in-memory layers plus the one `filter` call to run against them.
//!
//! Not part of the engine itself — `filtermate-core` never reads JSON
//! (spec SPEC_FULL.md §A: the engine is a library an application embeds)
//! — this is purely the `filtermate` binary's own harness for driving
//! [`crate::memory_host::MemoryHost`] without writing Rust.

use std::collections::BTreeMap;

use filtermate_core::model::{Backend, BufferStyle, CombineOperator, LayerId, LayerInfo, SpatialPredicate};
use filtermate_core::orchestrator::{BufferRequest, FilterRequest, SourceSpec};
use geo_types::Geometry as GeoGeometry;
use serde::Deserialize;
use wkt::TryFromWkt;

use crate::expr::AttrValue;
use crate::memory_host::{MemoryFeature, MemoryHost};

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub layers: Vec<ScenarioLayer>,
    pub request: ScenarioRequest,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioLayer {
    pub layer_id: LayerId,
    pub name: String,
    #[serde(default = "default_pk_name")]
    pub pk_name: String,
    pub crs_authid: String,
    pub geometry_type: Option<String>,
    pub features: Vec<ScenarioFeature>,
    #[serde(default)]
    pub selection: Vec<i64>,
}

fn default_pk_name() -> String {
    "fid".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ScenarioFeature {
    pub fid: i64,
    pub wkt: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioSource {
    Fids(Vec<i64>),
    Expression(String),
}

#[derive(Debug, Deserialize)]
pub struct ScenarioBuffer {
    pub value: f64,
    #[serde(default)]
    pub style: BufferStyle,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioRequest {
    pub source_layer: LayerId,
    pub source: ScenarioSource,
    pub source_combine_operator: Option<CombineOperator>,
    pub target_layers: Vec<LayerId>,
    pub predicates: Vec<SpatialPredicate>,
    pub buffer: Option<ScenarioBuffer>,
    pub attribute_filter: Option<String>,
    #[serde(default)]
    pub combine_operators: BTreeMap<LayerId, CombineOperator>,
    pub description: Option<String>,
}

/// Error building a [`MemoryHost`]/[`FilterRequest`] pair from a scenario
/// file: a malformed WKT literal or a `request` referencing a layer
/// `layers` never defined.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("layer {layer_id:?} feature {fid}: invalid WKT: {reason}")]
    InvalidWkt { layer_id: LayerId, fid: i64, reason: String },
    #[error("request references undefined layer {0:?}")]
    UnknownLayer(LayerId),
}

fn to_attr_value(value: &serde_json::Value) -> AttrValue {
    match value {
        serde_json::Value::Null => AttrValue::Null,
        serde_json::Value::Bool(b) => AttrValue::Number(if *b { 1.0 } else { 0.0 }),
        serde_json::Value::Number(n) => AttrValue::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => AttrValue::Text(s.clone()),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => AttrValue::Text(value.to_string()),
    }
}

fn layer_info(layer: &ScenarioLayer) -> LayerInfo {
    LayerInfo {
        layer_id: layer.layer_id.clone(),
        name: layer.name.clone(),
        provider: Backend::Memory,
        schema: None,
        table: None,
        geometry_column: None,
        pk_name: Some(layer.pk_name.clone()),
        pk_numeric: true,
        crs_authid: layer.crs_authid.clone(),
        feature_count: layer.features.len() as u64,
        extent: None,
        geometry_type: layer.geometry_type.clone(),
        has_spatial_index: false,
    }
}

/// Builds the [`MemoryHost`] a scenario describes, along with every
/// layer's [`LayerInfo`] by id so [`build_request`] can assemble a
/// [`FilterRequest`] without a second host round trip.
pub fn build_host(scenario: &Scenario) -> Result<(MemoryHost, BTreeMap<LayerId, LayerInfo>), ScenarioError> {
    let host = MemoryHost::new();
    let mut infos = BTreeMap::new();

    for layer in &scenario.layers {
        let info = layer_info(layer);
        let mut features = Vec::with_capacity(layer.features.len());
        for feature in &layer.features {
            let geometry = GeoGeometry::<f64>::try_from_wkt_str(&feature.wkt).map_err(|e| ScenarioError::InvalidWkt {
                layer_id: layer.layer_id.clone(),
                fid: feature.fid,
                reason: e.to_string(),
            })?;
            let mut memory_feature = MemoryFeature::new(feature.fid, geometry);
            for (name, value) in &feature.attrs {
                memory_feature = memory_feature.with_attr(name.clone(), to_attr_value(value));
            }
            features.push(memory_feature);
        }
        host.add_layer(info.clone(), features);
        if !layer.selection.is_empty() {
            host.select_features(&layer.layer_id, layer.selection.iter().copied());
        }
        infos.insert(layer.layer_id.clone(), info);
    }

    Ok((host, infos))
}

/// Assembles the one [`FilterRequest`] a scenario describes, resolving
/// every layer id it names against `infos` (built by [`build_host`]).
pub fn build_request(scenario: &Scenario, infos: &BTreeMap<LayerId, LayerInfo>) -> Result<FilterRequest, ScenarioError> {
    let request = &scenario.request;
    let source_layer = infos.get(&request.source_layer).cloned().ok_or_else(|| ScenarioError::UnknownLayer(request.source_layer.clone()))?;

    let mut target_layers = Vec::with_capacity(request.target_layers.len());
    for id in &request.target_layers {
        target_layers.push(infos.get(id).cloned().ok_or_else(|| ScenarioError::UnknownLayer(id.clone()))?);
    }

    let source = match &request.source {
        ScenarioSource::Fids(fids) => SourceSpec::Fids(fids.clone()),
        ScenarioSource::Expression(expr) => SourceSpec::Expression(expr.clone()),
    };

    Ok(FilterRequest {
        source_layer,
        source,
        source_combine_operator: request.source_combine_operator,
        target_layers,
        predicates: request.predicates.clone(),
        buffer: request.buffer.as_ref().map(|b| BufferRequest { value: b.value, style: b.style }),
        attribute_filter: request.attribute_filter.clone(),
        combine_operators: request.combine_operators.clone().into_iter().collect(),
        description: request.description.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_scenario() -> Scenario {
        serde_json::from_str(indoc::indoc! {r#"
            {
              "layers": [
                {
                  "layer_id": "buildings",
                  "name": "Buildings",
                  "crs_authid": "EPSG:4326",
                  "features": [
                    {"fid": 1, "wkt": "POINT(0 0)", "attrs": {"kind": "house"}},
                    {"fid": 2, "wkt": "POINT(5 5)", "attrs": {"kind": "shed"}}
                  ]
                },
                {
                  "layer_id": "parcels",
                  "name": "Parcels",
                  "crs_authid": "EPSG:4326",
                  "features": [
                    {"fid": 10, "wkt": "POLYGON((-1 -1, 1 -1, 1 1, -1 1, -1 -1))"}
                  ]
                }
              ],
              "request": {
                "source_layer": "buildings",
                "source": {"fids": [1]},
                "source_combine_operator": null,
                "target_layers": ["parcels"],
                "predicates": ["intersects"],
                "buffer": null,
                "attribute_filter": null,
                "combine_operators": {},
                "description": "demo run"
              }
            }
        "#})
        .expect("valid scenario json")
    }

    #[test]
    fn builds_host_with_every_layer_and_feature() {
        let scenario = sample_scenario();
        let (host, infos) = build_host(&scenario).expect("build host");
        assert_eq!(infos.len(), 2);
        let layers = futures_lite_block_on(host.list_layers());
        assert_eq!(layers.expect("list").len(), 2);
    }

    #[test]
    fn builds_request_resolving_layer_ids() {
        let scenario = sample_scenario();
        let (_host, infos) = build_host(&scenario).expect("build host");
        let request = build_request(&scenario, &infos).expect("build request");
        assert_eq!(request.source_layer.layer_id, "buildings");
        assert_eq!(request.target_layers.len(), 1);
        assert_eq!(request.predicates, vec![SpatialPredicate::Intersects]);
    }

    #[test]
    fn unknown_target_layer_is_rejected() {
        let mut scenario = sample_scenario();
        scenario.request.target_layers.push("missing".to_string());
        let (_host, infos) = build_host(&scenario).expect("build host");
        assert!(build_request(&scenario, &infos).is_err());
    }

    /// Tiny inline async runner so these tests don't need a `#[tokio::test]`
    /// just to await a single infallible host call.
    fn futures_lite_block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().build().expect("runtime").block_on(future)
    }
}

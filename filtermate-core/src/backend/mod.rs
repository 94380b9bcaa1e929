//! Backend executors (C8): one impl per provider, selected by
//! [`crate::model::Backend`].

pub mod port;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "spatialite")]
pub mod spatialite;

pub mod ogr;

use std::collections::HashMap;
use std::sync::Arc;

pub use port::{ApplyOutcome, ApplyRequest, Backend};

use crate::error::{EngineError, EngineResult};
use crate::model::{Backend as BackendKind, LayerInfo};

/// Registry of one executor per provider (spec §4.8), with a forced-
/// backend override the orchestrator fills in after a PostgreSQL/
/// SpatiaLite backend reports a timeout or cancellation (spec §7,
/// [`crate::error::EngineError::should_force_ogr_fallback`]).
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("providers", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: BackendKind, backend: Arc<dyn Backend>) {
        self.backends.insert(kind, backend);
    }

    /// Picks the executor for `layer`, honoring `forced` (the OGR-
    /// fallback override) over the layer's own provider, and falling
    /// further back to the OGR executor when the chosen one doesn't
    /// actually support the layer.
    pub fn resolve(&self, layer: &LayerInfo, forced: Option<BackendKind>) -> EngineResult<Arc<dyn Backend>> {
        let wanted = forced.unwrap_or(layer.provider);
        if let Some(backend) = self.backends.get(&wanted) {
            if backend.supports_layer(layer) {
                return Ok(Arc::clone(backend));
            }
        }
        if wanted != BackendKind::Ogr {
            if let Some(ogr) = self.backends.get(&BackendKind::Ogr) {
                if ogr.supports_layer(layer) {
                    return Ok(Arc::clone(ogr));
                }
            }
        }
        Err(EngineError::UnsupportedLayer {
            layer_id: layer.layer_id.clone(),
            reason: format!("no registered backend supports provider {wanted:?}"),
        })
    }

    /// Every registered executor, for session-wide sweeps like cleanup.
    pub fn values(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.values()
    }
}

//! Error types for the filter engine.

use std::fmt;

/// A convenience [`Result`] for the filter engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors the engine can surface. Variant names mirror the error *kinds*
/// named in the engine's error-handling design, not exception classes from
/// any particular backend.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// An identifier could not be safely quoted (e.g. contains a NUL byte).
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    /// Source geometry union/buffer produced a null or empty result for a
    /// non-negative buffer.
    #[error("geometry staging failed for layer {layer_id}: {reason}")]
    GeometryStagingFailed { layer_id: String, reason: String },

    /// No database connection is available for a layer that requires one.
    #[error("no connection available for layer {0}")]
    NoConnection(String),

    /// The backend's statement timeout fired.
    #[error("statement timeout while filtering layer {0}")]
    StatementTimeout(String),

    /// The query was canceled, either by the user or the backend.
    #[error("query canceled for layer {0}")]
    QueryCanceled(String),

    /// Materialized-view/temp-table creation failed.
    #[error("materialized view creation failed for {view_name}: {reason}")]
    MVCreateFailed { view_name: String, reason: String },

    /// The configured schema could not be created/used (permission denied).
    #[error("permission denied creating schema {0}")]
    SchemaPermissionDenied(String),

    /// The layer's provider/shape is not supported by any backend.
    #[error("unsupported layer {layer_id}: {reason}")]
    UnsupportedLayer { layer_id: String, reason: String },

    /// The run was aborted by the user (cooperative cancellation).
    #[error("aborted by user")]
    AbortedByUser,

    /// `unfilter`/`redo` was called for a layer with nothing to undo/redo.
    #[error("no filter history available for layer {0}")]
    NoHistory(String),

    /// A configuration value failed validation.
    #[error("configuration error: {0}")]
    Config(&'static str),

    /// Wraps a PostgreSQL-backend error.
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] crate::pool::pg::PgError),

    /// Wraps a SpatiaLite/SQLite-backend error.
    #[cfg(feature = "spatialite")]
    #[error(transparent)]
    Sqlite(#[from] sqlx::Error),
}

impl EngineError {
    /// Whether this error indicates the caller should fall back to the OGR
    /// (in-process) executor and retry, per the state machine in §4.8.4.
    #[must_use]
    pub fn should_force_ogr_fallback(&self) -> bool {
        matches!(
            self,
            EngineError::StatementTimeout(_) | EngineError::QueryCanceled(_)
        )
    }
}

/// A lightweight, `Display`-only wrapper used when an error needs to be
/// attached to a per-layer [`crate::model::FilterResult`] without boxing.
#[derive(Debug, Clone)]
pub struct ErrorSummary(pub String);

impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&EngineError> for ErrorSummary {
    fn from(e: &EngineError) -> Self {
        ErrorSummary(e.to_string())
    }
}

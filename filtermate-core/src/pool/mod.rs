//! Connection pooling for backends that need a live database handle.

#[cfg(feature = "postgres")]
pub mod pg;
#[cfg(feature = "postgres")]
pub mod tls;

#[cfg(feature = "spatialite")]
pub mod sqlite;

//! Materialized-view / temp-table manager (C5).
//!
//! A single port trait with two concrete adapters, mirroring the
//! hexagonal `MaterializedViewPort` interface this crate's domain model
//! was distilled from: PostgreSQL gets real materialized views,
//! SpatiaLite gets non-temporary tables standing in for them (spec
//! §4.5, GLOSSARY "Temp table (SpatiaLite sense)").

pub mod port;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "spatialite")]
pub mod spatialite;

pub use port::{MaterializedViewPort, MvConfig};

//! Command-line harness for the adaptive spatial filter engine: wires
//! [`filtermate_core`] up to an in-memory [`memory_host::MemoryHost`]
//! and a scenario file so the engine can be exercised without a real
//! PostgreSQL or SpatiaLite connection.

pub mod cli;
pub mod config_loader;
pub mod expr;
pub mod logging;
pub mod memory_host;
pub mod scenario;

//! Logging setup for the coordinator binary and embedding services.

pub mod logging;

pub use logging::{default_log_dir, init_production_logging, init_simple_logging};

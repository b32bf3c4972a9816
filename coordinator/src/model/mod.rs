//! Model placement bookkeeping
//!
//! The coordinator only consumes replica information: which peers hold a
//! copy of which model. How replicas are agreed on and copied is the model
//! manager's business; the core talks to it through the [`ModelManager`]
//! trait.
//!
//! ## Key Concepts
//!
//! - **Model**: a named set of weights registered from a source path
//! - **Replica**: a copy of a model hosted on a specific peer
//! - **Replication request**: a hint that more replicas are wanted

pub mod manager;
pub mod registry;

pub use manager::{ModelInfo, ModelManager};
pub use registry::ModelRegistry;

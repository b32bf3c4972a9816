//! Cluster node bookkeeping
//!
//! Health and heartbeat collaborators push [`NodeInfo`] updates into the
//! [`NodeRegistry`]; node selection and the fault-tolerance loops read it.
//! The registry is injected wherever it is needed rather than held globally.
//!
//! ```text
//! heartbeat source ──upsert/heartbeat──▶ NodeRegistry ◀──read── NodeSelector
//!                                            ▲
//!                     status/load changes ───┘── FaultToleranceManager
//! ```

pub mod info;
pub mod registry;

pub use info::{NodeCapabilities, NodeId, NodeInfo, NodeStatus};
pub use registry::NodeRegistry;

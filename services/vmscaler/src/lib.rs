//! fleetscale vmscaler library
//!
//! The scaler keeps the scale sets of one resource group sized to a desired
//! node count. Demand is read from a tag on the resource group; preempted
//! instances arrive on a queue and lower it.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler (single task)
//! ├── EvictionDrain   (every 5s: queue → demand decrement → delete instances)
//! └── planning pass   (every 60s: demand + fleet → Plan → PlanExecutor)
//!
//! OperationTrackerActor (own task)
//!     watches every operation the drain and executor start
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework and the operation tracker
//! - `cloud`: Collaborator traits and the new scale set template
//! - `memory`: In-memory collaborators
//! - `demand`, `drain`, `executor`, `reconciler`: The control loop

pub mod actors;
pub mod cloud;
pub mod config;
pub mod demand;
pub mod drain;
pub mod error;
pub mod executor;
pub mod memory;
pub mod reconciler;

// Re-export commonly used types
pub use actors::{OperationTracker, TrackerConfig};
pub use cloud::{Clients, FleetClient, MessageQueue, Operation, OperationHandle, TagStore};
pub use reconciler::{Reconciler, ReconcilerConfig};

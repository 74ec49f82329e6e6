//! Capacity planning primitives.
//!
//! This library turns a snapshot of the scale sets in a resource group plus
//! the desired node count ("demand") into a [`Plan`]: which scale sets to tag
//! as at capacity, which to seal, which to grow, which to delete, and which new
//! scale sets to create.
//!
//! - **Snapshot**: what the control plane reports right now, re-listed every
//!   planning pass.
//! - **Demand**: the externally-set target total instance count.
//! - **Plan**: a single-use value consumed by the executor in the same cycle.
//!
//! # Invariants
//!
//! - Planning is a pure function: identical inputs produce identical plans
//! - A scale set lands in at most one of the existing-scale-set buckets
//! - A scale set with a pending operation is never acted upon

mod planner;
mod snapshot;

use thiserror::Error;

pub use planner::{new_scale_set_names, plan_capacity, Plan, PlanInput, PlanSummary, PlannerConfig};
pub use snapshot::{
    format_tag_time, parse_tag_time, ProvisioningState, ScaleSetSnapshot,
    LAST_TIME_AT_CAPACITY_TAG_KEY, SEALED_TAG_KEY, TOTAL_NODES_TAG_KEY,
};

/// Planning errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A timestamp tag could not be parsed.
    #[error("invalid timestamp tag '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    /// Planner configuration is unusable.
    #[error("invalid planner configuration: {0}")]
    InvalidConfig(String),
}

/// Default name prefix for scale sets created by the planner.
pub const DEFAULT_SCALE_SET_PREFIX: &str = "vmss";

/// Default number of instances per scale set.
pub const DEFAULT_VMS_PER_SCALE_SET: u64 = 25;

/// Smallest allowed instances-per-scale-set setting.
pub const MIN_VMS_PER_SCALE_SET: u64 = 16;

/// Largest allowed instances-per-scale-set setting.
pub const MAX_VMS_PER_SCALE_SET: u64 = 250;

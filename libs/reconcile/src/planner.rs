//! The capacity planner.
//!
//! Classification precedence for each existing scale set (first match wins):
//!
//! 1. pending operation: skipped
//! 2. capacity zero: delete
//! 3. sealed: skipped
//! 4. capacity at or above the per-scale-set maximum: at capacity
//! 5. at capacity longer than the seal threshold: seal
//! 6. provisioned and demand unmet: increase, otherwise at capacity
//!
//! Any demand still unmet afterwards is covered by new scale sets.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::snapshot::ScaleSetSnapshot;
use crate::{ReconcileError, DEFAULT_SCALE_SET_PREFIX, DEFAULT_VMS_PER_SCALE_SET};

/// Planner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Instances per scale set; growth always targets this value.
    pub vms_per_scale_set: u64,

    /// How long a scale set must have been at capacity before it is sealed.
    pub seal_after: Duration,

    /// Prefix for generated scale set names.
    pub name_prefix: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            vms_per_scale_set: DEFAULT_VMS_PER_SCALE_SET,
            seal_after: Duration::from_secs(60 * 60),
            name_prefix: DEFAULT_SCALE_SET_PREFIX.to_string(),
        }
    }
}

/// Inputs of a single planning pass.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    /// Every scale set currently in the resource group.
    pub fleet: &'a [ScaleSetSnapshot],

    /// Desired total instance count.
    pub demand: u64,

    /// True on the first pass after process start.
    pub first_run: bool,

    /// Reference time for tag age checks.
    pub now: DateTime<Utc>,
}

/// The actions computed for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Sum of capacity over every listed scale set.
    pub current_capacity: u64,

    /// Capacity added by the scale sets in `to_increase`.
    pub increased_capacity: u64,

    /// Demand the plan was computed for.
    pub target: u64,

    /// Snapshots the plan was computed from, keyed by name.
    pub scale_sets: BTreeMap<String, ScaleSetSnapshot>,

    /// Scale sets whose at-capacity timestamp gets refreshed.
    pub at_capacity: Vec<String>,

    /// Scale sets to seal.
    pub to_seal: Vec<String>,

    /// Scale sets to grow to the per-scale-set maximum.
    pub to_increase: Vec<String>,

    /// Empty scale sets to delete.
    pub to_delete: Vec<String>,

    /// Names of scale sets to create.
    pub new_names: Vec<String>,
}

/// Bucket counts for the periodic plan log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub current_capacity: u64,
    pub increased_capacity: u64,
    pub target: u64,
    pub existing: usize,
    pub new: usize,
    pub at_capacity: usize,
    pub to_increase: usize,
    pub to_seal: usize,
    pub to_delete: usize,
    /// Existing scale sets not at capacity, grown, or sealed by this plan.
    pub untouched: usize,
}

impl Plan {
    /// Summarize the plan.
    pub fn summary(&self) -> PlanSummary {
        let classified = self.at_capacity.len() + self.to_increase.len() + self.to_seal.len();
        PlanSummary {
            current_capacity: self.current_capacity,
            increased_capacity: self.increased_capacity,
            target: self.target,
            existing: self.scale_sets.len(),
            new: self.new_names.len(),
            at_capacity: self.at_capacity.len(),
            to_increase: self.to_increase.len(),
            to_seal: self.to_seal.len(),
            to_delete: self.to_delete.len(),
            untouched: self.scale_sets.len().saturating_sub(classified),
        }
    }

    /// Returns true if executing the plan would issue no calls.
    pub fn is_empty(&self) -> bool {
        self.at_capacity.is_empty()
            && self.to_seal.is_empty()
            && self.to_increase.is_empty()
            && self.to_delete.is_empty()
            && self.new_names.is_empty()
    }
}

/// Compute the plan for one pass.
///
/// `is_settled` reports whether no operation is pending for a scale set.
pub fn plan_capacity<F>(
    input: PlanInput<'_>,
    config: &PlannerConfig,
    is_settled: F,
) -> Result<Plan, ReconcileError>
where
    F: Fn(&str) -> bool,
{
    if config.vms_per_scale_set == 0 {
        return Err(ReconcileError::InvalidConfig(
            "vms_per_scale_set must be greater than zero".to_string(),
        ));
    }

    let mut plan = Plan {
        target: input.demand,
        current_capacity: input.fleet.iter().map(|s| s.capacity).sum(),
        ..Plan::default()
    };

    // Right after a restart we cannot tell how long anything has been at
    // capacity, so only refresh timestamps on unsealed scale sets.
    if input.first_run {
        for scale_set in input.fleet {
            if scale_set.is_sealed() {
                continue;
            }
            plan.scale_sets.insert(scale_set.name.clone(), scale_set.clone());
            plan.at_capacity.push(scale_set.name.clone());
        }
        return Ok(plan);
    }

    for scale_set in input.fleet {
        plan.scale_sets.insert(scale_set.name.clone(), scale_set.clone());
        let name = &scale_set.name;

        if !is_settled(name) {
            continue;
        }

        if scale_set.capacity == 0 {
            plan.to_delete.push(name.clone());
            continue;
        }

        if scale_set.is_sealed() {
            continue;
        }

        if scale_set.capacity >= config.vms_per_scale_set {
            plan.at_capacity.push(name.clone());
            continue;
        }

        match scale_set.last_time_at_capacity() {
            Some(Ok(last)) if is_older_than(input.now, last, config.seal_after) => {
                plan.to_seal.push(name.clone());
                continue;
            }
            Some(Err(e)) => {
                warn!(scale_set = %name, error = %e, "Ignoring bad at-capacity tag");
            }
            _ => {}
        }

        if scale_set.provisioning_state.is_succeeded() {
            if plan.current_capacity + plan.increased_capacity < input.demand {
                plan.to_increase.push(name.clone());
                plan.increased_capacity += config.vms_per_scale_set - scale_set.capacity;
            } else {
                // Demand is met; refresh the timestamp so it does not get sealed.
                plan.at_capacity.push(name.clone());
            }
        }
    }

    let remaining = input
        .demand
        .saturating_sub(plan.current_capacity + plan.increased_capacity);
    if remaining > 0 {
        let count = remaining.div_ceil(config.vms_per_scale_set);
        plan.new_names = new_scale_set_names(&config.name_prefix, count, &plan.scale_sets);
    }

    Ok(plan)
}

/// Generate `count` names `<prefix><index>` not present in `existing`.
pub fn new_scale_set_names<V>(
    prefix: &str,
    count: u64,
    existing: &BTreeMap<String, V>,
) -> Vec<String> {
    (0u64..)
        .map(|i| format!("{prefix}{i}"))
        .filter(|name| !existing.contains_key(name))
        .take(count as usize)
        .collect()
}

fn is_older_than(now: DateTime<Utc>, then: DateTime<Utc>, threshold: Duration) -> bool {
    // A timestamp in the future is never old.
    now.signed_duration_since(then)
        .to_std()
        .map(|elapsed| elapsed > threshold)
        .unwrap_or(false)
}

//! Plan execution.
//!
//! Every action in a [`Plan`] is one control plane call. Calls are issued
//! independently: a failure is logged and the rest of the plan still runs.
//! Each accepted call hands its operation to the tracker under the scale set
//! name, which keeps the planner away from that scale set until it settles.

use chrono::Utc;
use fleetscale_reconcile::{
    format_tag_time, Plan, ScaleSetSnapshot, LAST_TIME_AT_CAPACITY_TAG_KEY, SEALED_TAG_KEY,
};
use tracing::{debug, error, info, instrument};

use crate::actors::OperationTracker;
use crate::cloud::{Clients, Operation, ScaleSetTemplate};
use crate::error::CloudError;

/// Counts of calls issued by one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub issued: usize,
    pub failed: usize,
}

/// Applies plans to the fleet.
pub struct PlanExecutor {
    clients: Clients,
    tracker: OperationTracker,
    template: ScaleSetTemplate,
}

impl PlanExecutor {
    /// `template.capacity` is both the size of new scale sets and the target
    /// of grown ones.
    pub fn new(clients: Clients, tracker: OperationTracker, template: ScaleSetTemplate) -> Self {
        Self {
            clients,
            tracker,
            template,
        }
    }

    /// Issue every call in `plan`.
    #[instrument(skip_all, fields(target = plan.target))]
    pub async fn execute(&self, plan: &Plan) -> ExecutionStats {
        let mut stats = ExecutionStats::default();
        if plan.is_empty() {
            debug!("Nothing to execute");
            return stats;
        }

        let stamp = format_tag_time(Utc::now());
        for name in &plan.at_capacity {
            let result = self
                .update(plan, name, |s| {
                    s.tags
                        .insert(LAST_TIME_AT_CAPACITY_TAG_KEY.to_string(), stamp.clone());
                })
                .await;
            self.record(&mut stats, name, "tag at capacity", result).await;
        }

        let stamp = format_tag_time(Utc::now());
        for name in &plan.to_seal {
            let result = self
                .update(plan, name, |s| {
                    s.tags.insert(SEALED_TAG_KEY.to_string(), stamp.clone());
                })
                .await;
            self.record(&mut stats, name, "seal", result).await;
        }

        let stamp = format_tag_time(Utc::now());
        let capacity = self.template.capacity;
        for name in &plan.to_increase {
            let result = self
                .update(plan, name, |s| {
                    s.tags
                        .insert(LAST_TIME_AT_CAPACITY_TAG_KEY.to_string(), stamp.clone());
                    s.capacity = capacity;
                })
                .await;
            self.record(&mut stats, name, "increase", result).await;
        }

        for name in &plan.to_delete {
            let result = self
                .clients
                .fleet
                .delete(&self.clients.resource_group, name, false)
                .await;
            self.record(&mut stats, name, "delete", result).await;
        }

        for name in &plan.new_names {
            let model = self.template.model_for(name);
            let result = self
                .clients
                .fleet
                .create(&self.clients.resource_group, &model)
                .await;
            self.record(&mut stats, name, "create", result).await;
        }

        info!(issued = stats.issued, failed = stats.failed, "Plan executed");
        stats
    }

    /// Write back a modified copy of the planned snapshot.
    async fn update<F>(&self, plan: &Plan, name: &str, mutate: F) -> Result<Operation, CloudError>
    where
        F: FnOnce(&mut ScaleSetSnapshot),
    {
        let Some(snapshot) = plan.scale_sets.get(name) else {
            return Err(CloudError::NotFound(name.to_string()));
        };
        let mut snapshot = snapshot.clone();
        mutate(&mut snapshot);
        self.clients
            .fleet
            .update(&self.clients.resource_group, &snapshot)
            .await
    }

    async fn record(
        &self,
        stats: &mut ExecutionStats,
        name: &str,
        action: &'static str,
        result: Result<Operation, CloudError>,
    ) {
        match result {
            Ok(operation) => {
                stats.issued += 1;
                info!(scale_set = %name, action, "Issued scale set operation");
                if let Err(e) = self.tracker.watch(name, operation).await {
                    error!(scale_set = %name, action, error = %e, "Failed to watch operation");
                }
            }
            Err(e) => {
                stats.failed += 1;
                error!(scale_set = %name, action, error = %e, "Scale set operation failed");
            }
        }
    }
}

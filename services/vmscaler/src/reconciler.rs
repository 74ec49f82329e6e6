//! Reconciliation loop for keeping the fleet sized to demand.
//!
//! The reconciler:
//! - Drains the eviction queue on a short cadence
//! - Periodically refreshes demand, lists the fleet, plans, and executes
//!
//! Both cadences run on one task, driven by a fast ticker, so a drain and a
//! planning pass never overlap. The first planning pass only records which
//! scale sets are at capacity; the next pass follows immediately.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use fleetscale_reconcile::{plan_capacity, Plan, PlanInput, PlannerConfig};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::actors::OperationTracker;
use crate::cloud::{Clients, ScaleSetTemplate};
use crate::demand::DemandTracker;
use crate::drain::{DrainConfig, DrainStats, EvictionDrain};
use crate::executor::PlanExecutor;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Ticker period; the resolution of both cadences.
    pub tick: Duration,

    /// Interval between eviction queue drains.
    pub drain_interval: Duration,

    /// Interval between planning passes.
    pub plan_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            drain_interval: Duration::from_secs(5),
            plan_interval: Duration::from_secs(60),
        }
    }
}

/// Reconciler for converging the fleet on demand.
pub struct Reconciler {
    clients: Clients,
    tracker: OperationTracker,
    demand: DemandTracker,
    drain: EvictionDrain,
    executor: PlanExecutor,
    planner: PlannerConfig,
    config: ReconcilerConfig,
    first_run: bool,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        clients: Clients,
        tracker: OperationTracker,
        planner: PlannerConfig,
        mut template: ScaleSetTemplate,
        drain: DrainConfig,
        config: ReconcilerConfig,
    ) -> Self {
        // New and grown scale sets are sized by the planner's setting.
        template.capacity = planner.vms_per_scale_set;
        Self {
            demand: DemandTracker::new(clients.tags.clone(), clients.resource_group.clone()),
            drain: EvictionDrain::new(clients.clone(), tracker.clone(), drain),
            executor: PlanExecutor::new(clients.clone(), tracker.clone(), template),
            clients,
            tracker,
            planner,
            config,
            first_run: true,
        }
    }

    /// The last known demand.
    pub fn demand(&self) -> u64 {
        self.demand.value()
    }

    /// True until the first planning pass has executed.
    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            resource_group = %self.clients.resource_group,
            drain_interval_ms = self.config.drain_interval.as_millis() as u64,
            plan_interval_ms = self.config.plan_interval.as_millis() as u64,
            "Starting reconciliation loop"
        );

        let demand = self.demand.refresh().await;
        info!(demand, "Initial demand");

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_drain = Instant::now();
        let mut next_plan = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if last_drain.elapsed() >= self.config.drain_interval {
                        last_drain = Instant::now();
                        self.drain_once().await;
                    }

                    if Instant::now() >= next_plan {
                        next_plan = Instant::now() + self.config.plan_interval;
                        let was_first_run = self.first_run;
                        match self.plan_once().await {
                            Ok(_) if was_first_run => {
                                // The first pass only tagged; plan for real now.
                                next_plan = Instant::now();
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Planning pass failed"),
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Drain the eviction queue once.
    pub async fn drain_once(&mut self) -> DrainStats {
        self.drain.run_once(&mut self.demand).await
    }

    /// Run one planning pass: refresh demand, list the fleet, plan, execute.
    #[instrument(skip(self), fields(first_run = self.first_run))]
    pub async fn plan_once(&mut self) -> anyhow::Result<Plan> {
        let demand = self.demand.refresh().await;

        let fleet = self
            .clients
            .fleet
            .list(&self.clients.resource_group)
            .await
            .context("failed to list scale sets")?;

        let pending: BTreeSet<String> = self
            .tracker
            .pending()
            .await
            .context("failed to query pending operations")?;

        let plan = plan_capacity(
            PlanInput {
                fleet: &fleet,
                demand,
                first_run: self.first_run,
                now: Utc::now(),
            },
            &self.planner,
            |name| !pending.contains(name),
        )?;

        log_plan(&plan, pending.len());
        self.executor.execute(&plan).await;

        self.first_run = false;
        Ok(plan)
    }
}

fn log_plan(plan: &Plan, pending: usize) {
    let summary = plan.summary();
    info!(
        current_capacity = summary.current_capacity,
        increased_capacity = summary.increased_capacity,
        target = summary.target,
        existing = summary.existing,
        new = summary.new,
        pending,
        "Plan capacity"
    );
    info!(
        at_capacity = summary.at_capacity,
        to_increase = summary.to_increase,
        to_seal = summary.to_seal,
        to_delete = summary.to_delete,
        sealed = summary.untouched,
        "Plan scale set counts"
    );
    debug!(
        at_capacity = ?plan.at_capacity,
        to_seal = ?plan.to_seal,
        to_increase = ?plan.to_increase,
        to_delete = ?plan.to_delete,
        new = ?plan.new_names,
        "Plan detail"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleetscale_reconcile::{
        ProvisioningState, ScaleSetSnapshot, LAST_TIME_AT_CAPACITY_TAG_KEY, TOTAL_NODES_TAG_KEY,
    };

    use crate::actors::{Supervisor, TrackerConfig};
    use crate::cloud::{subnet_id, EvictionPolicy, Priority};
    use crate::memory::{InMemoryFleet, InMemoryQueue, InMemoryTagStore};

    const RG: &str = "render-rg";

    struct Harness {
        fleet: Arc<InMemoryFleet>,
        tags: Arc<InMemoryTagStore>,
        reconciler: Reconciler,
        _supervisor: Supervisor,
        _shutdown: watch::Sender<bool>,
    }

    fn template() -> ScaleSetTemplate {
        ScaleSetTemplate {
            location: "westus2".to_string(),
            sku: "Standard_DS14_v2".to_string(),
            capacity: 25,
            image_id: "/images/render".to_string(),
            admin_username: "azureuser".to_string(),
            admin_password: "secret".to_string(),
            subnet_id: subnet_id("sub", "net-rg", "vnet", "render"),
            priority: Priority::Low,
            eviction_policy: EvictionPolicy::Delete,
            overprovision: false,
            single_placement_group: false,
        }
    }

    fn harness() -> Harness {
        harness_with(PlannerConfig::default(), template())
    }

    fn harness_with(planner: PlannerConfig, template: ScaleSetTemplate) -> Harness {
        let fleet = Arc::new(InMemoryFleet::new());
        let tags = Arc::new(InMemoryTagStore::new());
        let clients = Clients {
            fleet: fleet.clone(),
            tags: tags.clone(),
            queue: Arc::new(InMemoryQueue::new()),
            resource_group: RG.to_string(),
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let tracker = OperationTracker::spawn(&mut supervisor, TrackerConfig::default());

        Harness {
            fleet,
            tags,
            reconciler: Reconciler::new(
                clients,
                tracker,
                planner,
                template,
                DrainConfig::default(),
                ReconcilerConfig::default(),
            ),
            _supervisor: supervisor,
            _shutdown: shutdown,
        }
    }

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.tick, Duration::from_millis(10));
        assert_eq!(config.drain_interval, Duration::from_secs(5));
        assert_eq!(config.plan_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_first_run_only_tags() {
        let mut h = harness();
        h.tags.set_raw(RG, TOTAL_NODES_TAG_KEY, "60").await;
        h.fleet
            .insert(ScaleSetSnapshot::new("vmss0", 10, ProvisioningState::Succeeded))
            .await;

        let plan = h.reconciler.plan_once().await.unwrap();
        assert_eq!(plan.at_capacity, vec!["vmss0"]);
        assert!(plan.new_names.is_empty());
        assert!(!h.reconciler.is_first_run());

        let tagged = h.fleet.get("vmss0").await.unwrap();
        assert!(tagged.tags.contains_key(LAST_TIME_AT_CAPACITY_TAG_KEY));
        assert_eq!(tagged.capacity, 10);
    }

    #[tokio::test]
    async fn test_empty_fleet_creates_scale_sets() {
        let mut h = harness();
        h.tags.set_raw(RG, TOTAL_NODES_TAG_KEY, "60").await;
        h.reconciler.plan_once().await.unwrap();

        let plan = h.reconciler.plan_once().await.unwrap();
        assert_eq!(plan.new_names, vec!["vmss0", "vmss1", "vmss2"]);
        assert_eq!(h.fleet.names().await, vec!["vmss0", "vmss1", "vmss2"]);
        assert_eq!(h.fleet.total_capacity().await, 75);
    }

    #[tokio::test]
    async fn test_new_scale_sets_use_planner_size() {
        let planner = PlannerConfig {
            vms_per_scale_set: 20,
            ..PlannerConfig::default()
        };
        let template = ScaleSetTemplate {
            capacity: 7,
            ..template()
        };
        let mut h = harness_with(planner, template);
        h.tags.set_raw(RG, TOTAL_NODES_TAG_KEY, "60").await;
        h.reconciler.plan_once().await.unwrap();

        let plan = h.reconciler.plan_once().await.unwrap();
        assert_eq!(plan.new_names, vec!["vmss0", "vmss1", "vmss2"]);
        for name in &plan.new_names {
            assert_eq!(h.fleet.get(name).await.unwrap().capacity, 20);
        }
        assert_eq!(h.fleet.total_capacity().await, 60);
    }

    #[tokio::test]
    async fn test_pending_scale_sets_are_left_alone() {
        let mut h = harness();
        h.tags.set_raw(RG, TOTAL_NODES_TAG_KEY, "60").await;
        h.reconciler.plan_once().await.unwrap();
        h.reconciler.plan_once().await.unwrap();
        h.fleet.clear_calls().await;

        // The creates are still being watched, so nothing is touched.
        let plan = h.reconciler.plan_once().await.unwrap();
        assert!(plan.at_capacity.is_empty());
        assert!(plan.new_names.is_empty());
        assert!(h.fleet.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_failure_fails_pass() {
        let mut h = harness();
        h.fleet.set_list_failure(true);
        assert!(h.reconciler.plan_once().await.is_err());
        assert!(h.reconciler.is_first_run());
    }

    #[tokio::test]
    async fn test_missing_demand_tag_is_created() {
        let mut h = harness();
        h.reconciler.plan_once().await.unwrap();
        assert_eq!(h.reconciler.demand(), 0);
        assert_eq!(
            h.tags.get_raw(RG, TOTAL_NODES_TAG_KEY).await.as_deref(),
            Some("0")
        );
    }
}

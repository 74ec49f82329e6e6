//! Eviction queue drain.
//!
//! Preempted instances are reported on a queue as `<scale set>,<instance id>`
//! messages. Each drain pass empties the queue, lowers demand by the number of
//! evicted instances, and then asks the control plane to delete the instances,
//! one call per scale set. Messages are only deleted from the queue once the
//! delete call for their scale set was accepted, so a failed call is retried
//! when the messages become visible again.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::actors::OperationTracker;
use crate::cloud::{Clients, DequeuedMessage};
use crate::demand::DemandTracker;
use crate::error::DrainError;

/// Drain configuration.
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// How long dequeued messages stay hidden from other consumers.
    pub visibility_timeout: Duration,

    /// Messages requested per dequeue call.
    pub dequeue_batch: u32,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(10 * 60),
            dequeue_batch: 1,
        }
    }
}

/// A parsed eviction message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionNotice {
    pub scale_set: String,
    pub instance_id: String,
}

impl EvictionNotice {
    /// Parse `<scale set>,<instance id>`.
    pub fn parse(text: &str) -> Result<Self, DrainError> {
        let fields: Vec<&str> = text.split(',').collect();
        match fields.as_slice() {
            [scale_set, instance_id] if !scale_set.is_empty() && !instance_id.is_empty() => {
                Ok(Self {
                    scale_set: (*scale_set).to_string(),
                    instance_id: (*instance_id).to_string(),
                })
            }
            _ => Err(DrainError::MalformedMessage(text.to_string())),
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Messages dequeued, including malformed ones.
    pub dequeued: usize,

    /// Messages discarded as malformed.
    pub malformed: usize,

    /// Well-formed eviction notices.
    pub evicted: usize,

    /// Scale sets whose delete call was accepted.
    pub scale_sets_deleted: usize,

    /// Scale sets whose delete call failed.
    pub scale_sets_failed: usize,
}

/// Drains the eviction queue into instance deletions.
pub struct EvictionDrain {
    clients: Clients,
    tracker: OperationTracker,
    config: DrainConfig,
}

impl EvictionDrain {
    pub fn new(clients: Clients, tracker: OperationTracker, config: DrainConfig) -> Self {
        Self {
            clients,
            tracker,
            config,
        }
    }

    /// Run one drain pass.
    #[instrument(skip_all)]
    pub async fn run_once(&self, demand: &mut DemandTracker) -> DrainStats {
        let mut stats = DrainStats::default();
        let groups = self.dequeue_all(&mut stats).await;

        if stats.evicted == 0 {
            return stats;
        }

        // Demand goes down before the instances do.
        demand.decrement(stats.evicted as u64).await;

        for (scale_set, messages) in groups {
            if self.delete_group(&scale_set, &messages).await {
                stats.scale_sets_deleted += 1;
            } else {
                stats.scale_sets_failed += 1;
            }
        }

        info!(
            dequeued = stats.dequeued,
            malformed = stats.malformed,
            evicted = stats.evicted,
            scale_sets_deleted = stats.scale_sets_deleted,
            scale_sets_failed = stats.scale_sets_failed,
            "Eviction drain complete"
        );
        stats
    }

    /// Dequeue until the queue is empty or a dequeue fails, grouping the
    /// well-formed notices by scale set.
    async fn dequeue_all(
        &self,
        stats: &mut DrainStats,
    ) -> BTreeMap<String, Vec<(DequeuedMessage, EvictionNotice)>> {
        let mut groups: BTreeMap<String, Vec<(DequeuedMessage, EvictionNotice)>> = BTreeMap::new();

        loop {
            let batch = match self
                .clients
                .queue
                .dequeue(self.config.dequeue_batch, self.config.visibility_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue eviction message");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            for message in batch {
                stats.dequeued += 1;
                match EvictionNotice::parse(&message.text) {
                    Ok(notice) => {
                        stats.evicted += 1;
                        groups
                            .entry(notice.scale_set.clone())
                            .or_default()
                            .push((message, notice));
                    }
                    Err(e) => {
                        stats.malformed += 1;
                        warn!(message_id = %message.id, error = %e, "Discarding eviction message");
                        self.delete_message(&message).await;
                    }
                }
            }
        }

        groups
    }

    /// Issue one delete-instances call for a scale set; returns true if the
    /// call was accepted.
    async fn delete_group(
        &self,
        scale_set: &str,
        messages: &[(DequeuedMessage, EvictionNotice)],
    ) -> bool {
        let instance_ids: Vec<String> = messages
            .iter()
            .map(|(_, notice)| notice.instance_id.clone())
            .collect();

        let operation = match self
            .clients
            .fleet
            .delete_instances(&self.clients.resource_group, scale_set, &instance_ids)
            .await
        {
            Ok(operation) => operation,
            Err(e) => {
                error!(
                    scale_set = %scale_set,
                    instances = ?instance_ids,
                    error = %e,
                    "Failed to delete evicted instances"
                );
                return false;
            }
        };

        info!(scale_set = %scale_set, instances = ?instance_ids, "Deleting evicted instances");
        if let Err(e) = self.tracker.watch(scale_set, operation).await {
            error!(scale_set = %scale_set, error = %e, "Failed to watch delete operation");
        }

        for (message, _) in messages {
            self.delete_message(message).await;
        }
        true
    }

    async fn delete_message(&self, message: &DequeuedMessage) {
        match self
            .clients
            .queue
            .delete_message(&message.id, &message.pop_receipt)
            .await
        {
            Ok(()) => debug!(message_id = %message.id, "Deleted eviction message"),
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to delete eviction message")
            }
        }
    }
}

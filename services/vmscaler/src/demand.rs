//! Demand: the desired total instance count, persisted as a resource group tag.
//!
//! The cached value is owned by the reconciler task. It is refreshed from the
//! tag store at the start of every planning pass and lowered by the eviction
//! drain; nothing in this process ever raises it.

use std::sync::Arc;

use fleetscale_reconcile::TOTAL_NODES_TAG_KEY;
use tracing::{debug, error, info, instrument, warn};

use crate::cloud::TagStore;
use crate::error::TagError;

/// Cached demand backed by the `TOTAL_NODES` tag.
pub struct DemandTracker {
    tags: Arc<dyn TagStore>,
    resource_group: String,
    value: u64,
}

impl DemandTracker {
    /// Create a tracker with a cached value of zero.
    pub fn new(tags: Arc<dyn TagStore>, resource_group: impl Into<String>) -> Self {
        Self {
            tags,
            resource_group: resource_group.into(),
            value: 0,
        }
    }

    /// The last known demand.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Re-read demand from the tag store.
    ///
    /// A missing tag initialises demand to zero and writes it back. Any other
    /// failure keeps the last known value.
    #[instrument(skip(self), fields(resource_group = %self.resource_group))]
    pub async fn refresh(&mut self) -> u64 {
        match self
            .tags
            .get_int_tag(&self.resource_group, TOTAL_NODES_TAG_KEY)
            .await
        {
            Ok(raw) => {
                if raw < 0 {
                    warn!(value = raw, "Negative demand tag, treating as zero");
                }
                self.value = u64::try_from(raw).unwrap_or(0);
                debug!(demand = self.value, "Demand refreshed");
            }
            Err(e) if e.is_not_found() => {
                info!("Demand tag missing, initialising to zero");
                self.value = 0;
                if let Err(e) = self.persist().await {
                    error!(error = %e, "Failed to initialise demand tag");
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    demand = self.value,
                    "Failed to read demand tag, keeping last known value"
                );
            }
        }
        self.value
    }

    /// Lower demand by `count`, never below zero, and persist the result.
    ///
    /// Persist failures are logged; the cached value is lowered regardless.
    #[instrument(skip(self), fields(resource_group = %self.resource_group))]
    pub async fn decrement(&mut self, count: u64) -> u64 {
        let next = decremented(self.value, count);
        if next == self.value {
            return self.value;
        }

        info!(from = self.value, to = next, evicted = count, "Lowering demand");
        self.value = next;
        if let Err(e) = self.persist().await {
            error!(error = %e, demand = self.value, "Failed to persist demand");
        }
        self.value
    }

    async fn persist(&self) -> Result<(), TagError> {
        let value = i64::try_from(self.value).unwrap_or(i64::MAX);
        self.tags
            .set_int_tag(&self.resource_group, TOTAL_NODES_TAG_KEY, value)
            .await
    }
}

/// `current - count`, floored at zero.
pub fn decremented(current: u64, count: u64) -> u64 {
    current.saturating_sub(count)
}

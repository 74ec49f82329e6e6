//! Collaborator interfaces: fleet control plane, tag store, eviction queue.
//!
//! The reconciler only talks to the outside world through these traits.
//! Every mutating fleet call returns an [`Operation`] immediately; completion
//! is observed later by the operation tracker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetscale_reconcile::ScaleSetSnapshot;
use serde::{Deserialize, Serialize};

use crate::error::{CloudError, QueueError, TagError};

/// Shared handle to a long-running control plane operation.
pub type Operation = Arc<dyn OperationHandle>;

/// A long-running operation started by the control plane.
#[async_trait]
pub trait OperationHandle: Send + Sync {
    /// Query the control plane; `Ok(true)` once the operation has finished,
    /// successfully or not.
    async fn done(&self) -> Result<bool, CloudError>;

    /// Server-suggested delay before the next status query (Retry-After).
    fn suggested_delay(&self) -> Option<Duration>;

    /// Human-readable final status, for logging.
    fn status(&self) -> String {
        "unknown".to_string()
    }
}

/// Scale set control plane.
#[async_trait]
pub trait FleetClient: Send + Sync {
    /// List every scale set in the resource group.
    async fn list(&self, group: &str) -> Result<Vec<ScaleSetSnapshot>, CloudError>;

    /// Create a new scale set.
    async fn create(&self, group: &str, model: &ScaleSetModel) -> Result<Operation, CloudError>;

    /// Write back a modified scale set (tags and capacity).
    async fn update(&self, group: &str, scale_set: &ScaleSetSnapshot)
        -> Result<Operation, CloudError>;

    /// Delete a scale set.
    async fn delete(&self, group: &str, name: &str, force: bool) -> Result<Operation, CloudError>;

    /// Delete specific instances from a scale set.
    async fn delete_instances(
        &self,
        group: &str,
        name: &str,
        instance_ids: &[String],
    ) -> Result<Operation, CloudError>;
}

/// Integer tags on a resource group.
#[async_trait]
pub trait TagStore: Send + Sync {
    async fn get_int_tag(&self, resource: &str, tag: &str) -> Result<i64, TagError>;

    async fn set_int_tag(&self, resource: &str, tag: &str, value: i64) -> Result<(), TagError>;
}

/// A message dequeued from the eviction queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedMessage {
    pub id: String,
    pub pop_receipt: String,
    pub text: String,
}

/// Eviction notification queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Dequeue up to `max_messages`, hiding them for `visibility_timeout`.
    ///
    /// An empty vector means the queue is drained.
    async fn dequeue(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<DequeuedMessage>, QueueError>;

    /// Permanently delete a dequeued message.
    async fn delete_message(&self, id: &str, pop_receipt: &str) -> Result<(), QueueError>;
}

/// The clients every component is constructed from.
#[derive(Clone)]
pub struct Clients {
    pub fleet: Arc<dyn FleetClient>,
    pub tags: Arc<dyn TagStore>,
    pub queue: Arc<dyn MessageQueue>,

    /// Resource group holding the scale sets and the demand tag.
    pub resource_group: String,
}

impl fmt::Debug for Clients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clients")
            .field("resource_group", &self.resource_group)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// New scale set model
// =============================================================================

/// VM priority for scale set instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Regular,
}

impl Priority {
    /// Parse a priority name; anything but "low" is regular.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("low") {
            Self::Low
        } else {
            Self::Regular
        }
    }
}

/// What happens to an evicted low-priority instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    Delete,
    Deallocate,
}

impl EvictionPolicy {
    /// Parse "delete" or "deallocate", ignoring case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "delete" => Some(Self::Delete),
            "deallocate" => Some(Self::Deallocate),
            _ => None,
        }
    }
}

/// OS profile of new instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsProfile {
    pub computer_name_prefix: String,
    pub admin_username: String,
    #[serde(skip_serializing)]
    pub admin_password: String,
}

/// Primary NIC of new instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkProfile {
    pub nic_name: String,
    pub ip_config_name: String,
    pub subnet_id: String,
    pub primary: bool,
    pub accelerated_networking: bool,
    pub ip_forwarding: bool,
}

/// Full resource model sent on scale set creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleSetModel {
    pub name: String,
    pub location: String,
    pub sku: String,
    pub capacity: u64,
    pub overprovision: bool,
    pub single_placement_group: bool,
    pub upgrade_mode: String,
    pub priority: Priority,
    pub eviction_policy: EvictionPolicy,
    pub image_id: String,
    pub os_profile: OsProfile,
    pub network_profile: NetworkProfile,
}

/// Opaque parameters every new scale set is stamped from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSetTemplate {
    pub location: String,
    pub sku: String,
    pub capacity: u64,
    pub image_id: String,
    pub admin_username: String,
    pub admin_password: String,
    pub subnet_id: String,
    pub priority: Priority,
    pub eviction_policy: EvictionPolicy,
    pub overprovision: bool,
    pub single_placement_group: bool,
}

impl ScaleSetTemplate {
    /// Build the create model for a scale set called `name`.
    pub fn model_for(&self, name: &str) -> ScaleSetModel {
        ScaleSetModel {
            name: name.to_string(),
            location: self.location.clone(),
            sku: self.sku.clone(),
            capacity: self.capacity,
            overprovision: self.overprovision,
            single_placement_group: self.single_placement_group,
            upgrade_mode: "Manual".to_string(),
            priority: self.priority,
            eviction_policy: self.eviction_policy,
            image_id: self.image_id.clone(),
            os_profile: OsProfile {
                computer_name_prefix: name.to_string(),
                admin_username: self.admin_username.clone(),
                admin_password: self.admin_password.clone(),
            },
            network_profile: NetworkProfile {
                nic_name: name.to_string(),
                ip_config_name: name.to_string(),
                subnet_id: self.subnet_id.clone(),
                primary: true,
                accelerated_networking: true,
                ip_forwarding: false,
            },
        }
    }
}

/// Resource ID of a subnet.
pub fn subnet_id(subscription_id: &str, resource_group: &str, vnet: &str, subnet: &str) -> String {
    format!(
        "/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/Microsoft.Network/virtualNetworks/{vnet}/subnets/{subnet}"
    )
}

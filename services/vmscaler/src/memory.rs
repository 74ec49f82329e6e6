//! In-memory collaborators for development and testing.
//!
//! These stand in for the cloud control plane, the resource group tag store
//! and the eviction queue. Mutations take effect immediately; the returned
//! operations report completion after a configurable number of polls.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetscale_reconcile::{ProvisioningState, ScaleSetSnapshot};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cloud::{
    DequeuedMessage, FleetClient, MessageQueue, Operation, OperationHandle, ScaleSetModel,
    TagStore,
};
use crate::error::{CloudError, QueueError, TagError};

// =============================================================================
// Operations
// =============================================================================

/// Operation that finishes after a scripted sequence of polls.
#[derive(Debug, Default)]
pub struct InMemoryOperation {
    /// Polls that fail before anything else happens.
    failures: AtomicU32,

    /// Polls that report "not done" before the operation completes.
    pending: AtomicU32,

    /// Suggested delay returned to the tracker.
    delay: Option<Duration>,

    /// Number of status queries received.
    polls: AtomicU32,
}

impl InMemoryOperation {
    /// An operation that is done on the first poll.
    pub fn completed() -> Self {
        Self::default()
    }

    /// An operation that reports "not done" `pending` times, then done.
    pub fn after_polls(pending: u32) -> Self {
        Self {
            pending: AtomicU32::new(pending),
            ..Self::default()
        }
    }

    /// An operation whose first `failures` polls error out.
    pub fn failing(failures: u32, pending: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            pending: AtomicU32::new(pending),
            ..Self::default()
        }
    }

    /// An operation that never completes.
    pub fn never() -> Self {
        Self::after_polls(u32::MAX)
    }

    /// Set the suggested polling delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of status queries received so far.
    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl OperationHandle for InMemoryOperation {
    async fn done(&self) -> Result<bool, CloudError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures) {
            return Err(CloudError::Request("[MOCK] transient poll failure".to_string()));
        }
        Ok(!take_one(&self.pending))
    }

    fn suggested_delay(&self) -> Option<Duration> {
        self.delay
    }

    fn status(&self) -> String {
        "Succeeded".to_string()
    }
}

// =============================================================================
// Fleet
// =============================================================================

/// A mutating call received by [`InMemoryFleet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCall {
    Create { name: String, capacity: u64 },
    Update(ScaleSetSnapshot),
    Delete { name: String, force: bool },
    DeleteInstances { name: String, instance_ids: Vec<String> },
}

impl FleetCall {
    /// Name of the scale set the call targeted.
    pub fn scale_set(&self) -> &str {
        match self {
            Self::Create { name, .. }
            | Self::Delete { name, .. }
            | Self::DeleteInstances { name, .. } => name,
            Self::Update(snapshot) => &snapshot.name,
        }
    }
}

/// In-memory scale set control plane.
#[derive(Default)]
pub struct InMemoryFleet {
    scale_sets: RwLock<BTreeMap<String, ScaleSetSnapshot>>,
    calls: RwLock<Vec<FleetCall>>,
    failing: RwLock<HashSet<String>>,
    fail_list: AtomicBool,

    /// "Not done" polls every returned operation reports before completing.
    op_pending_polls: AtomicU32,
}

impl InMemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every returned operation report "not done" `polls` times first.
    pub fn set_operation_polls(&self, polls: u32) {
        self.op_pending_polls.store(polls, Ordering::SeqCst);
    }

    /// Add or replace a scale set.
    pub async fn insert(&self, snapshot: ScaleSetSnapshot) {
        self.scale_sets
            .write()
            .await
            .insert(snapshot.name.clone(), snapshot);
    }

    pub async fn get(&self, name: &str) -> Option<ScaleSetSnapshot> {
        self.scale_sets.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.scale_sets.read().await.keys().cloned().collect()
    }

    pub async fn total_capacity(&self) -> u64 {
        self.scale_sets.read().await.values().map(|s| s.capacity).sum()
    }

    /// Every mutating call received, in order.
    pub async fn calls(&self) -> Vec<FleetCall> {
        self.calls.read().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
    }

    /// Make every mutating call against `name` fail.
    pub async fn fail_mutations_for(&self, name: &str) {
        self.failing.write().await.insert(name.to_string());
    }

    /// Make `list` fail.
    pub fn set_list_failure(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    async fn record(&self, call: FleetCall) -> Result<Operation, CloudError> {
        let name = call.scale_set().to_string();
        if self.failing.read().await.contains(&name) {
            return Err(CloudError::Request(format!(
                "[MOCK] mutation of '{name}' configured to fail"
            )));
        }
        debug!(scale_set = %name, call = ?call, "[MOCK] Fleet call");
        self.calls.write().await.push(call);
        let polls = self.op_pending_polls.load(Ordering::SeqCst);
        Ok(Arc::new(InMemoryOperation::after_polls(polls)))
    }
}

#[async_trait]
impl FleetClient for InMemoryFleet {
    async fn list(&self, _group: &str) -> Result<Vec<ScaleSetSnapshot>, CloudError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(CloudError::Request("[MOCK] list configured to fail".to_string()));
        }
        Ok(self.scale_sets.read().await.values().cloned().collect())
    }

    async fn create(&self, _group: &str, model: &ScaleSetModel) -> Result<Operation, CloudError> {
        let op = self
            .record(FleetCall::Create {
                name: model.name.clone(),
                capacity: model.capacity,
            })
            .await?;
        info!(scale_set = %model.name, capacity = model.capacity, "[MOCK] Creating scale set");
        self.insert(ScaleSetSnapshot::new(
            model.name.clone(),
            model.capacity,
            ProvisioningState::Succeeded,
        ))
        .await;
        Ok(op)
    }

    async fn update(
        &self,
        _group: &str,
        scale_set: &ScaleSetSnapshot,
    ) -> Result<Operation, CloudError> {
        if !self.scale_sets.read().await.contains_key(&scale_set.name) {
            return Err(CloudError::NotFound(scale_set.name.clone()));
        }
        let op = self.record(FleetCall::Update(scale_set.clone())).await?;
        self.insert(scale_set.clone()).await;
        Ok(op)
    }

    async fn delete(&self, _group: &str, name: &str, force: bool) -> Result<Operation, CloudError> {
        if !self.scale_sets.read().await.contains_key(name) {
            return Err(CloudError::NotFound(name.to_string()));
        }
        let op = self
            .record(FleetCall::Delete {
                name: name.to_string(),
                force,
            })
            .await?;
        info!(scale_set = %name, "[MOCK] Deleting scale set");
        self.scale_sets.write().await.remove(name);
        Ok(op)
    }

    async fn delete_instances(
        &self,
        _group: &str,
        name: &str,
        instance_ids: &[String],
    ) -> Result<Operation, CloudError> {
        if !self.scale_sets.read().await.contains_key(name) {
            return Err(CloudError::NotFound(name.to_string()));
        }
        let op = self
            .record(FleetCall::DeleteInstances {
                name: name.to_string(),
                instance_ids: instance_ids.to_vec(),
            })
            .await?;
        if let Some(scale_set) = self.scale_sets.write().await.get_mut(name) {
            scale_set.capacity = scale_set.capacity.saturating_sub(instance_ids.len() as u64);
        }
        Ok(op)
    }
}

// =============================================================================
// Tags
// =============================================================================

/// In-memory resource group tags. Values are stored as raw strings.
#[derive(Default)]
pub struct InMemoryTagStore {
    tags: RwLock<HashMap<(String, String), String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl InMemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a raw tag value, bypassing integer formatting.
    pub async fn set_raw(&self, resource: &str, tag: &str, value: &str) {
        self.tags
            .write()
            .await
            .insert((resource.to_string(), tag.to_string()), value.to_string());
    }

    pub async fn get_raw(&self, resource: &str, tag: &str) -> Option<String> {
        self.tags
            .read()
            .await
            .get(&(resource.to_string(), tag.to_string()))
            .cloned()
    }

    pub fn set_read_failure(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TagStore for InMemoryTagStore {
    async fn get_int_tag(&self, resource: &str, tag: &str) -> Result<i64, TagError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            let err = CloudError::Request("[MOCK] tag read configured to fail".to_string());
            return Err(err.into());
        }
        let Some(raw) = self.get_raw(resource, tag).await else {
            return Err(TagError::NotFound {
                resource: resource.to_string(),
                tag: tag.to_string(),
            });
        };
        raw.trim().parse().map_err(|_| TagError::Malformed {
            tag: tag.to_string(),
            value: raw,
        })
    }

    async fn set_int_tag(&self, resource: &str, tag: &str, value: i64) -> Result<(), TagError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            let err = CloudError::Request("[MOCK] tag write configured to fail".to_string());
            return Err(err.into());
        }
        self.set_raw(resource, tag, &value.to_string()).await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    text: String,
}

/// In-memory queue with at-least-once delivery.
///
/// Dequeued messages stay invisible until deleted or until
/// [`InMemoryQueue::expire_in_flight`] makes them visible again.
#[derive(Default)]
pub struct InMemoryQueue {
    ready: RwLock<VecDeque<StoredMessage>>,
    in_flight: RwLock<HashMap<String, (String, StoredMessage)>>,
    counter: AtomicU64,
    fail_dequeue: AtomicBool,
    fail_delete: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message; returns its id.
    pub async fn enqueue(&self, text: &str) -> String {
        let id = format!("msg_{:08x}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.ready.write().await.push_back(StoredMessage {
            id: id.clone(),
            text: text.to_string(),
        });
        id
    }

    /// Messages visible to the next dequeue.
    pub async fn visible_count(&self) -> usize {
        self.ready.read().await.len()
    }

    /// Messages dequeued but not deleted.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Simulate the visibility timeout expiring for every in-flight message.
    pub async fn expire_in_flight(&self) {
        let mut ready = self.ready.write().await;
        let mut in_flight = self.in_flight.write().await;
        for (_, (_, message)) in in_flight.drain() {
            ready.push_back(message);
        }
    }

    pub fn set_dequeue_failure(&self, fail: bool) {
        self.fail_dequeue.store(fail, Ordering::SeqCst);
    }

    pub fn set_delete_failure(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn dequeue(
        &self,
        max_messages: u32,
        _visibility_timeout: Duration,
    ) -> Result<Vec<DequeuedMessage>, QueueError> {
        if self.fail_dequeue.load(Ordering::SeqCst) {
            return Err(QueueError::Request("[MOCK] dequeue configured to fail".to_string()));
        }
        let mut ready = self.ready.write().await;
        let mut in_flight = self.in_flight.write().await;
        let mut out = Vec::new();
        while out.len() < max_messages as usize {
            let Some(message) = ready.pop_front() else {
                break;
            };
            let receipt = format!("rcpt_{:08x}", self.counter.fetch_add(1, Ordering::SeqCst));
            out.push(DequeuedMessage {
                id: message.id.clone(),
                pop_receipt: receipt.clone(),
                text: message.text.clone(),
            });
            in_flight.insert(message.id.clone(), (receipt, message));
        }
        Ok(out)
    }

    async fn delete_message(&self, id: &str, pop_receipt: &str) -> Result<(), QueueError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(QueueError::Request("[MOCK] delete configured to fail".to_string()));
        }
        let mut in_flight = self.in_flight.write().await;
        match in_flight.get(id) {
            Some((receipt, _)) if receipt == pop_receipt => {
                in_flight.remove(id);
                Ok(())
            }
            _ => Err(QueueError::MessageNotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_script() {
        let op = InMemoryOperation::failing(1, 1);
        assert!(op.done().await.is_err());
        assert!(!op.done().await.unwrap());
        assert!(op.done().await.unwrap());
        assert!(op.done().await.unwrap());
        assert_eq!(op.poll_count(), 4);
    }

    #[tokio::test]
    async fn test_fleet_mutations() {
        let fleet = InMemoryFleet::new();
        fleet
            .insert(ScaleSetSnapshot::new("vmss0", 5, ProvisioningState::Succeeded))
            .await;

        let ids = vec!["1".to_string(), "2".to_string()];
        fleet.delete_instances("rg", "vmss0", &ids).await.unwrap();
        assert_eq!(fleet.get("vmss0").await.unwrap().capacity, 3);

        fleet.delete("rg", "vmss0", false).await.unwrap();
        assert!(fleet.names().await.is_empty());
        assert!(fleet.delete("rg", "vmss0", false).await.err().unwrap().is_not_found());
        assert_eq!(fleet.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_fleet_failure_injection() {
        let fleet = InMemoryFleet::new();
        fleet
            .insert(ScaleSetSnapshot::new("vmss0", 5, ProvisioningState::Succeeded))
            .await;
        fleet.fail_mutations_for("vmss0").await;
        assert!(fleet.delete("rg", "vmss0", false).await.is_err());
        assert!(fleet.get("vmss0").await.is_some());
        assert!(fleet.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_tag_store() {
        let tags = InMemoryTagStore::new();
        assert!(tags.get_int_tag("rg", "TOTAL_NODES").await.unwrap_err().is_not_found());

        tags.set_int_tag("rg", "TOTAL_NODES", 42).await.unwrap();
        assert_eq!(tags.get_int_tag("rg", "TOTAL_NODES").await.unwrap(), 42);

        tags.set_raw("rg", "TOTAL_NODES", "many").await;
        assert!(matches!(
            tags.get_int_tag("rg", "TOTAL_NODES").await,
            Err(TagError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_queue_visibility() {
        let queue = InMemoryQueue::new();
        queue.enqueue("vmss0,1").await;
        queue.enqueue("vmss0,2").await;

        let batch = queue.dequeue(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].text, "vmss0,1");
        assert_eq!(queue.visible_count().await, 1);
        assert_eq!(queue.in_flight_count().await, 1);

        queue.expire_in_flight().await;
        assert_eq!(queue.visible_count().await, 2);

        // The old receipt is gone once the message is redelivered.
        let err = queue
            .delete_message(&batch[0].id, &batch[0].pop_receipt)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::MessageNotFound(_)));
    }
}

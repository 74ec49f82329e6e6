//! Operation tracker actor.
//!
//! Tracks at most one long-running control plane operation per scale set
//! and polls each one on its own adaptive schedule. The actor task is the
//! only owner of the name → operation map; callers interact with it through
//! [`OperationTracker`].
//!
//! ## Polling
//!
//! A ticker task sends `Tick` into the mailbox. On each tick the actor picks
//! every operation whose wait has elapsed and that has no status query in
//! flight, and spawns the (slow) query off the actor task. The result comes
//! back as `PollFinished` tagged with the generation of the entry it was
//! issued for; a result whose entry has since been replaced or removed is
//! discarded.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy, Supervisor};
use crate::cloud::Operation;
use crate::error::CloudError;

/// Operation tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How often due operations are looked for.
    pub poll_tick: Duration,

    /// Default poll interval (`base`) and error backoff.
    pub backoff: BackoffPolicy,

    /// How often the watched operations are logged.
    pub stats_interval: Duration,

    /// Mailbox capacity.
    pub mailbox_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_tick: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            stats_interval: Duration::from_secs(30),
            mailbox_size: 1024,
        }
    }
}

/// Messages handled by the tracker actor.
pub enum TrackerMessage {
    /// Start tracking `operation` under `name`, replacing any previous entry.
    Watch { name: String, operation: Operation },

    /// Ask whether nothing is tracked under `name`.
    IsSettled {
        name: String,
        reply_to: oneshot::Sender<bool>,
    },

    /// Ask for every name with a tracked operation.
    Pending {
        reply_to: oneshot::Sender<BTreeSet<String>>,
    },

    /// Poll every due operation.
    Tick,

    /// Result of a status query issued for entry `generation`.
    PollFinished {
        name: String,
        generation: u64,
        result: Result<bool, CloudError>,
    },
}

impl fmt::Debug for TrackerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Watch { name, .. } => f.debug_struct("Watch").field("name", name).finish(),
            Self::IsSettled { name, .. } => {
                f.debug_struct("IsSettled").field("name", name).finish()
            }
            Self::Pending { .. } => f.write_str("Pending"),
            Self::Tick => f.write_str("Tick"),
            Self::PollFinished {
                name,
                generation,
                result,
            } => f
                .debug_struct("PollFinished")
                .field("name", name)
                .field("generation", generation)
                .field("result", result)
                .finish(),
        }
    }
}

/// One tracked operation.
struct TrackedOperation {
    /// Distinguishes this entry from earlier ones under the same name.
    generation: u64,
    last_query: Instant,
    wait: Duration,
    attempts: u32,
    in_flight: bool,
    operation: Operation,
}

/// The actor owning the operation map.
pub struct OperationTrackerActor {
    config: TrackerConfig,
    operations: HashMap<String, TrackedOperation>,
    next_generation: u64,
    last_stats: Option<Instant>,
}

impl OperationTrackerActor {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            operations: HashMap::new(),
            next_generation: 0,
            last_stats: None,
        }
    }

    fn default_wait(&self, operation: &Operation) -> Duration {
        operation
            .suggested_delay()
            .unwrap_or(self.config.backoff.base)
    }

    fn watch(&mut self, name: String, operation: Operation) {
        self.next_generation += 1;
        let wait = self.default_wait(&operation);
        let previous = self.operations.insert(
            name.clone(),
            TrackedOperation {
                generation: self.next_generation,
                last_query: Instant::now(),
                wait,
                attempts: 0,
                in_flight: false,
                operation,
            },
        );
        if previous.is_some() {
            info!(scale_set = %name, "Replacing watched operation");
        } else {
            debug!(scale_set = %name, wait_ms = wait.as_millis() as u64, "Watching operation");
        }
    }

    fn log_stats(&mut self, messages_processed: u64) {
        let due = self
            .last_stats
            .map_or(true, |t| t.elapsed() >= self.config.stats_interval);
        if !due {
            return;
        }
        self.last_stats = Some(Instant::now());
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        info!(
            count = names.len(),
            operations = ?names,
            messages_processed,
            "Watching operations"
        );
    }

    fn poll_due(&mut self, myself: &ActorHandle<TrackerMessage>) {
        for (name, entry) in &mut self.operations {
            if entry.in_flight || entry.last_query.elapsed() < entry.wait {
                continue;
            }
            entry.in_flight = true;

            let name = name.clone();
            let generation = entry.generation;
            let operation = entry.operation.clone();
            let myself = myself.clone();
            debug!(scale_set = %name, generation, "Querying operation status");

            tokio::spawn(async move {
                let result = operation.done().await;
                let msg = TrackerMessage::PollFinished {
                    name,
                    generation,
                    result,
                };
                // The tracker may have shut down meanwhile.
                let _ = myself.send(msg).await;
            });
        }
    }

    fn poll_finished(&mut self, name: String, generation: u64, result: Result<bool, CloudError>) {
        let Some(entry) = self.operations.get_mut(&name) else {
            debug!(scale_set = %name, generation, "Discarding poll result for removed operation");
            return;
        };
        if entry.generation != generation {
            debug!(scale_set = %name, generation, "Discarding stale poll result");
            return;
        }

        entry.in_flight = false;
        match result {
            Ok(true) => {
                info!(
                    scale_set = %name,
                    status = %entry.operation.status(),
                    "Operation complete"
                );
                self.operations.remove(&name);
                return;
            }
            Ok(false) => {
                entry.attempts = 0;
                entry.wait = entry
                    .operation
                    .suggested_delay()
                    .unwrap_or(self.config.backoff.base);
            }
            Err(e) => {
                entry.attempts = self.config.backoff.next_attempt(entry.attempts);
                entry.wait = self.config.backoff.delay(entry.attempts);
                error!(
                    scale_set = %name,
                    attempts = entry.attempts,
                    wait_ms = entry.wait.as_millis() as u64,
                    error = %e,
                    "Operation status query failed"
                );
            }
        }
        entry.last_query = Instant::now();
    }

    #[cfg(test)]
    fn wait_for(&self, name: &str) -> Option<(Duration, u32)> {
        self.operations.get(name).map(|e| (e.wait, e.attempts))
    }
}

#[async_trait]
impl Actor for OperationTrackerActor {
    type Message = TrackerMessage;

    fn name(&self) -> &str {
        "operation_tracker"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<TrackerMessage>) {
        let myself = ctx.myself.clone();
        let mut shutdown = ctx.shutdown.clone();
        let mut interval = tokio::time::interval(self.config.poll_tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match myself.try_send(TrackerMessage::Tick) {
                            Ok(()) | Err(ActorError::MailboxFull) => {}
                            Err(_) => break,
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn handle(
        &mut self,
        msg: TrackerMessage,
        ctx: &mut ActorContext<TrackerMessage>,
    ) -> ControlFlow<()> {
        match msg {
            TrackerMessage::Watch { name, operation } => self.watch(name, operation),
            TrackerMessage::IsSettled { name, reply_to } => {
                let _ = reply_to.send(!self.operations.contains_key(&name));
            }
            TrackerMessage::Pending { reply_to } => {
                let _ = reply_to.send(self.operations.keys().cloned().collect());
            }
            TrackerMessage::Tick => {
                self.log_stats(ctx.messages_processed);
                self.poll_due(&ctx.myself);
            }
            TrackerMessage::PollFinished {
                name,
                generation,
                result,
            } => self.poll_finished(name, generation, result),
        }
        ControlFlow::Continue(())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<TrackerMessage>) {
        if !self.operations.is_empty() {
            warn!(
                count = self.operations.len(),
                "Operation tracker stopping with operations still pending"
            );
        }
    }
}

/// Cloneable front end to the tracker actor.
#[derive(Clone)]
pub struct OperationTracker {
    handle: ActorHandle<TrackerMessage>,
}

impl OperationTracker {
    /// Spawn the tracker actor under `supervisor`.
    pub fn spawn(supervisor: &mut Supervisor, config: TrackerConfig) -> Self {
        let mailbox_size = config.mailbox_size;
        let handle = supervisor.spawn(OperationTrackerActor::new(config), mailbox_size);
        Self { handle }
    }

    /// Track `operation` under `name`, replacing any previous one.
    pub async fn watch(
        &self,
        name: impl Into<String>,
        operation: Operation,
    ) -> Result<(), ActorError> {
        self.handle
            .send(TrackerMessage::Watch {
                name: name.into(),
                operation,
            })
            .await
    }

    /// True iff no operation is tracked under `name`.
    pub async fn is_settled(&self, name: &str) -> Result<bool, ActorError> {
        let (reply_to, rx) = oneshot::channel();
        self.handle
            .send(TrackerMessage::IsSettled {
                name: name.to_string(),
                reply_to,
            })
            .await?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }

    /// Every name with a tracked operation.
    pub async fn pending(&self) -> Result<BTreeSet<String>, ActorError> {
        let (reply_to, rx) = oneshot::channel();
        self.handle.send(TrackerMessage::Pending { reply_to }).await?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryOperation;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            poll_tick: Duration::from_millis(5),
            backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(40),
                max_attempts: 8,
            },
            stats_interval: Duration::from_secs(30),
            mailbox_size: 64,
        }
    }

    async fn wait_settled(tracker: &OperationTracker, name: &str) -> bool {
        for _ in 0..200 {
            if tracker.is_settled(name).await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn spawn_tracker() -> (OperationTracker, Supervisor, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let tracker = OperationTracker::spawn(&mut supervisor, fast_config());
        (tracker, supervisor, shutdown_tx)
    }

    #[tokio::test]
    async fn test_unknown_name_is_settled() {
        let (tracker, _supervisor, _tx) = spawn_tracker();
        assert!(tracker.is_settled("vmss0").await.unwrap());
        assert!(tracker.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completed_operation_settles() {
        let (tracker, _supervisor, _tx) = spawn_tracker();
        let op = Arc::new(InMemoryOperation::after_polls(2));
        tracker.watch("vmss0", op.clone()).await.unwrap();

        assert!(!tracker.is_settled("vmss0").await.unwrap());
        assert!(wait_settled(&tracker, "vmss0").await);
        assert_eq!(op.poll_count(), 3);
    }

    #[tokio::test]
    async fn test_errors_are_retried_until_done() {
        let (tracker, _supervisor, _tx) = spawn_tracker();
        let op = Arc::new(InMemoryOperation::failing(3, 0));
        tracker.watch("vmss0", op.clone()).await.unwrap();

        assert!(wait_settled(&tracker, "vmss0").await);
        assert_eq!(op.poll_count(), 4);
    }

    #[tokio::test]
    async fn test_watch_replaces_previous_operation() {
        let (tracker, _supervisor, _tx) = spawn_tracker();
        let first = Arc::new(InMemoryOperation::never());
        let second = Arc::new(InMemoryOperation::completed());

        tracker.watch("vmss0", first.clone()).await.unwrap();
        tracker.watch("vmss0", second.clone()).await.unwrap();
        assert_eq!(tracker.pending().await.unwrap().len(), 1);

        // Only the replacement is polled; once it finishes the name settles
        // even though the first operation never would.
        assert!(wait_settled(&tracker, "vmss0").await);
        assert_eq!(first.poll_count(), 0);
        assert!(second.poll_count() >= 1);
    }

    #[tokio::test]
    async fn test_pending_lists_names() {
        let (tracker, _supervisor, _tx) = spawn_tracker();
        tracker
            .watch("vmss1", Arc::new(InMemoryOperation::never()))
            .await
            .unwrap();
        tracker
            .watch("vmss0", Arc::new(InMemoryOperation::never()))
            .await
            .unwrap();

        let pending: Vec<_> = tracker.pending().await.unwrap().into_iter().collect();
        assert_eq!(pending, vec!["vmss0", "vmss1"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_tracker() {
        let (tracker, _supervisor, tx) = spawn_tracker();
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tracker.is_settled("vmss0").await.is_err());
    }

    // The remaining tests drive the actor state directly.

    fn context() -> (ActorContext<TrackerMessage>, mpsc::Receiver<TrackerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = ActorContext::new("test".to_string(), ActorHandle::new(tx, "test"), shutdown_rx);
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_stale_result_is_discarded() {
        let mut actor = OperationTrackerActor::new(fast_config());
        let (mut ctx, _rx) = context();

        let flow = actor
            .handle(
                TrackerMessage::Watch {
                    name: "vmss0".to_string(),
                    operation: Arc::new(InMemoryOperation::never()),
                },
                &mut ctx,
            )
            .await;
        assert!(flow.is_continue());
        let first_generation = actor.operations["vmss0"].generation;

        actor.watch("vmss0".to_string(), Arc::new(InMemoryOperation::never()));

        // A "done" for the replaced entry must not remove the new one.
        actor.poll_finished("vmss0".to_string(), first_generation, Ok(true));
        assert!(actor.operations.contains_key("vmss0"));

        // Results for names no longer tracked are ignored.
        actor.poll_finished("vmss9".to_string(), 1, Ok(true));
        assert!(!actor.operations.contains_key("vmss9"));
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let config = fast_config();
        let max = config.backoff.max;
        let mut actor = OperationTrackerActor::new(config);
        actor.watch("vmss0".to_string(), Arc::new(InMemoryOperation::never()));
        let generation = actor.operations["vmss0"].generation;

        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            actor.poll_finished(
                "vmss0".to_string(),
                generation,
                Err(CloudError::Request("boom".to_string())),
            );
            let (wait, attempts) = actor.wait_for("vmss0").unwrap();
            assert!(wait >= previous);
            assert!(wait <= max);
            assert!(attempts <= 8);
            previous = wait;
        }
        assert_eq!(previous, max);

        // A clean "not done" resets the attempts and the wait.
        actor.poll_finished("vmss0".to_string(), generation, Ok(false));
        assert_eq!(actor.wait_for("vmss0"), Some((Duration::from_millis(5), 0)));
    }

    #[tokio::test]
    async fn test_suggested_delay_is_honoured() {
        let mut actor = OperationTrackerActor::new(fast_config());
        let op = InMemoryOperation::never().with_delay(Duration::from_secs(7));
        actor.watch("vmss0".to_string(), Arc::new(op));
        assert_eq!(actor.wait_for("vmss0"), Some((Duration::from_secs(7), 0)));

        let generation = actor.operations["vmss0"].generation;
        actor.poll_finished("vmss0".to_string(), generation, Ok(false));
        assert_eq!(actor.wait_for("vmss0"), Some((Duration::from_secs(7), 0)));
    }

    #[tokio::test]
    async fn test_in_flight_operation_is_not_polled_twice() {
        let mut actor = OperationTrackerActor::new(TrackerConfig {
            backoff: BackoffPolicy {
                base: Duration::ZERO,
                ..fast_config().backoff
            },
            ..fast_config()
        });
        let (ctx, mut rx) = context();
        let op = Arc::new(InMemoryOperation::never());
        actor.watch("vmss0".to_string(), op.clone());

        actor.poll_due(&ctx.myself);
        actor.poll_due(&ctx.myself);

        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, TrackerMessage::PollFinished { .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(op.poll_count(), 1);
    }
}

//! Minimal actor runtime.
//!
//! An actor owns its state and runs on its own task, draining a bounded
//! mailbox one message at a time. The [`Supervisor`] spawns actors and stops
//! them together; everything else talks to an actor through a cloneable
//! [`ActorHandle`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Anything that can travel through a mailbox.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Prefix of the actor id, used in logs.
    fn name(&self) -> &str;

    /// Process one message. `Break` ends the actor.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> ControlFlow<()>;

    /// Runs once on the actor task before the first message.
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) {}

    /// Runs once on the actor task after the last message.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}
}

/// Per-actor state owned by the runtime and lent to the actor.
pub struct ActorContext<M: Message> {
    pub actor_id: String,

    /// The actor's own mailbox, for work that reports back later.
    pub myself: ActorHandle<M>,

    /// Process-wide shutdown signal.
    pub shutdown: watch::Receiver<bool>,

    /// Messages taken from the mailbox so far.
    pub messages_processed: u64,
}

impl<M: Message> ActorContext<M> {
    pub fn new(actor_id: String, myself: ActorHandle<M>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            myself,
            shutdown,
            messages_processed: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,
}

/// Sending side of an actor's mailbox.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

// Derived Clone would require `M: Clone`.
impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    pub fn new(tx: mpsc::Sender<M>, actor_id: impl Into<String>) -> Self {
        Self {
            tx,
            actor_id: actor_id.into(),
        }
    }

    /// Wait for mailbox room, then enqueue `msg`.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }

    /// Enqueue `msg` only if the mailbox has room right now.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Supervisor's view of one spawned actor.
struct Child {
    task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// Capped exponential backoff.
///
/// `delay(n) = base * 2^n`, never above `max`. The attempt counter itself is
/// clamped to `max_attempts` so long-running loops cannot overflow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for attempt zero; also the default poll interval.
    pub base: Duration,
    pub max: Duration,
    /// Ceiling for the attempt counter.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(15),
            max: Duration::from_secs(5 * 60),
            max_attempts: 16,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.min(self.max_attempts).min(31);
        self.base
            .checked_mul(1u32 << attempt)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Increment an attempt counter, saturating at `max_attempts`.
    pub fn next_attempt(&self, attempt: u32) -> u32 {
        attempt.saturating_add(1).min(self.max_attempts)
    }
}

/// Spawns actors and stops them together.
pub struct Supervisor {
    children: HashMap<String, Child>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            children: HashMap::new(),
            shutdown,
        }
    }

    /// Start `actor` on its own task with a mailbox of `mailbox_size`.
    pub fn spawn<A: Actor>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message> {
        let actor_id = format!("{}_{}", actor.name(), next_actor_id());
        let (tx, rx) = mpsc::channel(mailbox_size);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ActorHandle::new(tx, actor_id.clone());

        let task = tokio::spawn(run_actor(
            actor,
            rx,
            handle.clone(),
            stop_rx,
            self.shutdown.clone(),
        ));
        info!(actor_id = %actor_id, "Spawned actor");
        self.children.insert(actor_id, Child { task, stop_tx });

        handle
    }

    /// Signal every child, give them ten seconds to finish, then abort the rest.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");
        for child in self.children.values() {
            let _ = child.stop_tx.send(true);
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline && self.children.values().any(|c| !c.task.is_finished()) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for (actor_id, child) in self.children.drain() {
            if !child.task.is_finished() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.task.abort();
            }
        }
    }
}

/// Drive `actor` until it breaks, its mailbox closes, or either stop
/// signal fires (or loses its sender).
async fn run_actor<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    myself: ActorHandle<A::Message>,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ctx = ActorContext::new(myself.actor_id().to_string(), myself, shutdown.clone());
    actor.on_start(&mut ctx).await;
    debug!(actor_id = %ctx.actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!(actor_id = %ctx.actor_id, "Actor received stop signal");
                    break;
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %ctx.actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %ctx.actor_id, "Actor mailbox closed");
                    break;
                };
                ctx.messages_processed += 1;
                if actor.handle(msg, &mut ctx).await.is_break() {
                    info!(actor_id = %ctx.actor_id, "Actor requested stop");
                    break;
                }
            }
        }
    }

    // Closing the mailbox makes later sends fail fast.
    rx.close();
    actor.on_stop(&mut ctx).await;
    info!(
        actor_id = %ctx.actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    enum CounterMessage {
        Add(u64),
        Get(oneshot::Sender<u64>),
        Processed(oneshot::Sender<u64>),
        Stop,
    }

    struct Counter {
        total: u64,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(
            &mut self,
            msg: CounterMessage,
            ctx: &mut ActorContext<CounterMessage>,
        ) -> ControlFlow<()> {
            match msg {
                CounterMessage::Add(n) => self.total += n,
                CounterMessage::Get(reply) => {
                    let _ = reply.send(self.total);
                }
                CounterMessage::Processed(reply) => {
                    let _ = reply.send(ctx.messages_processed);
                }
                CounterMessage::Stop => return ControlFlow::Break(()),
            }
            ControlFlow::Continue(())
        }
    }

    fn spawn_counter() -> (Supervisor, ActorHandle<CounterMessage>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let handle = supervisor.spawn(Counter { total: 0 }, 8);
        (supervisor, handle, shutdown_tx)
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 16,
        };

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(6), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(u32::MAX), policy.max);
        assert_eq!(policy.next_attempt(u32::MAX), policy.max_attempts);
    }

    #[tokio::test]
    async fn test_try_send_full_mailbox() {
        let (tx, _rx) = mpsc::channel::<u64>(1);
        let handle = ActorHandle::new(tx, "test");

        handle.try_send(1).unwrap();
        assert!(matches!(handle.try_send(2), Err(ActorError::MailboxFull)));
        assert_eq!(handle.actor_id(), "test");
    }

    #[tokio::test]
    async fn test_supervisor_spawn_and_stop() {
        let (mut supervisor, handle, _shutdown_tx) = spawn_counter();
        assert!(handle.actor_id().starts_with("counter_"));

        handle.send(CounterMessage::Add(2)).await.unwrap();
        handle.send(CounterMessage::Add(3)).await.unwrap();
        let (tx, rx) = oneshot::channel();
        handle.send(CounterMessage::Get(tx)).await.unwrap();
        assert_eq!(rx.await.unwrap(), 5);

        supervisor.stop_all().await;
        assert!(matches!(
            handle.send(CounterMessage::Add(1)).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_context_counts_processed_messages() {
        let (_supervisor, handle, _shutdown_tx) = spawn_counter();

        for n in 0..4 {
            handle.send(CounterMessage::Add(n)).await.unwrap();
        }
        let (tx, rx) = oneshot::channel();
        handle.send(CounterMessage::Processed(tx)).await.unwrap();
        assert_eq!(rx.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_actor_requested_stop() {
        let (_supervisor, handle, _shutdown_tx) = spawn_counter();

        handle.send(CounterMessage::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.send(CounterMessage::Add(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_global_shutdown_stops_actor() {
        let (_supervisor, handle, shutdown_tx) = spawn_counter();

        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            handle.try_send(CounterMessage::Add(1)),
            Err(ActorError::ActorStopped)
        ));
    }
}

//! Actor framework for the scaler.
//!
//! ## Design Principles
//!
//! - **Single owner**: Each actor owns its mutable state; other tasks only
//!   reach it through the mailbox
//! - **Slow work off the actor**: Network calls run on spawned tasks and
//!   report back as messages, so queries are never blocked behind them
//!
//! ## Actor Types
//!
//! - `OperationTrackerActor`: Watches in-flight control plane operations

mod framework;
mod operations;

pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy, Message, Supervisor,
};
pub use operations::{OperationTracker, OperationTrackerActor, TrackerConfig, TrackerMessage};

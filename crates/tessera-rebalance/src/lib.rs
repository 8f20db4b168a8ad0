//! Rebalance coordinator.
//!
//! Watches `pending-assignments-*` and `stable-assignments-*` in the Meta
//! Store and moves each partition from its stable placement to its pending
//! one once every newly added replica holds the partition's data.

mod assignment;
mod coordinator;
pub mod keys;
mod partition;
mod probe;

pub use assignment::{Assignment, Assignments};
pub use coordinator::{CoordinatorConfig, CoordinatorHandle, RebalanceCoordinator};
pub use keys::{pending_key, stable_key, TablePartitionId};
pub use partition::{decide, Decision, Observed, PartitionState, PartitionView};
pub use probe::{Backoff, CatchUpPolicy, DataProbe};

//! Reconciliation workspace facade
//!
//! Re-exports the workspace crates so hosts can depend on a single crate:
//! - [`bridge_traits`]: resource and source contracts
//! - [`core_runtime`]: configuration, logging and events
//! - [`core_controller`]: store, queues, reflector and controller
//! - [`bridge_memory`]: in-process source and logger (feature `memory-source`)

pub use bridge_traits;
pub use core_controller;
pub use core_runtime;

#[cfg(feature = "memory-source")]
pub use bridge_memory;

pub use bridge_traits::{ListWatcher, ObjectMeta, Resource};
pub use core_controller::{Controller, ObjectKey, Store, SyncError, SyncHandler};
pub use core_runtime::{ControllerConfig, EventBus};

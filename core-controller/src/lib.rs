//! # Reconciliation Controller
//!
//! Mirrors a remote collection into a local cache and drives a user handler
//! for every key that changed.
//!
//! ## Overview
//!
//! Remote change → [`Reflector`] → store write, then queue add → worker
//! dequeues the key → [`SyncHandler`] reads the current object from the
//! [`Store`] and acts → the outcome decides between forget, retry and drop.
//!
//! ## Components
//!
//! - **Keys** (`key`): `namespace/name` cache keys and their inverse
//! - **Label Selectors** (`selector`): equality-based label filters
//! - **Store** (`store`): thread-safe key → object cache with secondary indices
//! - **Work Queues** (`queue`): deduplicating, delaying and rate-limited queues
//! - **Reflector** (`reflector`): list + watch loop feeding store and queue
//! - **Cache-Sync Barrier** (`barrier`): gate between the first list and the workers
//! - **State Machine** (`state`): controller lifecycle with validated transitions
//! - **Handler** (`handler`): sync handler and error sink contracts
//! - **Controller** (`controller`): startup ordering, worker pool, retry policy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_controller::Controller;
//! use core_runtime::ControllerConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ControllerConfig::builder().name("pods").workers(2).build()?;
//! let controller = Controller::new(config, source, handler)?;
//!
//! let cancel = CancellationToken::new();
//! controller.run(cancel.clone()).await?;
//! ```

pub mod barrier;
pub mod controller;
pub mod error;
pub mod handler;
pub mod key;
pub mod queue;
pub mod reflector;
pub mod selector;
pub mod state;
pub mod store;

pub use barrier::CacheSyncBarrier;
pub use controller::Controller;
pub use error::{ControllerError, Result, SyncError};
pub use handler::{ChannelErrorSink, DroppedKey, ErrorSink, SyncHandler, TracingErrorSink};
pub use key::{deletion_handling_key, meta_namespace_key, split_key, ObjectKey};
pub use queue::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter, DelayingQueue,
    ItemExponentialFailureRateLimiter, MaxOfRateLimiter, QueueStats, RateLimiter,
    RateLimitingQueue, WorkQueue,
};
pub use reflector::Reflector;
pub use selector::{LabelSelector, Operator, Requirement};
pub use state::ControllerState;
pub use store::{label_index, namespace_index, IndexFunc, Indexers, Store, NAMESPACE_INDEX};

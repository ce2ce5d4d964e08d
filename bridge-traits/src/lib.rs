//! # Controller Bridge Traits
//!
//! Contracts between the reconciliation core and the collaborators it does not
//! own: the remote source of truth it watches and the host logging pipeline.
//!
//! ## Overview
//!
//! The core never talks to a cluster, an API server or a database directly.
//! Everything it needs from the outside world is expressed as a trait in this
//! crate and injected when the controller is constructed. Concrete adapters
//! live in separate crates (`bridge-memory` ships the in-process defaults used
//! by tests and the demo binary).
//!
//! ## Traits
//!
//! ### Resources
//! - [`Resource`](resource::Resource) - Anything carrying [`ObjectMeta`](resource::ObjectMeta)
//!
//! ### Sources
//! - [`ListWatcher`](source::ListWatcher) - Snapshot listing plus a change stream
//!
//! ### Utilities
//! - [`LoggerSink`](logging::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Source
//! implementations should map transport failures onto it and leave retrying to
//! the caller: the reflector owns backoff, adapters must not retry on their own.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so one instance can be shared by the
//! reflector task and any number of worker tasks.
//!
//! ## Examples
//!
//! ### Implementing ListWatcher
//!
//! ```ignore
//! use bridge_traits::source::{ListResult, ListWatcher, WatchStream};
//! use bridge_traits::error::Result;
//! use async_trait::async_trait;
//!
//! pub struct PodSource {
//!     client: ApiClient,
//! }
//!
//! #[async_trait]
//! impl ListWatcher<Pod> for PodSource {
//!     async fn list(&self) -> Result<ListResult<Pod>> {
//!         todo!()
//!     }
//!
//!     async fn watch(&self, resource_version: Option<String>) -> Result<WatchStream<Pod>> {
//!         todo!()
//!     }
//! }
//! ```

pub mod error;
pub mod logging;
pub mod resource;
pub mod source;

pub use error::BridgeError;

// Re-export commonly used types
pub use logging::{LogEntry, LogLevel, LoggerSink};
pub use resource::{ObjectMeta, Resource};
pub use source::{DeletedObject, ListResult, ListWatcher, WatchEvent, WatchStream};

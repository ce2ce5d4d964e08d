//! # In-Memory Bridge Implementations
//!
//! Default implementations of the bridge traits that run entirely inside the
//! process.
//!
//! ## Overview
//!
//! - `MemorySource` implements `ListWatcher` over a mutable in-memory
//!   collection, with fault injection for lists, watches and compaction
//! - `ConsoleLogger` implements `LoggerSink` by printing to stdout
//!
//! Both are used by the controller's end-to-end tests and the demo binary.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_memory::MemorySource;
//! use bridge_traits::ObjectMeta;
//! use std::sync::Arc;
//!
//! let source = Arc::new(MemorySource::new());
//! source.add(ObjectMeta::namespaced("default", "web"));
//!
//! // Hand a clone to the controller, keep one to drive changes
//! let controller = Controller::new(config, source.clone(), handler)?;
//! ```

mod logger;
mod source;

pub use logger::ConsoleLogger;
pub use source::{MemorySource, DEFAULT_HISTORY_LIMIT};

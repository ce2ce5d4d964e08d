//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the reconciliation core:
//! - Controller configuration with fail-fast validation
//! - Logging and tracing infrastructure
//! - Event bus for controller lifecycle and per-item events
//!
//! ## Overview
//!
//! This crate contains the ambient utilities the controller crates depend on.
//! It establishes the configuration defaults, logging conventions and event
//! broadcasting used throughout the workspace.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{BackoffConfig, ControllerConfig, ControllerConfigBuilder, RateLimiterConfig};
pub use error::{Error, Result};
pub use events::{ControllerEvent, EventBus, EventStream};

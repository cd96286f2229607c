//! whyrender-core: render diagnostics for component UIs
//!
//! Answers "why did this component re-render?" by tracking every render
//! lifecycle event, diffing parameters and state against the previous
//! render, and flagging renders that changed nothing or arrive too often.
//!
//! # Architecture
//!
//! ```text
//! host lifecycle hook → RenderTracker → ComponentFilter
//!                              ↓
//!        Parameters / Snapshots (TypeMetadataCache) / Frequency / Performance
//!                              ↓
//!                   RenderEvent → sinks (tracing, JSON lines, ...)
//!
//! MaintenanceRunner (tokio interval) → cache expiry, dead-instance cleanup
//! ```
//!
//! # Modules
//!
//! - `tracker`: the orchestrator and its builder
//! - `component`: component types, field descriptors, instance handles
//! - `value`: dynamically typed field values
//! - `compare`: deep value comparison
//! - `metadata`: per-type field classification cache
//! - `snapshot`: state snapshots and change detection
//! - `parameters`: parameter change records and detectors
//! - `classifier`: unnecessary-render classification
//! - `frequency`: render rate tracking
//! - `performance`: render duration tracking
//! - `filter`: include/exclude component filters
//! - `event`, `sink`: render events and their destinations
//! - `maintenance`: periodic background cleanup
//! - `pool`, `sharded`, `counter`: concurrency building blocks
//! - `config`, `logging`, `error`: configuration, tracing setup, errors
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod classifier;
pub mod compare;
pub mod component;
pub mod config;
pub mod counter;
pub mod error;
pub mod event;
pub mod filter;
pub mod frequency;
pub mod logging;
pub mod maintenance;
pub mod metadata;
pub mod parameters;
pub mod performance;
pub mod pool;
pub mod sharded;
pub mod sink;
pub mod snapshot;
pub mod tracker;
pub mod value;

pub use classifier::{RenderTrigger, RenderVerdict, UnnecessaryRenderClassifier};
pub use component::{
    ComponentType, FieldDescriptor, FieldMode, FieldType, InstanceHandle, InstanceLease,
    InstanceRegistry, TrackedComponent,
};
pub use config::TrackerConfig;
pub use error::{ComparisonError, ConfigError, Error, PoolError, Result};
pub use event::RenderEvent;
pub use parameters::{ParameterChange, ParameterChanges};
pub use sink::{CollectingSink, JsonLinesSink, RenderEventSink, TracingSink};
pub use snapshot::{ChangeKind, FieldChange, StateChanges};
pub use tracker::{RenderTracker, RenderTrackerBuilder, SessionIdProvider, TrackOptions};
pub use value::{FieldValue, StateValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

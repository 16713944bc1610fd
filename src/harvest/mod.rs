//! Harvest module - dependent multi-stage harvesting.
//!
//! This module provides the core abstractions of the harvester:
//! - **Traits**: [`Invoke`], [`DependencyState`], [`ExtractionPolicy`] for wiring stages
//! - **Registry**: ordered, uniquely named [`Stage`]s via [`StageRegistry`]
//! - **Sanitizer**: integer-range normalization via [`sanitize()`]
//! - **Pipeline**: async executor via [`pipeline::HarvestPipeline`]

pub mod pipeline;
pub mod registry;
pub mod sanitize;
pub mod traits;

// Re-export commonly used types
pub use traits::{DependencyState, ExtractionPolicy, FnInvoke, Invoke, StageError, StateKey};

pub use registry::{Request, Stage, StageRegistry};

pub use sanitize::{is_sanitized, sanitize, sanitize_in_place};

pub use pipeline::{
    HarvestPipeline, PipelineError, RunSummary, SinkFailurePolicy, StageReport, StageStatus,
};

pub mod client;
pub mod config;
pub mod executor;
pub mod harvest;
pub mod logging;
pub mod model;
pub mod sources;
pub mod store;
pub mod traits;

// Re-export common types for convenience
pub use client::{ClientSettings, Credential, RateLimitedClient, RateLimiter};
pub use executor::*;
pub use harvest::{
    sanitize, DependencyState, ExtractionPolicy, HarvestPipeline, PipelineError, Request,
    RunSummary, SinkFailurePolicy, Stage, StageError, StageRegistry, StateKey,
};
pub use model::*;
pub use store::{
    open_store, JsonLinesStore, MemoryStore, Sink, SinkMode, StoreCredentials, SurrealStore,
};
pub use traits::*;

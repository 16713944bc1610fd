//! Dependent multi-stage harvest executor.
//!
//! This module provides the [`HarvestPipeline`] coordinator that runs the
//! stages of a [`StageRegistry`] strictly in order with:
//! - Async execution via `tokio`
//! - A configurable timeout per stage
//! - Identifier threading through a run-scoped [`DependencyState`]
//! - Per-stage failure isolation: a failed stage becomes an error record
//! - Cooperative cancellation between stages
//! - Structured logging via `tracing`

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::harvest::registry::{Stage, StageRegistry};
use crate::harvest::sanitize::sanitize;
use crate::harvest::traits::{DependencyState, StageError};
use crate::model::HarvestRecord;
use crate::store::Sink;
use crate::traits::PersistenceError;

// ============================================================================
// Pipeline Types
// ============================================================================

/// What the pipeline does when the sink rejects a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkFailurePolicy {
    /// Log, count the failure in the summary and keep harvesting.
    #[default]
    Continue,
    /// Stop the run and return [`PipelineError::Persistence`].
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed { error: String },
    /// Never invoked because the run was cancelled first.
    Skipped,
}

/// Per-stage line of a [`RunSummary`].
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    /// Identifier published into the state by this stage, if any.
    pub produced: Option<Value>,
    /// Set when the record for this stage could not be persisted.
    pub persistence_error: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub stages: Vec<StageReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub persistence_failures: usize,
    pub cancelled: bool,
    pub total_duration_ms: u64,
}

impl RunSummary {
    pub fn report(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.name == name)
    }

    pub fn skipped(&self) -> usize {
        self.stages
            .iter()
            .filter(|report| report.status == StageStatus::Skipped)
            .count()
    }
}

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Errors that end a run or reject a registry.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Two stages in one registry share a name
    #[error("Stage '{0}' is already registered")]
    DuplicateStage(String),

    /// A record could not be stored and the sink policy is `Abort`
    #[error("Persisting record for stage '{stage}' failed: {source}")]
    Persistence {
        stage: String,
        #[source]
        source: PersistenceError,
    },
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// Ordered harvest run over a [`StageRegistry`].
///
/// For every stage, in registry order:
/// 1. **Invoke** the stage with the current [`DependencyState`]
/// 2. **Extract** the declared identifier into the state (producers only)
/// 3. **Sanitize** the payload
/// 4. **Persist** a success record, or an error record if the stage failed
///
/// A failing stage never ends the run. No stage is retried.
///
/// # Example
///
/// ```ignore
/// let pipeline = HarvestPipeline::new().with_timeout(Duration::from_secs(30));
/// let mut state = DependencyState::new();
/// let summary = pipeline.execute(&registry, &mut state, &sink).await?;
/// println!("{} ok, {} failed", summary.succeeded, summary.failed);
/// ```
#[derive(Debug, Clone)]
pub struct HarvestPipeline {
    /// Timeout for each stage (default: 60 seconds)
    stage_timeout: Duration,

    sink_policy: SinkFailurePolicy,

    cancel: CancellationToken,
}

impl Default for HarvestPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl HarvestPipeline {
    /// Default configuration:
    /// - Timeout: 60 seconds per stage
    /// - Sink failures: logged, run continues
    pub fn new() -> Self {
        Self {
            stage_timeout: Duration::from_secs(60),
            sink_policy: SinkFailurePolicy::Continue,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_sink_policy(mut self, policy: SinkFailurePolicy) -> Self {
        self.sink_policy = policy;
        self
    }

    /// Uses `token` for cancellation. It is checked before each stage; a
    /// stage already in flight runs to completion or to its timeout.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every stage of `registry` in order.
    ///
    /// # Errors
    ///
    /// Only [`PipelineError::Persistence`], and only under
    /// [`SinkFailurePolicy::Abort`]. Stage failures are reported through the
    /// summary and the persisted error records.
    pub async fn execute(
        &self,
        registry: &StageRegistry,
        state: &mut DependencyState,
        sink: &Sink,
    ) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        let mut summary = RunSummary::default();

        for (stage, key) in registry.unresolved_consumers() {
            debug!(stage, key = %key, "Consumer has no earlier producer");
        }

        for stage in registry.stages() {
            if self.cancel.is_cancelled() {
                if !summary.cancelled {
                    warn!(stage = stage.name(), "Run cancelled, remaining stages skipped");
                }
                summary.cancelled = true;
                summary.stages.push(StageReport {
                    name: stage.name().to_string(),
                    status: StageStatus::Skipped,
                    produced: None,
                    persistence_error: None,
                    duration_ms: 0,
                });
                continue;
            }

            let report = self.run_stage(stage, state, sink).await?;
            match report.status {
                StageStatus::Succeeded => summary.succeeded += 1,
                StageStatus::Failed { .. } => summary.failed += 1,
                StageStatus::Skipped => {}
            }
            if report.persistence_error.is_some() {
                summary.persistence_failures += 1;
            }
            summary.stages.push(report);
        }

        summary.total_duration_ms = start.elapsed().as_millis() as u64;
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            persistence_failures = summary.persistence_failures,
            cancelled = summary.cancelled,
            duration_ms = summary.total_duration_ms,
            "Harvest run completed"
        );
        Ok(summary)
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        state: &mut DependencyState,
        sink: &Sink,
    ) -> Result<StageReport, PipelineError> {
        let stage_start = Instant::now();
        let name = stage.name();
        let params = stage.declared_params().clone();

        let outcome = match timeout(self.stage_timeout, stage.invoke(state)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                stage: name.to_string(),
                timeout: self.stage_timeout,
            }),
        };

        let mut produced = None;
        let (record, status) = match outcome {
            Ok(payload) => {
                if let Some((key, policy)) = stage.production() {
                    match policy.extract(&payload) {
                        Some(value) => {
                            debug!(stage = name, key = %key, value = %value, "Identifier recorded");
                            state.set(key.clone(), value.clone());
                            produced = Some(value);
                        }
                        None => debug!(stage = name, key = %key, "No identifier in payload"),
                    }
                }
                (
                    HarvestRecord::success(name, params, sanitize(&payload)),
                    StageStatus::Succeeded,
                )
            }
            Err(err) => {
                let error = err.to_string();
                (
                    HarvestRecord::error(name, params, &error),
                    StageStatus::Failed { error },
                )
            }
        };

        let persistence_error = match sink.store(&record).await {
            Ok(()) => None,
            Err(source) => {
                error!(stage = name, error = %source, "Failed to persist record");
                if self.sink_policy == SinkFailurePolicy::Abort {
                    return Err(PipelineError::Persistence {
                        stage: name.to_string(),
                        source,
                    });
                }
                Some(source.to_string())
            }
        };

        let duration_ms = stage_start.elapsed().as_millis() as u64;
        match &status {
            StageStatus::Failed { error } => {
                warn!(stage = name, duration_ms, error = %error, "{name} failed ({error})")
            }
            _ => info!(stage = name, duration_ms, "{name} done"),
        }

        Ok(StageReport {
            name: name.to_string(),
            status,
            produced,
            persistence_error,
            duration_ms,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

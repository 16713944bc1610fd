use crate::harvest::{DependencyState, HarvestPipeline, PipelineError, RunSummary, StageRegistry};
use crate::store::Sink;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

/// Runs independent registries concurrently.
///
/// Every run gets its own [`DependencyState`], so identifiers never leak
/// between runs. Runs share the sink and whatever rate limiter their stages'
/// callers were built with, which keeps the aggregate call rate inside one
/// budget.
pub struct HarvesterExecutor {
    semaphore: Arc<Semaphore>,
    pipeline: HarvestPipeline,
}

/// Result of one run launched by [`HarvesterExecutor::execute_all`].
#[derive(Debug)]
pub struct NamedRun {
    pub label: String,
    pub outcome: Result<RunSummary, PipelineError>,
}

impl HarvesterExecutor {
    pub fn new(concurrency_limit: usize, pipeline: HarvestPipeline) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            pipeline,
        }
    }

    /// Runs one registry with a fresh state once a slot is free.
    #[instrument(skip(self, registry, sink))]
    pub async fn execute(
        &self,
        label: &str,
        registry: Arc<StageRegistry>,
        sink: Sink,
    ) -> Result<RunSummary, PipelineError> {
        let _permit = self.semaphore.acquire().await.ok();

        info!("Starting harvest run: {}", label);
        let mut state = DependencyState::new();
        let result = self.pipeline.execute(&registry, &mut state, &sink).await;
        info!("Finished harvest run: {}", label);
        result
    }

    /// Runs every `(label, registry)` pair concurrently, bounded by the
    /// concurrency limit, and returns the outcomes in input order.
    pub async fn execute_all(
        self: Arc<Self>,
        runs: Vec<(String, Arc<StageRegistry>)>,
        sink: Sink,
    ) -> Vec<NamedRun> {
        let mut set = JoinSet::new();
        for (index, (label, registry)) in runs.into_iter().enumerate() {
            let executor = Arc::clone(&self);
            let sink = sink.clone();
            set.spawn(async move {
                let outcome = executor.execute(&label, registry, sink).await;
                (index, NamedRun { label, outcome })
            });
        }

        let mut finished = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => finished.push(entry),
                Err(err) => warn!(error = %err, "Harvest run task failed to join"),
            }
        }
        finished.sort_by_key(|(index, _)| *index);
        finished.into_iter().map(|(_, run)| run).collect()
    }
}

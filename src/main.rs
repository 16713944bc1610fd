use std::process::ExitCode;
use std::sync::Arc;

use api_harvester::config::{ConfigLoader, HarvestConfig, SourceKind};
use api_harvester::sources::{shodan, taxii};
use api_harvester::{
    logging, open_store, ApiCaller, DependencyState, HarvestPipeline, RunSummary, Sink,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match ConfigLoader::new().load() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Configuration error");
            return ExitCode::FAILURE;
        }
    };
    info!(?config, "Configuration loaded");

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Harvest aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &HarvestConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(
        &config.store_uri,
        &config.db_name,
        config.store_credentials.as_ref(),
    )
    .await?;
    let pipeline = HarvestPipeline::new()
        .with_timeout(config.stage_timeout)
        .with_sink_policy(config.sink_policy);

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current stage");
            cancel.cancel();
        }
    });

    match config.source {
        SourceKind::Shodan => {
            let caller: Arc<dyn ApiCaller> = Arc::new(shodan::client(
                config.require_api_key()?,
                config.rate_limit_delay,
                None,
            )?);
            let registry = shodan::endpoint_registry(caller, &shodan::ShodanTargets::default())?;
            let sink = Sink::append(store, config.collection_name.clone());
            let summary = pipeline
                .execute(&registry, &mut DependencyState::new(), &sink)
                .await?;
            print_summary(&summary);
        }
        SourceKind::ShodanHosts => {
            let client = shodan::client(config.require_api_key()?, config.rate_limit_delay, None)?;
            let sink = Sink::upsert(store, config.collection_name.clone(), ["ip"]);
            let summary = shodan::harvest_hosts(&client, &config.target_ips, &sink).await;
            println!(
                "[LOAD] Inserted/Updated {} documents ({} failed).",
                summary.upserted.len(),
                summary.failed.len()
            );
        }
        SourceKind::Taxii => {
            let caller: Arc<dyn ApiCaller> = Arc::new(taxii::client(config.rate_limit_delay, None)?);
            let registry = taxii::collection_registry(caller)?;
            let sink = Sink::append(store, config.collection_name.clone());
            let summary = pipeline
                .execute(&registry, &mut DependencyState::new(), &sink)
                .await?;
            print_summary(&summary);
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} stages succeeded, {} failed, {} not persisted{}",
        summary.succeeded,
        summary.failed,
        summary.persistence_failures,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
}

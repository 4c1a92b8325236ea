use anyhow::Context;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, info, Level};
use uai_salas::config::ENV_CONFIG;
use uai_salas::{Pipeline, PipelineConfig};

const ENV_LOG: &str = "UAI_SALAS_LOG";

#[tokio::main]
async fn main() -> ExitCode {
    let level = std::env::var(ENV_LOG)
        .ok()
        .and_then(|v| Level::from_str(&v).ok())
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = ?e, "Configuration rejected");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!(error = ?e, "Could not start run");
            ExitCode::from(2)
        }
    }
}

fn load_config() -> anyhow::Result<PipelineConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ENV_CONFIG).ok())
        .map(PathBuf::from);

    if let Some(path) = &path {
        info!(path = %path.display(), "Loading configuration");
    }

    PipelineConfig::load(path.as_deref()).context("failed to load configuration")
}

/// Runs once and prints the summary. Returns the run's success flag.
async fn run(config: PipelineConfig) -> anyhow::Result<bool> {
    let fetcher = config.build_fetcher().context("failed to set up source")?;
    let mut pipeline = Pipeline::new(fetcher, config.normalizer());

    match config.build_store().context("failed to set up store")? {
        Some(store) => pipeline = pipeline.with_store(store),
        None => info!("No database URI configured, results will not be persisted"),
    }

    let summary = pipeline.run().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(summary.success)
}

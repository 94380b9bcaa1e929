use std::fs;
use std::sync::Arc;

use clap::Parser;
use filtermate_cli::cli::Args;
use filtermate_cli::logging;
use filtermate_cli::{config_loader, scenario};
use filtermate_core::backend::BackendRegistry;
use filtermate_core::backend::ogr::OgrBackend;
use filtermate_core::config::Config;
use filtermate_core::host::BoxedHost;
use filtermate_core::model::Backend;
use filtermate_core::orchestrator::{Engine, new_session_id};
use log::{error, info, log_enabled, warn};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to read scenario file {0}: {1}")]
    ScenarioIo(std::path::PathBuf, std::io::Error),
    #[error("failed to parse scenario file {0}: {1}")]
    ScenarioParse(std::path::PathBuf, serde_json::Error),
    #[error(transparent)]
    ScenarioBuild(#[from] scenario::ScenarioError),
    #[error(transparent)]
    Config(#[from] config_loader::ConfigLoadError),
}

async fn start(args: Args) -> Result<(), CliError> {
    let format = args.log_format.unwrap_or_default();
    logging::init_tracing(&args.log_filter, format);

    let config = if let Some(path) = &args.config {
        let (config, warnings) = config_loader::read_config(path)?;
        for warning in warnings {
            warn!("unrecognized config key: {warning}");
        }
        info!("using config from {}", path.display());
        config
    } else {
        info!("no config file given, using built-in defaults");
        Config::default()
    };

    let contents = fs::read_to_string(&args.scenario).map_err(|e| CliError::ScenarioIo(args.scenario.clone(), e))?;
    let parsed: scenario::Scenario = serde_json::from_str(&contents).map_err(|e| CliError::ScenarioParse(args.scenario.clone(), e))?;

    let (host, infos) = scenario::build_host(&parsed)?;
    let request = scenario::build_request(&parsed, &infos)?;

    let host: Arc<BoxedHost> = Arc::new(Box::new(host));
    let mut backends = BackendRegistry::new();
    backends.register(Backend::Ogr, Arc::new(OgrBackend::new(Arc::clone(&host))));

    let engine = Engine::new(Arc::clone(&host), config, backends, new_session_id());
    info!("running filter request (session {})", engine.session_id());

    let results = engine.filter(request).await;
    for result in &results {
        if result.success {
            info!("filter applied to layer {} (strategy {:?})", result.layer_id, result.strategy_used);
        } else {
            warn!("filter failed for layer {}: {:?}", result.layer_id, result.error);
        }
    }

    let metrics = engine.metrics();
    info!("backend metrics after run: {metrics:?}");

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = start(Args::parse()).await {
        if log_enabled!(log::Level::Error) {
            error!("{e}");
        } else {
            eprintln!("{e}");
        }
        std::process::exit(1);
    }
}

//! Subcommand handlers.

use crate::{Commands, ConfigAction};
use sentiment_core::scheduler::CronTrigger;
use sentiment_core::{
    ObjectStore, PromotionEngine, PromotionPolicy, ServiceConfig, TrackingBackend, load_config,
    storage_from_config, tracking_from_config,
};
use sentiment_ml::drift::{DriftDetector, DriftPolicy, TextDriftDetector};
use sentiment_ml::gateway::{self, AppState, GatewaySettings};
use sentiment_ml::serving::{self, ProductionLoader, ServingState};
use sentiment_ml::training::{
    ModelReloader, OrchestratorSettings, RetrainOrchestrator, RetrainTrigger, Trainer,
    select_best,
};
use sentiment_ml::{ModelFamily, TrainingParams, eda, prepare_dataset};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            no_bootstrap,
        } => handle_serve(load(config_path)?, host, port, no_bootstrap).await,
        Commands::Train {
            data,
            families,
            promote,
        } => handle_train(&load(config_path)?, data, &families, promote).await,
        Commands::Retrain { bootstrap } => handle_retrain(&load(config_path)?, bootstrap).await,
        Commands::Eda { data } => handle_eda(&load(config_path)?, data).await,
        Commands::Promote { run_id } => handle_promote(&load(config_path)?, &run_id).await,
        Commands::Config { action } => handle_config(action, config_path),
    }
}

fn load(config_path: Option<&Path>) -> anyhow::Result<ServiceConfig> {
    load_config(config_path).map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Backends and long-lived components wired from one configuration.
struct Services {
    store: Arc<dyn ObjectStore>,
    serving: Arc<ServingState>,
    orchestrator: Arc<RetrainOrchestrator>,
    drift: Option<Arc<dyn DriftDetector>>,
}

impl Services {
    async fn build(config: &ServiceConfig) -> anyhow::Result<Self> {
        let tracker = tracking_from_config(&config.tracking)
            .map_err(|e| anyhow::anyhow!("Failed to open tracking backend: {}", e))?;
        let store = storage_from_config(&config.storage)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open object store: {}", e))?;

        let serving = Arc::new(ServingState::new(ProductionLoader::new(
            Arc::clone(&tracker),
            config.model.registered_name.clone(),
            config.model.alias.clone(),
        )));
        let settings = OrchestratorSettings::from_config(config)?;
        let reloader: Arc<dyn ModelReloader> = serving.clone();
        let orchestrator = Arc::new(
            RetrainOrchestrator::new(
                Arc::clone(&tracker),
                Arc::clone(&store),
                PromotionPolicy::from(&config.model),
                settings,
            )
            .with_reloader(reloader),
        );

        let drift: Option<Arc<dyn DriftDetector>> = if config.drift.enabled {
            Some(Arc::new(
                TextDriftDetector::new(DriftPolicy::from(&config.drift))
                    .with_store(Arc::clone(&store), config.storage.reports_prefix.clone())
                    .with_reports_dir(config.server.reports_dir.clone()),
            ))
        } else {
            None
        };

        Ok(Self {
            store,
            serving,
            orchestrator,
            drift,
        })
    }
}

async fn handle_serve(
    config: ServiceConfig,
    host: Option<String>,
    port: Option<u16>,
    no_bootstrap: bool,
) -> anyhow::Result<()> {
    let services = Services::build(&config).await?;

    let bootstrap = config.retrain.bootstrap_on_startup && !no_bootstrap;
    match serving::startup(&services.serving, &services.orchestrator, bootstrap).await {
        Some(model) => info!(
            model = model.family.display_name(),
            version = %model.version.version,
            "Serving production model"
        ),
        None => warn!("Starting without a production model"),
    }

    if let Some(expr) = config.retrain.schedule.as_deref().filter(|s| !s.trim().is_empty()) {
        let trigger = CronTrigger::new("daily-retrain", expr)
            .map_err(|e| anyhow::anyhow!("Invalid retrain schedule: {}", e))?;
        let orchestrator = Arc::clone(&services.orchestrator);
        tokio::spawn(trigger.run(move || {
            let ack = orchestrator.trigger(RetrainTrigger::Scheduled);
            info!(ack = ?ack, "Scheduled retrain fired");
            async {}
        }));
    }

    let state = AppState {
        serving: services.serving,
        orchestrator: services.orchestrator,
        store: services.store,
        drift: services.drift,
        settings: Arc::new(GatewaySettings::from_config(&config)),
    };
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    gateway::serve(state, &host, port)
        .await
        .map_err(|e| anyhow::anyhow!("Gateway failed: {}", e))
}

async fn handle_train(
    config: &ServiceConfig,
    data: Option<PathBuf>,
    families: &[String],
    promote: bool,
) -> anyhow::Result<()> {
    let tracker: Arc<dyn TrackingBackend> = tracking_from_config(&config.tracking)
        .map_err(|e| anyhow::anyhow!("Failed to open tracking backend: {}", e))?;
    let mut params = TrainingParams::from_config(&config.training)?;
    if !families.is_empty() {
        params.families = ModelFamily::parse_list(families)?;
    }
    let path = data.unwrap_or_else(|| config.training.initial_data_path.clone());
    let dataset = prepare_dataset(&path).await?;
    println!("Loaded {} rows from {}", dataset.len(), path.display());

    let trainer = Trainer::new(
        Arc::clone(&tracker),
        config.tracking.experiment_name.clone(),
        config.model.registered_name.clone(),
    );
    let runs = trainer.train_candidates(&dataset, &params).await?;
    let metric = config.model.primary_metric.as_str();

    println!();
    println!("{:<22} {:>10} {:>9}  RUN", "MODEL", metric.to_uppercase(), "VERSION");
    for run in &runs {
        println!(
            "{:<22} {:>10.4} {:>9}  {}",
            run.family.display_name(),
            run.score(metric),
            run.model_version
                .as_ref()
                .map(|v| v.version.as_str())
                .unwrap_or("-"),
            run.run_id
        );
    }

    let Some(best) = select_best(&runs, metric) else {
        anyhow::bail!("No candidate finished training");
    };
    println!();
    println!("Best: {} ({:.4})", best.family.display_name(), best.score(metric));

    if promote {
        let engine = PromotionEngine::new(tracker, PromotionPolicy::from(&config.model));
        let req = engine.request(&best.run_id, best.score(metric), trainer.registered_name());
        let outcome = engine.promote(&req).await?;
        println!(
            "Promotion: {} ({})",
            if outcome.promoted { "promoted" } else { "kept" },
            outcome.context
        );
    }
    Ok(())
}

async fn handle_retrain(config: &ServiceConfig, bootstrap: bool) -> anyhow::Result<()> {
    let services = Services::build(config).await?;
    let trigger = if bootstrap {
        RetrainTrigger::Bootstrap
    } else {
        RetrainTrigger::Manual
    };
    let report = services.orchestrator.run_once(trigger).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.error {
        Some(e) => Err(anyhow::anyhow!("Retrain failed: {}", e)),
        None => Ok(()),
    }
}

async fn handle_eda(config: &ServiceConfig, data: Option<PathBuf>) -> anyhow::Result<()> {
    let path = data.unwrap_or_else(|| config.training.initial_data_path.clone());
    let table = sentiment_ml::Table::read(&path).await?;
    let summary = eda::run_eda(&table)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let tracker = tracking_from_config(&config.tracking)
        .map_err(|e| anyhow::anyhow!("Failed to open tracking backend: {}", e))?;
    let experiment_id = tracker
        .get_or_create_experiment(&config.tracking.experiment_name)
        .await?;
    let run_name = format!("EDA_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S"));
    let run_id = eda::log_eda(tracker.as_ref(), &experiment_id, &run_name, &summary).await?;
    info!(%run_id, "EDA logged");
    Ok(())
}

async fn handle_promote(config: &ServiceConfig, run_id: &str) -> anyhow::Result<()> {
    let tracker = tracking_from_config(&config.tracking)
        .map_err(|e| anyhow::anyhow!("Failed to open tracking backend: {}", e))?;
    let policy = PromotionPolicy::from(&config.model);
    let run = tracker.get_run(run_id).await?;
    let score = run.metric(&policy.primary_metric).unwrap_or(0.0);

    let engine = PromotionEngine::new(tracker, policy);
    let req = engine.request(run_id, score, config.model.registered_name.clone());
    let outcome = engine.promote(&req).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn handle_config(action: ConfigAction, config_path: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            let toml_str = toml::to_string_pretty(&ServiceConfig::default())
                .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
            std::fs::write(&path, toml_str)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(config_path)?;
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_dataset(path: &Path) {
        let mut csv = String::from("text,sentiment\n");
        let positive = ["great", "love", "excellent", "amazing"];
        let negative = ["awful", "broken", "terrible", "refund"];
        for i in 0..12 {
            csv.push_str(&format!(
                "{} phone {} battery,Positive\n",
                positive[i % 4],
                positive[(i + 1) % 4]
            ));
            csv.push_str(&format!(
                "{} screen {} charger,Negative\n",
                negative[i % 4],
                negative[(i + 1) % 4]
            ));
        }
        std::fs::write(path, csv).unwrap();
    }

    /// A config file whose every backend lives under `dir`.
    fn write_config(dir: &Path) -> PathBuf {
        let data = dir.join("initial.csv");
        write_dataset(&data);
        let path = dir.join("sentiment-ops.toml");
        std::fs::write(
            &path,
            format!(
                r#"
[tracking]
local_dir = "{root}/mlruns"

[storage]
local_dir = "{root}/bucket"

[training]
initial_data_path = "{data}"
families = ["lr", "nb"]

[server]
reports_dir = "{root}/reports"
"#,
                root = dir.display(),
                data = data.display()
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_config_init_writes_loadable_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sentiment-ops.toml");
        handle_config(ConfigAction::Init { path: path.clone() }, None).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        let defaults = ServiceConfig::default();
        assert_eq!(loaded.model.registered_name, defaults.model.registered_name);
        assert_eq!(loaded.server.port, defaults.server.port);
    }

    #[test]
    fn test_config_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sentiment-ops.toml");
        std::fs::write(&path, "# mine").unwrap();
        assert!(handle_config(ConfigAction::Init { path: path.clone() }, None).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine");
    }

    #[tokio::test]
    async fn test_train_with_promote_sets_production() {
        let dir = TempDir::new().unwrap();
        let config_path = write_config(dir.path());

        handle_command(
            Commands::Train {
                data: None,
                families: vec![],
                promote: true,
            },
            Some(&config_path),
        )
        .await
        .unwrap();

        let config = load_config(Some(&config_path)).unwrap();
        let tracker = tracking_from_config(&config.tracking).unwrap();
        let production = tracker
            .get_model_version_by_alias(&config.model.registered_name, &config.model.alias)
            .await
            .unwrap();
        assert!(production.is_some());
    }

    #[tokio::test]
    async fn test_retrain_bootstrap_then_promote_run() {
        let dir = TempDir::new().unwrap();
        let config_path = write_config(dir.path());

        handle_command(Commands::Retrain { bootstrap: true }, Some(&config_path))
            .await
            .unwrap();

        let config = load_config(Some(&config_path)).unwrap();
        let tracker = tracking_from_config(&config.tracking).unwrap();
        let production = tracker
            .get_model_version_by_alias(&config.model.registered_name, &config.model.alias)
            .await
            .unwrap()
            .unwrap();

        // Re-promoting the holder's own run is not an improvement.
        handle_command(
            Commands::Promote {
                run_id: production.run_id.clone(),
            },
            Some(&config_path),
        )
        .await
        .unwrap();
        let tracker = tracking_from_config(&config.tracking).unwrap();
        let after = tracker
            .get_model_version_by_alias(&config.model.registered_name, &config.model.alias)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.version, production.version);
    }

    #[tokio::test]
    async fn test_train_unknown_family_fails() {
        let dir = TempDir::new().unwrap();
        let config_path = write_config(dir.path());
        let result = handle_command(
            Commands::Train {
                data: None,
                families: vec!["svm".into()],
                promote: false,
            },
            Some(&config_path),
        )
        .await;
        assert!(result.is_err());
    }
}

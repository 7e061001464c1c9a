//! Retrain orchestration: load data, train candidates, promote the best and
//! reload the serving model.
//!
//! ```text
//! Idle -> LoadingData -> TrainingCandidates -> Promoting -> ReloadingServingModel -> Idle
//!              \________________\__________________\______-> Failed { reason } -> Idle
//! ```
//!
//! At most one run is in flight when single-flight is on: the job manager is
//! capped at one active job and `begin` is the check-and-insert.

use super::{Trainer, TrainingRun, select_best};
use crate::data::{Dataset, Table, read_labeled_dir};
use crate::eda::{log_eda, run_eda};
use crate::error::{MlError, Result};
use crate::pipeline::TrainingParams;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sentiment_core::config::ServiceConfig;
use sentiment_core::scheduler::{BackgroundJob, JobManager};
use sentiment_core::storage::CONTENT_TYPE_CSV;
use sentiment_core::{ObjectStore, PromotionEngine, PromotionOutcome, PromotionPolicy, TrackingBackend};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RetrainState {
    Idle,
    LoadingData,
    TrainingCandidates,
    Promoting,
    ReloadingServingModel,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrainTrigger {
    Bootstrap,
    Scheduled,
    Drift { drift_share: f64, request_id: String },
    Manual,
}

impl RetrainTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            RetrainTrigger::Bootstrap => "bootstrap",
            RetrainTrigger::Scheduled => "scheduled",
            RetrainTrigger::Drift { .. } => "drift",
            RetrainTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrainAck {
    Scheduled { job_id: Uuid },
    AlreadyRunning,
}

/// Something that can swap in the newly promoted model.
#[async_trait]
pub trait ModelReloader: Send + Sync {
    async fn reload(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub model: String,
    pub run_id: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl CandidateScore {
    fn of(run: &TrainingRun, metric: &str) -> Self {
        Self {
            model: run.run_name.clone(),
            run_id: run.run_id.clone(),
            score: run.score(metric),
            version: run.model_version.as_ref().map(|v| v.version.clone()),
        }
    }
}

/// Outcome of one orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainReport {
    pub job_id: Uuid,
    pub trigger: RetrainTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub data_source: Option<String>,
    pub rows: usize,
    pub candidates: Vec<CandidateScore>,
    pub best: Option<CandidateScore>,
    pub promotion: Option<PromotionOutcome>,
    pub reloaded: bool,
    /// `None` on success.
    pub error: Option<String>,
}

impl RetrainReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub experiment_name: String,
    pub registered_name: String,
    pub primary_metric: String,
    pub labeled_prefix: String,
    pub initial_data_path: PathBuf,
    pub bootstrap_params: TrainingParams,
    pub retrain_params: TrainingParams,
    pub single_flight: bool,
    pub notify_url: Option<String>,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &ServiceConfig) -> Result<Self> {
        let bootstrap_params = TrainingParams::from_config(&cfg.training)?;
        let retrain_params = bootstrap_params
            .clone()
            .with_max_features(cfg.training.retrain_max_features);
        Ok(Self {
            experiment_name: cfg.tracking.experiment_name.clone(),
            registered_name: cfg.model.registered_name.clone(),
            primary_metric: cfg.model.primary_metric.clone(),
            labeled_prefix: cfg.storage.labeled_prefix.clone(),
            initial_data_path: cfg.training.initial_data_path.clone(),
            bootstrap_params,
            retrain_params,
            single_flight: cfg.retrain.single_flight,
            notify_url: cfg.retrain.notify_url.clone().filter(|u| !u.trim().is_empty()),
        })
    }
}

/// Where a run's training data came from.
struct LoadedData {
    source: String,
    dataset: Dataset,
}

pub struct RetrainOrchestrator {
    tracker: Arc<dyn TrackingBackend>,
    store: Arc<dyn ObjectStore>,
    trainer: Trainer,
    engine: PromotionEngine,
    settings: OrchestratorSettings,
    reloader: Option<Arc<dyn ModelReloader>>,
    state: Mutex<RetrainState>,
    jobs: Mutex<JobManager>,
    last_report: Mutex<Option<RetrainReport>>,
    http: reqwest::Client,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RetrainOrchestrator {
    pub fn new(
        tracker: Arc<dyn TrackingBackend>,
        store: Arc<dyn ObjectStore>,
        policy: PromotionPolicy,
        settings: OrchestratorSettings,
    ) -> Self {
        let max_active = if settings.single_flight { 1 } else { usize::MAX };
        Self {
            trainer: Trainer::new(
                Arc::clone(&tracker),
                settings.experiment_name.clone(),
                settings.registered_name.clone(),
            ),
            engine: PromotionEngine::new(Arc::clone(&tracker), policy),
            tracker,
            store,
            settings,
            reloader: None,
            state: Mutex::new(RetrainState::Idle),
            jobs: Mutex::new(JobManager::new(max_active)),
            last_report: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_reloader(mut self, reloader: Arc<dyn ModelReloader>) -> Self {
        self.reloader = Some(reloader);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn state(&self) -> RetrainState {
        lock(&self.state).clone()
    }

    pub fn last_report(&self) -> Option<RetrainReport> {
        lock(&self.last_report).clone()
    }

    /// Retrain jobs, newest first.
    pub fn recent_jobs(&self, limit: usize) -> Vec<BackgroundJob> {
        lock(&self.jobs).recent(limit)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.jobs).active_count() > 0
    }

    fn set_state(&self, state: RetrainState) {
        info!(state = ?state, "Retrain state");
        *lock(&self.state) = state;
    }

    fn begin_job(&self, trigger: &RetrainTrigger) -> Option<Uuid> {
        lock(&self.jobs).begin(format!("retrain:{}", trigger.label())).ok()
    }

    /// Schedule a run in the background and return immediately.
    pub fn trigger(self: &Arc<Self>, trigger: RetrainTrigger) -> RetrainAck {
        let Some(job_id) = self.begin_job(&trigger) else {
            info!(trigger = trigger.label(), "Retrain already in flight, trigger ignored");
            return RetrainAck::AlreadyRunning;
        };
        info!(%job_id, trigger = trigger.label(), "Retrain scheduled");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(job_id, trigger).await;
        });
        RetrainAck::Scheduled { job_id }
    }

    /// Run inline and return the report. Fails only when another run holds
    /// the single-flight slot; a failed run is reported, not returned as an error.
    pub async fn run_once(&self, trigger: RetrainTrigger) -> Result<RetrainReport> {
        let job_id = self
            .begin_job(&trigger)
            .ok_or_else(|| MlError::training("a retrain is already in flight"))?;
        Ok(self.execute(job_id, trigger).await)
    }

    /// Train and promote from the bootstrap dataset.
    pub async fn bootstrap(&self) -> Result<RetrainReport> {
        self.run_once(RetrainTrigger::Bootstrap).await
    }

    async fn execute(&self, job_id: Uuid, trigger: RetrainTrigger) -> RetrainReport {
        let mut report = RetrainReport {
            job_id,
            trigger: trigger.clone(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            data_source: None,
            rows: 0,
            candidates: Vec::new(),
            best: None,
            promotion: None,
            reloaded: false,
            error: None,
        };

        let result = self.drive(&trigger, &mut report).await;
        report.finished_at = Utc::now();
        {
            let mut jobs = lock(&self.jobs);
            let recorded = match &result {
                Ok(()) => jobs.complete(&job_id, "finished"),
                Err(e) => jobs.fail(&job_id, e.to_string()),
            };
            if let Err(e) = recorded {
                warn!(%job_id, error = %e, "Job bookkeeping failed");
            }
        }
        match result {
            Ok(()) => {
                info!(
                    %job_id,
                    trigger = trigger.label(),
                    promoted = report.promotion.as_ref().is_some_and(|p| p.promoted),
                    "Retrain finished"
                );
            }
            Err(e) => {
                error!(%job_id, trigger = trigger.label(), error = %e, "Retrain failed");
                report.error = Some(e.to_string());
                self.set_state(RetrainState::Failed {
                    reason: e.to_string(),
                });
            }
        }
        self.set_state(RetrainState::Idle);
        *lock(&self.last_report) = Some(report.clone());
        report
    }

    async fn drive(&self, trigger: &RetrainTrigger, report: &mut RetrainReport) -> Result<()> {
        self.set_state(RetrainState::LoadingData);
        let bootstrap = matches!(trigger, RetrainTrigger::Bootstrap);
        let data = if bootstrap {
            self.load_bootstrap().await?
        } else {
            self.load_latest().await?
        };
        report.data_source = Some(data.source.clone());
        report.rows = data.dataset.len();
        info!(source = %data.source, rows = data.dataset.len(), "Loaded training data");

        self.set_state(RetrainState::TrainingCandidates);
        let params = if bootstrap {
            &self.settings.bootstrap_params
        } else {
            &self.settings.retrain_params
        };
        let runs = self.trainer.train_candidates(&data.dataset, params).await?;
        let metric = self.settings.primary_metric.as_str();
        report.candidates = runs.iter().map(|r| CandidateScore::of(r, metric)).collect();
        let best = select_best(&runs, metric)
            .ok_or_else(|| MlError::training("no candidate produced"))?;
        report.best = Some(CandidateScore::of(best, metric));

        self.set_state(RetrainState::Promoting);
        let request = self
            .engine
            .request(&best.run_id, best.score(metric), self.trainer.registered_name());
        let outcome = self.engine.promote(&request).await?;
        info!(
            run_id = %best.run_id,
            promoted = outcome.promoted,
            context = %outcome.context,
            "Promotion decided"
        );
        let promoted = outcome.promoted;
        report.promotion = Some(outcome);

        if promoted {
            self.set_state(RetrainState::ReloadingServingModel);
            report.reloaded = self.reload().await;
            self.notify().await;
        }
        Ok(())
    }

    async fn reload(&self) -> bool {
        let Some(reloader) = &self.reloader else {
            return false;
        };
        match reloader.reload().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Serving model reload failed, previous model keeps serving");
                false
            }
        }
    }

    async fn notify(&self) {
        let Some(url) = &self.settings.notify_url else {
            return;
        };
        match self.http.get(url).send().await {
            Ok(resp) => info!(url, status = resp.status().as_u16(), "Notified after promotion"),
            Err(e) => warn!(url, error = %e, "Post-promotion notification failed"),
        }
    }

    /// Latest labeled snapshot in the store, else the bootstrap dataset.
    async fn load_latest(&self) -> Result<LoadedData> {
        let prefix = &self.settings.labeled_prefix;
        match self.store.download_latest(prefix).await {
            Ok(Some((meta, bytes))) => {
                match Table::parse_bytes(&bytes).and_then(Dataset::from_table) {
                    Ok(dataset) if !dataset.is_empty() => {
                        return Ok(LoadedData {
                            source: format!("{}:{}", self.store.name(), meta.name),
                            dataset,
                        });
                    }
                    Ok(_) => warn!(object = %meta.name, "Latest labeled snapshot has no usable rows"),
                    Err(e) => warn!(object = %meta.name, error = %e, "Latest labeled snapshot unreadable"),
                }
            }
            Ok(None) => info!(prefix = %prefix, "No labeled snapshot in store"),
            Err(e) => warn!(prefix = %prefix, error = %e, "Listing labeled snapshots failed"),
        }
        self.load_initial()
            .await
            .map(|(source, dataset, _)| LoadedData { source, dataset })
    }

    async fn load_initial(&self) -> Result<(String, Dataset, Table)> {
        let path = self.settings.initial_data_path.as_path();
        if !path.exists() {
            return Err(MlError::dataset("no data available"));
        }
        let (dataset, raw) = read_initial(path).await?;
        if dataset.is_empty() {
            return Err(MlError::dataset("no data available"));
        }
        Ok((path.display().to_string(), dataset, raw))
    }

    /// Bootstrap data: the initial dataset, snapshotted into the store and
    /// summarized by EDA. Snapshot and EDA failures only warn.
    async fn load_bootstrap(&self) -> Result<LoadedData> {
        let (source, dataset, raw) = self.load_initial().await?;
        let ts = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        // Raw text, so the snapshot is comparable with raw prediction batches.
        let snapshot = format!("{}BOOTSTRAP_{ts}.csv", self.settings.labeled_prefix);
        let uploaded = match raw.labeled_columns() {
            Ok(labeled) => {
                self.store
                    .upload(&snapshot, labeled.to_csv().into_bytes(), CONTENT_TYPE_CSV)
                    .await
                    .map(|meta| (meta, labeled.len()))
                    .map_err(MlError::from)
            }
            Err(e) => Err(e),
        };
        match uploaded {
            Ok((meta, rows)) => info!(object = %meta.name, rows, "Uploaded bootstrap snapshot"),
            Err(e) => warn!(object = %snapshot, error = %e, "Bootstrap snapshot upload failed"),
        }

        if let Err(e) = self.bootstrap_eda(&raw, &ts).await {
            warn!(error = %e, "Bootstrap EDA failed");
        }
        Ok(LoadedData { source, dataset })
    }

    async fn bootstrap_eda(&self, raw: &Table, ts: &str) -> Result<()> {
        let summary = run_eda(raw)?;
        let experiment_id = self
            .tracker
            .get_or_create_experiment(&self.settings.experiment_name)
            .await?;
        log_eda(
            self.tracker.as_ref(),
            &experiment_id,
            &format!("EDA_bootstrap_{ts}"),
            &summary,
        )
        .await?;
        Ok(())
    }
}

/// Read a bootstrap file or a directory of CSVs, keeping the raw table for
/// EDA and the labeled snapshot.
async fn read_initial(path: &Path) -> Result<(Dataset, Table)> {
    let raw = if path.is_dir() {
        read_labeled_dir(path).await?
    } else {
        Table::read(path).await?
    };
    let dataset = Dataset::from_table(raw.clone())?;
    Ok((dataset, raw))
}

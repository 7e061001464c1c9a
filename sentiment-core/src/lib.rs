//! # Sentiment Core
//!
//! Foundation of the sentiment model lifecycle service: configuration,
//! the tracking and object-store contracts with their implementations,
//! the promotion engine that guards the production alias, and scheduling.

pub mod config;
pub mod error;
pub mod persistence;
pub mod promotion;
pub mod scheduler;
pub mod storage;
pub mod tracking;

pub use config::{ServiceConfig, load_config};
pub use error::{CoreError, Result, SchedulerError};
pub use promotion::{
    ProductionSnapshot, PromotionEngine, PromotionOutcome, PromotionPolicy, PromotionRequest,
};
pub use storage::{BlobMeta, GcsObjectStore, LocalObjectStore, ObjectStore};
pub use tracking::{
    LocalTracking, MlflowTracking, ModelVersion, Run, RunInfo, RunStatus, TrackingBackend,
};

use std::sync::Arc;

/// Build the tracking backend the configuration asks for.
pub fn tracking_from_config(cfg: &config::TrackingConfig) -> Result<Arc<dyn TrackingBackend>> {
    match &cfg.uri {
        Some(uri) if !uri.trim().is_empty() => Ok(Arc::new(MlflowTracking::new(uri.trim())?)),
        _ => Ok(Arc::new(LocalTracking::open(&cfg.local_dir)?)),
    }
}

/// Build the object store the configuration asks for, creating the bucket
/// when it is missing.
pub async fn storage_from_config(cfg: &config::StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match &cfg.endpoint {
        Some(endpoint) if !endpoint.trim().is_empty() => {
            let store = GcsObjectStore::new(endpoint.trim(), &cfg.bucket)?;
            store.ensure_bucket(&cfg.project).await?;
            Ok(Arc::new(store))
        }
        _ => Ok(Arc::new(LocalObjectStore::open(&cfg.local_dir)?)),
    }
}

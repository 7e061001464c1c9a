//! # Sentiment ML
//!
//! Review sentiment models and their lifecycle: text cleaning, TF-IDF
//! pipelines over four classifier families, evaluation with tracked
//! diagnostics, drift detection, retrain orchestration, the served model
//! slot and the HTTP gateway.

pub mod data;
pub mod drift;
pub mod eda;
pub mod error;
pub mod eval;
pub mod features;
pub mod gateway;
pub mod labels;
pub mod models;
pub mod pipeline;
pub mod serving;
pub mod text;
pub mod training;

pub use data::{Dataset, Split, Table, prepare_dataset, stratified_split};
pub use drift::{DriftAssessment, DriftDetector, DriftPolicy, TextDriftDetector};
pub use error::{MlError, Result};
pub use eval::{Evaluation, evaluate_model};
pub use labels::LabelEncoder;
pub use models::{Classifier, Estimator, ModelFamily};
pub use pipeline::{SentimentPipeline, TextClassifier, TrainingParams, build_pipelines};
pub use serving::{LoadedModel, ProductionLoader, ServingState};
pub use training::{
    ModelReloader, OrchestratorSettings, RetrainAck, RetrainOrchestrator, RetrainReport,
    RetrainState, RetrainTrigger, Trainer, TrainingRun,
};

//! Promotion of a freshly trained candidate to the production alias.
//!
//! The alias only ever moves to a version whose recorded score strictly
//! exceeds the current holder's (plus the configured margin). The final
//! alias write is a compare-and-set against the holder read at the start,
//! so two concurrent promotions cannot both win.

use crate::config::ModelConfig;
use crate::error::Result;
use crate::tracking::{ModelVersion, TrackingBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Which alias moves where, and by which metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionPolicy {
    pub alias: String,
    pub staging_alias: String,
    pub primary_metric: String,
    pub min_improvement: f64,
}

impl From<&ModelConfig> for PromotionPolicy {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            alias: cfg.alias.clone(),
            staging_alias: cfg.staging_alias.clone(),
            primary_metric: cfg.primary_metric.clone(),
            min_improvement: cfg.min_improvement,
        }
    }
}

/// A candidate asking to become production.
#[derive(Debug, Clone)]
pub struct PromotionRequest {
    pub run_id: String,
    pub score: f64,
    pub model_name: String,
    pub alias: String,
}

/// The production holder as it was before the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionSnapshot {
    pub version: String,
    pub run_id: String,
    pub score: f64,
}

/// Result of one promotion decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionOutcome {
    pub promoted: bool,
    pub context: String,
    pub new_version: Option<ModelVersion>,
    pub previous: Option<ProductionSnapshot>,
}

impl PromotionOutcome {
    fn kept(context: String, previous: Option<ProductionSnapshot>) -> Self {
        Self {
            promoted: false,
            context,
            new_version: None,
            previous,
        }
    }
}

pub struct PromotionEngine {
    tracker: Arc<dyn TrackingBackend>,
    policy: PromotionPolicy,
}

impl PromotionEngine {
    pub fn new(tracker: Arc<dyn TrackingBackend>, policy: PromotionPolicy) -> Self {
        Self { tracker, policy }
    }

    pub fn policy(&self) -> &PromotionPolicy {
        &self.policy
    }

    /// A request against the policy's production alias.
    pub fn request(
        &self,
        run_id: impl Into<String>,
        score: f64,
        model_name: impl Into<String>,
    ) -> PromotionRequest {
        PromotionRequest {
            run_id: run_id.into(),
            score,
            model_name: model_name.into(),
            alias: self.policy.alias.clone(),
        }
    }

    /// The version registered for `run_id` under `name`, if the registry has it.
    async fn version_for_run(&self, name: &str, run_id: &str) -> Result<Option<ModelVersion>> {
        let versions = match self.tracker.search_model_versions_by_run(run_id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(versions.into_iter().find(|v| v.name == name))
    }

    /// Current production holder and its recorded score (0 when the metric
    /// was never logged).
    pub async fn current_production(
        &self,
        name: &str,
        alias: &str,
    ) -> Result<Option<ProductionSnapshot>> {
        let Some(holder) = self.tracker.get_model_version_by_alias(name, alias).await?
        else {
            return Ok(None);
        };
        let run = self.tracker.get_run(&holder.run_id).await?;
        let score = run.metric(&self.policy.primary_metric).unwrap_or(0.0);
        Ok(Some(ProductionSnapshot {
            version: holder.version,
            run_id: holder.run_id,
            score,
        }))
    }

    /// Decide whether `req` replaces the production holder and, if so, move
    /// the alias. Losing a race is reported in the outcome, not as an error.
    pub async fn promote(&self, req: &PromotionRequest) -> Result<PromotionOutcome> {
        let name = req.model_name.as_str();
        let alias = req.alias.as_str();
        let current = self.current_production(name, alias).await?;

        let outcome = match current {
            None => self.promote_first(req).await?,
            Some(cur) if cur.run_id == req.run_id => PromotionOutcome::kept(
                format!("{name} v{} already holds @{alias}", cur.version),
                Some(cur),
            ),
            Some(cur) if req.score > cur.score + self.policy.min_improvement => {
                self.replace(req, cur).await?
            }
            Some(cur) => PromotionOutcome::kept(
                format!(
                    "kept existing, no improvement (candidate {:.4} <= production {:.4})",
                    req.score, cur.score
                ),
                Some(cur),
            ),
        };

        info!(
            model = name,
            run_id = %req.run_id,
            score = req.score,
            promoted = outcome.promoted,
            context = %outcome.context,
            "Promotion decision"
        );
        Ok(outcome)
    }

    async fn promote_first(&self, req: &PromotionRequest) -> Result<PromotionOutcome> {
        let name = req.model_name.as_str();
        let Some(version) = self.version_for_run(name, &req.run_id).await? else {
            return Ok(PromotionOutcome::kept(
                format!("no registered version of {name} for run {}", req.run_id),
                None,
            ));
        };
        let won = self
            .tracker
            .compare_and_set_alias(name, &req.alias, None, &version.version)
            .await?;
        if !won {
            return Ok(PromotionOutcome::kept(
                "alias changed concurrently".to_string(),
                None,
            ));
        }
        Ok(PromotionOutcome {
            promoted: true,
            context: format!(
                "first production model: {name} v{} ({:.4})",
                version.version, req.score
            ),
            new_version: Some(version),
            previous: None,
        })
    }

    async fn replace(
        &self,
        req: &PromotionRequest,
        cur: ProductionSnapshot,
    ) -> Result<PromotionOutcome> {
        let name = req.model_name.as_str();
        let Some(version) = self.version_for_run(name, &req.run_id).await? else {
            return Ok(PromotionOutcome::kept(
                format!("no registered version of {name} for run {}", req.run_id),
                Some(cur),
            ));
        };
        if version.version == cur.version {
            return Ok(PromotionOutcome::kept(
                format!("{name} v{} already holds @{}", cur.version, req.alias),
                Some(cur),
            ));
        }

        // Demotion is best effort; failing it must not block the promotion.
        if let Err(e) = self
            .tracker
            .set_model_version_alias(name, &self.policy.staging_alias, &cur.version)
            .await
        {
            warn!(
                model = name,
                version = %cur.version,
                error = %e,
                "Failed to move previous production version to @{}",
                self.policy.staging_alias
            );
        }

        let won = self
            .tracker
            .compare_and_set_alias(name, &req.alias, Some(&cur.version), &version.version)
            .await?;
        if !won {
            return Ok(PromotionOutcome::kept(
                "alias changed concurrently".to_string(),
                Some(cur),
            ));
        }
        Ok(PromotionOutcome {
            promoted: true,
            context: format!(
                "promoted {name} v{} over v{} ({:.4} > {:.4})",
                version.version, cur.version, req.score, cur.score
            ),
            new_version: Some(version),
            previous: Some(cur),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::LocalTracking;

    fn policy() -> PromotionPolicy {
        PromotionPolicy::from(&ModelConfig::default())
    }

    #[test]
    fn test_policy_from_config() {
        let p = policy();
        assert_eq!(p.alias, "Production");
        assert_eq!(p.staging_alias, "Staging");
        assert_eq!(p.primary_metric, "macro_f1");
        assert_eq!(p.min_improvement, 0.0);
    }

    #[tokio::test]
    async fn test_unregistered_run_is_not_promoted() {
        let tracker = Arc::new(LocalTracking::in_memory());
        let exp = tracker.get_or_create_experiment("exp").await.unwrap();
        let run = tracker.start_run(&exp, "lr_model").await.unwrap();
        let engine = PromotionEngine::new(tracker.clone(), policy());

        let outcome = engine
            .promote(&engine.request(run.run_id, 0.9, "Model"))
            .await
            .unwrap();
        assert!(!outcome.promoted);
        assert!(outcome.context.contains("no registered version"));
        assert!(tracker
            .get_model_version_by_alias("Model", "Production")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_min_improvement_margin() {
        let tracker = Arc::new(LocalTracking::in_memory());
        let exp = tracker.get_or_create_experiment("exp").await.unwrap();
        let mut runs = Vec::new();
        for score in [0.70, 0.72] {
            let run = tracker.start_run(&exp, "lr_model").await.unwrap();
            tracker.log_metric(&run.run_id, "macro_f1", score).await.unwrap();
            tracker
                .create_model_version("Model", &run.run_id, "src")
                .await
                .unwrap();
            runs.push((run.run_id, score));
        }
        let mut p = policy();
        p.min_improvement = 0.05;
        let engine = PromotionEngine::new(tracker, p);

        let first = engine
            .promote(&engine.request(runs[0].0.clone(), runs[0].1, "Model"))
            .await
            .unwrap();
        assert!(first.promoted);

        let second = engine
            .promote(&engine.request(runs[1].0.clone(), runs[1].1, "Model"))
            .await
            .unwrap();
        assert!(!second.promoted);
        assert!(second.context.starts_with("kept existing, no improvement"));
    }
}

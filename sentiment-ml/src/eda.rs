//! Exploratory summaries of a raw review table, logged to a tracking run.

use crate::data::{REVIEW_COLUMN, TARGET_COLUMN, Table};
use crate::error::{MlError, Result};
use crate::text::tokenize;
use sentiment_core::TrackingBackend;
use sentiment_core::tracking::RunStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::info;

pub const EDA_SUMMARY_ARTIFACT: &str = "eda/summary.json";
const BRAND_COLUMN: &str = "brand";
const RATING_COLUMN: &str = "rating";
const TOP_WORDS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountPct {
    pub count: usize,
    pub pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub max: f64,
}

impl NumericStats {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let var = if sorted.len() > 1 {
            sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        // Linear interpolation between closest ranks.
        let q = |p: f64| {
            let pos = p * (n - 1.0);
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        };
        Self {
            count: sorted.len(),
            mean,
            std: var.sqrt(),
            min: sorted[0],
            p25: q(0.25),
            median: q(0.5),
            p75: q(0.75),
            max: sorted[sorted.len() - 1],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overview {
    pub rows: usize,
    pub columns: Vec<String>,
    pub num_classes: usize,
    pub label_counts: BTreeMap<String, usize>,
    pub missing_review: CountPct,
    pub missing_label: CountPct,
    pub duplicate_rows: CountPct,
    pub duplicate_reviews: CountPct,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating_outliers: Option<CountPct>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdaSummary {
    pub overview: Overview,
    pub text_length: NumericStats,
    pub text_length_by_label: BTreeMap<String, NumericStats>,
    /// Most frequent non-stop-word tokens per label.
    pub top_words_by_label: BTreeMap<String, Vec<(String, usize)>>,
    pub class_distribution: BTreeMap<String, CountPct>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_per_brand: Option<BTreeMap<String, BTreeMap<String, usize>>>,
}

fn pct(count: usize, total: usize) -> CountPct {
    let pct = if total == 0 {
        0.0
    } else {
        (count as f64 / total as f64 * 10_000.0).round() / 100.0
    };
    CountPct { count, pct }
}

fn duplicates<'a>(items: impl Iterator<Item = &'a [String]>) -> usize {
    let mut seen = HashSet::new();
    items.filter(|item| !seen.insert(*item)).count()
}

/// Summarize a raw review table (before cleaning).
pub fn run_eda(table: &Table) -> Result<EdaSummary> {
    if table.is_empty() {
        return Err(MlError::dataset("Input table is empty. Cannot generate EDA."));
    }
    let mut table = table.clone();
    table.rename_column("text", REVIEW_COLUMN);
    let reviews = table
        .column(REVIEW_COLUMN)
        .ok_or_else(|| MlError::dataset(format!("Text column '{REVIEW_COLUMN}' not found")))?;
    let labels = table
        .column(TARGET_COLUMN)
        .ok_or_else(|| MlError::dataset(format!("Sentiment column '{TARGET_COLUMN}' not found")))?;
    let rows = table.len();

    let mut label_counts = BTreeMap::new();
    for l in labels.iter().filter(|l| !l.trim().is_empty()) {
        *label_counts.entry(l.clone()).or_insert(0) += 1;
    }
    let rating_outliers = table.column(RATING_COLUMN).map(|ratings| {
        let outliers = ratings
            .iter()
            .filter_map(|r| r.trim().parse::<f64>().ok())
            .filter(|r| !(1.0..=5.0).contains(r))
            .count();
        pct(outliers, rows)
    });
    let overview = Overview {
        rows,
        columns: table.columns.clone(),
        num_classes: label_counts.len(),
        label_counts: label_counts.clone(),
        missing_review: pct(reviews.iter().filter(|r| r.trim().is_empty()).count(), rows),
        missing_label: pct(labels.iter().filter(|l| l.trim().is_empty()).count(), rows),
        duplicate_rows: pct(duplicates(table.rows.iter().map(Vec::as_slice)), rows),
        duplicate_reviews: pct(duplicates(reviews.iter().map(std::slice::from_ref)), rows),
        rating_outliers,
    };

    let lengths: Vec<f64> = reviews.iter().map(|r| r.chars().count() as f64).collect();
    let mut by_label: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut words: BTreeMap<String, HashMap<String, usize>> = BTreeMap::new();
    for ((review, label), len) in reviews.iter().zip(&labels).zip(&lengths) {
        if label.trim().is_empty() {
            continue;
        }
        by_label.entry(label.clone()).or_default().push(*len);
        let counts = words.entry(label.clone()).or_default();
        for token in tokenize(review) {
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    let top_words_by_label = words
        .into_iter()
        .map(|(label, counts)| {
            let mut top: Vec<(String, usize)> = counts.into_iter().collect();
            top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            top.truncate(TOP_WORDS);
            (label, top)
        })
        .collect();

    let labeled: usize = label_counts.values().sum();
    let class_distribution = label_counts
        .iter()
        .map(|(l, c)| (l.clone(), pct(*c, labeled)))
        .collect();

    let sentiment_per_brand = table.column(BRAND_COLUMN).map(|brands| {
        let mut cross: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for (brand, label) in brands.iter().zip(&labels) {
            if brand.trim().is_empty() || label.trim().is_empty() {
                continue;
            }
            *cross
                .entry(brand.clone())
                .or_default()
                .entry(label.clone())
                .or_insert(0) += 1;
        }
        cross
    });

    Ok(EdaSummary {
        overview,
        text_length: NumericStats::of(&lengths),
        text_length_by_label: by_label
            .into_iter()
            .map(|(l, v)| (l, NumericStats::of(&v)))
            .collect(),
        top_words_by_label,
        class_distribution,
        sentiment_per_brand,
    })
}

/// Log `summary` as `eda/summary.json` in a fresh run named `run_name`.
pub async fn log_eda(
    tracker: &dyn TrackingBackend,
    experiment_id: &str,
    run_name: &str,
    summary: &EdaSummary,
) -> Result<String> {
    let run = tracker.start_run(experiment_id, run_name).await?;
    let logged = async {
        tracker
            .log_dict(&run.run_id, EDA_SUMMARY_ARTIFACT, &serde_json::to_value(summary)?)
            .await?;
        tracker
            .log_metric(&run.run_id, "rows", summary.overview.rows as f64)
            .await?;
        tracker
            .log_metric(&run.run_id, "num_classes", summary.overview.num_classes as f64)
            .await?;
        Ok::<_, MlError>(())
    }
    .await;
    let status = if logged.is_ok() {
        RunStatus::Finished
    } else {
        RunStatus::Failed
    };
    tracker.end_run(&run.run_id, status).await?;
    logged?;
    info!(run_id = %run.run_id, run_name, rows = summary.overview.rows, "Logged EDA summary");
    Ok(run.run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sentiment_core::LocalTracking;

    fn table() -> Table {
        Table::parse(
            "review_text,sentiment,brand,rating\n\
             great battery great screen,Positive,Acme,5\n\
             great battery great screen,Positive,Acme,5\n\
             awful camera,Negative,Zen,1\n\
             ,Negative,Zen,9\n\
             okay phone,,Acme,3\n",
        )
        .unwrap()
    }

    #[test]
    fn test_numeric_stats() {
        let s = NumericStats::of(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.count, 4);
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.median, 2.5);
        assert_eq!(s.p25, 1.75);
        assert_eq!(s.max, 4.0);
        assert_eq!(NumericStats::of(&[]), NumericStats::default());
    }

    #[test]
    fn test_overview_counts() {
        let eda = run_eda(&table()).unwrap();
        assert_eq!(eda.overview.rows, 5);
        assert_eq!(eda.overview.num_classes, 2);
        assert_eq!(eda.overview.missing_review.count, 1);
        assert_eq!(eda.overview.missing_label.count, 1);
        assert_eq!(eda.overview.duplicate_rows.count, 1);
        assert_eq!(eda.overview.duplicate_reviews, CountPct { count: 1, pct: 20.0 });
        assert_eq!(eda.overview.rating_outliers.as_ref().map(|o| o.count), Some(1));
    }

    #[test]
    fn test_word_frequency_and_brands() {
        let eda = run_eda(&table()).unwrap();
        assert_eq!(eda.top_words_by_label["Positive"][0], ("great".to_string(), 4));
        let brands = eda.sentiment_per_brand.unwrap();
        assert_eq!(brands["Zen"]["Negative"], 2);
        assert_eq!(eda.class_distribution["Positive"].pct, 50.0);
    }

    #[test]
    fn test_missing_columns_rejected() {
        let t = Table::parse("review_text\nhello\n").unwrap();
        assert!(run_eda(&t).is_err());
        assert!(run_eda(&Table::new(vec!["review_text".into()])).is_err());
    }

    #[tokio::test]
    async fn test_log_eda_creates_finished_run() {
        let tracker = LocalTracking::in_memory();
        let exp = tracker.get_or_create_experiment("eda").await.unwrap();
        let summary = run_eda(&table()).unwrap();
        let run_id = log_eda(&tracker, &exp, "EDA_bootstrap_test", &summary).await.unwrap();
        let run = tracker.get_run(&run_id).await.unwrap();
        assert_eq!(run.info.status, RunStatus::Finished);
        assert_eq!(run.metric("rows"), Some(5.0));
        assert!(tracker.download_artifact(&run_id, EDA_SUMMARY_ARTIFACT).await.is_ok());
    }
}

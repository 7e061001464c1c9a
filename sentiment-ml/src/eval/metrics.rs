//! Classification metrics with zero-division mapped to 0.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Metric names every evaluation produces.
pub const METRIC_NAMES: [&str; 6] = [
    "accuracy",
    "macro_f1",
    "micro_f1",
    "weighted_f1",
    "macro_precision",
    "macro_recall",
];

/// Row = true class, column = predicted class.
pub fn confusion_matrix(y_true: &[usize], y_pred: &[usize], n_classes: usize) -> Vec<Vec<usize>> {
    let mut cm = vec![vec![0usize; n_classes]; n_classes];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        if t < n_classes && p < n_classes {
            cm[t][p] += 1;
        }
    }
    cm
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 { 0.0 } else { num / den }
}

/// Per-class precision, recall, f1 and support.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "f1-score")]
    pub f1: f64,
    pub support: usize,
}

pub fn per_class_scores(cm: &[Vec<usize>]) -> Vec<ClassScores> {
    let k = cm.len();
    (0..k)
        .map(|c| {
            let tp = cm[c][c] as f64;
            let predicted: f64 = (0..k).map(|r| cm[r][c] as f64).sum();
            let support: usize = cm[c].iter().sum();
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support as f64);
            ClassScores {
                precision,
                recall,
                f1: ratio(2.0 * precision * recall, precision + recall),
                support,
            }
        })
        .collect()
}

/// The six headline metrics.
pub fn classification_metrics(
    y_true: &[usize],
    y_pred: &[usize],
    n_classes: usize,
) -> BTreeMap<String, f64> {
    let cm = confusion_matrix(y_true, y_pred, n_classes);
    let scores = per_class_scores(&cm);
    let total = y_true.len() as f64;
    let correct: f64 = (0..n_classes).map(|c| cm[c][c] as f64).sum();
    let k = n_classes.max(1) as f64;

    let macro_of = |f: fn(&ClassScores) -> f64| scores.iter().map(f).sum::<f64>() / k;
    let weighted_f1 = ratio(
        scores.iter().map(|s| s.f1 * s.support as f64).sum(),
        scores.iter().map(|s| s.support as f64).sum(),
    );
    let accuracy = ratio(correct, total);

    BTreeMap::from([
        ("accuracy".to_string(), accuracy),
        ("macro_f1".to_string(), macro_of(|s| s.f1)),
        // Single-label micro averages all equal accuracy.
        ("micro_f1".to_string(), accuracy),
        ("weighted_f1".to_string(), weighted_f1),
        ("macro_precision".to_string(), macro_of(|s| s.precision)),
        ("macro_recall".to_string(), macro_of(|s| s.recall)),
    ])
}

/// Report in the familiar `{label: {...}, accuracy, macro avg, weighted avg}` layout.
pub fn classification_report(
    y_true: &[usize],
    y_pred: &[usize],
    class_names: &[String],
) -> Value {
    let k = class_names.len();
    let cm = confusion_matrix(y_true, y_pred, k);
    let scores = per_class_scores(&cm);
    let total: usize = scores.iter().map(|s| s.support).sum();
    let correct: usize = (0..k).map(|c| cm[c][c]).sum();

    let mut report = Map::new();
    for (name, s) in class_names.iter().zip(&scores) {
        report.insert(name.clone(), json!(s));
    }
    report.insert("accuracy".into(), json!(ratio(correct as f64, total as f64)));

    let avg = |weight: &dyn Fn(&ClassScores) -> f64| {
        let wsum: f64 = scores.iter().map(weight).sum();
        let mean = |f: fn(&ClassScores) -> f64| ratio(scores.iter().map(|s| f(s) * weight(s)).sum(), wsum);
        json!({
            "precision": mean(|s| s.precision),
            "recall": mean(|s| s.recall),
            "f1-score": mean(|s| s.f1),
            "support": total,
        })
    };
    report.insert("macro avg".into(), avg(&|_| 1.0));
    report.insert("weighted avg".into(), avg(&|s| s.support as f64));
    Value::Object(report)
}

/// Figure data for a confusion-matrix heatmap.
pub fn confusion_matrix_figure(
    y_true: &[usize],
    y_pred: &[usize],
    class_names: &[String],
    title: &str,
) -> Value {
    json!({
        "kind": "confusion_matrix",
        "title": title,
        "labels": class_names,
        "matrix": confusion_matrix(y_true, y_pred, class_names.len()),
        "x_label": "Predicted label",
        "y_label": "True label",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_confusion_matrix_counts() {
        let cm = confusion_matrix(&[0, 0, 1, 1, 2], &[0, 1, 1, 1, 0], 3);
        assert_eq!(cm, vec![vec![1, 1, 0], vec![0, 2, 0], vec![1, 0, 0]]);
    }

    #[test]
    fn test_metrics_match_hand_computation() {
        // class 0: tp=1 fp=1 fn=1 -> p=.5 r=.5 f1=.5
        // class 1: tp=2 fp=1 fn=0 -> p=2/3 r=1 f1=.8
        // class 2: tp=0 -> zero division -> 0
        let m = classification_metrics(&[0, 0, 1, 1, 2], &[0, 1, 1, 1, 0], 3);
        assert!(close(m["accuracy"], 0.6));
        assert!(close(m["micro_f1"], 0.6));
        assert!(close(m["macro_f1"], (0.5 + 0.8) / 3.0));
        assert!(close(m["macro_precision"], (0.5 + 2.0 / 3.0) / 3.0));
        assert!(close(m["macro_recall"], 0.5));
        assert!(close(m["weighted_f1"], (0.5 * 2.0 + 0.8 * 2.0) / 5.0));
        assert_eq!(m.len(), METRIC_NAMES.len());
    }

    #[test]
    fn test_empty_inputs_are_zero() {
        let m = classification_metrics(&[], &[], 2);
        assert!(m.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_report_layout() {
        let names = vec!["negative".to_string(), "positive".to_string()];
        let report = classification_report(&[0, 1, 1], &[0, 1, 0], &names);
        assert_eq!(report["negative"]["support"], json!(1));
        assert_eq!(report["positive"]["recall"], json!(0.5));
        assert!(close(report["accuracy"].as_f64().unwrap(), 2.0 / 3.0));
        assert_eq!(report["macro avg"]["support"], json!(3));
        assert!(report["weighted avg"]["f1-score"].is_number());
    }
}

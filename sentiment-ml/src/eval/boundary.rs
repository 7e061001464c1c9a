//! 2-D decision boundary figure data.
//!
//! The TF-IDF rows are projected onto their top two right singular vectors
//! (truncated SVD by power iteration), standardized, and a fresh clone of
//! the classifier is fitted on the 2-D points. The clone is thrown away; it
//! never touches the retained model.

use crate::error::{MlError, Result};
use crate::features::{column_stats, standardize};
use crate::models::{Classifier, Estimator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};

const GRID_STEPS: usize = 100;
const POWER_ITERATIONS: usize = 100;
const MARGIN: f64 = 1.0;

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(v: &mut [f64]) -> f64 {
    let norm = dot(v, v).sqrt();
    if norm > 1e-12 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

/// Top `k` right singular vectors of `x` (rows are samples).
pub fn truncated_svd(x: &[Vec<f64>], k: usize, seed: u64) -> Vec<Vec<f64>> {
    let dim = x.first().map(Vec::len).unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut components: Vec<Vec<f64>> = Vec::with_capacity(k);

    for _ in 0..k.min(dim) {
        let mut v: Vec<f64> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        normalize(&mut v);
        for _ in 0..POWER_ITERATIONS {
            // v <- X^T X v, then deflate against earlier components.
            let xv: Vec<f64> = x.iter().map(|row| dot(row, &v)).collect();
            let mut next = vec![0.0; dim];
            for (row, s) in x.iter().zip(&xv) {
                for (n, r) in next.iter_mut().zip(row) {
                    *n += r * s;
                }
            }
            for c in &components {
                let proj = dot(&next, c);
                for (n, ci) in next.iter_mut().zip(c) {
                    *n -= proj * ci;
                }
            }
            if normalize(&mut next) <= 1e-12 {
                break;
            }
            v = next;
        }
        components.push(v);
    }
    components
}

fn project(x: &[Vec<f64>], components: &[Vec<f64>]) -> Vec<Vec<f64>> {
    x.iter()
        .map(|row| components.iter().map(|c| dot(row, c)).collect())
        .collect()
}

/// Figure data: projected points, their labels, and the predicted grid.
pub fn decision_boundary_figure(
    classifier: &Classifier,
    x: &[Vec<f64>],
    y: &[usize],
    class_names: &[String],
    title: &str,
) -> Result<Value> {
    if x.len() < 2 || x.len() != y.len() {
        return Err(MlError::evaluation("decision boundary needs at least two labeled rows"));
    }
    let components = truncated_svd(x, 2, 42);
    if components.len() < 2 {
        return Err(MlError::evaluation("feature space has fewer than two dimensions"));
    }
    let mut points = project(x, &components);
    let (mean, std) = column_stats(&points);
    standardize(&mut points, &mean, &std);

    let mut clf = classifier.unfitted();
    clf.fit(&points, y, class_names.len())?;

    let axis_range = |axis: usize| {
        let lo = points.iter().map(|p| p[axis]).fold(f64::INFINITY, f64::min) - MARGIN;
        let hi = points.iter().map(|p| p[axis]).fold(f64::NEG_INFINITY, f64::max) + MARGIN;
        (lo, hi)
    };
    let linspace = |(lo, hi): (f64, f64)| -> Vec<f64> {
        (0..GRID_STEPS)
            .map(|i| lo + (hi - lo) * i as f64 / (GRID_STEPS - 1) as f64)
            .collect()
    };
    let xs = linspace(axis_range(0));
    let ys = linspace(axis_range(1));
    let grid: Vec<Vec<usize>> = ys
        .iter()
        .map(|&gy| xs.iter().map(|&gx| clf.predict(&[gx, gy])).collect())
        .collect();

    Ok(json!({
        "kind": "decision_boundary",
        "title": title,
        "labels": class_names,
        "points": points,
        "point_labels": y,
        "grid_x": xs,
        "grid_y": ys,
        "grid_prediction": grid,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelFamily;

    #[test]
    fn test_svd_recovers_dominant_axis() {
        let x: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![i as f64, 0.01 * (i % 3) as f64, 0.0])
            .collect();
        let comps = truncated_svd(&x, 2, 42);
        assert_eq!(comps.len(), 2);
        assert!(comps[0][0].abs() > 0.99);
        assert!(dot(&comps[0], &comps[1]).abs() < 1e-6);
    }

    #[test]
    fn test_boundary_figure_shape() {
        let x: Vec<Vec<f64>> = (0..20)
            .map(|i| {
                let pos = i % 2 == 0;
                vec![if pos { 1.0 } else { 0.0 }, if pos { 0.0 } else { 1.0 }, (i % 4) as f64 * 0.1]
            })
            .collect();
        let y: Vec<usize> = (0..20).map(|i| if i % 2 == 0 { 1 } else { 0 }).collect();
        let names = vec!["negative".to_string(), "positive".to_string()];
        let clf = ModelFamily::LogisticRegression.default_classifier();
        let fig = decision_boundary_figure(&clf, &x, &y, &names, "Decision Boundary (2D SVD)").unwrap();
        assert_eq!(fig["grid_prediction"].as_array().unwrap().len(), GRID_STEPS);
        assert_eq!(fig["points"].as_array().unwrap().len(), 20);
        assert!(!clf.is_fitted());
    }

    #[test]
    fn test_naive_bayes_cannot_fit_standardized_points() {
        let x = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        let clf = ModelFamily::NaiveBayes.default_classifier();
        let names = vec!["a".to_string(), "b".to_string()];
        assert!(decision_boundary_figure(&clf, &x, &[0, 1, 0], &names, "t").is_err());
    }
}

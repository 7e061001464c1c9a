//! Feature extraction: TF-IDF text vectors and a few dense-matrix helpers.

pub mod tfidf;

pub use tfidf::TfidfVectorizer;

/// Dense feature row.
pub type Features = Vec<f64>;

/// Column means and standard deviations (population), with zero spread
/// mapped to one so standardizing never divides by zero.
pub fn column_stats(rows: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let dim = rows.first().map(Vec::len).unwrap_or(0);
    let n = rows.len().max(1) as f64;
    let mut mean = vec![0.0; dim];
    for row in rows {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v / n;
        }
    }
    let mut std = vec![0.0; dim];
    for row in rows {
        for ((s, v), m) in std.iter_mut().zip(row).zip(&mean) {
            *s += (v - m).powi(2) / n;
        }
    }
    for s in std.iter_mut() {
        *s = s.sqrt();
        if *s < 1e-12 {
            *s = 1.0;
        }
    }
    (mean, std)
}

/// Standardize rows in place with the given column statistics.
pub fn standardize(rows: &mut [Vec<f64>], mean: &[f64], std: &[f64]) {
    for row in rows.iter_mut() {
        for ((v, m), s) in row.iter_mut().zip(mean).zip(std) {
            *v = (*v - m) / s;
        }
    }
}

//! Histogram-based decision trees shared by the forest and boosting models.
//!
//! Every feature is pre-binned once into at most `MAX_BINS + 1` bins whose
//! edges are midpoints between observed values, so split search per node is
//! a linear histogram pass instead of a sort.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

pub(crate) const MAX_BINS: usize = 32;

/// Feature-major binned copy of a training matrix.
pub(crate) struct BinnedMatrix {
    /// Ascending split candidates per feature.
    thresholds: Vec<Vec<f64>>,
    /// `bins[f][row]` = number of thresholds of `f` strictly below the value.
    bins: Vec<Vec<u8>>,
}

impl BinnedMatrix {
    pub(crate) fn new(x: &[Vec<f64>]) -> Self {
        let dim = x.first().map(Vec::len).unwrap_or(0);
        let mut thresholds = Vec::with_capacity(dim);
        let mut bins = Vec::with_capacity(dim);
        for f in 0..dim {
            let mut values: Vec<f64> = x.iter().map(|r| r[f]).collect();
            values.sort_by(f64::total_cmp);
            values.dedup();
            let mut cuts: Vec<f64> = if values.len() <= MAX_BINS + 1 {
                values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
            } else {
                (1..=MAX_BINS)
                    .map(|i| {
                        let idx = i * (values.len() - 1) / (MAX_BINS + 1);
                        (values[idx] + values[idx + 1]) / 2.0
                    })
                    .collect()
            };
            cuts.dedup();
            bins.push(
                x.iter()
                    .map(|r| cuts.partition_point(|t| *t < r[f]) as u8)
                    .collect(),
            );
            thresholds.push(cuts);
        }
        Self { thresholds, bins }
    }

    pub(crate) fn dim(&self) -> usize {
        self.thresholds.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A fitted tree; node 0 is the root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Leaf value reached by `row`. Missing features read as zero.
    pub fn evaluate(&self, row: &[f64]) -> &[f64] {
        let mut i = 0;
        while let Some(node) = self.nodes.get(i) {
            match node {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    i = if v <= *threshold { *left } else { *right };
                }
            }
        }
        &[]
    }
}

/// What a tree is fitted to.
pub(crate) enum Target<'a> {
    /// Gini impurity over class labels.
    Classes {
        labels: &'a [usize],
        n_classes: usize,
    },
    /// Squared error over real values.
    Values(&'a [f64]),
}

pub(crate) struct TreeParams {
    pub max_depth: usize,
    /// Features sampled per split; `None` considers all of them.
    pub max_features: Option<usize>,
    pub min_samples_split: usize,
}

struct Grower<'a> {
    binned: &'a BinnedMatrix,
    target: Target<'a>,
    params: &'a TreeParams,
    rng: &'a mut StdRng,
    leaf: &'a dyn Fn(&[usize]) -> Vec<f64>,
    nodes: Vec<Node>,
}

struct BestSplit {
    feature: usize,
    bin: usize,
    score: f64,
}

/// Grow one tree on `rows` (duplicates allowed, e.g. a bootstrap sample).
pub(crate) fn grow(
    binned: &BinnedMatrix,
    target: Target<'_>,
    rows: Vec<usize>,
    params: &TreeParams,
    rng: &mut StdRng,
    leaf: &dyn Fn(&[usize]) -> Vec<f64>,
) -> Tree {
    let mut grower = Grower {
        binned,
        target,
        params,
        rng,
        leaf,
        nodes: Vec::new(),
    };
    grower.build(rows, 0);
    Tree {
        nodes: grower.nodes,
    }
}

/// Class proportions of `rows`.
pub(crate) fn class_distribution(labels: &[usize], n_classes: usize, rows: &[usize]) -> Vec<f64> {
    let mut counts = vec![0.0; n_classes];
    for &r in rows {
        if let Some(c) = counts.get_mut(labels[r]) {
            *c += 1.0;
        }
    }
    let total = rows.len().max(1) as f64;
    counts.iter().map(|c| c / total).collect()
}

fn gini_weighted(counts: &[f64], n: f64) -> f64 {
    if n <= 0.0 {
        return 0.0;
    }
    let sum_sq: f64 = counts.iter().map(|c| (c / n).powi(2)).sum();
    n * (1.0 - sum_sq)
}

impl Grower<'_> {
    fn build(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { value: Vec::new() });

        let split = if depth >= self.params.max_depth
            || rows.len() < self.params.min_samples_split.max(2)
            || self.is_pure(&rows)
        {
            None
        } else {
            self.best_split(&rows)
        };

        match split {
            None => {
                self.nodes[idx] = Node::Leaf {
                    value: (self.leaf)(&rows),
                };
            }
            Some(best) => {
                let bins = &self.binned.bins[best.feature];
                let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
                    rows.iter().copied().partition(|&r| (bins[r] as usize) <= best.bin);
                let threshold = self.binned.thresholds[best.feature][best.bin];
                let left = self.build(left_rows, depth + 1);
                let right = self.build(right_rows, depth + 1);
                self.nodes[idx] = Node::Split {
                    feature: best.feature,
                    threshold,
                    left,
                    right,
                };
            }
        }
        idx
    }

    fn is_pure(&self, rows: &[usize]) -> bool {
        match &self.target {
            Target::Classes { labels, .. } => {
                let first = labels[rows[0]];
                rows.iter().all(|&r| labels[r] == first)
            }
            Target::Values(values) => {
                let first = values[rows[0]];
                rows.iter().all(|&r| (values[r] - first).abs() < 1e-12)
            }
        }
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let dim = self.binned.dim();
        match self.params.max_features {
            Some(m) if m < dim => rand::seq::index::sample(&mut *self.rng, dim, m.max(1)).into_vec(),
            _ => (0..dim).collect(),
        }
    }

    fn best_split(&mut self, rows: &[usize]) -> Option<BestSplit> {
        let parent = self.impurity(rows);
        let mut best: Option<BestSplit> = None;
        for feature in self.candidate_features() {
            let n_bins = self.binned.thresholds[feature].len() + 1;
            if n_bins < 2 {
                continue;
            }
            if let Some((bin, score)) = self.scan_feature(feature, n_bins, rows) {
                if score < parent - 1e-12 && best.as_ref().is_none_or(|b| score < b.score) {
                    best = Some(BestSplit {
                        feature,
                        bin,
                        score,
                    });
                }
            }
        }
        best
    }

    fn impurity(&self, rows: &[usize]) -> f64 {
        match &self.target {
            Target::Classes { labels, n_classes } => {
                let mut counts = vec![0.0; *n_classes];
                for &r in rows {
                    if let Some(c) = counts.get_mut(labels[r]) {
                        *c += 1.0;
                    }
                }
                gini_weighted(&counts, rows.len() as f64)
            }
            Target::Values(values) => {
                let n = rows.len() as f64;
                let sum: f64 = rows.iter().map(|&r| values[r]).sum();
                let sum_sq: f64 = rows.iter().map(|&r| values[r] * values[r]).sum();
                sum_sq - sum * sum / n.max(1.0)
            }
        }
    }

    /// Lowest weighted child impurity over the bins of one feature.
    fn scan_feature(&self, feature: usize, n_bins: usize, rows: &[usize]) -> Option<(usize, f64)> {
        let bins = &self.binned.bins[feature];
        let mut best: Option<(usize, f64)> = None;
        match &self.target {
            Target::Classes { labels, n_classes } => {
                let k = *n_classes;
                let mut hist = vec![0.0; n_bins * k];
                let mut total = vec![0.0; k];
                for &r in rows {
                    let label = labels[r];
                    if label < k {
                        hist[bins[r] as usize * k + label] += 1.0;
                        total[label] += 1.0;
                    }
                }
                let n: f64 = total.iter().sum();
                let mut left = vec![0.0; k];
                for bin in 0..n_bins - 1 {
                    for c in 0..k {
                        left[c] += hist[bin * k + c];
                    }
                    let n_left: f64 = left.iter().sum();
                    let n_right = n - n_left;
                    if n_left == 0.0 || n_right == 0.0 {
                        continue;
                    }
                    let right: Vec<f64> = total.iter().zip(&left).map(|(t, l)| t - l).collect();
                    let score = gini_weighted(&left, n_left) + gini_weighted(&right, n_right);
                    if best.is_none_or(|(_, s)| score < s) {
                        best = Some((bin, score));
                    }
                }
            }
            Target::Values(values) => {
                let mut count = vec![0.0; n_bins];
                let mut sum = vec![0.0; n_bins];
                let mut sum_sq = vec![0.0; n_bins];
                for &r in rows {
                    let b = bins[r] as usize;
                    count[b] += 1.0;
                    sum[b] += values[r];
                    sum_sq[b] += values[r] * values[r];
                }
                let (n, s, ss) = (
                    count.iter().sum::<f64>(),
                    sum.iter().sum::<f64>(),
                    sum_sq.iter().sum::<f64>(),
                );
                let (mut nl, mut sl, mut ssl) = (0.0, 0.0, 0.0);
                for bin in 0..n_bins - 1 {
                    nl += count[bin];
                    sl += sum[bin];
                    ssl += sum_sq[bin];
                    let nr = n - nl;
                    if nl == 0.0 || nr == 0.0 {
                        continue;
                    }
                    let sr = s - sl;
                    let ssr = ss - ssl;
                    let score = (ssl - sl * sl / nl) + (ssr - sr * sr / nr);
                    if best.is_none_or(|(_, b)| score < b) {
                        best = Some((bin, score));
                    }
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn depth(tree: &Tree) -> usize {
        fn walk(nodes: &[Node], i: usize) -> usize {
            match nodes.get(i) {
                Some(Node::Split { left, right, .. }) => {
                    1 + walk(nodes, *left).max(walk(nodes, *right))
                }
                _ => 0,
            }
        }
        walk(&tree.nodes, 0)
    }

    fn params(depth: usize) -> TreeParams {
        TreeParams {
            max_depth: depth,
            max_features: None,
            min_samples_split: 2,
        }
    }

    #[test]
    fn test_binning_thresholds_are_midpoints() {
        let x = vec![vec![0.0], vec![1.0], vec![1.0], vec![3.0]];
        let binned = BinnedMatrix::new(&x);
        assert_eq!(binned.thresholds[0], vec![0.5, 2.0]);
        assert_eq!(binned.bins[0], vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_binning_caps_bin_count() {
        let x: Vec<Vec<f64>> = (0..500).map(|i| vec![i as f64]).collect();
        let binned = BinnedMatrix::new(&x);
        assert!(binned.thresholds[0].len() <= MAX_BINS);
        assert!(binned.bins[0].iter().all(|b| (*b as usize) <= MAX_BINS));
    }

    #[test]
    fn test_classification_tree_separates() {
        let x = vec![vec![0.1, 5.0], vec![0.2, 1.0], vec![0.8, 5.0], vec![0.9, 1.0]];
        let labels = vec![0, 0, 1, 1];
        let binned = BinnedMatrix::new(&x);
        let mut rng = StdRng::seed_from_u64(42);
        let leaf = |rows: &[usize]| class_distribution(&labels, 2, rows);
        let tree = grow(
            &binned,
            Target::Classes {
                labels: &labels,
                n_classes: 2,
            },
            (0..4).collect(),
            &params(3),
            &mut rng,
            &leaf,
        );
        assert_eq!(depth(&tree), 1);
        assert_eq!(tree.evaluate(&[0.15, 3.0]), &[1.0, 0.0]);
        assert_eq!(tree.evaluate(&[0.85, 3.0]), &[0.0, 1.0]);
    }

    #[test]
    fn test_regression_tree_respects_depth() {
        let x: Vec<Vec<f64>> = (0..16).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..16).map(|i| (i * i) as f64).collect();
        let binned = BinnedMatrix::new(&x);
        let mut rng = StdRng::seed_from_u64(7);
        let leaf = |rows: &[usize]| {
            vec![rows.iter().map(|&r| y[r]).sum::<f64>() / rows.len().max(1) as f64]
        };
        let tree = grow(
            &binned,
            Target::Values(&y),
            (0..16).collect(),
            &params(2),
            &mut rng,
            &leaf,
        );
        assert!(depth(&tree) <= 2);
        assert!(tree.evaluate(&[15.0])[0] > tree.evaluate(&[0.0])[0]);
    }

    #[test]
    fn test_empty_tree_evaluates_to_nothing() {
        assert!(Tree::default().evaluate(&[1.0]).is_empty());
    }
}

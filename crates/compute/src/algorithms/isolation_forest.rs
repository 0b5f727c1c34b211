//! Isolation forest: an ensemble of random space-partitioning trees.
//!
//! Each tree recursively splits a random sub-sample on a random
//! feature/threshold pair until every point is isolated or the height limit
//! `ceil(log2(psi))` is hit. Points in sparse regions are isolated after few
//! splits, so a short average path across the ensemble means "anomalous".
//!
//! Scores follow the usual normalization `s = 2^(-E[h(x)] / c(psi))`, where
//! `c(n)` is the average unsuccessful-search path length of a binary search
//! tree with `n` keys. `s` lies in `(0, 1]`; higher is more anomalous.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use flowwatch_core::{FeatureVector, FEATURE_DIM};

/// Euler–Mascheroni constant, for the harmonic number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Per-tree seed spacing (golden-ratio increment) so tree RNG streams differ.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Ensemble construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub trees: usize,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            trees: 100,
            max_samples: 256,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TreeNode {
    Internal {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    External {
        size: usize,
    },
}

/// One isolation tree, stored as a flat node arena (root at index 0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationTree {
    nodes: Vec<TreeNode>,
}

impl IsolationTree {
    /// Build a tree over the given points.
    fn build(mut points: Vec<FeatureVector>, height_limit: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self {
            nodes: Vec::with_capacity(2 * points.len()),
        };
        tree.grow(&mut points, 0, height_limit, rng);
        tree
    }

    /// Recursively grow the subtree for `points`, returning its node index.
    fn grow(
        &mut self,
        points: &mut [FeatureVector],
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> usize {
        let idx = self.nodes.len();

        if depth >= height_limit || points.len() <= 1 {
            self.nodes.push(TreeNode::External { size: points.len() });
            return idx;
        }

        // Only features with spread inside this node can separate anything.
        let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(FEATURE_DIM);
        for f in 0..FEATURE_DIM {
            let (lo, hi) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p[f]), hi.max(p[f]))
            });
            if hi > lo {
                candidates.push((f, lo, hi));
            }
        }

        if candidates.is_empty() {
            // Duplicate points: cannot be isolated further.
            self.nodes.push(TreeNode::External { size: points.len() });
            return idx;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);

        // Partition in place: [< threshold | >= threshold].
        let mut split = 0;
        for i in 0..points.len() {
            if points[i][feature] < threshold {
                points.swap(i, split);
                split += 1;
            }
        }
        // threshold == lo leaves the left side empty.
        if split == 0 || split == points.len() {
            self.nodes.push(TreeNode::External { size: points.len() });
            return idx;
        }

        // Reserve this slot, fill in children indices after growing them.
        self.nodes.push(TreeNode::External { size: 0 });
        let (left_pts, right_pts) = points.split_at_mut(split);
        let left = self.grow(left_pts, depth + 1, height_limit, rng);
        let right = self.grow(right_pts, depth + 1, height_limit, rng);
        self.nodes[idx] = TreeNode::Internal {
            feature,
            threshold,
            left,
            right,
        };
        idx
    }

    /// Path length for `x`, with the unbuilt-subtree correction `c(size)`
    /// added at the external node.
    pub fn path_length(&self, x: &FeatureVector) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Internal {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
                TreeNode::External { size } => return depth + average_path_length(*size),
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Check the arena is walkable: a root exists, features are in range and
    /// every child index points forward into the arena, so `path_length`
    /// always terminates without indexing out of bounds.
    pub fn check(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no root node".to_string());
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Internal {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= FEATURE_DIM {
                    return Err(format!("node {} splits on unknown feature {}", idx, feature));
                }
                for child in [*left, *right] {
                    if child <= idx || child >= self.nodes.len() {
                        return Err(format!("node {} has invalid child index {}", idx, child));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A fitted isolation forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    /// Sub-sample size each tree was built from.
    sample_size: usize,
}

impl IsolationForest {
    /// Fit a forest on `data`. Returns `None` for an empty batch.
    ///
    /// Trees are built in parallel; each draws from its own RNG seeded from
    /// `params.seed`, so the result is reproducible for a given batch.
    pub fn fit(data: &[FeatureVector], params: &ForestParams) -> Option<Self> {
        if data.is_empty() {
            return None;
        }

        let n = data.len();
        let sample_size = params.max_samples.clamp(1, n);
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let trees = params.trees.max(1);

        let trees: Vec<IsolationTree> = (0..trees)
            .into_par_iter()
            .map(|i| {
                let seed = params.seed.wrapping_add((i as u64).wrapping_mul(SEED_STRIDE));
                let mut rng = StdRng::seed_from_u64(seed);
                let sample: Vec<FeatureVector> = index::sample(&mut rng, n, sample_size)
                    .into_iter()
                    .map(|j| data[j])
                    .collect();
                IsolationTree::build(sample, height_limit, &mut rng)
            })
            .collect();

        Some(Self { trees, sample_size })
    }

    /// Mean path length of `x` across all trees.
    pub fn mean_path_length(&self, x: &FeatureVector) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(x)).sum();
        total / self.trees.len() as f64
    }

    /// Anomaly score of a single point, in `(0, 1]`.
    pub fn score_one(&self, x: &FeatureVector) -> f64 {
        score_from_path(self.mean_path_length(x), self.sample_size)
    }

    /// Anomaly scores for a batch, order-preserving.
    pub fn score(&self, data: &[FeatureVector]) -> Vec<f64> {
        data.par_iter().map(|x| self.score_one(x)).collect()
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Structural check for a forest that did not come from [`fit`](Self::fit),
    /// e.g. one read back from disk.
    pub fn check(&self) -> Result<(), String> {
        if self.trees.is_empty() {
            return Err("forest has no trees".to_string());
        }
        if self.sample_size == 0 {
            return Err("forest sample size is zero".to_string());
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.check().map_err(|e| format!("tree {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// Normalize a mean path length into an anomaly score.
///
/// Strictly decreasing in `mean_path` for `sample_size >= 2`. A forest grown
/// from a single point has no depth to compare against and scores every
/// point 1.0.
pub fn score_from_path(mean_path: f64, sample_size: usize) -> f64 {
    let norm = average_path_length(sample_size);
    if norm <= 0.0 {
        return 1.0;
    }
    2f64.powf(-mean_path / norm)
}

/// `c(n)`: average path length of an unsuccessful BST search over `n` keys.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Decision threshold for a contamination rate: the `(1 - contamination)`
/// quantile of `scores` (linear interpolation). Points scoring strictly
/// above it are flagged, so roughly `contamination` of the fitted batch is.
pub fn contamination_threshold(scores: &[f64], contamination: f64) -> f64 {
    if scores.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let q = (1.0 - contamination).clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

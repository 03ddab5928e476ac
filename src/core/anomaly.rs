//! Anomaly scoring for the IP tracking service.
//!
//! This module implements the unsupervised half of a detection run: per-IP
//! behavioral features are extracted from the window, standardized, and
//! scored by an isolation forest. IPs in the top contamination fraction of
//! scores are flagged.
//!
//! The scorer is a strategy behind the [`AnomalyScorer`] trait so the
//! capability is decided once at startup: [`IsolationForestScorer`] when
//! scoring is enabled, [`NoopScorer`] otherwise. Scorer failures degrade the
//! run, they never fail it.

use std::collections::{HashMap, HashSet};

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::core::detector::Flag;
use crate::models::{AnomalyConfig, RequestLogEntry};

/// Euler-Mascheroni constant, for the expected path length of a BST search
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Subsample size cap per isolation tree
const MAX_TREE_SAMPLE: usize = 256;

/// Errors that can occur during anomaly scoring
#[derive(Error, Debug)]
pub enum AnomalyError {
    #[error("Feature matrix error: {0}")]
    FeatureMatrix(String),
    #[error("Scoring error: {0}")]
    Scoring(String),
}

/// Behavioral feature vector for one IP in one window
#[derive(Debug, Clone, PartialEq)]
pub struct IpFeatures {
    /// IP address these features belong to
    pub ip_address: String,
    /// Total requests in the window
    pub request_count: u64,
    /// Number of distinct paths accessed
    pub unique_paths: u64,
    /// Number of accesses to sensitive paths
    pub sensitive_hits: u64,
}

/// Aggregate per-IP features from a request window, sorted by IP
pub fn extract_features(entries: &[RequestLogEntry], sensitive_paths: &[String]) -> Vec<IpFeatures> {
    let mut per_ip: HashMap<&str, (u64, HashSet<&str>, u64)> = HashMap::new();
    for entry in entries {
        let (count, paths, sensitive) = per_ip.entry(entry.ip_address.as_str()).or_default();
        *count += 1;
        paths.insert(entry.path.as_str());
        if sensitive_paths.iter().any(|p| p == &entry.path) {
            *sensitive += 1;
        }
    }

    let mut features: Vec<IpFeatures> = per_ip
        .into_iter()
        .map(|(ip, (count, paths, sensitive))| IpFeatures {
            ip_address: ip.to_string(),
            request_count: count,
            unique_paths: paths.len() as u64,
            sensitive_hits: sensitive,
        })
        .collect();

    features.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));
    features
}

/// Strategy interface for the unsupervised scoring pass
#[cfg_attr(test, mockall::automock)]
pub trait AnomalyScorer: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Score a window's feature vectors, returning flags for anomalous IPs
    ///
    /// Implementations must return no flags when fewer than two distinct
    /// IPs are present: an outlier model needs more than one sample.
    fn score(&self, features: &[IpFeatures]) -> Result<Vec<Flag>, AnomalyError>;
}

/// Scorer substituted when anomaly scoring is disabled
pub struct NoopScorer;

impl AnomalyScorer for NoopScorer {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn score(&self, _features: &[IpFeatures]) -> Result<Vec<Flag>, AnomalyError> {
        Ok(Vec::new())
    }
}

/// Isolation-forest scorer
///
/// Features are standardized to zero mean and unit variance before fitting.
/// The forest is seeded, so the same window always produces the same flags.
pub struct IsolationForestScorer {
    /// Scorer configuration
    config: AnomalyConfig,
}

impl IsolationForestScorer {
    /// Create a new scorer instance
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }
}

impl AnomalyScorer for IsolationForestScorer {
    fn name(&self) -> &'static str {
        "isolation_forest"
    }

    fn score(&self, features: &[IpFeatures]) -> Result<Vec<Flag>, AnomalyError> {
        let n = features.len();
        if n < 2 {
            return Ok(Vec::new());
        }

        let raw: Vec<f64> = features
            .iter()
            .flat_map(|f| {
                [
                    f.request_count as f64,
                    f.unique_paths as f64,
                    f.sensitive_hits as f64,
                ]
            })
            .collect();
        let matrix = Array2::from_shape_vec((n, 3), raw)
            .map_err(|e| AnomalyError::FeatureMatrix(e.to_string()))?;

        let standardized = standardize(&matrix);
        let forest = IsolationForest::fit(
            &standardized,
            self.config.num_trees,
            self.config.random_seed,
        )?;
        let scores: Vec<f64> = (0..n)
            .map(|row| forest.score(&standardized.row(row).to_owned()))
            .collect();

        // A window where every IP behaves identically has nothing to flag
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
        if max - min < 1e-9 {
            return Ok(Vec::new());
        }

        let mut ranked: Vec<usize> = (0..n).collect();
        ranked.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let flagged = ((n as f64) * self.config.contamination).ceil() as usize;
        let flagged = flagged.clamp(1, n);

        Ok(ranked[..flagged]
            .iter()
            .map(|&i| {
                let f = &features[i];
                Flag {
                    ip_address: f.ip_address.clone(),
                    reason: format!(
                        "ML-detected anomaly: {} requests, {} unique paths, {} sensitive path accesses",
                        f.request_count, f.unique_paths, f.sensitive_hits
                    ),
                    request_count: f.request_count as i64,
                }
            })
            .collect())
    }
}

/// Scale each column to zero mean and unit variance
///
/// Zero-variance columns are only centered, never divided.
fn standardize(matrix: &Array2<f64>) -> Array2<f64> {
    let mean = matrix
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(matrix.ncols()));
    let std = matrix.std_axis(Axis(0), 0.0);

    let mut out = matrix.clone();
    for mut row in out.rows_mut() {
        for (j, value) in row.iter_mut().enumerate() {
            let sd = if std[j] > 1e-12 { std[j] } else { 1.0 };
            *value = (*value - mean[j]) / sd;
        }
    }
    out
}

enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// Forest of randomized isolation trees
struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    /// Fit a seeded forest over the rows of `data`
    fn fit(data: &Array2<f64>, num_trees: usize, seed: u64) -> Result<Self, AnomalyError> {
        let rows = data.nrows();
        if rows < 2 {
            return Err(AnomalyError::Scoring(
                "isolation forest needs at least 2 samples".to_string(),
            ));
        }
        if num_trees == 0 {
            return Err(AnomalyError::Scoring(
                "isolation forest needs at least 1 tree".to_string(),
            ));
        }

        let sample_size = rows.min(MAX_TREE_SAMPLE);
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let trees = (0..num_trees)
            .map(|_| {
                let sample = rand::seq::index::sample(&mut rng, rows, sample_size).into_vec();
                build_tree(data, &sample, 0, max_depth, &mut rng)
            })
            .collect();

        Ok(Self { trees, sample_size })
    }

    /// Anomaly score in (0, 1); higher means easier to isolate
    fn score(&self, point: &Array1<f64>) -> f64 {
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, point, 0))
            .sum();
        let mean_path = total / self.trees.len() as f64;
        2f64.powf(-mean_path / average_path_length(self.sample_size))
    }
}

fn build_tree(
    data: &Array2<f64>,
    rows: &[usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> Node {
    if rows.len() <= 1 || depth >= max_depth {
        return Node::Leaf { size: rows.len() };
    }

    // Only features that still vary within this partition are splittable
    let mut candidates = Vec::new();
    for feature in 0..data.ncols() {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &row in rows {
            let v = data[[row, feature]];
            min = min.min(v);
            max = max.max(v);
        }
        if max > min {
            candidates.push((feature, min, max));
        }
    }
    if candidates.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(min..max);

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
        .iter()
        .copied()
        .partition(|&row| data[[row, feature]] < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(data, &left_rows, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(data, &right_rows, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, point: &Array1<f64>, depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if point[*feature] < *threshold {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` items
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(specs: &[(&str, u64, u64, u64)]) -> Vec<IpFeatures> {
        specs
            .iter()
            .map(|(ip, count, paths, sensitive)| IpFeatures {
                ip_address: ip.to_string(),
                request_count: *count,
                unique_paths: *paths,
                sensitive_hits: *sensitive,
            })
            .collect()
    }

    fn scorer() -> IsolationForestScorer {
        IsolationForestScorer::new(AnomalyConfig::default())
    }

    #[test]
    fn test_extract_features() {
        let mut entries = Vec::new();
        for _ in 0..3 {
            entries.push(RequestLogEntry::new(
                "10.0.0.1".to_string(),
                "/home".to_string(),
                "GET".to_string(),
            ));
        }
        entries.push(RequestLogEntry::new(
            "10.0.0.1".to_string(),
            "/admin".to_string(),
            "GET".to_string(),
        ));
        entries.push(RequestLogEntry::new(
            "10.0.0.2".to_string(),
            "/home".to_string(),
            "GET".to_string(),
        ));

        let sensitive = vec!["/admin".to_string(), "/login".to_string()];
        let features = extract_features(&entries, &sensitive);

        assert_eq!(features.len(), 2);
        assert_eq!(features[0].ip_address, "10.0.0.1");
        assert_eq!(features[0].request_count, 4);
        assert_eq!(features[0].unique_paths, 2);
        assert_eq!(features[0].sensitive_hits, 1);
        assert_eq!(features[1].ip_address, "10.0.0.2");
        assert_eq!(features[1].sensitive_hits, 0);
    }

    #[test]
    fn test_fewer_than_two_ips_is_a_noop() {
        let single = features(&[("10.0.0.1", 500, 40, 20)]);
        assert!(scorer().score(&single).unwrap().is_empty());
        assert!(scorer().score(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_outlier_is_flagged() {
        let mut specs: Vec<(String, u64, u64, u64)> = (1..=9)
            .map(|i| (format!("10.0.0.{}", i), 5 + i as u64 % 3, 2, 0))
            .collect();
        specs.push(("10.0.0.99".to_string(), 400, 35, 18));
        let features: Vec<IpFeatures> = specs
            .iter()
            .map(|(ip, count, paths, sensitive)| IpFeatures {
                ip_address: ip.clone(),
                request_count: *count,
                unique_paths: *paths,
                sensitive_hits: *sensitive,
            })
            .collect();

        let flags = scorer().score(&features).unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].ip_address, "10.0.0.99");
        assert_eq!(flags[0].request_count, 400);
        assert_eq!(
            flags[0].reason,
            "ML-detected anomaly: 400 requests, 35 unique paths, 18 sensitive path accesses"
        );
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let window = features(&[
            ("10.0.0.1", 6, 2, 0),
            ("10.0.0.2", 7, 3, 0),
            ("10.0.0.3", 5, 2, 1),
            ("10.0.0.4", 300, 28, 12),
        ]);
        let first = scorer().score(&window).unwrap();
        let second = scorer().score(&window).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_identical_ips_produce_no_flags() {
        let window = features(&[
            ("10.0.0.1", 10, 3, 1),
            ("10.0.0.2", 10, 3, 1),
            ("10.0.0.3", 10, 3, 1),
        ]);
        assert!(scorer().score(&window).unwrap().is_empty());
    }

    #[test]
    fn test_noop_scorer() {
        let window = features(&[("10.0.0.1", 500, 40, 20), ("10.0.0.2", 5, 1, 0)]);
        assert!(NoopScorer.score(&window).unwrap().is_empty());
    }

    #[test]
    fn test_forest_scores_outlier_highest() {
        let raw: Vec<f64> = vec![
            1.0, 1.0, 0.0, //
            1.2, 1.0, 0.0, //
            0.9, 2.0, 0.0, //
            1.1, 1.0, 1.0, //
            40.0, 30.0, 15.0,
        ];
        let matrix = Array2::from_shape_vec((5, 3), raw).unwrap();
        let standardized = standardize(&matrix);
        let forest = IsolationForest::fit(&standardized, 100, 42).unwrap();

        let scores: Vec<f64> = (0..5)
            .map(|row| forest.score(&standardized.row(row).to_owned()))
            .collect();

        let top = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(top, 4);
        for score in scores {
            assert!(score > 0.0 && score < 1.0);
        }
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        // c(256) = 2(ln 255 + gamma) - 2*255/256, roughly 10.24
        assert!(average_path_length(256) > 9.0);
        assert!(average_path_length(256) < 12.0);
    }

    #[test]
    fn test_standardize_centers_columns() {
        let matrix = Array2::from_shape_vec((2, 3), vec![2.0, 4.0, 7.0, 4.0, 4.0, 9.0]).unwrap();
        let out = standardize(&matrix);

        for j in 0..3 {
            let mean: f64 = (out[[0, j]] + out[[1, j]]) / 2.0;
            assert!(mean.abs() < 1e-9);
        }
        // Constant column stays centered at zero without dividing by zero
        assert_eq!(out[[0, 1]], 0.0);
        assert_eq!(out[[1, 1]], 0.0);
    }
}

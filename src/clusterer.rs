//! Per-axis segment discovery with K-Means and silhouette-based k selection

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::Utc;
use linfa::prelude::*;
use linfa_clustering::{KMeans, KMeansInit};
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::axis::Axis;
use crate::config::{DiscoveryConfig, MAX_ITERATION_CAP, MIN_POPULATION};
use crate::definition::{Segment, SegmentDefinition};
use crate::error::{SegResult, SegmentationError};
use crate::scaler::ScalerParams;

/// One fitted candidate segmentation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub k: usize,
    /// Cluster assignments for the population rows
    pub labels: Array1<usize>,
    /// Cluster centroids in standardized space
    pub centroids: Array2<f64>,
    /// Mean silhouette coefficient in [-1, 1]
    pub silhouette: f64,
    /// Within-cluster sum of squares
    pub inertia: f64,
}

/// Discovers the segments of one axis from a standardized population.
#[derive(Debug, Clone, Default)]
pub struct AxisClusterer {
    config: DiscoveryConfig,
}

impl AxisClusterer {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Discover segments for the axis `scaler` was fitted on.
    ///
    /// # Arguments
    /// * `scaler` - Parameters that produced `records`; stored in the result
    /// * `records` - Standardized population, one row per customer
    /// * `k_min`, `k_max` - Candidate segment counts
    ///
    /// # Returns
    /// * An unnamed definition (ordinal segment names, generation 0)
    pub fn discover(
        &self,
        scaler: &ScalerParams,
        records: &Array2<f64>,
        k_min: usize,
        k_max: usize,
    ) -> SegResult<SegmentDefinition> {
        let axis = scaler.axis;
        let n_samples = records.nrows();

        let required = self.config.min_population.max(MIN_POPULATION);
        if n_samples < required {
            return Err(SegmentationError::insufficient_population(
                axis, required, n_samples,
            ));
        }
        if records.ncols() != scaler.dimension() {
            return Err(SegmentationError::invalid_parameter(format!(
                "{} records have {} columns, scaler has {}",
                axis,
                records.ncols(),
                scaler.dimension()
            )));
        }
        if k_min == 0 || k_min > k_max {
            return Err(SegmentationError::invalid_parameter(format!(
                "invalid k range {}..={} for {}",
                k_min, k_max, axis
            )));
        }

        let distinct = count_distinct_rows(records, k_max);
        let k_hi = k_max.min(distinct);
        let k_lo = k_min.max(2).min(k_hi);
        if k_hi < 2 {
            warn!(%axis, n_samples, "Degenerate axis: population has no spread, using one segment");
            return Ok(degenerate_definition(scaler, records));
        }
        if k_hi < k_max {
            debug!(%axis, distinct, k_max, "Clamped k range to distinct population rows");
        }

        let candidates: Vec<SegResult<Candidate>> = (k_lo..=k_hi)
            .into_par_iter()
            .map(|k| self.fit_candidate(records, k))
            .collect();

        let mut fitted = Vec::with_capacity(candidates.len());
        for result in candidates {
            match result {
                Ok(candidate) => {
                    debug!(
                        %axis,
                        k = candidate.k,
                        silhouette = candidate.silhouette,
                        inertia = candidate.inertia,
                        "Scored candidate"
                    );
                    fitted.push(candidate);
                }
                Err(e) => warn!(%axis, error = %e, "Candidate fit failed"),
            }
        }

        let chosen = select_candidate(&fitted, self.config.silhouette_tolerance)
            .ok_or_else(|| {
                SegmentationError::Clustering(format!("no candidate k could be fitted for {}", axis))
            })?;

        info!(
            %axis,
            k = chosen.k,
            silhouette = chosen.silhouette,
            n_samples,
            "Selected segmentation"
        );

        Ok(SegmentDefinition {
            axis,
            generation: 0,
            discovered_at: Utc::now(),
            population_size: n_samples,
            scaler: scaler.clone(),
            silhouette: Some(chosen.silhouette),
            degenerate: false,
            segments: build_segments(axis, &chosen.centroids, &chosen.labels),
        })
    }

    /// Fit K-Means for one candidate k and score it.
    pub fn fit_candidate(&self, records: &Array2<f64>, k: usize) -> SegResult<Candidate> {
        let n_samples = records.nrows();
        let targets: Array1<usize> = Array1::zeros(n_samples);
        let dataset = Dataset::new(records.clone(), targets);

        let rng = StdRng::seed_from_u64(candidate_seed(self.config.seed, k));
        let model = KMeans::params_with(k, rng, L2Dist)
            .n_runs(self.config.n_restarts)
            .max_n_iterations(self.config.max_iterations.min(MAX_ITERATION_CAP))
            .tolerance(self.config.tolerance)
            .init_method(KMeansInit::KMeansPlusPlus)
            .fit(&dataset)
            .map_err(|e| SegmentationError::Clustering(format!("k={}: {}", k, e)))?;

        let labels: Array1<usize> = model.predict(records);
        let centroids = model.centroids().clone();
        let inertia = compute_inertia(records, &labels, &centroids);
        let silhouette = compute_silhouette_sample(
            records,
            &labels,
            k,
            self.config.silhouette_sample_size,
        );

        Ok(Candidate {
            k,
            labels,
            centroids,
            silhouette,
            inertia,
        })
    }
}

/// Pick the smallest k whose silhouette is within `tolerance` of the best.
pub fn select_candidate(candidates: &[Candidate], tolerance: f64) -> Option<&Candidate> {
    let best = candidates
        .iter()
        .map(|c| c.silhouette)
        .fold(f64::NEG_INFINITY, f64::max);
    candidates
        .iter()
        .filter(|c| c.silhouette >= best - tolerance)
        .min_by_key(|c| c.k)
}

fn candidate_seed(seed: u64, k: usize) -> u64 {
    seed ^ (k as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Count distinct rows, stopping once more than `limit` are seen.
fn count_distinct_rows(records: &Array2<f64>, limit: usize) -> usize {
    let mut seen: HashSet<Vec<u64>> = HashSet::new();
    for row in records.outer_iter() {
        // Adding 0.0 folds -0.0 into 0.0
        seen.insert(row.iter().map(|v| (v + 0.0).to_bits()).collect());
        if seen.len() > limit {
            break;
        }
    }
    seen.len()
}

fn degenerate_definition(scaler: &ScalerParams, records: &Array2<f64>) -> SegmentDefinition {
    let center = records
        .outer_iter()
        .next()
        .map(|row| row.to_vec())
        .unwrap_or_else(|| vec![0.0; scaler.dimension()]);

    SegmentDefinition {
        axis: scaler.axis,
        generation: 0,
        discovered_at: Utc::now(),
        population_size: records.nrows(),
        scaler: scaler.clone(),
        silhouette: None,
        degenerate: true,
        segments: vec![Segment {
            index: 0,
            name: Segment::ordinal_name(scaler.axis, 0),
            interpretation: None,
            center,
            population: records.nrows(),
        }],
    }
}

/// Order centroids by population (largest first) and give them ordinal names.
fn build_segments(
    axis: Axis,
    centroids: &Array2<f64>,
    labels: &Array1<usize>,
) -> Vec<Segment> {
    let mut sizes = vec![0usize; centroids.nrows()];
    for &label in labels.iter() {
        if label < sizes.len() {
            sizes[label] += 1;
        }
    }

    let mut order: Vec<(usize, Vec<f64>)> = centroids
        .outer_iter()
        .map(|c| c.to_vec())
        .enumerate()
        .collect();
    order.sort_by(|(a_idx, a), (b_idx, b)| {
        sizes[*b_idx]
            .cmp(&sizes[*a_idx])
            .then_with(|| compare_lexically(a, b))
    });

    order
        .into_iter()
        .enumerate()
        .map(|(index, (original, center))| Segment {
            index,
            name: Segment::ordinal_name(axis, index),
            interpretation: None,
            center,
            population: sizes[original],
        })
        .collect()
}

fn compare_lexically(a: &[f64], b: &[f64]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Compute within-cluster sum of squares (inertia)
fn compute_inertia(features: &Array2<f64>, labels: &Array1<usize>, centroids: &Array2<f64>) -> f64 {
    let mut inertia = 0.0;

    for (i, &cluster) in labels.iter().enumerate() {
        if cluster < centroids.nrows() {
            inertia += squared_distance(&features.row(i), &centroids.row(cluster));
        }
    }

    inertia
}

/// Mean silhouette coefficient over a deterministic strided sample.
///
/// Points alone in their cluster (within the sample) score 0.
pub fn compute_silhouette_sample(
    features: &Array2<f64>,
    labels: &Array1<usize>,
    n_clusters: usize,
    sample_size: usize,
) -> f64 {
    let n = features.nrows();
    let m = n.min(sample_size);
    if m < 2 || n_clusters < 2 {
        return 0.0;
    }
    let sample: Vec<usize> = (0..m).map(|i| i * n / m).collect();

    let mut silhouette_sum = 0.0;

    for &i in &sample {
        let point = features.row(i);
        let cluster_label = labels[i];

        let mut same_sum = 0.0;
        let mut same_count = 0usize;
        let mut other_sums = vec![0.0; n_clusters];
        let mut other_counts = vec![0usize; n_clusters];

        for &j in &sample {
            if i == j {
                continue;
            }
            let distance = squared_distance(&point, &features.row(j)).sqrt();
            let other_label = labels[j];

            if other_label == cluster_label {
                same_sum += distance;
                same_count += 1;
            } else if other_label < n_clusters {
                other_sums[other_label] += distance;
                other_counts[other_label] += 1;
            }
        }

        if same_count == 0 {
            continue;
        }
        let a_i = same_sum / same_count as f64;

        // b(i): min mean distance to points in other clusters
        let b_i = other_sums
            .iter()
            .zip(&other_counts)
            .filter(|(_, count)| **count > 0)
            .map(|(sum, count)| sum / *count as f64)
            .fold(f64::INFINITY, f64::min);

        let max = a_i.max(b_i);
        if b_i.is_finite() && max > 0.0 {
            silhouette_sum += (b_i - a_i) / max;
        }
    }

    silhouette_sum / m as f64
}

fn squared_distance(a: &ArrayView1<'_, f64>, b: &ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

//! Fuzzy segment membership.
//!
//! A customer belongs to every segment of an axis with a score in (0, 1];
//! scores on one axis sum to one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::axis::Axis;
use crate::definition::SegmentDefinition;
use crate::error::{SegResult, SegmentationError};
use crate::features::FeatureVector;
use crate::registry::DefinitionView;

/// Score of one segment for one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentScore {
    pub segment: String,
    pub score: f64,
}

/// Scores of one customer over every segment of one axis definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipVector {
    pub axis: Axis,
    /// Generation of the definition the scores were computed against.
    pub generation: u64,
    /// In the definition's segment order.
    pub scores: Vec<SegmentScore>,
}

impl MembershipVector {
    pub fn get(&self, segment: &str) -> Option<f64> {
        self.scores
            .iter()
            .find(|s| s.segment == segment)
            .map(|s| s.score)
    }

    pub fn total(&self) -> f64 {
        self.scores.iter().map(|s| s.score).sum()
    }

    /// Highest-scoring segment; ties go to the lexically smallest name.
    pub fn dominant(&self) -> Option<&SegmentScore> {
        self.ranked().into_iter().next()
    }

    /// The two best scores, highest first.
    pub fn top_two(&self) -> (Option<&SegmentScore>, Option<&SegmentScore>) {
        let ranked = self.ranked();
        (ranked.first().copied(), ranked.get(1).copied())
    }

    fn ranked(&self) -> Vec<&SegmentScore> {
        let mut ranked: Vec<&SegmentScore> = self.scores.iter().collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.segment.cmp(&b.segment))
        });
        ranked
    }
}

/// Compute a customer's membership in every segment of `definition`.
///
/// The vector is standardized with the definition's own scaler, never a
/// refitted one. Scores are `exp(-d_i)` normalized over segments, computed
/// as `exp(-(d_i - d_min))` so a distant customer cannot underflow to an
/// all-zero sum.
///
/// # Errors
/// `StaleScalerMismatch` if the vector's axis or feature set differs from
/// the definition's.
pub fn membership(
    features: &FeatureVector,
    definition: &SegmentDefinition,
) -> SegResult<MembershipVector> {
    if features.axis() != definition.axis {
        return Err(SegmentationError::StaleScalerMismatch {
            axis: definition.axis,
            expected: definition.scaler.feature_names.clone(),
            actual: features.names().iter().map(|s| s.to_string()).collect(),
        });
    }
    if definition.segments.is_empty() {
        return Err(SegmentationError::invalid_parameter(format!(
            "definition for {} has no segments",
            definition.axis
        )));
    }

    let point = definition.scaler.transform(features)?;

    let distances: Vec<f64> = definition
        .segments
        .iter()
        .map(|segment| {
            point
                .iter()
                .zip(&segment.center)
                .map(|(x, c)| (x - c).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .collect();

    let d_min = distances.iter().copied().fold(f64::INFINITY, f64::min);
    let weights: Vec<f64> = distances
        .iter()
        .map(|d| (-(d - d_min)).exp().max(f64::MIN_POSITIVE))
        .collect();
    let sum: f64 = weights.iter().sum();

    let scores = definition
        .segments
        .iter()
        .zip(weights)
        .map(|(segment, w)| SegmentScore {
            segment: segment.name.clone(),
            score: w / sum,
        })
        .collect();

    Ok(MembershipVector {
        axis: definition.axis,
        generation: definition.generation,
        scores,
    })
}

/// Memberships on every axis that has both features and a definition.
///
/// Axes without a definition are omitted rather than filled with uniform
/// scores.
pub fn memberships(
    features: &BTreeMap<Axis, FeatureVector>,
    definitions: &DefinitionView,
) -> SegResult<BTreeMap<Axis, MembershipVector>> {
    let mut out = BTreeMap::new();
    for (axis, vector) in features {
        let Some(definition) = definitions.get(axis) else {
            continue;
        };
        out.insert(*axis, membership(vector, definition)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::definition::test_support::identity_definition;

    fn three_segments() -> SegmentDefinition {
        identity_definition(
            Axis::PurchaseFrequency,
            &[&[0.0, 0.0, 0.0], &[3.0, 0.0, 0.0], &[0.0, 3.0, 0.0]],
        )
    }

    fn vector(values: &[f64]) -> FeatureVector {
        FeatureVector::new("c-1", Axis::PurchaseFrequency, values.to_vec()).unwrap()
    }

    fn assert_simplex(m: &MembershipVector) {
        assert!(m.scores.iter().all(|s| s.score > 0.0 && s.score <= 1.0));
        assert!((m.total() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scores_form_a_simplex() {
        let def = three_segments();
        for values in [[0.3, 0.1, -0.2], [1.5, 1.5, 0.0], [-2.0, 4.0, 1.0]] {
            let m = membership(&vector(&values), &def).unwrap();
            assert_eq!(m.scores.len(), 3);
            assert_simplex(&m);
        }
    }

    #[test]
    fn test_vector_at_center_is_strict_maximum() {
        let def = three_segments();
        let m = membership(&vector(&[3.0, 0.0, 0.0]), &def).unwrap();
        let best = m.get("purchase_frequency_1").unwrap();
        for s in &m.scores {
            if s.segment != "purchase_frequency_1" {
                assert!(best > s.score);
            }
        }
        assert_eq!(m.dominant().unwrap().segment, "purchase_frequency_1");
    }

    #[test]
    fn test_outlier_keeps_valid_simplex() {
        let def = three_segments();
        let m = membership(&vector(&[5000.0, 10.0, -3.0]), &def).unwrap();
        assert_simplex(&m);
        assert_eq!(m.dominant().unwrap().segment, "purchase_frequency_1");
    }

    #[test]
    fn test_membership_is_bit_identical_on_repeat() {
        let def = three_segments();
        let fv = vector(&[0.7, 1.2, -0.4]);
        let a = membership(&fv, &def).unwrap();
        let b = membership(&fv, &def).unwrap();
        for (x, y) in a.scores.iter().zip(&b.scores) {
            assert_eq!(x.score.to_bits(), y.score.to_bits());
        }
    }

    #[test]
    fn test_default_vector_gets_valid_membership() {
        let def = three_segments();
        let m = membership(&FeatureVector::defaults("new", Axis::PurchaseFrequency), &def).unwrap();
        assert_simplex(&m);
        assert_eq!(m.dominant().unwrap().segment, "purchase_frequency_0");
    }

    #[test]
    fn test_single_segment_scores_one() {
        let def = identity_definition(Axis::PurchaseFrequency, &[&[1.0, 1.0, 1.0]]);
        let m = membership(&vector(&[9.0, -9.0, 0.0]), &def).unwrap();
        assert_eq!(m.scores.len(), 1);
        assert_eq!(m.scores[0].score, 1.0);
    }

    #[test]
    fn test_axis_mismatch_is_rejected() {
        let def = three_segments();
        let fv = FeatureVector::defaults("c-1", Axis::ShoppingTiming);
        assert!(matches!(
            membership(&fv, &def),
            Err(SegmentationError::StaleScalerMismatch { .. })
        ));
    }

    #[test]
    fn test_ties_go_to_smallest_name() {
        let mut def = identity_definition(
            Axis::PurchaseFrequency,
            &[&[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]],
        );
        def.segments[0].name = "zeta".into();
        def.segments[1].name = "alpha".into();
        let m = membership(&vector(&[0.0, 0.0, 0.0]), &def).unwrap();
        assert_eq!(m.dominant().unwrap().segment, "alpha");
    }

    #[test]
    fn test_memberships_omit_undefined_axes() {
        let mut view = DefinitionView::new();
        view.insert(Axis::PurchaseFrequency, Arc::new(three_segments()));

        let mut features = BTreeMap::new();
        features.insert(Axis::PurchaseFrequency, vector(&[0.0, 0.0, 0.0]));
        features.insert(
            Axis::ShoppingTiming,
            FeatureVector::defaults("c-1", Axis::ShoppingTiming),
        );

        let out = memberships(&features, &view).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.contains_key(&Axis::PurchaseFrequency));
    }
}

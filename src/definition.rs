//! Discovered segment definitions.
//!
//! A definition pairs the scaler fitted at discovery time with the segment
//! centers found in that scaler's standardized space. The two are never
//! separated: re-discovery produces a new definition with a new generation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::axis::Axis;
use crate::error::{SegResult, SegmentationError};
use crate::scaler::ScalerParams;

/// One discovered segment of an axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Ordinal position within the definition (0 = largest at discovery).
    pub index: usize,
    /// Unique within the definition.
    pub name: String,
    pub interpretation: Option<String>,
    /// Center in standardized space, in the scaler's feature order.
    pub center: Vec<f64>,
    /// Sample members assigned to this segment at discovery.
    pub population: usize,
}

impl Segment {
    /// Deterministic fallback name, e.g. `purchase_frequency_2`.
    pub fn ordinal_name(axis: Axis, index: usize) -> String {
        format!("{}_{}", axis, index)
    }

    pub fn center_view(&self) -> ArrayView1<'_, f64> {
        ArrayView1::from(self.center.as_slice())
    }
}

/// The full discovery result for one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDefinition {
    pub axis: Axis,
    /// Assigned by the registry on install; 0 until then.
    pub generation: u64,
    pub discovered_at: DateTime<Utc>,
    pub population_size: usize,
    pub scaler: ScalerParams,
    /// Mean silhouette of the selected k; `None` for degenerate axes.
    pub silhouette: Option<f64>,
    /// True when the population had no spread and one trivial segment was produced.
    pub degenerate: bool,
    pub segments: Vec<Segment>,
}

impl SegmentDefinition {
    pub fn k(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn segment_names(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.name.as_str()).collect()
    }

    /// Center of a segment mapped back into raw feature units.
    pub fn raw_center(&self, index: usize) -> Option<Vec<f64>> {
        self.segments
            .get(index)
            .map(|s| self.scaler.inverse_transform(s.center_view()).to_vec())
    }

    /// Features that most distinguish a segment from the population average.
    ///
    /// Centers are standardized, so the absolute coordinate is the distance
    /// from the population mean in standard deviations. Returns up to `n`
    /// `(feature_name, z_score)` pairs, strongest first.
    pub fn top_features(&self, index: usize, n: usize) -> Vec<(String, f64)> {
        let Some(segment) = self.segments.get(index) else {
            return Vec::new();
        };
        let mut ranked: Vec<(String, f64)> = self
            .scaler
            .feature_names
            .iter()
            .cloned()
            .zip(segment.center.iter().copied())
            .collect();
        ranked.sort_by(|a, b| {
            b.1.abs()
                .total_cmp(&a.1.abs())
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(n);
        ranked
    }

    /// Check the structural invariants a definition must hold before use.
    pub fn validate(&self) -> SegResult<()> {
        self.scaler.ensure_matches(self.axis)?;

        if self.segments.is_empty() {
            return Err(SegmentationError::invalid_parameter(format!(
                "definition for {} has no segments",
                self.axis
            )));
        }

        let dimension = self.scaler.dimension();
        if self.scaler.mean.len() != dimension || self.scaler.std.len() != dimension {
            return Err(SegmentationError::invalid_parameter(format!(
                "scaler for {} has inconsistent widths",
                self.axis
            )));
        }

        let mut names = HashSet::with_capacity(self.segments.len());
        for segment in &self.segments {
            if segment.center.len() != dimension {
                return Err(SegmentationError::invalid_parameter(format!(
                    "segment {} on {} has {} coordinates, expected {}",
                    segment.name,
                    self.axis,
                    segment.center.len(),
                    dimension
                )));
            }
            if segment.center.iter().any(|c| !c.is_finite()) {
                return Err(SegmentationError::invalid_parameter(format!(
                    "segment {} on {} has a non-finite center",
                    segment.name, self.axis
                )));
            }
            if !names.insert(segment.name.as_str()) {
                return Err(SegmentationError::invalid_parameter(format!(
                    "duplicate segment name {} on {}",
                    segment.name, self.axis
                )));
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::identity_definition;
    use super::*;

    #[test]
    fn test_validate_accepts_well_formed_definition() {
        let def = identity_definition(
            Axis::PurchaseFrequency,
            &[&[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]],
        );
        assert!(def.validate().is_ok());
        assert_eq!(def.k(), 2);
        assert_eq!(
            def.segment_names(),
            vec!["purchase_frequency_0", "purchase_frequency_1"]
        );
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut def = identity_definition(Axis::PurchaseFrequency, &[&[1.0, 0.0, 0.0]]);
        def.segments[0].center.pop();
        assert!(def.validate().is_err());

        let mut dup = identity_definition(
            Axis::PurchaseFrequency,
            &[&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]],
        );
        dup.segments[1].name = dup.segments[0].name.clone();
        assert!(dup.validate().is_err());

        let mut empty = identity_definition(Axis::PurchaseFrequency, &[&[1.0, 0.0, 0.0]]);
        empty.segments.clear();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_stale_scaler() {
        let mut def = identity_definition(Axis::PurchaseFrequency, &[&[1.0, 0.0, 0.0]]);
        def.scaler.feature_names.reverse();
        assert!(matches!(
            def.validate(),
            Err(SegmentationError::StaleScalerMismatch { .. })
        ));
    }

    #[test]
    fn test_top_features_ranked_by_magnitude() {
        let def = identity_definition(Axis::PurchaseFrequency, &[&[0.5, -2.0, 1.0]]);
        let top = def.top_features(0, 2);
        assert_eq!(top[0].0, "mean_days_between_orders");
        assert_eq!(top[1].0, "purchase_regularity");
        assert!(def.top_features(5, 2).is_empty());
    }
}

//! Segment naming.
//!
//! Discovery never names segments. [`name_segments`] composes a definition
//! with a [`SegmentNamer`]; any namer failure falls back to the ordinal name
//! so a definition is always usable without an external call.

use std::collections::HashSet;

use thiserror::Error;
use tracing::warn;

use crate::axis::Axis;
use crate::definition::{Segment, SegmentDefinition};

/// How many distinguishing features are handed to a namer.
pub const TOP_FEATURES: usize = 3;

/// z-score beyond which a feature is described as high or low.
const NOTABLE_Z: f64 = 0.5;

/// A namer could not produce a label.
#[derive(Debug, Error)]
pub enum NamingError {
    /// The naming service is disabled or unreachable.
    #[error("Naming unavailable: {0}")]
    Unavailable(String),

    /// The service answered with something unusable.
    #[error("Invalid label: {0}")]
    InvalidLabel(String),
}

/// Everything a namer gets to see about one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSummary {
    pub index: usize,
    /// Center in standardized space.
    pub center: Vec<f64>,
    /// Center in raw feature units.
    pub raw_center: Vec<f64>,
    pub population: usize,
    /// `(feature_name, z_score)`, most distinguishing first.
    pub top_features: Vec<(String, f64)>,
}

/// A human-readable label for a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentLabel {
    pub name: String,
    pub interpretation: String,
}

/// Turns a segment summary into a label.
pub trait SegmentNamer: Send + Sync {
    fn name(&self, axis: Axis, segment: &SegmentSummary) -> Result<SegmentLabel, NamingError>;
}

/// Default namer: keeps the ordinal names.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdinalNamer;

impl SegmentNamer for OrdinalNamer {
    fn name(&self, axis: Axis, segment: &SegmentSummary) -> Result<SegmentLabel, NamingError> {
        Ok(SegmentLabel {
            name: Segment::ordinal_name(axis, segment.index),
            interpretation: format!(
                "{} segment {} ({} customers at discovery)",
                axis, segment.index, segment.population
            ),
        })
    }
}

/// Offline namer built from the two most distinguishing features.
///
/// Produces names like `high_order_count_low_mean_days_between_orders`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureProfileNamer;

impl SegmentNamer for FeatureProfileNamer {
    fn name(&self, axis: Axis, segment: &SegmentSummary) -> Result<SegmentLabel, NamingError> {
        let notable: Vec<&(String, f64)> = segment
            .top_features
            .iter()
            .filter(|(_, z)| z.abs() >= NOTABLE_Z)
            .take(2)
            .collect();

        if notable.is_empty() {
            return Ok(SegmentLabel {
                name: format!("typical_{}", axis),
                interpretation: format!("Close to the population average on {}", axis),
            });
        }

        let parts: Vec<String> = notable
            .iter()
            .map(|(feature, z)| format!("{}_{}", level(*z), feature))
            .collect();
        let described: Vec<String> = notable
            .iter()
            .map(|(feature, z)| format!("{} {} ({:+.1} sd)", level(*z), feature.replace('_', " "), z))
            .collect();

        Ok(SegmentLabel {
            name: parts.join("_"),
            interpretation: format!("{}: {}", axis, described.join(", ")),
        })
    }
}

fn level(z: f64) -> &'static str {
    if z >= 0.0 {
        "high"
    } else {
        "low"
    }
}

/// Summaries for every segment of a definition, in index order.
pub fn summarize(definition: &SegmentDefinition) -> Vec<SegmentSummary> {
    definition
        .segments
        .iter()
        .map(|segment| SegmentSummary {
            index: segment.index,
            center: segment.center.clone(),
            raw_center: definition
                .raw_center(segment.index)
                .unwrap_or_else(|| segment.center.clone()),
            population: segment.population,
            top_features: definition.top_features(segment.index, TOP_FEATURES),
        })
        .collect()
}

/// Return a copy of `definition` with every segment named by `namer`.
///
/// Failures are logged and replaced by the ordinal name. Empty or duplicate
/// names are made unique by appending the segment index.
pub fn name_segments(definition: &SegmentDefinition, namer: &dyn SegmentNamer) -> SegmentDefinition {
    let axis = definition.axis;
    let mut named = definition.clone();
    let mut used: HashSet<String> = HashSet::with_capacity(named.segments.len());

    for (segment, summary) in named.segments.iter_mut().zip(summarize(definition)) {
        let label = match namer.name(axis, &summary) {
            Ok(label) => label,
            Err(e) => {
                warn!(
                    %axis,
                    segment = summary.index,
                    error = %e,
                    "Segment naming failed, using ordinal name"
                );
                SegmentLabel {
                    name: Segment::ordinal_name(axis, summary.index),
                    interpretation: String::new(),
                }
            }
        };

        let mut name = sanitize(&label.name);
        if name.is_empty() {
            name = Segment::ordinal_name(axis, summary.index);
        }
        while used.contains(&name) {
            name = format!("{}_{}", name, summary.index);
        }
        used.insert(name.clone());

        segment.name = name;
        segment.interpretation = Some(label.interpretation).filter(|s| !s.is_empty());
    }

    named
}

/// Lowercase snake_case with only `[a-z0-9_]`.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::test_support::identity_definition;

    struct FailingNamer;

    impl SegmentNamer for FailingNamer {
        fn name(&self, _: Axis, _: &SegmentSummary) -> Result<SegmentLabel, NamingError> {
            Err(NamingError::Unavailable("service disabled".into()))
        }
    }

    struct ConstantNamer;

    impl SegmentNamer for ConstantNamer {
        fn name(&self, _: Axis, _: &SegmentSummary) -> Result<SegmentLabel, NamingError> {
            Ok(SegmentLabel {
                name: "Loyal Regulars!".into(),
                interpretation: "Buys often".into(),
            })
        }
    }

    fn two_segment_definition() -> SegmentDefinition {
        identity_definition(
            Axis::PurchaseFrequency,
            &[&[2.0, -1.5, 0.1], &[-0.1, 0.2, 0.1]],
        )
    }

    #[test]
    fn test_ordinal_namer_keeps_ordinal_names() {
        let named = name_segments(&two_segment_definition(), &OrdinalNamer);
        assert_eq!(
            named.segment_names(),
            vec!["purchase_frequency_0", "purchase_frequency_1"]
        );
        assert!(named.segments[0].interpretation.is_some());
    }

    #[test]
    fn test_feature_profile_names() {
        let named = name_segments(&two_segment_definition(), &FeatureProfileNamer);
        assert_eq!(
            named.segments[0].name,
            "high_order_count_low_mean_days_between_orders"
        );
        assert_eq!(named.segments[1].name, "typical_purchase_frequency");
        assert!(named.validate().is_ok());
    }

    #[test]
    fn test_failing_namer_falls_back() {
        let named = name_segments(&two_segment_definition(), &FailingNamer);
        assert_eq!(
            named.segment_names(),
            vec!["purchase_frequency_0", "purchase_frequency_1"]
        );
        assert!(named.segments[0].interpretation.is_none());
    }

    #[test]
    fn test_duplicate_names_made_unique() {
        let named = name_segments(&two_segment_definition(), &ConstantNamer);
        assert_eq!(
            named.segment_names(),
            vec!["loyal_regulars", "loyal_regulars_1"]
        );
        assert!(named.validate().is_ok());
    }

    #[test]
    fn test_naming_does_not_touch_centers_or_scaler() {
        let original = two_segment_definition();
        let named = name_segments(&original, &FeatureProfileNamer);
        assert_eq!(named.scaler, original.scaler);
        for (a, b) in named.segments.iter().zip(&original.segments) {
            assert_eq!(a.center, b.center);
        }
    }
}

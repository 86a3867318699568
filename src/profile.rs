//! Multi-axis customer profiles.
//!
//! A profile is a pure fold over per-axis memberships: dominant segment and
//! strength per axis, plus an archetype built from the dominant names.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::axis::Axis;
use crate::membership::MembershipVector;

/// A top score at or above this is a strong membership.
pub const STRONG_THRESHOLD: f64 = 0.7;

/// Below [`STRONG_THRESHOLD`], a top-two gap under this is balanced.
pub const BALANCED_GAP: f64 = 0.15;

/// How clearly a customer belongs to their dominant segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStrength {
    Strong,
    Balanced,
    Moderate,
}

impl MembershipStrength {
    /// Classify from the best and second-best scores.
    pub fn classify(top: f64, second: Option<f64>) -> Self {
        if top >= STRONG_THRESHOLD {
            return MembershipStrength::Strong;
        }
        match second {
            Some(second) if top - second < BALANCED_GAP => MembershipStrength::Balanced,
            Some(_) => MembershipStrength::Moderate,
            None => MembershipStrength::Strong,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStrength::Strong => "strong",
            MembershipStrength::Balanced => "balanced",
            MembershipStrength::Moderate => "moderate",
        }
    }
}

impl fmt::Display for MembershipStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer's standing on one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisProfile {
    pub generation: u64,
    pub memberships: MembershipVector,
    pub dominant_segment: String,
    pub dominant_score: f64,
    pub strength: MembershipStrength,
}

/// The combination of dominant segments across axes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archetype {
    /// `axis=segment` pairs joined by `|`, in axis order.
    pub key: String,
    /// Dominant segment names joined by `, `, in axis order.
    pub interpretation: String,
}

/// Latest per-axis standing of one customer.
///
/// Holds no wall-clock data, so the same memberships always compose to an
/// identical profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id: String,
    pub axes: BTreeMap<Axis, AxisProfile>,
    pub archetype: Archetype,
}

impl CustomerProfile {
    pub fn axis(&self, axis: Axis) -> Option<&AxisProfile> {
        self.axes.get(&axis)
    }

    pub fn dominant_segment(&self, axis: Axis) -> Option<&str> {
        self.axes.get(&axis).map(|a| a.dominant_segment.as_str())
    }
}

/// Fold per-axis memberships into a profile.
///
/// Axes with an empty membership vector are skipped.
pub fn compose(
    customer_id: impl Into<String>,
    memberships: BTreeMap<Axis, MembershipVector>,
) -> CustomerProfile {
    let mut axes = BTreeMap::new();
    for (axis, vector) in memberships {
        let (Some(top), second) = vector.top_two() else {
            continue;
        };
        let profile = AxisProfile {
            generation: vector.generation,
            dominant_segment: top.segment.clone(),
            dominant_score: top.score,
            strength: MembershipStrength::classify(top.score, second.map(|s| s.score)),
            memberships: vector.clone(),
        };
        axes.insert(axis, profile);
    }

    let archetype = Archetype {
        key: axes
            .iter()
            .map(|(axis, p)| format!("{}={}", axis, p.dominant_segment))
            .collect::<Vec<_>>()
            .join("|"),
        interpretation: axes
            .values()
            .map(|p| p.dominant_segment.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    };

    CustomerProfile {
        customer_id: customer_id.into(),
        axes,
        archetype,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::SegmentScore;

    fn vector(axis: Axis, scores: &[(&str, f64)]) -> MembershipVector {
        MembershipVector {
            axis,
            generation: 1,
            scores: scores
                .iter()
                .map(|(name, score)| SegmentScore {
                    segment: name.to_string(),
                    score: *score,
                })
                .collect(),
        }
    }

    #[test]
    fn test_strength_classification() {
        assert_eq!(MembershipStrength::classify(0.7, Some(0.3)), MembershipStrength::Strong);
        assert_eq!(MembershipStrength::classify(0.45, Some(0.40)), MembershipStrength::Balanced);
        assert_eq!(MembershipStrength::classify(0.60, Some(0.30)), MembershipStrength::Moderate);
        assert_eq!(MembershipStrength::classify(1.0, None), MembershipStrength::Strong);
    }

    #[test]
    fn test_compose_builds_archetype_in_axis_order() {
        let mut memberships = BTreeMap::new();
        memberships.insert(
            Axis::ShoppingTiming,
            vector(Axis::ShoppingTiming, &[("night_owl", 0.8), ("early_bird", 0.2)]),
        );
        memberships.insert(
            Axis::PurchaseFrequency,
            vector(Axis::PurchaseFrequency, &[("occasional", 0.3), ("frequent", 0.7)]),
        );

        let profile = compose("c-9", memberships);
        assert_eq!(profile.customer_id, "c-9");
        assert_eq!(
            profile.archetype.key,
            "purchase_frequency=frequent|shopping_timing=night_owl"
        );
        assert_eq!(profile.archetype.interpretation, "frequent, night_owl");
        assert_eq!(
            profile.axis(Axis::ShoppingTiming).unwrap().strength,
            MembershipStrength::Strong
        );
    }

    #[test]
    fn test_dominant_tie_breaks_lexically() {
        let mut memberships = BTreeMap::new();
        memberships.insert(
            Axis::SpendingLevel,
            vector(Axis::SpendingLevel, &[("premium", 0.5), ("budget", 0.5)]),
        );
        let profile = compose("c-1", memberships);
        let axis = profile.axis(Axis::SpendingLevel).unwrap();
        assert_eq!(axis.dominant_segment, "budget");
        assert_eq!(axis.strength, MembershipStrength::Balanced);
    }

    #[test]
    fn test_compose_is_deterministic() {
        let build = || {
            let mut m = BTreeMap::new();
            m.insert(
                Axis::SpendingLevel,
                vector(Axis::SpendingLevel, &[("a", 0.55), ("b", 0.25), ("c", 0.2)]),
            );
            compose("c-1", m)
        };
        let a = serde_json::to_string(&build()).unwrap();
        let b = serde_json::to_string(&build()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_memberships_give_empty_archetype() {
        let profile = compose("c-1", BTreeMap::new());
        assert!(profile.axes.is_empty());
        assert_eq!(profile.archetype, Archetype::default());
    }
}

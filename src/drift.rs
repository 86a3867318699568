//! Comparison of two snapshots of the same customer.
//!
//! Segment names only mean something within one generation of an axis
//! definition, so memberships are compared only when both snapshots were
//! scored against the same generation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::axis::Axis;
use crate::profile::{AxisProfile, CustomerProfile};
use crate::snapshot::ProfileSnapshot;

/// Movement on one axis between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AxisDrift {
    /// Same generation; memberships are directly comparable.
    Comparable {
        dominant_changed: bool,
        from: String,
        to: String,
        /// Total variation distance between the two membership vectors.
        shift: f64,
    },
    /// The axis was re-discovered in between.
    Regenerated {
        from_generation: u64,
        to_generation: u64,
    },
    Appeared,
    Disappeared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDrift {
    pub customer_id: String,
    pub axes: BTreeMap<Axis, AxisDrift>,
}

impl ProfileDrift {
    /// Axes whose dominant segment changed within a generation.
    pub fn changed_axes(&self) -> Vec<Axis> {
        self.axes
            .iter()
            .filter(|(_, d)| {
                matches!(
                    d,
                    AxisDrift::Comparable {
                        dominant_changed: true,
                        ..
                    }
                )
            })
            .map(|(axis, _)| *axis)
            .collect()
    }
}

/// Compare an earlier snapshot with a later one.
pub fn compare(earlier: &ProfileSnapshot, later: &ProfileSnapshot) -> ProfileDrift {
    compare_profiles(&earlier.profile, &later.profile)
}

pub fn compare_profiles(earlier: &CustomerProfile, later: &CustomerProfile) -> ProfileDrift {
    let axes: BTreeSet<Axis> = earlier.axes.keys().chain(later.axes.keys()).copied().collect();

    let drift = axes
        .into_iter()
        .map(|axis| {
            let d = match (earlier.axes.get(&axis), later.axes.get(&axis)) {
                (Some(a), Some(b)) => axis_drift(a, b),
                (None, Some(_)) => AxisDrift::Appeared,
                // BTreeSet built from both key sets, so at least one side is present
                _ => AxisDrift::Disappeared,
            };
            (axis, d)
        })
        .collect();

    ProfileDrift {
        customer_id: later.customer_id.clone(),
        axes: drift,
    }
}

fn axis_drift(a: &AxisProfile, b: &AxisProfile) -> AxisDrift {
    if a.generation != b.generation {
        return AxisDrift::Regenerated {
            from_generation: a.generation,
            to_generation: b.generation,
        };
    }

    let names: BTreeSet<&str> = a
        .memberships
        .scores
        .iter()
        .chain(&b.memberships.scores)
        .map(|s| s.segment.as_str())
        .collect();
    let l1: f64 = names
        .into_iter()
        .map(|name| {
            let x = a.memberships.get(name).unwrap_or(0.0);
            let y = b.memberships.get(name).unwrap_or(0.0);
            (x - y).abs()
        })
        .sum();

    AxisDrift::Comparable {
        dominant_changed: a.dominant_segment != b.dominant_segment,
        from: a.dominant_segment.clone(),
        to: b.dominant_segment.clone(),
        shift: l1 / 2.0,
    }
}

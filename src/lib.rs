//! SegForge: multi-axis fuzzy behavioral segmentation of customers
//!
//! Each behavioral axis is segmented independently with K-Means on
//! standardized features. Customers then receive a fuzzy membership in every
//! segment of every axis, which is folded into a multi-axis profile and can be
//! frozen into dated snapshots.

pub mod axis;
pub mod cli;
pub mod clusterer;
pub mod config;
pub mod definition;
pub mod drift;
pub mod error;
pub mod features;
pub mod history;
pub mod membership;
pub mod naming;
pub mod pipeline;
pub mod profile;
pub mod registry;
pub mod scaler;
pub mod snapshot;

// Re-export public items for easier access
pub use axis::{Axis, StoreCapabilities};
pub use cli::{Cli, Command};
pub use clusterer::AxisClusterer;
pub use config::{DiscoveryConfig, EngineConfig};
pub use definition::{Segment, SegmentDefinition};
pub use error::{SegResult, SegmentationError};
pub use features::{FeatureExtractor, FeatureVector};
pub use history::{load_histories, CustomerHistory, HistorySource, InMemoryHistorySource};
pub use membership::{membership, memberships, MembershipVector};
pub use naming::{name_segments, FeatureProfileNamer, OrdinalNamer, SegmentNamer};
pub use pipeline::{profile_customer, BatchReport, CancellationToken, DiscoveryJob, Profiler};
pub use profile::{compose, CustomerProfile, MembershipStrength};
pub use registry::{DefinitionRegistry, DefinitionStore, DefinitionView, JsonDefinitionStore};
pub use scaler::{AxisScaler, ScalerParams};
pub use snapshot::{
    snapshot, BusinessContext, InMemorySnapshotStore, JsonFileSnapshotStore, SnapshotManager,
    SnapshotOutcome, SnapshotType,
};

/// Common result type used by the binary and CLI helpers
pub type Result<T> = anyhow::Result<T>;

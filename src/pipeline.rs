//! Batch discovery and profiling.
//!
//! Discovery runs one rayon task per available axis; profiling runs one task
//! per customer against a single [`DefinitionView`] taken at the start of the
//! batch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::axis::{Axis, StoreCapabilities};
use crate::clusterer::AxisClusterer;
use crate::config::DiscoveryConfig;
use crate::definition::SegmentDefinition;
use crate::error::{SegResult, SegmentationError};
use crate::features::{FeatureExtractor, FeatureVector};
use crate::history::{CustomerHistory, HistorySource};
use crate::membership::memberships;
use crate::naming::{name_segments, OrdinalNamer, SegmentNamer};
use crate::profile::{compose, CustomerProfile};
use crate::registry::{DefinitionRegistry, DefinitionStore, DefinitionView};
use crate::scaler::AxisScaler;

static ORDINAL_NAMER: OrdinalNamer = OrdinalNamer;

/// Cooperative cancellation flag shared between a job and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one axis during discovery.
#[derive(Debug, Clone, PartialEq)]
pub enum AxisOutcome {
    Discovered {
        generation: u64,
        k: usize,
        silhouette: Option<f64>,
        degenerate: bool,
    },
    /// The store lacks a data source the axis needs.
    Skipped,
    Failed(String),
    Cancelled,
}

impl fmt::Display for AxisOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisOutcome::Discovered {
                generation,
                k,
                silhouette,
                degenerate,
            } => {
                write!(f, "generation {}, k={}", generation, k)?;
                if let Some(s) = silhouette {
                    write!(f, ", silhouette={:.3}", s)?;
                }
                if *degenerate {
                    write!(f, " (degenerate)")?;
                }
                Ok(())
            }
            AxisOutcome::Skipped => write!(f, "skipped (data not available)"),
            AxisOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            AxisOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub outcomes: BTreeMap<Axis, AxisOutcome>,
    /// Customers whose history was rejected before extraction.
    pub rejected_customers: usize,
}

impl DiscoveryReport {
    pub fn discovered(&self) -> Vec<Axis> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, AxisOutcome::Discovered { .. }))
            .map(|(axis, _)| *axis)
            .collect()
    }

    pub fn outcome(&self, axis: Axis) -> Option<&AxisOutcome> {
        self.outcomes.get(&axis)
    }
}

/// A configured discovery run over a population.
pub struct DiscoveryJob<'a> {
    config: DiscoveryConfig,
    extractor: FeatureExtractor,
    capabilities: StoreCapabilities,
    namer: &'a dyn SegmentNamer,
    store: Option<&'a dyn DefinitionStore>,
    cancel: CancellationToken,
}

impl<'a> DiscoveryJob<'a> {
    pub fn new(config: DiscoveryConfig, extractor: FeatureExtractor) -> Self {
        Self {
            config,
            extractor,
            capabilities: StoreCapabilities::default(),
            namer: &ORDINAL_NAMER,
            store: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: StoreCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_namer(mut self, namer: &'a dyn SegmentNamer) -> Self {
        self.namer = namer;
        self
    }

    pub fn with_store(mut self, store: &'a dyn DefinitionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Discover every available axis and install the results.
    ///
    /// A failing axis does not affect the others. Axes finished before a
    /// cancellation stay installed.
    pub fn run(&self, population: &[CustomerHistory], registry: &DefinitionRegistry) -> DiscoveryReport {
        let axes = Axis::available(&self.capabilities);
        info!(
            customers = population.len(),
            axes = axes.len(),
            "Starting segment discovery"
        );

        let extracted: Vec<SegResult<BTreeMap<Axis, FeatureVector>>> = population
            .par_iter()
            .map(|history| self.extractor.extract_axes(&axes, history))
            .collect();

        let mut by_axis: BTreeMap<Axis, Vec<FeatureVector>> = BTreeMap::new();
        let mut rejected_customers = 0usize;
        for (history, result) in population.iter().zip(extracted) {
            match result {
                Ok(features) => {
                    for (axis, vector) in features {
                        by_axis.entry(axis).or_default().push(vector);
                    }
                }
                Err(e) => {
                    warn!(customer_id = %history.customer_id, error = %e, "Excluded from discovery");
                    rejected_customers += 1;
                }
            }
        }

        let discovered: Vec<(Axis, AxisOutcome)> = axes
            .par_iter()
            .map(|axis| {
                if self.cancel.is_cancelled() {
                    return (*axis, AxisOutcome::Cancelled);
                }
                let vectors = by_axis.get(axis).map(Vec::as_slice).unwrap_or(&[]);
                let outcome = match self.discover_axis(*axis, vectors, registry) {
                    Ok(def) => AxisOutcome::Discovered {
                        generation: def.generation,
                        k: def.k(),
                        silhouette: def.silhouette,
                        degenerate: def.degenerate,
                    },
                    Err(e) => {
                        warn!(%axis, error = %e, "Axis discovery failed");
                        AxisOutcome::Failed(e.to_string())
                    }
                };
                (*axis, outcome)
            })
            .collect();

        let mut outcomes: BTreeMap<Axis, AxisOutcome> = Axis::ALL
            .iter()
            .map(|axis| (*axis, AxisOutcome::Skipped))
            .collect();
        outcomes.extend(discovered);

        let report = DiscoveryReport {
            outcomes,
            rejected_customers,
        };
        info!(
            discovered = report.discovered().len(),
            rejected_customers, "Segment discovery finished"
        );
        report
    }

    /// Fit, cluster, name, persist and install one axis.
    ///
    /// The definition is persisted before it is installed, so a failed write
    /// leaves both the store and the registry on the previous generation.
    pub fn discover_axis(
        &self,
        axis: Axis,
        population: &[FeatureVector],
        registry: &DefinitionRegistry,
    ) -> SegResult<Arc<SegmentDefinition>> {
        let required = self.config.min_population;
        if population.len() < required {
            return Err(SegmentationError::insufficient_population(
                axis,
                required,
                population.len(),
            ));
        }

        let scaler = AxisScaler::fit(axis, population)?;
        let records = scaler.transform_population(population)?;
        let (k_min, k_max) = axis.k_range();
        let definition = AxisClusterer::new(self.config.clone()).discover(&scaler, &records, k_min, k_max)?;

        let named = name_segments(&definition, self.namer);
        match self.store {
            Some(store) => registry.install_with(named, |def| store.save(def)),
            None => registry.install(named),
        }
    }
}

/// Profile one customer against a fixed set of definitions.
///
/// Only axes that are both available for the store and defined in `view`
/// appear in the profile.
pub fn profile_customer(
    history: &CustomerHistory,
    view: &DefinitionView,
    extractor: &FeatureExtractor,
    capabilities: &StoreCapabilities,
) -> SegResult<CustomerProfile> {
    let axes: Vec<Axis> = Axis::available(capabilities)
        .into_iter()
        .filter(|axis| view.contains_key(axis))
        .collect();
    let features = extractor.extract_axes(&axes, history)?;
    let scores = memberships(&features, view)?;
    Ok(compose(history.customer_id.clone(), scores))
}

/// A customer the batch could not profile.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerFailure {
    pub customer_id: String,
    pub reason: String,
}

/// Results of a profiling batch, sorted by customer id.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub profiles: Vec<CustomerProfile>,
    pub failures: Vec<CustomerFailure>,
    /// Customers not started because the batch was cancelled.
    pub cancelled: Vec<String>,
}

impl BatchReport {
    pub fn profile(&self, customer_id: &str) -> Option<&CustomerProfile> {
        self.profiles
            .binary_search_by(|p| p.customer_id.as_str().cmp(customer_id))
            .ok()
            .map(|i| &self.profiles[i])
    }
}

enum Unit {
    Done(CustomerProfile),
    Failed(String, SegmentationError),
    Cancelled(String),
}

/// Profiles customers in parallel against one definition view.
pub struct Profiler {
    view: DefinitionView,
    extractor: FeatureExtractor,
    capabilities: StoreCapabilities,
    cancel: CancellationToken,
}

impl Profiler {
    pub fn new(view: DefinitionView, extractor: FeatureExtractor) -> Self {
        Self {
            view,
            extractor,
            capabilities: StoreCapabilities::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: StoreCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn view(&self) -> &DefinitionView {
        &self.view
    }

    pub fn profile(&self, history: &CustomerHistory) -> SegResult<CustomerProfile> {
        profile_customer(history, &self.view, &self.extractor, &self.capabilities)
    }

    /// Profile every history.
    ///
    /// # Errors
    /// Only invariant violations abort the batch; every other per-customer
    /// error is collected in [`BatchReport::failures`].
    pub fn profile_histories(&self, histories: &[CustomerHistory]) -> SegResult<BatchReport> {
        let units: Vec<Unit> = histories
            .par_iter()
            .map(|history| {
                if self.cancel.is_cancelled() {
                    return Unit::Cancelled(history.customer_id.clone());
                }
                match self.profile(history) {
                    Ok(profile) => Unit::Done(profile),
                    Err(e) => Unit::Failed(history.customer_id.clone(), e),
                }
            })
            .collect();
        self.finish(units)
    }

    /// Load and profile customers from a history source.
    pub fn profile_source(
        &self,
        source: &dyn HistorySource,
        customer_ids: &[String],
    ) -> SegResult<BatchReport> {
        let units: Vec<Unit> = customer_ids
            .par_iter()
            .map(|id| {
                if self.cancel.is_cancelled() {
                    return Unit::Cancelled(id.clone());
                }
                match source.load(id).and_then(|h| self.profile(&h)) {
                    Ok(profile) => Unit::Done(profile),
                    Err(e) => Unit::Failed(id.clone(), e),
                }
            })
            .collect();
        self.finish(units)
    }

    fn finish(&self, units: Vec<Unit>) -> SegResult<BatchReport> {
        let mut report = BatchReport::default();
        for unit in units {
            match unit {
                Unit::Done(profile) => report.profiles.push(profile),
                Unit::Failed(customer_id, e) if e.is_invariant_violation() => {
                    error!(%customer_id, error = %e, "Invariant violation, aborting batch");
                    return Err(e);
                }
                Unit::Failed(customer_id, e) => {
                    warn!(%customer_id, error = %e, "Customer profiling failed");
                    report.failures.push(CustomerFailure {
                        customer_id,
                        reason: e.to_string(),
                    });
                }
                Unit::Cancelled(customer_id) => report.cancelled.push(customer_id),
            }
        }

        report.profiles.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));
        report.failures.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));
        report.cancelled.sort();
        info!(
            profiled = report.profiles.len(),
            failed = report.failures.len(),
            cancelled = report.cancelled.len(),
            "Profiling batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::definition::test_support::identity_definition;
    use crate::history::{InMemoryHistorySource, Order};

    fn as_of() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn history(id: &str, orders: usize, gap_days: i64) -> CustomerHistory {
        let start = as_of() - Duration::days(400);
        CustomerHistory::new(id).with_orders(
            (0..orders)
                .map(|i| {
                    Order::new(
                        format!("{}-{}", id, i),
                        start + Duration::days(gap_days * i as i64),
                        40.0 + i as f64,
                    )
                })
                .collect(),
        )
    }

    fn view_with(def: SegmentDefinition) -> DefinitionView {
        let registry = DefinitionRegistry::new();
        registry.install(def).unwrap();
        registry.view()
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_profile_uses_only_defined_axes() {
        let view = view_with(identity_definition(
            Axis::PurchaseFrequency,
            &[&[0.0, 0.0, 0.0], &[10.0, 10.0, 0.0]],
        ));
        let profile = profile_customer(
            &history("c-1", 5, 30),
            &view,
            &FeatureExtractor::new(as_of()),
            &StoreCapabilities::full(),
        )
        .unwrap();
        assert_eq!(profile.axes.len(), 1);
        assert!(profile.axis(Axis::PurchaseFrequency).is_some());
        assert_eq!(profile.axis(Axis::PurchaseFrequency).unwrap().generation, 1);
    }

    #[test]
    fn test_batch_collects_failures_and_sorts() {
        let view = view_with(identity_definition(
            Axis::PurchaseFrequency,
            &[&[0.0, 0.0, 0.0], &[10.0, 10.0, 0.0]],
        ));
        let mut corrupt = history("c-0", 2, 10);
        corrupt.orders[1].order_id = corrupt.orders[0].order_id.clone();

        let histories = vec![history("c-2", 3, 20), corrupt, history("c-1", 4, 15)];
        let report = Profiler::new(view, FeatureExtractor::new(as_of()))
            .profile_histories(&histories)
            .unwrap();

        let ids: Vec<&str> = report.profiles.iter().map(|p| p.customer_id.as_str()).collect();
        assert_eq!(ids, vec!["c-1", "c-2"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].customer_id, "c-0");
        assert!(report.profile("c-2").is_some());
    }

    #[test]
    fn test_stale_scaler_aborts_batch() {
        let mut def = identity_definition(
            Axis::PurchaseFrequency,
            &[&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]],
        );
        def.generation = 1;
        def.scaler.feature_names.reverse();
        // Bypass install validation to simulate a definition that went stale
        let mut view = DefinitionView::new();
        view.insert(Axis::PurchaseFrequency, Arc::new(def));

        let err = Profiler::new(view, FeatureExtractor::new(as_of()))
            .profile_histories(&[history("c-1", 3, 10)])
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_cancelled_batch_profiles_nothing() {
        let view = view_with(identity_definition(
            Axis::PurchaseFrequency,
            &[&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]],
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Profiler::new(view, FeatureExtractor::new(as_of()))
            .with_cancellation(cancel)
            .profile_histories(&[history("c-2", 3, 10), history("c-1", 3, 10)])
            .unwrap();
        assert!(report.profiles.is_empty());
        assert_eq!(report.cancelled, vec!["c-1".to_string(), "c-2".to_string()]);
    }

    #[test]
    fn test_source_reports_unavailable_history() {
        let view = view_with(identity_definition(
            Axis::PurchaseFrequency,
            &[&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]],
        ));
        let source = InMemoryHistorySource::new(vec![history("c-1", 3, 10)]);
        let ids = vec!["c-1".to_string(), "ghost".to_string()];
        let report = Profiler::new(view, FeatureExtractor::new(as_of()))
            .profile_source(&source, &ids)
            .unwrap();
        assert_eq!(report.profiles.len(), 1);
        assert_eq!(report.failures[0].customer_id, "ghost");
        assert!(report.failures[0].reason.contains("History unavailable"));
    }

    #[test]
    fn test_discovery_on_small_population_fails_axis_only() {
        let population: Vec<CustomerHistory> =
            (0..20).map(|i| history(&format!("c-{}", i), 3, 10 + i)).collect();
        let registry = DefinitionRegistry::new();
        let report = DiscoveryJob::new(DiscoveryConfig::default(), FeatureExtractor::new(as_of()))
            .with_capabilities(StoreCapabilities::without_tickets())
            .run(&population, &registry);

        assert!(report.discovered().is_empty());
        assert!(matches!(
            report.outcome(Axis::PurchaseFrequency),
            Some(AxisOutcome::Failed(_))
        ));
        assert_eq!(report.outcome(Axis::SupportHistory), Some(&AxisOutcome::Skipped));
        assert!(registry.view().is_empty());
    }
}

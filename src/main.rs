//! SegForge: behavioral segmentation CLI
//!
//! Entrypoint that wires configuration, logging, data loading, discovery,
//! profiling and snapshot recording.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use segforge::cli::{parse_snapshot_target, Command, DataArgs, NamerKind};
use segforge::{
    load_histories, BusinessContext, Cli, CustomerHistory, DefinitionRegistry,
    DiscoveryJob, EngineConfig, FeatureExtractor, FeatureProfileNamer, JsonDefinitionStore,
    JsonFileSnapshotStore, OrdinalNamer, Profiler, SegmentNamer, SegmentationError,
    SnapshotManager, SnapshotOutcome,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config, cli.verbose);

    match cli.command {
        Command::Discover {
            ref data,
            seed,
            max_iters,
            tolerance,
            namer,
        } => run_discovery(&config, data, seed, max_iters, tolerance, namer, cli.verbose),
        Command::Profile {
            ref data,
            ref customer,
            ref output,
        } => run_profiling(&config, data, customer.as_deref(), output.as_deref(), cli.verbose),
        Command::Snapshot {
            ref data,
            ref date,
            ref snapshot_type,
        } => run_snapshots(&config, data, date.as_deref(), snapshot_type),
    }
}

/// `RUST_LOG` wins, then `--verbose`, then the configured level.
fn init_tracing(config: &EngineConfig, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(data: &DataArgs, verbose: bool) -> Result<Vec<CustomerHistory>> {
    if verbose {
        println!("Loading orders from: {}", data.orders.display());
    }
    let start = Instant::now();
    let histories = load_histories(&data.orders, data.items.as_deref(), data.tickets.as_deref())?;
    println!("✓ Data loaded: {} customers", histories.len());
    if verbose {
        println!("  Processing time: {:.2}s", start.elapsed().as_secs_f64());
    }
    Ok(histories)
}

fn run_discovery(
    config: &EngineConfig,
    data: &DataArgs,
    seed: Option<u64>,
    max_iters: Option<u64>,
    tolerance: Option<f64>,
    namer: NamerKind,
    verbose: bool,
) -> Result<()> {
    println!("=== Segment Discovery ===\n");
    let start = Instant::now();

    let mut discovery = config.discovery.clone();
    if let Some(seed) = seed {
        discovery = discovery.with_seed(seed);
    }
    if let Some(max_iters) = max_iters {
        discovery.max_iterations = max_iters;
    }
    if let Some(tolerance) = tolerance {
        discovery.tolerance = tolerance;
    }
    discovery.validate()?;

    let histories = load(data, verbose)?;
    let as_of = data.parse_as_of()?;
    let store = JsonDefinitionStore::new(&config.storage.definitions_dir)?;
    let registry = DefinitionRegistry::new();
    registry.load_from(&store)?;

    let namer: &dyn SegmentNamer = match namer {
        NamerKind::Ordinal => &OrdinalNamer,
        NamerKind::FeatureProfile => &FeatureProfileNamer,
    };

    let report = DiscoveryJob::new(discovery, FeatureExtractor::new(as_of))
        .with_capabilities(data.capabilities())
        .with_namer(namer)
        .with_store(&store)
        .run(&histories, &registry);

    println!("\n=== Axis Results ===");
    for (axis, outcome) in &report.outcomes {
        println!("{:<24} {}", axis.to_string(), outcome);
    }
    if report.rejected_customers > 0 {
        println!("\nCustomers excluded (corrupt history): {}", report.rejected_customers);
    }

    if verbose {
        for axis in report.discovered() {
            if let Some(def) = registry.current(axis) {
                println!("\n{} segments:", axis);
                for segment in &def.segments {
                    println!("  {} ({} customers)", segment.name, segment.population);
                }
            }
        }
    }

    println!("\n=== Discovery Complete ===");
    println!("Total processing time: {:.2}s", start.elapsed().as_secs_f64());
    println!("Definitions saved to: {}", store.dir().display());

    if report.discovered().is_empty() {
        bail!("No axis could be discovered");
    }
    Ok(())
}

fn profiler_for(config: &EngineConfig, data: &DataArgs, as_of: DateTime<Utc>) -> Result<Profiler> {
    let store = JsonDefinitionStore::new(&config.storage.definitions_dir)?;
    let registry = DefinitionRegistry::new();
    if registry.load_from(&store)? == 0 {
        bail!(
            "No segment definitions found in {}; run `segforge discover` first",
            store.dir().display()
        );
    }
    Ok(Profiler::new(registry.view(), FeatureExtractor::new(as_of))
        .with_capabilities(data.capabilities()))
}

fn run_profiling(
    config: &EngineConfig,
    data: &DataArgs,
    customer: Option<&str>,
    output: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    println!("=== Customer Profiling ===\n");
    let start = Instant::now();

    let profiler = profiler_for(config, data, data.parse_as_of()?)?;
    let mut histories = load(data, verbose)?;
    if let Some(id) = customer {
        histories.retain(|h| h.customer_id == id);
        if histories.is_empty() {
            bail!("Customer {} not found in {}", id, data.orders.display());
        }
    }

    let report = profiler.profile_histories(&histories)?;
    println!(
        "✓ Profiled {} customers ({} failed)",
        report.profiles.len(),
        report.failures.len()
    );

    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&report.profiles)?)?;
        println!("Profiles saved to: {}", path.display());
    } else {
        for profile in &report.profiles {
            println!("\n{}: {}", profile.customer_id, profile.archetype.interpretation);
            for (axis, p) in &profile.axes {
                println!(
                    "  {:<24} {} ({:.2}, {})",
                    axis.to_string(),
                    p.dominant_segment,
                    p.dominant_score,
                    p.strength
                );
            }
        }
    }

    for failure in &report.failures {
        println!("✗ {}: {}", failure.customer_id, failure.reason);
    }

    println!("\nTotal processing time: {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn run_snapshots(
    config: &EngineConfig,
    data: &DataArgs,
    date: Option<&str>,
    snapshot_type: &str,
) -> Result<()> {
    println!("=== Profile Snapshots ===\n");

    let as_of = data.parse_as_of()?;
    let (snapshot_date, snapshot_type) = parse_snapshot_target(date, snapshot_type, as_of)?;
    let profiler = profiler_for(config, data, as_of)?;
    let histories = load(data, false)?;
    let report = profiler.profile_histories(&histories)?;

    let manager = SnapshotManager::new(JsonFileSnapshotStore::open(&config.storage.snapshots_path)?);
    let (mut created, mut existing, mut conflicts) = (0usize, 0usize, 0usize);
    let by_id: HashMap<&str, &CustomerHistory> = histories
        .iter()
        .map(|h| (h.customer_id.as_str(), h))
        .collect();
    for profile in &report.profiles {
        let Some(history) = by_id.get(profile.customer_id.as_str()) else {
            continue;
        };
        let context = BusinessContext::from_history(profile, history, as_of);
        match manager.record(profile, context, snapshot_date, snapshot_type) {
            Ok(SnapshotOutcome::Created) => created += 1,
            Ok(SnapshotOutcome::AlreadyRecorded) => existing += 1,
            Err(SegmentationError::SnapshotConflict { .. }) => conflicts += 1,
            Err(e) => return Err(e.into()),
        }
    }

    println!("Snapshot: {} {}", snapshot_date, snapshot_type);
    println!("  Created: {}", created);
    println!("  Already recorded: {}", existing);
    println!("  Conflicts: {}", conflicts);
    println!("  Axes per profile: {}", profiler.view().len());
    println!("Snapshots saved to: {}", config.storage.snapshots_path.display());
    Ok(())
}

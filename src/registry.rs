//! Process-wide segment definitions and their persistence.
//!
//! Definitions are immutable once installed. Re-discovery installs a new
//! `Arc<SegmentDefinition>` with the next generation; readers holding the old
//! `Arc` keep a consistent scaler/segments pair until they drop it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::{error, info};

use crate::axis::Axis;
use crate::definition::SegmentDefinition;
use crate::error::{SegResult, SegmentationError};

/// A consistent set of definitions taken at one instant.
pub type DefinitionView = BTreeMap<Axis, Arc<SegmentDefinition>>;

/// Shared, read-mostly map of the current definition per axis.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    current: RwLock<HashMap<Axis, Arc<SegmentDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install a definition as the next generation for its axis.
    ///
    /// The previous definition is replaced atomically; it is never modified.
    pub fn install(&self, definition: SegmentDefinition) -> SegResult<Arc<SegmentDefinition>> {
        self.install_with(definition, |_| Ok(()))
    }

    /// Like [`install`](Self::install), but runs `persist` on the definition
    /// after its generation is assigned and before it becomes current.
    ///
    /// The write lock is held across `persist`, so concurrent installs on any
    /// axis cannot claim the same generation. If `persist` fails nothing is
    /// installed.
    pub fn install_with<F>(
        &self,
        mut definition: SegmentDefinition,
        persist: F,
    ) -> SegResult<Arc<SegmentDefinition>>
    where
        F: FnOnce(&SegmentDefinition) -> SegResult<()>,
    {
        if let Err(e) = definition.validate() {
            error!(axis = %definition.axis, error = %e, "Rejected segment definition");
            return Err(e);
        }

        let mut current = self.current.write();
        let previous = current.get(&definition.axis).map(|d| d.generation).unwrap_or(0);
        definition.generation = previous + 1;
        persist(&definition)?;

        let definition = Arc::new(definition);
        current.insert(definition.axis, Arc::clone(&definition));
        info!(
            axis = %definition.axis,
            generation = definition.generation,
            k = definition.k(),
            "Installed segment definition"
        );
        Ok(definition)
    }

    /// Install a previously persisted definition, keeping its generation.
    ///
    /// Older generations than the one already installed are ignored.
    pub fn restore(&self, definition: SegmentDefinition) -> SegResult<Arc<SegmentDefinition>> {
        definition.validate()?;
        let mut current = self.current.write();
        if let Some(existing) = current.get(&definition.axis) {
            if existing.generation >= definition.generation {
                return Ok(Arc::clone(existing));
            }
        }
        let definition = Arc::new(definition);
        current.insert(definition.axis, Arc::clone(&definition));
        Ok(definition)
    }

    pub fn current(&self, axis: Axis) -> Option<Arc<SegmentDefinition>> {
        self.current.read().get(&axis).cloned()
    }

    /// Snapshot every current definition under one read lock.
    pub fn view(&self) -> DefinitionView {
        self.current
            .read()
            .iter()
            .map(|(axis, def)| (*axis, Arc::clone(def)))
            .collect()
    }

    pub fn axes(&self) -> Vec<Axis> {
        self.view().into_keys().collect()
    }

    /// Restore every definition held by `store`.
    pub fn load_from(&self, store: &dyn DefinitionStore) -> SegResult<usize> {
        let definitions = store.load_all()?;
        let count = definitions.len();
        for definition in definitions {
            self.restore(definition)?;
        }
        info!(count, "Loaded segment definitions");
        Ok(count)
    }
}

/// Durable storage for segment definitions.
pub trait DefinitionStore: Send + Sync {
    /// Persist one definition, replacing any earlier one for the same axis.
    fn save(&self, definition: &SegmentDefinition) -> SegResult<()>;

    fn load_all(&self) -> SegResult<Vec<SegmentDefinition>>;
}

/// One pretty-printed JSON file per axis in a directory.
#[derive(Debug, Clone)]
pub struct JsonDefinitionStore {
    dir: PathBuf,
}

impl JsonDefinitionStore {
    pub fn new(dir: impl Into<PathBuf>) -> SegResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, axis: Axis) -> PathBuf {
        self.dir.join(format!("{}.json", axis))
    }
}

impl DefinitionStore for JsonDefinitionStore {
    fn save(&self, definition: &SegmentDefinition) -> SegResult<()> {
        write_json_atomic(&self.path_for(definition.axis), definition)
    }

    fn load_all(&self) -> SegResult<Vec<SegmentDefinition>> {
        let mut definitions = Vec::new();
        for axis in Axis::ALL {
            let path = self.path_for(axis);
            if !path.exists() {
                continue;
            }
            let bytes = fs::read(&path)?;
            let definition: SegmentDefinition = serde_json::from_slice(&bytes)?;
            if definition.axis != axis {
                return Err(SegmentationError::invalid_parameter(format!(
                    "{} holds a definition for {}",
                    path.display(),
                    definition.axis
                )));
            }
            definitions.push(definition);
        }
        Ok(definitions)
    }
}

/// Serialize to a temp file in the target directory, then rename over the target.
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> SegResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| SegmentationError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::test_support::identity_definition;

    fn definition(axis: Axis, k: usize) -> SegmentDefinition {
        let centers: Vec<Vec<f64>> = (0..k)
            .map(|i| {
                let mut c = vec![0.0; axis.dimension()];
                c[0] = i as f64;
                c
            })
            .collect();
        let refs: Vec<&[f64]> = centers.iter().map(|c| c.as_slice()).collect();
        identity_definition(axis, &refs)
    }

    #[test]
    fn test_install_assigns_generations() {
        let registry = DefinitionRegistry::new();
        assert!(registry.current(Axis::PurchaseFrequency).is_none());

        let first = registry.install(definition(Axis::PurchaseFrequency, 3)).unwrap();
        assert_eq!(first.generation, 1);

        let second = registry.install(definition(Axis::PurchaseFrequency, 4)).unwrap();
        assert_eq!(second.generation, 2);

        // The old Arc is untouched by the swap
        assert_eq!(first.k(), 3);
        assert_eq!(registry.current(Axis::PurchaseFrequency).unwrap().k(), 4);
    }

    #[test]
    fn test_install_rejects_invalid_definition() {
        let registry = DefinitionRegistry::new();
        let mut bad = definition(Axis::SpendingLevel, 2);
        bad.scaler.feature_names.pop();

        assert!(registry.install(bad).is_err());
        assert!(registry.current(Axis::SpendingLevel).is_none());
    }

    #[test]
    fn test_view_is_stable_across_installs() {
        let registry = DefinitionRegistry::new();
        registry.install(definition(Axis::PurchaseFrequency, 2)).unwrap();
        let view = registry.view();

        registry.install(definition(Axis::PurchaseFrequency, 5)).unwrap();
        assert_eq!(view[&Axis::PurchaseFrequency].k(), 2);
        assert_eq!(registry.view()[&Axis::PurchaseFrequency].k(), 5);
    }

    #[test]
    fn test_json_store_round_trip_keeps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDefinitionStore::new(dir.path().join("segments")).unwrap();

        let registry = DefinitionRegistry::new();
        registry.install(definition(Axis::PurchaseFrequency, 2)).unwrap();
        let installed = registry.install(definition(Axis::PurchaseFrequency, 3)).unwrap();
        store.save(&installed).unwrap();
        store.save(&registry.install(definition(Axis::ShoppingTiming, 2)).unwrap()).unwrap();

        let restored = DefinitionRegistry::new();
        assert_eq!(restored.load_from(&store).unwrap(), 2);
        let def = restored.current(Axis::PurchaseFrequency).unwrap();
        assert_eq!(def.generation, 2);
        assert_eq!(*def, *installed);

        // The next discovery continues the generation sequence
        let next = restored.install(definition(Axis::PurchaseFrequency, 4)).unwrap();
        assert_eq!(next.generation, 3);
    }

    #[test]
    fn test_persisted_generation_matches_installed_under_concurrency() {
        use std::sync::Mutex;

        let registry = DefinitionRegistry::new();
        let persisted = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for k in 2..10 {
                let (registry, persisted) = (&registry, &persisted);
                scope.spawn(move || {
                    let installed = registry
                        .install_with(definition(Axis::PurchaseFrequency, k), |def| {
                            persisted.lock().unwrap().push(def.generation);
                            Ok(())
                        })
                        .unwrap();
                    assert_eq!(installed.k(), k);
                });
            }
        });

        let mut generations = persisted.into_inner().unwrap();
        generations.sort_unstable();
        assert_eq!(generations, (1..=8).collect::<Vec<u64>>());
        assert_eq!(registry.current(Axis::PurchaseFrequency).unwrap().generation, 8);
    }

    #[test]
    fn test_failed_persist_installs_nothing() {
        let registry = DefinitionRegistry::new();
        registry.install(definition(Axis::PurchaseFrequency, 2)).unwrap();

        let err = registry
            .install_with(definition(Axis::PurchaseFrequency, 3), |_| {
                Err(SegmentationError::invalid_parameter("disk full"))
            })
            .unwrap_err();
        assert!(matches!(err, SegmentationError::InvalidParameter { .. }));

        let current = registry.current(Axis::PurchaseFrequency).unwrap();
        assert_eq!((current.generation, current.k()), (1, 2));
        let next = registry.install(definition(Axis::PurchaseFrequency, 4)).unwrap();
        assert_eq!(next.generation, 2);
    }

    #[test]
    fn test_restore_ignores_older_generations() {
        let registry = DefinitionRegistry::new();
        registry.install(definition(Axis::PurchaseFrequency, 2)).unwrap();
        registry.install(definition(Axis::PurchaseFrequency, 3)).unwrap();

        let mut stale = definition(Axis::PurchaseFrequency, 5);
        stale.generation = 1;
        let kept = registry.restore(stale).unwrap();
        assert_eq!(kept.generation, 2);
        assert_eq!(kept.k(), 3);
    }
}

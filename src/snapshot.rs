//! Point-in-time profile snapshots.
//!
//! A snapshot is an owned deep copy of a profile plus business context,
//! unique per (customer, date, type). Recording the same content twice is a
//! no-op; recording different content under an existing key is a conflict.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SegResult, SegmentationError};
use crate::history::CustomerHistory;
use crate::profile::CustomerProfile;
use crate::registry::write_json_atomic;

const RECENT_ORDER_DAYS: i64 = 90;

/// Snapshot cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl SnapshotType {
    pub const ALL: [SnapshotType; 5] = [
        SnapshotType::Daily,
        SnapshotType::Weekly,
        SnapshotType::Monthly,
        SnapshotType::Quarterly,
        SnapshotType::Yearly,
    ];

    /// How long a snapshot of this type is kept.
    pub fn retention_days(&self) -> i64 {
        match self {
            SnapshotType::Daily => 7,
            SnapshotType::Weekly => 84,
            SnapshotType::Monthly => 730,
            SnapshotType::Quarterly => 1095,
            SnapshotType::Yearly => 1826,
        }
    }

    pub fn is_expired(&self, snapshot_date: NaiveDate, today: NaiveDate) -> bool {
        (today - snapshot_date).num_days() > self.retention_days()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotType::Daily => "daily",
            SnapshotType::Weekly => "weekly",
            SnapshotType::Monthly => "monthly",
            SnapshotType::Quarterly => "quarterly",
            SnapshotType::Yearly => "yearly",
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SnapshotType {
    type Err = SegmentationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SnapshotType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                SegmentationError::invalid_parameter(format!("unknown snapshot type: {}", s))
            })
    }
}

/// Uniqueness key of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub customer_id: String,
    pub snapshot_date: NaiveDate,
    pub snapshot_type: SnapshotType,
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.customer_id, self.snapshot_date, self.snapshot_type
        )
    }
}

/// Business figures stored next to a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessContext {
    pub archetype_id: String,
    pub archetype_name: String,
    /// Supplied by an external churn model.
    pub churn_score: Option<f64>,
    /// Supplied by an external lifetime-value model.
    pub predicted_ltv: Option<f64>,
    pub total_orders: usize,
    pub orders_last_90_days: usize,
    pub total_spend: f64,
    pub tenure_days: i64,
}

impl BusinessContext {
    /// Context with only the archetype filled in.
    pub fn for_profile(profile: &CustomerProfile) -> Self {
        Self {
            archetype_id: profile.archetype.key.clone(),
            archetype_name: profile.archetype.interpretation.clone(),
            churn_score: None,
            predicted_ltv: None,
            total_orders: 0,
            orders_last_90_days: 0,
            total_spend: 0.0,
            tenure_days: 0,
        }
    }

    /// Context with order figures derived from `history` as of `as_of`.
    ///
    /// Cancelled orders and orders after `as_of` are not counted.
    pub fn from_history(
        profile: &CustomerProfile,
        history: &CustomerHistory,
        as_of: DateTime<Utc>,
    ) -> Self {
        let mut context = Self::for_profile(profile);
        let window_start = as_of - Duration::days(RECENT_ORDER_DAYS);

        let orders: Vec<_> = history
            .orders
            .iter()
            .filter(|o| !o.cancelled && o.placed_at <= as_of)
            .collect();

        context.total_orders = orders.len();
        context.orders_last_90_days = orders.iter().filter(|o| o.placed_at > window_start).count();
        context.total_spend = orders.iter().map(|o| o.total).sum();
        context.tenure_days = orders
            .iter()
            .map(|o| o.placed_at)
            .min()
            .map(|first| (as_of - first).num_days().max(0))
            .unwrap_or(0);
        context
    }

    pub fn with_churn_score(mut self, score: f64) -> Self {
        self.churn_score = Some(score);
        self
    }

    pub fn with_predicted_ltv(mut self, ltv: f64) -> Self {
        self.predicted_ltv = Some(ltv);
        self
    }
}

/// A frozen copy of a profile at a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub key: SnapshotKey,
    pub profile: CustomerProfile,
    pub context: BusinessContext,
}

/// Build a snapshot. Pure: reads no clock and touches no store.
pub fn snapshot(
    profile: &CustomerProfile,
    context: BusinessContext,
    snapshot_date: NaiveDate,
    snapshot_type: SnapshotType,
) -> ProfileSnapshot {
    ProfileSnapshot {
        key: SnapshotKey {
            customer_id: profile.customer_id.clone(),
            snapshot_date,
            snapshot_type,
        },
        profile: profile.clone(),
        context,
    }
}

/// Result of a successful record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Created,
    /// Identical content was already stored under the key.
    AlreadyRecorded,
}

/// Durable snapshot storage with per-key uniqueness.
pub trait SnapshotStore: Send + Sync {
    /// Insert unless the key exists; compare content when it does.
    ///
    /// # Errors
    /// `SnapshotConflict` if different content is stored under the key.
    fn insert(&self, snapshot: ProfileSnapshot) -> SegResult<SnapshotOutcome>;

    fn get(&self, key: &SnapshotKey) -> SegResult<Option<ProfileSnapshot>>;

    /// A customer's snapshots of one type, oldest first.
    fn history(
        &self,
        customer_id: &str,
        snapshot_type: SnapshotType,
    ) -> SegResult<Vec<ProfileSnapshot>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn insert_unique(
    map: &mut BTreeMap<SnapshotKey, ProfileSnapshot>,
    snapshot: ProfileSnapshot,
) -> SegResult<SnapshotOutcome> {
    match map.get(&snapshot.key) {
        Some(existing) if *existing == snapshot => Ok(SnapshotOutcome::AlreadyRecorded),
        Some(_) => Err(SegmentationError::SnapshotConflict {
            key: snapshot.key.to_string(),
        }),
        None => {
            map.insert(snapshot.key.clone(), snapshot);
            Ok(SnapshotOutcome::Created)
        }
    }
}

fn customer_history(
    map: &BTreeMap<SnapshotKey, ProfileSnapshot>,
    customer_id: &str,
    snapshot_type: SnapshotType,
) -> Vec<ProfileSnapshot> {
    let mut out: Vec<ProfileSnapshot> = map
        .values()
        .filter(|s| s.key.customer_id == customer_id && s.key.snapshot_type == snapshot_type)
        .cloned()
        .collect();
    out.sort_by_key(|s| s.key.snapshot_date);
    out
}

/// Snapshot store held in memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<BTreeMap<SnapshotKey, ProfileSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn insert(&self, snapshot: ProfileSnapshot) -> SegResult<SnapshotOutcome> {
        insert_unique(&mut self.snapshots.write(), snapshot)
    }

    fn get(&self, key: &SnapshotKey) -> SegResult<Option<ProfileSnapshot>> {
        Ok(self.snapshots.read().get(key).cloned())
    }

    fn history(
        &self,
        customer_id: &str,
        snapshot_type: SnapshotType,
    ) -> SegResult<Vec<ProfileSnapshot>> {
        Ok(customer_history(&self.snapshots.read(), customer_id, snapshot_type))
    }

    fn len(&self) -> usize {
        self.snapshots.read().len()
    }
}

/// Snapshot store backed by a single JSON file.
///
/// The whole file is rewritten through a temp file and rename on every new
/// snapshot, so readers never observe a partial write.
#[derive(Debug)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
    snapshots: RwLock<BTreeMap<SnapshotKey, ProfileSnapshot>>,
}

impl JsonFileSnapshotStore {
    /// Open the store at `path`, loading existing snapshots if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> SegResult<Self> {
        let path = path.into();
        let mut snapshots = BTreeMap::new();
        if path.exists() {
            let bytes = fs::read(&path)?;
            let stored: Vec<ProfileSnapshot> = serde_json::from_slice(&bytes)?;
            for snapshot in stored {
                snapshots.insert(snapshot.key.clone(), snapshot);
            }
            debug!(path = %path.display(), count = snapshots.len(), "Loaded snapshots");
        } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            snapshots: RwLock::new(snapshots),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn insert(&self, snapshot: ProfileSnapshot) -> SegResult<SnapshotOutcome> {
        let mut snapshots = self.snapshots.write();
        let key = snapshot.key.clone();
        let outcome = insert_unique(&mut snapshots, snapshot)?;
        if outcome == SnapshotOutcome::Created {
            let all: Vec<&ProfileSnapshot> = snapshots.values().collect();
            if let Err(e) = write_json_atomic(&self.path, &all) {
                snapshots.remove(&key);
                return Err(e);
            }
        }
        Ok(outcome)
    }

    fn get(&self, key: &SnapshotKey) -> SegResult<Option<ProfileSnapshot>> {
        Ok(self.snapshots.read().get(key).cloned())
    }

    fn history(
        &self,
        customer_id: &str,
        snapshot_type: SnapshotType,
    ) -> SegResult<Vec<ProfileSnapshot>> {
        Ok(customer_history(&self.snapshots.read(), customer_id, snapshot_type))
    }

    fn len(&self) -> usize {
        self.snapshots.read().len()
    }
}

/// Records snapshots through a store.
#[derive(Debug)]
pub struct SnapshotManager<S: SnapshotStore> {
    store: S,
}

impl<S: SnapshotStore> SnapshotManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Snapshot `profile` and write it unless the key is already taken.
    pub fn record(
        &self,
        profile: &CustomerProfile,
        context: BusinessContext,
        snapshot_date: NaiveDate,
        snapshot_type: SnapshotType,
    ) -> SegResult<SnapshotOutcome> {
        let snap = snapshot(profile, context, snapshot_date, snapshot_type);
        let key = snap.key.to_string();
        match self.store.insert(snap) {
            Ok(SnapshotOutcome::Created) => {
                info!(%key, "Recorded snapshot");
                Ok(SnapshotOutcome::Created)
            }
            Ok(SnapshotOutcome::AlreadyRecorded) => {
                debug!(%key, "Snapshot already recorded");
                Ok(SnapshotOutcome::AlreadyRecorded)
            }
            Err(e) => {
                warn!(%key, error = %e, "Snapshot rejected");
                Err(e)
            }
        }
    }
}

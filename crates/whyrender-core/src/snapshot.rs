//! Per-instance state snapshots and change detection.
//!
//! The store keeps the last captured snapshot for every observed instance,
//! keyed by [`ComponentKey`]. An entry holds the instance's handle, never
//! the instance, and is only reachable while the registry reports that
//! handle alive. Dead entries are purged by
//! [`SnapshotStore::cleanup_dead_references`], which also enforces the
//! memory ceiling by evicting the least recently accessed live entries.
//!
//! ```text
//! detect_changes(instance)
//!   ├── metadata (cache, built once per type)
//!   ├── capture tracked fields into a pooled map
//!   └── under the key's shard lock:
//!         ├── no prior snapshot → store, first observation
//!         └── prior snapshot    → diff, replace (old map returns to the pool)
//! ```

use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::compare::{CompareOptions, values_equal};
use crate::component::{ComponentKey, ComponentType, InstanceHandle, InstanceRegistry, TrackedComponent};
use crate::counter::ShardedCounter;
use crate::error::Result;
use crate::metadata::{MetadataPolicy, TypeMetadata, TypeMetadataCache};
use crate::pool::{FieldMap, ObjectPool, PoolStatistics, PooledDictionary};
use crate::sharded::ShardedMap;
use crate::value::FieldValue;

/// Fixed per-entry overhead added to field sizes.
const ENTRY_OVERHEAD_BYTES: usize = 128;

// =============================================================================
// Snapshots and changes
// =============================================================================

/// Tracked field values of one instance at one point in time.
pub struct OptimizedSnapshot {
    fields: PooledDictionary,
    component_type: ComponentType,
    captured_at: DateTime<Utc>,
    estimated_bytes: usize,
}

impl OptimizedSnapshot {
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Captured fields, in no particular order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    #[must_use]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }
}

impl Clone for OptimizedSnapshot {
    fn clone(&self) -> Self {
        let mut fields = self.fields.sibling();
        fields.extend(self.fields.iter().map(|(k, v)| (*k, v.clone())));
        Self {
            fields,
            component_type: self.component_type,
            captured_at: self.captured_at,
            estimated_bytes: self.estimated_bytes,
        }
    }
}

impl fmt::Debug for OptimizedSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizedSnapshot")
            .field("component", &self.component_type.name())
            .field("fields", &*self.fields)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// How a field differs between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One field-level difference.
#[derive(Debug, Clone, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub kind: ChangeKind,
    pub previous: Option<FieldValue>,
    pub current: Option<FieldValue>,
    /// The values could not be compared; reported as modified.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub comparison_failed: bool,
}

/// Result of [`SnapshotStore::detect_changes`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateChanges {
    pub changed: bool,
    pub changes: Vec<FieldChange>,
    /// No earlier snapshot existed for the instance.
    pub first_observation: bool,
}

impl StateChanges {
    /// Names of the changed fields.
    pub fn changed_fields(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.field.as_str())
    }
}

/// Field-by-field diff of `previous` against `current`, sorted by field.
#[must_use]
pub fn diff_snapshots(
    previous: &OptimizedSnapshot,
    current: &OptimizedSnapshot,
    opts: CompareOptions,
) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for (field, value) in current.fields.iter() {
        match previous.fields.get(field) {
            None => changes.push(FieldChange {
                field: (*field).to_string(),
                kind: ChangeKind::Added,
                previous: None,
                current: Some(value.clone()),
                comparison_failed: false,
            }),
            Some(old) => {
                let (equal, failed) = match values_equal(old, value, opts) {
                    Ok(equal) => (equal, false),
                    Err(err) => {
                        debug!(field = *field, error = %err, "field comparison failed; treating as modified");
                        (false, true)
                    }
                };
                if !equal {
                    changes.push(FieldChange {
                        field: (*field).to_string(),
                        kind: ChangeKind::Modified,
                        previous: Some(old.clone()),
                        current: Some(value.clone()),
                        comparison_failed: failed,
                    });
                }
            }
        }
    }
    for (field, old) in previous.fields.iter() {
        if !current.fields.contains_key(field) {
            changes.push(FieldChange {
                field: (*field).to_string(),
                kind: ChangeKind::Removed,
                previous: Some(old.clone()),
                current: None,
                comparison_failed: false,
            });
        }
    }
    changes.sort_by(|a, b| a.field.cmp(&b.field));
    changes
}

// =============================================================================
// Store
// =============================================================================

/// Snapshot store behaviour and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSettings {
    pub compare: CompareOptions,
    pub metadata: MetadataPolicy,
    /// Report the first snapshot of an instance as a change.
    pub report_first_observation: bool,
    /// Ceiling on stored snapshots.
    pub max_snapshots: usize,
    /// Ceiling on estimated snapshot bytes.
    pub max_snapshot_bytes: usize,
    /// Idle field maps kept in the pool.
    pub pool_max_idle: usize,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            compare: CompareOptions::default(),
            metadata: MetadataPolicy::default(),
            report_first_observation: true,
            max_snapshots: 10_000,
            max_snapshot_bytes: 64 * 1024 * 1024,
            pool_max_idle: 256,
        }
    }
}

struct SnapshotEntry {
    handle: InstanceHandle,
    snapshot: OptimizedSnapshot,
    stored_at: Instant,
    last_access: Instant,
    access_count: u64,
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotCleanupReport {
    pub dead_removed: usize,
    pub evicted: usize,
    pub remaining: usize,
    pub estimated_bytes: usize,
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStatistics {
    pub entries: usize,
    pub estimated_bytes: usize,
    pub stores: u64,
    pub first_observations: u64,
    pub comparisons: u64,
    pub changes_detected: u64,
    pub comparison_failures: u64,
    pub dead_removed: u64,
    pub evicted: u64,
    pub pool: PoolStatistics,
}

#[derive(Debug, Default)]
struct StoreCounters {
    stores: ShardedCounter,
    first_observations: ShardedCounter,
    comparisons: ShardedCounter,
    changes_detected: ShardedCounter,
    comparison_failures: ShardedCounter,
    dead_removed: ShardedCounter,
    evicted: ShardedCounter,
}

/// Concurrent per-instance snapshot store.
pub struct SnapshotStore {
    settings: SnapshotSettings,
    cache: Arc<TypeMetadataCache>,
    registry: Arc<InstanceRegistry>,
    pool: ObjectPool<FieldMap>,
    entries: ShardedMap<ComponentKey, SnapshotEntry>,
    counters: StoreCounters,
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("settings", &self.settings)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl SnapshotStore {
    #[must_use]
    pub fn new(
        settings: SnapshotSettings,
        cache: Arc<TypeMetadataCache>,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        Self {
            pool: ObjectPool::of_maps(settings.pool_max_idle, 8),
            settings,
            cache,
            registry,
            entries: ShardedMap::new(),
            counters: StoreCounters::default(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> SnapshotSettings {
        self.settings
    }

    /// Metadata for the instance's type, built on first use.
    pub fn metadata_for(&self, instance: &dyn TrackedComponent) -> Result<Arc<TypeMetadata>> {
        let ty = instance.component_type();
        let policy = self.settings.metadata;
        self.cache.get_or_build(ty, || {
            TypeMetadata::build(ty, instance.field_descriptors(), policy)
        })
    }

    /// Capture the instance's tracked fields without storing them.
    pub fn capture(&self, instance: &dyn TrackedComponent) -> Result<OptimizedSnapshot> {
        let metadata = self.metadata_for(instance)?;
        Ok(self.capture_with(instance, &metadata))
    }

    fn capture_with(
        &self,
        instance: &dyn TrackedComponent,
        metadata: &TypeMetadata,
    ) -> OptimizedSnapshot {
        let mut fields = self.pool.acquire();
        let mut bytes = ENTRY_OVERHEAD_BYTES;
        let max_depth = self.settings.compare.max_depth;
        for name in metadata.tracked_fields() {
            if let Some(value) = instance.read_field(name) {
                bytes += name.len() + value.estimated_size(max_depth);
                fields.insert(name, value);
            }
        }
        OptimizedSnapshot {
            fields,
            component_type: metadata.component_type(),
            captured_at: Utc::now(),
            estimated_bytes: bytes,
        }
    }

    /// Capture the instance's state, diff it against the previous
    /// snapshot, and store it as the new baseline.
    pub fn detect_changes(&self, instance: &dyn TrackedComponent) -> Result<StateChanges> {
        self.detect_changes_at(instance, Instant::now())
    }

    pub(crate) fn detect_changes_at(
        &self,
        instance: &dyn TrackedComponent,
        now: Instant,
    ) -> Result<StateChanges> {
        let key = ComponentKey::of(instance);
        if !self.registry.is_alive(key.handle) {
            debug!(
                component = instance.component_type().name(),
                handle = %key.handle,
                "instance handle is not alive; skipping state tracking"
            );
            return Ok(StateChanges::default());
        }

        let metadata = self.metadata_for(instance)?;
        let current = self.capture_with(instance, &metadata);
        let opts = self.settings.compare;
        let report_first = self.settings.report_first_observation;

        let result = self.entries.entry_with(key, |entry| match entry {
            Entry::Vacant(slot) => {
                slot.insert(SnapshotEntry {
                    handle: key.handle,
                    snapshot: current,
                    stored_at: now,
                    last_access: now,
                    access_count: 1,
                });
                StateChanges {
                    changed: report_first,
                    changes: Vec::new(),
                    first_observation: true,
                }
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                let changes = diff_snapshots(&entry.snapshot, &current, opts);
                entry.snapshot = current;
                entry.stored_at = now;
                entry.last_access = now;
                entry.access_count += 1;
                StateChanges {
                    changed: !changes.is_empty(),
                    changes,
                    first_observation: false,
                }
            }
        });

        self.counters.stores.increment();
        if result.first_observation {
            self.counters.first_observations.increment();
        } else {
            self.counters.comparisons.increment();
            if result.changed {
                self.counters.changes_detected.increment();
            }
            let failures = result.changes.iter().filter(|c| c.comparison_failed).count();
            if failures > 0 {
                self.counters.comparison_failures.add(failures as u64);
            }
        }
        Ok(result)
    }

    /// The stored snapshot for a live instance.
    pub fn get_current(&self, instance: &dyn TrackedComponent) -> Option<OptimizedSnapshot> {
        let key = ComponentKey::of(instance);
        if !self.registry.is_alive(key.handle) {
            return None;
        }
        let now = Instant::now();
        self.entries.write_with(&key, |entry| {
            entry.last_access = now;
            entry.access_count += 1;
            entry.snapshot.clone()
        })
    }

    /// Drop every snapshot held for `handle`.
    pub fn forget(&self, handle: InstanceHandle) -> usize {
        self.entries.drain_where(|key, _| key.handle == handle).len()
    }

    /// Purge entries whose instance is dead, then evict least recently
    /// accessed live entries while over either ceiling.
    pub fn cleanup_dead_references(&self) -> SnapshotCleanupReport {
        let dead_removed = self
            .entries
            .drain_where(|_, entry| !self.registry.is_alive(entry.handle))
            .len();

        let mut live = self.entries.collect_with(|key, entry| {
            (*key, entry.last_access, entry.snapshot.estimated_bytes)
        });
        let mut count = live.len();
        let mut bytes: usize = live.iter().map(|(_, _, b)| *b).sum();
        let mut evicted = 0;

        if count > self.settings.max_snapshots || bytes > self.settings.max_snapshot_bytes {
            live.sort_unstable_by_key(|(_, last_access, _)| *last_access);
            for (key, _, entry_bytes) in live {
                if count <= self.settings.max_snapshots
                    && bytes <= self.settings.max_snapshot_bytes
                {
                    break;
                }
                if self.entries.remove(&key).is_some() {
                    count -= 1;
                    bytes = bytes.saturating_sub(entry_bytes);
                    evicted += 1;
                }
            }
            warn!(
                evicted,
                remaining = count,
                estimated_bytes = bytes,
                "snapshot store over its memory ceiling; evicted live snapshots"
            );
        }

        self.counters.dead_removed.add(dead_removed as u64);
        self.counters.evicted.add(evicted as u64);
        if dead_removed > 0 {
            debug!(dead_removed, remaining = count, "purged snapshots of dead instances");
        }
        SnapshotCleanupReport {
            dead_removed,
            evicted,
            remaining: count,
            estimated_bytes: bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many times the instance's snapshot was written or read.
    #[must_use]
    pub fn access_count(&self, instance: &dyn TrackedComponent) -> Option<u64> {
        self.entries
            .read_with(&ComponentKey::of(instance), |entry| entry.access_count)
    }

    /// When the instance's current snapshot was stored.
    #[must_use]
    pub fn stored_at(&self, instance: &dyn TrackedComponent) -> Option<Instant> {
        self.entries
            .read_with(&ComponentKey::of(instance), |entry| entry.stored_at)
    }

    #[must_use]
    pub fn statistics(&self) -> SnapshotStatistics {
        let c = &self.counters;
        SnapshotStatistics {
            entries: self.entries.len(),
            estimated_bytes: self
                .entries
                .collect_with(|_, entry| entry.snapshot.estimated_bytes)
                .into_iter()
                .sum(),
            stores: c.stores.get(),
            first_observations: c.first_observations.get(),
            comparisons: c.comparisons.get(),
            changes_detected: c.changes_detected.get(),
            comparison_failures: c.comparison_failures.get(),
            dead_removed: c.dead_removed.get(),
            evicted: c.evicted.get(),
            pool: self.pool.statistics(),
        }
    }

    pub fn reset_statistics(&self) {
        let c = &self.counters;
        for counter in [
            &c.stores,
            &c.first_observations,
            &c.comparisons,
            &c.changes_detected,
            &c.comparison_failures,
            &c.dead_removed,
            &c.evicted,
        ] {
            counter.reset();
        }
    }
}

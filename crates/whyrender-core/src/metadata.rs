//! Per-type field metadata and its cache.
//!
//! [`TypeMetadata`] classifies a component type's registered fields into
//! tracked and untracked sets. It is built once per type and shared as an
//! `Arc` afterwards. [`TypeMetadataCache`] deduplicates concurrent builds
//! for the same type: the first caller to miss becomes the leader and runs
//! the factory, later callers wait on the leader's in-flight slot and get
//! the same result. A failed build is handed to the waiters but never
//! cached, so the next call retries.
//!
//! ```text
//! get_or_build(T)
//!   ├── committed hit ──────────────► touch last_access, hits += 1
//!   └── miss (misses += 1)
//!         ├── in-flight slot exists ─► wait for leader's result
//!         └── become leader ─────────► re-check, build, commit, clear slot, publish
//! ```
//!
//! Entries leave the cache only through [`TypeMetadataCache::invalidate`]
//! or [`TypeMetadataCache::run_maintenance`], which first drops entries
//! older than `max_age` and then evicts the least recently accessed
//! entries until at most `max_entries` remain.

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::component::{ComponentType, FieldDescriptor, FieldMode, FieldType};
use crate::counter::ShardedCounter;
use crate::error::{Error, Result};
use crate::sharded::ShardedMap;

// =============================================================================
// Type metadata
// =============================================================================

/// How a registered field is treated by snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldClass {
    /// Simple value type, tracked without opt-in.
    AutoTracked,
    /// Opted in with [`FieldDescriptor::tracked`].
    ExplicitlyTracked,
    /// Opted out with [`FieldDescriptor::ignored`].
    Ignored,
    /// Complex type without opt-in, or auto-tracking disabled.
    Untracked,
}

impl FieldClass {
    #[must_use]
    pub fn is_tracked(self) -> bool {
        matches!(self, Self::AutoTracked | Self::ExplicitlyTracked)
    }
}

/// One classified field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedField {
    pub name: &'static str,
    pub field_type: FieldType,
    pub class: FieldClass,
}

/// Rules applied while classifying fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataPolicy {
    /// Track simple-typed fields that carry no explicit marker.
    pub auto_track_simple_fields: bool,
    /// Cap on tracked fields per type; later fields become untracked.
    pub max_tracked_fields: usize,
}

impl Default for MetadataPolicy {
    fn default() -> Self {
        Self {
            auto_track_simple_fields: true,
            max_tracked_fields: 64,
        }
    }
}

/// Immutable field classification for one component type.
#[derive(Debug, Clone, Serialize)]
pub struct TypeMetadata {
    #[serde(skip)]
    component_type: ComponentType,
    type_name: String,
    fields: Vec<ClassifiedField>,
    tracked_field_count: usize,
    skipped_field_count: usize,
    created_at: DateTime<Utc>,
}

impl TypeMetadata {
    /// Classify `descriptors` for `component_type`.
    ///
    /// Generated and internal fields are skipped before classification.
    /// Empty or duplicate field names fail the build.
    pub fn build(
        component_type: ComponentType,
        descriptors: &[FieldDescriptor],
        policy: MetadataPolicy,
    ) -> Result<Self> {
        let mut seen = HashSet::with_capacity(descriptors.len());
        let mut fields = Vec::with_capacity(descriptors.len());
        let mut skipped = 0;
        let mut tracked = 0;
        let mut truncated = false;

        for descriptor in descriptors {
            if descriptor.name.is_empty() {
                return Err(Error::metadata(
                    component_type.name(),
                    "field descriptor with empty name",
                ));
            }
            if !seen.insert(descriptor.name) {
                return Err(Error::metadata(
                    component_type.name(),
                    format!("duplicate field descriptor {:?}", descriptor.name),
                ));
            }
            if descriptor.generated || descriptor.internal {
                skipped += 1;
                continue;
            }

            let mut class = match descriptor.mode {
                FieldMode::Ignore => FieldClass::Ignored,
                FieldMode::Track => FieldClass::ExplicitlyTracked,
                FieldMode::Auto
                    if policy.auto_track_simple_fields && descriptor.field_type.is_simple() =>
                {
                    FieldClass::AutoTracked
                }
                FieldMode::Auto => FieldClass::Untracked,
            };
            if class.is_tracked() {
                if tracked < policy.max_tracked_fields {
                    tracked += 1;
                } else {
                    class = FieldClass::Untracked;
                    truncated = true;
                }
            }
            fields.push(ClassifiedField {
                name: descriptor.name,
                field_type: descriptor.field_type,
                class,
            });
        }

        if truncated {
            warn!(
                type_name = component_type.name(),
                limit = policy.max_tracked_fields,
                "tracked field limit reached; remaining fields are untracked"
            );
        }

        Ok(Self {
            component_type,
            type_name: component_type.full_name(),
            fields,
            tracked_field_count: tracked,
            skipped_field_count: skipped,
            created_at: Utc::now(),
        })
    }

    #[must_use]
    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    /// All classified (non-skipped) fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[ClassifiedField] {
        &self.fields
    }

    /// Names of tracked fields in declaration order.
    pub fn tracked_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields
            .iter()
            .filter(|f| f.class.is_tracked())
            .map(|f| f.name)
    }

    #[must_use]
    pub fn class_of(&self, name: &str) -> Option<FieldClass> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.class)
    }

    #[must_use]
    pub fn tracked_field_count(&self) -> usize {
        self.tracked_field_count
    }

    #[must_use]
    pub fn skipped_field_count(&self) -> usize {
        self.skipped_field_count
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Approximate retained size in bytes.
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.type_name.len()
            + self.fields.len() * std::mem::size_of::<ClassifiedField>()
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Cache limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_age: Duration,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_entries: 1_000,
        }
    }
}

/// Committed cache entry.
#[derive(Debug)]
pub struct CacheEntry {
    metadata: Arc<TypeMetadata>,
    created_at: Instant,
    /// Nanoseconds since the cache epoch.
    last_access: AtomicU64,
    estimated_bytes: usize,
}

impl CacheEntry {
    #[must_use]
    pub fn metadata(&self) -> &Arc<TypeMetadata> {
        &self.metadata
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }
}

/// What to drop in [`TypeMetadataCache::invalidate`].
#[derive(Debug, Clone, Copy)]
pub enum Invalidation<'a> {
    All,
    Types(&'a [ComponentType]),
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMaintenanceReport {
    pub expired: usize,
    pub evicted: usize,
    pub remaining: usize,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub entries: usize,
    pub in_flight: usize,
    pub estimated_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub build_failures: u64,
    pub expired: u64,
    pub evicted: u64,
    pub invalidated: u64,
    pub maintenance_runs: u64,
}

impl CacheStatistics {
    /// Hit rate in `[0.0, 1.0]`; 0.0 before any lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: ShardedCounter,
    misses: ShardedCounter,
    builds: ShardedCounter,
    build_failures: ShardedCounter,
    expired: ShardedCounter,
    evicted: ShardedCounter,
    invalidated: ShardedCounter,
    maintenance_runs: ShardedCounter,
}

type BuildOutcome = std::result::Result<Arc<TypeMetadata>, Error>;

/// Rendezvous point for callers waiting on one build.
#[derive(Debug, Default)]
struct InFlight {
    outcome: Mutex<Option<BuildOutcome>>,
    ready: Condvar,
}

impl InFlight {
    fn publish(&self, outcome: BuildOutcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self) -> BuildOutcome {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Clears the in-flight slot and wakes waiters even if the factory panics.
struct Leader<'a> {
    cache: &'a TypeMetadataCache,
    type_id: TypeId,
    type_name: &'static str,
    flight: Arc<InFlight>,
    published: bool,
}

impl Leader<'_> {
    fn finish(mut self, outcome: BuildOutcome) -> BuildOutcome {
        self.clear_and_publish(outcome.clone());
        self.published = true;
        outcome
    }

    fn clear_and_publish(&self, outcome: BuildOutcome) {
        self.cache
            .in_flight
            .remove_if(&self.type_id, |slot| Arc::ptr_eq(slot, &self.flight));
        self.flight.publish(outcome);
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.cache.counters.build_failures.increment();
            self.clear_and_publish(Err(Error::metadata(
                self.type_name,
                "metadata factory panicked",
            )));
        }
    }
}

/// Concurrent per-type metadata cache with singleflight builds.
#[derive(Debug)]
pub struct TypeMetadataCache {
    settings: CacheSettings,
    entries: ShardedMap<TypeId, Arc<CacheEntry>>,
    in_flight: ShardedMap<TypeId, Arc<InFlight>>,
    epoch: Instant,
    counters: CacheCounters,
}

impl TypeMetadataCache {
    #[must_use]
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: ShardedMap::new(),
            in_flight: ShardedMap::new(),
            epoch: Instant::now(),
            counters: CacheCounters::default(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    /// Return cached metadata for `ty`, building it with `factory` on a
    /// miss. Concurrent misses for one type run `factory` once.
    pub fn get_or_build<F>(&self, ty: ComponentType, factory: F) -> Result<Arc<TypeMetadata>>
    where
        F: FnOnce() -> Result<TypeMetadata>,
    {
        self.get_or_build_at(ty, Instant::now(), factory)
    }

    pub(crate) fn get_or_build_at<F>(
        &self,
        ty: ComponentType,
        now: Instant,
        factory: F,
    ) -> Result<Arc<TypeMetadata>>
    where
        F: FnOnce() -> Result<TypeMetadata>,
    {
        let type_id = ty.id();
        if let Some(entry) = self.entries.get(&type_id) {
            self.touch(&entry, now);
            self.counters.hits.increment();
            return Ok(Arc::clone(&entry.metadata));
        }
        self.counters.misses.increment();

        let (flight, is_leader) = self
            .in_flight
            .get_or_insert_with(type_id, || Arc::new(InFlight::default()));
        if !is_leader {
            return flight.wait();
        }

        let leader = Leader {
            cache: self,
            type_id,
            type_name: ty.name(),
            flight,
            published: false,
        };

        // A previous leader may have committed between our lookup and
        // claiming the slot; it always commits before clearing its slot.
        if let Some(entry) = self.entries.get(&type_id) {
            self.touch(&entry, now);
            return leader.finish(Ok(Arc::clone(&entry.metadata)));
        }

        self.counters.builds.increment();
        let outcome = match factory() {
            Ok(metadata) => {
                let metadata = Arc::new(metadata);
                let entry = Arc::new(CacheEntry {
                    estimated_bytes: std::mem::size_of::<CacheEntry>() + metadata.estimated_bytes(),
                    metadata: Arc::clone(&metadata),
                    created_at: now,
                    last_access: AtomicU64::new(self.offset(now)),
                });
                self.entries.insert(type_id, entry);
                debug!(
                    type_name = ty.name(),
                    tracked_fields = metadata.tracked_field_count(),
                    "built type metadata"
                );
                Ok(metadata)
            }
            Err(err) => {
                self.counters.build_failures.increment();
                warn!(type_name = ty.name(), error = %err, "type metadata build failed");
                Err(err)
            }
        };
        leader.finish(outcome)
    }

    /// Committed metadata for `ty`, without building, touching, or
    /// counting a hit or miss.
    #[must_use]
    pub fn peek(&self, ty: ComponentType) -> Option<Arc<TypeMetadata>> {
        self.entries
            .read_with(&ty.id(), |entry| Arc::clone(&entry.metadata))
    }

    /// Drop committed entries. Returns how many were removed.
    ///
    /// A build already in flight still commits its result.
    pub fn invalidate(&self, scope: Invalidation<'_>) -> usize {
        let removed = match scope {
            Invalidation::All => self.entries.clear(),
            Invalidation::Types(types) => types
                .iter()
                .filter(|ty| self.entries.remove(&ty.id()).is_some())
                .count(),
        };
        self.counters.invalidated.add(removed as u64);
        removed
    }

    /// Age-based then size-based eviction.
    pub fn run_maintenance(&self) -> CacheMaintenanceReport {
        self.run_maintenance_at(Instant::now())
    }

    pub(crate) fn run_maintenance_at(&self, now: Instant) -> CacheMaintenanceReport {
        let max_age = self.settings.max_age;
        let expired = self
            .entries
            .drain_where(|_, entry| now.saturating_duration_since(entry.created_at) > max_age)
            .len();

        let mut evicted = 0;
        let len = self.entries.len();
        if len > self.settings.max_entries {
            let mut by_access = self.entries.collect_with(|id, entry| {
                (*id, entry.last_access.load(Ordering::Relaxed))
            });
            by_access.sort_unstable_by_key(|(_, last_access)| *last_access);
            let excess = len - self.settings.max_entries;
            for (id, _) in by_access.into_iter().take(excess) {
                if self.entries.remove(&id).is_some() {
                    evicted += 1;
                }
            }
        }

        self.counters.expired.add(expired as u64);
        self.counters.evicted.add(evicted as u64);
        self.counters.maintenance_runs.increment();

        let report = CacheMaintenanceReport {
            expired,
            evicted,
            remaining: self.entries.len(),
        };
        if expired > 0 || evicted > 0 {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = report.remaining,
                "type metadata cache maintenance"
            );
        }
        report
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn snapshot_statistics(&self) -> CacheStatistics {
        let c = &self.counters;
        CacheStatistics {
            entries: self.entries.len(),
            in_flight: self.in_flight.len(),
            estimated_bytes: self
                .entries
                .collect_with(|_, entry| entry.estimated_bytes)
                .into_iter()
                .sum(),
            hits: c.hits.get(),
            misses: c.misses.get(),
            builds: c.builds.get(),
            build_failures: c.build_failures.get(),
            expired: c.expired.get(),
            evicted: c.evicted.get(),
            invalidated: c.invalidated.get(),
            maintenance_runs: c.maintenance_runs.get(),
        }
    }

    pub fn reset_statistics(&self) {
        let c = &self.counters;
        for counter in [
            &c.hits,
            &c.misses,
            &c.builds,
            &c.build_failures,
            &c.expired,
            &c.evicted,
            &c.invalidated,
            &c.maintenance_runs,
        ] {
            counter.reset();
        }
    }

    fn offset(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn touch(&self, entry: &CacheEntry, now: Instant) {
        entry
            .last_access
            .fetch_max(self.offset(now), Ordering::Relaxed);
    }
}

impl Default for TypeMetadataCache {
    fn default() -> Self {
        Self::new(CacheSettings::default())
    }
}

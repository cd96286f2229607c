//! Render duration measurement and per-type aggregates.

use std::any::TypeId;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::classifier::RenderTrigger;
use crate::component::{ComponentKey, ComponentType, InstanceHandle, InstanceRegistry, TrackedComponent};
use crate::sharded::ShardedMap;

/// Running duration aggregate for one component type, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub component: String,
    pub count: u64,
    pub total_ms: f64,
    pub max_ms: f64,
    pub min_ms: f64,
    pub last_ms: f64,
}

impl PerformanceStats {
    fn new(component: ComponentType) -> Self {
        Self {
            component: component.name().to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, ms: f64) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
        self.last_ms = ms;
    }

    #[must_use]
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

type PendingKey = (ComponentKey, RenderTrigger);

/// Measures render durations between `start` and `stop_and_get_duration`.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    pending: ShardedMap<PendingKey, (Instant, ComponentType)>,
    stats: ShardedMap<TypeId, PerformanceStats>,
}

impl PerformanceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a render. A second start for the same instance
    /// and trigger restarts the measurement.
    pub fn start(&self, instance: &dyn TrackedComponent, trigger: RenderTrigger) {
        self.start_at(instance, trigger, Instant::now());
    }

    pub(crate) fn start_at(&self, instance: &dyn TrackedComponent, trigger: RenderTrigger, now: Instant) {
        self.pending.insert(
            (ComponentKey::of(instance), trigger),
            (now, instance.component_type()),
        );
    }

    /// Elapsed milliseconds since the matching `start`, folded into the
    /// type's aggregate. `None` without a matching start.
    pub fn stop_and_get_duration(
        &self,
        instance: &dyn TrackedComponent,
        trigger: RenderTrigger,
    ) -> Option<f64> {
        self.stop_at(instance, trigger, Instant::now())
    }

    pub(crate) fn stop_at(
        &self,
        instance: &dyn TrackedComponent,
        trigger: RenderTrigger,
        now: Instant,
    ) -> Option<f64> {
        let (started, component_type) = self
            .pending
            .remove(&(ComponentKey::of(instance), trigger))?;
        let ms = now.saturating_duration_since(started).as_secs_f64() * 1_000.0;
        self.stats.upsert_with(
            component_type.id(),
            || PerformanceStats::new(component_type),
            |stats| stats.record(ms),
        );
        Some(ms)
    }

    /// Whether a measurement is pending for this instance and trigger.
    #[must_use]
    pub fn is_pending(&self, instance: &dyn TrackedComponent, trigger: RenderTrigger) -> bool {
        self.pending
            .contains_key(&(ComponentKey::of(instance), trigger))
    }

    #[must_use]
    pub fn stats_for(&self, component_type: ComponentType) -> Option<PerformanceStats> {
        self.stats.get(&component_type.id())
    }

    /// Aggregates for every measured type, slowest average first.
    #[must_use]
    pub fn summaries(&self) -> Vec<PerformanceStats> {
        let mut all = self.stats.collect_with(|_, stats| stats.clone());
        all.sort_by(|a, b| b.average_ms().total_cmp(&a.average_ms()));
        all
    }

    /// Drop pending starts older than `max_age` and those of dead
    /// instances. Returns how many were dropped.
    pub fn cleanup_pending(&self, registry: &InstanceRegistry, max_age: Duration) -> usize {
        self.cleanup_pending_at(registry, max_age, Instant::now())
    }

    pub(crate) fn cleanup_pending_at(
        &self,
        registry: &InstanceRegistry,
        max_age: Duration,
        now: Instant,
    ) -> usize {
        let removed = self
            .pending
            .drain_where(|(key, _), (started, _)| {
                !registry.is_alive(key.handle) || now.saturating_duration_since(*started) > max_age
            })
            .len();
        if removed > 0 {
            debug!(removed, "dropped abandoned render measurements");
        }
        removed
    }

    pub fn forget(&self, handle: InstanceHandle) {
        self.pending.retain(|(key, _), _| key.handle != handle);
    }

    /// Clear every aggregate.
    pub fn reset(&self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{FieldDescriptor, InstanceLease};
    use crate::value::FieldValue;
    use std::sync::Arc;

    struct Slow {
        lease: InstanceLease,
    }

    impl TrackedComponent for Slow {
        fn component_type(&self) -> ComponentType {
            ComponentType::of::<Self>()
        }

        fn instance_handle(&self) -> InstanceHandle {
            self.lease.handle()
        }

        fn field_descriptors(&self) -> &'static [FieldDescriptor] {
            &[]
        }

        fn read_field(&self, _name: &str) -> Option<FieldValue> {
            None
        }
    }

    fn slow(registry: &Arc<InstanceRegistry>) -> Slow {
        Slow {
            lease: registry.lease(),
        }
    }

    #[test]
    fn stop_without_start_is_none() {
        let registry = Arc::new(InstanceRegistry::new());
        let tracker = PerformanceTracker::new();
        assert!(tracker
            .stop_and_get_duration(&slow(&registry), RenderTrigger::AfterRender)
            .is_none());
    }

    #[test]
    fn durations_fold_into_type_aggregate() {
        let registry = Arc::new(InstanceRegistry::new());
        let tracker = PerformanceTracker::new();
        let a = slow(&registry);
        let b = slow(&registry);
        let t0 = Instant::now();

        tracker.start_at(&a, RenderTrigger::AfterRender, t0);
        tracker.start_at(&b, RenderTrigger::AfterRender, t0);
        let da = tracker
            .stop_at(&a, RenderTrigger::AfterRender, t0 + Duration::from_millis(4))
            .unwrap();
        let db = tracker
            .stop_at(&b, RenderTrigger::AfterRender, t0 + Duration::from_millis(10))
            .unwrap();
        assert!((da - 4.0).abs() < 1e-6);
        assert!((db - 10.0).abs() < 1e-6);

        let stats = tracker.stats_for(a.component_type()).unwrap();
        assert_eq!(stats.component, "Slow");
        assert_eq!(stats.count, 2);
        assert!((stats.min_ms - 4.0).abs() < 1e-6);
        assert!((stats.max_ms - 10.0).abs() < 1e-6);
        assert!((stats.last_ms - 10.0).abs() < 1e-6);
        assert!((stats.average_ms() - 7.0).abs() < 1e-6);
        assert_eq!(tracker.summaries().len(), 1);
    }

    #[test]
    fn stop_clears_the_start_marker() {
        let registry = Arc::new(InstanceRegistry::new());
        let tracker = PerformanceTracker::new();
        let a = slow(&registry);
        tracker.start(&a, RenderTrigger::ParametersSet);
        assert!(tracker.is_pending(&a, RenderTrigger::ParametersSet));
        assert!(!tracker.is_pending(&a, RenderTrigger::AfterRender));
        assert!(tracker.stop_and_get_duration(&a, RenderTrigger::ParametersSet).is_some());
        assert!(tracker.stop_and_get_duration(&a, RenderTrigger::ParametersSet).is_none());
    }

    #[test]
    fn abandoned_and_dead_measurements_are_dropped() {
        let registry = Arc::new(InstanceRegistry::new());
        let tracker = PerformanceTracker::new();
        let old = slow(&registry);
        let dead = slow(&registry);
        let fresh = slow(&registry);
        let t0 = Instant::now();
        tracker.start_at(&old, RenderTrigger::AfterRender, t0);
        tracker.start_at(&dead, RenderTrigger::AfterRender, t0 + Duration::from_secs(9));
        tracker.start_at(&fresh, RenderTrigger::AfterRender, t0 + Duration::from_secs(9));
        registry.release(dead.instance_handle());

        let removed =
            tracker.cleanup_pending_at(&registry, Duration::from_secs(5), t0 + Duration::from_secs(10));
        assert_eq!(removed, 2);
        assert!(tracker.is_pending(&fresh, RenderTrigger::AfterRender));
    }
}

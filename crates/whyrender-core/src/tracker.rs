//! The render tracker: filters, detectors, event assembly, dispatch.
//!
//! ```text
//! track(instance, trigger, first_render)
//!   ├── disabled / filtered out ────────► return (no metadata, no snapshot)
//!   ├── parameters     (supplied or detector)   ─┐
//!   ├── baseline snapshot on first render        │ each under its own
//!   ├── classifier     (parameters / state diff) │ error + panic boundary
//!   ├── frequency      (rate over window)        │
//!   ├── performance    (pending duration)        │
//!   ├── session id     (provider)               ─┘
//!   └── RenderEvent ──► every sink (failures counted, never propagated)
//! ```
//!
//! A tracker is constructed explicitly and owns its stores, so tests and
//! hosts can run any number of isolated trackers. Background maintenance
//! starts with [`RenderTracker::start_maintenance`] and stops with
//! [`RenderTracker::shutdown`] or on drop.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use crate::classifier::{RenderTrigger, RenderVerdict, UnnecessaryRenderClassifier};
use crate::component::{InstanceHandle, InstanceLease, InstanceRegistry, TrackedComponent};
use crate::config::TrackerConfig;
use crate::counter::ShardedCounter;
use crate::error::Result;
use crate::event::RenderEvent;
use crate::filter::ComponentFilter;
use crate::frequency::{FrequencyStatistics, RenderFrequencyTracker};
use crate::maintenance::{
    MaintenanceHandle, MaintenanceRunner, MaintenanceStatistics, MaintenanceTask, spawn_maintenance,
};
use crate::metadata::{CacheStatistics, TypeMetadataCache};
use crate::parameters::{
    HistoryParameterDetector, ParameterChangeDetector, ParameterChanges, ParameterComparer,
    ValueParameterComparer,
};
use crate::performance::{PerformanceStats, PerformanceTracker};
use crate::sink::RenderEventSink;
use crate::snapshot::{SnapshotStatistics, SnapshotStore};

/// Supplies the session id stamped on each event.
pub trait SessionIdProvider: Send + Sync {
    fn session_id(&self) -> Option<String>;
}

impl<F> SessionIdProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn session_id(&self) -> Option<String> {
        self()
    }
}

/// Per-call inputs to [`RenderTracker::track_with`].
#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    pub first_render: Option<bool>,
    /// Changes computed by the host. When absent, the configured
    /// parameter detector (if any) runs for `parameters-set`.
    pub parameter_changes: Option<ParameterChanges>,
}

impl TrackOptions {
    #[must_use]
    pub fn first_render(mut self, first_render: bool) -> Self {
        self.first_render = Some(first_render);
        self
    }

    #[must_use]
    pub fn parameter_changes(mut self, changes: ParameterChanges) -> Self {
        self.parameter_changes = Some(changes);
        self
    }
}

/// Tracker-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerCounters {
    pub renders_tracked: u64,
    pub renders_filtered: u64,
    /// Events accepted by at least one sink.
    pub events_emitted: u64,
    /// Events every configured sink rejected.
    pub events_undelivered: u64,
    pub events_suppressed: u64,
    pub unnecessary_renders: u64,
    pub frequent_renders: u64,
    pub detector_failures: u64,
    pub sink_failures: u64,
    pub panics_caught: u64,
}

/// One serialisable view of every component's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatistics {
    pub tracker: TrackerCounters,
    pub live_instances: usize,
    pub cache: CacheStatistics,
    pub snapshots: SnapshotStatistics,
    pub frequency: FrequencyStatistics,
    pub performance: Vec<PerformanceStats>,
    pub maintenance: MaintenanceStatistics,
}

#[derive(Debug, Default)]
struct Counters {
    tracked: ShardedCounter,
    filtered: ShardedCounter,
    emitted: ShardedCounter,
    undelivered: ShardedCounter,
    suppressed: ShardedCounter,
    unnecessary: ShardedCounter,
    frequent: ShardedCounter,
    detector_failures: ShardedCounter,
    sink_failures: ShardedCounter,
    panics: ShardedCounter,
}

impl Counters {
    fn all(&self) -> [&ShardedCounter; 10] {
        [
            &self.tracked,
            &self.filtered,
            &self.emitted,
            &self.undelivered,
            &self.suppressed,
            &self.unnecessary,
            &self.frequent,
            &self.detector_failures,
            &self.sink_failures,
            &self.panics,
        ]
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`RenderTracker`] with its collaborators.
pub struct RenderTrackerBuilder {
    config: TrackerConfig,
    registry: Option<Arc<InstanceRegistry>>,
    sinks: Vec<Arc<dyn RenderEventSink>>,
    comparer: Option<Arc<dyn ParameterComparer>>,
    detector: Option<Arc<dyn ParameterChangeDetector>>,
    detect_parameters: bool,
    sessions: Option<Arc<dyn SessionIdProvider>>,
}

impl fmt::Debug for RenderTrackerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sinks: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("RenderTrackerBuilder")
            .field("config", &self.config)
            .field("sinks", &sinks)
            .finish_non_exhaustive()
    }
}

impl RenderTrackerBuilder {
    /// Share an instance registry with the host.
    #[must_use]
    pub fn registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn RenderEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Meaningful-change predicate for parameter changes. Defaults to
    /// value equality under the snapshot comparison options.
    #[must_use]
    pub fn comparer(mut self, comparer: Arc<dyn ParameterComparer>) -> Self {
        self.comparer = Some(comparer);
        self
    }

    /// Source of parameter changes when the host supplies none. Defaults to
    /// a [`HistoryParameterDetector`].
    #[must_use]
    pub fn parameter_detector(mut self, detector: Arc<dyn ParameterChangeDetector>) -> Self {
        self.detector = Some(detector);
        self.detect_parameters = true;
        self
    }

    /// No detector: a parameters-set render without host-supplied changes
    /// is left unclassified.
    #[must_use]
    pub fn without_parameter_detector(mut self) -> Self {
        self.detector = None;
        self.detect_parameters = false;
        self
    }

    /// Use the built-in [`HistoryParameterDetector`].
    #[must_use]
    pub fn history_parameter_detector(self) -> Self {
        let opts = self.config.snapshots.compare_options();
        self.parameter_detector(Arc::new(HistoryParameterDetector::new(opts)))
    }

    #[must_use]
    pub fn session_provider(mut self, provider: Arc<dyn SessionIdProvider>) -> Self {
        self.sessions = Some(provider);
        self
    }

    /// Validate the config and build the tracker.
    pub fn build(self) -> Result<RenderTracker> {
        let config = self.config;
        config.validate()?;
        let filter = ComponentFilter::new(&config.filter)?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InstanceRegistry::new()));
        let cache = Arc::new(TypeMetadataCache::new(config.cache.to_settings()));
        let snapshots = Arc::new(SnapshotStore::new(
            config.snapshots.to_settings(),
            Arc::clone(&cache),
            Arc::clone(&registry),
        ));
        let comparer = self.comparer.unwrap_or_else(|| {
            Arc::new(ValueParameterComparer::new(config.snapshots.compare_options()))
        });
        let classifier = UnnecessaryRenderClassifier::new(Arc::clone(&snapshots), comparer);
        let frequency = Arc::new(RenderFrequencyTracker::new(config.frequency.to_settings()));
        let performance = Arc::new(PerformanceTracker::new());
        let detector = match self.detector {
            Some(detector) => Some(detector),
            None if self.detect_parameters => Some(Arc::new(HistoryParameterDetector::new(
                config.snapshots.compare_options(),
            )) as Arc<dyn ParameterChangeDetector>),
            None => None,
        };

        let maintenance = Arc::new(MaintenanceRunner::new(maintenance_tasks(
            &config,
            &registry,
            &cache,
            &snapshots,
            &frequency,
            &performance,
            detector.as_ref(),
        )));

        debug!(
            enabled = config.enabled,
            sinks = self.sinks.len(),
            parameter_detector = detector.is_some(),
            "render tracker constructed"
        );

        Ok(RenderTracker {
            config,
            registry,
            cache,
            snapshots,
            classifier,
            frequency,
            performance,
            filter,
            detector,
            sessions: self.sessions,
            sinks: self.sinks,
            maintenance,
            background: Mutex::new(None),
            counters: Counters::default(),
        })
    }
}

fn maintenance_tasks(
    config: &TrackerConfig,
    registry: &Arc<InstanceRegistry>,
    cache: &Arc<TypeMetadataCache>,
    snapshots: &Arc<SnapshotStore>,
    frequency: &Arc<RenderFrequencyTracker>,
    performance: &Arc<PerformanceTracker>,
    detector: Option<&Arc<dyn ParameterChangeDetector>>,
) -> Vec<Arc<dyn MaintenanceTask>> {
    let mut tasks: Vec<Arc<dyn MaintenanceTask>> = Vec::new();

    let cache = Arc::clone(cache);
    tasks.push(Arc::new(("type-metadata-cache", move || -> Result<usize> {
        let report = cache.run_maintenance();
        Ok(report.expired + report.evicted)
    })));

    let store = Arc::clone(snapshots);
    tasks.push(Arc::new(("snapshot-store", move || -> Result<usize> {
        let report = store.cleanup_dead_references();
        Ok(report.dead_removed + report.evicted)
    })));

    let freq = Arc::clone(frequency);
    let freq_registry = Arc::clone(registry);
    tasks.push(Arc::new(("render-frequency", move || -> Result<usize> {
        Ok(freq.purge_dead(&freq_registry) + freq.cleanup_stale())
    })));

    let perf = Arc::clone(performance);
    let perf_registry = Arc::clone(registry);
    let max_pending = config.cache.max_pending_measurement();
    tasks.push(Arc::new(("performance", move || -> Result<usize> {
        Ok(perf.cleanup_pending(&perf_registry, max_pending))
    })));

    if let Some(detector) = detector {
        let detector = Arc::clone(detector);
        let det_registry = Arc::clone(registry);
        tasks.push(Arc::new(("parameter-history", move || -> Result<usize> {
            Ok(detector.purge_dead(&det_registry))
        })));
    }
    tasks
}

// =============================================================================
// Tracker
// =============================================================================

/// Answers "why did this component render?" for every tracked render.
pub struct RenderTracker {
    config: TrackerConfig,
    registry: Arc<InstanceRegistry>,
    cache: Arc<TypeMetadataCache>,
    snapshots: Arc<SnapshotStore>,
    classifier: UnnecessaryRenderClassifier,
    frequency: Arc<RenderFrequencyTracker>,
    performance: Arc<PerformanceTracker>,
    filter: ComponentFilter,
    detector: Option<Arc<dyn ParameterChangeDetector>>,
    sessions: Option<Arc<dyn SessionIdProvider>>,
    sinks: Vec<Arc<dyn RenderEventSink>>,
    maintenance: Arc<MaintenanceRunner>,
    background: Mutex<Option<MaintenanceHandle>>,
    counters: Counters,
}

impl fmt::Debug for RenderTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTracker")
            .field("enabled", &self.config.enabled)
            .field("snapshots", &self.snapshots)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl RenderTracker {
    #[must_use]
    pub fn builder(config: TrackerConfig) -> RenderTrackerBuilder {
        RenderTrackerBuilder {
            config,
            registry: None,
            sinks: Vec::new(),
            comparer: None,
            detector: None,
            detect_parameters: true,
            sessions: None,
        }
    }

    /// Tracker with the given sinks and default collaborators.
    pub fn new(config: TrackerConfig, sinks: Vec<Arc<dyn RenderEventSink>>) -> Result<Self> {
        sinks
            .into_iter()
            .fold(Self::builder(config), RenderTrackerBuilder::sink)
            .build()
    }

    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn metadata_cache(&self) -> &Arc<TypeMetadataCache> {
        &self.cache
    }

    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    #[must_use]
    pub fn frequency(&self) -> &Arc<RenderFrequencyTracker> {
        &self.frequency
    }

    #[must_use]
    pub fn performance(&self) -> &Arc<PerformanceTracker> {
        &self.performance
    }

    // -------------------------------------------------------------------------
    // Instance lifecycle
    // -------------------------------------------------------------------------

    /// Register a new component instance. Dropping the lease marks it dead.
    pub fn register_instance(&self) -> InstanceLease {
        self.registry.lease()
    }

    /// Mark an instance dead and drop everything held for it now, instead
    /// of on the next maintenance pass.
    pub fn release_instance(&self, handle: InstanceHandle) -> bool {
        let released = self.registry.release(handle);
        self.snapshots.forget(handle);
        self.frequency.forget(handle);
        self.performance.forget(handle);
        if let Some(detector) = &self.detector {
            detector.forget(handle);
        }
        released
    }

    // -------------------------------------------------------------------------
    // Tracking
    // -------------------------------------------------------------------------

    /// Mark the start of a render for duration measurement.
    pub fn start_render(&self, instance: &dyn TrackedComponent, trigger: RenderTrigger) {
        if !self.config.enabled || !self.config.tracking.performance_tracking {
            return;
        }
        let _ = catch_unwind(AssertUnwindSafe(|| {
            if self.filter.should_track(instance.component_type()) {
                self.performance.start(instance, trigger);
            }
        }));
    }

    /// Track one lifecycle event. Returns the assembled event, or `None`
    /// when tracking is disabled, the type is filtered out, or tracking
    /// itself failed.
    pub fn track(
        &self,
        instance: &dyn TrackedComponent,
        trigger: RenderTrigger,
        first_render: Option<bool>,
    ) -> Option<RenderEvent> {
        self.track_with(
            instance,
            trigger,
            TrackOptions {
                first_render,
                parameter_changes: None,
            },
        )
    }

    /// [`Self::track`] with host-supplied parameter changes.
    pub fn track_with(
        &self,
        instance: &dyn TrackedComponent,
        trigger: RenderTrigger,
        options: TrackOptions,
    ) -> Option<RenderEvent> {
        if !self.config.enabled {
            return None;
        }
        self.counters.tracked.increment();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if !self.filter.should_track(instance.component_type()) {
                self.counters.filtered.increment();
                return None;
            }
            Some(self.track_accepted(instance, trigger, options))
        }));
        match outcome {
            Ok(event) => event,
            Err(_) => {
                self.counters.panics.increment();
                warn!(
                    component = instance.component_type().name(),
                    trigger = %trigger,
                    "render tracking panicked; event dropped"
                );
                None
            }
        }
    }

    fn track_accepted(
        &self,
        instance: &dyn TrackedComponent,
        trigger: RenderTrigger,
        options: TrackOptions,
    ) -> RenderEvent {
        let tracking = &self.config.tracking;
        let component_type = instance.component_type();
        let is_first = options.first_render == Some(true);

        // None when no parameter source answered for a parameters-set render:
        // the render is then left unclassified.
        let parameters = match (options.parameter_changes, trigger) {
            (Some(changes), _) => Some(changes),
            (None, RenderTrigger::ParametersSet) => self.detector.as_ref().and_then(|detector| {
                self.guarded("parameters", instance, trigger, || detector.detect(instance))
            }),
            (None, _) => Some(ParameterChanges::new()),
        };

        if is_first && tracking.state_tracking {
            self.guarded("baseline-snapshot", instance, trigger, || {
                self.snapshots.detect_changes(instance)
            });
        }

        let verdict = if !tracking.unnecessary_render_detection {
            self.state_only(instance, trigger, is_first)
        } else if trigger == RenderTrigger::ExplicitRerender && !tracking.state_tracking {
            RenderVerdict::default()
        } else {
            match &parameters {
                Some(changes) => self
                    .guarded("classifier", instance, trigger, || {
                        self.classifier.classify(instance, trigger, changes, is_first)
                    })
                    .unwrap_or_default(),
                None => RenderVerdict::default(),
            }
        };

        let frequency = tracking
            .frequency_tracking
            .then(|| {
                self.guarded("frequency", instance, trigger, || {
                    Ok(self.frequency.record(instance))
                })
            })
            .flatten();

        let duration_ms = tracking
            .performance_tracking
            .then(|| {
                self.guarded("performance", instance, trigger, || {
                    Ok(self.performance.stop_and_get_duration(instance, trigger))
                })
            })
            .flatten()
            .flatten();

        let session_id = self
            .sessions
            .as_ref()
            .and_then(|provider| {
                self.guarded("session", instance, trigger, || Ok(provider.session_id()))
            })
            .flatten();

        let mut builder = RenderEvent::builder(component_type, instance.instance_handle(), trigger)
            .first_render(options.first_render)
            .duration_ms(duration_ms)
            .session_id(session_id)
            .verdict(verdict);
        if let Some(changes) = parameters {
            builder = builder.parameter_changes(changes);
        }
        if let Some(sample) = frequency {
            builder = builder.frequency(sample);
        }
        let event = builder.build();

        if event.is_unnecessary {
            self.counters.unnecessary.increment();
        }
        if event.is_frequent {
            self.counters.frequent.increment();
        }
        if tracking.log_only_unnecessary && !event.is_noteworthy() {
            self.counters.suppressed.increment();
        } else {
            self.dispatch(&event);
        }
        event
    }

    /// State diff for an explicit re-render when classification is off.
    fn state_only(
        &self,
        instance: &dyn TrackedComponent,
        trigger: RenderTrigger,
        is_first: bool,
    ) -> RenderVerdict {
        if is_first || trigger != RenderTrigger::ExplicitRerender || !self.config.tracking.state_tracking {
            return RenderVerdict::default();
        }
        RenderVerdict {
            state_changes: self.guarded("state", instance, trigger, || {
                self.snapshots.detect_changes(instance)
            }),
            ..RenderVerdict::default()
        }
    }

    /// Run one detector, absorbing its errors and panics.
    fn guarded<T>(
        &self,
        detector: &'static str,
        instance: &dyn TrackedComponent,
        trigger: RenderTrigger,
        f: impl FnOnce() -> Result<T>,
    ) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                self.counters.detector_failures.increment();
                warn!(
                    detector,
                    component = instance.component_type().name(),
                    trigger = %trigger,
                    error = %err,
                    "render detector failed"
                );
                None
            }
            Err(_) => {
                self.counters.detector_failures.increment();
                self.counters.panics.increment();
                warn!(
                    detector,
                    component = instance.component_type().name(),
                    trigger = %trigger,
                    "render detector panicked"
                );
                None
            }
        }
    }

    fn dispatch(&self, event: &RenderEvent) {
        if self.sinks.is_empty() {
            return;
        }
        let mut delivered = false;
        for sink in &self.sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.emit(event))) {
                Ok(Ok(())) => delivered = true,
                Ok(Err(err)) => {
                    self.counters.sink_failures.increment();
                    warn!(sink = sink.name(), error = %err, "render event sink failed");
                }
                Err(_) => {
                    self.counters.sink_failures.increment();
                    self.counters.panics.increment();
                    warn!(sink = sink.name(), "render event sink panicked");
                }
            }
        }
        if delivered {
            self.counters.emitted.increment();
        } else {
            self.counters.undelivered.increment();
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance and teardown
    // -------------------------------------------------------------------------

    /// Run every maintenance task once on the calling thread.
    pub fn run_maintenance(&self) -> MaintenanceStatistics {
        self.maintenance.run_once()
    }

    /// Start periodic maintenance on the current tokio runtime. Returns
    /// `false` outside a runtime; calling it again while running is a no-op.
    pub fn start_maintenance(&self) -> bool {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if background.as_ref().is_some_and(|h| !h.is_shutdown()) {
            return true;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no tokio runtime; background maintenance not started");
            return false;
        }
        *background = Some(spawn_maintenance(
            Arc::clone(&self.maintenance),
            self.config.cache.maintenance_interval(),
        ));
        true
    }

    /// Whether background maintenance is running.
    #[must_use]
    pub fn maintenance_running(&self) -> bool {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_shutdown())
    }

    /// Stop background maintenance. Safe to call any number of times.
    pub fn shutdown(&self) {
        let handle = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
    }

    /// Stop background maintenance and wait for the task to exit.
    pub async fn shutdown_and_wait(&self) {
        let handle = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.join().await;
        }
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn statistics(&self) -> TrackerStatistics {
        let c = &self.counters;
        TrackerStatistics {
            tracker: TrackerCounters {
                renders_tracked: c.tracked.get(),
                renders_filtered: c.filtered.get(),
                events_emitted: c.emitted.get(),
                events_undelivered: c.undelivered.get(),
                events_suppressed: c.suppressed.get(),
                unnecessary_renders: c.unnecessary.get(),
                frequent_renders: c.frequent.get(),
                detector_failures: c.detector_failures.get(),
                sink_failures: c.sink_failures.get(),
                panics_caught: c.panics.get(),
            },
            live_instances: self.registry.live_count(),
            cache: self.cache.snapshot_statistics(),
            snapshots: self.snapshots.statistics(),
            frequency: self.frequency.statistics(),
            performance: self.performance.summaries(),
            maintenance: self.maintenance.statistics(),
        }
    }

    /// Zero every counter and performance aggregate.
    pub fn reset_statistics(&self) {
        for counter in self.counters.all() {
            counter.reset();
        }
        self.cache.reset_statistics();
        self.snapshots.reset_statistics();
        self.frequency.reset_statistics();
        self.performance.reset();
        self.maintenance.reset_statistics();
    }
}

impl Drop for RenderTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Per-instance render rate over a fixed retention window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::component::{ComponentKey, InstanceHandle, InstanceRegistry, TrackedComponent};
use crate::counter::ShardedCounter;
use crate::sharded::ShardedMap;

/// Frequency detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencySettings {
    /// Renders older than this are dropped from an instance's history.
    pub window: Duration,
    /// Renders per second above which a render is flagged as frequent.
    pub threshold_per_second: f64,
    /// Cap on timestamps kept per instance.
    pub max_history: usize,
}

impl Default for FrequencySettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            threshold_per_second: 10.0,
            max_history: 512,
        }
    }
}

/// Outcome of recording one render.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrequencySample {
    pub is_frequent: bool,
    /// Renders per second over the window.
    pub rate: f64,
    pub renders_in_window: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrequencyStatistics {
    pub tracked_instances: usize,
    pub renders_recorded: u64,
    pub frequent_renders: u64,
    pub stale_removed: u64,
}

/// Tracks how often each instance renders.
#[derive(Debug)]
pub struct RenderFrequencyTracker {
    settings: FrequencySettings,
    history: ShardedMap<ComponentKey, VecDeque<Instant>>,
    recorded: ShardedCounter,
    frequent: ShardedCounter,
    stale_removed: ShardedCounter,
}

impl Default for RenderFrequencyTracker {
    fn default() -> Self {
        Self::new(FrequencySettings::default())
    }
}

impl RenderFrequencyTracker {
    #[must_use]
    pub fn new(settings: FrequencySettings) -> Self {
        Self {
            settings,
            history: ShardedMap::new(),
            recorded: ShardedCounter::new(),
            frequent: ShardedCounter::new(),
            stale_removed: ShardedCounter::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> FrequencySettings {
        self.settings
    }

    /// Record a render now and report whether the instance renders faster
    /// than the threshold.
    pub fn record_and_classify(&self, instance: &dyn TrackedComponent) -> bool {
        self.record_at(ComponentKey::of(instance), Instant::now())
            .is_frequent
    }

    /// Like [`Self::record_and_classify`] but returns the rate as well.
    pub fn record(&self, instance: &dyn TrackedComponent) -> FrequencySample {
        self.record_at(ComponentKey::of(instance), Instant::now())
    }

    pub(crate) fn record_at(&self, key: ComponentKey, now: Instant) -> FrequencySample {
        let FrequencySettings {
            window,
            threshold_per_second,
            max_history,
        } = self.settings;

        let renders_in_window = self.history.upsert_with(key, VecDeque::new, |stamps| {
            stamps.push_back(now);
            while stamps
                .front()
                .is_some_and(|oldest| now.saturating_duration_since(*oldest) > window)
            {
                stamps.pop_front();
            }
            while stamps.len() > max_history.max(1) {
                stamps.pop_front();
            }
            stamps.len()
        });

        let rate = rate_over(renders_in_window, window);
        let is_frequent = rate > threshold_per_second;
        self.recorded.increment();
        if is_frequent {
            self.frequent.increment();
        }
        FrequencySample {
            is_frequent,
            rate,
            renders_in_window,
        }
    }

    /// Current rate for an instance without recording a render.
    #[must_use]
    pub fn rate(&self, instance: &dyn TrackedComponent) -> f64 {
        self.rate_at(&ComponentKey::of(instance), Instant::now())
    }

    pub(crate) fn rate_at(&self, key: &ComponentKey, now: Instant) -> f64 {
        let window = self.settings.window;
        let renders = self
            .history
            .read_with(key, |stamps| {
                stamps
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) <= window)
                    .count()
            })
            .unwrap_or(0);
        rate_over(renders, window)
    }

    /// Drop histories whose newest render has left the window.
    pub fn cleanup_stale(&self) -> usize {
        self.cleanup_stale_at(Instant::now())
    }

    pub(crate) fn cleanup_stale_at(&self, now: Instant) -> usize {
        let window = self.settings.window;
        let removed = self
            .history
            .drain_where(|_, stamps| {
                stamps
                    .back()
                    .is_none_or(|newest| now.saturating_duration_since(*newest) > window)
            })
            .len();
        if removed > 0 {
            self.stale_removed.add(removed as u64);
            debug!(removed, "dropped stale render histories");
        }
        removed
    }

    /// Drop histories of instances the registry reports dead.
    pub fn purge_dead(&self, registry: &InstanceRegistry) -> usize {
        self.history
            .drain_where(|key, _| !registry.is_alive(key.handle))
            .len()
    }

    pub fn forget(&self, handle: InstanceHandle) {
        self.history.retain(|key, _| key.handle != handle);
    }

    #[must_use]
    pub fn statistics(&self) -> FrequencyStatistics {
        FrequencyStatistics {
            tracked_instances: self.history.len(),
            renders_recorded: self.recorded.get(),
            frequent_renders: self.frequent.get(),
            stale_removed: self.stale_removed.get(),
        }
    }

    pub fn reset_statistics(&self) {
        self.recorded.reset();
        self.frequent.reset();
        self.stale_removed.reset();
    }
}

fn rate_over(renders: usize, window: Duration) -> f64 {
    let secs = window.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    renders as f64 / secs
}

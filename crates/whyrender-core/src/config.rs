//! Tracker configuration.
//!
//! Every section defaults independently, so a config file only names what
//! it changes. Durations are integer milliseconds (`*_ms` keys).
//!
//! ```toml
//! [tracking]
//! log_only_unnecessary = true
//!
//! [frequency]
//! window_ms = 2000
//! threshold_per_second = 20.0
//!
//! [filter]
//! exclude_namespaces = ["*.Diagnostics"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compare::CompareOptions;
use crate::error::{ConfigError, Result};
use crate::filter::FilterConfig;
use crate::frequency::FrequencySettings;
use crate::logging::LogConfig;
use crate::metadata::{CacheSettings, MetadataPolicy};
use crate::snapshot::SnapshotSettings;

/// Which detectors run on each tracked render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub state_tracking: bool,
    pub unnecessary_render_detection: bool,
    pub frequency_tracking: bool,
    pub performance_tracking: bool,
    /// Only hand unnecessary or frequent renders to the sinks.
    pub log_only_unnecessary: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            state_tracking: true,
            unnecessary_render_detection: true,
            frequency_tracking: true,
            performance_tracking: true,
            log_only_unnecessary: false,
        }
    }
}

/// Type metadata cache and maintenance schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_age_ms: u64,
    pub max_entries: usize,
    pub maintenance_interval_ms: u64,
    /// Render measurements started longer ago than this are abandoned.
    pub max_pending_measurement_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 30 * 60 * 1_000,
            max_entries: 1_000,
            maintenance_interval_ms: 60_000,
            max_pending_measurement_ms: 60_000,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    #[must_use]
    pub fn max_pending_measurement(&self) -> Duration {
        Duration::from_millis(self.max_pending_measurement_ms)
    }

    #[must_use]
    pub fn to_settings(&self) -> CacheSettings {
        CacheSettings {
            max_age: Duration::from_millis(self.max_age_ms),
            max_entries: self.max_entries,
        }
    }
}

/// State snapshot capture and comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub max_comparison_depth: usize,
    pub compare_collection_contents: bool,
    pub report_first_observation: bool,
    pub auto_track_simple_fields: bool,
    pub max_fields_per_type: usize,
    pub max_snapshots: usize,
    pub max_snapshot_bytes: usize,
    pub pool_max_idle: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        let store = SnapshotSettings::default();
        Self {
            max_comparison_depth: store.compare.max_depth,
            compare_collection_contents: store.compare.compare_collection_contents,
            report_first_observation: store.report_first_observation,
            auto_track_simple_fields: store.metadata.auto_track_simple_fields,
            max_fields_per_type: store.metadata.max_tracked_fields,
            max_snapshots: store.max_snapshots,
            max_snapshot_bytes: store.max_snapshot_bytes,
            pool_max_idle: store.pool_max_idle,
        }
    }
}

impl SnapshotConfig {
    #[must_use]
    pub fn compare_options(&self) -> CompareOptions {
        CompareOptions {
            max_depth: self.max_comparison_depth,
            compare_collection_contents: self.compare_collection_contents,
        }
    }

    #[must_use]
    pub fn to_settings(&self) -> SnapshotSettings {
        SnapshotSettings {
            compare: self.compare_options(),
            metadata: MetadataPolicy {
                auto_track_simple_fields: self.auto_track_simple_fields,
                max_tracked_fields: self.max_fields_per_type,
            },
            report_first_observation: self.report_first_observation,
            max_snapshots: self.max_snapshots,
            max_snapshot_bytes: self.max_snapshot_bytes,
            pool_max_idle: self.pool_max_idle,
        }
    }
}

/// Render frequency detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyConfig {
    pub window_ms: u64,
    pub threshold_per_second: f64,
    pub max_history: usize,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        let settings = FrequencySettings::default();
        Self {
            window_ms: u64::try_from(settings.window.as_millis()).unwrap_or(u64::MAX),
            threshold_per_second: settings.threshold_per_second,
            max_history: settings.max_history,
        }
    }
}

impl FrequencyConfig {
    #[must_use]
    pub fn to_settings(&self) -> FrequencySettings {
        FrequencySettings {
            window: Duration::from_millis(self.window_ms),
            threshold_per_second: self.threshold_per_second,
            max_history: self.max_history,
        }
    }
}

/// Top-level tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Master switch; a disabled tracker ignores every call.
    pub enabled: bool,
    pub tracking: TrackingConfig,
    pub cache: CacheConfig,
    pub snapshots: SnapshotConfig,
    pub frequency: FrequencyConfig,
    pub filter: FilterConfig,
    pub logging: LogConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracking: TrackingConfig::default(),
            cache: CacheConfig::default(),
            snapshots: SnapshotConfig::default(),
            frequency: FrequencyConfig::default(),
            filter: FilterConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values the tracker cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let nonzero = [
            ("cache.max_age_ms", self.cache.max_age_ms),
            ("cache.maintenance_interval_ms", self.cache.maintenance_interval_ms),
            ("cache.max_pending_measurement_ms", self.cache.max_pending_measurement_ms),
            ("frequency.window_ms", self.frequency.window_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        let nonzero_sizes = [
            ("cache.max_entries", self.cache.max_entries),
            ("snapshots.max_snapshots", self.snapshots.max_snapshots),
            ("snapshots.max_snapshot_bytes", self.snapshots.max_snapshot_bytes),
            ("frequency.max_history", self.frequency.max_history),
        ];
        for (field, value) in nonzero_sizes {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        let threshold = self.frequency.threshold_per_second;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "frequency.threshold_per_second",
                value: threshold,
            });
        }
        self.filter.validate()
    }
}

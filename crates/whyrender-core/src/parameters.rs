//! Parameter changes and the meaningful-change predicate.
//!
//! Parameter changes arrive from outside the core: a host may compute them
//! and pass them straight to the tracker, or install a
//! [`ParameterChangeDetector`]. [`HistoryParameterDetector`] is the built-in
//! detector; it remembers the last parameter values each instance exposed
//! through [`TrackedComponent::parameters`] and reports the differences.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::compare::{CompareOptions, values_equal};
use crate::component::{ComponentKey, InstanceHandle, InstanceRegistry, TrackedComponent};
use crate::error::{ComparisonError, Result};
use crate::sharded::ShardedMap;
use crate::value::FieldValue;

/// Old and new value of one parameter. `None` means the parameter was not
/// set on that side.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterChange {
    pub previous: Option<FieldValue>,
    pub current: Option<FieldValue>,
}

impl ParameterChange {
    #[must_use]
    pub fn new(previous: impl Into<FieldValue>, current: impl Into<FieldValue>) -> Self {
        Self {
            previous: Some(previous.into()),
            current: Some(current.into()),
        }
    }

    #[must_use]
    pub fn added(current: impl Into<FieldValue>) -> Self {
        Self {
            previous: None,
            current: Some(current.into()),
        }
    }

    #[must_use]
    pub fn removed(previous: impl Into<FieldValue>) -> Self {
        Self {
            previous: Some(previous.into()),
            current: None,
        }
    }
}

/// Parameter name to change, ordered by name.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ParameterChanges(BTreeMap<String, ParameterChange>);

impl ParameterChanges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, change: ParameterChange) {
        self.0.insert(name.into(), change);
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, change: ParameterChange) -> Self {
        self.insert(name, change);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParameterChange> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterChange)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, ParameterChange)> for ParameterChanges {
    fn from_iter<I: IntoIterator<Item = (K, ParameterChange)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// =============================================================================
// Meaningful-change predicate
// =============================================================================

/// Decides whether a parameter change is functionally observable.
///
/// An error means the comparer could not decide; callers treat it as a
/// meaningful change.
pub trait ParameterComparer: Send + Sync {
    fn is_meaningful(&self, name: &str, change: &ParameterChange)
    -> std::result::Result<bool, ComparisonError>;
}

/// Value-equality comparer: a change whose old and new values are equal
/// (including equal-by-value collection swaps) is not meaningful.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueParameterComparer {
    opts: CompareOptions,
}

impl ValueParameterComparer {
    #[must_use]
    pub fn new(opts: CompareOptions) -> Self {
        Self { opts }
    }
}

impl ParameterComparer for ValueParameterComparer {
    fn is_meaningful(
        &self,
        _name: &str,
        change: &ParameterChange,
    ) -> std::result::Result<bool, ComparisonError> {
        match (&change.previous, &change.current) {
            (Some(old), Some(new)) => values_equal(old, new, self.opts).map(|equal| !equal),
            (None, None) => Ok(false),
            _ => Ok(true),
        }
    }
}

impl<F> ParameterComparer for F
where
    F: Fn(&str, &ParameterChange) -> std::result::Result<bool, ComparisonError> + Send + Sync,
{
    fn is_meaningful(
        &self,
        name: &str,
        change: &ParameterChange,
    ) -> std::result::Result<bool, ComparisonError> {
        self(name, change)
    }
}

// =============================================================================
// Detectors
// =============================================================================

/// Source of parameter changes for a render.
pub trait ParameterChangeDetector: Send + Sync {
    /// Changes since the instance's previous call.
    fn detect(&self, instance: &dyn TrackedComponent) -> Result<ParameterChanges>;

    /// Drop any state kept for `handle`.
    fn forget(&self, _handle: InstanceHandle) {}

    /// Drop state for instances the registry reports dead.
    fn purge_dead(&self, _registry: &InstanceRegistry) -> usize {
        0
    }
}

type ParameterHistory = BTreeMap<&'static str, FieldValue>;

/// Detector that diffs each instance's parameters against the values it
/// exposed on the previous call. The first call for an instance reports
/// every parameter as added.
pub struct HistoryParameterDetector {
    opts: CompareOptions,
    history: ShardedMap<ComponentKey, ParameterHistory>,
}

impl fmt::Debug for HistoryParameterDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryParameterDetector")
            .field("instances", &self.history.len())
            .finish()
    }
}

impl Default for HistoryParameterDetector {
    fn default() -> Self {
        Self::new(CompareOptions::default())
    }
}

impl HistoryParameterDetector {
    #[must_use]
    pub fn new(opts: CompareOptions) -> Self {
        Self {
            opts,
            history: ShardedMap::new(),
        }
    }

    /// Number of instances with recorded parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

impl ParameterChangeDetector for HistoryParameterDetector {
    fn detect(&self, instance: &dyn TrackedComponent) -> Result<ParameterChanges> {
        let current: ParameterHistory = instance.parameters().into_iter().collect();
        let key = ComponentKey::of(instance);
        let opts = self.opts;

        let changes = self.history.upsert_with(key, ParameterHistory::new, |previous| {
            let mut changes = ParameterChanges::new();
            for (name, value) in &current {
                match previous.get(name) {
                    None => changes.insert(*name, ParameterChange::added(value.clone())),
                    Some(old) => {
                        // Undecidable comparisons are recorded; the comparer
                        // decides whether they matter.
                        if !values_equal(old, value, opts).unwrap_or(false) {
                            changes.insert(*name, ParameterChange::new(old.clone(), value.clone()));
                        }
                    }
                }
            }
            for (name, old) in previous.iter() {
                if !current.contains_key(name) {
                    changes.insert(*name, ParameterChange::removed(old.clone()));
                }
            }
            *previous = current;
            changes
        });
        Ok(changes)
    }

    fn forget(&self, handle: InstanceHandle) {
        self.history.retain(|key, _| key.handle != handle);
    }

    fn purge_dead(&self, registry: &InstanceRegistry) -> usize {
        self.history
            .drain_where(|key, _| !registry.is_alive(key.handle))
            .len()
    }
}

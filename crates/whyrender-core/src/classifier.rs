//! Necessary-versus-wasted render classification.
//!
//! Rules apply in order and the first match decides:
//!
//! 1. A first render is always necessary.
//! 2. `parameters-set` is unnecessary when no parameter changed, or when no
//!    change is meaningful according to the [`ParameterComparer`].
//! 3. `explicit-rerender` is unnecessary when the snapshot store reports no
//!    state change since the instance was last observed.
//! 4. Every other trigger is left unclassified (necessary).
//!
//! Reasons are diagnostic text only.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::TrackedComponent;
use crate::error::Result;
use crate::parameters::{ParameterChanges, ParameterComparer};
use crate::snapshot::{SnapshotStore, StateChanges};

/// Lifecycle event that caused a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderTrigger {
    Initialized,
    ParametersSet,
    ShouldRender,
    AfterRender,
    ExplicitRerender,
}

impl RenderTrigger {
    pub const ALL: [Self; 5] = [
        Self::Initialized,
        Self::ParametersSet,
        Self::ShouldRender,
        Self::AfterRender,
        Self::ExplicitRerender,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::ParametersSet => "parameters-set",
            Self::ShouldRender => "should-render",
            Self::AfterRender => "after-render",
            Self::ExplicitRerender => "explicit-rerender",
        }
    }
}

impl fmt::Display for RenderTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderTrigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown render trigger: {s}. Expected one of: initialized, parameters-set, \
                     should-render, after-render, explicit-rerender"
                )
            })
    }
}

/// Classification of one render.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderVerdict {
    pub is_unnecessary: bool,
    pub reason: Option<String>,
    /// State diff computed for an explicit re-render.
    #[serde(skip)]
    pub state_changes: Option<StateChanges>,
}

impl RenderVerdict {
    fn necessary() -> Self {
        Self::default()
    }

    fn unnecessary(reason: impl Into<String>) -> Self {
        Self {
            is_unnecessary: true,
            reason: Some(reason.into()),
            state_changes: None,
        }
    }
}

/// Applies the render classification rules.
pub struct UnnecessaryRenderClassifier {
    snapshots: Arc<SnapshotStore>,
    comparer: Arc<dyn ParameterComparer>,
}

impl fmt::Debug for UnnecessaryRenderClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnnecessaryRenderClassifier")
            .field("snapshots", &self.snapshots)
            .finish_non_exhaustive()
    }
}

impl UnnecessaryRenderClassifier {
    #[must_use]
    pub fn new(snapshots: Arc<SnapshotStore>, comparer: Arc<dyn ParameterComparer>) -> Self {
        Self {
            snapshots,
            comparer,
        }
    }

    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Classify one render.
    ///
    /// Errors only come from the snapshot store on an explicit re-render;
    /// callers should then treat the render as necessary.
    pub fn classify(
        &self,
        instance: &dyn TrackedComponent,
        trigger: RenderTrigger,
        parameter_changes: &ParameterChanges,
        is_first_render: bool,
    ) -> Result<RenderVerdict> {
        if is_first_render {
            return Ok(RenderVerdict::necessary());
        }
        match trigger {
            RenderTrigger::ParametersSet => Ok(self.classify_parameters(parameter_changes)),
            RenderTrigger::ExplicitRerender => {
                let changes = self.snapshots.detect_changes(instance)?;
                let mut verdict = if changes.changed {
                    RenderVerdict::necessary()
                } else {
                    RenderVerdict::unnecessary("no state change since last render")
                };
                verdict.state_changes = Some(changes);
                Ok(verdict)
            }
            RenderTrigger::Initialized | RenderTrigger::ShouldRender | RenderTrigger::AfterRender => {
                Ok(RenderVerdict::necessary())
            }
        }
    }

    fn classify_parameters(&self, changes: &ParameterChanges) -> RenderVerdict {
        if changes.is_empty() {
            return RenderVerdict::unnecessary("parameters set with no changes");
        }
        let meaningful = changes.iter().any(|(name, change)| {
            self.comparer.is_meaningful(name, change).unwrap_or_else(|err| {
                debug!(parameter = name, error = %err, "parameter comparer failed; treating change as meaningful");
                true
            })
        });
        if meaningful {
            RenderVerdict::necessary()
        } else {
            let names: Vec<&str> = changes.iter().map(|(name, _)| name).collect();
            RenderVerdict::unnecessary(format!(
                "parameter changes are not meaningful: {}",
                names.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{
        ComponentType, FieldDescriptor, FieldType, InstanceHandle, InstanceLease, InstanceRegistry,
    };
    use crate::error::ComparisonError;
    use crate::metadata::TypeMetadataCache;
    use crate::parameters::{ParameterChange, ValueParameterComparer};
    use crate::snapshot::SnapshotSettings;
    use crate::value::FieldValue;
    use std::sync::atomic::{AtomicI64, Ordering};

    const COUNTER_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::new("count", FieldType::Integer)];

    struct Counter {
        lease: InstanceLease,
        count: AtomicI64,
    }

    impl TrackedComponent for Counter {
        fn component_type(&self) -> ComponentType {
            ComponentType::of::<Self>()
        }

        fn instance_handle(&self) -> InstanceHandle {
            self.lease.handle()
        }

        fn field_descriptors(&self) -> &'static [FieldDescriptor] {
            COUNTER_FIELDS
        }

        fn read_field(&self, name: &str) -> Option<FieldValue> {
            (name == "count").then(|| FieldValue::from(self.count.load(Ordering::SeqCst)))
        }
    }

    fn setup() -> (UnnecessaryRenderClassifier, Counter) {
        let registry = Arc::new(InstanceRegistry::new());
        let store = Arc::new(SnapshotStore::new(
            SnapshotSettings::default(),
            Arc::new(TypeMetadataCache::default()),
            Arc::clone(&registry),
        ));
        let classifier =
            UnnecessaryRenderClassifier::new(store, Arc::new(ValueParameterComparer::default()));
        let counter = Counter {
            lease: registry.lease(),
            count: AtomicI64::new(0),
        };
        (classifier, counter)
    }

    #[test]
    fn first_render_is_never_unnecessary() {
        let (classifier, counter) = setup();
        for trigger in RenderTrigger::ALL {
            let verdict = classifier
                .classify(&counter, trigger, &ParameterChanges::new(), true)
                .unwrap();
            assert!(!verdict.is_unnecessary, "{trigger}");
            assert!(verdict.reason.is_none());
        }
    }

    #[test]
    fn empty_parameter_changes_are_unnecessary() {
        let (classifier, counter) = setup();
        let verdict = classifier
            .classify(&counter, RenderTrigger::ParametersSet, &ParameterChanges::new(), false)
            .unwrap();
        assert!(verdict.is_unnecessary);
    }

    #[test]
    fn equal_parameter_values_are_not_meaningful() {
        let (classifier, counter) = setup();
        let same = ParameterChanges::new().with("Title", ParameterChange::new("A", "A"));
        let verdict = classifier
            .classify(&counter, RenderTrigger::ParametersSet, &same, false)
            .unwrap();
        assert!(verdict.is_unnecessary);
        assert!(verdict.reason.unwrap().contains("Title"));

        let different = ParameterChanges::new().with("Title", ParameterChange::new("A", "B"));
        let verdict = classifier
            .classify(&counter, RenderTrigger::ParametersSet, &different, false)
            .unwrap();
        assert!(!verdict.is_unnecessary);
    }

    #[test]
    fn failing_comparer_counts_as_meaningful() {
        let registry = Arc::new(InstanceRegistry::new());
        let store = Arc::new(SnapshotStore::new(
            SnapshotSettings::default(),
            Arc::new(TypeMetadataCache::default()),
            Arc::clone(&registry),
        ));
        let broken = |_: &str, _: &ParameterChange| {
            Err::<bool, _>(ComparisonError::Comparer {
                type_name: "Title".into(),
                reason: "boom".into(),
            })
        };
        let classifier = UnnecessaryRenderClassifier::new(store, Arc::new(broken));
        let counter = Counter {
            lease: registry.lease(),
            count: AtomicI64::new(0),
        };
        let changes = ParameterChanges::new().with("Title", ParameterChange::new("A", "A"));
        let verdict = classifier
            .classify(&counter, RenderTrigger::ParametersSet, &changes, false)
            .unwrap();
        assert!(!verdict.is_unnecessary);
    }

    #[test]
    fn explicit_rerender_without_state_change_is_unnecessary() {
        let (classifier, counter) = setup();
        classifier.snapshots().detect_changes(&counter).unwrap();

        let verdict = classifier
            .classify(&counter, RenderTrigger::ExplicitRerender, &ParameterChanges::new(), false)
            .unwrap();
        assert!(verdict.is_unnecessary);
        assert!(verdict.reason.unwrap().contains("no state change"));

        counter.count.store(1, Ordering::SeqCst);
        let verdict = classifier
            .classify(&counter, RenderTrigger::ExplicitRerender, &ParameterChanges::new(), false)
            .unwrap();
        assert!(!verdict.is_unnecessary);
        let changes = verdict.state_changes.unwrap();
        assert_eq!(changes.changed_fields().collect::<Vec<_>>(), vec!["count"]);
    }

    #[test]
    fn other_triggers_are_left_alone() {
        let (classifier, counter) = setup();
        for trigger in [
            RenderTrigger::Initialized,
            RenderTrigger::ShouldRender,
            RenderTrigger::AfterRender,
        ] {
            let verdict = classifier
                .classify(&counter, trigger, &ParameterChanges::new(), false)
                .unwrap();
            assert!(!verdict.is_unnecessary);
        }
    }

    #[test]
    fn trigger_parses_kebab_and_snake_case() {
        assert_eq!("parameters-set".parse::<RenderTrigger>(), Ok(RenderTrigger::ParametersSet));
        assert_eq!("Explicit_Rerender".parse::<RenderTrigger>(), Ok(RenderTrigger::ExplicitRerender));
        assert!("render".parse::<RenderTrigger>().is_err());
        for trigger in RenderTrigger::ALL {
            assert_eq!(trigger.to_string().parse::<RenderTrigger>(), Ok(trigger));
        }
        assert_eq!(
            serde_json::to_string(&RenderTrigger::AfterRender).unwrap(),
            "\"after-render\""
        );
    }
}

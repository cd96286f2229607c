//! The record emitted for every tracked render.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classifier::{RenderTrigger, RenderVerdict};
use crate::component::{ComponentType, InstanceHandle};
use crate::frequency::FrequencySample;
use crate::parameters::ParameterChanges;
use crate::snapshot::FieldChange;

/// One tracked render. Built once by the tracker and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct RenderEvent {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub component_type: String,
    pub namespace: String,
    pub instance: InstanceHandle,
    pub trigger: RenderTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_render: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_changes: Option<ParameterChanges>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub state_changes: Vec<FieldChange>,
    pub is_unnecessary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unnecessary_reason: Option<String>,
    pub is_frequent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_rate: Option<f64>,
}

impl RenderEvent {
    #[must_use]
    pub fn builder(
        component_type: ComponentType,
        instance: InstanceHandle,
        trigger: RenderTrigger,
    ) -> RenderEventBuilder {
        RenderEventBuilder {
            event: Self {
                timestamp: Utc::now(),
                component: component_type.name().to_string(),
                component_type: component_type.full_name(),
                namespace: component_type.namespace().to_string(),
                instance,
                trigger,
                first_render: None,
                duration_ms: None,
                session_id: None,
                parameter_changes: None,
                state_changes: Vec::new(),
                is_unnecessary: false,
                unnecessary_reason: None,
                is_frequent: false,
                render_rate: None,
            },
        }
    }

    /// Whether the event carries anything worth a warning.
    #[must_use]
    pub fn is_noteworthy(&self) -> bool {
        self.is_unnecessary || self.is_frequent
    }
}

/// Incremental construction of a [`RenderEvent`].
#[derive(Debug)]
pub struct RenderEventBuilder {
    event: RenderEvent,
}

impl RenderEventBuilder {
    #[must_use]
    pub fn first_render(mut self, first_render: Option<bool>) -> Self {
        self.event.first_render = first_render;
        self
    }

    #[must_use]
    pub fn duration_ms(mut self, duration_ms: Option<f64>) -> Self {
        self.event.duration_ms = duration_ms;
        self
    }

    #[must_use]
    pub fn session_id(mut self, session_id: Option<String>) -> Self {
        self.event.session_id = session_id;
        self
    }

    #[must_use]
    pub fn parameter_changes(mut self, changes: ParameterChanges) -> Self {
        self.event.parameter_changes = (!changes.is_empty()).then_some(changes);
        self
    }

    #[must_use]
    pub fn verdict(mut self, verdict: RenderVerdict) -> Self {
        self.event.is_unnecessary = verdict.is_unnecessary;
        self.event.unnecessary_reason = verdict.reason;
        if let Some(changes) = verdict.state_changes {
            self.event.state_changes = changes.changes;
        }
        self
    }

    #[must_use]
    pub fn frequency(mut self, sample: FrequencySample) -> Self {
        self.event.is_frequent = sample.is_frequent;
        self.event.render_rate = sample.is_frequent.then_some(sample.rate);
        self
    }

    #[must_use]
    pub fn build(self) -> RenderEvent {
        self.event
    }
}

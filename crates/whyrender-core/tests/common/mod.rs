//! Shared test components.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use whyrender_core::{
    ComponentType, FieldDescriptor, FieldType, FieldValue, InstanceHandle, InstanceLease,
    InstanceRegistry, TrackedComponent,
};

const COUNTER_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::new("count", FieldType::Integer)];

/// One tracked integer field.
pub struct Counter {
    lease: InstanceLease,
    count: AtomicI64,
}

impl Counter {
    pub fn new(registry: &Arc<InstanceRegistry>) -> Self {
        Self {
            lease: registry.lease(),
            count: AtomicI64::new(0),
        }
    }

    pub fn set(&self, count: i64) {
        self.count.store(count, Ordering::SeqCst);
    }
}

impl TrackedComponent for Counter {
    fn component_type(&self) -> ComponentType {
        ComponentType::new::<Self>("Counter", "App.Pages")
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

const WIDGET_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("title", FieldType::Text),
    FieldDescriptor::new("items", FieldType::Collection).tracked(),
    FieldDescriptor::new("scratch", FieldType::Text).ignored(),
];

#[derive(Debug, Clone, Default)]
pub struct WidgetState {
    pub title: String,
    pub items: Vec<i64>,
    pub scratch: String,
}

/// Text parameter plus a collection field.
pub struct Widget {
    lease: InstanceLease,
    state: Mutex<WidgetState>,
}

impl Widget {
    pub fn new(registry: &Arc<InstanceRegistry>, title: &str) -> Self {
        Self {
            lease: registry.lease(),
            state: Mutex::new(WidgetState {
                title: title.to_string(),
                ..WidgetState::default()
            }),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut WidgetState)) {
        f(&mut self.state.lock().unwrap());
    }
}

impl TrackedComponent for Widget {
    fn component_type(&self) -> ComponentType {
        ComponentType::new::<Self>("Widget", "App.Shared")
    }

    fn instance_handle(&self) -> InstanceHandle {
        self.lease.handle()
    }

    fn field_descriptors(&self) -> &'static [FieldDescriptor] {
        WIDGET_FIELDS
    }

    fn read_field(&self, name: &str) -> Option<FieldValue> {
        let state = self.state.lock().unwrap();
        match name {
            "title" => Some(FieldValue::from(state.title.as_str())),
            "items" => Some(FieldValue::list(state.items.iter().copied())),
            "scratch" => Some(FieldValue::from(state.scratch.as_str())),
            _ => None,
        }
    }

    fn parameters(&self) -> Vec<(&'static str, FieldValue)> {
        let state = self.state.lock().unwrap();
        vec![("Title", FieldValue::from(state.title.as_str()))]
    }
}

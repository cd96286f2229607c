//! Component identity, field registration, and instance liveness.
//!
//! Components describe their inspectable fields once, as a static
//! descriptor table, instead of being reflected over at runtime. Each live
//! instance holds an [`InstanceLease`] issued by the [`InstanceRegistry`];
//! the lease carries a generation-tagged [`InstanceHandle`], and dropping
//! it marks the handle dead. Stores key their per-instance state by handle
//! and never hold the instance itself.

use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

// =============================================================================
// Component types
// =============================================================================

/// Declared type of a component: its `TypeId` plus display names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentType {
    id: TypeId,
    name: &'static str,
    namespace: &'static str,
}

impl ComponentType {
    /// Type with explicit display names.
    #[must_use]
    pub fn new<T: 'static>(name: &'static str, namespace: &'static str) -> Self {
        Self {
            id: TypeId::of::<T>(),
            name,
            namespace,
        }
    }

    /// Type named after its Rust path: `app::widgets::Counter` has name
    /// `Counter` and namespace `app::widgets`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        let full = std::any::type_name::<T>();
        let base_len = full.find('<').unwrap_or(full.len());
        let (name, namespace) = match full[..base_len].rfind("::") {
            Some(split) => (&full[split + 2..], &full[..split]),
            None => (full, ""),
        };
        Self {
            id: TypeId::of::<T>(),
            name,
            namespace,
        }
    }

    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// `namespace::name`, or just the name without a namespace.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.to_string()
        } else {
            format!("{}::{}", self.namespace, self.name)
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Field descriptors
// =============================================================================

/// Declared type of a component field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Bool,
    Integer,
    Float,
    Timestamp,
    Guid,
    Enum,
    Collection,
    Complex,
}

impl FieldType {
    /// Simple value types are tracked automatically.
    #[must_use]
    pub const fn is_simple(self) -> bool {
        !matches!(self, Self::Collection | Self::Complex)
    }
}

/// Opt-in / opt-out marker on a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMode {
    /// Tracked when the field type is simple.
    Auto,
    /// Always tracked, including complex types.
    Track,
    /// Never tracked.
    Ignore,
}

/// Static description of one component field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub field_type: FieldType,
    pub mode: FieldMode,
    /// Compiler- or macro-generated storage (backing fields and the like).
    pub generated: bool,
    /// Points back into the tracker (leases, tracker handles).
    pub internal: bool,
}

impl FieldDescriptor {
    #[must_use]
    pub const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            mode: FieldMode::Auto,
            generated: false,
            internal: false,
        }
    }

    #[must_use]
    pub const fn tracked(mut self) -> Self {
        self.mode = FieldMode::Track;
        self
    }

    #[must_use]
    pub const fn ignored(mut self) -> Self {
        self.mode = FieldMode::Ignore;
        self
    }

    #[must_use]
    pub const fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    #[must_use]
    pub const fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

/// A UI component the tracker can observe.
///
/// `field_descriptors` is consulted once per type, when its metadata is
/// first built. `read_field` is called for every tracked field on every
/// snapshot and returns `None` when the field has no value to capture.
pub trait TrackedComponent: Send + Sync {
    fn component_type(&self) -> ComponentType;

    fn instance_handle(&self) -> InstanceHandle;

    fn field_descriptors(&self) -> &'static [FieldDescriptor];

    fn read_field(&self, name: &str) -> Option<FieldValue>;

    /// Current parameter values, for the history-based parameter detector.
    fn parameters(&self) -> Vec<(&'static str, FieldValue)> {
        Vec::new()
    }
}

// =============================================================================
// Instance liveness
// =============================================================================

/// Generation-tagged handle for one component instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceHandle {
    index: u32,
    generation: u32,
}

impl InstanceHandle {
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    alive: bool,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Issues instance handles and records which are still alive.
///
/// A released slot is reused with a bumped generation, so a stale handle
/// never aliases the instance that took its slot.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    inner: RwLock<Slots>,
    live: AtomicUsize,
}

impl InstanceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new live instance.
    pub fn register(&self) -> InstanceHandle {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let handle = if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.alive = true;
            InstanceHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = inner.slots.len() as u32;
            inner.slots.push(Slot {
                generation: 0,
                alive: true,
            });
            InstanceHandle {
                index,
                generation: 0,
            }
        };
        self.live.fetch_add(1, Ordering::Relaxed);
        handle
    }

    /// Register an instance and wrap its handle in a lease that releases
    /// it on drop.
    pub fn lease(self: &Arc<Self>) -> InstanceLease {
        InstanceLease {
            handle: self.register(),
            registry: Arc::clone(self),
        }
    }

    /// Mark an instance dead. Returns `false` when the handle was already
    /// released or never issued; releasing twice is harmless.
    pub fn release(&self, handle: InstanceHandle) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = inner.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if !slot.alive || slot.generation != handle.generation {
            return false;
        }
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        self.live.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Whether `handle` still refers to a live instance.
    #[must_use]
    pub fn is_alive(&self, handle: InstanceHandle) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.alive && slot.generation == handle.generation)
    }

    /// Number of live instances.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// Owned registration of a live instance; dropping it releases the handle.
///
/// Components embed this as a field (described as `internal`).
#[derive(Debug)]
pub struct InstanceLease {
    handle: InstanceHandle,
    registry: Arc<InstanceRegistry>,
}

impl InstanceLease {
    #[must_use]
    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.registry.release(self.handle);
    }
}

/// Identity of a live component: its handle plus its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    pub handle: InstanceHandle,
    pub type_id: TypeId,
}

impl ComponentKey {
    #[must_use]
    pub fn new(handle: InstanceHandle, component_type: ComponentType) -> Self {
        Self {
            handle,
            type_id: component_type.id(),
        }
    }

    #[must_use]
    pub fn of(instance: &dyn TrackedComponent) -> Self {
        Self::new(instance.instance_handle(), instance.component_type())
    }
}

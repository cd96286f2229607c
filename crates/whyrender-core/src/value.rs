//! Field values captured in state snapshots and parameter maps.
//!
//! Simple values are stored inline. Collections are held behind an `Arc`,
//! which gives them a reference identity: two snapshots that captured the
//! same shared list compare equal without walking it, and comparisons past
//! the configured depth fall back to that identity.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::ComparisonError;

/// A component-defined value with its own equality.
///
/// `state_eq` may fail (for example when the other side has a different
/// concrete type); callers treat a failure as "changed".
pub trait StateValue: fmt::Debug + Send + Sync + 'static {
    /// Type name reported in diagnostics.
    fn type_name(&self) -> &'static str;

    /// Compare with another value of (usually) the same concrete type.
    fn state_eq(&self, other: &dyn StateValue) -> Result<bool, ComparisonError>;

    fn as_any(&self) -> &dyn Any;

    /// Short human-readable rendering for events and logs.
    fn describe(&self) -> String {
        format!("{self:?}")
    }
}

/// Downcast `other` to the concrete type of `this`, or report the mismatch.
pub fn downcast_peer<'a, T: StateValue>(
    this: &T,
    other: &'a dyn StateValue,
) -> Result<&'a T, ComparisonError> {
    other
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ComparisonError::Incompatible {
            left: this.type_name().to_string(),
            right: other.type_name().to_string(),
        })
}

/// One captured field value.
#[derive(Clone, Debug)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(Arc<str>),
    Timestamp(DateTime<Utc>),
    Guid(Uuid),
    List(Arc<Vec<FieldValue>>),
    Map(Arc<BTreeMap<String, FieldValue>>),
    Custom(Arc<dyn StateValue>),
}

impl FieldValue {
    /// Build a list value from anything convertible.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<FieldValue>,
    {
        Self::List(Arc::new(items.into_iter().map(Into::into).collect()))
    }

    /// Build a map value from key/value pairs.
    pub fn map<I, K, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<FieldValue>,
    {
        Self::Map(Arc::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    pub fn custom<T: StateValue>(value: T) -> Self {
        Self::Custom(Arc::new(value))
    }

    /// Whether this is a collection (list or map).
    #[must_use]
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::List(_) | Self::Map(_))
    }

    /// Rough heap + inline footprint in bytes, used for memory ceilings.
    ///
    /// Collections are walked down to `max_depth` levels, the same bound
    /// comparisons use; deeper ones count one slot per element.
    #[must_use]
    pub fn estimated_size(&self, max_depth: usize) -> usize {
        self.size_at(0, max_depth)
    }

    fn size_at(&self, depth: usize, max_depth: usize) -> usize {
        let inline = std::mem::size_of::<Self>();
        let descend = depth < max_depth;
        match self {
            Self::Text(s) => inline + s.len(),
            Self::List(items) if descend => {
                inline
                    + items
                        .iter()
                        .map(|v| v.size_at(depth + 1, max_depth))
                        .sum::<usize>()
            }
            Self::Map(entries) if descend => {
                inline
                    + entries
                        .iter()
                        .map(|(k, v)| k.len() + v.size_at(depth + 1, max_depth))
                        .sum::<usize>()
            }
            Self::List(items) => inline * (1 + items.len()),
            Self::Map(entries) => inline * (1 + entries.len()),
            Self::Custom(_) => inline + 64,
            _ => inline,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::UInt(u) => write!(f, "{u}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Guid(g) => write!(f, "{g}"),
            Self::List(items) => write!(f, "[{} items]", items.len()),
            Self::Map(entries) => write!(f, "{{{} entries}}", entries.len()),
            Self::Custom(v) => f.write_str(&v.describe()),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::UInt(u) => serializer.serialize_u64(*u),
            Self::Float(x) => serializer.serialize_f64(*x),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            Self::Guid(g) => serializer.collect_str(g),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Self::Custom(v) => serializer.serialize_str(&v.describe()),
        }
    }
}

macro_rules! from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for FieldValue {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        }
    )*};
}

macro_rules! from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for FieldValue {
            fn from(v: $t) -> Self {
                Self::UInt(u64::from(v))
            }
        }
    )*};
}

from_signed!(i8, i16, i32, i64);
from_unsigned!(u8, u16, u32, u64);

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        Self::UInt(v as u64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(Arc::from(v))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(Arc::from(v))
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        Self::Guid(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(v: Vec<T>) -> Self {
        Self::list(v)
    }
}

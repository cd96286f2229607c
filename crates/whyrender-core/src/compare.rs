//! Depth-bounded equality for captured field values.
//!
//! Collections are diffed by content while the walk is shallower than
//! `max_depth`; deeper collections, or all collections when content
//! comparison is off, compare by `Arc` identity. Numeric variants compare
//! by value across signedness, and NaN equals a bit-identical NaN so a
//! float field holding NaN does not report a change on every render.

use std::sync::Arc;

use crate::error::ComparisonError;
use crate::value::FieldValue;

/// Knobs for [`values_equal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOptions {
    /// Collections nested this deep (top-level field = depth 0) compare by
    /// reference identity only.
    pub max_depth: usize,
    /// When false, every collection compares by reference identity.
    pub compare_collection_contents: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            max_depth: 3,
            compare_collection_contents: true,
        }
    }
}

/// Whether two captured values are equal under `opts`.
///
/// Errors come only from [`crate::value::StateValue::state_eq`].
pub fn values_equal(
    a: &FieldValue,
    b: &FieldValue,
    opts: CompareOptions,
) -> Result<bool, ComparisonError> {
    equal_at(a, b, 0, opts)
}

fn equal_at(
    a: &FieldValue,
    b: &FieldValue,
    depth: usize,
    opts: CompareOptions,
) -> Result<bool, ComparisonError> {
    use FieldValue as V;

    let descend = opts.compare_collection_contents && depth < opts.max_depth;
    Ok(match (a, b) {
        (V::Null, V::Null) => true,
        (V::Bool(x), V::Bool(y)) => x == y,
        (V::Int(x), V::Int(y)) => x == y,
        (V::UInt(x), V::UInt(y)) => x == y,
        (V::Int(i), V::UInt(u)) | (V::UInt(u), V::Int(i)) => {
            u64::try_from(*i).is_ok_and(|i| i == *u)
        }
        (V::Float(x), V::Float(y)) => x == y || x.to_bits() == y.to_bits(),
        (V::Text(x), V::Text(y)) => Arc::ptr_eq(x, y) || x == y,
        (V::Timestamp(x), V::Timestamp(y)) => x == y,
        (V::Guid(x), V::Guid(y)) => x == y,
        (V::List(x), V::List(y)) => {
            if Arc::ptr_eq(x, y) {
                true
            } else if !descend || x.len() != y.len() {
                false
            } else {
                for (l, r) in x.iter().zip(y.iter()) {
                    if !equal_at(l, r, depth + 1, opts)? {
                        return Ok(false);
                    }
                }
                true
            }
        }
        (V::Map(x), V::Map(y)) => {
            if Arc::ptr_eq(x, y) {
                true
            } else if !descend || x.len() != y.len() {
                false
            } else {
                for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                    if lk != rk || !equal_at(lv, rv, depth + 1, opts)? {
                        return Ok(false);
                    }
                }
                true
            }
        }
        (V::Custom(x), V::Custom(y)) => Arc::ptr_eq(x, y) || x.state_eq(y.as_ref())?,
        _ => false,
    })
}

#![forbid(unsafe_code)]

//! Attribute values handed to the host.
//!
//! A [`PropMap`] is the host-facing half of an element's props: a sorted map
//! of attribute name to [`PropValue`]. Values compare structurally, except
//! for callbacks and opaque payloads which compare by identity.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Sorted attribute map.
pub type PropMap = BTreeMap<String, PropValue>;

/// Callback attribute (event handler).
pub type PropCallback = Rc<dyn Fn(&PropValue)>;

/// A single attribute value.
#[derive(Clone, Default)]
pub enum PropValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Vec<PropValue>),
    Map(PropMap),
    Callback(PropCallback),
    Opaque(Rc<dyn Any>),
}

impl PropValue {
    /// Wrap a callback.
    pub fn callback(f: impl Fn(&PropValue) + 'static) -> Self {
        Self::Callback(Rc::new(f))
    }

    /// Wrap an arbitrary value that only compares by identity.
    pub fn opaque<T: 'static>(value: T) -> Self {
        Self::Opaque(Rc::new(value))
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&PropMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Invoke a callback attribute; other values are ignored.
    pub fn call(&self, arg: &PropValue) {
        if let Self::Callback(f) = self {
            f(arg);
        }
    }
}

impl PartialEq for PropValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            // Bitwise so that NaN equals itself, like an identity check.
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Callback(a), Self::Callback(b)) => {
                std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
            }
            (Self::Opaque(a), Self::Opaque(b)) => std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
            _ => false,
        }
    }
}

impl fmt::Debug for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(map) => f.debug_map().entries(map).finish(),
            Self::Callback(_) => f.write_str("<callback>"),
            Self::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for PropValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        Self::Str(Rc::from(v))
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        Self::Str(Rc::from(v))
    }
}

impl From<PropMap> for PropValue {
    fn from(v: PropMap) -> Self {
        Self::Map(v)
    }
}

impl<T: Into<PropValue>> From<Vec<T>> for PropValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// Shallow comparison: same key set, each value equal.
#[must_use]
pub fn shallow_equal(a: &PropMap, b: &PropMap) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| ka == kb && va == vb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_compare_by_identity() {
        let cb = PropValue::callback(|_| {});
        let same = cb.clone();
        let other = PropValue::callback(|_| {});
        assert_eq!(cb, same);
        assert_ne!(cb, other);
    }

    #[test]
    fn nan_floats_are_equal_to_themselves() {
        assert_eq!(PropValue::Float(f64::NAN), PropValue::Float(f64::NAN));
        assert_ne!(PropValue::Float(0.0), PropValue::Float(-0.0));
    }

    #[test]
    fn shallow_equal_checks_keys_and_values() {
        let mut a = PropMap::new();
        a.insert("x".into(), 1.into());
        let mut b = a.clone();
        assert!(shallow_equal(&a, &b));
        b.insert("y".into(), PropValue::Null);
        assert!(!shallow_equal(&a, &b));
    }
}

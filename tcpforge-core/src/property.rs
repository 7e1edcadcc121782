//! Per-connection property bag.
//!
//! Applications attach their own state to a transport-level [`Connection`]
//! (a player id, a session name) without the engine knowing the
//! application's types. Values are stored as a [`PropertyValue`] tagged union
//! and read back through typed accessors that fail with
//! [`Error::PropertyNotFound`] or [`Error::TypeMismatch`] instead of relying
//! on runtime downcasts.
//!
//! # Examples
//!
//! ```
//! use tcpforge_core::property::{Properties, PropertyValue};
//!
//! let props = Properties::new();
//! props.set("pid", 7);
//! props.set("name", "alice");
//!
//! assert_eq!(props.get::<i32>("pid").unwrap(), 7);
//! assert_eq!(props.get_value("name").unwrap(), PropertyValue::Str("alice".into()));
//! assert!(props.get::<String>("pid").is_err());
//! ```
//!
//! [`Connection`]: crate::connection::Connection

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A value stored in a connection's property bag.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// UTF-8 string.
    Str(String),
    /// Opaque bytes.
    Bytes(Bytes),
}

impl PropertyValue {
    /// Returns the name of the variant, used in mismatch errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Int(_) => "int",
            PropertyValue::UInt(_) => "uint",
            PropertyValue::Float(_) => "float",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Str(_) => "string",
            PropertyValue::Bytes(_) => "bytes",
        }
    }
}

macro_rules! impl_from_int {
    ($variant:ident, $wide:ty: $($ty:ty),*) => {
        $(
            impl From<$ty> for PropertyValue {
                fn from(v: $ty) -> Self {
                    PropertyValue::$variant(<$wide>::from(v))
                }
            }
        )*
    };
}

impl_from_int!(Int, i64: i8, i16, i32, i64);
impl_from_int!(UInt, u64: u8, u16, u32, u64);

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        PropertyValue::Float(f64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<Bytes> for PropertyValue {
    fn from(v: Bytes) -> Self {
        PropertyValue::Bytes(v)
    }
}

/// Conversion from a stored [`PropertyValue`] to a concrete type.
///
/// Integer targets accept either integer variant as long as the value fits,
/// so a property stored as `i32` can be read back as `u32` if non-negative.
pub trait FromProperty: Sized {
    /// Type name reported in [`Error::TypeMismatch`].
    const EXPECTED: &'static str;

    /// Converts the value, returning `None` on a type or range mismatch.
    fn from_property(value: &PropertyValue) -> Option<Self>;
}

macro_rules! impl_from_property_int {
    ($($ty:ty),*) => {
        $(
            impl FromProperty for $ty {
                const EXPECTED: &'static str = stringify!($ty);

                fn from_property(value: &PropertyValue) -> Option<Self> {
                    match value {
                        PropertyValue::Int(v) => <$ty>::try_from(*v).ok(),
                        PropertyValue::UInt(v) => <$ty>::try_from(*v).ok(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_from_property_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl FromProperty for f64 {
    const EXPECTED: &'static str = "f64";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromProperty for bool {
    const EXPECTED: &'static str = "bool";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromProperty for String {
    const EXPECTED: &'static str = "String";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromProperty for Bytes {
    const EXPECTED: &'static str = "Bytes";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Bytes(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromProperty for PropertyValue {
    const EXPECTED: &'static str = "PropertyValue";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        Some(value.clone())
    }
}

/// A string-keyed map of [`PropertyValue`]s guarded by its own lock.
///
/// Each connection owns exactly one `Properties`; nothing is shared between
/// connections.
#[derive(Debug, Default)]
pub struct Properties {
    values: Mutex<HashMap<String, PropertyValue>>,
}

impl Properties {
    /// Creates an empty property bag.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PropertyValue>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a value, returning the previous value for the key if any.
    pub fn set(&self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        self.lock().insert(key.into(), value.into())
    }

    /// Returns a clone of the raw value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PropertyNotFound`] if the key is absent.
    pub fn get_value(&self, key: &str) -> Result<PropertyValue> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::PropertyNotFound(key.to_string()))
    }

    /// Returns the value stored under `key` converted to `T`.
    ///
    /// # Errors
    ///
    /// - [`Error::PropertyNotFound`] if the key is absent.
    /// - [`Error::TypeMismatch`] if the value cannot be converted to `T`.
    pub fn get<T: FromProperty>(&self, key: &str) -> Result<T> {
        let values = self.lock();
        let value = values
            .get(key)
            .ok_or_else(|| Error::PropertyNotFound(key.to_string()))?;
        T::from_property(value).ok_or_else(|| Error::TypeMismatch {
            key: key.to_string(),
            expected: T::EXPECTED,
        })
    }

    /// Removes the value stored under `key`, returning it if present.
    pub fn remove(&self, key: &str) -> Option<PropertyValue> {
        self.lock().remove(key)
    }

    /// Returns `true` if a value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Returns the number of stored properties.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no properties are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let props = Properties::new();
        props.set("pid", 7i32);
        assert_eq!(props.get::<i32>("pid").unwrap(), 7);
        assert_eq!(props.get::<i64>("pid").unwrap(), 7);
        assert_eq!(props.get::<u32>("pid").unwrap(), 7);
    }

    #[test]
    fn test_missing_key() {
        let props = Properties::new();
        let err = props.get::<i32>("missing").unwrap_err();
        assert!(matches!(err, Error::PropertyNotFound(ref k) if k == "missing"));
        assert!(props.get_value("missing").is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let props = Properties::new();
        props.set("name", "alice");
        let err = props.get::<i32>("name").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { expected: "i32", .. }));
    }

    #[test]
    fn test_out_of_range_is_mismatch() {
        let props = Properties::new();
        props.set("neg", -1i64);
        assert!(matches!(
            props.get::<u32>("neg").unwrap_err(),
            Error::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_overwrite_returns_previous() {
        let props = Properties::new();
        assert!(props.set("k", 1u8).is_none());
        let prev = props.set("k", "two");
        assert_eq!(prev, Some(PropertyValue::UInt(1)));
        assert_eq!(props.get::<String>("k").unwrap(), "two");
    }

    #[test]
    fn test_remove() {
        let props = Properties::new();
        props.set("flag", true);
        assert!(props.contains("flag"));
        assert_eq!(props.remove("flag"), Some(PropertyValue::Bool(true)));
        assert!(!props.contains("flag"));
        assert!(props.remove("flag").is_none());
        assert!(props.is_empty());
    }

    #[test]
    fn test_float_and_bytes() {
        let props = Properties::new();
        props.set("speed", 1.5f32);
        props.set("blob", Bytes::from_static(b"\x01\x02"));
        assert_eq!(props.get::<f64>("speed").unwrap(), 1.5);
        assert_eq!(props.get::<Bytes>("blob").unwrap(), Bytes::from_static(b"\x01\x02"));
        assert_eq!(props.get_value("speed").unwrap().kind(), "float");
        assert_eq!(props.len(), 2);
    }
}

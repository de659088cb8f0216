//! Typed conversion to and from [`Value`].
//!
//! [`FromValue`] is the structural decode used for reply slots and handler
//! parameters. A mismatch yields a [`ConvertError`] and leaves nothing
//! half-read, since the whole message has already been decoded.

use std::collections::HashMap;
use std::hash::Hash;

use bytes::Bytes;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ConvertError;

/// Short name of a value's wire type, for error messages.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "bool",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(_, _) => "extension",
    }
}

pub(crate) fn mismatch(expected: &'static str, found: &Value) -> ConvertError {
    ConvertError::Mismatch {
        expected,
        found: value_kind(found),
    }
}

/// Decode a wire value into a concrete type.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ConvertError>;

    /// The value a missing handler argument takes. `None` means the type
    /// has no sensible default and a missing argument is an error.
    fn zero() -> Option<Self> {
        None
    }
}

/// Encode a concrete type as a wire value.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Something usable as the argument list of a request or notification.
///
/// `()` is the empty list.
pub trait IntoArgs {
    fn into_args(self) -> Vec<Value>;
}

/// Serialize any serde type into a [`Value`].
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, ConvertError> {
    rmpv::ext::to_value(value).map_err(|err| ConvertError::Custom(err.to_string()))
}

/// Deserialize a [`Value`] into any serde type.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, ConvertError> {
    rmpv::ext::from_value(value).map_err(|err| ConvertError::Custom(err.to_string()))
}

/// Adapter that decodes through serde instead of [`FromValue`].
///
/// Useful for reply slots and handler parameters of struct type:
/// `endpoint.call::<Msgpack<ApiInfo>>(..)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Msgpack<T>(pub T);

impl<T> Msgpack<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: DeserializeOwned> FromValue for Msgpack<T> {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        from_value(value).map(Msgpack)
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        Ok(value)
    }

    fn zero() -> Option<Self> {
        Some(Value::Nil)
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

/// Accepts any value and discards it.
impl FromValue for () {
    fn from_value(_value: Value) -> Result<Self, ConvertError> {
        Ok(())
    }

    fn zero() -> Option<Self> {
        Some(())
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Nil
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        match value {
            Value::Boolean(b) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }

    fn zero() -> Option<Self> {
        Some(false)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
}

macro_rules! integer_value {
    ($($ty:ty),* $(,)?) => {$(
        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self, ConvertError> {
                match value {
                    Value::Integer(n) => n
                        .as_i64()
                        .and_then(|v| <$ty>::try_from(v).ok())
                        .or_else(|| n.as_u64().and_then(|v| <$ty>::try_from(v).ok()))
                        .ok_or_else(|| ConvertError::OutOfRange {
                            expected: stringify!($ty),
                            value: n.to_string(),
                        }),
                    other => Err(mismatch(stringify!($ty), &other)),
                }
            }

            fn zero() -> Option<Self> {
                Some(0)
            }
        }

        impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::from(self)
            }
        }
    )*};
}

integer_value!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        match value {
            Value::F64(f) => Ok(f),
            Value::F32(f) => Ok(f64::from(f)),
            Value::Integer(n) => n.as_f64().ok_or_else(|| ConvertError::OutOfRange {
                expected: "f64",
                value: n.to_string(),
            }),
            other => Err(mismatch("f64", &other)),
        }
    }

    fn zero() -> Option<Self> {
        Some(0.0)
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        match value {
            Value::F32(f) => Ok(f),
            Value::F64(f) => Ok(f as f32),
            Value::Integer(n) => n.as_f64().map(|f| f as f32).ok_or_else(|| {
                ConvertError::OutOfRange {
                    expected: "f32",
                    value: n.to_string(),
                }
            }),
            other => Err(mismatch("f32", &other)),
        }
    }

    fn zero() -> Option<Self> {
        Some(0.0)
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::F64(self)
    }
}

impl IntoValue for f32 {
    fn into_value(self) -> Value {
        Value::F32(self)
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        match value {
            Value::String(s) => s
                .into_str()
                .ok_or_else(|| ConvertError::Custom("string is not valid UTF-8".to_string())),
            Value::Binary(bytes) => String::from_utf8(bytes)
                .map_err(|_| ConvertError::Custom("binary is not valid UTF-8".to_string())),
            other => Err(mismatch("string", &other)),
        }
    }

    fn zero() -> Option<Self> {
        Some(String::new())
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::from(self)
    }
}

impl FromValue for Bytes {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        match value {
            Value::Binary(bytes) => Ok(Bytes::from(bytes)),
            Value::String(s) => Ok(Bytes::from(s.into_bytes())),
            other => Err(mismatch("binary", &other)),
        }
    }

    fn zero() -> Option<Self> {
        Some(Bytes::new())
    }
}

impl IntoValue for Bytes {
    fn into_value(self) -> Value {
        Value::Binary(self.to_vec())
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> Value {
        Value::Binary(self.to_vec())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }

    fn zero() -> Option<Self> {
        Some(None)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map_or(Value::Nil, IntoValue::into_value)
    }
}

/// Nil decodes as an empty vector.
impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            Value::Nil => Ok(Vec::new()),
            other => Err(mismatch("array", &other)),
        }
    }

    fn zero() -> Option<Self> {
        Some(Vec::new())
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::Array(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<K, V> FromValue for HashMap<K, V>
where
    K: FromValue + Eq + Hash,
    V: FromValue,
{
    fn from_value(value: Value) -> Result<Self, ConvertError> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            Value::Nil => Ok(HashMap::new()),
            other => Err(mismatch("map", &other)),
        }
    }

    fn zero() -> Option<Self> {
        Some(HashMap::new())
    }
}

impl<K: IntoValue, V: IntoValue> IntoValue for HashMap<K, V> {
    fn into_value(self) -> Value {
        Value::Map(
            self.into_iter()
                .map(|(k, v)| (k.into_value(), v.into_value()))
                .collect(),
        )
    }
}

impl IntoArgs for () {
    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Vec<Value> {
        self
    }
}

macro_rules! tuple_value {
    ($len:expr => $($name:ident),+) => {
        impl<$($name: FromValue),+> FromValue for ($($name,)+) {
            fn from_value(value: Value) -> Result<Self, ConvertError> {
                let items = match value {
                    Value::Array(items) => items,
                    other => return Err(mismatch("array", &other)),
                };
                if items.len() != $len {
                    return Err(ConvertError::Length {
                        expected: $len,
                        found: items.len(),
                    });
                }
                let mut items = items.into_iter();
                Ok(($($name::from_value(items.next().unwrap_or(Value::Nil))?,)+))
            }
        }

        #[allow(non_snake_case)]
        impl<$($name: IntoValue),+> IntoValue for ($($name,)+) {
            fn into_value(self) -> Value {
                let ($($name,)+) = self;
                Value::Array(vec![$($name.into_value()),+])
            }
        }

        #[allow(non_snake_case)]
        impl<$($name: IntoValue),+> IntoArgs for ($($name,)+) {
            fn into_args(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into_value()),+]
            }
        }
    };
}

tuple_value!(1 => A);
tuple_value!(2 => A, B);
tuple_value!(3 => A, B, C);
tuple_value!(4 => A, B, C, D);
tuple_value!(5 => A, B, C, D, E);
tuple_value!(6 => A, B, C, D, E, F);
tuple_value!(7 => A, B, C, D, E, F, G);
tuple_value!(8 => A, B, C, D, E, F, G, H);

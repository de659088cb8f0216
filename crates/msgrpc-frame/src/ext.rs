//! Extension types: small-code-tagged opaque payloads.
//!
//! The editor uses them for remote object handles. The handle types here
//! encode as a five-byte payload (`0xd2` + big-endian `i32`) and accept any
//! MessagePack integer payload on decode.
//!
//! Peers announce their own codes for the handle types. A registry made
//! active with [`ExtensionRegistry::scope`] decides which codes a handle
//! accepts and which code it encodes with on the current thread. Outside a
//! scope each handle uses its default [`Extension::CODE`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rmpv::Value;

use crate::error::ConvertError;
use crate::value::{mismatch, FromValue, IntoValue};

/// A typed wrapper around one extension code.
pub trait Extension: Sized {
    /// Code this type uses unless a registry maps it elsewhere.
    const CODE: i8;
    const NAME: &'static str;

    fn from_payload(data: &[u8]) -> Result<Self, ConvertError>;
    fn to_payload(&self) -> Vec<u8>;
}

/// A decoded extension whose concrete type is only known at runtime.
pub trait ExtensionValue: fmt::Debug + fmt::Display + Send + Sync {
    fn name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<E> ExtensionValue for E
where
    E: Extension + fmt::Debug + fmt::Display + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        E::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A handle payload is one integer; nothing in it needs to nest.
const HANDLE_PAYLOAD_DEPTH: usize = 2;

fn decode_handle(name: &'static str, data: &[u8]) -> Result<i32, ConvertError> {
    let mut cursor = data;
    let value = rmpv::decode::read_value_with_max_depth(&mut cursor, HANDLE_PAYLOAD_DEPTH)
        .map_err(|err| ConvertError::Custom(format!("{name} payload: {err}")))?;
    match value {
        Value::Integer(n) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| ConvertError::OutOfRange {
                expected: name,
                value: n.to_string(),
            }),
        other => Err(mismatch(name, &other)),
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<ExtensionRegistry>> = const { RefCell::new(None) };
}

/// Code `E` is written with on this thread.
fn wire_code<E: Extension>() -> i8 {
    ACTIVE
        .with(|active| active.borrow().as_ref().and_then(|r| r.code(E::NAME)))
        .unwrap_or(E::CODE)
}

/// Whether an extension with `code` decodes as `E` on this thread.
fn accepts<E: Extension>(code: i8) -> bool {
    ACTIVE.with(|active| match active.borrow().as_ref() {
        Some(registry) => match registry.name(code) {
            Some(name) => name == E::NAME,
            None => code == E::CODE && registry.code(E::NAME).is_none(),
        },
        None => code == E::CODE,
    })
}

fn encode_handle(handle: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(rmp::Marker::I32.to_u8());
    out.extend_from_slice(&handle.to_be_bytes());
    out
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $code:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
        pub struct $name(pub i32);

        impl Extension for $name {
            const CODE: i8 = $code;
            const NAME: &'static str = stringify!($name);

            fn from_payload(data: &[u8]) -> Result<Self, ConvertError> {
                decode_handle(Self::NAME, data).map($name)
            }

            fn to_payload(&self) -> Vec<u8> {
                encode_handle(self.0)
            }
        }

        impl FromValue for $name {
            fn from_value(value: Value) -> Result<Self, ConvertError> {
                match value {
                    Value::Ext(code, data) if accepts::<Self>(code) => Self::from_payload(&data),
                    Value::Ext(found, _) => Err(ConvertError::Extension {
                        expected: Self::NAME,
                        code: wire_code::<Self>(),
                        found,
                    }),
                    other => Err(mismatch(Self::NAME, &other)),
                }
            }

            fn zero() -> Option<Self> {
                Some($name(0))
            }
        }

        impl IntoValue for $name {
            fn into_value(self) -> Value {
                Value::Ext(wire_code::<Self>(), self.to_payload())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", Self::NAME, self.0)
            }
        }
    };
}

handle_type!(
    /// Remote buffer handle.
    Buffer, 0
);
handle_type!(
    /// Remote window handle.
    Window, 1
);
handle_type!(
    /// Remote tabpage handle.
    Tabpage, 2
);

type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn ExtensionValue>, ConvertError> + Send + Sync>;

#[derive(Clone, Default)]
struct Codes {
    decoders: HashMap<i8, (&'static str, DecodeFn)>,
    by_name: HashMap<&'static str, i8>,
}

/// Maps extension codes to named decoders.
///
/// Cheap to clone. Each name lives at one code: registering a name again
/// moves it, and registering a code again replaces whatever was there.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    codes: Arc<Codes>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the buffer, window and tabpage handles at their default codes.
    pub fn with_handles() -> Self {
        Self::new()
            .register::<Buffer>()
            .register::<Window>()
            .register::<Tabpage>()
    }

    /// Build a registry from the `types` map of an API info response,
    /// e.g. `{"Buffer": {"id": 0}, "Window": {"id": 1}}`.
    ///
    /// Known handle names are mapped to the announced codes; other entries
    /// are ignored.
    pub fn from_api_types(types: &Value) -> Self {
        let mut registry = Self::new();
        let Value::Map(entries) = types else {
            return registry;
        };
        for (name, info) in entries {
            let Some(code) = announced_code(info) else {
                continue;
            };
            registry = match name.as_str() {
                Some("Buffer") => registry.register_as::<Buffer>(code),
                Some("Window") => registry.register_as::<Window>(code),
                Some("Tabpage") => registry.register_as::<Tabpage>(code),
                _ => registry,
            };
        }
        registry
    }

    /// Register `E` at its default code.
    pub fn register<E>(self) -> Self
    where
        E: Extension + ExtensionValue + 'static,
    {
        self.register_as::<E>(E::CODE)
    }

    /// Register `E` under a code the peer chose.
    pub fn register_as<E>(self, code: i8) -> Self
    where
        E: Extension + ExtensionValue + 'static,
    {
        self.register_fn(code, E::NAME, |data| {
            E::from_payload(data).map(|v| Box::new(v) as Box<dyn ExtensionValue>)
        })
    }

    /// Register an arbitrary decoder under `name`.
    pub fn register_fn<F>(mut self, code: i8, name: &'static str, decode: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Box<dyn ExtensionValue>, ConvertError> + Send + Sync + 'static,
    {
        let codes = Arc::make_mut(&mut self.codes);
        if let Some(old_code) = codes.by_name.insert(name, code) {
            if old_code != code {
                codes.decoders.remove(&old_code);
            }
        }
        if let Some((old_name, _)) = codes.decoders.insert(code, (name, Arc::new(decode))) {
            if old_name != name {
                codes.by_name.remove(old_name);
            }
        }
        self
    }

    /// Decode an extension value.
    ///
    /// Returns `None` when `value` is not an extension or its code is unknown.
    pub fn decode(&self, value: &Value) -> Option<Result<Box<dyn ExtensionValue>, ConvertError>> {
        let Value::Ext(code, data) = value else {
            return None;
        };
        self.codes.decoders.get(code).map(|(_, decode)| decode(data))
    }

    /// Name registered for `code`.
    pub fn name(&self, code: i8) -> Option<&'static str> {
        self.codes.decoders.get(&code).map(|(name, _)| *name)
    }

    /// Code registered for `name`.
    pub fn code(&self, name: &str) -> Option<i8> {
        self.codes.by_name.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.decoders.is_empty()
    }

    /// Run `f` with this registry choosing handle codes on the current thread.
    ///
    /// Inside the scope, [`FromValue`] for a handle type accepts the code
    /// registered under its name and [`IntoValue`] writes that code. Scopes
    /// nest; the previous registry is restored when `f` returns or unwinds.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Restore(Option<ExtensionRegistry>);

        impl Drop for Restore {
            fn drop(&mut self) {
                let previous = self.0.take();
                ACTIVE.with(|active| *active.borrow_mut() = previous);
            }
        }

        let previous = ACTIVE.with(|active| active.borrow_mut().replace(self.clone()));
        let _restore = Restore(previous);
        f()
    }
}

fn announced_code(info: &Value) -> Option<i8> {
    let Value::Map(fields) = info else {
        return None;
    };
    fields
        .iter()
        .find(|(key, _)| key.as_str() == Some("id"))
        .and_then(|(_, id)| id.as_i64())
        .and_then(|id| i8::try_from(id).ok())
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self
            .codes
            .decoders
            .iter()
            .map(|(code, (name, _))| (*code, *name))
            .collect();
        codes.sort_unstable();
        f.debug_struct("ExtensionRegistry")
            .field("codes", &codes)
            .finish()
    }
}

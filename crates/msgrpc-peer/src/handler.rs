//! Handler binding: turning a wire argument array into a typed call.
//!
//! Any `Fn` of up to eight [`Param`] arguments returning `()` or
//! `Result<R, E>` is a [`Handler`]. Binding is tolerant:
//! - missing trailing arguments take the parameter type's zero value
//! - excess arguments are dropped
//! - a [`Rest`] parameter collects everything past the fixed positions
//!
//! A value that does not convert is reported as an [`ArgumentError`] naming
//! the first failing position. Binding still visits every position so the
//! whole argument array is always consumed.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use msgrpc_frame::{ConvertError, FromValue, IntoValue, Value};
use tracing::trace;

use crate::error::{ErrorValue, PeerError};

/// How a parameter draws from the argument array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// One wire value.
    Value,
    /// All remaining wire values.
    Rest,
    /// The endpoint's configured first argument; consumes no wire value.
    Prefix {
        type_id: TypeId,
        type_name: &'static str,
    },
}

/// A conversion failure at one argument position.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("argument {position}: {source}")]
pub struct ArgumentError {
    /// Zero-based index into the wire argument array.
    pub position: usize,
    pub source: ConvertError,
}

/// Cursor over the wire arguments of one inbound message.
pub struct ArgCursor<'a> {
    args: std::vec::IntoIter<Value>,
    position: usize,
    prefix: Option<&'a (dyn Any + Send + Sync)>,
    error: Option<ArgumentError>,
}

impl<'a> ArgCursor<'a> {
    pub(crate) fn new(args: Vec<Value>, prefix: Option<&'a (dyn Any + Send + Sync)>) -> Self {
        Self {
            args: args.into_iter(),
            position: 0,
            prefix,
            error: None,
        }
    }

    /// Decode the next wire value, or the type's zero value if none is left.
    pub fn next_value<T: FromValue>(&mut self) -> Option<T> {
        let position = self.position;
        self.position += 1;
        let decoded = match self.args.next() {
            Some(value) => T::from_value(value),
            None => T::zero().ok_or(ConvertError::Missing {
                expected: type_name::<T>(),
            }),
        };
        match decoded {
            Ok(value) => Some(value),
            Err(source) => {
                self.fail(position, source);
                None
            }
        }
    }

    /// Decode every remaining wire value.
    pub fn rest<T: FromValue>(&mut self) -> Option<Vec<T>> {
        let mut out = Vec::with_capacity(self.args.len());
        let mut ok = true;
        while let Some(value) = self.args.next() {
            let position = self.position;
            self.position += 1;
            match T::from_value(value) {
                Ok(item) => out.push(item),
                Err(source) => {
                    self.fail(position, source);
                    ok = false;
                }
            }
        }
        ok.then_some(out)
    }

    /// Clone the configured first argument as a `T`.
    pub fn prefix<T: Clone + 'static>(&mut self) -> Option<T> {
        let found = self.prefix.and_then(|any| any.downcast_ref::<T>()).cloned();
        if found.is_none() {
            self.fail(
                0,
                ConvertError::Custom(format!("no first argument of type {}", type_name::<T>())),
            );
        }
        found
    }

    fn fail(&mut self, position: usize, source: ConvertError) {
        if self.error.is_none() {
            self.error = Some(ArgumentError { position, source });
        }
    }

    /// Drop excess values and report the first conversion error, if any.
    pub(crate) fn finish(self) -> Result<(), ArgumentError> {
        let excess = self.args.len();
        if excess > 0 {
            trace!(excess, "ignoring excess arguments");
        }
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A handler parameter type.
pub trait Param: Sized + Send + 'static {
    fn kind() -> ParamKind {
        ParamKind::Value
    }

    fn bind(cursor: &mut ArgCursor<'_>) -> Option<Self>;
}

impl<T: FromValue + Send + 'static> Param for T {
    fn bind(cursor: &mut ArgCursor<'_>) -> Option<Self> {
        cursor.next_value()
    }
}

/// Variadic tail: every wire argument past the fixed positions.
///
/// Must be the last parameter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rest<T>(pub Vec<T>);

impl<T> Rest<T> {
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> Deref for Rest<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: FromValue + Send + 'static> Param for Rest<T> {
    fn kind() -> ParamKind {
        ParamKind::Rest
    }

    fn bind(cursor: &mut ArgCursor<'_>) -> Option<Self> {
        cursor.rest().map(Rest)
    }
}

/// The endpoint's first argument, set with
/// [`EndpointOptions::with_first_arg`](crate::EndpointOptions::with_first_arg)
/// or [`with_endpoint_first_arg`](crate::EndpointOptions::with_endpoint_first_arg).
///
/// Must be the first parameter of every handler on such an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Prefixed<T>(pub T);

impl<T> Deref for Prefixed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Clone + Send + Sync + 'static> Param for Prefixed<T> {
    fn kind() -> ParamKind {
        ParamKind::Prefix {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    fn bind(cursor: &mut ArgCursor<'_>) -> Option<Self> {
        cursor.prefix().map(Prefixed)
    }
}

/// An error value a handler can build itself.
///
/// Implement this for error types that know their own wire form, then
/// return them through [`HandlerError::marshal`].
pub trait MarshalReply: fmt::Display + Send + Sync {
    fn marshal_reply(&self) -> Value;
}

/// Error returned from a handler.
///
/// Converts from any `std::error::Error`. [`ErrorValue`] (alone or inside
/// [`PeerError::Remote`]) is sent as its raw value; everything else is sent
/// as its message string.
pub struct HandlerError {
    repr: Repr,
}

enum Repr {
    Value(Value),
    Marshal(Box<dyn MarshalReply>),
    Error(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// A plain text error.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::value(Value::from(message.into()))
    }

    /// A structured error value, sent unchanged.
    pub fn value(value: Value) -> Self {
        Self {
            repr: Repr::Value(value),
        }
    }

    /// An error that encodes itself.
    pub fn marshal(err: impl MarshalReply + 'static) -> Self {
        Self {
            repr: Repr::Marshal(Box::new(err)),
        }
    }

    /// The value placed in the error slot of the response.
    pub fn to_wire(&self) -> Value {
        match &self.repr {
            Repr::Value(value) => value.clone(),
            Repr::Marshal(err) => err.marshal_reply(),
            Repr::Error(err) => Value::from(err.to_string()),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        let boxed = match boxed.downcast::<ErrorValue>() {
            Ok(value) => return Self::value(value.0),
            Err(other) => other,
        };
        match boxed.downcast::<PeerError>() {
            Ok(peer) => match *peer {
                PeerError::Remote { value, .. } => Self::value(value.0),
                other => Self {
                    repr: Repr::Error(Box::new(other)),
                },
            },
            Err(other) => Self {
                repr: Repr::Error(other),
            },
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Value(value) => write!(f, "{}", ErrorValue(value.clone())),
            Repr::Marshal(err) => write!(f, "{err}"),
            Repr::Error(err) => write!(f, "{err}"),
        }
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Value(value) => f.debug_tuple("HandlerError::Value").field(value).finish(),
            Repr::Marshal(err) => f
                .debug_tuple("HandlerError::Marshal")
                .field(&err.to_string())
                .finish(),
            Repr::Error(err) => f.debug_tuple("HandlerError::Error").field(err).finish(),
        }
    }
}

/// What a handler's return value turns into.
pub trait IntoReply {
    fn into_reply(self) -> Result<Value, HandlerError>;
}

/// No result; requests are answered with nil.
impl IntoReply for () {
    fn into_reply(self) -> Result<Value, HandlerError> {
        Ok(Value::Nil)
    }
}

impl<R, E> IntoReply for Result<R, E>
where
    R: IntoValue,
    E: Into<HandlerError>,
{
    fn into_reply(self) -> Result<Value, HandlerError> {
        self.map(IntoValue::into_value).map_err(Into::into)
    }
}

/// A bound call, ready to run on a handler thread.
pub(crate) type Invocation = Box<dyn FnOnce() -> Result<Value, HandlerError> + Send>;

/// A function usable as a request or notification handler.
///
/// `Args` is the tuple of parameter types; it only serves to tell the
/// implementations apart.
pub trait Handler<Args>: Send + Sync + 'static {
    fn params() -> Vec<ParamKind>;

    fn bind(this: Arc<Self>, cursor: &mut ArgCursor<'_>) -> Option<Invocation>;
}

macro_rules! impl_handler {
    ($($ty:ident $var:ident),*) => {
        impl<Func, Ret, $($ty,)*> Handler<($($ty,)*)> for Func
        where
            Func: Fn($($ty),*) -> Ret + Send + Sync + 'static,
            Ret: IntoReply,
            $($ty: Param,)*
        {
            fn params() -> Vec<ParamKind> {
                vec![$(<$ty as Param>::kind()),*]
            }

            #[allow(unused_variables)]
            fn bind(this: Arc<Self>, cursor: &mut ArgCursor<'_>) -> Option<Invocation> {
                $(let $var = <$ty as Param>::bind(cursor);)*
                $(let $var = $var?;)*
                Some(Box::new(move || (*this)($($var),*).into_reply()))
            }
        }
    };
}

impl_handler!();
impl_handler!(A a);
impl_handler!(A a, B b);
impl_handler!(A a, B b, C c);
impl_handler!(A a, B b, C c, D d);
impl_handler!(A a, B b, C c, D d, E e);
impl_handler!(A a, B b, C c, D d, E e, F f);
impl_handler!(A a, B b, C c, D d, E e, F f, G g);
impl_handler!(A a, B b, C c, D d, E e, F f, G g, H h);

/// Type-erased handler stored in the endpoint's table.
pub(crate) trait Dispatch: Send + Sync {
    fn bind(&self, cursor: &mut ArgCursor<'_>) -> Option<Invocation>;
}

struct Erased<H, Args> {
    handler: Arc<H>,
    _args: PhantomData<fn() -> Args>,
}

impl<H, Args> Dispatch for Erased<H, Args>
where
    H: Handler<Args>,
    Args: 'static,
{
    fn bind(&self, cursor: &mut ArgCursor<'_>) -> Option<Invocation> {
        H::bind(Arc::clone(&self.handler), cursor)
    }
}

pub(crate) fn erase<H, Args>(handler: H) -> Arc<dyn Dispatch>
where
    H: Handler<Args>,
    Args: 'static,
{
    Arc::new(Erased {
        handler: Arc::new(handler),
        _args: PhantomData,
    })
}

/// Check a handler's parameter layout against the endpoint's first argument.
pub(crate) fn validate(
    method: &str,
    params: &[ParamKind],
    first_arg: Option<(TypeId, &'static str)>,
) -> Result<(), PeerError> {
    let reject = |reason: String| PeerError::Registration {
        method: method.to_string(),
        reason,
    };

    for (index, kind) in params.iter().enumerate() {
        match kind {
            ParamKind::Prefix { type_name, .. } if index != 0 => {
                return Err(reject(format!(
                    "Prefixed<{type_name}> must be the first parameter"
                )))
            }
            ParamKind::Rest if index + 1 != params.len() => {
                return Err(reject("Rest must be the last parameter".to_string()))
            }
            _ => {}
        }
    }

    match (first_arg, params.first()) {
        (Some((expected, expected_name)), Some(ParamKind::Prefix { type_id, type_name })) => {
            if *type_id == expected {
                Ok(())
            } else {
                Err(reject(format!(
                    "first parameter is Prefixed<{type_name}> but the endpoint provides {expected_name}"
                )))
            }
        }
        (Some((_, expected_name)), _) => Err(reject(format!(
            "the endpoint passes {expected_name} first; the first parameter must be Prefixed<{expected_name}>"
        ))),
        (None, Some(ParamKind::Prefix { type_name, .. })) => Err(reject(format!(
            "Prefixed<{type_name}> parameter but the endpoint has no first argument"
        ))),
        (None, _) => Ok(()),
    }
}

//! Completion plumbing for outbound calls.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};

use msgrpc_frame::{ConvertError, FromValue, Value};

use crate::error::{PeerError, Result};

/// A finished outbound call, delivered on its done channel.
#[derive(Debug)]
pub struct Call {
    pub id: u32,
    pub method: String,
    pub result: Result<()>,
}

/// Destination for the result of one call.
pub(crate) trait ReplySink: Send {
    fn fill(&mut self, value: Value) -> std::result::Result<(), ConvertError>;
}

/// A shared slot a response result is decoded into.
///
/// Cloning shares the slot. The value is present once the call's
/// completion reports success.
pub struct Reply<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Reply<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the decoded value, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_filled(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<T> Default for Reply<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("filled", &self.is_filled())
            .finish()
    }
}

impl<T: FromValue + Send + 'static> ReplySink for Reply<T> {
    fn fill(&mut self, value: Value) -> std::result::Result<(), ConvertError> {
        let decoded = T::from_value(value)?;
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(decoded);
        Ok(())
    }
}

/// Sending half of a caller-supplied completion channel.
///
/// Created by [`done_channel`]. Completions never block the serve loop:
/// when the channel is full the completion is dropped and reported as a
/// diagnostic.
#[derive(Debug, Clone)]
pub struct Done {
    tx: SyncSender<Call>,
    capacity: usize,
}

impl Done {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn sender(&self) -> SyncSender<Call> {
        self.tx.clone()
    }
}

/// A bounded completion channel for [`Endpoint::go_into`](crate::Endpoint::go_into).
pub fn done_channel(capacity: usize) -> (Done, Receiver<Call>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (Done { tx, capacity }, rx)
}

/// An outbound call in flight, returned by [`Endpoint::go`](crate::Endpoint::go).
#[derive(Debug)]
pub struct PendingCall<R> {
    method: String,
    reply: Reply<R>,
    done: Receiver<Call>,
}

impl<R> PendingCall<R> {
    pub(crate) fn new(method: &str, reply: Reply<R>, done: Receiver<Call>) -> Self {
        Self {
            method: method.to_string(),
            reply,
            done,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Block until the call completes and return its decoded result.
    pub fn wait(self) -> Result<R> {
        let call = self.done.recv().map_err(|_| PeerError::Closed)?;
        call.result?;
        self.reply
            .take()
            .ok_or(PeerError::MissingResult { method: call.method })
    }

    /// Return the result if the call has completed, or give the call back.
    pub fn try_wait(self) -> std::result::Result<Result<R>, Self> {
        match self.done.try_recv() {
            Ok(call) => Ok(call.result.and_then(|()| {
                self.reply
                    .take()
                    .ok_or(PeerError::MissingResult { method: call.method })
            })),
            Err(mpsc::TryRecvError::Empty) => Err(self),
            Err(mpsc::TryRecvError::Disconnected) => Ok(Err(PeerError::Closed)),
        }
    }
}

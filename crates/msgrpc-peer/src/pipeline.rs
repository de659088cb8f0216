use std::collections::VecDeque;
use std::sync::mpsc::Receiver;

use msgrpc_frame::{FromValue, IntoArgs};
use tracing::trace;

use crate::call::{done_channel, Call, Done, Reply};
use crate::endpoint::Endpoint;
use crate::error::{CallError, PeerError, Result};

/// Completions per done channel.
const CHUNK: usize = 32;

/// A batch of outbound calls that are issued without blocking and waited on
/// together.
///
/// Not meant to be shared between threads: one owner issues calls and
/// then calls [`wait`](Self::wait). The pipeline is empty again afterwards
/// and can be reused.
pub struct Pipeline {
    endpoint: Endpoint,
    chunks: VecDeque<Receiver<Call>>,
    tail: Option<Done>,
    count: usize,
}

impl Pipeline {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            chunks: VecDeque::new(),
            tail: None,
            count: 0,
        }
    }

    /// Issue a call. Its result is decoded into the returned slot, which is
    /// filled once [`wait`](Self::wait) reports no error for it.
    pub fn call<R>(&mut self, method: &str, args: impl IntoArgs) -> Reply<R>
    where
        R: FromValue + Send + 'static,
    {
        let reply = Reply::new();
        let done = self.done();
        self.endpoint
            .start(method, args, Some(Box::new(reply.clone())), done);
        reply
    }

    /// Issue a call whose result is not needed.
    pub fn call_ignore(&mut self, method: &str, args: impl IntoArgs) {
        let done = self.done();
        self.endpoint.start(method, args, None, done);
    }

    fn done(&mut self) -> std::sync::mpsc::SyncSender<Call> {
        let tail = match self.tail.take() {
            Some(tail) if self.count % CHUNK != 0 => tail,
            _ => {
                let (done, rx) = done_channel(CHUNK);
                self.chunks.push_back(rx);
                done
            }
        };
        let sender = tail.sender();
        self.tail = Some(tail);
        self.count += 1;
        sender
    }

    /// Number of calls issued since the last wait.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Wait for every issued call.
    ///
    /// With one call its error is returned as is. With several, all failures
    /// are returned together as [`PeerError::Batch`], chunk by chunk in
    /// issue order.
    pub fn wait(&mut self) -> Result<()> {
        let count = std::mem::take(&mut self.count);
        self.tail = None;
        trace!(count, "waiting for pipelined calls");

        let mut errors = Vec::new();
        let mut remaining = count;
        'chunks: while let Some(rx) = self.chunks.pop_front() {
            for _ in 0..remaining.min(CHUNK) {
                remaining -= 1;
                match rx.recv() {
                    Ok(Call {
                        method,
                        result: Err(error),
                        ..
                    }) => errors.push(CallError { method, error }),
                    Ok(_) => {}
                    Err(_) => {
                        errors.push(CallError {
                            method: "pipeline".to_string(),
                            error: PeerError::Closed,
                        });
                        break 'chunks;
                    }
                }
            }
        }
        self.chunks.clear();

        if count == 1 {
            return match errors.pop() {
                Some(failed) => Err(failed.error),
                None => Ok(()),
            };
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PeerError::Batch(errors))
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("count", &self.count)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

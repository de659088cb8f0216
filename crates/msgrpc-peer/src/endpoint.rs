use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;

use msgrpc_frame::{
    ExtensionRegistry, FrameError, FrameReader, FrameWriter, FromValue, IntoArgs, Message, Value,
};
use msgrpc_transport::{Closer, DuplexStream};
use tracing::{debug, trace, warn};

use crate::call::{Call, Done, PendingCall, Reply, ReplySink};
use crate::error::{remote_error, PeerError, Result};
use crate::handler::{erase, validate, ArgCursor, Dispatch, Handler, HandlerError, Invocation};
use crate::options::{EndpointOptions, FirstArg};
use crate::pipeline::Pipeline;

/// Largest request id; ids wrap back to 1 after it.
const MAX_ID: u32 = i32::MAX as u32;

struct PendingEntry {
    method: String,
    reply: Option<Box<dyn ReplySink>>,
    done: SyncSender<Call>,
}

struct State {
    closed: bool,
    next_id: u32,
    pending: HashMap<u32, PendingEntry>,
}

impl State {
    /// Next free id. Ids still pending after a wrap are skipped.
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= MAX_ID { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

struct Shared {
    writer: Mutex<FrameWriter<Box<dyn Write + Send>>>,
    reader: Mutex<Option<FrameReader<Box<dyn Read + Send>>>>,
    state: Mutex<State>,
    handlers: RwLock<HashMap<String, Arc<dyn Dispatch>>>,
    closer: Mutex<Option<Box<dyn Closer>>>,
    options: EndpointOptions,
    kind: &'static str,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn write(&self, msg: &Message) -> std::result::Result<(), FrameError> {
        lock(&self.writer).write_message(msg)
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Deliver a completion without ever blocking.
    fn complete(&self, entry: PendingEntry, id: u32, result: Result<()>) {
        let call = Call {
            id,
            method: entry.method,
            result,
        };
        match entry.done.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => self.diagnose(format!(
                "completion channel full; dropping result of {} (id {})",
                call.method, call.id
            )),
            Err(TrySendError::Disconnected(call)) => {
                trace!(id = call.id, method = %call.method, "caller stopped waiting");
            }
        }
    }

    /// Mark closed, fail every pending call, close the stream.
    ///
    /// Returns `None` if the endpoint was already closed.
    fn shutdown(&self, reason: impl Fn() -> PeerError) -> Option<std::io::Result<()>> {
        let drained = {
            let mut state = lock(&self.state);
            if state.closed {
                return None;
            }
            state.closed = true;
            std::mem::take(&mut state.pending)
        };

        debug!(kind = self.kind, pending = drained.len(), "closing endpoint");
        for (id, entry) in drained {
            self.complete(entry, id, Err(reason()));
        }

        let closer = lock(&self.closer).take();
        Some(match closer {
            Some(mut closer) => closer.close(),
            None => Ok(()),
        })
    }

    /// An outbound write failed: the stream is unusable from here on.
    fn fail(&self, err: FrameError) -> Arc<FrameError> {
        let err = Arc::new(err);
        if let Some(Err(close_err)) = self.shutdown(|| PeerError::Encode(Arc::clone(&err))) {
            debug!(error = %close_err, "closing stream after write failure");
        }
        warn!(kind = self.kind, error = %err, "write failed; endpoint closed");
        err
    }

    fn diagnose(&self, message: String) {
        warn!(kind = self.kind, "{message}");
        if let Some(sink) = &self.options.diagnostics {
            sink(&message);
        }
    }
}

/// One end of a bidirectional RPC connection.
///
/// Cheap to clone; all clones share the connection. Run [`serve`](Self::serve)
/// on one thread to process inbound messages; calls block until the serve
/// loop delivers their response.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

/// Non-owning handle to an [`Endpoint`], for handlers that need to call back
/// into the connection that invoked them.
#[derive(Clone)]
pub struct WeakEndpoint {
    shared: Weak<Shared>,
}

impl WeakEndpoint {
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.shared.upgrade().map(|shared| Endpoint { shared })
    }
}

impl fmt::Debug for WeakEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEndpoint")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl Endpoint {
    /// Wrap a connected stream.
    pub fn new(stream: DuplexStream, options: EndpointOptions) -> Self {
        let kind = stream.kind();
        let (reader, writer, closer) = stream.into_parts();
        let shared = Shared {
            writer: Mutex::new(FrameWriter::with_config(writer, options.frame.clone())),
            reader: Mutex::new(Some(FrameReader::with_config(reader, options.frame.clone()))),
            state: Mutex::new(State {
                closed: false,
                next_id: 1,
                pending: HashMap::new(),
            }),
            handlers: RwLock::new(HashMap::new()),
            closer: Mutex::new(closer),
            options,
            kind,
        };
        debug!(kind, "endpoint created");
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Call `method` and block until its result arrives.
    pub fn call<R>(&self, method: &str, args: impl IntoArgs) -> Result<R>
    where
        R: FromValue + Send + 'static,
    {
        self.go(method, args).wait()
    }

    /// Call `method` and block until it completes, discarding the result.
    pub fn call_ignore(&self, method: &str, args: impl IntoArgs) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.start(method, args, None, tx);
        rx.recv().map_err(|_| PeerError::Closed)?.result
    }

    /// Start a call without waiting for it.
    pub fn go<R>(&self, method: &str, args: impl IntoArgs) -> PendingCall<R>
    where
        R: FromValue + Send + 'static,
    {
        let reply = Reply::new();
        let (tx, rx) = mpsc::sync_channel(1);
        self.start(method, args, Some(Box::new(reply.clone())), tx);
        PendingCall::new(method, reply, rx)
    }

    /// Start a call whose completion is sent to a caller-owned channel.
    ///
    /// The result is decoded into `reply`, if given. Completions that find
    /// `done` full are dropped, so size it for the calls routed into it.
    pub fn go_into<R>(
        &self,
        method: &str,
        args: impl IntoArgs,
        reply: Option<Reply<R>>,
        done: &Done,
    ) -> Result<()>
    where
        R: FromValue + Send + 'static,
    {
        if done.capacity() == 0 {
            return Err(PeerError::UnbufferedDone);
        }
        let reply = reply.map(|r| Box::new(r) as Box<dyn ReplySink>);
        self.start(method, args, reply, done.sender());
        Ok(())
    }

    /// Register a pending entry and write the request. Every outcome,
    /// including a closed endpoint, arrives on `done`.
    pub(crate) fn start(
        &self,
        method: &str,
        args: impl IntoArgs,
        reply: Option<Box<dyn ReplySink>>,
        done: SyncSender<Call>,
    ) {
        let args = self.with_extensions(|| args.into_args());
        let entry = PendingEntry {
            method: method.to_string(),
            reply,
            done,
        };

        let id = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                drop(state);
                self.shared.complete(entry, 0, Err(PeerError::Closed));
                return;
            }
            let id = state.allocate_id();
            state.pending.insert(id, entry);
            id
        };

        trace!(id, method, "sending request");
        let msg = Message::Request {
            id,
            method: method.to_string(),
            args,
        };
        if let Err(err) = self.shared.write(&msg) {
            self.shared.fail(err);
        }
    }

    /// Send a notification. No response is expected.
    pub fn notify(&self, method: &str, args: impl IntoArgs) -> Result<()> {
        if self.shared.is_closed() {
            return Err(PeerError::Closed);
        }
        trace!(method, "sending notification");
        let msg = Message::Notification {
            method: method.to_string(),
            args: self.with_extensions(|| args.into_args()),
        };
        self.shared
            .write(&msg)
            .map_err(|err| PeerError::Encode(self.shared.fail(err)))
    }

    /// Register `handler` under `method`, replacing any previous handler.
    ///
    /// The handler answers requests (its result or error is sent back) and
    /// notifications (its error is only logged).
    pub fn register<H, Args>(&self, method: impl Into<String>, handler: H) -> Result<()>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        let method = method.into();
        if self.shared.is_closed() {
            return Err(PeerError::Closed);
        }
        validate(&method, &H::params(), self.shared.options.first_arg_type())?;

        let previous = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.clone(), erase(handler));
        debug!(method, replaced = previous.is_some(), "registered handler");
        Ok(())
    }

    /// Read and dispatch inbound messages until the stream ends.
    ///
    /// Returns `Ok(())` on EOF or after [`close`](Self::close), and the
    /// protocol error otherwise. Either way the endpoint is closed on return.
    pub fn serve(&self) -> Result<()> {
        let mut reader = lock(&self.shared.reader)
            .take()
            .ok_or(PeerError::AlreadyServing)?;
        debug!(kind = self.shared.kind, "serve loop started");

        loop {
            match reader.read_message() {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => {
                    debug!(kind = self.shared.kind, "peer closed the stream");
                    self.shutdown_quietly();
                    return Ok(());
                }
                Err(err) if self.shared.is_closed() => {
                    debug!(error = %err, "read ended after close");
                    return Ok(());
                }
                Err(err) => {
                    warn!(kind = self.shared.kind, error = %err, "serve loop failed");
                    self.shutdown_quietly();
                    return Err(PeerError::Frame(err));
                }
            }
        }
    }

    fn shutdown_quietly(&self) {
        if let Some(Err(err)) = self.shared.shutdown(|| PeerError::Closed) {
            debug!(error = %err, "closing stream");
        }
    }

    /// Close the endpoint: every pending call completes with
    /// [`PeerError::Closed`], then the stream is closed.
    ///
    /// A failure closing the stream is returned but the endpoint stays closed.
    pub fn close(&self) -> Result<()> {
        match self.shared.shutdown(|| PeerError::Closed) {
            None => Err(PeerError::Closed),
            Some(result) => result.map_err(PeerError::Io),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of calls awaiting a response.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Extension registry from the endpoint's options.
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.shared.options.extensions
    }

    /// Run a conversion with this endpoint's handle codes in effect.
    fn with_extensions<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.options.extensions.scope(f)
    }

    /// Start a batch of calls that are waited on together.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.clone())
    }

    fn dispatch(&self, msg: Message) {
        match msg {
            Message::Response { id, error, result } => self.handle_response(id, error, result),
            Message::Request { id, method, args } => self.handle_request(id, method, args),
            Message::Notification { method, args } => self.handle_notification(method, args),
        }
    }

    fn handle_response(&self, id: u32, error: Value, result: Value) {
        let entry = lock(&self.shared.state).pending.remove(&id);
        let Some(mut entry) = entry else {
            self.shared
                .diagnose(format!("response for unknown request id {id}"));
            return;
        };

        trace!(id, method = %entry.method, "received response");
        let outcome = if !error.is_nil() {
            Err(remote_error(&entry.method, error))
        } else if let Some(reply) = entry.reply.as_mut() {
            self.with_extensions(|| reply.fill(result))
                .map_err(|source| PeerError::Convert {
                    method: entry.method.clone(),
                    source,
                })
        } else {
            Ok(())
        };
        self.shared.complete(entry, id, outcome);
    }

    fn handle_request(&self, id: u32, method: String, args: Vec<Value>) {
        let Some(handler) = self.lookup(&method) else {
            debug!(id, method, "request for unknown method");
            self.reply(
                id,
                Err(HandlerError::msg(format!("unknown request method: {method}"))),
            );
            return;
        };

        let invocation = match self.bind(handler.as_ref(), args) {
            Ok(invocation) => invocation,
            Err(reason) => {
                debug!(id, method, %reason, "request arguments did not bind");
                self.reply(
                    id,
                    Err(HandlerError::msg(format!("invalid argument: {reason}"))),
                );
                return;
            }
        };

        trace!(id, method, "dispatching request");
        let spawned = self.spawn_handler(move |endpoint| {
            let outcome = endpoint.run(&method, invocation);
            endpoint.reply(id, outcome);
        });
        if let Err(err) = spawned {
            self.reply(
                id,
                Err(HandlerError::msg(format!("cannot start handler: {err}"))),
            );
        }
    }

    fn handle_notification(&self, method: String, args: Vec<Value>) {
        let Some(handler) = self.lookup(&method) else {
            self.shared
                .diagnose(format!("unknown notification method: {method}"));
            return;
        };

        let invocation = match self.bind(handler.as_ref(), args) {
            Ok(invocation) => invocation,
            Err(reason) => {
                self.shared
                    .diagnose(format!("notification {method}: invalid argument: {reason}"));
                return;
            }
        };

        trace!(method, "dispatching notification");
        let spawned = self.spawn_handler(move |endpoint| {
            if let Err(err) = endpoint.run(&method, invocation) {
                endpoint
                    .shared
                    .diagnose(format!("notification handler {method} failed: {err}"));
            }
        });
        if let Err(err) = spawned {
            self.shared
                .diagnose(format!("cannot start notification handler: {err}"));
        }
    }

    fn lookup(&self, method: &str) -> Option<Arc<dyn Dispatch>> {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    fn bind(&self, handler: &dyn Dispatch, args: Vec<Value>) -> std::result::Result<Invocation, String> {
        let prefix: Option<&(dyn Any + Send + Sync)> = match &self.shared.options.first_arg {
            Some(FirstArg::Value { value, .. }) => Some(value.as_ref()),
            Some(FirstArg::Endpoint) => Some(self as &(dyn Any + Send + Sync)),
            None => None,
        };

        let mut cursor = ArgCursor::new(args, prefix);
        let invocation = self.with_extensions(|| handler.bind(&mut cursor));
        match (cursor.finish(), invocation) {
            (Ok(()), Some(invocation)) => Ok(invocation),
            (Err(err), _) => Err(err.to_string()),
            (Ok(()), None) => Err("arguments could not be bound".to_string()),
        }
    }

    /// Handlers run off the serve thread so they can make calls of their own.
    fn spawn_handler(&self, job: impl FnOnce(&Endpoint) + Send + 'static) -> std::io::Result<()> {
        let endpoint = self.clone();
        thread::Builder::new()
            .name("msgrpc-handler".to_string())
            .spawn(move || job(&endpoint))
            .map(drop)
    }

    fn run(&self, method: &str, invocation: Invocation) -> std::result::Result<Value, HandlerError> {
        match catch_unwind(AssertUnwindSafe(|| self.with_extensions(invocation))) {
            Ok(outcome) => outcome,
            Err(_) => {
                self.shared
                    .diagnose(format!("handler for {method} panicked"));
                Err(HandlerError::msg("handler panicked"))
            }
        }
    }

    fn reply(&self, id: u32, outcome: std::result::Result<Value, HandlerError>) {
        let (error, result) = match outcome {
            Ok(result) => (Value::Nil, result),
            Err(err) => (self.with_extensions(|| err.to_wire()), Value::Nil),
        };
        if self.shared.is_closed() {
            debug!(id, "endpoint closed; dropping response");
            return;
        }
        if let Err(err) = self.shared.write(&Message::Response { id, error, result }) {
            self.shared.fail(err);
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Endpoint")
            .field("kind", &self.shared.kind)
            .field("closed", &state.closed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashSet;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc::Receiver;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use msgrpc_frame::{Buffer, FrameConfig, Window};

    use super::*;
    use crate::call::done_channel;
    use crate::error::ErrorValue;
    use crate::handler::{Prefixed, Rest};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// The raw far end of the connection, driven by the test.
    struct Script {
        reader: FrameReader<UnixStream>,
        writer: FrameWriter<UnixStream>,
    }

    impl Script {
        fn recv(&mut self) -> Message {
            self.reader
                .read_message()
                .expect("read from endpoint")
                .expect("endpoint closed the stream")
        }

        fn send(&mut self, msg: Message) {
            self.writer.write_message(&msg).expect("write to endpoint");
        }

        fn request(&mut self, id: u32, method: &str, args: Vec<Value>) -> (Value, Value) {
            self.send(Message::Request {
                id,
                method: method.to_string(),
                args,
            });
            match self.recv() {
                Message::Response {
                    id: got,
                    error,
                    result,
                } => {
                    assert_eq!(got, id);
                    (error, result)
                }
                other => panic!("expected response, got {other:?}"),
            }
        }

        fn respond(&mut self, id: u32, error: Value, result: Value) {
            self.send(Message::Response { id, error, result });
        }

        fn expect_request(&mut self) -> (u32, String, Vec<Value>) {
            match self.recv() {
                Message::Request { id, method, args } => (id, method, args),
                other => panic!("expected request, got {other:?}"),
            }
        }
    }

    fn connect(options: EndpointOptions) -> (Endpoint, Script) {
        let (left, right) = UnixStream::pair().unwrap();
        right.set_read_timeout(Some(TIMEOUT)).unwrap();
        let endpoint = Endpoint::new(DuplexStream::from_unix(left).unwrap(), options);
        let script = Script {
            reader: FrameReader::new(right.try_clone().unwrap()),
            writer: FrameWriter::new(right),
        };
        (endpoint, script)
    }

    fn serving(options: EndpointOptions) -> (Endpoint, Script, JoinHandle<Result<()>>) {
        let (endpoint, script) = connect(options);
        let server = endpoint.clone();
        let handle = thread::spawn(move || server.serve());
        (endpoint, script, handle)
    }

    fn diagnostics() -> (EndpointOptions, Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let options = EndpointOptions::new().with_diagnostics(move |msg| {
            let _ = lock(&tx).send(msg.to_string());
        });
        (options, rx)
    }

    fn strs(items: &[&str]) -> Vec<Value> {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    #[test]
    fn simple_call_wire_trace() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());

        let caller = {
            let endpoint = endpoint.clone();
            thread::spawn(move || endpoint.call::<i64>("add", (1, 2)))
        };

        assert_eq!(
            script.recv(),
            Message::Request {
                id: 1,
                method: "add".to_string(),
                args: vec![Value::from(1), Value::from(2)],
            }
        );
        script.respond(1, Value::Nil, Value::from(3));

        assert_eq!(caller.join().unwrap().unwrap(), 3);
        assert_eq!(endpoint.pending(), 0);
    }

    #[test]
    fn registered_handler_answers_requests() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());
        endpoint
            .register("add", |a: i64, b: i64| -> std::result::Result<i64, HandlerError> {
                Ok(a + b)
            })
            .unwrap();

        let (error, result) = script.request(1, "add", vec![Value::from(1), Value::from(2)]);
        assert_eq!(error, Value::Nil);
        assert_eq!(result, Value::from(3));
    }

    #[test]
    fn notifications_get_no_response() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());
        let (seen_tx, seen_rx) = mpsc::channel();
        let seen_tx = Mutex::new(seen_tx);
        endpoint
            .register("n1", move |s: String| {
                let _ = lock(&seen_tx).send(s);
            })
            .unwrap();
        endpoint
            .register("ping", || -> std::result::Result<&'static str, HandlerError> { Ok("pong") })
            .unwrap();

        script.send(Message::Notification {
            method: "n1".to_string(),
            args: strs(&["hello"]),
        });
        assert_eq!(seen_rx.recv_timeout(TIMEOUT).unwrap(), "hello");

        // The next message on the wire answers the ping, not the notification.
        let (error, result) = script.request(5, "ping", vec![]);
        assert_eq!((error, result), (Value::Nil, Value::from("pong")));
    }

    #[test]
    fn arity_is_tolerated() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());
        endpoint
            .register(
                "n",
                |a: String, b: String| -> std::result::Result<Vec<String>, HandlerError> {
                    Ok(vec![a, b])
                },
            )
            .unwrap();

        let (_, result) = script.request(1, "n", strs(&["a"]));
        assert_eq!(result, Value::Array(strs(&["a", ""])));

        let (_, result) = script.request(2, "n", strs(&["a", "b", "c"]));
        assert_eq!(result, Value::Array(strs(&["a", "b"])));
    }

    #[test]
    fn variadic_handler_gets_the_tail() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());
        endpoint
            .register(
                "v",
                |a: String, b: String, x: Rest<String>| -> std::result::Result<Vec<String>, HandlerError> {
                    let mut out = vec![a, b];
                    out.extend(x.into_inner());
                    Ok(out)
                },
            )
            .unwrap();

        let args = strs(&["a", "b", "x1", "x2", "x3"]);
        let (_, result) = script.request(1, "v", args.clone());
        assert_eq!(result, Value::Array(args));
    }

    #[test]
    fn unknown_method_is_answered_and_endpoint_stays_open() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());
        endpoint
            .register("ok", || -> std::result::Result<bool, HandlerError> { Ok(true) })
            .unwrap();

        let (error, result) = script.request(99, "missing", vec![]);
        assert_eq!(result, Value::Nil);
        let message = error.as_str().unwrap();
        assert!(message.contains("missing"), "{message}");

        assert!(!endpoint.is_closed());
        let (_, result) = script.request(100, "ok", vec![]);
        assert_eq!(result, Value::Boolean(true));
    }

    #[test]
    fn close_fails_pending_calls_and_serve_returns_cleanly() {
        let (endpoint, mut script, server) = serving(EndpointOptions::new());

        let pending = endpoint.go::<Value>("slow", ());
        let (_, method, _) = script.expect_request();
        assert_eq!(method, "slow");

        endpoint.close().unwrap();
        assert!(matches!(pending.wait(), Err(PeerError::Closed)));
        assert!(server.join().unwrap().is_ok());
        assert!(matches!(endpoint.close(), Err(PeerError::Closed)));
    }

    #[test]
    fn operations_after_close_fail() {
        let (endpoint, _script) = connect(EndpointOptions::new());
        endpoint.close().unwrap();

        assert!(matches!(endpoint.call::<Value>("m", ()), Err(PeerError::Closed)));
        assert!(matches!(endpoint.call_ignore("m", ()), Err(PeerError::Closed)));
        assert!(matches!(endpoint.notify("m", ()), Err(PeerError::Closed)));
        assert!(matches!(endpoint.register("m", || {}), Err(PeerError::Closed)));
    }

    #[test]
    fn close_completes_each_pending_call_once() {
        let (endpoint, mut script, server) = serving(EndpointOptions::new());
        let (done, rx) = done_channel(16);
        for _ in 0..10 {
            endpoint.go_into::<Value>("never", (), None, &done).unwrap();
        }
        for _ in 0..10 {
            script.expect_request();
        }
        assert_eq!(endpoint.pending(), 10);

        endpoint.close().unwrap();
        drop(done);

        let calls: Vec<Call> = rx.iter().collect();
        assert_eq!(calls.len(), 10);
        assert!(calls
            .iter()
            .all(|call| matches!(call.result, Err(PeerError::Closed))));
        let ids: HashSet<u32> = calls.iter().map(|call| call.id).collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(endpoint.pending(), 0);
        assert!(server.join().unwrap().is_ok());
    }

    #[test]
    fn concurrent_calls_get_unique_ids_and_their_own_results() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());

        let callers: Vec<_> = (0..16i64)
            .map(|n| {
                let endpoint = endpoint.clone();
                thread::spawn(move || endpoint.call::<i64>("echo", (n,)))
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..16 {
            let (id, method, args) = script.expect_request();
            assert_eq!(method, "echo");
            requests.push((id, args));
        }
        let ids: HashSet<u32> = requests.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 16);

        // Answer in reverse order; correlation is by id only.
        for (id, args) in requests.into_iter().rev() {
            script.respond(id, Value::Nil, args[0].clone());
        }

        for (n, caller) in callers.into_iter().enumerate() {
            assert_eq!(caller.join().unwrap().unwrap(), n as i64);
        }
    }

    #[test]
    fn binding_failure_replies_invalid_argument() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());
        endpoint
            .register("add", |a: i64, b: i64| -> std::result::Result<i64, HandlerError> {
                Ok(a + b)
            })
            .unwrap();

        let (error, result) = script.request(1, "add", vec![Value::from("x"), Value::from(1)]);
        assert_eq!(result, Value::Nil);
        assert!(error.as_str().unwrap().starts_with("invalid argument"));
        assert!(!endpoint.is_closed());
    }

    #[test]
    fn handler_errors_shape_the_error_slot() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());
        endpoint
            .register("text", || -> std::result::Result<(), std::io::Error> {
                Err(std::io::Error::other("nope"))
            })
            .unwrap();
        endpoint
            .register("structured", || -> std::result::Result<(), ErrorValue> {
                Err(ErrorValue(Value::Array(vec![Value::from(0), Value::from("E5")])))
            })
            .unwrap();
        endpoint
            .register("explodes", || -> std::result::Result<(), HandlerError> {
                panic!("handler bug")
            })
            .unwrap();
        endpoint.register("quiet", || {}).unwrap();

        assert_eq!(script.request(1, "text", vec![]).0, Value::from("nope"));
        assert_eq!(
            script.request(2, "structured", vec![]).0,
            Value::Array(vec![Value::from(0), Value::from("E5")])
        );
        assert_eq!(
            script.request(3, "explodes", vec![]).0,
            Value::from("handler panicked")
        );
        assert_eq!(script.request(4, "quiet", vec![]), (Value::Nil, Value::Nil));
    }

    #[test]
    fn response_errors_map_to_call_errors() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());

        let pending = endpoint.go::<Value>("bad", ());
        let (id, _, _) = script.expect_request();
        script.respond(
            id,
            Value::Array(vec![Value::from(0), Value::from("boom")]),
            Value::Nil,
        );
        let err = pending.wait().unwrap_err();
        assert!(matches!(err, PeerError::Exception { ref message, .. } if message == "boom"));
        assert_eq!(err.to_string(), "bad: exception: boom");

        let pending = endpoint.go::<Value>("odd", ());
        let (id, _, _) = script.expect_request();
        script.respond(id, Value::from(17), Value::Nil);
        assert!(matches!(pending.wait(), Err(PeerError::Remote { .. })));
    }

    #[test]
    fn result_conversion_error_fails_only_that_call() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());

        let pending = endpoint.go::<i64>("typed", ());
        let (id, _, _) = script.expect_request();
        script.respond(id, Value::Nil, Value::from("not a number"));
        assert!(matches!(pending.wait(), Err(PeerError::Convert { .. })));

        let pending = endpoint.go::<i64>("typed", ());
        let (id, _, _) = script.expect_request();
        script.respond(id, Value::Nil, Value::from(8));
        assert_eq!(pending.wait().unwrap(), 8);
    }

    #[test]
    fn unknown_response_id_is_reported_and_skipped() {
        let (options, diag) = diagnostics();
        let (endpoint, mut script, _server) = serving(options);

        script.respond(4242, Value::Nil, Value::from(1));
        let message = diag.recv_timeout(TIMEOUT).unwrap();
        assert!(message.contains("4242"), "{message}");

        let pending = endpoint.go::<i64>("after", ());
        let (id, _, _) = script.expect_request();
        script.respond(id, Value::Nil, Value::from(2));
        assert_eq!(pending.wait().unwrap(), 2);
    }

    #[test]
    fn unknown_notification_is_reported() {
        let (options, diag) = diagnostics();
        let (_endpoint, mut script, _server) = serving(options);

        script.send(Message::Notification {
            method: "nobody".to_string(),
            args: vec![Value::from(1)],
        });
        let message = diag.recv_timeout(TIMEOUT).unwrap();
        assert!(message.contains("nobody"), "{message}");
    }

    #[test]
    fn failed_write_closes_endpoint_and_fails_pending() {
        let options =
            EndpointOptions::new().with_frame_config(FrameConfig::default().with_max_frame_size(32));
        let (endpoint, mut script, _server) = serving(options);

        let slow = endpoint.go::<Value>("slow", ());
        script.expect_request();

        let big = endpoint.call::<Value>("big", (vec![0u8; 64],));
        assert!(matches!(big, Err(PeerError::Encode(_))));
        assert!(matches!(slow.wait(), Err(PeerError::Encode(_))));
        assert!(endpoint.is_closed());
    }

    #[test]
    fn unbuffered_done_is_rejected() {
        let (endpoint, _script) = connect(EndpointOptions::new());
        let (done, _rx) = done_channel(0);
        let result = endpoint.go_into::<Value>("m", (), None, &done);
        assert!(matches!(result, Err(PeerError::UnbufferedDone)));
        assert_eq!(endpoint.pending(), 0);
    }

    #[test]
    fn full_done_channel_drops_completion() {
        let (options, diag) = diagnostics();
        let (endpoint, mut script, _server) = serving(options);
        let (done, rx) = done_channel(1);
        let first = Reply::<i64>::new();

        endpoint
            .go_into("a", (), Some(first.clone()), &done)
            .unwrap();
        endpoint.go_into::<i64>("b", (), None, &done).unwrap();
        let (a, _, _) = script.expect_request();
        let (b, _, _) = script.expect_request();
        script.respond(a, Value::Nil, Value::from(1));
        script.respond(b, Value::Nil, Value::from(2));

        let message = diag.recv_timeout(TIMEOUT).unwrap();
        assert!(message.contains("full"), "{message}");

        let call = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(call.method, "a");
        assert!(call.result.is_ok());
        assert_eq!(first.take(), Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn serve_runs_once() {
        let (endpoint, _script, _server) = serving(EndpointOptions::new());
        // Wait until the first serve loop owns the reader.
        while lock(&endpoint.shared.reader).is_some() {
            thread::yield_now();
        }
        assert!(matches!(endpoint.serve(), Err(PeerError::AlreadyServing)));
    }

    #[test]
    fn protocol_violation_ends_serve_with_error() {
        let (endpoint, mut script, server) = serving(EndpointOptions::new());
        let pending = endpoint.go::<Value>("waiting", ());
        script.expect_request();

        // [5, nil, nil]
        script
            .writer
            .get_mut()
            .write_all(&[0x93, 0x05, 0xc0, 0xc0])
            .unwrap();

        let result = server.join().unwrap();
        assert!(matches!(result, Err(PeerError::Frame(FrameError::InvalidMessage(_)))));
        assert!(endpoint.is_closed());
        assert!(matches!(pending.wait(), Err(PeerError::Closed)));
    }

    #[test]
    fn handle_codes_follow_the_endpoint_registry() {
        let registry = ExtensionRegistry::new()
            .register_as::<Buffer>(10)
            .register_as::<Window>(11);
        let (endpoint, mut script, _server) =
            serving(EndpointOptions::new().with_extensions(registry));
        endpoint
            .register("next_buffer", |b: Buffer| -> std::result::Result<Buffer, HandlerError> {
                Ok(Buffer(b.0 + 1))
            })
            .unwrap();

        let (error, result) = script.request(1, "next_buffer", vec![Value::Ext(10, vec![0x03])]);
        assert_eq!(error, Value::Nil);
        assert_eq!(result, Value::Ext(10, vec![0xd2, 0, 0, 0, 4]));

        // The default buffer code means nothing to this endpoint.
        let (error, _) = script.request(2, "next_buffer", vec![Value::Ext(0, vec![0x03])]);
        assert!(error.as_str().unwrap().contains("invalid argument"), "{error}");

        let caller = {
            let endpoint = endpoint.clone();
            thread::spawn(move || endpoint.call::<Window>("buffer_window", (Buffer(7),)))
        };
        let (id, method, args) = script.expect_request();
        assert_eq!(method, "buffer_window");
        assert_eq!(args, vec![Value::Ext(10, vec![0xd2, 0, 0, 0, 7])]);
        script.respond(id, Value::Nil, Value::Ext(11, vec![0x02]));
        assert_eq!(caller.join().unwrap().unwrap(), Window(2));
    }

    #[test]
    fn deeply_nested_request_ends_serve_with_error() {
        let (endpoint, mut script, server) = serving(EndpointOptions::new());
        endpoint
            .register("m", |_: Value| -> std::result::Result<(), HandlerError> { Ok(()) })
            .unwrap();

        // [0, 1, "m", [[[...600 levels...]]]]
        let mut bytes = vec![0x94, 0x00, 0x01, 0xa1, b'm'];
        bytes.extend(std::iter::repeat(0x91).take(600));
        bytes.push(0xc0);
        script.writer.get_mut().write_all(&bytes).unwrap();

        let result = server.join().unwrap();
        assert!(matches!(result, Err(PeerError::Frame(FrameError::Malformed(_)))));
        assert!(endpoint.is_closed());
    }

    #[test]
    fn peer_eof_closes_cleanly() {
        let (endpoint, script, server) = serving(EndpointOptions::new());
        drop(script);
        assert!(server.join().unwrap().is_ok());
        assert!(endpoint.is_closed());
    }

    #[test]
    fn first_argument_is_prepended() {
        let options = EndpointOptions::new().with_first_arg(String::from("ctx"));
        let (endpoint, mut script, _server) = serving(options);
        endpoint
            .register(
                "greet",
                |Prefixed(ctx): Prefixed<String>, who: String| -> std::result::Result<String, HandlerError> {
                    Ok(format!("{ctx}:{who}"))
                },
            )
            .unwrap();

        let (_, result) = script.request(1, "greet", strs(&["bob"]));
        assert_eq!(result, Value::from("ctx:bob"));
    }

    #[test]
    fn registration_checks_first_argument() {
        let (endpoint, _script) = connect(EndpointOptions::new().with_first_arg(7i64));

        let err = endpoint.register("plain", |_a: i64| {}).unwrap_err();
        assert!(matches!(err, PeerError::Registration { .. }));

        let err = endpoint
            .register("wrong", |_ctx: Prefixed<String>| {})
            .unwrap_err();
        assert!(matches!(err, PeerError::Registration { .. }));

        endpoint
            .register("right", |_ctx: Prefixed<i64>, _a: Rest<Value>| {})
            .unwrap();
    }

    #[test]
    fn handlers_can_call_back_through_the_endpoint() {
        let (left, right) = UnixStream::pair().unwrap();
        let host = Endpoint::new(
            DuplexStream::from_unix(left).unwrap(),
            EndpointOptions::new().with_endpoint_first_arg(),
        );
        let editor = Endpoint::new(DuplexStream::from_unix(right).unwrap(), EndpointOptions::new());

        editor
            .register("double", |n: i64| -> std::result::Result<i64, HandlerError> { Ok(n * 2) })
            .unwrap();
        host.register(
            "quadruple",
            |Prefixed(host): Prefixed<Endpoint>, n: i64| -> std::result::Result<i64, HandlerError> {
                let twice: i64 = host.call("double", (n,))?;
                Ok(host.call::<i64>("double", (twice,))?)
            },
        )
        .unwrap();

        let host_server = {
            let host = host.clone();
            thread::spawn(move || host.serve())
        };
        let editor_server = {
            let editor = editor.clone();
            thread::spawn(move || editor.serve())
        };

        assert_eq!(editor.call::<i64>("quadruple", (5,)).unwrap(), 20);

        host.close().unwrap();
        assert!(host_server.join().unwrap().is_ok());
        assert!(editor_server.join().unwrap().is_ok());
        assert!(editor.is_closed());
    }

    #[test]
    fn weak_handle_does_not_keep_endpoint_alive() {
        let (endpoint, _script) = connect(EndpointOptions::new());
        let weak = endpoint.downgrade();
        assert!(weak.upgrade().is_some());
        drop(endpoint);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn reregistering_replaces_handler() {
        let (endpoint, mut script, _server) = serving(EndpointOptions::new());
        endpoint
            .register("v", || -> std::result::Result<i64, HandlerError> { Ok(1) })
            .unwrap();
        endpoint
            .register("v", || -> std::result::Result<i64, HandlerError> { Ok(2) })
            .unwrap();
        assert_eq!(script.request(1, "v", vec![]).1, Value::from(2));
    }

    #[test]
    fn ids_wrap_and_skip_pending() {
        let (tx, _rx) = mpsc::sync_channel(1);
        let mut state = State {
            closed: false,
            next_id: MAX_ID,
            pending: HashMap::new(),
        };
        state.pending.insert(
            1,
            PendingEntry {
                method: "held".to_string(),
                reply: None,
                done: tx,
            },
        );

        assert_eq!(state.allocate_id(), MAX_ID);
        assert_eq!(state.allocate_id(), 2);
        assert_eq!(state.allocate_id(), 3);
    }
}

//! Worker bridge: token-correlated calls across a message boundary.
//!
//! A bridge without a transport runs registered functions locally, one
//! scheduler tick later. A bridge with a transport serializes each call
//! into an [`Envelope`], sends it, and settles the caller's promise when a
//! response bearing the same token comes back. Responses with unknown
//! tokens belong to other calls sharing the channel and are dropped.
//!
//! The remote side is a [`WorkerEndpoint`]; [`spawn_island`] runs one on a
//! dedicated thread with its own [`Runtime`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::thread::{self, JoinHandle};

use hashbrown::HashMap;
use lode_runtime::{EventSource, Promise, Resolver, Runtime, RuntimeError, RuntimeResult, Value};

use crate::envelope::{decode_error, decode_value, encode_error, encode_value, Envelope, EnvelopeKind, WireValue};
use crate::transport::{channel_pair, ChannelTransport, Message, Transport};

/// A function callable through the bridge.
pub type WorkerFn = Rc<dyn Fn(&Runtime, Vec<Value>) -> Promise>;

/// Origin stamped on messages sent by the caller side of an island.
pub const MAIN_ORIGIN: &str = "main";
/// Origin stamped on messages sent by an island worker.
pub const WORKER_ORIGIN: &str = "worker";

struct PendingCall {
    method: String,
    resolver: Resolver,
}

struct BridgeInner {
    rt: Runtime,
    methods: RefCell<HashMap<String, WorkerFn>>,
    remote: Option<Box<dyn Transport>>,
    pending: RefCell<HashMap<String, PendingCall>>,
    next_token: Cell<u64>,
    closed: Cell<bool>,
}

#[derive(Clone)]
pub struct WorkerBridge(Rc<BridgeInner>);

impl WorkerBridge {
    /// Bridge that executes every call locally.
    pub fn local(rt: &Runtime) -> Self {
        WorkerBridge(Rc::new(Self::inner(rt, None)))
    }

    /// Bridge that forwards calls over `transport`. The bridge registers
    /// itself as an event source so `block_on` waits for responses.
    pub fn remote(rt: &Runtime, transport: impl Transport + 'static) -> Self {
        let inner = Rc::new(Self::inner(rt, Some(Box::new(transport))));
        let weak = Rc::downgrade(&inner);
        let source: Weak<dyn EventSource> = weak;
        rt.scheduler().add_source(source);
        WorkerBridge(inner)
    }

    fn inner(rt: &Runtime, remote: Option<Box<dyn Transport>>) -> BridgeInner {
        BridgeInner {
            rt: rt.clone(),
            methods: RefCell::new(HashMap::new()),
            remote,
            pending: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            closed: Cell::new(false),
        }
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        self.0.remote.is_some()
    }

    /// Calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.0.pending.borrow().len()
    }

    pub fn register(&self, method: &str, f: impl Fn(&Runtime, Vec<Value>) -> Promise + 'static) {
        self.0.methods.borrow_mut().insert(method.to_string(), Rc::new(f));
    }

    /// Register `f` under `method` and return a proxy that calls it.
    pub fn wrap(&self, method: &str, f: impl Fn(&Runtime, Vec<Value>) -> Promise + 'static) -> WorkerProxy {
        self.register(method, f);
        WorkerProxy {
            bridge: self.clone(),
            method: method.to_string(),
        }
    }

    /// Invoke `method`. Never settles within the caller's own stack frame.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Promise {
        match &self.0.remote {
            Some(transport) => self.0.call_remote(transport.as_ref(), method, args),
            None => self.0.call_local(method, args),
        }
    }

    /// Feed one inbound message to the bridge. Returns true when it
    /// settled a pending call.
    pub fn handle_message(&self, msg: Message) -> bool {
        self.0.handle_message(msg)
    }
}

impl BridgeInner {
    fn call_local(&self, method: &str, args: Vec<Value>) -> Promise {
        let sched = self.rt.scheduler();
        let f = match self.methods.borrow().get(method) {
            Some(f) => f.clone(),
            None => {
                return Promise::rejected(
                    sched,
                    RuntimeError::invalid_state(format!("unknown worker method `{}`", method)),
                )
            }
        };
        let (promise, resolver) = Promise::pending(sched);
        let rt = self.rt.clone();
        let method = method.to_string();
        sched.defer(move || {
            tracing::debug!(method = %method, "local worker call");
            resolver.adopt(f(&rt, args));
        });
        promise
    }

    fn call_remote(&self, transport: &dyn Transport, method: &str, args: Vec<Value>) -> Promise {
        let sched = self.rt.scheduler();
        if self.closed.get() {
            return Promise::rejected(sched, RuntimeError::Transport("worker channel closed".into()));
        }

        let n = self.next_token.get();
        self.next_token.set(n + 1);
        let token = format!("{}-{}", self.rt.config().worker.token_prefix, n);

        let sent = args
            .iter()
            .map(|a| encode_value(&self.rt, a))
            .collect::<RuntimeResult<Vec<_>>>()
            .and_then(|arguments| Envelope::request(token.clone(), method, arguments).to_text())
            .and_then(|text| transport.send(text));
        if let Err(e) = sent {
            return Promise::rejected(sched, e);
        }

        tracing::debug!(token = %token, method = %method, "worker call sent");
        let (promise, resolver) = Promise::pending(sched);
        self.pending.borrow_mut().insert(
            token,
            PendingCall {
                method: method.to_string(),
                resolver,
            },
        );
        promise
    }

    fn handle_message(&self, msg: Message) -> bool {
        if !is_trusted(&self.rt, &msg) {
            return false;
        }

        let env = match Envelope::from_text(&msg.body) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed envelope");
                return false;
            }
        };
        let kind = match env.kind {
            Some(kind) => kind,
            None => {
                tracing::debug!(token = %env.token, "ignoring request on caller side");
                return false;
            }
        };

        let call = {
            let mut pending = self.pending.borrow_mut();
            let matches = pending
                .get(&env.token)
                .map_or(false, |call| call.method == env.method);
            if matches {
                pending.remove(&env.token)
            } else {
                None
            }
        };
        let call = match call {
            Some(call) => call,
            None => {
                tracing::debug!(token = %env.token, "ignoring response with unknown token");
                return false;
            }
        };

        let value = env.value.unwrap_or(WireValue {
            v: serde_json::Value::Null,
            t: None,
        });
        match kind {
            EnvelopeKind::Resolve => match decode_value(&self.rt, value) {
                Ok(v) => call.resolver.resolve(v),
                Err(e) => call.resolver.reject(e),
            },
            EnvelopeKind::Reject => call.resolver.reject(decode_error(&self.rt, value)),
        };
        true
    }

    fn close(&self, reason: &RuntimeError) -> usize {
        self.closed.set(true);
        let drained: Vec<(String, PendingCall)> = self.pending.borrow_mut().drain().collect();
        for (token, call) in &drained {
            tracing::debug!(token = %token, "rejecting call on closed channel");
            call.resolver.reject(reason.clone());
        }
        drained.len()
    }
}

impl EventSource for BridgeInner {
    fn has_pending(&self) -> bool {
        !self.closed.get() && !self.pending.borrow().is_empty()
    }

    fn pump(&self, block: bool) -> RuntimeResult<usize> {
        let transport = match &self.remote {
            Some(t) => t,
            None => return Ok(0),
        };
        let mut delivered = 0;
        // Dropped messages don't count; keep waiting for one that settles.
        while block && delivered == 0 && self.has_pending() {
            match transport.recv() {
                Ok(msg) => delivered += usize::from(self.handle_message(msg)),
                Err(e) => return Ok(self.close(&e)),
            }
        }
        loop {
            match transport.try_recv() {
                Ok(Some(msg)) => delivered += usize::from(self.handle_message(msg)),
                Ok(None) => return Ok(delivered),
                Err(e) => return Ok(delivered + self.close(&e)),
            }
        }
    }
}

/// Callable handle for one registered method.
#[derive(Clone)]
pub struct WorkerProxy {
    bridge: WorkerBridge,
    method: String,
}

impl WorkerProxy {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn call(&self, args: Vec<Value>) -> Promise {
        self.bridge.call(&self.method, args)
    }
}

// =============================================================================
// Remote side
// =============================================================================

/// Messages from an origin other than the configured trusted one are
/// dropped on both sides of the bridge.
fn is_trusted(rt: &Runtime, msg: &Message) -> bool {
    match &rt.config().worker.trusted_origin {
        Some(trusted) if msg.origin.as_deref() != Some(trusted.as_str()) => {
            tracing::warn!(origin = ?msg.origin, "dropping message from untrusted origin");
            false
        }
        _ => true,
    }
}

/// Dispatches inbound requests to registered functions and answers each
/// with exactly one response envelope.
pub struct WorkerEndpoint {
    rt: Runtime,
    methods: RefCell<HashMap<String, WorkerFn>>,
    transport: Box<dyn Transport>,
}

impl WorkerEndpoint {
    pub fn new(rt: Runtime, transport: impl Transport + 'static) -> Self {
        Self {
            rt,
            methods: RefCell::new(HashMap::new()),
            transport: Box::new(transport),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn register(&self, method: &str, f: impl Fn(&Runtime, Vec<Value>) -> Promise + 'static) {
        self.methods.borrow_mut().insert(method.to_string(), Rc::new(f));
    }

    /// Handle one request message. Malformed messages, responses and
    /// messages from untrusted origins are dropped without reply.
    pub fn handle(&self, msg: Message) -> RuntimeResult<()> {
        if !is_trusted(&self.rt, &msg) {
            return Ok(());
        }
        let env = match Envelope::from_text(&msg.body) {
            Ok(env) if !env.is_response() => env,
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "worker dropping malformed envelope");
                return Ok(());
            }
        };
        tracing::debug!(token = %env.token, method = %env.method, "worker dispatch");

        let outcome = self.dispatch(&env.method, env.arguments);
        let (kind, value) = match outcome {
            Ok(v) => match encode_value(&self.rt, &v) {
                Ok(wire) => (EnvelopeKind::Resolve, wire),
                Err(e) => (EnvelopeKind::Reject, encode_error(&self.rt, &e)),
            },
            Err(e) => (EnvelopeKind::Reject, encode_error(&self.rt, &e)),
        };
        let text = Envelope::response(env.token, env.method, kind, value).to_text()?;
        self.transport.send(text)
    }

    fn dispatch(&self, method: &str, arguments: Vec<WireValue>) -> RuntimeResult<Value> {
        let f = self
            .methods
            .borrow()
            .get(method)
            .cloned()
            .ok_or_else(|| RuntimeError::invalid_state(format!("unknown worker method `{}`", method)))?;
        let args = arguments
            .into_iter()
            .map(|a| decode_value(&self.rt, a))
            .collect::<RuntimeResult<Vec<_>>>()?;
        let promise = f(&self.rt, args);
        self.rt.block_on(&promise)
    }

    /// Serve requests until the peer goes away, either while waiting for
    /// the next request or while a reply is being sent.
    pub fn serve(&self) -> RuntimeResult<()> {
        loop {
            let handled = self.transport.recv().and_then(|msg| self.handle(msg));
            match handled {
                Ok(()) => {}
                Err(RuntimeError::Transport(reason)) => {
                    tracing::debug!(%reason, "worker peer gone");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A worker running on its own thread. Dropping the caller's transport
/// ends the worker's serve loop; `join` then collects its outcome. An
/// island dropped without `join` is detached.
pub struct Island {
    join_handle: Option<JoinHandle<Result<(), String>>>,
}

impl Island {
    pub fn join(mut self) -> Result<(), String> {
        match self.join_handle.take() {
            Some(handle) => handle.join().map_err(|_| "island thread panicked".to_string())?,
            None => Ok(()),
        }
    }
}

/// Spawn a worker thread with a fresh runtime. `setup` registers the
/// worker's methods. Returns the caller's end of the channel.
pub fn spawn_island<F>(setup: F) -> (ChannelTransport, Island)
where
    F: FnOnce(&WorkerEndpoint) + Send + 'static,
{
    let (main, worker) = channel_pair(Some(MAIN_ORIGIN), Some(WORKER_ORIGIN));
    let join_handle = thread::spawn(move || {
        let endpoint = WorkerEndpoint::new(Runtime::new(), worker);
        setup(&endpoint);
        endpoint.serve().map_err(|e| e.to_string())
    });
    (
        main,
        Island {
            join_handle: Some(join_handle),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(rt: &Runtime, args: Vec<Value>) -> Promise {
        let n = args.first().and_then(Value::as_int).unwrap_or(0);
        Promise::resolved(rt.scheduler(), Value::Int(n * 2))
    }

    #[test]
    fn test_local_call_is_deferred() {
        let rt = Runtime::new();
        let bridge = WorkerBridge::local(&rt);
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let proxy = bridge.wrap("double", move |rt, args| {
            l.borrow_mut().push("worker");
            double(rt, args)
        });

        let p = proxy.call(vec![Value::Int(4)]);
        log.borrow_mut().push("caller");
        assert!(!p.is_settled());
        assert_eq!(rt.block_on(&p).unwrap().as_int(), Some(8));
        assert_eq!(*log.borrow(), vec!["caller", "worker"]);
    }

    #[test]
    fn test_local_unknown_method_rejects() {
        let rt = Runtime::new();
        let bridge = WorkerBridge::local(&rt);
        assert!(matches!(
            rt.block_on(&bridge.call("missing", vec![])),
            Err(RuntimeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_endpoint_answers_unknown_method_with_reject() {
        let (caller, worker) = channel_pair(Some(MAIN_ORIGIN), Some(WORKER_ORIGIN));
        let endpoint = WorkerEndpoint::new(Runtime::new(), worker);
        caller
            .send(Envelope::request("t-1", "nope", vec![]).to_text().unwrap())
            .unwrap();
        endpoint.handle(worker_recv(&endpoint)).unwrap();
        let reply = Envelope::from_text(&caller.recv().unwrap().body).unwrap();
        assert_eq!(reply.token, "t-1");
        assert_eq!(reply.kind, Some(EnvelopeKind::Reject));
    }

    #[test]
    fn test_serve_ends_cleanly_when_caller_hangs_up_before_reply() {
        let (caller, worker) = channel_pair(Some(MAIN_ORIGIN), Some(WORKER_ORIGIN));
        let endpoint = WorkerEndpoint::new(Runtime::new(), worker);
        endpoint.register("double", double);
        caller
            .send(Envelope::request("t-1", "double", vec![]).to_text().unwrap())
            .unwrap();
        drop(caller);
        assert!(endpoint.serve().is_ok());
    }

    fn worker_recv(endpoint: &WorkerEndpoint) -> Message {
        endpoint.transport.recv().unwrap()
    }
}

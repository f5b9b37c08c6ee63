//! Single-assignment completion cells.
//!
//! A `Promise` settles at most once, with a value or an error. Callbacks may
//! be attached before or after settlement; either way they run on a later
//! scheduler tick, never inside the call that attached them or the call that
//! settled the promise.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::{RuntimeError, RuntimeResult};
use crate::value::Value;

use super::scheduler::Scheduler;

pub type Settlement = Result<Value, RuntimeError>;

type Callback = Box<dyn FnOnce(Settlement)>;

enum State {
    Pending(Vec<Callback>),
    Settled(Settlement),
}

struct PromiseInner {
    id: u64,
    sched: Scheduler,
    state: RefCell<State>,
}

#[derive(Clone)]
pub struct Promise(Rc<PromiseInner>);

/// Settling side of a pending promise. Clones share the same cell; only the
/// first settlement wins.
#[derive(Clone)]
pub struct Resolver(Promise);

/// A value that is either available now or still being computed.
pub enum Maybe {
    Ready(Value),
    Pending(Promise),
}

impl From<Value> for Maybe {
    fn from(v: Value) -> Self {
        Maybe::Ready(v)
    }
}

impl From<Promise> for Maybe {
    fn from(p: Promise) -> Self {
        Maybe::Pending(p)
    }
}

impl Resolver {
    /// Settle the promise. Returns false if it was already settled.
    pub fn settle(&self, result: Settlement) -> bool {
        let inner = &(self.0).0;
        let callbacks = {
            let mut state = inner.state.borrow_mut();
            if let State::Settled(_) = *state {
                return false;
            }
            match std::mem::replace(&mut *state, State::Settled(result.clone())) {
                State::Pending(cbs) => cbs,
                State::Settled(_) => Vec::new(),
            }
        };
        tracing::trace!(
            promise = inner.id,
            ok = result.is_ok(),
            callbacks = callbacks.len(),
            "promise settled"
        );
        for cb in callbacks {
            let result = result.clone();
            inner.sched.defer(move || cb(result));
        }
        true
    }

    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: RuntimeError) -> bool {
        self.settle(Err(error))
    }

    /// Settle with a ready value, or follow a pending promise.
    pub fn adopt(&self, value: impl Into<Maybe>) {
        match value.into() {
            Maybe::Ready(v) => {
                self.resolve(v);
            }
            Maybe::Pending(p) => {
                let this = self.clone();
                p.on_settled(move |s| {
                    this.settle(s);
                });
            }
        }
    }

    pub fn promise(&self) -> &Promise {
        &self.0
    }
}

impl Promise {
    /// A pending promise and its resolver.
    pub fn pending(sched: &Scheduler) -> (Promise, Resolver) {
        let p = Promise(Rc::new(PromiseInner {
            id: sched.next_id(),
            sched: sched.clone(),
            state: RefCell::new(State::Pending(Vec::new())),
        }));
        let r = Resolver(p.clone());
        (p, r)
    }

    /// Run `executor` synchronously with the resolver of a new promise.
    pub fn new(sched: &Scheduler, executor: impl FnOnce(Resolver)) -> Promise {
        let (p, r) = Self::pending(sched);
        executor(r);
        p
    }

    pub fn resolved(sched: &Scheduler, value: Value) -> Promise {
        Self::from_result(sched, Ok(value))
    }

    pub fn rejected(sched: &Scheduler, error: RuntimeError) -> Promise {
        Self::from_result(sched, Err(error))
    }

    pub fn from_result(sched: &Scheduler, result: RuntimeResult<Value>) -> Promise {
        Promise(Rc::new(PromiseInner {
            id: sched.next_id(),
            sched: sched.clone(),
            state: RefCell::new(State::Settled(result)),
        }))
    }

    /// Lift a ready value or a pending promise into a promise. A ready value
    /// settles immediately; a promise is returned as is.
    pub fn resolve(sched: &Scheduler, value: impl Into<Maybe>) -> Promise {
        match value.into() {
            Maybe::Ready(v) => Self::resolved(sched, v),
            Maybe::Pending(p) => p,
        }
    }

    /// Resolve with the list of all results, in input order, once every input
    /// has resolved. Rejects with the first rejection.
    pub fn all(sched: &Scheduler, promises: Vec<Promise>) -> Promise {
        if promises.is_empty() {
            return Self::resolved(sched, Value::list(Vec::new()));
        }
        let (out, resolver) = Self::pending(sched);
        let results = Rc::new(RefCell::new(vec![Value::Null; promises.len()]));
        let remaining = Rc::new(Cell::new(promises.len()));
        for (i, p) in promises.into_iter().enumerate() {
            let results = results.clone();
            let remaining = remaining.clone();
            let resolver = resolver.clone();
            p.on_settled(move |s| match s {
                Ok(v) => {
                    results.borrow_mut()[i] = v;
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let items = std::mem::take(&mut *results.borrow_mut());
                        resolver.resolve(Value::list(items));
                    }
                }
                Err(e) => {
                    resolver.reject(e);
                }
            });
        }
        out
    }

    /// Lowering of `||` (`decisive = true`) and `&&` (`decisive = false`).
    ///
    /// When `left` already decides the result it is returned and `rhs` is
    /// never called.
    pub fn short_circuit(
        sched: &Scheduler,
        left: bool,
        decisive: bool,
        rhs: impl FnOnce() -> Promise,
    ) -> Promise {
        if left == decisive {
            Self::resolved(sched, Value::Bool(left))
        } else {
            rhs()
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.0.sched
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.0.state.borrow(), State::Settled(_))
    }

    /// The settlement, if any. Does not consume it.
    pub fn settlement(&self) -> Option<Settlement> {
        match &*self.0.state.borrow() {
            State::Settled(s) => Some(s.clone()),
            State::Pending(_) => None,
        }
    }

    /// Attach a callback. It runs on a later tick even if the promise is
    /// already settled.
    pub fn on_settled(&self, f: impl FnOnce(Settlement) + 'static) {
        let mut state = self.0.state.borrow_mut();
        match &mut *state {
            State::Pending(cbs) => cbs.push(Box::new(f)),
            State::Settled(s) => {
                let s = s.clone();
                self.0.sched.defer(move || f(s));
            }
        }
    }

    /// Chain on success. Errors pass through unchanged.
    pub fn then(&self, f: impl FnOnce(Value) -> RuntimeResult<Maybe> + 'static) -> Promise {
        let (out, resolver) = Self::pending(&self.0.sched);
        self.on_settled(move |s| match s.and_then(f) {
            Ok(next) => resolver.adopt(next),
            Err(e) => {
                resolver.reject(e);
            }
        });
        out
    }

    /// Recover from a rejection. Values pass through unchanged.
    pub fn catch(&self, f: impl FnOnce(RuntimeError) -> RuntimeResult<Maybe> + 'static) -> Promise {
        let (out, resolver) = Self::pending(&self.0.sched);
        self.on_settled(move |s| match s {
            Ok(v) => {
                resolver.resolve(v);
            }
            Err(e) => match f(e) {
                Ok(next) => resolver.adopt(next),
                Err(e) => {
                    resolver.reject(e);
                }
            },
        });
        out
    }

    pub fn map(&self, f: impl FnOnce(Value) -> Value + 'static) -> Promise {
        self.then(move |v| Ok(Maybe::Ready(f(v))))
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.0.state.borrow() {
            State::Pending(cbs) => format!("pending({} callbacks)", cbs.len()),
            State::Settled(Ok(v)) => format!("resolved({:?})", v),
            State::Settled(Err(e)) => format!("rejected({})", e),
        };
        write!(f, "Promise#{} {}", self.0.id, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(v: &Value) -> Vec<i64> {
        match v {
            Value::List(items) => items.borrow().iter().filter_map(|x| x.as_int()).collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_settle_once() {
        let sched = Scheduler::default();
        let (p, r) = Promise::pending(&sched);
        assert!(r.resolve(Value::Int(1)));
        assert!(!r.resolve(Value::Int(2)));
        assert!(!r.reject(RuntimeError::NullAccess));
        assert_eq!(p.settlement().unwrap().unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_callbacks_are_deferred() {
        let sched = Scheduler::default();
        let p = Promise::resolved(&sched, Value::Int(1));
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        p.on_settled(move |_| h.set(true));
        assert!(!hit.get());
        sched.run_until_idle().unwrap();
        assert!(hit.get());

        let (p, r) = Promise::pending(&sched);
        let h = Rc::new(Cell::new(0));
        let h2 = h.clone();
        p.on_settled(move |_| h2.set(1));
        r.resolve(Value::Null);
        assert_eq!(h.get(), 0);
        sched.run_until_idle().unwrap();
        assert_eq!(h.get(), 1);
    }

    #[test]
    fn test_all_preserves_input_order() {
        let sched = Scheduler::default();
        let (p1, r1) = Promise::pending(&sched);
        let (p2, r2) = Promise::pending(&sched);
        let p3 = Promise::resolved(&sched, Value::Int(3));
        let all = Promise::all(&sched, vec![p1, p2, p3]);
        r2.resolve(Value::Int(2));
        sched.run_until_idle().unwrap();
        assert!(!all.is_settled());
        r1.resolve(Value::Int(1));
        let v = sched.block_on(&all).unwrap();
        assert_eq!(ints(&v), vec![1, 2, 3]);
    }

    #[test]
    fn test_all_rejects_on_first_failure() {
        let sched = Scheduler::default();
        let (p1, _r1) = Promise::pending(&sched);
        let p2 = Promise::rejected(&sched, RuntimeError::Transport("closed".into()));
        let all = Promise::all(&sched, vec![p1, p2]);
        let err = sched.block_on(&all).unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(_)));
    }

    #[test]
    fn test_short_circuit_skips_rhs() {
        let sched = Scheduler::default();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let s = sched.clone();
        let p = Promise::short_circuit(&sched, true, true, move || {
            c.set(c.get() + 1);
            Promise::resolved(&s, Value::Bool(false))
        });
        assert_eq!(sched.block_on(&p).unwrap().as_bool(), Some(true));
        assert_eq!(calls.get(), 0);

        let s = sched.clone();
        let p = Promise::short_circuit(&sched, true, false, move || {
            Promise::resolved(&s, Value::Bool(false))
        });
        assert_eq!(sched.block_on(&p).unwrap().as_bool(), Some(false));
    }

    #[test]
    fn test_then_and_catch() {
        let sched = Scheduler::default();
        let p = Promise::resolved(&sched, Value::Int(20))
            .map(|v| Value::Int(v.as_int().unwrap_or(0) + 1))
            .then(|_| Err(RuntimeError::NullAccess))
            .catch(|e| {
                assert!(matches!(e, RuntimeError::NullAccess));
                Ok(Maybe::Ready(Value::str("recovered")))
            });
        assert_eq!(sched.block_on(&p).unwrap().as_str(), Some("recovered"));
    }

    #[test]
    fn test_resolve_adopts_pending() {
        let sched = Scheduler::default();
        let (inner, r) = Promise::pending(&sched);
        let outer = Promise::resolve(&sched, inner.clone());
        assert_eq!(outer.id(), inner.id());
        let (chained, cr) = Promise::pending(&sched);
        cr.adopt(inner);
        r.resolve(Value::Int(5));
        assert_eq!(sched.block_on(&chained).unwrap().as_int(), Some(5));
    }
}

//! Pull-based streams (generators).
//!
//! A stream body is a state machine like a continuation body, with extra
//! steps to yield a value or to delegate to a nested stream. `Next` runs the
//! body to its next yield or completion and produces `(value, more)`; once
//! `more` is false every later `Next` returns `(null, false)` again.
//!
//! Synchronous streams answer `Next` inline. Asynchronous streams answer
//! with a promise and may await between yields. While a delegate is active,
//! `Next` drains it first; the consumer sees the flattened sequence.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{RuntimeError, RuntimeResult};
use crate::sched::{Continuation, Frame, Promise, Resolver, Scheduler, Step};
use crate::value::Value;

pub enum GenStep {
    Goto(u32),
    /// Produce a value; the next `Next` resumes at the given state.
    Yield(Value, u32),
    /// Forward `Next` to a nested stream until it is exhausted, then resume
    /// at the given state.
    YieldFrom(Stream, u32),
    /// Asynchronous streams only.
    Await {
        promise: Promise,
        resume: u32,
        catch: Option<u32>,
    },
    Done,
}

type GenBody = Box<dyn FnMut(&mut Frame) -> RuntimeResult<GenStep>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Exhausted,
    Failed,
}

struct StreamCore {
    sched: Scheduler,
    flavor: Flavor,
    /// Taken out while the body runs.
    body: RefCell<Option<GenBody>>,
    frame: RefCell<Frame>,
    delegate: RefCell<Option<Stream>>,
    status: Cell<Status>,
    in_flight: Cell<bool>,
}

#[derive(Clone)]
pub struct Stream(Rc<StreamCore>);

/// Encode a `Next` result as a two element list, the shape async `Next`
/// resolves with.
pub fn pack_next(value: Value, more: bool) -> Value {
    Value::list(vec![value, Value::Bool(more)])
}

pub fn unpack_next(packed: &Value) -> RuntimeResult<(Value, bool)> {
    if let Value::List(items) = packed {
        let items = items.borrow();
        if let [value, Value::Bool(more)] = items.as_slice() {
            return Ok((value.clone(), *more));
        }
    }
    Err(RuntimeError::invalid_state(format!(
        "malformed stream result {:?}",
        packed
    )))
}

impl Stream {
    fn with_body(sched: &Scheduler, flavor: Flavor, body: GenBody) -> Stream {
        Stream(Rc::new(StreamCore {
            sched: sched.clone(),
            flavor,
            body: RefCell::new(Some(body)),
            frame: RefCell::new(Frame::default()),
            delegate: RefCell::new(None),
            status: Cell::new(Status::Active),
            in_flight: Cell::new(false),
        }))
    }

    pub fn new_sync(
        sched: &Scheduler,
        body: impl FnMut(&mut Frame) -> RuntimeResult<GenStep> + 'static,
    ) -> Stream {
        Self::with_body(sched, Flavor::Sync, Box::new(body))
    }

    pub fn new_async(
        sched: &Scheduler,
        body: impl FnMut(&mut Frame) -> RuntimeResult<GenStep> + 'static,
    ) -> Stream {
        Self::with_body(sched, Flavor::Async, Box::new(body))
    }

    /// Synchronous stream over a fixed list.
    pub fn from_values(sched: &Scheduler, values: Vec<Value>) -> Stream {
        let mut iter = values.into_iter();
        Self::new_sync(sched, move |_| {
            Ok(match iter.next() {
                Some(v) => GenStep::Yield(v, 0),
                None => GenStep::Done,
            })
        })
    }

    pub fn empty(sched: &Scheduler) -> Stream {
        Self::new_sync(sched, |_| Ok(GenStep::Done))
    }

    pub fn flavor(&self) -> Flavor {
        self.0.flavor
    }

    pub fn is_exhausted(&self) -> bool {
        self.0.status.get() == Status::Exhausted
    }

    fn check_status(&self) -> RuntimeResult<bool> {
        match self.0.status.get() {
            Status::Active => Ok(true),
            Status::Exhausted => Ok(false),
            Status::Failed => Err(RuntimeError::invalid_state("stream failed")),
        }
    }

    /// Run the body for one step. The body is taken out for the duration so
    /// a re-entrant call fails instead of aliasing it.
    fn step(&self) -> RuntimeResult<GenStep> {
        let mut body = self
            .0
            .body
            .borrow_mut()
            .take()
            .ok_or_else(|| RuntimeError::invalid_state("stream re-entered"))?;
        let step = {
            let mut frame = self.0.frame.borrow_mut();
            body(&mut *frame)
        };
        *self.0.body.borrow_mut() = Some(body);
        step
    }

    fn exhaust(&self) {
        self.0.status.set(Status::Exhausted);
        self.0.body.borrow_mut().take();
        self.0.delegate.borrow_mut().take();
    }

    fn fail(&self, e: RuntimeError) -> RuntimeError {
        self.0.status.set(Status::Failed);
        self.0.body.borrow_mut().take();
        self.0.delegate.borrow_mut().take();
        e
    }

    fn set_delegate(&self, nested: Stream, resume: u32) {
        tracing::debug!(flavor = ?nested.flavor(), "stream delegating");
        self.0.frame.borrow_mut().state = resume;
        *self.0.delegate.borrow_mut() = Some(nested);
    }

    // =========================================================================
    // Synchronous Next
    // =========================================================================

    /// `Next` of a synchronous stream. Errors raised by the body are returned
    /// and leave the stream failed.
    pub fn next_sync(&self) -> RuntimeResult<(Value, bool)> {
        if self.0.flavor == Flavor::Async {
            return Err(RuntimeError::invalid_state(
                "synchronous Next on an async stream",
            ));
        }
        if !self.check_status()? {
            return Ok((Value::Null, false));
        }
        loop {
            let delegate = self.0.delegate.borrow().clone();
            if let Some(d) = delegate {
                match d.next_sync() {
                    Ok((v, true)) => return Ok((v, true)),
                    Ok((_, false)) => {
                        self.0.delegate.borrow_mut().take();
                        continue;
                    }
                    Err(e) => return Err(self.fail(e)),
                }
            }
            match self.step() {
                Ok(GenStep::Goto(s)) => self.0.frame.borrow_mut().state = s,
                Ok(GenStep::Yield(v, s)) => {
                    self.0.frame.borrow_mut().state = s;
                    return Ok((v, true));
                }
                Ok(GenStep::YieldFrom(nested, s)) => self.set_delegate(nested, s),
                Ok(GenStep::Await { .. }) => {
                    return Err(self.fail(RuntimeError::invalid_state(
                        "await inside a synchronous stream",
                    )))
                }
                Ok(GenStep::Done) => {
                    self.exhaust();
                    return Ok((Value::Null, false));
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Drain a synchronous stream.
    pub fn collect_sync(&self) -> RuntimeResult<Vec<Value>> {
        let mut out = Vec::new();
        loop {
            match self.next_sync()? {
                (v, true) => out.push(v),
                (_, false) => return Ok(out),
            }
        }
    }

    // =========================================================================
    // Asynchronous Next
    // =========================================================================

    /// `Next` as a promise of [`pack_next`]. Works for both flavors.
    pub fn next(&self) -> Promise {
        let sched = &self.0.sched;
        if self.0.flavor == Flavor::Sync {
            return Promise::from_result(sched, self.next_sync().map(|(v, m)| pack_next(v, m)));
        }
        if self.0.in_flight.get() {
            return Promise::rejected(sched, RuntimeError::invalid_state("re-entrant stream Next"));
        }
        match self.check_status() {
            Ok(true) => {}
            Ok(false) => return Promise::resolved(sched, pack_next(Value::Null, false)),
            Err(e) => return Promise::rejected(sched, e),
        }
        let (promise, resolver) = Promise::pending(sched);
        self.0.in_flight.set(true);
        self.pump(resolver);
        promise
    }

    fn settle(&self, resolver: &Resolver, result: RuntimeResult<(Value, bool)>) {
        self.0.in_flight.set(false);
        match result {
            Ok((v, more)) => resolver.resolve(pack_next(v, more)),
            Err(e) => resolver.reject(self.fail(e)),
        };
    }

    /// Advance until the in-flight `Next` can be answered or must wait.
    fn pump(&self, resolver: Resolver) {
        loop {
            let delegate = self.0.delegate.borrow().clone();
            if let Some(d) = delegate {
                if d.flavor() == Flavor::Sync {
                    match d.next_sync() {
                        Ok((v, true)) => return self.settle(&resolver, Ok((v, true))),
                        Ok((_, false)) => {
                            self.0.delegate.borrow_mut().take();
                            continue;
                        }
                        Err(e) => return self.settle(&resolver, Err(e)),
                    }
                }
                let this = self.clone();
                d.next().on_settled(move |s| match s.and_then(|p| unpack_next(&p)) {
                    Ok((v, true)) => this.settle(&resolver, Ok((v, true))),
                    Ok((_, false)) => {
                        this.0.delegate.borrow_mut().take();
                        this.pump(resolver);
                    }
                    Err(e) => this.settle(&resolver, Err(e)),
                });
                return;
            }

            match self.step() {
                Ok(GenStep::Goto(s)) => self.0.frame.borrow_mut().state = s,
                Ok(GenStep::Yield(v, s)) => {
                    self.0.frame.borrow_mut().state = s;
                    return self.settle(&resolver, Ok((v, true)));
                }
                Ok(GenStep::YieldFrom(nested, s)) => self.set_delegate(nested, s),
                Ok(GenStep::Await {
                    promise,
                    resume,
                    catch,
                }) => {
                    let this = self.clone();
                    promise.on_settled(move |s| {
                        let resumed = this.0.frame.borrow_mut().resume_with(resume, s, catch);
                        match resumed {
                            Ok(()) => this.pump(resolver),
                            Err(e) => this.settle(&resolver, Err(e)),
                        }
                    });
                    return;
                }
                Ok(GenStep::Done) => {
                    self.exhaust();
                    self.0.in_flight.set(false);
                    resolver.resolve(pack_next(Value::Null, false));
                    return;
                }
                Err(e) => return self.settle(&resolver, Err(e)),
            }
        }
    }

    /// Drain the stream into a list.
    pub fn collect(&self) -> Promise {
        let stream = self.clone();
        let mut items = Vec::new();
        Continuation::spawn(&self.0.sched, move |frame| match frame.state {
            0 => Ok(Step::await_at(stream.next(), 1)),
            _ => match unpack_next(&frame.take_value())? {
                (v, true) => {
                    items.push(v);
                    Ok(Step::Goto(0))
                }
                (_, false) => Ok(Step::Return(Value::list(std::mem::take(&mut items)))),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[Value]) -> Vec<i64> {
        values.iter().filter_map(|v| v.as_int()).collect()
    }

    #[test]
    fn test_sync_exhaustion_is_idempotent() {
        let sched = Scheduler::default();
        let s = Stream::from_values(&sched, vec![Value::Int(1)]);
        assert_eq!(s.next_sync().unwrap().0.as_int(), Some(1));
        for _ in 0..3 {
            let (v, more) = s.next_sync().unwrap();
            assert!(v.is_null());
            assert!(!more);
        }
    }

    #[test]
    fn test_sync_delegation() {
        let sched = Scheduler::default();
        let inner = Stream::from_values(&sched, vec![Value::Int(2), Value::Int(3)]);
        let mut inner = Some(inner);
        let outer = Stream::new_sync(&sched, move |f| match f.state {
            0 => Ok(GenStep::Yield(Value::Int(1), 1)),
            1 => match inner.take() {
                Some(s) => Ok(GenStep::YieldFrom(s, 2)),
                None => Ok(GenStep::Done),
            },
            2 => Ok(GenStep::Yield(Value::Int(4), 3)),
            _ => Ok(GenStep::Done),
        });
        assert_eq!(ints(&outer.collect_sync().unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_sync_failure_is_permanent() {
        let sched = Scheduler::default();
        let s = Stream::new_sync(&sched, |f| match f.state {
            0 => Ok(GenStep::Yield(Value::Int(1), 1)),
            _ => Err(RuntimeError::Thrown(Value::str("boom"))),
        });
        assert!(s.next_sync().unwrap().1);
        assert!(matches!(s.next_sync(), Err(RuntimeError::Thrown(_))));
        assert!(matches!(s.next_sync(), Err(RuntimeError::InvalidState(_))));
    }

    #[test]
    fn test_async_awaits_between_yields() {
        let sched = Scheduler::default();
        let (dep, r) = Promise::pending(&sched);
        let s = Stream::new_async(&sched, move |f| match f.state {
            0 => Ok(GenStep::Await {
                promise: dep.clone(),
                resume: 1,
                catch: None,
            }),
            1 => Ok(GenStep::Yield(f.take_value(), 2)),
            _ => Ok(GenStep::Done),
        });
        let first = s.next();
        assert!(!first.is_settled());
        let again = s.next();
        assert!(matches!(again.settlement(), Some(Err(RuntimeError::InvalidState(_)))));
        r.resolve(Value::Int(10));
        let (v, more) = unpack_next(&sched.block_on(&first).unwrap()).unwrap();
        assert_eq!((v.as_int(), more), (Some(10), true));
        let (_, more) = unpack_next(&sched.block_on(&s.next()).unwrap()).unwrap();
        assert!(!more);
    }

    #[test]
    fn test_async_error_rejects_next() {
        let sched = Scheduler::default();
        let s = Stream::new_async(&sched, |_| Err(RuntimeError::NullAccess));
        assert!(matches!(sched.block_on(&s.next()), Err(RuntimeError::NullAccess)));
        assert!(matches!(sched.block_on(&s.next()), Err(RuntimeError::InvalidState(_))));
    }
}

//! Suspended function bodies as explicit state machines.
//!
//! A body is called with the current [`Frame`] and returns the next [`Step`]:
//! jump to another state synchronously, await a promise, or return. The
//! driver never polls. An awaited promise resumes the body through its
//! settlement callback, so at most one resumption is outstanding at a time.
//! Errors returned by the body reject the continuation's promise.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{RuntimeError, RuntimeResult};
use crate::value::Value;

use super::promise::{Promise, Resolver, Settlement};
use super::scheduler::Scheduler;

/// State cursor plus the value or error delivered by the last resumption.
#[derive(Debug, Default)]
pub struct Frame {
    pub state: u32,
    value: Option<Value>,
    error: Option<RuntimeError>,
}

impl Frame {
    /// Value of the awaited promise that resumed this state.
    pub fn take_value(&mut self) -> Value {
        self.value.take().unwrap_or_default()
    }

    /// Error delivered to a catch state.
    pub fn take_error(&mut self) -> Option<RuntimeError> {
        self.error.take()
    }

    pub(crate) fn resume_with(&mut self, state: u32, s: Settlement, catch: Option<u32>) -> RuntimeResult<()> {
        match s {
            Ok(v) => {
                self.state = state;
                self.value = Some(v);
                Ok(())
            }
            Err(e) => match catch {
                Some(c) => {
                    self.state = c;
                    self.error = Some(e);
                    Ok(())
                }
                None => Err(e),
            },
        }
    }
}

pub enum Step {
    /// Continue synchronously at another state.
    Goto(u32),
    /// Suspend until `promise` settles, then continue at `resume`, or at
    /// `catch` if it rejects and a catch state is given.
    Await {
        promise: Promise,
        resume: u32,
        catch: Option<u32>,
    },
    Return(Value),
}

impl Step {
    #[inline]
    pub fn await_at(promise: Promise, resume: u32) -> Self {
        Step::Await {
            promise,
            resume,
            catch: None,
        }
    }

    #[inline]
    pub fn await_or_catch(promise: Promise, resume: u32, catch: u32) -> Self {
        Step::Await {
            promise,
            resume,
            catch: Some(catch),
        }
    }
}

type Body = Box<dyn FnMut(&mut Frame) -> RuntimeResult<Step>>;

pub struct Continuation {
    body: RefCell<Body>,
    frame: RefCell<Frame>,
    resolver: Resolver,
    suspended: Cell<bool>,
}

impl Continuation {
    /// Start `body` at state 0. The first segment runs synchronously inside
    /// this call; the returned promise settles when the body returns or fails.
    pub fn spawn(
        sched: &Scheduler,
        body: impl FnMut(&mut Frame) -> RuntimeResult<Step> + 'static,
    ) -> Promise {
        let (promise, resolver) = Promise::pending(sched);
        let cont = Rc::new(Continuation {
            body: RefCell::new(Box::new(body)),
            frame: RefCell::new(Frame::default()),
            resolver,
            suspended: Cell::new(false),
        });
        cont.drive();
        promise
    }

    fn drive(self: &Rc<Self>) {
        loop {
            let step = {
                let (mut body, mut frame) =
                    match (self.body.try_borrow_mut(), self.frame.try_borrow_mut()) {
                        (Ok(b), Ok(f)) => (b, f),
                        _ => {
                            self.resolver
                                .reject(RuntimeError::invalid_state("continuation re-entered"));
                            return;
                        }
                    };
                (body.as_mut())(&mut *frame)
            };
            match step {
                Ok(Step::Goto(state)) => self.frame.borrow_mut().state = state,
                Ok(Step::Return(v)) => {
                    self.resolver.resolve(v);
                    return;
                }
                Ok(Step::Await {
                    promise,
                    resume,
                    catch,
                }) => {
                    self.suspended.set(true);
                    let this = self.clone();
                    promise.on_settled(move |s| this.resume(resume, catch, s));
                    return;
                }
                Err(e) => {
                    self.resolver.reject(e);
                    return;
                }
            }
        }
    }

    fn resume(self: &Rc<Self>, state: u32, catch: Option<u32>, s: Settlement) {
        if !self.suspended.replace(false) {
            self.resolver
                .reject(RuntimeError::invalid_state("continuation resumed while running"));
            return;
        }
        let resumed = self.frame.borrow_mut().resume_with(state, s, catch);
        match resumed {
            Ok(()) => self.drive(),
            Err(e) => {
                self.resolver.reject(e);
            }
        }
    }
}

//! Scoped resources: named handles released on every exit path of the code
//! bound to the scope. A release may finish later; bulk releases wait for
//! all of them.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::error::RuntimeResult;
use crate::sched::{Maybe, Promise, Scheduler};
use crate::value::Value;

pub trait Resource {
    /// `Ready` when released on the spot, `Pending` while an asynchronous
    /// release is still running.
    fn release(&self) -> RuntimeResult<Maybe>;
}

pub struct ResourceScope {
    sched: Scheduler,
    held: RefCell<HashMap<String, Rc<dyn Resource>>>,
}

impl ResourceScope {
    pub fn new(sched: &Scheduler) -> Self {
        Self {
            sched: sched.clone(),
            held: RefCell::new(HashMap::new()),
        }
    }

    /// Track `resource` under `name`. A resource already held under the same
    /// name is released first; the returned promise settles with that
    /// release.
    pub fn acquire(&self, name: impl Into<String>, resource: Rc<dyn Resource>) -> Promise {
        let name = name.into();
        let previous = self.held.borrow_mut().insert(name.clone(), resource);
        match previous {
            Some(old) => self.release_one(&name, &old),
            None => Promise::resolved(&self.sched, Value::Null),
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.borrow().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.held.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.borrow().is_empty()
    }

    /// Release only the named resources. Unknown names are ignored. Every
    /// named release is started even if one fails; the promise rejects with
    /// the first failure once they are gathered.
    pub fn release(&self, names: &[&str]) -> Promise {
        let taken: Vec<(String, Rc<dyn Resource>)> = {
            let mut held = self.held.borrow_mut();
            names
                .iter()
                .filter_map(|n| held.remove_entry(*n))
                .collect()
        };
        self.release_each(taken)
    }

    /// Release everything, in no particular order.
    pub fn release_all(&self) -> Promise {
        let taken: Vec<_> = self.held.borrow_mut().drain().collect();
        self.release_each(taken)
    }

    /// Run `f`, then release every resource whether `f` succeeded or not.
    /// An error from `f` takes precedence over a release error.
    pub fn bind(self: &Rc<Self>, f: impl FnOnce(&ResourceScope) -> RuntimeResult<Value>) -> Promise {
        let result = f(self);
        self.release_after(Promise::from_result(&self.sched, result))
    }

    /// Asynchronous `bind`: releases once the promise returned by `f`
    /// settles, then forwards its settlement after the releases finish.
    pub fn bind_async(self: &Rc<Self>, f: impl FnOnce(&Rc<ResourceScope>) -> Promise) -> Promise {
        let inner = f(self);
        self.release_after(inner)
    }

    fn release_after(self: &Rc<Self>, body: Promise) -> Promise {
        let (out, resolver) = Promise::pending(&self.sched);
        let scope = self.clone();
        body.on_settled(move |settled| {
            scope.release_all().on_settled(move |released| {
                resolver.settle(settled.and_then(|v| released.map(|_| v)));
            });
        });
        out
    }

    fn release_one(&self, name: &str, resource: &Rc<dyn Resource>) -> Promise {
        let released = match resource.release() {
            Ok(maybe) => Promise::resolve(&self.sched, maybe),
            Err(e) => Promise::rejected(&self.sched, e),
        };
        let name = name.to_string();
        released.catch(move |e| {
            tracing::warn!(resource = %name, error = %e, "resource release failed");
            Err(e)
        })
    }

    fn release_each(&self, taken: Vec<(String, Rc<dyn Resource>)>) -> Promise {
        let pending = taken
            .iter()
            .map(|(name, resource)| self.release_one(name, resource))
            .collect();
        Promise::all(&self.sched, pending).map(|_| Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::error::RuntimeError;
    use crate::sched::Resolver;

    struct Counter {
        released: Rc<Cell<u32>>,
        fail: bool,
    }

    impl Resource for Counter {
        fn release(&self) -> RuntimeResult<Maybe> {
            self.released.set(self.released.get() + 1);
            if self.fail {
                Err(RuntimeError::invalid_state("busy"))
            } else {
                Ok(Maybe::Ready(Value::Null))
            }
        }
    }

    /// Released once its resolver is settled.
    struct Deferred {
        sched: Scheduler,
        finish: RefCell<Option<Resolver>>,
    }

    impl Resource for Deferred {
        fn release(&self) -> RuntimeResult<Maybe> {
            let (p, r) = Promise::pending(&self.sched);
            *self.finish.borrow_mut() = Some(r);
            Ok(Maybe::Pending(p))
        }
    }

    fn counter(released: &Rc<Cell<u32>>) -> Rc<dyn Resource> {
        Rc::new(Counter {
            released: released.clone(),
            fail: false,
        })
    }

    #[test]
    fn test_release_subset() {
        let sched = Scheduler::default();
        let n = Rc::new(Cell::new(0));
        let scope = ResourceScope::new(&sched);
        scope.acquire("a", counter(&n));
        scope.acquire("b", counter(&n));
        scope.acquire("c", counter(&n));
        sched.block_on(&scope.release(&["a", "c", "zzz"])).unwrap();
        assert_eq!(n.get(), 2);
        assert!(scope.is_held("b"));
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_reacquire_releases_previous() {
        let sched = Scheduler::default();
        let n = Rc::new(Cell::new(0));
        let scope = ResourceScope::new(&sched);
        sched.block_on(&scope.acquire("a", counter(&n))).unwrap();
        sched.block_on(&scope.acquire("a", counter(&n))).unwrap();
        assert_eq!(n.get(), 1);
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_bind_releases_on_error() {
        let sched = Scheduler::default();
        let n = Rc::new(Cell::new(0));
        let scope = Rc::new(ResourceScope::new(&sched));
        let out = scope.bind(|s| {
            s.acquire("file", counter(&n));
            Err(RuntimeError::Thrown(Value::str("boom")))
        });
        assert!(matches!(sched.block_on(&out), Err(RuntimeError::Thrown(_))));
        assert_eq!(n.get(), 1);
        assert!(scope.is_empty());
    }

    #[test]
    fn test_failed_release_still_releases_rest() {
        let sched = Scheduler::default();
        let n = Rc::new(Cell::new(0));
        let scope = ResourceScope::new(&sched);
        scope.acquire("bad", Rc::new(Counter { released: n.clone(), fail: true }));
        scope.acquire("good", counter(&n));
        assert!(sched.block_on(&scope.release_all()).is_err());
        assert_eq!(n.get(), 2);
    }

    #[test]
    fn test_release_all_waits_for_async_release() {
        let sched = Scheduler::default();
        let slow = Rc::new(Deferred {
            sched: sched.clone(),
            finish: RefCell::new(None),
        });
        let scope = ResourceScope::new(&sched);
        scope.acquire("slow", slow.clone());
        let done = scope.release_all();
        sched.run_until_idle().unwrap();
        assert!(!done.is_settled());

        let finish = slow.finish.borrow_mut().take();
        assert!(finish.map_or(false, |r| r.resolve(Value::Null)));
        assert!(sched.block_on(&done).unwrap().is_null());
    }

    #[test]
    fn test_bind_async_releases_after_settlement() {
        let sched = Scheduler::default();
        let n = Rc::new(Cell::new(0));
        let scope = Rc::new(ResourceScope::new(&sched));
        let (inner, r) = Promise::pending(&sched);
        let n2 = n.clone();
        let out = scope.bind_async(move |s| {
            s.acquire("conn", counter(&n2));
            inner
        });
        sched.run_until_idle().unwrap();
        assert_eq!(n.get(), 0);
        r.resolve(Value::Int(1));
        assert_eq!(sched.block_on(&out).unwrap().as_int(), Some(1));
        assert_eq!(n.get(), 1);
    }
}

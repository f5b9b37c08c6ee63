//! Integration tests: continuations, promises and async streams together

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lode_runtime::{
    unpack_next, Continuation, GenStep, Promise, Runtime, RuntimeError, Scheduler, Step, Stream,
    Value,
};
use pretty_assertions::assert_eq;

fn ints(v: &Value) -> Vec<i64> {
    match v {
        Value::List(items) => items.borrow().iter().filter_map(|x| x.as_int()).collect(),
        _ => Vec::new(),
    }
}

/// Async stream yielding `values`, awaiting a settled promise before each.
fn async_values(sched: &Scheduler, values: Vec<i64>) -> Stream {
    let s = sched.clone();
    Stream::new_async(sched, move |f| {
        let i = (f.state / 2) as usize;
        if i >= values.len() {
            return Ok(GenStep::Done);
        }
        if f.state % 2 == 0 {
            let p = Promise::resolved(&s, Value::Int(values[i]));
            Ok(GenStep::Await {
                promise: p,
                resume: f.state + 1,
                catch: None,
            })
        } else {
            Ok(GenStep::Yield(f.take_value(), f.state + 1))
        }
    })
}

#[test]
fn test_async_delegation_flattens() {
    let rt = Runtime::new();
    let sched = rt.scheduler().clone();
    let mut nested = Some(async_values(&sched, vec![3, 4]));
    let outer = Stream::new_async(&sched, move |f| match f.state {
        0 => Ok(GenStep::Yield(Value::Int(1), 1)),
        1 => Ok(GenStep::Yield(Value::Int(2), 2)),
        2 => match nested.take() {
            Some(s) => Ok(GenStep::YieldFrom(s, 3)),
            None => Err(RuntimeError::invalid_state("delegated twice")),
        },
        3 => Ok(GenStep::Yield(Value::Int(5), 4)),
        _ => Ok(GenStep::Done),
    });

    let all = rt.block_on(&outer.collect()).unwrap();
    assert_eq!(ints(&all), vec![1, 2, 3, 4, 5]);

    for _ in 0..3 {
        let (v, more) = unpack_next(&rt.block_on(&outer.next()).unwrap()).unwrap();
        assert!(v.is_null());
        assert!(!more);
    }
    assert!(outer.is_exhausted());
}

#[test]
fn test_async_delegate_to_sync_stream() {
    let rt = Runtime::new();
    let sched = rt.scheduler().clone();
    let mut nested = Some(Stream::from_values(&sched, vec![Value::Int(2), Value::Int(3)]));
    let outer = Stream::new_async(&sched, move |f| match f.state {
        0 => Ok(GenStep::Yield(Value::Int(1), 1)),
        1 => Ok(match nested.take() {
            Some(s) => GenStep::YieldFrom(s, 2),
            None => GenStep::Done,
        }),
        _ => Ok(GenStep::Done),
    });
    assert_eq!(ints(&rt.block_on(&outer.collect()).unwrap()), vec![1, 2, 3]);
}

#[test]
fn test_nested_failure_rejects_outer_next() {
    let rt = Runtime::new();
    let sched = rt.scheduler().clone();
    let failing = Stream::new_async(&sched, |_| Err(RuntimeError::Thrown(Value::str("inner"))));
    let mut nested = Some(failing);
    let outer = Stream::new_async(&sched, move |f| match f.state {
        0 => Ok(match nested.take() {
            Some(s) => GenStep::YieldFrom(s, 1),
            None => GenStep::Done,
        }),
        _ => Ok(GenStep::Done),
    });
    assert!(matches!(rt.block_on(&outer.next()), Err(RuntimeError::Thrown(_))));
    assert!(matches!(rt.block_on(&outer.next()), Err(RuntimeError::InvalidState(_))));
}

#[test]
fn test_all_keeps_input_order() {
    let rt = Runtime::new();
    let sched = rt.scheduler();
    let (p1, r1) = Promise::pending(sched);
    let (p2, r2) = Promise::pending(sched);
    let (p3, r3) = Promise::pending(sched);
    let all = Promise::all(sched, vec![p1, p2, p3]);
    r2.resolve(Value::Int(2));
    r3.resolve(Value::Int(3));
    r1.resolve(Value::Int(1));
    assert_eq!(ints(&rt.block_on(&all).unwrap()), vec![1, 2, 3]);
}

#[test]
fn test_short_circuit_never_evaluates_rhs() {
    let rt = Runtime::new();
    let evaluated = Rc::new(Cell::new(0));
    let e = evaluated.clone();
    let sched = rt.scheduler().clone();

    // `true || f()` inside an async body
    let body = Continuation::spawn(rt.scheduler(), move |f| match f.state {
        0 => {
            let e = e.clone();
            let s = sched.clone();
            let p = Promise::short_circuit(&sched, true, true, move || {
                e.set(e.get() + 1);
                Promise::resolved(&s, Value::Bool(false))
            });
            Ok(Step::await_at(p, 1))
        }
        _ => Ok(Step::Return(f.take_value())),
    });
    assert_eq!(rt.block_on(&body).unwrap().as_bool(), Some(true));
    assert_eq!(evaluated.get(), 0);
}

#[test]
fn test_continuation_side_effects_keep_program_order() {
    let rt = Runtime::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let (gate, open) = Promise::pending(rt.scheduler());

    let l = log.clone();
    let p = Continuation::spawn(rt.scheduler(), move |f| match f.state {
        0 => {
            l.borrow_mut().push("before");
            Ok(Step::await_at(gate.clone(), 1))
        }
        _ => {
            l.borrow_mut().push("after");
            Ok(Step::Return(Value::Null))
        }
    });
    log.borrow_mut().push("caller");
    open.resolve(Value::Null);
    log.borrow_mut().push("resolved");
    rt.block_on(&p).unwrap();
    assert_eq!(*log.borrow(), vec!["before", "caller", "resolved", "after"]);
}

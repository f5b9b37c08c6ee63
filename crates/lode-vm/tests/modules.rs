//! Integration tests: module declaration → ordered init → namespace

use std::cell::RefCell;
use std::rc::Rc;

use lode_runtime::{
    dynamic_access, FieldDef, Instance, Maybe, PrimitiveKind, Promise, Runtime, RuntimeError,
    TypeRef, Value,
};
use lode_vm::ModuleRegistry;
use pretty_assertions::assert_eq;

type Log = Rc<RefCell<Vec<&'static str>>>;

fn logger(log: &Log, entry: &'static str) -> impl FnOnce(&Runtime) -> lode_runtime::RuntimeResult<Maybe> {
    let log = log.clone();
    move |_| {
        log.borrow_mut().push(entry);
        Ok(Maybe::Ready(Value::Null))
    }
}

#[test]
fn test_inits_run_in_dependency_order() {
    let rt = Runtime::new();
    let mut reg = ModuleRegistry::new(&rt);
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    reg.declare_module("app.main", |m| m.module_init("main", &["core", "util"], logger(&log, "main")))
        .unwrap();
    reg.declare_module("app.core", |m| m.module_init("core", &["util"], logger(&log, "core")))
        .unwrap();

    let l = log.clone();
    reg.declare_module("app.util", |m| {
        m.declare_struct("app.util.Point", "Point", &[], None, |b, _| {
            b.field(FieldDef::new("x", TypeRef::primitive(PrimitiveKind::Int)).default_value(Value::Int(0)));
            Ok(())
        })?;
        m.export("version", Value::Int(3));
        m.module_init("util", &[], move |rt| {
            l.borrow_mut().push("util");
            let (p, r) = Promise::pending(rt.scheduler());
            let l2 = l.clone();
            rt.scheduler().defer(move || {
                l2.borrow_mut().push("util-async");
                r.resolve(Value::Null);
            });
            Ok(Maybe::Pending(p))
        })
    })
    .unwrap();

    let ns = rt.block_on(&reg.ready()).unwrap();
    assert_eq!(*log.borrow(), vec!["util", "util-async", "core", "main"]);

    let types = rt.types();
    let util = dynamic_access(types, &dynamic_access(types, &ns, "app").unwrap(), "util").unwrap();
    assert_eq!(dynamic_access(types, &util, "version").unwrap().as_int(), Some(3));
    assert_eq!(
        dynamic_access(types, &util, "Point").unwrap().as_str(),
        Some("app.util.Point")
    );

    let point = types.resolve_id("app.util.Point").unwrap();
    let p = Instance::construct(types, &point, vec![]).unwrap();
    assert_eq!(p.get(types, "x").unwrap().as_int(), Some(0));
}

#[test]
fn test_inits_run_once() {
    let rt = Runtime::new();
    let mut reg = ModuleRegistry::new(&rt);
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    reg.declare_module("a", |m| m.module_init("a", &[], logger(&log, "a")))
        .unwrap();
    rt.block_on(&reg.ready()).unwrap();
    rt.block_on(&reg.ready()).unwrap();
    assert_eq!(*log.borrow(), vec!["a"]);
}

#[test]
fn test_init_cycle_rejects() {
    let rt = Runtime::new();
    let mut reg = ModuleRegistry::new(&rt);
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    reg.declare_module("a", |m| {
        m.module_init("a", &["b"], logger(&log, "a"))?;
        m.module_init("b", &["a"], logger(&log, "b"))
    })
    .unwrap();
    assert!(matches!(rt.block_on(&reg.ready()), Err(RuntimeError::InvalidState(_))));
    assert!(log.borrow().is_empty());
}

#[test]
fn test_unknown_dependency_rejects() {
    let rt = Runtime::new();
    let mut reg = ModuleRegistry::new(&rt);
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    reg.declare_module("a", |m| m.module_init("a", &["ghost"], logger(&log, "a")))
        .unwrap();
    assert!(matches!(rt.block_on(&reg.ready()), Err(RuntimeError::Module(_))));
}

#[test]
fn test_failing_init_stops_the_chain() {
    let rt = Runtime::new();
    let mut reg = ModuleRegistry::new(&rt);
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    reg.declare_module("a", |m| {
        m.module_init("broken", &[], |_| Err(RuntimeError::Thrown(Value::str("init failed"))))?;
        m.module_init("after", &["broken"], logger(&log, "after"))
    })
    .unwrap();
    assert!(matches!(rt.block_on(&reg.ready()), Err(RuntimeError::Thrown(_))));
    assert!(log.borrow().is_empty());
}

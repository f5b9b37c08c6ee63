//! Host value representation.
//!
//! A `Value` is either a raw host value (null, bool, number, string, list,
//! dictionary), a raw value boxed under a declared type, or a struct/class
//! instance. Boxes never nest: the payload of a `Boxed` is always unboxed.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::objects::Instance;
use crate::registry::TypeHandle;

/// Ordered string-keyed dictionary; keeps JSON field order.
pub type Dict = IndexMap<String, Value>;
pub type DictRef = Rc<RefCell<Dict>>;
pub type ListRef = Rc<RefCell<Vec<Value>>>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(ListRef),
    Map(DictRef),
    Boxed(Rc<Boxed>),
    Instance(Instance),
}

/// A raw value tagged with the type it was boxed as.
pub struct Boxed {
    ty: TypeHandle,
    raw: Value,
}

impl Boxed {
    /// Caller guarantees `raw` is not itself boxed.
    pub(crate) fn new(ty: TypeHandle, raw: Value) -> Self {
        debug_assert!(!matches!(raw, Value::Boxed(_)), "boxes never nest");
        Self { ty, raw }
    }

    #[inline]
    pub fn ty(&self) -> &TypeHandle {
        &self.ty
    }

    #[inline]
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

/// Host representation of a value, looking through any box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repr {
    Null,
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
    Instance,
}

impl Repr {
    pub fn name(self) -> &'static str {
        match self {
            Repr::Null => "null",
            Repr::Bool => "bool",
            Repr::Int => "int",
            Repr::Float => "float",
            Repr::String => "string",
            Repr::List => "list",
            Repr::Map => "map",
            Repr::Instance => "instance",
        }
    }
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(dict: Dict) -> Self {
        Value::Map(Rc::new(RefCell::new(dict)))
    }

    /// Build a dictionary value from `(key, value)` pairs.
    pub fn map_from<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_boxed(&self) -> bool {
        matches!(self, Value::Boxed(_))
    }

    /// Payload of a box, or the value itself.
    #[inline]
    pub fn unboxed(&self) -> &Value {
        match self {
            Value::Boxed(b) => b.raw(),
            other => other,
        }
    }

    pub fn repr(&self) -> Repr {
        match self.unboxed() {
            Value::Null => Repr::Null,
            Value::Bool(_) => Repr::Bool,
            Value::Int(_) => Repr::Int,
            Value::Float(_) => Repr::Float,
            Value::Str(_) => Repr::String,
            Value::List(_) => Repr::List,
            Value::Map(_) => Repr::Map,
            Value::Instance(_) => Repr::Instance,
            Value::Boxed(_) => unreachable!("boxes never nest"),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unboxed() {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.unboxed() {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as float; integers widen.
    pub fn as_float(&self) -> Option<f64> {
        match self.unboxed() {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unboxed() {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match self.unboxed() {
            Value::Instance(i) => Some(i),
            _ => None,
        }
    }

    /// Identity comparison: scalars by value, shared objects by pointer.
    pub fn same_identity(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Boxed(a), Value::Boxed(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Deep equality of host representations, ignoring boxes.
    ///
    /// Integers and floats compare numerically. Instances compare by
    /// identity; field-wise struct equality lives in the struct engine.
    pub fn host_eq(&self, other: &Value) -> bool {
        match (self.unboxed(), other.unboxed()) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_float() == other.as_float()
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.host_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).map_or(false, |w| v.host_eq(w)))
            }
            (Value::Instance(a), Value::Instance(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => f.debug_list().entries(items.borrow().iter()).finish(),
            Value::Map(dict) => f.debug_map().entries(dict.borrow().iter()).finish(),
            Value::Boxed(b) => write!(f, "{}({:?})", b.ty().name(), b.raw()),
            Value::Instance(i) => write!(f, "{}{{..}}", i.ty().name()),
        }
    }
}

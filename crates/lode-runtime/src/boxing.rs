//! Value box: typed boxing, unboxing, casting and structural equality.

use std::rc::Rc;

use lode_common_core::{BuiltinType, MemberKind, PrimitiveKind, TypeKind};

use crate::config::DEFAULT_MAX_DEPTH;
use crate::error::{RuntimeError, RuntimeResult};
use crate::objects::Instance;
use crate::registry::{TypeHandle, TypeRegistry};
use crate::runtime::Runtime;
use crate::sched::{Continuation, Maybe, Promise, Step};
use crate::value::{Boxed, Dict, Repr, Value};

// =============================================================================
// Box / unbox
// =============================================================================

/// Box `value` as `ty`.
///
/// A value already typed as `ty` (or as a type deriving from it) is returned
/// unchanged, so boxing never nests. Raw records boxed as a struct become
/// instances that validate lazily.
pub fn box_as(types: &TypeRegistry, value: Value, ty: &TypeHandle) -> RuntimeResult<Value> {
    if ty.kind() == TypeKind::Builtin || value.is_null() {
        return Ok(value);
    }
    let current = types.type_of(&value);
    if types.derives_from(&current, ty) {
        return Ok(value);
    }

    match ty.kind() {
        TypeKind::Primitive => {
            let raw = coerce_primitive(unbox(&value), ty)?;
            if Rc::ptr_eq(&types.type_of(&raw), ty) {
                Ok(raw)
            } else {
                Ok(Value::Boxed(Rc::new(Boxed::new(ty.clone(), raw))))
            }
        }
        TypeKind::Struct | TypeKind::Class => match unbox(&value) {
            Value::Map(dict) => Ok(Value::Instance(Instance::wrap(ty.clone(), dict, false))),
            Value::Instance(inst) if types.derives_from(inst.ty(), ty) => Ok(Value::Instance(inst)),
            _ => Err(RuntimeError::type_mismatch(current.name(), ty.name())),
        },
        TypeKind::Interface => {
            if types.conforms(&current, ty) {
                Ok(value)
            } else {
                Err(RuntimeError::type_mismatch(current.name(), ty.name()))
            }
        }
        TypeKind::Nominal => {
            let root = types.root_of(ty)?;
            let payload = box_as(types, unbox(&value), &root)?;
            Ok(Value::Boxed(Rc::new(Boxed::new(ty.clone(), unbox(&payload)))))
        }
        TypeKind::Builtin => Ok(value),
    }
}

fn coerce_primitive(raw: Value, ty: &TypeHandle) -> RuntimeResult<Value> {
    let kind = match ty.primitive() {
        Some(kind) => kind,
        None => return Ok(raw),
    };
    match (kind, &raw) {
        (PrimitiveKind::Float, Value::Int(i)) => Ok(Value::Float(*i as f64)),
        _ if repr_matches(kind, raw.repr()) => Ok(raw),
        _ => Err(RuntimeError::type_mismatch(raw.repr().name(), ty.name())),
    }
}

pub(crate) fn repr_matches(kind: PrimitiveKind, repr: Repr) -> bool {
    matches!(
        (kind, repr),
        (PrimitiveKind::Bool, Repr::Bool)
            | (PrimitiveKind::Int, Repr::Int)
            | (PrimitiveKind::Float, Repr::Float | Repr::Int)
            | (PrimitiveKind::String, Repr::String)
            | (PrimitiveKind::List, Repr::List)
            | (PrimitiveKind::Map, Repr::Map)
    )
}

/// Raw payload of a boxed value; anything else is returned unchanged.
#[inline]
pub fn unbox(value: &Value) -> Value {
    value.unboxed().clone()
}

// =============================================================================
// Type tests and casts
// =============================================================================

pub fn is_type(types: &TypeRegistry, value: &Value, ty: &TypeHandle) -> bool {
    match ty.builtin() {
        Some(BuiltinType::Any) => return true,
        Some(BuiltinType::Null) | Some(BuiltinType::Void) => return value.is_null(),
        Some(BuiltinType::Struct) => {
            return !value.is_null()
                && types
                    .root_of(&types.type_of(value))
                    .map_or(false, |root| {
                        matches!(root.kind(), TypeKind::Struct | TypeKind::Primitive)
                    });
        }
        None => {}
    }
    if value.is_null() {
        return false;
    }
    let current = types.type_of(value);
    if types.derives_from(&current, ty) {
        return true;
    }
    ty.kind() == TypeKind::Interface && types.conforms(&current, ty)
}

/// Checked conversion of `value` to `ty`. Never coerces silently: every
/// failure is a `Type` error naming both types.
pub fn cast(
    types: &TypeRegistry,
    value: Value,
    ty: &TypeHandle,
    allow_null: bool,
) -> RuntimeResult<Value> {
    if value.is_null() {
        return if allow_null || ty.is_any() {
            Ok(value)
        } else {
            Err(RuntimeError::type_mismatch("null", ty.name()))
        };
    }
    if is_type(types, &value, ty) {
        return Ok(value);
    }

    let current = types.type_of(&value);
    let mismatch = || RuntimeError::type_mismatch(current.name(), ty.name());
    match ty.kind() {
        TypeKind::Struct => match value.unboxed() {
            Value::Map(_) => box_as(types, unbox(&value), ty),
            _ => Err(mismatch()),
        },
        TypeKind::Class | TypeKind::Interface | TypeKind::Builtin => Err(mismatch()),
        TypeKind::Nominal => {
            let from_root = types.root_of(&current)?;
            let to_root = types.root_of(ty)?;
            if Rc::ptr_eq(&from_root, &to_root) {
                Ok(Value::Boxed(Rc::new(Boxed::new(ty.clone(), unbox(&value)))))
            } else {
                Err(mismatch())
            }
        }
        TypeKind::Primitive => match ty.primitive() {
            Some(kind) if repr_matches(kind, value.repr()) => box_as(types, unbox(&value), ty),
            _ => Err(mismatch()),
        },
    }
}

// =============================================================================
// Equality
// =============================================================================

/// Equality under `ty`. Identical values are equal; null equals only null.
/// Otherwise the type's equality hook decides, then element-wise equality
/// for typed slices and mappings, then struct field-wise equality, then
/// host value equality.
pub fn structural_equals(rt: &Runtime, left: &Value, right: &Value, ty: &TypeHandle) -> Promise {
    let sched = rt.scheduler();
    if left.same_identity(right) {
        return Promise::resolved(sched, Value::Bool(true));
    }
    if left.is_null() || right.is_null() {
        return Promise::resolved(sched, Value::Bool(left.is_null() && right.is_null()));
    }

    let types = rt.types();
    let hook = ty
        .equals_hook()
        .cloned()
        .or_else(|| types.root_of(ty).ok().and_then(|r| r.equals_hook().cloned()))
        .or_else(|| types.type_of(left).equals_hook().cloned());
    if let Some(hook) = hook {
        return hook(rt, left, right);
    }

    let shape = types.root_of(ty).unwrap_or_else(|_| ty.clone());
    if let Some(elem_ty) = element_type(&shape) {
        return match element_pairs(left.unboxed(), right.unboxed()) {
            Some(pairs) => elements_equal(rt, pairs, elem_ty),
            None => Promise::resolved(sched, Value::Bool(false)),
        };
    }

    match (left.unboxed(), right.unboxed()) {
        (Value::Instance(a), Value::Instance(b)) => a.equals(rt, b),
        (l, r) => Promise::resolved(sched, Value::Bool(l.host_eq(r))),
    }
}

/// Element type of `Slice<T>` or `Mapping<T>`.
fn element_type(ty: &TypeHandle) -> Option<TypeHandle> {
    match ty.primitive() {
        Some(PrimitiveKind::List | PrimitiveKind::Map) => ty.generic_args().first().cloned(),
        _ => None,
    }
}

/// Elements to compare pairwise, or `None` when lengths or keys differ.
fn element_pairs(left: &Value, right: &Value) -> Option<Vec<(Value, Value)>> {
    match (left, right) {
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            if a.len() != b.len() {
                return None;
            }
            Some(a.iter().cloned().zip(b.iter().cloned()).collect())
        }
        (Value::Map(a), Value::Map(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            if a.len() != b.len() {
                return None;
            }
            a.iter()
                .map(|(k, v)| b.get(k).map(|w| (v.clone(), w.clone())))
                .collect()
        }
        _ => None,
    }
}

/// Compare elements one after another under `elem_ty`; the first mismatch
/// settles the result. Raw records are boxed as the element type first.
fn elements_equal(rt: &Runtime, pairs: Vec<(Value, Value)>, elem_ty: TypeHandle) -> Promise {
    let sched = rt.scheduler();
    let rt = rt.clone();
    Continuation::spawn(sched, move |frame| {
        let state = frame.state;
        if state % 2 == 1 {
            if frame.take_value().as_bool() != Some(true) {
                return Ok(Step::Return(Value::Bool(false)));
            }
            return Ok(Step::Goto(state + 1));
        }
        let (l, r) = match pairs.get((state / 2) as usize) {
            Some(pair) => pair,
            None => return Ok(Step::Return(Value::Bool(true))),
        };
        let types = rt.types();
        let l = box_as(types, l.clone(), &elem_ty)?;
        let r = box_as(types, r.clone(), &elem_ty)?;
        Ok(Step::await_at(structural_equals(&rt, &l, &r, &elem_ty), state + 1))
    })
}

// =============================================================================
// Null helpers and dynamic access
// =============================================================================

/// `value ?? fallback`; the fallback is only evaluated for null.
pub fn null_or(value: Value, fallback: impl FnOnce() -> Value) -> Value {
    if value.is_null() {
        fallback()
    } else {
        value
    }
}

/// `value!`
pub fn assert_not_null(value: Value) -> RuntimeResult<Value> {
    if value.is_null() {
        Err(RuntimeError::NullAccess)
    } else {
        Ok(value)
    }
}

/// Member lookup on a value of unknown type. Struct fields go through the
/// validating accessor; dictionaries are indexed by key. A missing member or
/// a null receiver yields null.
pub fn dynamic_access(types: &TypeRegistry, value: &Value, name: &str) -> RuntimeResult<Value> {
    match value.unboxed() {
        Value::Instance(inst) if inst.ty().field(name).is_some() => inst.get(types, name),
        Value::Map(dict) => Ok(dict.borrow().get(name).cloned().unwrap_or_default()),
        _ => Ok(Value::Null),
    }
}

/// `receiver?.name(args)`. A null receiver, or a member that is neither
/// present on the value nor declared as a method of its type, yields null
/// without calling `invoke`. Otherwise `invoke` receives the receiver and
/// the member value, and its result is passed through as ready or pending.
pub fn nullable_invoke(
    types: &TypeRegistry,
    receiver: &Value,
    name: &str,
    invoke: impl FnOnce(&Value, Value) -> RuntimeResult<Maybe>,
) -> RuntimeResult<Maybe> {
    if receiver.is_null() {
        return Ok(Maybe::Ready(Value::Null));
    }
    let member = dynamic_access(types, receiver, name)?;
    let declared = types
        .type_of(receiver)
        .signature()
        .find(name)
        .map_or(false, |m| {
            matches!(m.kind, MemberKind::Function | MemberKind::Constructor | MemberKind::Operator)
        });
    if member.is_null() && !declared {
        return Ok(Maybe::Ready(Value::Null));
    }
    invoke(receiver, member)
}

/// Deep conversion to a plain host value: boxes are stripped and instances
/// become wire-keyed dictionaries. Instance fields are read through the
/// validating accessor, so lazily applied defaults show up at every level.
pub fn to_host(types: &TypeRegistry, value: &Value) -> RuntimeResult<Value> {
    to_host_at(types, value, 0)
}

fn to_host_at(types: &TypeRegistry, value: &Value, depth: usize) -> RuntimeResult<Value> {
    if depth > DEFAULT_MAX_DEPTH {
        return Err(RuntimeError::Serialization(
            "value nested too deeply".to_string(),
        ));
    }
    // Raw records inside `Slice<S>` / `Mapping<S>` are read as `S`.
    let elem_ty = match value {
        Value::Boxed(b) => element_type(b.ty()).filter(|t| t.kind().has_fields()),
        _ => None,
    };
    let item = |v: &Value| -> RuntimeResult<Value> {
        match &elem_ty {
            Some(t) if !v.is_null() => to_host_at(types, &box_as(types, v.clone(), t)?, depth + 1),
            _ => to_host_at(types, v, depth + 1),
        }
    };
    Ok(match value.unboxed() {
        Value::List(items) => Value::list(
            items
                .borrow()
                .iter()
                .map(item)
                .collect::<RuntimeResult<Vec<_>>>()?,
        ),
        Value::Map(dict) => Value::map(
            dict.borrow()
                .iter()
                .map(|(k, v)| Ok((k.clone(), item(v)?)))
                .collect::<RuntimeResult<Dict>>()?,
        ),
        Value::Instance(inst) => instance_dict(types, inst, depth)?,
        other => other.clone(),
    })
}

fn instance_dict(types: &TypeRegistry, inst: &Instance, depth: usize) -> RuntimeResult<Value> {
    if inst.is_synthesized() {
        return to_host_at(types, &inst.mapping(types)?, depth);
    }
    let mut dict = Dict::with_capacity(inst.ty().fields().len());
    for field in inst.ty().fields() {
        let value = inst.get(types, &field.name)?;
        dict.insert(field.wire_name.clone(), to_host_at(types, &value, depth + 1)?);
    }
    Ok(Value::map(dict))
}

/// Declared type name of a value, for diagnostics.
pub fn type_name(types: &TypeRegistry, value: &Value) -> String {
    types.type_of(value).name().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_common_core::TypeRef;

    use crate::registry::TypeBuilder;

    fn user_id(types: &TypeRegistry) -> TypeHandle {
        let mut b = TypeBuilder::new("app.UserId", TypeKind::Nominal);
        b.root(TypeRef::primitive(PrimitiveKind::Int));
        types.register(b).unwrap()
    }

    #[test]
    fn test_box_idempotent() {
        let types = TypeRegistry::new();
        let id = user_id(&types);
        let once = box_as(&types, Value::Int(7), &id).unwrap();
        assert!(once.is_boxed());
        let twice = box_as(&types, once.clone(), &id).unwrap();
        assert!(once.same_identity(&twice));
        let rebox = box_as(&types, unbox(&twice), &id).unwrap();
        assert_eq!(unbox(&rebox).as_int(), Some(7));
    }

    #[test]
    fn test_box_primitive() {
        let types = TypeRegistry::new();
        let float = types.primitive(PrimitiveKind::Float);
        assert!(matches!(box_as(&types, Value::Int(2), &float).unwrap(), Value::Float(f) if f == 2.0));
        let int = types.primitive(PrimitiveKind::Int);
        assert!(box_as(&types, Value::str("x"), &int).unwrap_err().is_type_error());
        let ints = types
            .instantiate("builtins.Slice", &[int])
            .unwrap();
        let boxed = box_as(&types, Value::list(vec![Value::Int(1)]), &ints).unwrap();
        assert!(Rc::ptr_eq(&types.type_of(&boxed), &ints));
    }

    #[test]
    fn test_cast_null() {
        let types = TypeRegistry::new();
        for kind in PrimitiveKind::ALL {
            let t = types.primitive(kind);
            assert!(cast(&types, Value::Null, &t, false).unwrap_err().is_type_error());
            assert!(cast(&types, Value::Null, &t, true).unwrap().is_null());
        }
        assert!(cast(&types, Value::Null, &types.any(), false).unwrap().is_null());
    }

    #[test]
    fn test_cast_nominal_requires_same_root() {
        let types = TypeRegistry::new();
        let id = user_id(&types);
        let ok = cast(&types, Value::Int(3), &id, false).unwrap();
        assert!(Rc::ptr_eq(&types.type_of(&ok), &id));
        let err = cast(&types, Value::str("3"), &id, false).unwrap_err();
        assert!(matches!(err, RuntimeError::Type { ref from, ref to } if from == "String" && to == "UserId"));
    }

    #[test]
    fn test_is_type_markers() {
        let types = TypeRegistry::new();
        let id = user_id(&types);
        let boxed = box_as(&types, Value::Int(1), &id).unwrap();
        let marker = types.marker(BuiltinType::Struct);
        assert!(is_type(&types, &boxed, &marker));
        assert!(is_type(&types, &Value::str("s"), &types.any()));
        assert!(!is_type(&types, &Value::Null, &marker));
        assert!(is_type(&types, &Value::Null, &types.marker(BuiltinType::Null)));
    }

    #[test]
    fn test_null_helpers() {
        assert_eq!(null_or(Value::Null, || Value::Int(1)).as_int(), Some(1));
        assert_eq!(null_or(Value::Int(2), || Value::Int(1)).as_int(), Some(2));
        assert!(matches!(assert_not_null(Value::Null), Err(RuntimeError::NullAccess)));
    }

    #[test]
    fn test_to_host_strips_boxes() {
        let types = TypeRegistry::new();
        let id = user_id(&types);
        let boxed = box_as(&types, Value::Int(9), &id).unwrap();
        let v = Value::map_from([("id", boxed), ("tags", Value::list(vec!["a".into()]))]);
        let host = to_host(&types, &v).unwrap();
        match &host {
            Value::Map(d) => assert!(!d.borrow()["id"].is_boxed()),
            other => panic!("expected map, got {:?}", other),
        }
        assert!(host.host_eq(&v));
    }

    #[test]
    fn test_nullable_invoke_skips_missing_members() {
        let types = TypeRegistry::new();
        let calls = std::cell::Cell::new(0);
        let call = |_: &Value, member: Value| -> RuntimeResult<Maybe> {
            calls.set(calls.get() + 1);
            Ok(Maybe::Ready(member))
        };

        let got = nullable_invoke(&types, &Value::Null, "run", call).unwrap();
        assert!(matches!(got, Maybe::Ready(Value::Null)));
        let v = Value::map_from([("run", Value::Int(5))]);
        let got = nullable_invoke(&types, &v, "walk", call).unwrap();
        assert!(matches!(got, Maybe::Ready(Value::Null)));
        assert_eq!(calls.get(), 0);

        let got = nullable_invoke(&types, &v, "run", call).unwrap();
        assert!(matches!(got, Maybe::Ready(Value::Int(5))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_nullable_invoke_declared_method() {
        let types = TypeRegistry::new();
        let mut b = TypeBuilder::new("app.Task", TypeKind::Struct);
        b.member("Run", MemberKind::Function, TypeRef::primitive(PrimitiveKind::Int));
        let task = types.register(b).unwrap();
        let inst = box_as(&types, Value::map(Dict::new()), &task).unwrap();

        let sched = crate::sched::Scheduler::default();
        let pending = Promise::resolved(&sched, Value::Int(3));
        let got = nullable_invoke(&types, &inst, "Run", move |recv, member| {
            assert!(member.is_null());
            assert!(recv.as_instance().is_some());
            Ok(Maybe::Pending(pending))
        })
        .unwrap();
        match got {
            Maybe::Pending(p) => assert_eq!(sched.block_on(&p).unwrap().as_int(), Some(3)),
            Maybe::Ready(v) => panic!("expected pending, got {:?}", v),
        }
    }

    #[test]
    fn test_dynamic_access_missing_is_null() {
        let types = TypeRegistry::new();
        let v = Value::map_from([("a", Value::Int(1))]);
        assert_eq!(dynamic_access(&types, &v, "a").unwrap().as_int(), Some(1));
        assert!(dynamic_access(&types, &v, "b").unwrap().is_null());
        assert!(dynamic_access(&types, &Value::Null, "a").unwrap().is_null());
    }
}

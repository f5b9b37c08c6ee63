//! Struct and class instances.
//!
//! Storage is a dictionary keyed by wire name holding unboxed values, which
//! is exactly what codecs read and write. Field reads go through [`Instance::get`]:
//! instances that did not come from a constructor (parsed or boxed from a raw
//! record) check a field's representation on its first read, then the value
//! is boxed as the declared field type.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashSet;
use lode_common_core::{PrimitiveKind, TypeKind};

use crate::boxing::{box_as, cast, repr_matches, structural_equals, unbox};
use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::{FieldDef, TypeHandle, TypeRegistry};
use crate::runtime::Runtime;
use crate::sched::{Continuation, Promise, Step};
use crate::value::{Dict, DictRef, Repr, Value};

struct InstanceData {
    ty: TypeHandle,
    storage: DictRef,
    /// Built by a constructor; fields are well-typed by construction.
    runtime_created: bool,
    /// Built directly from a dictionary; `mapping()` returns it as is.
    synthesized: bool,
    /// Indices of fields that already passed lazy validation.
    validated: RefCell<HashSet<usize>>,
}

#[derive(Clone)]
pub struct Instance(Rc<InstanceData>);

impl Instance {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Constructor path. Every value is cast to its field type, missing
    /// fields take their default (or null when nullable).
    pub fn construct(
        types: &TypeRegistry,
        ty: &TypeHandle,
        values: Vec<(&str, Value)>,
    ) -> RuntimeResult<Instance> {
        if !ty.kind().has_fields() {
            return Err(RuntimeError::type_mismatch("record", ty.name()));
        }
        let mut storage = Dict::new();
        for (name, value) in values {
            let (_, field) = ty
                .field(name)
                .ok_or_else(|| RuntimeError::validation(name, "declared field", "unknown field"))?;
            let field_ty = types.resolve(&field.ty)?;
            let value = cast(types, value, &field_ty, field.nullable)?;
            storage.insert(field.wire_name.clone(), unbox(&value));
        }
        for field in ty.fields() {
            if storage.contains_key(&field.wire_name) {
                continue;
            }
            let value = match &field.default {
                Some(default) => default(),
                None if field.nullable => Value::Null,
                None => {
                    return Err(RuntimeError::validation(
                        field.name.as_str(),
                        expected_repr(types, field)?,
                        "missing",
                    ))
                }
            };
            storage.insert(field.wire_name.clone(), value);
        }
        Ok(Self::wrap(ty.clone(), Rc::new(RefCell::new(storage)), true))
    }

    /// Wrap existing storage without copying it.
    pub(crate) fn wrap(ty: TypeHandle, storage: DictRef, runtime_created: bool) -> Instance {
        Instance(Rc::new(InstanceData {
            ty,
            storage,
            runtime_created,
            synthesized: false,
            validated: RefCell::new(HashSet::new()),
        }))
    }

    /// Instance over decoded wire storage. Not trusted: fields validate on
    /// first read.
    pub fn from_storage(ty: &TypeHandle, storage: Dict) -> Instance {
        Self::wrap(ty.clone(), Rc::new(RefCell::new(storage)), false)
    }

    /// Instance synthesized straight from a name-keyed dictionary.
    pub fn synthesize(ty: &TypeHandle, dict: DictRef) -> Instance {
        Instance(Rc::new(InstanceData {
            ty: ty.clone(),
            storage: dict,
            runtime_created: true,
            synthesized: true,
            validated: RefCell::new(HashSet::new()),
        }))
    }

    /// Fill absent fields that declare a default.
    pub fn init_defaults(&self) {
        let mut storage = self.0.storage.borrow_mut();
        for field in self.0.ty.fields() {
            if let Some(default) = &field.default {
                if !storage.contains_key(&field.wire_name) {
                    storage.insert(field.wire_name.clone(), default());
                }
            }
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn ty(&self) -> &TypeHandle {
        &self.0.ty
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_runtime_created(&self) -> bool {
        self.0.runtime_created
    }

    pub fn is_synthesized(&self) -> bool {
        self.0.synthesized
    }

    /// Read a field, boxed as its declared type.
    pub fn get(&self, types: &TypeRegistry, name: &str) -> RuntimeResult<Value> {
        let (index, field) = self.field(name)?;
        let stored = self.0.storage.borrow().get(&field.wire_name).cloned();
        // Records boxed from raw host values get their defaults on first read.
        let raw = match (stored, &field.default) {
            (Some(v), _) => v,
            (None, Some(default)) => {
                let v = default();
                self.0
                    .storage
                    .borrow_mut()
                    .insert(field.wire_name.clone(), v.clone());
                v
            }
            (None, None) => Value::Null,
        };

        if !self.0.runtime_created && !self.0.validated.borrow().contains(&index) {
            validate_field(types, field, &raw)?;
            self.0.validated.borrow_mut().insert(index);
        }
        if raw.is_null() {
            return Ok(Value::Null);
        }

        let field_ty = types.resolve(&field.ty)?;
        let boxed = box_as(types, raw.clone(), &field_ty)?;
        // A raw record read as a struct becomes an instance; keep it so later
        // reads observe the same object.
        if let (Value::Map(_), Value::Instance(_)) = (&raw, boxed.unboxed()) {
            self.0
                .storage
                .borrow_mut()
                .insert(field.wire_name.clone(), unbox(&boxed));
        }
        Ok(boxed)
    }

    /// Typed field write. The stored value is trusted from then on.
    pub fn set(&self, types: &TypeRegistry, name: &str, value: Value) -> RuntimeResult<()> {
        let (index, field) = self.field(name)?;
        let field_ty = types.resolve(&field.ty)?;
        let value = cast(types, value, &field_ty, field.nullable)?;
        self.0
            .storage
            .borrow_mut()
            .insert(field.wire_name.clone(), unbox(&value));
        self.0.validated.borrow_mut().insert(index);
        Ok(())
    }

    /// Stored value of a field, without validation or boxing.
    pub fn raw_field(&self, name: &str) -> Option<Value> {
        let (_, field) = self.0.ty.field(name)?;
        self.0.storage.borrow().get(&field.wire_name).cloned()
    }

    fn field(&self, name: &str) -> RuntimeResult<(usize, &FieldDef)> {
        self.0.ty.field(name).ok_or_else(|| {
            RuntimeError::validation(
                format!("{}.{}", self.0.ty.name(), name),
                "declared field",
                "unknown field",
            )
        })
    }

    // =========================================================================
    // Copies and snapshots
    // =========================================================================

    /// Shallow copy of the field storage. Keeps the runtime-created marker.
    pub fn clone_instance(&self) -> Instance {
        Instance(Rc::new(InstanceData {
            ty: self.0.ty.clone(),
            storage: Rc::new(RefCell::new(self.0.storage.borrow().clone())),
            runtime_created: self.0.runtime_created,
            synthesized: self.0.synthesized,
            validated: RefCell::new(self.0.validated.borrow().clone()),
        }))
    }

    /// Field name to boxed value, read through the validating accessor.
    /// A synthesized instance returns its backing dictionary itself.
    pub fn mapping(&self, types: &TypeRegistry) -> RuntimeResult<Value> {
        if self.0.synthesized {
            return Ok(Value::Map(self.0.storage.clone()));
        }
        let mut dict = Dict::with_capacity(self.0.ty.fields().len());
        for field in self.0.ty.fields() {
            dict.insert(field.name.clone(), self.get(types, &field.name)?);
        }
        Ok(Value::map(dict))
    }

    /// Copy of the wire-keyed storage.
    pub fn wire_mapping(&self) -> Dict {
        self.0.storage.borrow().clone()
    }

    /// Read every field once, failing on the first invalid one. With `deep`,
    /// nested struct values (directly, or as elements of typed slices and
    /// mappings) are validated too, up to `max_depth` levels.
    pub fn validate_all(&self, types: &TypeRegistry, deep: bool, max_depth: usize) -> RuntimeResult<()> {
        self.validate_at(types, deep, 0, max_depth)
    }

    fn validate_at(
        &self,
        types: &TypeRegistry,
        deep: bool,
        depth: usize,
        max_depth: usize,
    ) -> RuntimeResult<()> {
        if depth > max_depth {
            return Err(RuntimeError::Serialization(format!(
                "`{}` nested deeper than {}",
                self.0.ty.name(),
                max_depth
            )));
        }
        for field in self.0.ty.fields() {
            let value = self.get(types, &field.name)?;
            if deep {
                validate_nested(types, &value, depth + 1, max_depth)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Equality
    // =========================================================================

    /// Field-wise equality in declaration order. Field comparisons are
    /// awaited one after another and the first mismatch settles the result,
    /// so later fields are never compared.
    pub fn equals(&self, rt: &Runtime, other: &Instance) -> Promise {
        let sched = rt.scheduler();
        if self.ptr_eq(other) {
            return Promise::resolved(sched, Value::Bool(true));
        }
        if !Rc::ptr_eq(self.ty(), other.ty()) {
            return Promise::resolved(sched, Value::Bool(false));
        }

        let (left, right, rt) = (self.clone(), other.clone(), rt.clone());
        let count = self.0.ty.fields().len() as u32;
        Continuation::spawn(sched, move |frame| {
            let state = frame.state;
            let index = state / 2;
            if state % 2 == 1 {
                if frame.take_value().as_bool() != Some(true) {
                    return Ok(Step::Return(Value::Bool(false)));
                }
                return Ok(Step::Goto(state + 1));
            }
            if index >= count {
                return Ok(Step::Return(Value::Bool(true)));
            }
            let field = &left.0.ty.fields()[index as usize];
            let types = rt.types();
            let l = left.get(types, &field.name)?;
            let r = right.get(types, &field.name)?;
            let field_ty = types.resolve(&field.ty)?;
            let cmp = structural_equals(&rt, &l, &r, &field_ty);
            Ok(Step::await_at(cmp, state + 1))
        })
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.0.ty.name())
            .field("storage", &self.0.storage.borrow())
            .field("runtime_created", &self.0.runtime_created)
            .finish()
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Representation name a field must hold, e.g. `int` or `map or record`.
fn expected_repr(types: &TypeRegistry, field: &FieldDef) -> RuntimeResult<&'static str> {
    let root_ref = field.root.as_ref().unwrap_or(&field.ty);
    let root = types.root_of(&types.resolve(root_ref)?)?;
    Ok(match (root.kind(), root.primitive()) {
        (TypeKind::Primitive, Some(kind)) => kind.repr_name(),
        (TypeKind::Struct | TypeKind::Class, _) => "map or record",
        _ => "any",
    })
}

fn validate_field(types: &TypeRegistry, field: &FieldDef, raw: &Value) -> RuntimeResult<()> {
    let expected = expected_repr(types, field)?;
    if raw.is_null() {
        if field.nullable {
            return Ok(());
        }
        return Err(RuntimeError::validation(field.name.as_str(), expected, "null"));
    }
    let found = raw.repr();
    let ok = match expected {
        "any" => true,
        "map or record" => matches!(found, Repr::Map | Repr::Instance),
        _ => PrimitiveKind::ALL
            .iter()
            .find(|k| k.repr_name() == expected)
            .map_or(false, |k| repr_matches(*k, found)),
    };
    if ok {
        Ok(())
    } else {
        Err(RuntimeError::validation(field.name.as_str(), expected, found.name()))
    }
}

fn validate_nested(types: &TypeRegistry, value: &Value, depth: usize, max_depth: usize) -> RuntimeResult<()> {
    match value {
        Value::Instance(inst) if !inst.is_runtime_created() => {
            inst.validate_at(types, true, depth, max_depth)
        }
        Value::Boxed(b) => {
            let elem_ty = match (b.ty().primitive(), b.ty().generic_args().first()) {
                (Some(PrimitiveKind::List | PrimitiveKind::Map), Some(arg))
                    if arg.kind().has_fields() =>
                {
                    arg.clone()
                }
                _ => return Ok(()),
            };
            let elems: Vec<Value> = match b.raw() {
                Value::List(items) => items.borrow().clone(),
                Value::Map(dict) => dict.borrow().values().cloned().collect(),
                _ => return Ok(()),
            };
            for elem in elems {
                if elem.is_null() {
                    continue;
                }
                let elem = box_as(types, elem, &elem_ty)?;
                validate_nested(types, &elem, depth, max_depth)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_common_core::TypeRef;

    use crate::registry::TypeBuilder;

    fn point(rt: &Runtime) -> TypeHandle {
        let mut b = TypeBuilder::new("geo.Point", TypeKind::Struct);
        b.field(FieldDef::new("x", TypeRef::primitive(PrimitiveKind::Int)).default_value(Value::Int(0)))
            .field(
                FieldDef::new("y", TypeRef::primitive(PrimitiveKind::Int))
                    .wire_name("Y")
                    .default_value(Value::Int(0)),
            )
            .field(FieldDef::new("label", TypeRef::primitive(PrimitiveKind::String)).nullable());
        rt.types().register(b).unwrap()
    }

    #[test]
    fn test_construct_defaults_and_wire_names() {
        let rt = Runtime::new();
        let ty = point(&rt);
        let p = Instance::construct(rt.types(), &ty, vec![("y", Value::Int(4))]).unwrap();
        assert!(p.is_runtime_created());
        assert_eq!(p.get(rt.types(), "x").unwrap().as_int(), Some(0));
        assert_eq!(p.get(rt.types(), "y").unwrap().as_int(), Some(4));
        assert!(p.get(rt.types(), "label").unwrap().is_null());
        assert!(p.wire_mapping().contains_key("Y"));
        assert!(Instance::construct(rt.types(), &ty, vec![("z", Value::Int(1))]).is_err());
        assert!(Instance::construct(rt.types(), &ty, vec![("x", Value::str("no"))])
            .unwrap_err()
            .is_type_error());
    }

    #[test]
    fn test_lazy_validation_on_read() {
        let rt = Runtime::new();
        let ty = point(&rt);
        let mut storage = Dict::new();
        storage.insert("x".into(), Value::str("oops"));
        storage.insert("Y".into(), Value::Int(1));
        let p = Instance::from_storage(&ty, storage);
        assert_eq!(p.get(rt.types(), "y").unwrap().as_int(), Some(1));
        let err = p.get(rt.types(), "x").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Validation { ref field, ref expected, ref found }
                if field == "x" && expected == "int" && found == "string"
        ));
        p.set(rt.types(), "x", Value::Int(3)).unwrap();
        assert_eq!(p.get(rt.types(), "x").unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_clone_is_shallow_and_keeps_marker() {
        let rt = Runtime::new();
        let ty = point(&rt);
        let p = Instance::construct(rt.types(), &ty, vec![]).unwrap();
        let c = p.clone_instance();
        assert!(c.is_runtime_created());
        c.set(rt.types(), "x", Value::Int(9)).unwrap();
        assert_eq!(p.get(rt.types(), "x").unwrap().as_int(), Some(0));
    }

    #[test]
    fn test_mapping_by_field_name() {
        let rt = Runtime::new();
        let ty = point(&rt);
        let p = Instance::construct(rt.types(), &ty, vec![("y", Value::Int(2))]).unwrap();
        match p.mapping(rt.types()).unwrap() {
            Value::Map(d) => {
                let d = d.borrow();
                assert_eq!(d.keys().cloned().collect::<Vec<_>>(), vec!["x", "y", "label"]);
            }
            other => panic!("expected map, got {:?}", other),
        }

        let dict = Rc::new(RefCell::new(Dict::new()));
        let s = Instance::synthesize(&ty, dict.clone());
        match s.mapping(rt.types()).unwrap() {
            Value::Map(d) => assert!(Rc::ptr_eq(&d, &dict)),
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_equals() {
        let rt = Runtime::new();
        let ty = point(&rt);
        let a = Instance::construct(rt.types(), &ty, vec![("x", Value::Int(1))]).unwrap();
        let b = Instance::construct(rt.types(), &ty, vec![("x", Value::Int(1))]).unwrap();
        let c = Instance::construct(rt.types(), &ty, vec![("x", Value::Int(2))]).unwrap();
        assert_eq!(rt.block_on(&a.equals(&rt, &b)).unwrap().as_bool(), Some(true));
        assert_eq!(rt.block_on(&a.equals(&rt, &c)).unwrap().as_bool(), Some(false));
    }
}

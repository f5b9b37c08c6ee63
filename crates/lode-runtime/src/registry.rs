//! Type registry: type identity to descriptor.
//!
//! Descriptors are immutable once registered and shared as `Rc` handles, so
//! identity comparisons are pointer comparisons. Generic types register a
//! template; each distinct argument tuple is instantiated once and cached
//! under its composed id (`base<arg,arg>`).
//!
//! Interface conformance is structural (signature containment) and cached
//! per (value type, interface) pair.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use hashbrown::HashMap;
use lode_common_core::{
    BuiltinType, MemberKind, MemberSig, PrimitiveKind, Signature, TypeKind, TypeRef,
    BUILTIN_MODULE,
};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::Runtime;
use crate::sched::Promise;
use crate::value::Value;

pub type TypeHandle = Rc<TypeDescriptor>;

/// Custom equality hook. Receives both operands; may complete asynchronously.
pub type EqualsFn = Rc<dyn Fn(&Runtime, &Value, &Value) -> Promise>;

/// Default-value provider for a struct field.
pub type DefaultFn = Rc<dyn Fn() -> Value>;

/// Builds one instantiation of a generic type from its resolved arguments.
pub type GenericBuildFn = Rc<dyn Fn(&mut TypeBuilder, &[TypeHandle]) -> RuntimeResult<()>>;

// =============================================================================
// Field descriptors
// =============================================================================

/// Declared struct field.
///
/// The field type is a reference resolved through the registry on use, which
/// lets struct graphs refer to themselves or to types declared later.
#[derive(Clone)]
pub struct FieldDef {
    pub name: String,
    /// Key used in storage and on the wire.
    pub wire_name: String,
    pub ty: TypeRef,
    /// Representation checked by lazy validation. Defaults to the root of `ty`.
    pub root: Option<TypeRef>,
    pub nullable: bool,
    pub default: Option<DefaultFn>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        let name = name.into();
        Self {
            wire_name: name.clone(),
            name,
            ty,
            root: None,
            nullable: false,
            default: None,
        }
    }

    pub fn wire_name(mut self, wire_name: impl Into<String>) -> Self {
        self.wire_name = wire_name.into();
        self
    }

    pub fn root(mut self, root: TypeRef) -> Self {
        self.root = Some(root);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_with(mut self, f: impl Fn() -> Value + 'static) -> Self {
        self.default = Some(Rc::new(f));
        self
    }

    /// Shorthand for a constant default.
    pub fn default_value(self, value: Value) -> Self {
        self.default_with(move || value.clone())
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("wire_name", &self.wire_name)
            .field("ty", &self.ty.to_string())
            .field("nullable", &self.nullable)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

// =============================================================================
// Type descriptors
// =============================================================================

pub struct TypeDescriptor {
    index: u32,
    id: String,
    name: String,
    alias: Option<String>,
    kind: TypeKind,
    builtin: Option<BuiltinType>,
    primitive: Option<PrimitiveKind>,
    root: Option<TypeRef>,
    parents: Vec<TypeRef>,
    generic_base: Option<String>,
    generic_args: Vec<TypeHandle>,
    type_ref: TypeRef,
    signature: Signature,
    fields: Vec<FieldDef>,
    equals: Option<EqualsFn>,
}

impl TypeDescriptor {
    /// Registration order; stable for the lifetime of the registry.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    #[inline]
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn builtin(&self) -> Option<BuiltinType> {
        self.builtin
    }

    pub fn primitive(&self) -> Option<PrimitiveKind> {
        self.primitive
    }

    /// Underlying type reference of a nominal type.
    pub fn root_ref(&self) -> Option<&TypeRef> {
        self.root.as_ref()
    }

    pub fn parents(&self) -> &[TypeRef] {
        &self.parents
    }

    pub fn generic_args(&self) -> &[TypeHandle] {
        &self.generic_args
    }

    pub fn type_ref(&self) -> &TypeRef {
        &self.type_ref
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<(usize, &FieldDef)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == name)
    }

    pub fn field_by_wire(&self, wire_name: &str) -> Option<(usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.wire_name == wire_name)
    }

    pub fn equals_hook(&self) -> Option<&EqualsFn> {
        self.equals.as_ref()
    }

    #[inline]
    pub fn is_any(&self) -> bool {
        self.builtin == Some(BuiltinType::Any)
    }

    #[inline]
    pub fn is_struct_marker(&self) -> bool {
        self.builtin == Some(BuiltinType::Struct)
    }

    #[inline]
    pub fn is_nominal(&self) -> bool {
        self.kind == TypeKind::Nominal
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fields", &self.fields.len())
            .field("members", &self.signature.len())
            .finish()
    }
}

// =============================================================================
// TypeBuilder
// =============================================================================

/// Accumulates a descriptor before registration.
pub struct TypeBuilder {
    id: String,
    name: String,
    alias: Option<String>,
    kind: TypeKind,
    builtin: Option<BuiltinType>,
    primitive: Option<PrimitiveKind>,
    root: Option<TypeRef>,
    parents: Vec<TypeRef>,
    generic_base: Option<String>,
    generic_args: Vec<TypeHandle>,
    type_ref: TypeRef,
    signature: Signature,
    fields: Vec<FieldDef>,
    equals: Option<EqualsFn>,
}

impl TypeBuilder {
    pub fn new(id: impl Into<String>, kind: TypeKind) -> Self {
        let id = id.into();
        let name = id.rsplit('.').next().unwrap_or(&id).to_string();
        Self {
            type_ref: TypeRef::named(id.clone()),
            id,
            name,
            alias: None,
            kind,
            builtin: None,
            primitive: None,
            root: None,
            parents: Vec::new(),
            generic_base: None,
            generic_args: Vec::new(),
            signature: Signature::new(),
            fields: Vec::new(),
            equals: None,
        }
    }

    fn marker(builtin: BuiltinType) -> Self {
        let mut b = Self::new(builtin.as_str(), TypeKind::Builtin);
        b.builtin = Some(builtin);
        b.type_ref = TypeRef::builtin(builtin);
        b
    }

    fn primitive_type(kind: PrimitiveKind) -> Self {
        let mut b = Self::new(kind.qualified_name(), TypeKind::Primitive);
        b.primitive = Some(kind);
        b
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn alias(&mut self, alias: impl Into<String>) -> &mut Self {
        self.alias = Some(alias.into());
        self
    }

    /// Underlying type of a nominal wrapper.
    pub fn root(&mut self, root: TypeRef) -> &mut Self {
        self.root = Some(root);
        self
    }

    /// Declare that this type derives from `parent` (class composition).
    pub fn parent(&mut self, parent: TypeRef) -> &mut Self {
        self.parents.push(parent);
        self
    }

    pub fn member(&mut self, name: &str, kind: MemberKind, ty: TypeRef) -> &mut Self {
        self.signature.push(MemberSig::new(name, kind, ty));
        self
    }

    /// Declare a field. Fields are exposed as properties in the signature.
    pub fn field(&mut self, field: FieldDef) -> &mut Self {
        self.signature
            .push(MemberSig::new(field.name.as_str(), MemberKind::Property, field.ty.clone()));
        self.fields.push(field);
        self
    }

    pub fn equals(&mut self, f: impl Fn(&Runtime, &Value, &Value) -> Promise + 'static) -> &mut Self {
        self.equals = Some(Rc::new(f));
        self
    }

    fn finish(mut self, index: u32) -> TypeDescriptor {
        if self.kind == TypeKind::Struct {
            let this = self.type_ref.clone();
            let string = TypeRef::primitive(PrimitiveKind::String);
            let builtin_members = [
                ("Parse", MemberKind::Constructor, this.clone()),
                ("equals", MemberKind::Operator, TypeRef::primitive(PrimitiveKind::Bool)),
                ("Stringify", MemberKind::Function, string.clone()),
                ("Mapping", MemberKind::Function, TypeRef::primitive(PrimitiveKind::Map)),
                ("Clone", MemberKind::Function, this),
                ("String", MemberKind::Function, string),
            ];
            for (name, kind, ty) in builtin_members {
                self.signature.push(MemberSig::new(name, kind, ty));
            }
        }
        TypeDescriptor {
            index,
            id: self.id,
            name: self.name,
            alias: self.alias,
            kind: self.kind,
            builtin: self.builtin,
            primitive: self.primitive,
            root: self.root,
            parents: self.parents,
            generic_base: self.generic_base,
            generic_args: self.generic_args,
            type_ref: self.type_ref,
            signature: self.signature,
            fields: self.fields,
            equals: self.equals,
        }
    }
}

/// A generic type awaiting instantiation.
#[derive(Clone)]
pub struct GenericTemplate {
    pub id: String,
    pub name: String,
    pub kind: TypeKind,
    pub arity: usize,
    pub alias: Option<String>,
    pub build: GenericBuildFn,
}

impl GenericTemplate {
    pub fn new(
        id: impl Into<String>,
        kind: TypeKind,
        arity: usize,
        build: impl Fn(&mut TypeBuilder, &[TypeHandle]) -> RuntimeResult<()> + 'static,
    ) -> Self {
        let id = id.into();
        let name = id.rsplit('.').next().unwrap_or(&id).to_string();
        Self {
            id,
            name,
            kind,
            arity,
            alias: None,
            build: Rc::new(build),
        }
    }
}

fn primitive_generic(kind: PrimitiveKind) -> GenericTemplate {
    GenericTemplate::new(kind.qualified_name(), TypeKind::Primitive, 1, move |b, _| {
        b.primitive = Some(kind);
        Ok(())
    })
}

fn instance_key(base: &str, args: &[TypeHandle]) -> String {
    let args: Vec<&str> = args.iter().map(|a| a.id()).collect();
    format!("{}<{}>", base, args.join(","))
}

// =============================================================================
// TypeRegistry
// =============================================================================

pub struct TypeRegistry {
    types: RefCell<HashMap<String, TypeHandle>>,
    aliases: RefCell<HashMap<String, String>>,
    templates: RefCell<HashMap<String, GenericTemplate>>,
    /// (value type index, interface index) -> conforms
    conformance: RefCell<HashMap<(u32, u32), bool>>,
    next_index: Cell<u32>,
    markers: Vec<TypeHandle>,
    primitives: Vec<TypeHandle>,
}

impl TypeRegistry {
    /// Registry holding the builtin markers and primitive types.
    pub fn new() -> Self {
        let mut reg = Self {
            types: RefCell::new(HashMap::new()),
            aliases: RefCell::new(HashMap::new()),
            templates: RefCell::new(HashMap::new()),
            conformance: RefCell::new(HashMap::new()),
            next_index: Cell::new(0),
            markers: Vec::new(),
            primitives: Vec::new(),
        };

        let markers: Vec<TypeHandle> = BuiltinType::ALL
            .iter()
            .map(|b| reg.insert(TypeBuilder::marker(*b)))
            .collect();
        let any = markers[0].clone();
        reg.markers = markers;

        let mut primitives = Vec::with_capacity(PrimitiveKind::ALL.len());
        for kind in PrimitiveKind::ALL {
            let handle = if kind.is_generic() {
                let template = primitive_generic(kind);
                let mut builder = reg.instance_builder(&template, &[any.clone()]);
                builder.primitive = Some(kind);
                let handle = reg.insert(builder);
                reg.templates.borrow_mut().insert(template.id.clone(), template);
                handle
            } else {
                reg.insert(TypeBuilder::primitive_type(kind))
            };
            primitives.push(handle);
        }
        reg.primitives = primitives;
        reg
    }

    fn insert(&self, builder: TypeBuilder) -> TypeHandle {
        let index = self.next_index.get();
        self.next_index.set(index + 1);
        let handle = Rc::new(builder.finish(index));
        if let Some(alias) = handle.alias() {
            self.aliases
                .borrow_mut()
                .insert(alias.to_string(), handle.id().to_string());
        }
        self.types
            .borrow_mut()
            .insert(handle.id().to_string(), handle.clone());
        handle
    }

    /// Register a fully built type.
    pub fn register(&self, builder: TypeBuilder) -> RuntimeResult<TypeHandle> {
        if self.contains(builder.id()) {
            return Err(RuntimeError::Module(format!(
                "type `{}` registered twice",
                builder.id()
            )));
        }
        let handle = self.insert(builder);
        tracing::trace!(id = handle.id(), kind = handle.kind().as_str(), "type registered");
        Ok(handle)
    }

    /// Register a generic type template.
    pub fn register_generic(&self, template: GenericTemplate) -> RuntimeResult<()> {
        if self.contains(&template.id) {
            return Err(RuntimeError::Module(format!(
                "type `{}` registered twice",
                template.id
            )));
        }
        if let Some(alias) = &template.alias {
            self.aliases
                .borrow_mut()
                .insert(alias.clone(), template.id.clone());
        }
        self.templates
            .borrow_mut()
            .insert(template.id.clone(), template);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.borrow().contains_key(id) || self.templates.borrow().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.types.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.borrow().is_empty()
    }

    /// Look up a non-generic type by id or alias.
    pub fn resolve_id(&self, id: &str) -> RuntimeResult<TypeHandle> {
        if let Some(t) = self.types.borrow().get(id) {
            return Ok(t.clone());
        }
        let target = self.aliases.borrow().get(id).cloned();
        target
            .and_then(|target| self.types.borrow().get(&target).cloned())
            .ok_or_else(|| RuntimeError::UnknownType(id.to_string()))
    }

    pub fn resolve(&self, r: &TypeRef) -> RuntimeResult<TypeHandle> {
        match r {
            TypeRef::Builtin { builtin } => Ok(self.marker(*builtin)),
            TypeRef::Named { path, generics } if generics.is_empty() => self.resolve_id(path),
            TypeRef::Named { path, generics } => {
                let args = generics
                    .iter()
                    .map(|g| self.resolve(g))
                    .collect::<RuntimeResult<Vec<_>>>()?;
                self.instantiate(path, &args)
            }
        }
    }

    /// Instantiate a generic type. Equal argument tuples yield the same handle.
    pub fn instantiate(&self, generic_id: &str, args: &[TypeHandle]) -> RuntimeResult<TypeHandle> {
        let template = {
            let templates = self.templates.borrow();
            let found = templates.get(generic_id).cloned().or_else(|| {
                let alias = self.aliases.borrow().get(generic_id).cloned()?;
                templates.get(&alias).cloned()
            });
            found.ok_or_else(|| RuntimeError::UnknownType(generic_id.to_string()))?
        };
        if args.len() != template.arity {
            return Err(RuntimeError::type_mismatch(
                format!("{} type arguments", args.len()),
                format!("{} (arity {})", template.id, template.arity),
            ));
        }

        let key = instance_key(&template.id, args);
        if let Some(t) = self.types.borrow().get(&key) {
            return Ok(t.clone());
        }

        // The build callback may resolve other types, so no borrow is held.
        let mut builder = self.instance_builder(&template, args);
        (template.build)(&mut builder, args)?;
        let handle = self.insert(builder);
        tracing::trace!(id = handle.id(), "generic instantiated");
        Ok(handle)
    }

    fn instance_builder(&self, template: &GenericTemplate, args: &[TypeHandle]) -> TypeBuilder {
        let mut b = TypeBuilder::new(instance_key(&template.id, args), template.kind);
        let arg_names: Vec<&str> = args.iter().map(|a| a.name()).collect();
        b.name = format!("{}<{}>", template.name, arg_names.join(","));
        b.generic_base = Some(template.id.clone());
        b.generic_args = args.to_vec();
        b.type_ref = TypeRef::generic(
            template.id.clone(),
            args.iter().map(|a| a.type_ref().clone()).collect(),
        );
        b
    }

    // =========================================================================
    // Builtins
    // =========================================================================

    pub fn marker(&self, builtin: BuiltinType) -> TypeHandle {
        let idx = BuiltinType::ALL
            .iter()
            .position(|b| *b == builtin)
            .unwrap_or(0);
        self.markers[idx].clone()
    }

    #[inline]
    pub fn any(&self) -> TypeHandle {
        self.marker(BuiltinType::Any)
    }

    /// Primitive type. Generic kinds yield their `<any>` instantiation.
    pub fn primitive(&self, kind: PrimitiveKind) -> TypeHandle {
        self.primitives[kind as usize].clone()
    }

    /// Concrete type of a value. Raw host values map to builtin primitives.
    pub fn type_of(&self, value: &Value) -> TypeHandle {
        match value {
            Value::Null => self.marker(BuiltinType::Null),
            Value::Bool(_) => self.primitive(PrimitiveKind::Bool),
            Value::Int(_) => self.primitive(PrimitiveKind::Int),
            Value::Float(_) => self.primitive(PrimitiveKind::Float),
            Value::Str(_) => self.primitive(PrimitiveKind::String),
            Value::List(_) => self.primitive(PrimitiveKind::List),
            Value::Map(_) => self.primitive(PrimitiveKind::Map),
            Value::Boxed(b) => b.ty().clone(),
            Value::Instance(i) => i.ty().clone(),
        }
    }

    // =========================================================================
    // Relations
    // =========================================================================

    /// Underlying host-representation type: follows nominal roots, identity
    /// for everything else.
    pub fn root_of(&self, ty: &TypeHandle) -> RuntimeResult<TypeHandle> {
        let mut current = ty.clone();
        let mut hops = 0usize;
        while let (TypeKind::Nominal, Some(root)) = (current.kind(), current.root_ref()) {
            hops += 1;
            if hops > self.len() {
                return Err(RuntimeError::invalid_state(format!(
                    "nominal root cycle at `{}`",
                    ty.id()
                )));
            }
            current = self.resolve(root)?;
        }
        Ok(current)
    }

    /// True if `ty` is `target`, derives from it, or is an instantiation of
    /// the same generic whose target arguments are all `any`.
    pub fn derives_from(&self, ty: &TypeHandle, target: &TypeHandle) -> bool {
        if Rc::ptr_eq(ty, target) {
            return true;
        }
        if let (Some(a), Some(b)) = (&ty.generic_base, &target.generic_base) {
            if a == b
                && ty.generic_args.len() == target.generic_args.len()
                && target.generic_args.iter().all(|g| g.is_any())
            {
                return true;
            }
        }
        ty.parents().iter().any(|p| {
            self.resolve(p)
                .map_or(false, |parent| self.derives_from(&parent, target))
        })
    }

    /// Structural conformance of `ty` to interface `iface`, cached per pair.
    pub fn conforms(&self, ty: &TypeHandle, iface: &TypeHandle) -> bool {
        let key = (ty.index(), iface.index());
        if let Some(&ok) = self.conformance.borrow().get(&key) {
            return ok;
        }
        let ok = ty.signature().is_superset_of(iface.signature());
        if !ok {
            tracing::trace!(
                ty = ty.id(),
                iface = iface.id(),
                missing = ty.signature().missing(iface.signature()).len(),
                "interface not satisfied"
            );
        }
        self.conformance.borrow_mut().insert(key, ok);
        ok
    }

    /// Id of the builtin module path, for callers composing type ids.
    pub fn builtin_module(&self) -> &'static str {
        BUILTIN_MODULE
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Module registry: namespaced type declarations and ordered module init.
//!
//! Modules are kept in an arena indexed by [`ModuleId`]. Declaring a module
//! registers its types with the runtime's type registry immediately;
//! `module_init` callbacks are collected and run by [`ModuleRegistry::ready`]
//! in dependency order, one after another, each possibly asynchronous.

use hashbrown::HashMap;
use lode_runtime::{
    Continuation, Dict, GenericTemplate, Maybe, Promise, Runtime, RuntimeError, RuntimeResult,
    Step, TypeBuilder, TypeHandle, TypeKind, Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u32);

impl ModuleId {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

pub type InitFn = Box<dyn FnOnce(&Runtime) -> RuntimeResult<Maybe>>;

#[derive(Debug)]
pub struct Module {
    id: ModuleId,
    path: String,
    /// Declared name -> registry id.
    types: Vec<(String, String)>,
    exports: Dict,
}

impl Module {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn type_id(&self, name: &str) -> Option<&str> {
        self.types
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| id.as_str())
    }

    pub fn exports(&self) -> &Dict {
        &self.exports
    }
}

struct InitEntry {
    id: String,
    module: ModuleId,
    deps: Vec<String>,
    callback: Option<InitFn>,
}

pub struct ModuleRegistry {
    rt: Runtime,
    modules: Vec<Module>,
    by_path: HashMap<String, ModuleId>,
    inits: Vec<InitEntry>,
    init_index: HashMap<String, usize>,
}

impl ModuleRegistry {
    pub fn new(rt: &Runtime) -> Self {
        Self {
            rt: rt.clone(),
            modules: Vec::new(),
            by_path: HashMap::new(),
            inits: Vec::new(),
            init_index: HashMap::new(),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Declare (or reopen) the module at `path` and run `init` against its
    /// declaration scope.
    pub fn declare_module(
        &mut self,
        path: &str,
        init: impl FnOnce(&mut ModuleScope<'_>) -> RuntimeResult<()>,
    ) -> RuntimeResult<ModuleId> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(RuntimeError::Module(format!("invalid module path `{}`", path)));
        }
        let id = match self.by_path.get(path) {
            Some(&id) => id,
            None => {
                let id = ModuleId(self.modules.len() as u32);
                self.modules.push(Module {
                    id,
                    path: path.to_string(),
                    types: Vec::new(),
                    exports: Dict::new(),
                });
                self.by_path.insert(path.to_string(), id);
                id
            }
        };
        let mut scope = ModuleScope { registry: self, module: id };
        init(&mut scope)?;
        Ok(id)
    }

    pub fn lookup(&self, path: &str) -> Option<ModuleId> {
        self.by_path.get(path).copied()
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The global namespace: nested maps following each module path, whose
    /// leaves hold the module's type ids (as strings) and exports.
    pub fn namespace(&self) -> Value {
        let root = Value::map(Dict::new());
        for module in &self.modules {
            let mut node = root.clone();
            for segment in module.path.split('.') {
                node = child_map(&node, segment);
            }
            if let Value::Map(dict) = &node {
                let mut dict = dict.borrow_mut();
                for (name, id) in &module.types {
                    dict.insert(name.clone(), Value::str(id));
                }
                for (name, value) in &module.exports {
                    dict.insert(name.clone(), value.clone());
                }
            }
        }
        root
    }

    /// Order pending init entries so every entry follows its dependencies.
    fn init_order(&self) -> RuntimeResult<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }

        fn visit(
            reg: &ModuleRegistry,
            i: usize,
            marks: &mut [Mark],
            order: &mut Vec<usize>,
        ) -> RuntimeResult<()> {
            match marks[i] {
                Mark::Done => return Ok(()),
                Mark::Visiting => {
                    return Err(RuntimeError::invalid_state(format!(
                        "module init cycle through `{}`",
                        reg.inits[i].id
                    )))
                }
                Mark::New => {}
            }
            marks[i] = Mark::Visiting;
            for dep in &reg.inits[i].deps {
                let j = *reg.init_index.get(dep).ok_or_else(|| {
                    RuntimeError::Module(format!(
                        "init `{}` depends on unknown init `{}`",
                        reg.inits[i].id, dep
                    ))
                })?;
                visit(reg, j, marks, order)?;
            }
            marks[i] = Mark::Done;
            order.push(i);
            Ok(())
        }

        let mut marks = vec![Mark::New; self.inits.len()];
        let mut order = Vec::with_capacity(self.inits.len());
        for i in 0..self.inits.len() {
            visit(self, i, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    /// Run every collected init callback in dependency order. Resolves to the
    /// namespace once the last one completes; an init failure rejects.
    /// Callbacks run once: a second `ready` only rebuilds the namespace.
    pub fn ready(&mut self) -> Promise {
        let sched = self.rt.scheduler().clone();
        let order = match self.init_order() {
            Ok(order) => order,
            Err(e) => return Promise::rejected(&sched, e),
        };

        let mut queue: Vec<(String, InitFn)> = Vec::with_capacity(order.len());
        for i in order {
            let entry = &mut self.inits[i];
            if let Some(cb) = entry.callback.take() {
                let path = self.modules[entry.module.0 as usize].path.clone();
                queue.push((format!("{}:{}", path, entry.id), cb));
            }
        }
        tracing::debug!(count = queue.len(), "running module inits");

        let namespace = self.namespace();
        let rt = self.rt.clone();
        let mut queue: Vec<Option<(String, InitFn)>> = queue.into_iter().map(Some).collect();
        Continuation::spawn(&sched, move |f| {
            let i = f.state as usize;
            let (name, cb) = match queue.get_mut(i).and_then(Option::take) {
                Some(next) => next,
                None => return Ok(Step::Return(namespace.clone())),
            };
            tracing::debug!(init = %name, "module init");
            match cb(&rt)? {
                Maybe::Ready(_) => Ok(Step::Goto(f.state + 1)),
                Maybe::Pending(p) => Ok(Step::await_at(p, f.state + 1)),
            }
        })
    }
}

fn child_map(node: &Value, segment: &str) -> Value {
    let dict = match node {
        Value::Map(dict) => dict,
        _ => return node.clone(),
    };
    let existing = dict.borrow().get(segment).cloned();
    if let Some(child @ Value::Map(_)) = existing {
        return child;
    }
    let child = Value::map(Dict::new());
    dict.borrow_mut().insert(segment.to_string(), child.clone());
    child
}

// =============================================================================
// ModuleScope
// =============================================================================

/// Declaration surface handed to a module initializer.
pub struct ModuleScope<'a> {
    registry: &'a mut ModuleRegistry,
    module: ModuleId,
}

impl ModuleScope<'_> {
    pub fn id(&self) -> ModuleId {
        self.module
    }

    pub fn path(&self) -> &str {
        &self.registry.modules[self.module.0 as usize].path
    }

    pub fn runtime(&self) -> &Runtime {
        &self.registry.rt
    }

    /// Declare a struct. `generics` names the type parameters; a non-empty
    /// list registers a template whose `build` receives the arguments of
    /// each instantiation, otherwise `build` runs once with no arguments.
    pub fn declare_struct(
        &mut self,
        id: &str,
        name: &str,
        generics: &[&str],
        alias: Option<&str>,
        build: impl Fn(&mut TypeBuilder, &[TypeHandle]) -> RuntimeResult<()> + 'static,
    ) -> RuntimeResult<()> {
        self.declare(TypeKind::Struct, id, name, generics, alias, build)
    }

    pub fn declare_class(
        &mut self,
        id: &str,
        name: &str,
        generics: &[&str],
        alias: Option<&str>,
        build: impl Fn(&mut TypeBuilder, &[TypeHandle]) -> RuntimeResult<()> + 'static,
    ) -> RuntimeResult<()> {
        self.declare(TypeKind::Class, id, name, generics, alias, build)
    }

    pub fn declare_interface(
        &mut self,
        id: &str,
        name: &str,
        generics: &[&str],
        alias: Option<&str>,
        build: impl Fn(&mut TypeBuilder, &[TypeHandle]) -> RuntimeResult<()> + 'static,
    ) -> RuntimeResult<()> {
        self.declare(TypeKind::Interface, id, name, generics, alias, build)
    }

    pub fn declare_nominal_type(
        &mut self,
        id: &str,
        name: &str,
        generics: &[&str],
        alias: Option<&str>,
        build: impl Fn(&mut TypeBuilder, &[TypeHandle]) -> RuntimeResult<()> + 'static,
    ) -> RuntimeResult<()> {
        self.declare(TypeKind::Nominal, id, name, generics, alias, build)
    }

    fn declare(
        &mut self,
        kind: TypeKind,
        id: &str,
        name: &str,
        generics: &[&str],
        alias: Option<&str>,
        build: impl Fn(&mut TypeBuilder, &[TypeHandle]) -> RuntimeResult<()> + 'static,
    ) -> RuntimeResult<()> {
        let types = self.registry.rt.types();
        if generics.is_empty() {
            let mut b = TypeBuilder::new(id, kind);
            b.name(name);
            if let Some(alias) = alias {
                b.alias(alias);
            }
            build(&mut b, &[])?;
            types.register(b)?;
        } else {
            let mut template = GenericTemplate::new(id, kind, generics.len(), build);
            template.name = name.to_string();
            template.alias = alias.map(str::to_string);
            types.register_generic(template)?;
        }
        tracing::debug!(module = %self.path(), ty = %id, kind = kind.as_str(), "declared type");
        self.registry.modules[self.module.0 as usize]
            .types
            .push((name.to_string(), id.to_string()));
        Ok(())
    }

    /// Publish a value under `name` in this module's namespace.
    pub fn export(&mut self, name: &str, value: Value) {
        self.registry.modules[self.module.0 as usize]
            .exports
            .insert(name.to_string(), value);
    }

    /// Queue an init callback that runs after the inits named in `deps`.
    pub fn module_init(
        &mut self,
        id: &str,
        deps: &[&str],
        callback: impl FnOnce(&Runtime) -> RuntimeResult<Maybe> + 'static,
    ) -> RuntimeResult<()> {
        if self.registry.init_index.contains_key(id) {
            return Err(RuntimeError::Module(format!("duplicate module init `{}`", id)));
        }
        let reg = &mut *self.registry;
        reg.init_index.insert(id.to_string(), reg.inits.len());
        reg.inits.push(InitEntry {
            id: id.to_string(),
            module: self.module,
            deps: deps.iter().map(|d| d.to_string()).collect(),
            callback: Some(Box::new(callback)),
        });
        Ok(())
    }
}

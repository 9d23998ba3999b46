//! Module loading contracts and the native-module registration surface.
//!
//! The core never touches the filesystem to find an import: the
//! embedding supplies a [`ModuleResolver`] that maps a dotted module
//! spec (already joined with `/`) to a source path and text. Native
//! modules are registered up front from a [`NativeModuleDef`] record and
//! looked up by their `_name` at compile time.

use std::fs;
use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::object::{ClassObj, HeapData, ModuleObj, NativeFn, NativeFnObj, NativeKind};
use crate::value::Value;
use crate::vm::Vm;

/// A resolved import: where the module lives and its source text.
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub path: String,
    pub source: String,
}

/// The import path resolution contract.
///
/// `spec` is the dotted import path with dots replaced by `/` (so
/// `import a.b` asks for `a/b`); `importer` is the source path of the
/// module doing the importing.
pub trait ModuleResolver {
    fn resolve(&self, spec: &str, importer: &str) -> Option<ResolvedModule>;
}

/// Resolver that never finds anything; the default for embeddings that
/// do not use imports.
#[derive(Debug, Default)]
pub struct NoResolver;

impl ModuleResolver for NoResolver {
    fn resolve(&self, _spec: &str, _importer: &str) -> Option<ResolvedModule> {
        None
    }
}

/// In-memory resolver keyed by spec; used by tests and embedders that
/// ship their module sources along.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    sources: AHashMap<String, String>,
}

impl MemoryResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: &str, source: &str) {
        self.sources.insert(spec.to_owned(), source.to_owned());
    }
}

impl ModuleResolver for MemoryResolver {
    fn resolve(&self, spec: &str, _importer: &str) -> Option<ResolvedModule> {
        self.sources.get(spec).map(|source| ResolvedModule {
            path: format!("{spec}.vs"),
            source: source.clone(),
        })
    }
}

/// Filesystem resolver: looks for `<spec>.vs` next to the importing
/// module, then under a fixed root.
#[derive(Debug)]
pub struct FsResolver {
    root: PathBuf,
}

impl FsResolver {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn try_load(candidate: &Path) -> Option<ResolvedModule> {
        let source = fs::read_to_string(candidate).ok()?;
        Some(ResolvedModule {
            path: candidate.to_string_lossy().into_owned(),
            source,
        })
    }
}

impl ModuleResolver for FsResolver {
    fn resolve(&self, spec: &str, importer: &str) -> Option<ResolvedModule> {
        let relative = format!("{spec}.vs");
        if let Some(dir) = Path::new(importer).parent() {
            if let Some(found) = Self::try_load(&dir.join(&relative)) {
                return Some(found);
            }
        }
        Self::try_load(&self.root.join(&relative))
    }
}

/// Produces a field's initial value during registration.
pub type NativeValueFn = fn(&mut Vm) -> Value;

/// One class exported by a native module.
pub struct NativeClassDef {
    pub name: &'static str,
    /// Instance property defaults.
    pub fields: Vec<(&'static str, NativeValueFn)>,
    pub methods: Vec<(&'static str, NativeFn)>,
}

/// The registration record for a native module: everything a
/// user-written native needs to expose.
pub struct NativeModuleDef {
    /// Module name; native modules are imported as `_name`.
    pub name: &'static str,
    pub fields: Vec<(&'static str, NativeValueFn)>,
    pub functions: Vec<(&'static str, NativeFn)>,
    pub classes: Vec<NativeClassDef>,
    /// Runs the first time the module is imported.
    pub preloader: Option<NativeFn>,
    /// Runs when the VM shuts down, if the module was imported.
    pub unloader: Option<NativeFn>,
}

/// Builds a Module object from a registration record and adds it to the
/// VM's native-module map.
pub fn register_native_module(vm: &mut Vm, def: NativeModuleDef) {
    let allowed = vm.heap.set_allow_gc(false);

    let name = vm.intern(def.name);
    let path = vm.intern(&format!("<native:{}>", def.name));
    let mut module = ModuleObj::new(name, path);
    module.preloader = def.preloader;
    module.unloader = def.unloader;

    for (field, init) in def.fields {
        let key = vm.intern(field);
        let value = init(vm);
        module.values.set(&vm.heap, key, value);
    }
    for (function, implementation) in def.functions {
        let key = vm.intern(function);
        let descriptor = vm.heap.allocate(HeapData::NativeFn(NativeFnObj {
            name: function.to_owned(),
            function: implementation,
            kind: NativeKind::Function,
        }));
        module.values.set(&vm.heap, key, Value::Obj(descriptor));
    }
    for class_def in def.classes {
        let class_name = vm.intern(class_def.name);
        let mut class = ClassObj::new(class_name);
        for (field, init) in class_def.fields {
            let key = vm.intern(field);
            let value = init(vm);
            class.properties.set(&vm.heap, key, value);
        }
        for (method, implementation) in class_def.methods {
            let key = vm.intern(method);
            let descriptor = vm.heap.allocate(HeapData::NativeFn(NativeFnObj {
                name: method.to_owned(),
                function: implementation,
                kind: NativeKind::Method,
            }));
            class.methods.set(&vm.heap, key, Value::Obj(descriptor));
            if method == class_def.name {
                class.initializer = Value::Obj(descriptor);
            }
        }
        let class_id = vm.heap.allocate(HeapData::Class(class));
        module.values.set(&vm.heap, class_name, Value::Obj(class_id));
    }

    let module_id = vm.heap.allocate(HeapData::Module(module));
    vm.native_modules.insert(def.name.to_owned(), module_id);
    vm.heap.set_allow_gc(allowed);
}

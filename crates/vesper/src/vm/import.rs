//! The runtime half of imports.
//!
//! The compiler resolves and compiles imported sources; at runtime
//! `CallImport` runs a module's top-level closure exactly once and binds
//! the module into the importer's values, the selection opcodes copy
//! individual members, and the eject opcodes drop bindings selective
//! imports don't keep.

use crate::object::{ClosureObj, HeapData};
use crate::value::{display_string, hash_value, Value};

use super::{OpResult, Vm};

impl Vm {
    /// `CallImport`: registers the compiled module and runs its top-level
    /// code on first import; later imports reuse the registry entry and
    /// push a placeholder instead of a call result.
    pub(crate) fn op_call_import(&mut self, function: Value) -> OpResult {
        let Value::Obj(function_id) = function else {
            unreachable!("import operand is always a function constant")
        };
        let module_value = match self.heap.get(function_id) {
            HeapData::Function(f) => f.module,
            _ => unreachable!("import operand is always a function constant"),
        };
        let Value::Obj(module_id) = module_value else {
            unreachable!("imported functions always carry their module")
        };
        let (name, path) = match self.heap.get(module_id) {
            HeapData::Module(m) => (m.name, m.path),
            _ => unreachable!("function module is always a module"),
        };

        let path_hash = hash_value(path, &self.heap);
        if let Some(existing) = self.modules.get_with_hash(path, path_hash) {
            // Already executed (possibly under another alias): rebind.
            self.bind_import(name, existing);
            return self.push(Value::Nil);
        }

        self.modules.set_with_hash(path, path_hash, module_value);
        if let HeapData::Module(m) = self.heap.get_mut(module_id) {
            m.imported = true;
        }
        self.bind_import(name, module_value);

        let closure = self.alloc(HeapData::Closure(ClosureObj {
            function: function_id,
            upvalues: smallvec::SmallVec::new(),
        }));
        self.push(Value::Obj(closure))?;
        self.call_closure(closure, 0)
    }

    /// `NativeModule`: looks up a pre-registered native module, runs its
    /// preloader on first use, binds it, and leaves it on the stack for
    /// the selection opcodes.
    pub(crate) fn op_native_module(&mut self, name: Value) -> OpResult {
        let text = match name {
            Value::Obj(id) => match self.heap.get(id) {
                HeapData::Str(s) => s.as_str().to_owned(),
                _ => String::new(),
            },
            _ => String::new(),
        };
        let Some(module_id) = self.native_modules.get(&text).copied() else {
            return Err(self.error(&format!("native module '{text}' is not registered")));
        };

        let (imported, preloader) = match self.heap.get(module_id) {
            HeapData::Module(m) => (m.imported, m.preloader),
            _ => unreachable!("native registry holds modules"),
        };
        if !imported {
            if let Some(preloader) = preloader {
                let depth = self.heap.guard_depth();
                let result = preloader(self, Value::Obj(module_id), &[]);
                self.heap.truncate_guards(depth);
                result?;
            }
            if let HeapData::Module(m) = self.heap.get_mut(module_id) {
                m.imported = true;
            }
        }

        self.bind_import(name, Value::Obj(module_id));
        self.push(Value::Obj(module_id))
    }

    /// `SelectImport` / `SelectNativeImport`: copies one member of the
    /// module on top of the stack into the importer.
    pub(crate) fn op_select_import(&mut self, name: Value) -> OpResult {
        let module = self.peek(0);
        let hash = hash_value(name, &self.heap);
        let Value::Obj(id) = module else {
            return Err(self.error("selective import target is not a module"));
        };
        let value = match self.heap.get(id) {
            HeapData::Module(m) => m.values.get_with_hash(name, hash),
            _ => return Err(self.error("selective import target is not a module")),
        };
        let Some(value) = value else {
            let module_name = match self.heap.get(id) {
                HeapData::Module(m) => display_string(m.name, &self.heap),
                _ => String::new(),
            };
            return Err(self.error(&format!(
                "module '{module_name}' has no member '{}'",
                display_string(name, &self.heap)
            )));
        };
        self.bind_import(name, value);
        Ok(())
    }

    /// `ImportAll` / `ImportAllNative`: copies every member of the module
    /// on top of the stack into the importer.
    pub(crate) fn op_import_all(&mut self) -> OpResult {
        let module = self.peek(0);
        let Value::Obj(id) = module else {
            return Err(self.error("import-all target is not a module"));
        };
        let entries: Vec<(Value, Value)> = match self.heap.get(id) {
            HeapData::Module(m) => m.values.iter().collect(),
            _ => return Err(self.error("import-all target is not a module")),
        };
        for (key, value) in entries {
            self.bind_import(key, value);
        }
        Ok(())
    }

    /// `EjectImport` / `EjectNativeImport`: removes a binding from the
    /// importer's values.
    pub(crate) fn op_eject_import(&mut self, name: Value) {
        let hash = hash_value(name, &self.heap);
        if let Some(module) = self.current_module() {
            if let HeapData::Module(m) = self.heap.get_mut(module) {
                m.values.delete_with_hash(name, hash);
            }
        }
    }

    /// Writes one binding into the current module's values.
    fn bind_import(&mut self, name: Value, value: Value) {
        let hash = hash_value(name, &self.heap);
        if let Some(module) = self.current_module() {
            if let HeapData::Module(m) = self.heap.get_mut(module) {
                m.values.set_with_hash(name, hash, value);
                return;
            }
        }
        self.globals.set_with_hash(name, hash, value);
    }
}

//! Heap object variants.
//!
//! Every heap-allocated runtime type is one arm of [`HeapData`]; the GC
//! tracer, equality, hashing and stringification all fan out over the same
//! tag. Payload structs live here so the heap stays a plain slot arena.

use std::any::Any;
use std::fmt;
use std::fs;
use std::mem;

use smallvec::SmallVec;

use crate::bytecode::Chunk;
use crate::heap::HeapId;
use crate::table::ValueTable;
use crate::value::Value;
use crate::vm::{Vm, VmError};

/// Signature of a native function or method.
///
/// Natives receive the receiver (`Nil` for free functions), the argument
/// slice, and return their result or an in-flight exception. The VM clears
/// GC guards registered by the native when the call returns.
pub type NativeFn = fn(&mut Vm, Value, &[Value]) -> Result<Value, VmError>;

/// Where a native function is allowed to be called from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    /// A free function (module field or global).
    Function,
    /// A method on one of the built-in types; expects a receiver.
    Method,
}

/// An immutable, interned string.
///
/// Carries its byte length implicitly, the UTF-8 codepoint length, the
/// precomputed hash used for interning and table lookups, and the
/// "ASCII-forced" flag that switches indexing from codepoint-wise to
/// byte-wise.
#[derive(Debug)]
pub struct StrObj {
    text: String,
    /// UTF-8 codepoint count, computed once at allocation.
    pub char_len: usize,
    pub hash: u64,
    /// When set, indexing and length are byte-wise.
    pub ascii: bool,
}

impl StrObj {
    #[must_use]
    pub fn new(text: String, hash: u64) -> Self {
        let char_len = text.chars().count();
        Self { text, char_len, hash, ascii: false }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// Length as user code sees it: codepoints, or bytes when ASCII-forced.
    #[must_use]
    pub fn length(&self) -> usize {
        if self.ascii { self.text.len() } else { self.char_len }
    }
}

/// A mutable byte buffer.
#[derive(Debug, Default)]
pub struct BytesObj {
    pub bytes: Vec<u8>,
}

/// A growable sequence of values.
#[derive(Debug, Default)]
pub struct ListObj {
    pub items: Vec<Value>,
}

/// An insertion-ordered key → value mapping.
///
/// Keys are kept in insertion order in `keys`; `table` serves lookups.
/// Only primitives and strings are valid keys; the VM rejects the rest
/// on insert.
#[derive(Debug, Default)]
pub struct DictObj {
    pub keys: Vec<Value>,
    pub table: ValueTable,
}

impl DictObj {
    /// Inserts or overwrites a key, keeping insertion order stable.
    /// The caller hashes the key first (dicts usually sit behind a
    /// mutable heap borrow).
    pub fn insert_hashed(&mut self, key: Value, hash: u64, value: Value) {
        if self.table.set_with_hash(key, hash, value) {
            self.keys.push(key);
        }
    }

    /// Removes a key; returns true if it was present.
    pub fn remove_hashed(&mut self, key: Value, hash: u64) -> bool {
        if self.table.delete_with_hash(key, hash) {
            self.keys.retain(|k| *k != key);
            true
        } else {
            false
        }
    }
}

/// An integer range with precomputed absolute extent.
#[derive(Debug, Clone, Copy)]
pub struct RangeObj {
    pub lower: i64,
    pub upper: i64,
    /// `|upper - lower|`; the number of iteration steps.
    pub extent: i64,
}

impl RangeObj {
    #[must_use]
    pub fn new(lower: i64, upper: i64) -> Self {
        Self { lower, upper, extent: (upper - lower).abs() }
    }
}

/// Backing handle of a file object.
#[derive(Debug, Default)]
pub enum FileHandle {
    /// Closed or never opened.
    #[default]
    None,
    Disk(fs::File),
    Stdin,
    Stdout,
    Stderr,
}

/// An open (or closed) file.
///
/// Standard-stream files carry an empty mode string and are never closed
/// by the VM, including during sweep.
#[derive(Debug)]
pub struct FileObj {
    pub path: Value,
    pub mode: Value,
    pub is_open: bool,
    pub handle: FileHandle,
}

impl FileObj {
    #[must_use]
    pub fn is_std(&self) -> bool {
        matches!(self.handle, FileHandle::Stdin | FileHandle::Stdout | FileHandle::Stderr)
    }
}

/// A compiled function: its chunk plus call metadata.
#[derive(Debug)]
pub struct FunctionObj {
    pub chunk: Chunk,
    /// Declared parameter count, excluding the variadic tail.
    pub arity: u8,
    pub variadic: bool,
    pub upvalue_count: usize,
    /// Function name as a string object; `Nil` for anonymous functions.
    pub name: Value,
    /// The module this function was compiled in.
    pub module: Value,
    /// The class this function was installed on as a method, set when the
    /// class body runs. `parent` dispatch starts above this class.
    pub owner_class: Value,
    pub is_static: bool,
    pub is_private: bool,
}

/// A function plus its captured upvalues.
#[derive(Debug)]
pub struct ClosureObj {
    pub function: HeapId,
    pub upvalues: SmallVec<[HeapId; 4]>,
}

/// A captured variable cell.
///
/// Open upvalues point at a live stack slot; closing copies the value into
/// `closed` and drops the location. Open upvalues form a singly-linked
/// list sorted by descending stack slot.
#[derive(Debug)]
pub struct UpvalueObj {
    /// Stack slot while open; `None` once closed.
    pub location: Option<usize>,
    pub closed: Value,
    pub next: Option<HeapId>,
}

/// A class: methods, instance-property defaults, statics, initializer.
#[derive(Debug)]
pub struct ClassObj {
    pub name: Value,
    pub methods: ValueTable,
    /// Instance property defaults, copied into each new instance.
    pub properties: ValueTable,
    pub statics: ValueTable,
    /// The initializer closure, also stored in `methods` under the class name.
    pub initializer: Value,
    pub superclass: Value,
}

impl ClassObj {
    #[must_use]
    pub fn new(name: Value) -> Self {
        Self {
            name,
            methods: ValueTable::new(),
            properties: ValueTable::new(),
            statics: ValueTable::new(),
            initializer: Value::Nil,
            superclass: Value::Nil,
        }
    }
}

/// An instance: class reference plus per-instance properties.
#[derive(Debug)]
pub struct InstanceObj {
    pub class: HeapId,
    pub properties: ValueTable,
}

/// A receiver bound to a method closure.
#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: HeapId,
}

/// A named namespace: the unit of import.
pub struct ModuleObj {
    pub name: Value,
    pub path: Value,
    pub values: ValueTable,
    /// Set once the module's top-level code has run.
    pub imported: bool,
    pub preloader: Option<NativeFn>,
    pub unloader: Option<NativeFn>,
    /// Opaque handle owned by dynamically loaded native modules.
    pub native_handle: Option<Box<dyn Any>>,
}

impl ModuleObj {
    #[must_use]
    pub fn new(name: Value, path: Value) -> Self {
        Self {
            name,
            path,
            values: ValueTable::new(),
            imported: false,
            preloader: None,
            unloader: None,
            native_handle: None,
        }
    }
}

impl fmt::Debug for ModuleObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleObj")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("imported", &self.imported)
            .field("has_handle", &self.native_handle.is_some())
            .finish_non_exhaustive()
    }
}

/// A native function descriptor.
#[derive(Debug)]
pub struct NativeFnObj {
    pub name: String,
    pub function: NativeFn,
    pub kind: NativeKind,
}

/// A compiled `using` jump table: constant → relative code offset.
#[derive(Debug)]
pub struct SwitchObj {
    pub table: ValueTable,
    /// Relative offset of the `default` arm, or `-1` if absent.
    pub default_jump: i32,
    /// Relative offset of the first instruction past the block.
    pub exit_jump: i32,
}

/// An opaque native handle with an optional destructor, used by
/// out-of-scope built-in modules. The payload drops with the object.
pub struct PointerObj {
    pub name: String,
    pub data: Option<Box<dyn Any>>,
}

impl fmt::Debug for PointerObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointerObj")
            .field("name", &self.name)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

/// One heap-allocated object.
#[derive(Debug)]
pub enum HeapData {
    Str(StrObj),
    Bytes(BytesObj),
    List(ListObj),
    Dict(DictObj),
    Range(RangeObj),
    File(FileObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Module(ModuleObj),
    NativeFn(NativeFnObj),
    Switch(SwitchObj),
    Pointer(PointerObj),
}

impl HeapData {
    /// The user-visible type name for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Dict(_) => "dictionary",
            Self::Range(_) => "range",
            Self::File(_) => "file",
            Self::Function(_) | Self::Closure(_) | Self::BoundMethod(_) | Self::NativeFn(_) => "function",
            Self::Upvalue(_) => "upvalue",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::Module(_) => "module",
            Self::Switch(_) => "switch",
            Self::Pointer(_) => "pointer",
        }
    }

    /// Rough byte footprint, driving the GC threshold.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let base = mem::size_of::<Self>();
        base + match self {
            Self::Str(s) => s.as_str().len(),
            Self::Bytes(b) => b.bytes.capacity(),
            Self::List(l) => l.items.capacity() * mem::size_of::<Value>(),
            Self::Dict(d) => {
                d.keys.capacity() * mem::size_of::<Value>() + d.table.capacity() * 2 * mem::size_of::<Value>()
            }
            Self::Function(f) => f.chunk.byte_size(),
            Self::Closure(c) => c.upvalues.capacity() * mem::size_of::<HeapId>(),
            Self::Class(c) => {
                (c.methods.capacity() + c.properties.capacity() + c.statics.capacity()) * 2 * mem::size_of::<Value>()
            }
            Self::Instance(i) => i.properties.capacity() * 2 * mem::size_of::<Value>(),
            Self::Module(m) => m.values.capacity() * 2 * mem::size_of::<Value>(),
            Self::Switch(s) => s.table.capacity() * 2 * mem::size_of::<Value>(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_extent_is_absolute() {
        assert_eq!(RangeObj::new(1, 5).extent, 4);
        assert_eq!(RangeObj::new(5, 1).extent, 4);
        assert_eq!(RangeObj::new(3, 3).extent, 0);
    }

    #[test]
    fn str_lengths() {
        let s = StrObj::new("héllo".to_owned(), 0);
        assert_eq!(s.char_len, 5);
        assert_eq!(s.bytes().len(), 6);
        assert_eq!(s.length(), 5);
        let mut forced = StrObj::new("héllo".to_owned(), 0);
        forced.ascii = true;
        assert_eq!(forced.length(), 6);
    }
}

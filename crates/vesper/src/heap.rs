//! The arena heap and its tracing garbage collector.
//!
//! Objects live in a slot arena indexed by [`HeapId`]; freed slots are
//! recycled through a free list. Collection is precise mark-sweep: the VM
//! gathers roots (value stack, frames, open upvalues, global tables, the
//! guard stack), the heap marks everything reachable, the VM then runs the
//! weak-table `remove_white` passes (intern pool, module registry), and
//! the sweep returns unmarked slots to the free list.
//!
//! Collection never runs while `allow_gc` is off; the collector clears the
//! flag for its own duration so allocation from a destructor cannot
//! re-enter it, and compilation holds it off so functions under
//! construction need no root registration.

use crate::object::HeapData;
use crate::value::Value;

/// Initial collection threshold in estimated bytes.
const FIRST_GC: usize = 1024 * 1024;

/// Index of a live heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct HeapEntry {
    marked: bool,
    data: HeapData,
}

/// The VM-owned object store.
#[derive(Debug)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<HeapId>,
    bytes_allocated: usize,
    next_gc: usize,
    allow_gc: bool,
    /// GC-protect stack: values rooted here survive collection while an
    /// operation builds a structure not yet reachable from elsewhere.
    guards: Vec<Value>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            allow_gc: true,
            guards: Vec::new(),
        }
    }

    /// Allocates an object, recycling a free slot when one exists.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += data.estimate_size();
        let entry = HeapEntry { marked: false, data };
        if let Some(id) = self.free_list.pop() {
            debug_assert!(self.entries[id.index()].is_none(), "free list pointed at a live slot");
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let index = u32::try_from(self.entries.len()).expect("heap exceeds u32 slots");
            self.entries.push(Some(entry));
            HeapId(index)
        }
    }

    /// Borrows an object. Panics on a dead handle, which is an
    /// interpreter bug, never a user error.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.entries[id.index()].as_ref().expect("heap handle used after free").data
    }

    #[must_use]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entries[id.index()].as_mut().expect("heap handle used after free").data
    }

    #[must_use]
    pub fn is_marked(&self, id: HeapId) -> bool {
        self.entries[id.index()].as_ref().is_some_and(|e| e.marked)
    }

    /// True when a collection should run before the next allocation.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.allow_gc && self.bytes_allocated > self.next_gc
    }

    /// Enables or disables collection; returns the previous state.
    pub fn set_allow_gc(&mut self, allow: bool) -> bool {
        std::mem::replace(&mut self.allow_gc, allow)
    }

    /// Roots a value on the guard stack, returning the depth to restore.
    pub fn guard(&mut self, value: Value) -> usize {
        let depth = self.guards.len();
        self.guards.push(value);
        depth
    }

    #[must_use]
    pub fn guard_depth(&self) -> usize {
        self.guards.len()
    }

    /// Drops guards above `depth`; native calls restore their entry depth
    /// on return.
    pub fn truncate_guards(&mut self, depth: usize) {
        self.guards.truncate(depth);
    }

    /// Number of live objects; used by tests and diagnostics.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Mark phase: sets the mark bit on everything reachable from `roots`
    /// and from the guard stack.
    pub fn mark(&mut self, roots: &[Value]) {
        let mut work_list: Vec<HeapId> = Vec::with_capacity(roots.len() + self.guards.len());
        for value in roots.iter().chain(self.guards.iter()) {
            if let Value::Obj(id) = value {
                work_list.push(*id);
            }
        }

        while let Some(id) = work_list.pop() {
            let Some(entry) = self.entries.get_mut(id.index()).and_then(Option::as_mut) else {
                continue;
            };
            if entry.marked {
                continue;
            }
            entry.marked = true;
            collect_children(&entry.data, &mut work_list);
        }
    }

    /// Sweep phase: frees unmarked slots, clears the mark on survivors,
    /// and resets the growth threshold.
    pub fn sweep(&mut self) {
        self.allow_gc = false;
        for (index, slot) in self.entries.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => entry.marked = false,
                Some(entry) => {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(entry.data.estimate_size());
                    *slot = None;
                    self.free_list.push(HeapId(index as u32));
                }
                None => {}
            }
        }
        // Threshold grows by a fixed factor of the surviving footprint.
        self.next_gc = (self.bytes_allocated + self.bytes_allocated / 4).max(FIRST_GC);
        self.allow_gc = true;
    }
}

/// Pushes the heap handles a value owns or references onto the worklist.
///
/// This is the single place that knows each variant's edges; equality,
/// hashing and stringification fan out over the same tags elsewhere.
fn collect_children(data: &HeapData, work_list: &mut Vec<HeapId>) {
    let mut push = |value: Value| {
        if let Value::Obj(id) = value {
            work_list.push(id);
        }
    };
    match data {
        HeapData::Str(_) | HeapData::Bytes(_) | HeapData::Range(_) | HeapData::NativeFn(_) | HeapData::Pointer(_) => {}
        HeapData::List(list) => {
            for item in &list.items {
                push(*item);
            }
        }
        HeapData::Dict(dict) => {
            for key in &dict.keys {
                push(*key);
            }
            for (key, value) in dict.table.iter() {
                push(key);
                push(value);
            }
        }
        HeapData::File(file) => {
            push(file.path);
            push(file.mode);
        }
        HeapData::Function(function) => {
            push(function.name);
            push(function.module);
            push(function.owner_class);
            for constant in function.chunk.constants() {
                push(*constant);
            }
        }
        HeapData::Closure(closure) => {
            push(Value::Obj(closure.function));
            for upvalue in &closure.upvalues {
                push(Value::Obj(*upvalue));
            }
        }
        HeapData::Upvalue(upvalue) => {
            push(upvalue.closed);
            if let Some(next) = upvalue.next {
                push(Value::Obj(next));
            }
        }
        HeapData::Class(class) => {
            push(class.name);
            push(class.initializer);
            push(class.superclass);
            for (key, value) in class.methods.iter().chain(class.properties.iter()).chain(class.statics.iter()) {
                push(key);
                push(value);
            }
        }
        HeapData::Instance(instance) => {
            push(Value::Obj(instance.class));
            for (key, value) in instance.properties.iter() {
                push(key);
                push(value);
            }
        }
        HeapData::BoundMethod(bound) => {
            push(bound.receiver);
            push(Value::Obj(bound.method));
        }
        HeapData::Module(module) => {
            push(module.name);
            push(module.path);
            for (key, value) in module.values.iter() {
                push(key);
                push(value);
            }
        }
        HeapData::Switch(switch) => {
            for (key, value) in switch.table.iter() {
                push(key);
                push(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ListObj;

    fn alloc_list(heap: &mut Heap, items: Vec<Value>) -> HeapId {
        heap.allocate(HeapData::List(ListObj { items }))
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let kept = alloc_list(&mut heap, Vec::new());
        let _dropped = alloc_list(&mut heap, Vec::new());
        assert_eq!(heap.live_objects(), 2);

        heap.mark(&[Value::Obj(kept)]);
        heap.sweep();
        assert_eq!(heap.live_objects(), 1);
        assert!(matches!(heap.get(kept), HeapData::List(_)));
    }

    #[test]
    fn children_keep_objects_alive_and_marks_clear() {
        let mut heap = Heap::new();
        let inner = alloc_list(&mut heap, Vec::new());
        let outer = alloc_list(&mut heap, vec![Value::Obj(inner)]);

        heap.mark(&[Value::Obj(outer)]);
        assert!(heap.is_marked(inner));
        heap.sweep();
        assert_eq!(heap.live_objects(), 2);
        // Every survivor's mark bit is cleared once the cycle completes.
        assert!(!heap.is_marked(inner));
        assert!(!heap.is_marked(outer));
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        let a = alloc_list(&mut heap, Vec::new());
        let b = alloc_list(&mut heap, vec![Value::Obj(a)]);
        if let HeapData::List(list) = heap.get_mut(a) {
            list.items.push(Value::Obj(b));
        }

        heap.mark(&[]);
        heap.sweep();
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn guard_stack_roots_values() {
        let mut heap = Heap::new();
        let id = alloc_list(&mut heap, Vec::new());
        let depth = heap.guard(Value::Obj(id));

        heap.mark(&[]);
        heap.sweep();
        assert_eq!(heap.live_objects(), 1);

        heap.truncate_guards(depth);
        heap.mark(&[]);
        heap.sweep();
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new();
        let first = alloc_list(&mut heap, Vec::new());
        heap.mark(&[]);
        heap.sweep();
        let second = alloc_list(&mut heap, Vec::new());
        assert_eq!(first, second);
    }
}

//! The heap: a slot arena with a free list, string/real interning, and
//! the precise tri-color mark-and-sweep collector.
//!
//! Objects live in `slots`; a [`Handle`] is a slot index. Freed slots go
//! on the free list and are reused by later allocations, so a handle is
//! only valid while its object is reachable — exactly the guarantee the
//! collector maintains. Collection never happens behind the mutator's
//! back: the compiler and the VM call [`Heap::collect`] themselves at
//! allocation safepoints, passing their roots explicitly.

use std::collections::HashMap;

use crate::object::{hash_bytes, Class, Closure, Function, Instance, IterCursor, Obj, ObjData, StrObj, Upvalue};
use crate::value::{Handle, Value};

/// Fixed capacity of the grey stack; overflow is fatal.
const GRAY_MAX: usize = 1024;

/// First collection happens once this many bytes are live.
const FIRST_GC_THRESHOLD: usize = 64 * 1024;

pub struct Heap {
    slots: Vec<Option<Obj>>,
    /// Slot indices freed by sweep, reused by `insert`.
    free: Vec<Handle>,
    /// Intern table: string bytes → canonical handle. Weak — pruned of
    /// unmarked entries before every sweep.
    strings: HashMap<Box<str>, Handle>,
    /// Intern table for reals, keyed by bit pattern (−0.0 normalized),
    /// so numerically equal reals share a handle. Weak like `strings`.
    reals: HashMap<u64, Handle>,
    gray: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect at every allocation (the `dbg_stress` native).
    pub stress_gc: bool,
    /// Log collection phases to stderr (the `dbg_gc` native).
    pub log_gc: bool,
    collections: usize,
    total_allocated: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: HashMap::new(),
            reals: HashMap::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stress_gc: false,
            log_gc: false,
            collections: 0,
            total_allocated: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Place an object into the arena. Never collects; callers decide
    /// when to collect via [`Heap::should_collect`] + [`Heap::collect`]
    /// *before* building payloads that reference unrooted objects.
    pub fn insert(&mut self, data: ObjData) -> Handle {
        let size = data.byte_size();
        self.bytes_allocated += size;
        self.total_allocated += size;

        let obj = Obj {
            marked: false,
            data,
        };
        match self.free.pop() {
            Some(handle) => {
                self.slots[handle.index()] = Some(obj);
                handle
            }
            None => {
                self.slots.push(Some(obj));
                Handle((self.slots.len() - 1) as u32)
            }
        }
    }

    /// True when the next allocation should be preceded by a collection.
    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    /// Intern a string, returning the canonical handle for these bytes.
    pub fn intern_string(&mut self, chars: &str) -> Handle {
        if let Some(handle) = self.strings.get(chars) {
            return *handle;
        }
        let handle = self.insert(ObjData::Str(StrObj {
            chars: chars.into(),
            hash: hash_bytes(chars.as_bytes()),
        }));
        self.strings.insert(chars.into(), handle);
        handle
    }

    /// Intern a real by bit pattern. `-0.0` is normalized to `0.0` so
    /// the two remain equal under handle identity.
    pub fn intern_real(&mut self, value: f64) -> Handle {
        let value = if value == 0.0 { 0.0 } else { value };
        let bits = value.to_bits();
        if let Some(handle) = self.reals.get(&bits) {
            return *handle;
        }
        let handle = self.insert(ObjData::Real(value));
        self.reals.insert(bits, handle);
        handle
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    pub fn get(&self, handle: Handle) -> &Obj {
        self.slots[handle.index()]
            .as_ref()
            .expect("use of freed heap slot")
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        self.slots[handle.index()]
            .as_mut()
            .expect("use of freed heap slot")
    }

    pub fn str_value(&self, handle: Handle) -> &str {
        match &self.get(handle).data {
            ObjData::Str(s) => &s.chars,
            _ => panic!("expected string object"),
        }
    }

    pub fn real_value(&self, handle: Handle) -> Option<f64> {
        match &self.get(handle).data {
            ObjData::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn function(&self, handle: Handle) -> &Function {
        match &self.get(handle).data {
            ObjData::Function(f) => f,
            _ => panic!("expected function object"),
        }
    }

    pub fn closure(&self, handle: Handle) -> &Closure {
        match &self.get(handle).data {
            ObjData::Closure(c) => c,
            _ => panic!("expected closure object"),
        }
    }

    pub fn class(&self, handle: Handle) -> &Class {
        match &self.get(handle).data {
            ObjData::Class(c) => c,
            _ => panic!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, handle: Handle) -> &mut Class {
        match &mut self.get_mut(handle).data {
            ObjData::Class(c) => c,
            _ => panic!("expected class object"),
        }
    }

    pub fn instance(&self, handle: Handle) -> &Instance {
        match &self.get(handle).data {
            ObjData::Instance(i) => i,
            _ => panic!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, handle: Handle) -> &mut Instance {
        match &mut self.get_mut(handle).data {
            ObjData::Instance(i) => i,
            _ => panic!("expected instance object"),
        }
    }

    pub fn list(&self, handle: Handle) -> &Vec<Value> {
        match &self.get(handle).data {
            ObjData::List(items) => items,
            _ => panic!("expected list object"),
        }
    }

    pub fn list_mut(&mut self, handle: Handle) -> &mut Vec<Value> {
        match &mut self.get_mut(handle).data {
            ObjData::List(items) => items,
            _ => panic!("expected list object"),
        }
    }

    pub fn upvalue(&self, handle: Handle) -> &Upvalue {
        match &self.get(handle).data {
            ObjData::Upvalue(u) => u,
            _ => panic!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, handle: Handle) -> &mut Upvalue {
        match &mut self.get_mut(handle).data {
            ObjData::Upvalue(u) => u,
            _ => panic!("expected upvalue object"),
        }
    }

    pub fn iterator_mut(&mut self, handle: Handle) -> &mut IterCursor {
        match &mut self.get_mut(handle).data {
            ObjData::Iterator(it) => it,
            _ => panic!("expected iterator object"),
        }
    }

    /// The display name of a function: `#script` for the top level,
    /// `#<n>` for lambdas, `Class.method` for methods.
    pub fn function_name(&self, function: &Function) -> String {
        match function.name {
            Value::Nil => "#script".to_string(),
            Value::Int(n) => format!("#{n}"),
            Value::Obj(name) => match function.class {
                Value::Obj(class) => format!(
                    "{}.{}",
                    self.str_value(self.class(class).name),
                    self.str_value(name)
                ),
                _ => self.str_value(name).to_string(),
            },
            _ => "#script".to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Run a full mark-sweep collection with the given roots.
    pub fn collect(&mut self, roots: &[Value]) {
        let before = self.bytes_allocated;
        if self.log_gc {
            eprintln!("GC >>> begin ({before} bytes)");
        }

        for root in roots {
            self.mark_value(*root);
        }
        self.trace_references();
        self.prune_interned();
        self.sweep();

        self.collections += 1;
        self.next_gc = (self.bytes_allocated * 2).max(FIRST_GC_THRESHOLD);

        if self.log_gc {
            eprintln!(
                "GC <<< collected {} bytes (from {} to {})",
                before - self.bytes_allocated,
                before,
                self.bytes_allocated
            );
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    pub fn mark_object(&mut self, handle: Handle) {
        let obj = match self.slots[handle.index()].as_mut() {
            Some(obj) => obj,
            None => return,
        };
        if obj.marked {
            return;
        }
        obj.marked = true;

        if !obj.data.is_leaf() {
            if self.gray.len() >= GRAY_MAX {
                eprintln!("Gray stack size exceeded, exiting.");
                std::process::exit(1);
            }
            self.gray.push(handle);
        }
    }

    fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }
    }

    /// Mark everything the object owns. Children are gathered first so
    /// the payload borrow ends before marking mutates other slots.
    fn blacken(&mut self, handle: Handle) {
        let mut children: Vec<Value> = Vec::new();

        match &self.get(handle).data {
            ObjData::Bound(bound) => {
                children.push(bound.receiver);
                children.push(Value::Obj(bound.method));
            }
            ObjData::Class(class) => {
                children.push(Value::Obj(class.name));
                if let Some(superclass) = class.superclass {
                    children.push(Value::Obj(superclass));
                }
                for (key, value) in &class.methods {
                    children.push(*key);
                    children.push(*value);
                }
            }
            ObjData::Closure(closure) => {
                children.push(Value::Obj(closure.function));
                for upvalue in &closure.upvalues {
                    children.push(Value::Obj(*upvalue));
                }
            }
            ObjData::Dynvar(dynvar) => {
                children.push(Value::Obj(dynvar.name));
                children.push(dynvar.previous);
            }
            ObjData::Function(function) => {
                children.push(function.name);
                children.push(function.class);
                children.extend_from_slice(&function.chunk.constants);
            }
            ObjData::Instance(instance) => {
                children.push(Value::Obj(instance.class));
                for (key, value) in &instance.fields {
                    children.push(*key);
                    children.push(*value);
                }
            }
            ObjData::Iterator(it) => {
                children.push(Value::Obj(it.instance));
            }
            ObjData::List(items) => {
                children.extend_from_slice(items);
            }
            ObjData::Upvalue(upvalue) => {
                // An open upvalue's stack slot is already a root; only
                // the closed value belongs to the upvalue itself.
                children.push(upvalue.closed);
            }
            ObjData::Str(_) | ObjData::Real(_) | ObjData::Native(_) => {}
        }

        for child in children {
            self.mark_value(child);
        }
    }

    /// Drop intern-table entries whose object did not survive marking —
    /// this is what makes the intern tables weak.
    fn prune_interned(&mut self) {
        let slots = &self.slots;
        self.strings
            .retain(|_, handle| slots[handle.index()].as_ref().is_some_and(|o| o.marked));
        self.reals
            .retain(|_, handle| slots[handle.index()].as_ref().is_some_and(|o| o.marked));
    }

    fn sweep(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(obj) if obj.marked => obj.marked = false,
                Some(obj) => {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.data.byte_size());
                    *slot = None;
                    self.free.push(Handle(index as u32));
                }
                None => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[cfg(test)]
    pub fn is_live(&self, handle: Handle) -> bool {
        self.slots[handle.index()].is_some()
    }

    #[cfg(test)]
    pub fn is_marked(&self, handle: Handle) -> bool {
        self.slots[handle.index()]
            .as_ref()
            .is_some_and(|o| o.marked)
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interned_strings_share_handles() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        let c = heap.intern_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_value(a), "hello");
    }

    #[test]
    fn interned_reals_compare_by_value() {
        let mut heap = Heap::new();
        let a = heap.intern_real(1.5);
        let b = heap.intern_real(1.5);
        let zero = heap.intern_real(0.0);
        let neg_zero = heap.intern_real(-0.0);
        assert_eq!(a, b);
        assert_eq!(zero, neg_zero);
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let kept = heap.intern_string("kept");
        let lost = heap.intern_string("lost");
        let list = heap.insert(ObjData::List(vec![Value::Obj(kept)]));

        let before = heap.live_objects();
        heap.collect(&[Value::Obj(list)]);

        assert!(heap.is_live(list));
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(lost));
        assert_eq!(heap.live_objects(), before - 1);
        // The intern table was pruned, so re-interning allocates anew.
        let again = heap.intern_string("lost");
        assert!(heap.is_live(again));
    }

    #[test]
    fn survivors_are_unmarked_after_collection() {
        let mut heap = Heap::new();
        let a = heap.intern_string("a");
        let list = heap.insert(ObjData::List(vec![Value::Obj(a)]));
        heap.collect(&[Value::Obj(list)]);
        assert!(!heap.is_marked(list));
        assert!(!heap.is_marked(a));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let doomed = heap.insert(ObjData::List(Vec::new()));
        heap.collect(&[]);
        assert!(!heap.is_live(doomed));
        let recycled = heap.insert(ObjData::List(Vec::new()));
        assert_eq!(doomed, recycled);
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        // Two lists referencing each other, unreachable from any root.
        let a = heap.insert(ObjData::List(Vec::new()));
        let b = heap.insert(ObjData::List(vec![Value::Obj(a)]));
        heap.list_mut(a).push(Value::Obj(b));

        heap.collect(&[]);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
    }
}

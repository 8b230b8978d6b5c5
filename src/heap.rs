// File: src/heap.rs
//
// Heap object variants plus the arena that owns them. Every heap object is
// reached only through an `ObjRef` stored inside a `Value::Obj`; there are
// no raw pointers and no reference counting. Reachability and lifetime are
// entirely the garbage collector's job (`vm::gc`), which walks the same
// arena this module exposes.
//
// The arena is index-based rather than pointer-based: it keeps the whole
// compiler and VM in safe Rust, at the cost of an extra indirection per
// field access that a raw-pointer implementation would avoid.

use ahash::AHashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::chunk::Chunk;
use crate::value::Value;
use crate::vm::Vm;

/// A stable handle to a heap-allocated object. `Copy` and cheap to store in
/// a `Value`; dereferenced through `Heap::get`/`get_mut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(u8),
    Variadic,
}

impl Arity {
    pub fn accepts(&self, argc: u8) -> bool {
        match self {
            Arity::Fixed(n) => *n == argc,
            Arity::Variadic => true,
        }
    }
}

pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

pub struct LString {
    pub bytes: Box<str>,
    pub hash: u64,
}

pub struct LFunction {
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

pub struct LClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Holds a stack index while the captured local is still on the stack.
    Open(usize),
    Closed(Value),
}

pub struct LUpvalue {
    pub state: UpvalueState,
}

pub struct LClass {
    pub name: ObjRef,
    pub methods: AHashMap<ObjRef, ObjRef>,
}

pub struct LInstance {
    pub class: ObjRef,
    pub fields: AHashMap<ObjRef, Value>,
}

pub struct LBoundMethod {
    pub receiver: Value,
    pub closure: ObjRef,
}

pub struct NativeObj {
    pub name: ObjRef,
    pub arity: Arity,
    pub func: NativeFn,
}

pub struct LArray {
    pub items: Vec<Value>,
}

/// A hashable projection of `Value` usable as a `Dict` key: primitives plus
/// interned strings (by `ObjRef`, which is identity-equal to byte equality
/// once interned). Arrays, dicts, functions etc. are not hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DictKey {
    Nil,
    Bool(bool),
    Int(i64),
    Str(ObjRef),
}

impl DictKey {
    /// Converts a primitive `Value` directly; for `Value::Obj` the caller
    /// must first confirm the object is a `String` (`DictKey::Str` assumes
    /// this and otherwise misfiles a non-string object under the wrong
    /// variant), since this function has no heap access to check itself.
    pub fn from_value(v: Value) -> Option<DictKey> {
        match v {
            Value::Nil => Some(DictKey::Nil),
            Value::Bool(b) => Some(DictKey::Bool(b)),
            Value::Int(n) => Some(DictKey::Int(n)),
            Value::Obj(r) => Some(DictKey::Str(r)),
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            DictKey::Nil => Value::Nil,
            DictKey::Bool(b) => Value::Bool(b),
            DictKey::Int(n) => Value::Int(n),
            DictKey::Str(r) => Value::Obj(r),
        }
    }
}

pub struct LDict {
    pub entries: AHashMap<DictKey, Value>,
    /// Preserves first-insertion order for iteration/printing, so dict
    /// output is deterministic.
    pub order: Vec<DictKey>,
}

impl LDict {
    pub fn new() -> Self {
        LDict { entries: AHashMap::new(), order: Vec::new() }
    }

    pub fn insert(&mut self, key: DictKey, value: Value) {
        if self.entries.insert(key, value).is_none() {
            self.order.push(key);
        }
    }
}

pub enum Obj {
    String(LString),
    Function(LFunction),
    Closure(LClosure),
    Upvalue(LUpvalue),
    Class(LClass),
    Instance(LInstance),
    BoundMethod(LBoundMethod),
    Native(NativeObj),
    Array(LArray),
    Dict(LDict),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
            Obj::Native(_) => "native function",
            Obj::Array(_) => "array",
            Obj::Dict(_) => "dict",
        }
    }

    /// Rough per-object byte cost, used only to drive the GC's allocation
    /// counter; not a precise accounting.
    fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.bytes.len(),
            Obj::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * 16,
            Obj::Closure(c) => c.upvalues.len() * 8,
            Obj::Class(c) => c.methods.len() * 16,
            Obj::Instance(i) => i.fields.len() * 16,
            Obj::Array(a) => a.items.len() * 16,
            Obj::Dict(d) => d.entries.len() * 32,
            _ => 0,
        }
    }
}

struct Slot {
    marked: bool,
    obj: Obj,
}

/// Arena owning every heap object. Frees are deferred to `sweep`; slots
/// freed by a collection are recycled by later allocations (a simple free
/// list), so `ObjRef`s are only ever handed out for currently-live slots.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    strings: AHashMap<Box<str>, ObjRef>,
    pub bytes_allocated: usize,
    pub gc_threshold: usize,
}

const INITIAL_GC_THRESHOLD: usize = 1 << 20; // 1 MiB

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: AHashMap::new(),
            bytes_allocated: 0,
            gc_threshold: INITIAL_GC_THRESHOLD,
        }
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.gc_threshold
    }

    pub fn note_collection(&mut self) {
        self.gc_threshold = (self.bytes_allocated.max(INITIAL_GC_THRESHOLD / 2)) * 2;
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.approx_size();
        let slot = Slot { marked: false, obj };
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(slot);
            ObjRef(index)
        } else {
            self.slots.push(Some(slot));
            ObjRef(self.slots.len() - 1)
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.0].as_ref().map(|s| &s.obj).expect("dangling ObjRef")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.0].as_mut().map(|s| &mut s.obj).expect("dangling ObjRef")
    }

    pub fn as_string(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::String(s) => &s.bytes,
            other => unreachable!("ObjRef did not point at a string: {}", other.type_name()),
        }
    }

    /// Interns `text`: returns the existing string object if an equal one
    /// is already live, otherwise allocates and registers a new one.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        if let Some(existing) = self.strings.get(text) {
            return *existing;
        }
        let hash = {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            hasher.finish()
        };
        let boxed: Box<str> = text.into();
        let r = self.alloc(Obj::String(LString { bytes: boxed.clone(), hash }));
        self.strings.insert(boxed, r);
        r
    }

    // --- mark-sweep support (driven by vm::gc) ---

    pub fn mark(&mut self, r: ObjRef) -> bool {
        let slot = self.slots[r.0].as_mut().expect("dangling ObjRef");
        if slot.marked {
            false
        } else {
            slot.marked = true;
            true
        }
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.0].as_ref().map(|s| s.marked).unwrap_or(false)
    }

    pub fn live_refs(&self) -> Vec<ObjRef> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| ObjRef(i)))
            .collect()
    }

    /// Frees every unmarked slot and clears all marks for the next cycle.
    /// Returns the number of bytes freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for i in 0..self.slots.len() {
            let should_free = match &self.slots[i] {
                Some(slot) => !slot.marked,
                None => false,
            };
            if should_free {
                let slot = self.slots[i].take().unwrap();
                freed += slot.obj.approx_size();
                if let Obj::String(s) = &slot.obj {
                    self.strings.remove(&s.bytes);
                }
                self.free.push(i);
            } else if let Some(slot) = &mut self.slots[i] {
                slot.marked = false;
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

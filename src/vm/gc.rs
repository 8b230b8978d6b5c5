// File: src/vm/gc.rs
//
// Stop-the-world mark-sweep collector. Lives as a child module of `vm` so
// it can reach `Vm`'s private stack/frame/global state directly; `heap.rs`
// hands reachability entirely to this module rather than tracking its own
// roots.

use crate::heap::{DictKey, Heap, Obj, ObjRef, UpvalueState};
use crate::value::Value;

use super::Vm;

/// Runs one full mark-sweep cycle over `vm`'s heap, rooted in the VM's
/// live state: stack, frame closures, globals, open upvalues. Collection
/// is never triggered during compilation, since `compile` runs to
/// completion against a bare `&mut Heap` before the VM calls this, so
/// there is no in-progress compiler state to root here.
pub fn collect_garbage(vm: &mut Vm) {
    let before = vm.heap.bytes_allocated;
    let mut gray: Vec<ObjRef> = Vec::new();

    mark_roots(vm, &mut gray);
    while let Some(r) = gray.pop() {
        blacken(vm, r, &mut gray);
    }

    let freed = vm.heap.sweep();
    vm.heap.note_collection();

    if vm.trace {
        eprintln!(
            "gc: collected {freed} bytes ({before} -> {}), next at {}",
            vm.heap.bytes_allocated, vm.heap.gc_threshold
        );
    }
}

fn mark_value(heap: &mut Heap, gray: &mut Vec<ObjRef>, value: Value) {
    if let Value::Obj(r) = value {
        mark_ref(heap, gray, r);
    }
}

fn mark_ref(heap: &mut Heap, gray: &mut Vec<ObjRef>, r: ObjRef) {
    if heap.mark(r) {
        gray.push(r);
    }
}

fn mark_roots(vm: &mut Vm, gray: &mut Vec<ObjRef>) {
    let stack_values: Vec<Value> = vm.stack.clone();
    for v in stack_values {
        mark_value(&mut vm.heap, gray, v);
    }

    let frame_closures: Vec<ObjRef> = vm.frames.iter().map(|f| f.closure).collect();
    for r in frame_closures {
        mark_ref(&mut vm.heap, gray, r);
    }

    let global_entries: Vec<(ObjRef, Value)> = vm.globals.iter().map(|(k, v)| (*k, *v)).collect();
    for (k, v) in global_entries {
        mark_ref(&mut vm.heap, gray, k);
        mark_value(&mut vm.heap, gray, v);
    }

    let open_upvalues: Vec<ObjRef> = vm.open_upvalues.clone();
    for r in open_upvalues {
        mark_ref(&mut vm.heap, gray, r);
    }

    mark_ref(&mut vm.heap, gray, vm.init_string);
}

/// Marks the edges out of one already-marked object. Every arm copies what
/// it needs out of `heap.get(r)` (`Copy` fields or a `.clone()` of a
/// `Vec`/map) before any further `mark_*` call, since those borrow `heap`
/// again.
fn blacken(vm: &mut Vm, r: ObjRef, gray: &mut Vec<ObjRef>) {
    match vm.heap.get(r) {
        Obj::String(_) => {}
        Obj::Function(f) => {
            let name = f.name;
            let constants: Vec<Value> = f.chunk.constants.clone();
            if let Some(n) = name {
                mark_ref(&mut vm.heap, gray, n);
            }
            for c in constants {
                mark_value(&mut vm.heap, gray, c);
            }
        }
        Obj::Closure(c) => {
            let function = c.function;
            let upvalues = c.upvalues.clone();
            mark_ref(&mut vm.heap, gray, function);
            for u in upvalues {
                mark_ref(&mut vm.heap, gray, u);
            }
        }
        Obj::Upvalue(u) => {
            if let UpvalueState::Closed(v) = u.state {
                mark_value(&mut vm.heap, gray, v);
            }
        }
        Obj::Class(c) => {
            let name = c.name;
            let methods: Vec<ObjRef> = c.methods.keys().copied().chain(c.methods.values().copied()).collect();
            mark_ref(&mut vm.heap, gray, name);
            for m in methods {
                mark_ref(&mut vm.heap, gray, m);
            }
        }
        Obj::Instance(i) => {
            let class = i.class;
            let field_keys: Vec<ObjRef> = i.fields.keys().copied().collect();
            let field_values: Vec<Value> = i.fields.values().copied().collect();
            mark_ref(&mut vm.heap, gray, class);
            for k in field_keys {
                mark_ref(&mut vm.heap, gray, k);
            }
            for v in field_values {
                mark_value(&mut vm.heap, gray, v);
            }
        }
        Obj::BoundMethod(b) => {
            let receiver = b.receiver;
            let closure = b.closure;
            mark_value(&mut vm.heap, gray, receiver);
            mark_ref(&mut vm.heap, gray, closure);
        }
        Obj::Native(n) => {
            let name = n.name;
            mark_ref(&mut vm.heap, gray, name);
        }
        Obj::Array(a) => {
            let items = a.items.clone();
            for v in items {
                mark_value(&mut vm.heap, gray, v);
            }
        }
        Obj::Dict(d) => {
            let keys: Vec<DictKey> = d.order.clone();
            let values: Vec<Value> = keys.iter().map(|k| *d.entries.get(k).unwrap()).collect();
            for k in &keys {
                if let DictKey::Str(s) = k {
                    mark_ref(&mut vm.heap, gray, *s);
                }
            }
            for v in values {
                mark_value(&mut vm.heap, gray, v);
            }
        }
    }
}

// File: src/vm/mod.rs
//
// Stack-based virtual machine for Lumen: dispatch loop over a chunk's
// bytecode, a call-frame stack, closures with shared upvalues, and method
// invocation/inheritance including `super`. The mark-sweep collector that
// keeps this VM's heap bounded lives in the child module `gc`, which
// reaches directly into this module's private state.

pub mod gc;

use ahash::AHashMap;

use crate::chunk::{disassemble_instruction, OpCode};
use crate::compiler;
use crate::errors::{find_closest_match, LumenError};
use crate::heap::{
    Arity, DictKey, Heap, LArray, LBoundMethod, LClass, LClosure, LDict, LInstance, LUpvalue,
    NativeFn, NativeObj, Obj, ObjRef, UpvalueState,
};
use crate::value::Value;

/// Call frames beyond this depth are a runtime "Stack overflow." error
/// rather than an actual process stack overflow.
const FRAMES_MAX: usize = 64;
/// Value-stack depth beyond this is likewise a runtime error, not UB.
const STACK_MAX: usize = 16 * 1024;

/// One in-progress invocation: the closure being executed, its instruction
/// pointer, and the stack index its local slots start at. Plain functions,
/// methods, and `init` calls all go through the same frame shape; for
/// methods, `slots_base` is the receiver's stack slot, which is also local
/// slot 0 ("this").
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots_base: usize,
}

/// What `Vm::interpret` produced: success, a batch of compile errors, or
/// a single runtime error with its call stack.
pub enum InterpretResult {
    Ok,
    CompileError(Vec<LumenError>),
    RuntimeError(LumenError),
}

/// The virtual machine: value stack, call-frame stack, globals, the open
/// upvalue list, and the heap/GC it drives. Single-threaded and
/// synchronous throughout; there is exactly one `Vm` per running program
/// and no concurrent access to any of this state.
pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub(crate) globals: AHashMap<ObjRef, Value>,
    /// Open upvalues ordered by strictly descending captured-slot index.
    pub(crate) open_upvalues: Vec<ObjRef>,
    /// Interned `"init"`, compared against method names to find a class's
    /// initializer without re-interning on every `CALL`/`CLASS` construct.
    pub(crate) init_string: ObjRef,
    /// Gated by the CLI's `--trace` flag: echoes each executed instruction
    /// and GC cycle stats to stderr. Has no bearing on language semantics.
    pub(crate) trace: bool,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: AHashMap::new(),
            open_upvalues: Vec::new(),
            init_string,
            trace: false,
        };
        vm.install_stdlib();
        vm
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    fn install_stdlib(&mut self) {
        self.define_native("clock", Arity::Fixed(0), native_clock);
        self.define_native("len", Arity::Fixed(1), native_len);
        self.define_native("type_name", Arity::Fixed(1), native_type_name);
        self.define_native("push", Arity::Fixed(2), native_push);
        self.define_native("pop", Arity::Fixed(1), native_pop);
    }

    /// Registers a host callable as a global.
    pub fn define_native(&mut self, name: &str, arity: Arity, func: NativeFn) {
        let name_ref = self.heap.intern(name);
        let native_ref = self.heap.alloc(Obj::Native(NativeObj { name: name_ref, arity, func }));
        self.globals.insert(name_ref, Value::Obj(native_ref));
    }

    /// Names of all currently-defined globals, for the REPL's `:vars`.
    pub fn global_names(&self) -> Vec<String> {
        self.globals.keys().map(|r| self.heap.as_string(*r).to_string()).collect()
    }

    /// Current GC byte counter, for the REPL's `:gc`.
    pub fn heap_bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated
    }

    /// Forces a collection cycle on demand (REPL's `:gc`); has no effect
    /// on language semantics, purely observational.
    pub fn force_collect(&mut self) {
        gc::collect_garbage(self);
    }

    pub fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// Compiles and runs `source` against this VM's existing heap/globals
    /// (a REPL keeps calling this on the same `Vm` so top-level `var`s
    /// persist across lines).
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function_ref = match compiler::compile(source, &mut self.heap) {
            Ok(f) => f,
            Err(errors) => return InterpretResult::CompileError(errors),
        };

        self.reset_stack();
        let closure_ref = self.heap.alloc(Obj::Closure(LClosure { function: function_ref, upvalues: Vec::new() }));
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots_base: 0 });

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(e) => InterpretResult::RuntimeError(e),
        }
    }

    // ---- stack helpers ----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: VM popped an empty stack")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- bytecode cursor ----

    fn current_function(&self) -> ObjRef {
        let closure_ref = self.frames.last().unwrap().closure;
        match self.heap.get(closure_ref) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("call frame closure was not a Closure"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let function_ref = self.current_function();
        let ip = self.frames.last().unwrap().ip;
        let byte = match self.heap.get(function_ref) {
            Obj::Function(f) => f.chunk.code[ip],
            _ => unreachable!("function ref did not point at a Function"),
        };
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        let function_ref = self.current_function();
        match self.heap.get(function_ref) {
            Obj::Function(f) => f.chunk.constants[idx],
            _ => unreachable!("function ref did not point at a Function"),
        }
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("constant operand was not a string"),
        }
    }

    // ---- errors ----

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().unwrap();
        let function_ref = match self.heap.get(frame.closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        match self.heap.get(function_ref) {
            Obj::Function(f) => f.chunk.lines[frame.ip.saturating_sub(1)],
            _ => unreachable!(),
        }
    }

    fn build_call_stack(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function_ref = match self.heap.get(frame.closure) {
                    Obj::Closure(c) => c.function,
                    _ => unreachable!(),
                };
                match self.heap.get(function_ref) {
                    Obj::Function(f) => {
                        let name = match f.name {
                            Some(n) => self.heap.as_string(n).to_string(),
                            None => "script".to_string(),
                        };
                        let line = f.chunk.lines[frame.ip.saturating_sub(1)];
                        format!("{name}() (line {line})")
                    }
                    _ => unreachable!(),
                }
            })
            .collect()
    }

    fn runtime_error(&self, message: String) -> LumenError {
        LumenError::runtime(message, self.current_line()).with_call_stack(self.build_call_stack())
    }

    fn runtime_error_with_suggestion(&self, message: String, target: &str, candidates: &[&str]) -> LumenError {
        let mut error = self.runtime_error(message);
        if let Some(suggestion) = find_closest_match(target, candidates) {
            error = error.with_suggestion(suggestion.to_string());
        }
        error
    }

    fn undefined_global_error(&self, name_ref: ObjRef) -> LumenError {
        let name = self.heap.as_string(name_ref).to_string();
        let candidates: Vec<&str> = self.globals.keys().map(|r| self.heap.as_string(*r)).collect();
        self.runtime_error_with_suggestion(format!("Undefined variable '{name}'."), &name, &candidates)
    }

    fn undefined_property_error(&self, name_ref: ObjRef, class_ref: ObjRef) -> LumenError {
        let name = self.heap.as_string(name_ref).to_string();
        let candidates: Vec<&str> = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.keys().map(|r| self.heap.as_string(*r)).collect(),
            _ => Vec::new(),
        };
        self.runtime_error_with_suggestion(format!("Undefined property '{name}'."), &name, &candidates)
    }

    // ---- dispatch loop ----

    fn run(&mut self) -> Result<(), LumenError> {
        loop {
            if self.stack.len() > STACK_MAX {
                return Err(self.runtime_error("Stack overflow.".to_string()));
            }
            if self.heap.should_collect() {
                gc::collect_garbage(self);
            }
            if self.trace {
                self.trace_instruction();
            }

            let op = OpCode::from_byte(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name).copied() {
                        Some(v) => self.push(v),
                        None => return Err(self.undefined_global_error(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let v = self.pop();
                    self.globals.insert(name, v);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains_key(&name) {
                        return Err(self.undefined_global_error(name));
                    }
                    self.globals.insert(name, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let up_ref = self.current_upvalue(slot);
                    self.push(self.read_upvalue(up_ref));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let up_ref = self.current_upvalue(slot);
                    let v = self.peek(0);
                    self.write_upvalue(up_ref, v);
                }
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::GetSuper => self.get_super()?,
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(a, b)));
                }
                OpCode::Greater => self.binary_cmp(|a, b| a > b)?,
                OpCode::Less => self.binary_cmp(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Sub => self.binary_int("-", |a, b| a.wrapping_sub(b))?,
                OpCode::Mul => self.binary_int("*", |a, b| a.wrapping_mul(b))?,
                OpCode::Div => self.div()?,
                OpCode::Negate => self.negate()?,
                OpCode::Not => self.not_()?,
                OpCode::Print => {
                    let v = self.pop();
                    println!("{}", self.stringify(v));
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    self.call_value(argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("compiler always loads 'super' before SUPER_INVOKE"),
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => self.make_closure(),
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let r = self.heap.alloc(Obj::Class(LClass { name, methods: AHashMap::new() }));
                    self.push(Value::Obj(r));
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::Method => self.define_method(),
                OpCode::Array => {
                    let n = self.read_byte() as usize;
                    let items = self.stack.split_off(self.stack.len() - n);
                    let r = self.heap.alloc(Obj::Array(LArray { items }));
                    self.push(Value::Obj(r));
                }
                OpCode::Dict => self.build_dict()?,
                OpCode::GetElement => {
                    let index = self.pop();
                    let target = self.pop();
                    let value = self.get_element(target, index)?;
                    self.push(value);
                }
                OpCode::SetElement => {
                    let value = self.pop();
                    let index = self.pop();
                    let target = self.pop();
                    self.set_element(target, index, value)?;
                    self.push(value);
                }
            }
        }
    }

    fn trace_instruction(&self) {
        let function_ref = self.current_function();
        let ip = self.frames.last().unwrap().ip;
        if let Obj::Function(f) = self.heap.get(function_ref) {
            let (line, _) = disassemble_instruction(&f.chunk, ip, &self.heap);
            eprintln!("{line}");
        }
    }

    // ---- arithmetic / comparison ----

    fn binary_int<F: Fn(i64, i64) -> i64>(&mut self, op_name: &str, f: F) -> Result<(), LumenError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => {
                self.push(Value::Int(f(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error(format!("Operands for '{op_name}' must be integers."))),
        }
    }

    fn binary_cmp<F: Fn(i64, i64) -> bool>(&mut self, f: F) -> Result<(), LumenError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(f(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be integers.".to_string())),
        }
    }

    fn div(&mut self) -> Result<(), LumenError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_int(), b.as_int()) {
            (Some(_), Some(0)) => Err(self.runtime_error("Division by zero.".to_string())),
            (Some(x), Some(y)) => {
                self.push(Value::Int(x.wrapping_div(y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands for '/' must be integers.".to_string())),
        }
    }

    fn add(&mut self) -> Result<(), LumenError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                self.push(Value::Int(x.wrapping_add(y)));
                Ok(())
            }
            (Value::Obj(ra), Value::Obj(rb)) if self.is_string(ra) && self.is_string(rb) => {
                let mut concatenated = String::with_capacity(self.heap.as_string(ra).len() + self.heap.as_string(rb).len());
                concatenated.push_str(self.heap.as_string(ra));
                concatenated.push_str(self.heap.as_string(rb));
                let r = self.heap.intern(&concatenated);
                self.push(Value::Obj(r));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands for '+' must be two integers or two strings.".to_string())),
        }
    }

    fn negate(&mut self) -> Result<(), LumenError> {
        let v = self.pop();
        match v.as_int() {
            Some(n) => {
                self.push(Value::Int(n.wrapping_neg()));
                Ok(())
            }
            None => Err(self.runtime_error("Operand for unary '-' must be an integer.".to_string())),
        }
    }

    /// `!`'s operator contract is stricter than general truthiness: zero
    /// is the only falsy `int`, whereas an `if`/`while` condition treats
    /// every `int` as true.
    fn not_(&mut self) -> Result<(), LumenError> {
        let v = self.pop();
        let is_falsy = match v {
            Value::Nil => true,
            Value::Bool(b) => !b,
            Value::Int(n) => n == 0,
            Value::Obj(_) => {
                return Err(self.runtime_error("Operand for '!' must be int, bool, or nil.".to_string()));
            }
        };
        self.push(Value::Bool(is_falsy));
        Ok(())
    }

    fn is_string(&self, r: ObjRef) -> bool {
        matches!(self.heap.get(r), Obj::String(_))
    }

    /// Projects a `Value` onto `DictKey`, rejecting any heap object that
    /// isn't a string. `DictKey::from_value` can't check this itself (it
    /// has no heap access), so every dict operation must go through here
    /// rather than calling it directly.
    fn dict_key(&self, value: Value) -> Option<DictKey> {
        match value {
            Value::Obj(r) if !self.is_string(r) => None,
            _ => DictKey::from_value(value),
        }
    }

    // ---- calls ----

    fn call_value(&mut self, argc: u8) -> Result<(), LumenError> {
        let callee_idx = self.stack.len() - argc as usize - 1;
        match self.stack[callee_idx] {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Closure(_) => self.call_closure(r, argc),
                Obj::Class(_) => self.call_class(r, argc),
                Obj::BoundMethod(_) => self.call_bound_method(r, argc),
                Obj::Native(_) => self.call_native(r, argc),
                _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
            },
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: u8) -> Result<(), LumenError> {
        let function_ref = match self.heap.get(closure_ref) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let arity = match self.heap.get(function_ref) {
            Obj::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots_base });
        Ok(())
    }

    fn call_class(&mut self, class_ref: ObjRef, argc: u8) -> Result<(), LumenError> {
        let instance_ref = self.heap.alloc(Obj::Instance(LInstance { class: class_ref, fields: AHashMap::new() }));
        let callee_idx = self.stack.len() - argc as usize - 1;
        self.stack[callee_idx] = Value::Obj(instance_ref);

        let initializer = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(&self.init_string).copied(),
            _ => unreachable!(),
        };
        match initializer {
            Some(init_closure) => self.call_closure(init_closure, argc),
            None => {
                if argc != 0 {
                    return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                }
                Ok(())
            }
        }
    }

    fn call_bound_method(&mut self, bound_ref: ObjRef, argc: u8) -> Result<(), LumenError> {
        let (receiver, closure) = match self.heap.get(bound_ref) {
            Obj::BoundMethod(b) => (b.receiver, b.closure),
            _ => unreachable!(),
        };
        let callee_idx = self.stack.len() - argc as usize - 1;
        self.stack[callee_idx] = receiver;
        self.call_closure(closure, argc)
    }

    fn call_native(&mut self, native_ref: ObjRef, argc: u8) -> Result<(), LumenError> {
        let (arity, func) = match self.heap.get(native_ref) {
            Obj::Native(n) => (n.arity, n.func),
            _ => unreachable!(),
        };
        if !arity.accepts(argc) {
            return Err(self.runtime_error(format!("Wrong number of arguments ({argc}) for native function.")));
        }
        let callee_idx = self.stack.len() - argc as usize - 1;
        let args: Vec<Value> = self.stack[callee_idx + 1..].to_vec();
        match func(self, &args) {
            Ok(result) => {
                self.stack.truncate(callee_idx);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), LumenError> {
        let receiver = self.peek(argc as usize);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.".to_string())),
        };

        let field = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.fields.get(&name).copied(),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let callee_idx = self.stack.len() - argc as usize - 1;
            self.stack[callee_idx] = value;
            return self.call_value(argc);
        }

        let class_ref = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.class,
            _ => unreachable!(),
        };
        self.invoke_from_class(class_ref, name, argc)
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name: ObjRef, argc: u8) -> Result<(), LumenError> {
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(&name).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(closure) => self.call_closure(closure, argc),
            None => Err(self.undefined_property_error(name, class_ref)),
        }
    }

    // ---- properties ----

    fn get_property(&mut self) -> Result<(), LumenError> {
        let name = self.read_string();
        let receiver = self.peek(0);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have properties.".to_string())),
        };

        let field = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.fields.get(&name).copied(),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            self.pop();
            self.push(value);
            return Ok(());
        }

        let class_ref = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.class,
            _ => unreachable!(),
        };
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(&name).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(closure) => {
                self.pop();
                let bound = self.heap.alloc(Obj::BoundMethod(LBoundMethod { receiver, closure }));
                self.push(Value::Obj(bound));
                Ok(())
            }
            None => Err(self.undefined_property_error(name, class_ref)),
        }
    }

    fn set_property(&mut self) -> Result<(), LumenError> {
        let name = self.read_string();
        let value = self.peek(0);
        let receiver = self.peek(1);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have fields.".to_string())),
        };
        match self.heap.get_mut(instance_ref) {
            Obj::Instance(i) => {
                i.fields.insert(name, value);
            }
            _ => unreachable!(),
        }
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn get_super(&mut self) -> Result<(), LumenError> {
        let name = self.read_string();
        let superclass_ref = match self.pop() {
            Value::Obj(r) => r,
            _ => unreachable!("compiler always loads superclass before GET_SUPER"),
        };
        let receiver = self.pop();
        let method = match self.heap.get(superclass_ref) {
            Obj::Class(c) => c.methods.get(&name).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(closure) => {
                let bound = self.heap.alloc(Obj::BoundMethod(LBoundMethod { receiver, closure }));
                self.push(Value::Obj(bound));
                Ok(())
            }
            None => Err(self.undefined_property_error(name, superclass_ref)),
        }
    }

    // ---- classes ----

    fn inherit(&mut self) -> Result<(), LumenError> {
        let subclass_val = self.pop();
        let superclass_val = self.peek(0);
        let super_ref = match superclass_val {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
            _ => return Err(self.runtime_error("Superclass must be a class.".to_string())),
        };
        let sub_ref = match subclass_val {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let inherited_methods = match self.heap.get(super_ref) {
            Obj::Class(c) => c.methods.clone(),
            _ => unreachable!(),
        };
        match self.heap.get_mut(sub_ref) {
            Obj::Class(c) => {
                for (name, closure) in inherited_methods {
                    c.methods.insert(name, closure);
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn define_method(&mut self) {
        let name = self.read_string();
        let closure_ref = match self.pop() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let class_ref = match self.peek(0) {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        match self.heap.get_mut(class_ref) {
            Obj::Class(c) => {
                c.methods.insert(name, closure_ref);
            }
            _ => unreachable!(),
        }
    }

    // ---- closures & upvalues ----

    fn make_closure(&mut self) {
        let function_ref = match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("CLOSURE operand was not a Function constant"),
        };
        let upvalue_count = match self.heap.get(function_ref) {
            Obj::Function(f) => f.upvalue_count,
            _ => unreachable!(),
        };

        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte();
            let index = self.read_byte() as usize;
            if is_local != 0 {
                let base = self.frames.last().unwrap().slots_base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let closure_ref = self.frames.last().unwrap().closure;
                let up = match self.heap.get(closure_ref) {
                    Obj::Closure(c) => c.upvalues[index],
                    _ => unreachable!(),
                };
                upvalues.push(up);
            }
        }

        let closure_ref = self.heap.alloc(Obj::Closure(LClosure { function: function_ref, upvalues }));
        self.push(Value::Obj(closure_ref));
    }

    fn current_upvalue(&self, slot: usize) -> ObjRef {
        let closure_ref = self.frames.last().unwrap().closure;
        match self.heap.get(closure_ref) {
            Obj::Closure(c) => c.upvalues[slot],
            _ => unreachable!(),
        }
    }

    fn open_slot_of(&self, r: ObjRef) -> Option<usize> {
        match self.heap.get(r) {
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Open(idx) => Some(idx),
                UpvalueState::Closed(_) => None,
            },
            _ => unreachable!(),
        }
    }

    /// Reuses an already-open upvalue for `stack_index` if one exists,
    /// otherwise allocates one and inserts it keeping the list in
    /// descending slot-index order.
    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            let idx = self.open_slot_of(r).expect("open_upvalues entry was already closed");
            if idx == stack_index {
                return r;
            }
            if idx < stack_index {
                insert_at = i;
                break;
            }
        }
        let upvalue_ref = self.heap.alloc(Obj::Upvalue(LUpvalue { state: UpvalueState::Open(stack_index) }));
        self.open_upvalues.insert(insert_at, upvalue_ref);
        upvalue_ref
    }

    /// Closes every open upvalue at or above `floor`, moving its value off
    /// the stack into the upvalue object itself.
    fn close_upvalues(&mut self, floor: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let idx = match self.open_slot_of(r) {
                Some(idx) => idx,
                None => break,
            };
            if idx < floor {
                break;
            }
            self.open_upvalues.remove(0);
            let value = self.stack[idx];
            match self.heap.get_mut(r) {
                Obj::Upvalue(u) => u.state = UpvalueState::Closed(value),
                _ => unreachable!(),
            }
        }
    }

    fn read_upvalue(&self, r: ObjRef) -> Value {
        match self.heap.get(r) {
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Open(idx) => self.stack[idx],
                UpvalueState::Closed(v) => v,
            },
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, r: ObjRef, value: Value) {
        match self.open_slot_of(r) {
            Some(idx) => self.stack[idx] = value,
            None => match self.heap.get_mut(r) {
                Obj::Upvalue(u) => u.state = UpvalueState::Closed(value),
                _ => unreachable!(),
            },
        }
    }

    // ---- arrays & dicts ----

    fn build_dict(&mut self) -> Result<(), LumenError> {
        let n = self.read_byte() as usize;
        let flat = self.stack.split_off(self.stack.len() - 2 * n);
        let mut dict = LDict::new();
        for pair in flat.chunks(2) {
            let key = self
                .dict_key(pair[0])
                .ok_or_else(|| self.runtime_error("Dict keys must be nil, bool, int, or string.".to_string()))?;
            dict.insert(key, pair[1]);
        }
        let r = self.heap.alloc(Obj::Dict(dict));
        self.push(Value::Obj(r));
        Ok(())
    }

    fn get_element(&self, target: Value, index: Value) -> Result<Value, LumenError> {
        match target {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Array(a) => {
                    let i = index.as_int().ok_or_else(|| self.runtime_error("Array index must be an integer.".to_string()))?;
                    if i < 0 || i as usize >= a.items.len() {
                        return Err(self.runtime_error(format!("Array index {i} out of range.")));
                    }
                    Ok(a.items[i as usize])
                }
                Obj::Dict(d) => {
                    let key = self
                        .dict_key(index)
                        .ok_or_else(|| self.runtime_error("Dict key type not supported.".to_string()))?;
                    d.entries.get(&key).copied().ok_or_else(|| self.runtime_error("Key not found in dict.".to_string()))
                }
                _ => Err(self.runtime_error("Only arrays and dicts support subscript access.".to_string())),
            },
            _ => Err(self.runtime_error("Only arrays and dicts support subscript access.".to_string())),
        }
    }

    fn set_element(&mut self, target: Value, index: Value, value: Value) -> Result<(), LumenError> {
        let target_ref = match target {
            Value::Obj(r) => r,
            _ => return Err(self.runtime_error("Only arrays and dicts support subscript assignment.".to_string())),
        };
        let is_array = matches!(self.heap.get(target_ref), Obj::Array(_));
        let is_dict = matches!(self.heap.get(target_ref), Obj::Dict(_));

        if is_array {
            let i = index.as_int().ok_or_else(|| self.runtime_error("Array index must be an integer.".to_string()))?;
            let len = match self.heap.get(target_ref) {
                Obj::Array(a) => a.items.len(),
                _ => unreachable!(),
            };
            if i < 0 || i as usize >= len {
                return Err(self.runtime_error(format!("Array index {i} out of range.")));
            }
            match self.heap.get_mut(target_ref) {
                Obj::Array(a) => a.items[i as usize] = value,
                _ => unreachable!(),
            }
            Ok(())
        } else if is_dict {
            let key = self.dict_key(index).ok_or_else(|| self.runtime_error("Dict key type not supported.".to_string()))?;
            match self.heap.get_mut(target_ref) {
                Obj::Dict(d) => d.insert(key, value),
                _ => unreachable!(),
            }
            Ok(())
        } else {
            Err(self.runtime_error("Only arrays and dicts support subscript assignment.".to_string()))
        }
    }

    // ---- printing ----

    fn stringify(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Obj(r) => self.stringify_obj(r),
        }
    }

    fn stringify_obj(&self, r: ObjRef) -> String {
        match self.heap.get(r) {
            Obj::String(s) => s.bytes.to_string(),
            Obj::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", self.heap.as_string(n)),
                None => "<script>".to_string(),
            },
            Obj::Closure(c) => self.stringify_obj(c.function),
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Class(c) => self.heap.as_string(c.name).to_string(),
            Obj::Instance(i) => {
                let class_name = match self.heap.get(i.class) {
                    Obj::Class(c) => self.heap.as_string(c.name),
                    _ => unreachable!(),
                };
                format!("<{class_name} instance>")
            }
            Obj::BoundMethod(b) => self.stringify_obj(b.closure),
            Obj::Native(n) => format!("<native fn {}>", self.heap.as_string(n.name)),
            Obj::Array(a) => {
                let items: Vec<String> = a.items.iter().map(|v| self.stringify(*v)).collect();
                format!("[{}]", items.join(", "))
            }
            Obj::Dict(d) => {
                let entries: Vec<String> = d
                    .order
                    .iter()
                    .map(|k| format!("{}: {}", self.stringify_dict_key(*k), self.stringify(*d.entries.get(k).unwrap())))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
        }
    }

    fn stringify_dict_key(&self, key: DictKey) -> String {
        match key {
            DictKey::Nil => "nil".to_string(),
            DictKey::Bool(b) => b.to_string(),
            DictKey::Int(n) => n.to_string(),
            DictKey::Str(r) => format!("\"{}\"", self.heap.as_string(r)),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

// ---- built-in natives ----

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::Int(elapsed.as_secs() as i64))
}

fn native_len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args[0] {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::Array(a) => Ok(Value::Int(a.items.len() as i64)),
            Obj::Dict(d) => Ok(Value::Int(d.order.len() as i64)),
            Obj::String(s) => Ok(Value::Int(s.bytes.len() as i64)),
            _ => Err("len() expects an array, dict, or string.".to_string()),
        },
        _ => Err("len() expects an array, dict, or string.".to_string()),
    }
}

fn native_type_name(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = match args[0] {
        Value::Nil => "nil",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Obj(r) => vm.heap.get(r).type_name(),
    };
    Ok(Value::Obj(vm.heap.intern(name)))
}

fn native_push(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args[0] {
        Value::Obj(r) if matches!(vm.heap.get(r), Obj::Array(_)) => {
            let value = args[1];
            match vm.heap.get_mut(r) {
                Obj::Array(a) => a.items.push(value),
                _ => unreachable!(),
            }
            Ok(Value::Nil)
        }
        _ => Err("push() expects an array as its first argument.".to_string()),
    }
}

fn native_pop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args[0] {
        Value::Obj(r) if matches!(vm.heap.get(r), Obj::Array(_)) => match vm.heap.get_mut(r) {
            Obj::Array(a) => a.items.pop().ok_or_else(|| "pop() on empty array.".to_string()),
            _ => unreachable!(),
        },
        _ => Err("pop() expects an array as its first argument.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> Vm {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            InterpretResult::Ok => vm,
            InterpretResult::CompileError(errors) => {
                panic!("unexpected compile error(s): {:?}", errors.iter().map(|e| &e.message).collect::<Vec<_>>())
            }
            InterpretResult::RuntimeError(e) => panic!("unexpected runtime error: {}", e.message),
        }
    }

    #[test]
    fn arithmetic_and_precedence() {
        run_ok("print 1 + 2 * 3; print (1 + 2) * 3;");
    }

    #[test]
    fn closure_counter_shares_upvalue() {
        run_ok(
            "fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }
             var f = make();
             if (f() != 1) { print \"bad\"; }
             if (f() != 2) { print \"bad\"; }",
        );
    }

    #[test]
    fn division_by_zero_is_runtime_error() {
        let mut vm = Vm::new();
        match vm.interpret("print 1 / 0;") {
            InterpretResult::RuntimeError(_) => {}
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn undefined_global_is_runtime_error() {
        let mut vm = Vm::new();
        match vm.interpret("print nope;") {
            InterpretResult::RuntimeError(_) => {}
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn array_and_dict_subscripts() {
        run_ok(
            "var a = [10, 20, 30];
             a[1] = 99;
             if (a[0] != 10 or a[1] != 99) { print \"bad\"; }
             var d = {\"k\": 1};
             d[\"k\"] = d[\"k\"] + 1;
             if (d[\"k\"] != 2) { print \"bad\"; }",
        );
    }

    #[test]
    fn string_interning_makes_concatenation_equal() {
        run_ok("var a = \"foo\"; var b = \"fo\" + \"o\"; if (a != b) { print \"bad\"; }");
    }

    #[test]
    fn non_string_object_as_dict_key_is_runtime_error() {
        let mut vm = Vm::new();
        match vm.interpret("var d = {}; d[[1]] = 2;") {
            InterpretResult::RuntimeError(_) => {}
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn printing_dict_with_non_string_key_does_not_panic() {
        let mut vm = Vm::new();
        match vm.interpret("var d = {}; print d[[1]];") {
            InterpretResult::RuntimeError(_) => {}
            _ => panic!("expected a runtime error"),
        }
    }
}

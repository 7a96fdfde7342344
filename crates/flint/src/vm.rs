//! The bytecode virtual machine.
//!
//! A stack machine over the chunks the compiler emits. All runtime state
//! lives here: the operand stack, the call-frame array, the list of open
//! upvalues, the globals table, and the heap itself. The dispatch loop is
//! a plain fetch-decode-execute `match`; faults unwind through the
//! frame-local handler slots installed by `handle`/`dynvar` expressions
//! before surfacing as runtime errors with a stack trace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::chunk::Op;
use crate::compiler;
use crate::debug;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::native::{self, NativeDef};
use crate::object::{
    BoundMethod, Class, Closure, Dynvar, Instance, IterCursor, ObjData, Table, Upvalue,
};
use crate::value::{print_value, type_name, values_equal, Handle, PrintFlags, Value};

/// Operand stack capacity.
pub const STACK_MAX: usize = 4096;
/// Call stack capacity.
pub const FRAMES_MAX: usize = 64;

/// One activation record. `base` indexes the operand stack; slot `base`
/// holds the callee (or the receiver for methods).
struct CallFrame {
    closure: Handle,
    /// The closure's function, cached to skip one hop per fetch.
    function: Handle,
    ip: usize,
    base: usize,
    /// Nil, a callable installed by `CALL_HAND`, or a Dynvar installed
    /// by `CALL_BIND`. Consulted on return and during unwinding.
    handler: Value,
}

/// Faults raised inside the dispatch loop. `Runtime` faults may be
/// caught by a `handle` frame; the other two always unwind fully.
enum Fault {
    Runtime(String),
    Overflow(&'static str),
    Interrupted,
}

enum Flow {
    Continue,
    /// The script frame returned.
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DebugFlags {
    /// Disassemble each function after compilation.
    pub print_code: bool,
    /// Disassemble and dump the stack at every dispatch tick.
    pub trace_execution: bool,
    /// Report steps/bytes/collections after each interpretation.
    pub statistics: bool,
}

pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, ordered by descending stack slot.
    open_upvalues: Vec<Handle>,
    pub(crate) globals: Table,
    init_string: Handle,
    /// Captured `print` output, drained by the embedder.
    pub(crate) output: String,
    interrupted: Arc<AtomicBool>,
    lambda_count: i64,
    /// xorshift state for the `random`/`seed_rand` natives.
    pub(crate) rand_state: u32,
    pub(crate) start: Instant,
    pub debug: DebugFlags,
    steps: u64,
}

impl Vm {
    pub fn new() -> Vm {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            init_string,
            output: String::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            lambda_count: 0,
            rand_state: 0x2f6e_2b1d,
            start: Instant::now(),
            debug: DebugFlags::default(),
            steps: 0,
        };
        native::install(&mut vm);
        vm
    }

    /// The flag a signal handler may set to abort execution at the next
    /// dispatch tick.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Drain everything `print` produced since the last call.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Compile and execute one source buffer.
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let persistent = self.persistent_roots();
        let function = compiler::compile(
            &mut self.heap,
            source,
            &persistent,
            &mut self.lambda_count,
            self.debug.print_code,
        )?;

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.steps = 0;

        self.stack.push(Value::Obj(function));
        let closure = self.heap.insert(ObjData::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.stack[0] = Value::Obj(closure);

        let result = match self.call_closure(closure, 0) {
            Ok(()) => self.run(),
            Err(fault) => Err(fault),
        };

        if self.debug.statistics {
            eprintln!(
                "[{} steps; {} bytes; {} GCs]",
                self.steps,
                self.heap.total_allocated(),
                self.heap.collections()
            );
        }

        result.map_err(|fault| self.finish_fault(fault))
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    fn run(&mut self) -> std::result::Result<(), Fault> {
        loop {
            if self.interrupted.load(Ordering::Relaxed) {
                self.interrupted.store(false, Ordering::Relaxed);
                return Err(Fault::Interrupted);
            }

            if self.debug.trace_execution {
                self.trace_tick();
            }

            self.steps += 1;
            let byte = self.read_byte();
            let op = match Op::from_byte(byte) {
                Some(op) => op,
                None => return Err(Fault::Runtime(format!("Unknown opcode {byte}."))),
            };

            match self.dispatch(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return Ok(()),
                Err(fault) => self.recover(fault)?,
            }
        }
    }

    fn trace_tick(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push('[');
            line.push_str(&print_value(&self.heap, *value, PrintFlags::MACHINE));
            line.push_str("] ");
        }
        eprintln!("{line}");
        let frame = self.frame();
        let chunk = &self.heap.function(frame.function).chunk;
        let (text, _) = debug::disassemble_instruction(&self.heap, chunk, frame.ip);
        eprintln!("{text}");
    }

    fn dispatch(&mut self, op: Op) -> std::result::Result<Flow, Fault> {
        match op {
            Op::Constant => {
                let value = self.read_constant();
                self.push(value)?;
            }
            Op::Nil => self.push(Value::Nil)?,
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Zero => self.push(Value::Int(0))?,
            Op::Int => {
                let byte = self.read_byte();
                self.push(Value::Int(byte as i64))?;
            }
            Op::Pop => {
                self.pop();
            }
            Op::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Op::Dup => {
                let top = self.peek(0);
                self.push(top)?;
            }

            Op::GetLocal => {
                let slot = self.read_byte() as usize;
                let value = self.stack[self.frame().base + slot];
                self.push(value)?;
            }
            Op::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame().base;
                self.stack[base + slot] = self.peek(0);
            }

            Op::GetGlobal => {
                let name = self.read_constant();
                match self.globals.get(&name).copied() {
                    Some(value) => self.push(value)?,
                    None => return Err(self.undefined_variable(name)),
                }
            }
            Op::DefGlobal => {
                let name = self.read_constant();
                let value = self.peek(0);
                self.globals.insert(name, value);
                self.pop();
            }
            Op::SetGlobal => {
                let name = self.read_constant();
                if !self.globals.contains_key(&name) {
                    return Err(self.undefined_variable(name));
                }
                let value = self.peek(0);
                self.globals.insert(name, value);
            }

            Op::GetUpvalue => {
                let index = self.read_byte() as usize;
                let handle = self.heap.closure(self.frame().closure).upvalues[index];
                let upvalue = self.heap.upvalue(handle);
                let value = match upvalue.slot {
                    Some(slot) => self.stack[slot],
                    None => upvalue.closed,
                };
                self.push(value)?;
            }
            Op::SetUpvalue => {
                let index = self.read_byte() as usize;
                let handle = self.heap.closure(self.frame().closure).upvalues[index];
                let value = self.peek(0);
                let upvalue = self.heap.upvalue_mut(handle);
                match upvalue.slot {
                    Some(slot) => self.stack[slot] = value,
                    None => upvalue.closed = value,
                }
            }

            Op::GetProperty => {
                let name = self.read_constant();
                let receiver = self.peek(0);
                let looked_up = match receiver.as_handle() {
                    Some(handle) => match &self.heap.get(handle).data {
                        ObjData::Instance(instance) => {
                            Some((instance.class, instance.fields.get(&name).copied()))
                        }
                        _ => None,
                    },
                    None => None,
                };
                match looked_up {
                    Some((_, Some(value))) => self.drop_n_push(1, value)?,
                    Some((class, None)) => self.bind_method(class, name)?,
                    None => {
                        return Err(Fault::Runtime("Only instances have properties.".to_string()));
                    }
                }
            }
            Op::SetProperty => {
                let name = self.read_constant();
                let receiver = self.peek(1);
                let value = self.peek(0);
                match receiver.as_handle() {
                    Some(handle) if matches!(self.heap.get(handle).data, ObjData::Instance(_)) => {
                        self.heap.instance_mut(handle).fields.insert(name, value);
                        self.pop();
                        self.drop_n_push(1, value)?;
                    }
                    _ => {
                        return Err(Fault::Runtime("Only instances have properties.".to_string()));
                    }
                }
            }
            Op::GetSuper => {
                let name = self.read_constant();
                let superclass = self
                    .pop()
                    .as_handle()
                    .expect("compiler pushes the superclass");
                self.bind_method(superclass, name)?;
            }

            Op::Equal => {
                let b = self.pop();
                let a = self.pop();
                let equal = values_equal(&self.heap, a, b);
                self.push(Value::Bool(equal))?;
            }
            Op::Less => self.compare_less()?,
            Op::Add => self.add()?,
            Op::Sub => self.arithmetic(op)?,
            Op::Mul => self.arithmetic(op)?,
            Op::Div => self.arithmetic(op)?,
            Op::Mod => self.arithmetic(op)?,
            Op::Neg => self.negate()?,
            Op::Not => {
                let value = self.pop();
                self.push(Value::Bool(!value.is_truthy()))?;
            }

            Op::Print => {
                let value = self.pop();
                let text = print_value(&self.heap, value, PrintFlags::HUMAN);
                self.output.push_str(&text);
            }
            Op::Println => {
                let value = self.pop();
                let text = print_value(&self.heap, value, PrintFlags::HUMAN);
                self.output.push_str(&text);
                self.output.push('\n');
            }
            Op::Printq => {
                let value = self.pop();
                if value != Value::Nil {
                    let text = print_value(&self.heap, value, PrintFlags::MACHINE);
                    self.output.push_str(&text);
                    self.output.push('\n');
                }
            }

            Op::Jump => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip += offset;
            }
            Op::JumpOr => {
                let offset = self.read_u16() as usize;
                if self.peek(0).is_truthy() {
                    self.frame_mut().ip += offset;
                } else {
                    self.pop();
                }
            }
            Op::JumpAnd => {
                let offset = self.read_u16() as usize;
                if self.peek(0).is_truthy() {
                    self.pop();
                } else {
                    self.frame_mut().ip += offset;
                }
            }
            Op::JumpTrue => {
                let offset = self.read_u16() as usize;
                if self.pop().is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::JumpFalse => {
                let offset = self.read_u16() as usize;
                if !self.pop().is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::Loop => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip -= offset;
            }

            Op::Call => {
                let arg_count = self.read_byte() as usize;
                self.call_value(self.peek(arg_count), arg_count)?;
            }
            Op::Call0 => self.call_value(self.peek(0), 0)?,
            Op::Call1 => self.call_value(self.peek(1), 1)?,
            Op::Call2 => self.call_value(self.peek(2), 2)?,
            Op::VCall => {
                let base_count = self.read_byte() as usize;
                let arg_count = base_count + self.pop_count()?;
                self.call_value(self.peek(arg_count), arg_count)?;
            }

            Op::Invoke => {
                let name = self.read_constant();
                let arg_count = self.read_byte() as usize;
                self.invoke(name, arg_count)?;
            }
            Op::VInvoke => {
                let name = self.read_constant();
                let arg_count = self.read_byte() as usize + self.pop_count()?;
                self.invoke(name, arg_count)?;
            }
            Op::SuperInvoke => {
                let name = self.read_constant();
                let superclass = self
                    .pop()
                    .as_handle()
                    .expect("compiler pushes the superclass");
                let arg_count = self.read_byte() as usize;
                self.invoke_from_class(superclass, name, arg_count)?;
            }
            Op::VSuperInvoke => {
                let name = self.read_constant();
                let superclass = self
                    .pop()
                    .as_handle()
                    .expect("compiler pushes the superclass");
                let arg_count = self.read_byte() as usize + self.pop_count()?;
                self.invoke_from_class(superclass, name, arg_count)?;
            }

            Op::Closure => {
                let function = self
                    .read_constant()
                    .as_handle()
                    .expect("closure constant is a function");
                let upvalue_count = self.heap.function(function).upvalue_count as usize;

                self.maybe_collect();
                let closure = self.heap.insert(ObjData::Closure(Closure {
                    function,
                    upvalues: Vec::with_capacity(upvalue_count),
                }));
                self.push(Value::Obj(closure))?;

                for _ in 0..upvalue_count {
                    let encoded = self.read_byte();
                    let index = (encoded & 0x7f) as usize;
                    let upvalue = if encoded & compiler::UPVALUE_IS_LOCAL != 0 {
                        let slot = self.frame().base + index;
                        self.capture_upvalue(slot)
                    } else {
                        self.heap.closure(self.frame().closure).upvalues[index]
                    };
                    match &mut self.heap.get_mut(closure).data {
                        ObjData::Closure(c) => c.upvalues.push(upvalue),
                        _ => unreachable!("closure just allocated"),
                    }
                }
            }
            Op::CloseUpvalue => {
                self.close_upvalues(self.stack.len() - 1);
                self.pop();
            }

            Op::Return => {
                let result = self.pop();
                return self.do_return(result);
            }
            Op::ReturnNil => return self.do_return(Value::Nil),

            Op::Class => {
                let name = self
                    .read_constant()
                    .as_handle()
                    .expect("class constant is a string");
                self.maybe_collect();
                let class = self.heap.insert(ObjData::Class(Class {
                    name,
                    superclass: None,
                    methods: Table::new(),
                }));
                self.push(Value::Obj(class))?;
            }
            Op::Inherit => {
                let superclass = self.peek(1);
                let super_handle = match superclass.as_handle() {
                    Some(handle) if matches!(self.heap.get(handle).data, ObjData::Class(_)) => {
                        handle
                    }
                    _ => return Err(Fault::Runtime("Superclass must be a class.".to_string())),
                };
                let subclass = self
                    .peek(0)
                    .as_handle()
                    .expect("compiler pushes the subclass");
                let methods: Vec<(Value, Value)> = self
                    .heap
                    .class(super_handle)
                    .methods
                    .iter()
                    .map(|(k, v)| (*k, *v))
                    .collect();
                let sub = self.heap.class_mut(subclass);
                sub.superclass = Some(super_handle);
                for (key, value) in methods {
                    sub.methods.insert(key, value);
                }
                self.pop();
            }
            Op::Method => {
                let name = self.read_constant();
                let method = self.peek(0);
                let class = self
                    .peek(1)
                    .as_handle()
                    .expect("compiler pushes the class");
                self.heap.class_mut(class).methods.insert(name, method);
                // Remember the owning class for stack traces.
                if let Some(closure) = method.as_handle() {
                    let function = self.heap.closure(closure).function;
                    match &mut self.heap.get_mut(function).data {
                        ObjData::Function(f) => f.class = Value::Obj(class),
                        _ => unreachable!("method is a closure"),
                    }
                }
                self.pop();
            }

            Op::List => {
                let count = self.read_byte() as usize;
                self.build_list(count)?;
            }
            Op::VList => {
                let count = self.read_byte() as usize + self.pop_count()?;
                self.build_list(count)?;
            }
            Op::GetIndex => self.get_index()?,
            Op::SetIndex => self.set_index()?,
            Op::GetSlice => self.get_slice()?,
            Op::Unpack => {
                let value = self.pop();
                let base_count = self.pop_count()?;
                let items = match value.as_handle() {
                    Some(handle) => match &self.heap.get(handle).data {
                        ObjData::List(items) => items.clone(),
                        _ => {
                            return Err(Fault::Runtime("Item to unpack is not a list.".to_string()));
                        }
                    },
                    None => {
                        return Err(Fault::Runtime("Item to unpack is not a list.".to_string()));
                    }
                };
                let count = items.len();
                for item in items {
                    self.push(item)?;
                }
                self.push(Value::Int((base_count + count) as i64))?;
            }

            Op::GetItKey => self.iter_access(false)?,
            Op::GetItVal => self.iter_access(true)?,
            Op::SetItVal => self.iter_store()?,

            Op::CallHand => {
                let handler = self.pop();
                let thunk = self.peek(0);
                let before = self.frames.len();
                self.call_value(thunk, 0)?;
                if self.frames.len() > before {
                    self.frame_mut().handler = handler;
                }
            }
            Op::CallBind => {
                let name = self.read_constant();
                // Thunk and value are still on the stack here, so the
                // dynvar allocation below is the only unrooted object
                // and nothing between its creation and the handler-slot
                // assignment can trigger a collection (the thunk is a
                // zero-parameter closure).
                self.maybe_collect();
                let thunk = self.pop();
                let value = self.pop();
                let previous = self.globals.get(&name).copied().unwrap_or(Value::Empty);
                let name_handle = name.as_handle().expect("dynvar name is a string");
                let dynvar = self.heap.insert(ObjData::Dynvar(Dynvar {
                    name: name_handle,
                    previous,
                }));
                self.globals.insert(name, value);
                self.push(thunk)?;
                let before = self.frames.len();
                self.call_value(thunk, 0)?;
                if self.frames.len() > before {
                    self.frame_mut().handler = Value::Obj(dynvar);
                }
            }
        }
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Stack and frame primitives
    // -----------------------------------------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn push(&mut self, value: Value) -> std::result::Result<(), Fault> {
        if self.stack.len() >= STACK_MAX {
            return Err(Fault::Overflow("Value stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// Drop `n` values and push one in their place.
    fn drop_n_push(&mut self, n: usize, value: Value) -> std::result::Result<(), Fault> {
        if n == 0 {
            return self.push(value);
        }
        self.stack.truncate(self.stack.len() - n);
        self.stack.push(value);
        Ok(())
    }

    /// Pop the runtime argument count maintained by the variadic-call
    /// protocol.
    fn pop_count(&mut self) -> std::result::Result<usize, Fault> {
        match self.pop() {
            Value::Int(count) if count >= 0 => Ok(count as usize),
            _ => Err(Fault::Runtime("Corrupted unpack count.".to_string())),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from_be_bytes([high, low])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("no active call frame");
        self.heap.function(frame.function).chunk.constants[index]
    }

    // -----------------------------------------------------------------------
    // Garbage-collection safepoint
    // -----------------------------------------------------------------------

    /// Collect if the heap asks for it, rooting everything the VM can
    /// reach: the stack, frames (closures and handler slots), open
    /// upvalues, globals, and the `init` string.
    pub(crate) fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let mut roots: Vec<Value> =
            Vec::with_capacity(self.stack.len() + self.globals.len() * 2 + self.frames.len() * 2 + 8);
        roots.extend_from_slice(&self.stack);
        for frame in &self.frames {
            roots.push(Value::Obj(frame.closure));
            roots.push(frame.handler);
        }
        for upvalue in &self.open_upvalues {
            roots.push(Value::Obj(*upvalue));
        }
        for (key, value) in &self.globals {
            roots.push(*key);
            roots.push(*value);
        }
        roots.push(Value::Obj(self.init_string));
        self.heap.collect(&roots);
    }

    fn persistent_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = Vec::with_capacity(self.globals.len() * 2 + 1);
        for (key, value) in &self.globals {
            roots.push(*key);
            roots.push(*value);
        }
        roots.push(Value::Obj(self.init_string));
        roots
    }

    /// Unconditional collection, for the `gc()` native.
    pub(crate) fn force_collect(&mut self) {
        let stress = self.heap.stress_gc;
        self.heap.stress_gc = true;
        self.maybe_collect();
        self.heap.stress_gc = stress;
    }

    /// Allocate a list at a safepoint (item values must be rooted).
    pub(crate) fn alloc_list(&mut self, items: Vec<Value>) -> Handle {
        self.maybe_collect();
        self.heap.insert(ObjData::List(items))
    }

    /// Intern a string at a safepoint (operands must be rooted).
    pub(crate) fn intern_gc(&mut self, chars: &str) -> Handle {
        self.maybe_collect();
        self.heap.intern_string(chars)
    }

    /// Intern a real at a safepoint.
    pub(crate) fn intern_real_gc(&mut self, value: f64) -> Handle {
        self.maybe_collect();
        self.heap.intern_real(value)
    }

    // -----------------------------------------------------------------------
    // Arithmetic and comparison
    // -----------------------------------------------------------------------

    fn numeric(&self, value: Value) -> Option<Num> {
        match value {
            Value::Int(i) => Some(Num::Int(i)),
            Value::Obj(handle) => self.heap.real_value(handle).map(Num::Real),
            _ => None,
        }
    }

    /// Both operands as a pair, coercing int to real when mixed.
    fn number_pair(&self, a: Value, b: Value) -> Option<Nums> {
        match (self.numeric(a)?, self.numeric(b)?) {
            (Num::Int(x), Num::Int(y)) => Some(Nums::Ints(x, y)),
            (x, y) => Some(Nums::Reals(x.as_f64(), y.as_f64())),
        }
    }

    fn is_string(&self, value: Value) -> bool {
        matches!(
            value.as_handle().map(|h| &self.heap.get(h).data),
            Some(ObjData::Str(_))
        )
    }

    fn is_list(&self, value: Value) -> bool {
        matches!(
            value.as_handle().map(|h| &self.heap.get(h).data),
            Some(ObjData::List(_))
        )
    }

    fn add(&mut self) -> std::result::Result<(), Fault> {
        let b = self.peek(0);
        let a = self.peek(1);

        if let Some(nums) = self.number_pair(a, b) {
            let result = match nums {
                // Integer overflow promotes to a real.
                Nums::Ints(x, y) => match x.checked_add(y) {
                    Some(sum) => Value::Int(sum),
                    None => Value::Obj(self.intern_real_gc(x as f64 + y as f64)),
                },
                Nums::Reals(x, y) => Value::Obj(self.intern_real_gc(x + y)),
            };
            self.drop_n_push(2, result)
        } else if self.is_string(a) && self.is_string(b) {
            let concat = {
                let left = self.heap.str_value(a.as_handle().expect("checked"));
                let right = self.heap.str_value(b.as_handle().expect("checked"));
                let mut s = String::with_capacity(left.len() + right.len());
                s.push_str(left);
                s.push_str(right);
                s
            };
            let handle = self.intern_gc(&concat);
            self.drop_n_push(2, Value::Obj(handle))
        } else if self.is_list(a) && self.is_list(b) {
            self.maybe_collect();
            let mut items = self.heap.list(a.as_handle().expect("checked")).clone();
            items.extend_from_slice(self.heap.list(b.as_handle().expect("checked")));
            let handle = self.heap.insert(ObjData::List(items));
            self.drop_n_push(2, Value::Obj(handle))
        } else {
            Err(Fault::Runtime(
                "Operands must be numbers, strings, or lists.".to_string(),
            ))
        }
    }

    fn arithmetic(&mut self, op: Op) -> std::result::Result<(), Fault> {
        let b = self.peek(0);
        let a = self.peek(1);
        let nums = self
            .number_pair(a, b)
            .ok_or_else(|| Fault::Runtime("Operands must be numbers.".to_string()))?;

        let result = match nums {
            Nums::Ints(x, y) => match op {
                Op::Sub => self.int_result(x.checked_sub(y), x as f64 - y as f64),
                Op::Mul => self.int_result(x.checked_mul(y), x as f64 * y as f64),
                Op::Div => {
                    if y == 0 {
                        return Err(Fault::Runtime("Division by zero.".to_string()));
                    }
                    self.int_result(x.checked_div(y), x as f64 / y as f64)
                }
                Op::Mod => {
                    if y == 0 {
                        return Err(Fault::Runtime("Division by zero.".to_string()));
                    }
                    self.int_result(x.checked_rem(y), x as f64 % y as f64)
                }
                _ => unreachable!("not an arithmetic opcode"),
            },
            Nums::Reals(x, y) => {
                let value = match op {
                    Op::Sub => x - y,
                    Op::Mul => x * y,
                    Op::Div => x / y,
                    Op::Mod => x % y,
                    _ => unreachable!("not an arithmetic opcode"),
                };
                Value::Obj(self.intern_real_gc(value))
            }
        };
        self.drop_n_push(2, result)
    }

    fn int_result(&mut self, checked: Option<i64>, promoted: f64) -> Value {
        match checked {
            Some(value) => Value::Int(value),
            None => Value::Obj(self.intern_real_gc(promoted)),
        }
    }

    fn negate(&mut self) -> std::result::Result<(), Fault> {
        let value = self.peek(0);
        let result = match self.numeric(value) {
            Some(Num::Int(i)) => self.int_result(i.checked_neg(), -(i as f64)),
            Some(Num::Real(r)) => Value::Obj(self.intern_real_gc(-r)),
            None => return Err(Fault::Runtime("Operand must be a number.".to_string())),
        };
        self.drop_n_push(1, result)
    }

    fn compare_less(&mut self) -> std::result::Result<(), Fault> {
        let b = self.peek(0);
        let a = self.peek(1);
        let result = if let Some(nums) = self.number_pair(a, b) {
            match nums {
                Nums::Ints(x, y) => x < y,
                Nums::Reals(x, y) => x < y,
            }
        } else if self.is_string(a) && self.is_string(b) {
            let left = self.heap.str_value(a.as_handle().expect("checked"));
            let right = self.heap.str_value(b.as_handle().expect("checked"));
            left < right
        } else {
            return Err(Fault::Runtime(
                "Operands must be numbers or strings.".to_string(),
            ));
        };
        self.drop_n_push(2, Value::Bool(result))
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: usize) -> std::result::Result<(), Fault> {
        if let Some(handle) = callee.as_handle() {
            enum Kind {
                Closure,
                Bound(Value, Handle),
                Class,
                Native(&'static NativeDef),
                Other,
            }
            let kind = match &self.heap.get(handle).data {
                ObjData::Closure(_) => Kind::Closure,
                ObjData::Bound(bound) => Kind::Bound(bound.receiver, bound.method),
                ObjData::Class(_) => Kind::Class,
                ObjData::Native(def) => Kind::Native(*def),
                _ => Kind::Other,
            };
            match kind {
                Kind::Closure => return self.call_closure(handle, arg_count),
                Kind::Bound(receiver, method) => {
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, arg_count);
                }
                Kind::Class => return self.call_class(handle, arg_count),
                Kind::Native(def) => return self.call_native(def, arg_count),
                Kind::Other => {}
            }
        }
        Err(Fault::Runtime(
            "Can only call functions and classes.".to_string(),
        ))
    }

    fn call_closure(
        &mut self,
        closure: Handle,
        mut arg_count: usize,
    ) -> std::result::Result<(), Fault> {
        let function = self.heap.closure(closure).function;
        let (arity, has_rest) = {
            let f = self.heap.function(function);
            (f.arity as usize, f.has_rest_param)
        };

        if has_rest {
            // The rest parameter collects every argument beyond the
            // fixed ones into a fresh list.
            if arg_count + 1 < arity {
                return Err(Fault::Runtime(format!(
                    "Expected at least {} arguments but got {}.",
                    arity - 1,
                    arg_count
                )));
            }
            let extra = arg_count - (arity - 1);
            self.maybe_collect();
            let start = self.stack.len() - extra;
            let rest = self.stack[start..].to_vec();
            let list = self.heap.insert(ObjData::List(rest));
            self.stack.truncate(start);
            self.push(Value::Obj(list))?;
            arg_count = arity;
        } else if arg_count != arity {
            return Err(Fault::Runtime(format!(
                "Expected {arity} arguments but got {arg_count}."
            )));
        }

        if self.frames.len() >= FRAMES_MAX {
            return Err(Fault::Runtime("Call stack overflow.".to_string()));
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
            handler: Value::Nil,
        });
        Ok(())
    }

    fn call_class(&mut self, class: Handle, arg_count: usize) -> std::result::Result<(), Fault> {
        self.maybe_collect();
        let instance = self.heap.insert(ObjData::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - arg_count - 1;
        self.stack[slot] = Value::Obj(instance);

        let initializer = self
            .heap
            .class(class)
            .methods
            .get(&Value::Obj(self.init_string))
            .copied();
        match initializer {
            Some(init) => {
                let method = init.as_handle().expect("methods are closures");
                self.call_closure(method, arg_count)
            }
            None if arg_count != 0 => Err(Fault::Runtime(format!(
                "Expected 0 arguments but got {arg_count}."
            ))),
            None => Ok(()),
        }
    }

    fn call_native(
        &mut self,
        def: &'static NativeDef,
        arg_count: usize,
    ) -> std::result::Result<(), Fault> {
        self.check_signature(def, arg_count)?;
        let base = self.stack.len() - arg_count;
        let result = (def.function)(self, base, arg_count).map_err(Fault::Runtime)?;
        self.stack.truncate(base);
        let slot = self.stack.len() - 1;
        self.stack[slot] = result;
        Ok(())
    }

    fn check_signature(
        &self,
        def: &'static NativeDef,
        arg_count: usize,
    ) -> std::result::Result<(), Fault> {
        let signature = def.signature.as_bytes();
        let max = signature.len();
        let mut min = max;
        // Trailing lowercase letters mark optional parameters.
        while min > 0 && signature[min - 1].is_ascii_lowercase() {
            min -= 1;
        }

        if arg_count < min || arg_count > max {
            return Err(Fault::Runtime(if min == max {
                format!("Expected {max} arguments but got {arg_count}.")
            } else {
                format!("Expected {min} to {max} arguments but got {arg_count}.")
            }));
        }

        let base = self.stack.len() - arg_count;
        for (index, letter) in signature.iter().take(arg_count).enumerate() {
            let argument = self.stack[base + index];
            if let Some(expected) = self.signature_mismatch(argument, letter.to_ascii_uppercase()) {
                return Err(Fault::Runtime(format!(
                    "Type mismatch at argument {}, expected {}.",
                    index + 1,
                    expected
                )));
            }
        }
        Ok(())
    }

    /// `None` when the argument satisfies the signature letter, else the
    /// description used in the error message.
    fn signature_mismatch(&self, value: Value, letter: u8) -> Option<&'static str> {
        let ok = match letter {
            b'A' => true,
            b'N' => self.numeric(value).is_some(),
            b'S' => self.is_string(value),
            b'L' => self.is_list(value),
            b'Q' => self.is_string(value) || self.is_list(value),
            b'B' => matches!(value, Value::Bool(_)),
            b'I' => matches!(
                value.as_handle().map(|h| &self.heap.get(h).data),
                Some(ObjData::Instance(_))
            ),
            _ => false,
        };
        if ok {
            None
        } else {
            Some(match letter {
                b'N' => "a number",
                b'S' => "a string",
                b'L' => "a list",
                b'Q' => "a sequence",
                b'B' => "a bool",
                b'I' => "an instance",
                _ => "an unknown type",
            })
        }
    }

    fn invoke(&mut self, name: Value, arg_count: usize) -> std::result::Result<(), Fault> {
        let receiver = self.peek(arg_count);
        let looked_up = match receiver.as_handle() {
            Some(handle) => match &self.heap.get(handle).data {
                ObjData::Instance(instance) => {
                    Some((instance.class, instance.fields.get(&name).copied()))
                }
                _ => None,
            },
            None => None,
        };
        let Some((class, field)) = looked_up else {
            return Err(Fault::Runtime("Only instances have methods.".to_string()));
        };

        // A field shadowing the method name is called as a value.
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: Handle,
        name: Value,
        arg_count: usize,
    ) -> std::result::Result<(), Fault> {
        match self.heap.class(class).methods.get(&name).copied() {
            Some(method) => {
                let closure = method.as_handle().expect("methods are closures");
                self.call_closure(closure, arg_count)
            }
            None => Err(self.undefined_property(name)),
        }
    }

    fn bind_method(&mut self, class: Handle, name: Value) -> std::result::Result<(), Fault> {
        let method = self.heap.class(class).methods.get(&name).copied();
        let Some(method) = method.and_then(Value::as_handle) else {
            return Err(self.undefined_property(name));
        };
        self.maybe_collect();
        let receiver = self.peek(0);
        let bound = self.heap.insert(ObjData::Bound(BoundMethod { receiver, method }));
        self.drop_n_push(1, Value::Obj(bound))
    }

    // -----------------------------------------------------------------------
    // Returns, upvalues, unwinding
    // -----------------------------------------------------------------------

    fn do_return(&mut self, result: Value) -> std::result::Result<Flow, Fault> {
        let frame = self.frames.pop().expect("no active call frame");
        self.close_upvalues(frame.base);
        self.restore_dynvar(frame.handler);

        if self.frames.is_empty() {
            self.stack.truncate(frame.base);
            return Ok(Flow::Done);
        }
        self.stack.truncate(frame.base);
        self.push(result)?;
        Ok(Flow::Continue)
    }

    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let existing = self.open_upvalues[index];
            let existing_slot = self.heap.upvalue(existing).slot.expect("upvalue is open");
            if existing_slot == slot {
                return existing;
            }
            if existing_slot < slot {
                break;
            }
            index += 1;
        }

        self.maybe_collect();
        let created = self.heap.insert(ObjData::Upvalue(Upvalue {
            slot: Some(slot),
            closed: Value::Nil,
        }));
        self.open_upvalues.insert(index, created);
        created
    }

    /// Close every open upvalue whose slot is at or above `last`.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let slot = self.heap.upvalue(handle).slot.expect("upvalue is open");
            if slot < last {
                return;
            }
            let value = self.stack[slot];
            let upvalue = self.heap.upvalue_mut(handle);
            upvalue.slot = None;
            upvalue.closed = value;
            self.open_upvalues.remove(0);
        }
    }

    /// Undo a `CALL_BIND` shadow when its frame goes away.
    fn restore_dynvar(&mut self, handler: Value) {
        if let Some(handle) = handler.as_handle()
            && let ObjData::Dynvar(dynvar) = &self.heap.get(handle).data
        {
            let name = Value::Obj(dynvar.name);
            let previous = dynvar.previous;
            if previous == Value::Empty {
                self.globals.shift_remove(&name);
            } else {
                self.globals.insert(name, previous);
            }
        }
    }

    fn is_callable(&self, value: Value) -> bool {
        matches!(
            value.as_handle().map(|h| &self.heap.get(h).data),
            Some(
                ObjData::Closure(_) | ObjData::Bound(_) | ObjData::Class(_) | ObjData::Native(_)
            )
        )
    }

    /// Try to deliver a runtime fault to the nearest installed handler:
    /// unwind to the `handle` frame, restore dynvars along the way, and
    /// call the handler with the error message as its one argument. The
    /// handler's result becomes the value of the `handle` expression.
    fn recover(&mut self, fault: Fault) -> std::result::Result<(), Fault> {
        let Fault::Runtime(message) = fault else {
            return Err(fault);
        };

        let Some(index) = (0..self.frames.len())
            .rev()
            .find(|i| self.is_callable(self.frames[*i].handler))
        else {
            return Err(Fault::Runtime(message));
        };

        // Frames above the handler frame unwind; put their dynamic
        // variables back first.
        for i in (index + 1..self.frames.len()).rev() {
            let handler = self.frames[i].handler;
            self.restore_dynvar(handler);
        }

        let base = self.frames[index].base;
        self.close_upvalues(base);
        let handler = self.frames[index].handler;
        self.frames.truncate(index);
        self.stack.truncate(base);

        self.push(handler)?;
        let text = self.intern_gc(&message);
        self.push(Value::Obj(text))?;

        match self.call_value(handler, 1) {
            Ok(()) => Ok(()),
            // The handler itself failed; look for the next one out.
            Err(next) => self.recover(next),
        }
    }

    /// Turn an unhandled fault into the public error, capturing the
    /// stack trace before the VM state is reset.
    fn finish_fault(&mut self, fault: Fault) -> Error {
        let error = match fault {
            Fault::Interrupted => Error::Interrupted,
            Fault::Runtime(message) => Error::Runtime {
                message,
                trace: self.stack_trace(),
            },
            Fault::Overflow(message) => Error::Runtime {
                message: message.to_string(),
                trace: self.stack_trace(),
            },
        };

        // Put shadowed globals back before discarding the frames.
        for i in (0..self.frames.len()).rev() {
            let handler = self.frames[i].handler;
            self.restore_dynvar(handler);
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        error
    }

    fn stack_trace(&self) -> Vec<String> {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = function.chunk.get_line(frame.ip.saturating_sub(1));
            trace.push(format!(
                "[line {}] in {}",
                line,
                self.heap.function_name(function)
            ));
        }
        trace
    }

    fn undefined_variable(&self, name: Value) -> Fault {
        let text = match name.as_handle() {
            Some(handle) => self.heap.str_value(handle).to_string(),
            None => "?".to_string(),
        };
        Fault::Runtime(format!("Undefined variable '{text}'."))
    }

    fn undefined_property(&self, name: Value) -> Fault {
        let text = match name.as_handle() {
            Some(handle) => self.heap.str_value(handle).to_string(),
            None => "?".to_string(),
        };
        Fault::Runtime(format!("Undefined property '{text}'."))
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    fn build_list(&mut self, count: usize) -> std::result::Result<(), Fault> {
        self.maybe_collect();
        let start = self.stack.len() - count;
        let items = self.stack[start..].to_vec();
        let list = self.heap.insert(ObjData::List(items));
        self.drop_n_push(count, Value::Obj(list))
    }

    /// Normalize a user index against `len`: negative counts from the
    /// end. `None` when out of range.
    fn normalize_index(index: i64, len: usize) -> Option<usize> {
        let len = len as i64;
        let actual = if index < 0 { index + len } else { index };
        (0..len).contains(&actual).then_some(actual as usize)
    }

    /// Clamp a slice bound: negative offsets from the end, then clamped
    /// into `[0, len]`.
    fn clamp_slice_bound(bound: i64, len: usize) -> usize {
        let len = len as i64;
        let bound = if bound < 0 { bound + len } else { bound };
        bound.clamp(0, len) as usize
    }

    fn get_index(&mut self) -> std::result::Result<(), Fault> {
        let index = self.peek(0);
        let target = self.peek(1);

        enum Target {
            List(Handle),
            Str(Handle),
            Instance(Value),
            Bad,
        }
        let kind = match target.as_handle() {
            Some(handle) => match &self.heap.get(handle).data {
                ObjData::List(_) => Target::List(handle),
                ObjData::Str(_) => Target::Str(handle),
                ObjData::Instance(instance) => {
                    Target::Instance(instance.fields.get(&index).copied().unwrap_or(Value::Nil))
                }
                _ => Target::Bad,
            },
            None => Target::Bad,
        };

        match kind {
            Target::List(handle) => {
                let i = index
                    .as_int()
                    .ok_or_else(|| Fault::Runtime("List index is not a number.".to_string()))?;
                let items = self.heap.list(handle);
                let slot = Self::normalize_index(i, items.len())
                    .ok_or_else(|| Fault::Runtime("List index out of range.".to_string()))?;
                let value = items[slot];
                self.drop_n_push(2, value)
            }
            Target::Str(handle) => {
                let i = index
                    .as_int()
                    .ok_or_else(|| Fault::Runtime("String index is not a number.".to_string()))?;
                let chars = self.heap.str_value(handle);
                let slot = Self::normalize_index(i, chars.len())
                    .ok_or_else(|| Fault::Runtime("String index out of range.".to_string()))?;
                let one = String::from_utf8_lossy(&chars.as_bytes()[slot..slot + 1]).into_owned();
                let result = self.intern_gc(&one);
                self.drop_n_push(2, Value::Obj(result))
            }
            // Field tables accept any key; a miss reads as nil.
            Target::Instance(value) => self.drop_n_push(2, value),
            Target::Bad => Err(Fault::Runtime("Invalid type to index into.".to_string())),
        }
    }

    fn set_index(&mut self) -> std::result::Result<(), Fault> {
        let item = self.peek(0);
        let index = self.peek(1);
        let target = self.peek(2);

        match target.as_handle() {
            Some(handle) if self.is_list(target) => {
                let i = index
                    .as_int()
                    .ok_or_else(|| Fault::Runtime("List index is not a number.".to_string()))?;
                let len = self.heap.list(handle).len();
                let slot = Self::normalize_index(i, len)
                    .ok_or_else(|| Fault::Runtime("List index out of range.".to_string()))?;
                self.heap.list_mut(handle)[slot] = item;
                self.drop_n_push(3, item)
            }
            Some(handle) if matches!(self.heap.get(handle).data, ObjData::Instance(_)) => {
                self.heap.instance_mut(handle).fields.insert(index, item);
                self.drop_n_push(3, item)
            }
            _ => Err(Fault::Runtime("Invalid type to store into.".to_string())),
        }
    }

    fn get_slice(&mut self) -> std::result::Result<(), Fault> {
        let end = self
            .pop()
            .as_int()
            .ok_or_else(|| Fault::Runtime("Slice end is not a number.".to_string()))?;
        let begin = self
            .pop()
            .as_int()
            .ok_or_else(|| Fault::Runtime("Slice begin is not a number.".to_string()))?;
        let target = self.peek(0);

        match target.as_handle() {
            Some(handle) if self.is_list(target) => {
                self.maybe_collect();
                let items = self.heap.list(handle);
                let len = items.len();
                let begin = Self::clamp_slice_bound(begin, len);
                let end = Self::clamp_slice_bound(end, len).max(begin);
                let slice = items[begin..end].to_vec();
                let result = self.heap.insert(ObjData::List(slice));
                self.drop_n_push(1, Value::Obj(result))
            }
            Some(handle) if self.is_string(target) => {
                let text = {
                    let chars = self.heap.str_value(handle);
                    let len = chars.len();
                    let begin = Self::clamp_slice_bound(begin, len);
                    let end = Self::clamp_slice_bound(end, len).max(begin);
                    String::from_utf8_lossy(&chars.as_bytes()[begin..end]).into_owned()
                };
                let result = self.intern_gc(&text);
                self.drop_n_push(1, Value::Obj(result))
            }
            _ => Err(Fault::Runtime("Invalid type to slice into.".to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Iterators
    // -----------------------------------------------------------------------

    fn iter_entry(
        &self,
        value: Value,
    ) -> std::result::Result<(Handle, usize), Fault> {
        let Some(handle) = value.as_handle() else {
            return Err(Fault::Runtime("Value is not an iterator.".to_string()));
        };
        let ObjData::Iterator(cursor) = &self.heap.get(handle).data else {
            return Err(Fault::Runtime("Value is not an iterator.".to_string()));
        };
        let position = cursor.position;
        let instance = cursor.instance;
        let len = self.heap.instance(instance).fields.len();
        if position < 0 || position as usize >= len {
            return Err(Fault::Runtime("Iterator is not valid.".to_string()));
        }
        Ok((instance, position as usize))
    }

    fn iter_access(&mut self, want_value: bool) -> std::result::Result<(), Fault> {
        let (instance, position) = self.iter_entry(self.peek(0))?;
        let (key, value) = self
            .heap
            .instance(instance)
            .fields
            .get_index(position)
            .expect("cursor position checked");
        let result = if want_value { *value } else { *key };
        self.drop_n_push(1, result)
    }

    fn iter_store(&mut self) -> std::result::Result<(), Fault> {
        let value = self.peek(0);
        let (instance, position) = self.iter_entry(self.peek(1))?;
        let (_, slot) = self
            .heap
            .instance_mut(instance)
            .fields
            .get_index_mut(position)
            .expect("cursor position checked");
        *slot = value;
        self.drop_n_push(2, value)
    }

    // -----------------------------------------------------------------------
    // Helpers for natives
    // -----------------------------------------------------------------------

    pub(crate) fn stack_value(&self, index: usize) -> Value {
        self.stack[index]
    }

    pub(crate) fn make_iterator(&mut self, instance: Handle) -> Handle {
        self.maybe_collect();
        self.heap.insert(ObjData::Iterator(IterCursor {
            instance,
            position: -1,
        }))
    }

    pub(crate) fn type_of(&self, value: Value) -> &'static str {
        type_name(&self.heap, value)
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

enum Num {
    Int(i64),
    Real(f64),
}

impl Num {
    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Real(r) => *r,
        }
    }
}

enum Nums {
    Ints(i64, i64),
    Reals(f64, f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Vm, Result<()>) {
        let mut vm = Vm::new();
        let result = vm.interpret(source);
        (vm, result)
    }

    fn output_of(source: &str) -> String {
        let (mut vm, result) = run(source);
        result.expect("script should run");
        vm.take_output()
    }

    #[test]
    fn arithmetic_and_print() {
        assert_eq!(output_of("print 1 + 2 * 3;"), "7\n");
        assert_eq!(output_of("print 10 \\ 3;"), "1\n");
        assert_eq!(output_of("print -5;"), "-5\n");
        assert_eq!(output_of("print 1.5 + 1;"), "2.5\n");
    }

    #[test]
    fn integer_overflow_promotes_to_real() {
        let out = output_of("print 4611686018427387904 * 4;");
        assert!(out.contains('e') || out.contains('.'), "got {out}");
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let (_, result) = run("1 / 0;");
        match result {
            Err(Error::Runtime { message, .. }) => assert_eq!(message, "Division by zero."),
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn string_ordering_and_concat() {
        assert_eq!(output_of("print \"ab\" + \"cd\";"), "abcd\n");
        assert_eq!(output_of("print \"abc\" < \"abd\";"), "true\n");
    }

    #[test]
    fn undefined_global_reports_name() {
        let (_, result) = run("print missing;");
        match result {
            Err(Error::Runtime { message, .. }) => {
                assert_eq!(message, "Undefined variable 'missing'.");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn assignment_requires_existing_global() {
        let (_, result) = run("ghost = 1;");
        assert!(result.is_err());
    }

    #[test]
    fn stack_trace_lists_frames() {
        let (_, result) = run("fun f() { return 1 / 0; }\nfun g() { return f(); }\ng();");
        match result {
            Err(Error::Runtime { trace, .. }) => {
                assert_eq!(trace.len(), 3);
                assert!(trace[0].contains("in f"));
                assert!(trace[1].contains("in g"));
                assert!(trace[2].contains("in #script"));
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn call_arity_is_checked() {
        let (_, result) = run("fun two(a, b) { return a; } two(1);");
        match result {
            Err(Error::Runtime { message, .. }) => {
                assert_eq!(message, "Expected 2 arguments but got 1.");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn globals_survive_between_interpretations() {
        let mut vm = Vm::new();
        vm.interpret("var counter = 41;").expect("define");
        vm.interpret("print counter + 1;").expect("use");
        assert_eq!(vm.take_output(), "42\n");
    }

    #[test]
    fn repl_echo_prints_non_nil_results() {
        assert_eq!(output_of("1 + 1"), "2\n");
        assert_eq!(output_of("nil"), "");
        // Strings echo machine-quoted.
        assert_eq!(output_of("\"hi\""), "\"hi\"\n");
    }

    #[test]
    fn gc_stress_mode_runs_closures() {
        let mut vm = Vm::new();
        vm.heap.stress_gc = true;
        vm.interpret(
            "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; }\n\
             var f = make();\n\
             print f(); print f(); print f();",
        )
        .expect("script should run under GC stress");
        assert_eq!(vm.take_output(), "1\n2\n3\n");
    }
}

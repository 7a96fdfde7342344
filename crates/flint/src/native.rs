//! Native functions: the host-provided globals every session starts
//! with.
//!
//! Each native declares a signature in the one-letter-per-parameter
//! mini-language (`A` any, `N` number, `S` string, `L` list, `Q` string
//! or list, `B` bool, `I` instance; trailing lowercase = optional). The
//! VM checks arity and argument kinds against the signature before the
//! function runs, so the bodies here can lean on those guarantees and
//! only report errors the signature cannot express.

use std::io::BufRead;

use crate::object::ObjData;
use crate::value::{format_real, Handle, Value};
use crate::vm::Vm;

/// A native's result: the value pushed in place of the callee, or a
/// runtime error message.
pub type NativeResult = std::result::Result<Value, String>;

pub type NativeFn = fn(&mut Vm, usize, usize) -> NativeResult;

pub struct NativeDef {
    pub name: &'static str,
    pub signature: &'static str,
    pub function: NativeFn,
}

impl std::fmt::Debug for NativeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

/// Register every native in the globals table.
pub fn install(vm: &mut Vm) {
    for def in NATIVES {
        let name = vm.heap.intern_string(def.name);
        let native = vm.heap.insert(ObjData::Native(def));
        vm.globals.insert(Value::Obj(name), Value::Obj(native));
    }
}

pub static NATIVES: &[NativeDef] = &[
    NativeDef { name: "abs", signature: "N", function: abs },
    NativeDef { name: "sqrt", signature: "N", function: sqrt },
    NativeDef { name: "asc", signature: "Sn", function: asc },
    NativeDef { name: "chr", signature: "N", function: chr },
    NativeDef { name: "dec", signature: "N", function: dec },
    NativeDef { name: "hex", signature: "N", function: hex },
    NativeDef { name: "int", signature: "S", function: parse_int },
    NativeDef { name: "input", signature: "s", function: input },
    NativeDef { name: "bit_and", signature: "NN", function: bit_and },
    NativeDef { name: "bit_or", signature: "NN", function: bit_or },
    NativeDef { name: "bit_xor", signature: "NN", function: bit_xor },
    NativeDef { name: "bit_not", signature: "N", function: bit_not },
    NativeDef { name: "bit_shift", signature: "NN", function: bit_shift },
    NativeDef { name: "random", signature: "", function: random },
    NativeDef { name: "seed_rand", signature: "N", function: seed_rand },
    NativeDef { name: "length", signature: "Q", function: length },
    NativeDef { name: "append", signature: "LA", function: append },
    NativeDef { name: "insert", signature: "LNA", function: insert },
    NativeDef { name: "delete", signature: "LN", function: delete },
    NativeDef { name: "index", signature: "ALn", function: index_of },
    NativeDef { name: "slots", signature: "I", function: slots },
    NativeDef { name: "remove", signature: "IS", function: remove },
    NativeDef { name: "globals", signature: "", function: global_names },
    NativeDef { name: "type", signature: "A", function: type_of },
    NativeDef { name: "clock", signature: "", function: clock },
    NativeDef { name: "gc", signature: "", function: collect_garbage },
    NativeDef { name: "iterator", signature: "I", function: iterator },
    NativeDef { name: "valid", signature: "A", function: valid },
    NativeDef { name: "next", signature: "A", function: advance },
    NativeDef { name: "dbg_code", signature: "B", function: dbg_code },
    NativeDef { name: "dbg_trace", signature: "B", function: dbg_trace },
    NativeDef { name: "dbg_gc", signature: "B", function: dbg_gc },
    NativeDef { name: "dbg_stress", signature: "B", function: dbg_stress },
    NativeDef { name: "dbg_stat", signature: "B", function: dbg_stat },
];

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn arg(vm: &Vm, base: usize, index: usize) -> Value {
    vm.stack_value(base + index)
}

/// The signature letter `N` admits reals; the bitwise natives and index
/// arguments additionally require an integer.
fn int_arg(vm: &Vm, base: usize, index: usize) -> std::result::Result<i64, String> {
    arg(vm, base, index)
        .as_int()
        .ok_or_else(|| "Operand must be an integer.".to_string())
}

fn str_arg(vm: &Vm, base: usize, index: usize) -> Handle {
    arg(vm, base, index)
        .as_handle()
        .expect("signature guarantees a string")
}

fn list_arg(vm: &Vm, base: usize, index: usize) -> Handle {
    arg(vm, base, index)
        .as_handle()
        .expect("signature guarantees a list")
}

fn instance_arg(vm: &Vm, base: usize, index: usize) -> Handle {
    arg(vm, base, index)
        .as_handle()
        .expect("signature guarantees an instance")
}

fn iterator_arg(vm: &Vm, base: usize, index: usize) -> std::result::Result<Handle, String> {
    let value = arg(vm, base, index);
    match value.as_handle() {
        Some(handle) if matches!(vm.heap.get(handle).data, ObjData::Iterator(_)) => Ok(handle),
        _ => Err("Expected an iterator.".to_string()),
    }
}

fn normalize(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let actual = if index < 0 { index + len } else { index };
    (0..len).contains(&actual).then_some(actual as usize)
}

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

fn abs(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    match arg(vm, base, 0) {
        Value::Int(i) => match i.checked_abs() {
            Some(value) => Ok(Value::Int(value)),
            None => Ok(Value::Obj(vm.intern_real_gc(-(i as f64)))),
        },
        value => {
            let r = value
                .as_handle()
                .and_then(|h| vm.heap.real_value(h))
                .expect("signature guarantees a number");
            Ok(Value::Obj(vm.intern_real_gc(r.abs())))
        }
    }
}

fn sqrt(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let value = match arg(vm, base, 0) {
        Value::Int(i) => i as f64,
        value => value
            .as_handle()
            .and_then(|h| vm.heap.real_value(h))
            .expect("signature guarantees a number"),
    };
    Ok(Value::Obj(vm.intern_real_gc(value.sqrt())))
}

fn dec(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let text = match arg(vm, base, 0) {
        Value::Int(i) => i.to_string(),
        value => {
            let r = value
                .as_handle()
                .and_then(|h| vm.heap.real_value(h))
                .expect("signature guarantees a number");
            format_real(r)
        }
    };
    Ok(Value::Obj(vm.intern_gc(&text)))
}

fn hex(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let value = int_arg(vm, base, 0)?;
    let text = format!("{value:x}");
    Ok(Value::Obj(vm.intern_gc(&text)))
}

fn parse_int(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let text = vm.heap.str_value(str_arg(vm, base, 0)).trim().to_string();
    let parsed = if let Some(hex) = text.strip_prefix('$') {
        i64::from_str_radix(hex, 16)
    } else {
        text.parse::<i64>()
    };
    Ok(parsed.map_or(Value::Nil, Value::Int))
}

fn bit_and(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    Ok(Value::Int(int_arg(vm, base, 0)? & int_arg(vm, base, 1)?))
}

fn bit_or(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    Ok(Value::Int(int_arg(vm, base, 0)? | int_arg(vm, base, 1)?))
}

fn bit_xor(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    Ok(Value::Int(int_arg(vm, base, 0)? ^ int_arg(vm, base, 1)?))
}

fn bit_not(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    Ok(Value::Int(!int_arg(vm, base, 0)?))
}

fn bit_shift(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let value = int_arg(vm, base, 0)?;
    let amount = int_arg(vm, base, 1)?;
    let shifted = if amount >= 0 {
        value.checked_shl(amount as u32).unwrap_or(0)
    } else {
        value
            .checked_shr((-amount) as u32)
            .unwrap_or(if value < 0 { -1 } else { 0 })
    };
    Ok(Value::Int(shifted))
}

/// xorshift32; the low 30 bits keep results positive.
fn random(vm: &mut Vm, _base: usize, _argc: usize) -> NativeResult {
    let mut state = vm.rand_state;
    state ^= state << 13;
    state ^= state >> 17;
    state ^= state << 5;
    vm.rand_state = state;
    Ok(Value::Int((state & 0x3fff_ffff) as i64))
}

fn seed_rand(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let previous = vm.rand_state;
    vm.rand_state = int_arg(vm, base, 0)? as u32;
    Ok(Value::Int(previous as i64))
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn asc(vm: &mut Vm, base: usize, argc: usize) -> NativeResult {
    let handle = str_arg(vm, base, 0);
    let index = if argc > 1 { int_arg(vm, base, 1)? } else { 0 };
    let bytes = vm.heap.str_value(handle).as_bytes();
    let slot = normalize(index, bytes.len()).ok_or("String index out of range.")?;
    Ok(Value::Int(bytes[slot] as i64))
}

fn chr(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let code = int_arg(vm, base, 0)?;
    if !(0..=255).contains(&code) {
        return Err("Char code out of range.".to_string());
    }
    let text = String::from_utf8_lossy(&[code as u8]).into_owned();
    Ok(Value::Obj(vm.intern_gc(&text)))
}

fn input(vm: &mut Vm, base: usize, argc: usize) -> NativeResult {
    if argc > 0 {
        let prompt = vm.heap.str_value(str_arg(vm, base, 0)).to_string();
        vm.output.push_str(&prompt);
        vm.output.push(' ');
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| format!("Input failed: {e}."))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Value::Obj(vm.intern_gc(&line)))
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

fn length(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let handle = arg(vm, base, 0)
        .as_handle()
        .expect("signature guarantees a sequence");
    let len = match &vm.heap.get(handle).data {
        ObjData::Str(s) => s.chars.len(),
        ObjData::List(items) => items.len(),
        _ => unreachable!("signature guarantees a sequence"),
    };
    Ok(Value::Int(len as i64))
}

fn append(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let list = list_arg(vm, base, 0);
    let value = arg(vm, base, 1);
    vm.heap.list_mut(list).push(value);
    Ok(Value::Nil)
}

fn insert(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let list = list_arg(vm, base, 0);
    let index = int_arg(vm, base, 1)?;
    let value = arg(vm, base, 2);

    let len = vm.heap.list(list).len();
    // Insertion accepts one past the end to append.
    let slot = if index == len as i64 {
        len
    } else {
        normalize(index, len).ok_or("List index out of bound.")?
    };
    vm.heap.list_mut(list).insert(slot, value);
    Ok(Value::Nil)
}

fn delete(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let list = list_arg(vm, base, 0);
    let index = int_arg(vm, base, 1)?;
    let len = vm.heap.list(list).len();
    let slot = normalize(index, len).ok_or("List index out of bound.")?;
    vm.heap.list_mut(list).remove(slot);
    Ok(Value::Nil)
}

fn index_of(vm: &mut Vm, base: usize, argc: usize) -> NativeResult {
    let item = arg(vm, base, 0);
    let list = list_arg(vm, base, 1);
    let start = if argc > 2 { int_arg(vm, base, 2)? } else { 0 };

    let items = vm.heap.list(list);
    if items.is_empty() {
        return Ok(Value::Nil);
    }
    let start = normalize(start, items.len()).ok_or("Start index out of bound.")?;

    for (position, candidate) in items.iter().enumerate().skip(start) {
        if crate::value::values_equal(&vm.heap, item, *candidate) {
            return Ok(Value::Int(position as i64));
        }
    }
    Ok(Value::Nil)
}

// ---------------------------------------------------------------------------
// Instances and reflection
// ---------------------------------------------------------------------------

fn slots(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let instance = instance_arg(vm, base, 0);
    let keys: Vec<Value> = vm.heap.instance(instance).fields.keys().copied().collect();
    Ok(Value::Obj(vm.alloc_list(keys)))
}

fn remove(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let instance = instance_arg(vm, base, 0);
    let key = arg(vm, base, 1);
    // shift_remove keeps field order stable for live iterators.
    let removed = vm
        .heap
        .instance_mut(instance)
        .fields
        .shift_remove(&key)
        .is_some();
    Ok(Value::Bool(removed))
}

fn global_names(vm: &mut Vm, _base: usize, _argc: usize) -> NativeResult {
    let keys: Vec<Value> = vm.globals.keys().copied().collect();
    Ok(Value::Obj(vm.alloc_list(keys)))
}

fn type_of(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let name = vm.type_of(arg(vm, base, 0));
    Ok(Value::Obj(vm.intern_gc(name)))
}

fn clock(vm: &mut Vm, _base: usize, _argc: usize) -> NativeResult {
    Ok(Value::Int(vm.start.elapsed().as_millis() as i64))
}

fn collect_garbage(vm: &mut Vm, _base: usize, _argc: usize) -> NativeResult {
    vm.force_collect();
    Ok(Value::Int(vm.heap.bytes_allocated() as i64))
}

// ---------------------------------------------------------------------------
// Iterators
// ---------------------------------------------------------------------------

fn iterator(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let instance = instance_arg(vm, base, 0);
    Ok(Value::Obj(vm.make_iterator(instance)))
}

fn valid(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let handle = iterator_arg(vm, base, 0)?;
    let (instance, position) = match &vm.heap.get(handle).data {
        ObjData::Iterator(cursor) => (cursor.instance, cursor.position),
        _ => unreachable!("checked by iterator_arg"),
    };
    let len = vm.heap.instance(instance).fields.len() as i64;
    Ok(Value::Bool(position >= 0 && position < len))
}

/// Advance the cursor; true while it still addresses an entry.
fn advance(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let handle = iterator_arg(vm, base, 0)?;
    let instance = match &vm.heap.get(handle).data {
        ObjData::Iterator(cursor) => cursor.instance,
        _ => unreachable!("checked by iterator_arg"),
    };
    let len = vm.heap.instance(instance).fields.len() as i64;
    let cursor = vm.heap.iterator_mut(handle);
    if cursor.position < len {
        cursor.position += 1;
    }
    Ok(Value::Bool(cursor.position < len))
}

// ---------------------------------------------------------------------------
// Debug switches
// ---------------------------------------------------------------------------

fn dbg_code(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let flag = arg(vm, base, 0);
    vm.debug.print_code = flag.is_truthy();
    Ok(flag)
}

fn dbg_trace(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let flag = arg(vm, base, 0);
    vm.debug.trace_execution = flag.is_truthy();
    Ok(flag)
}

fn dbg_gc(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let flag = arg(vm, base, 0);
    vm.heap.log_gc = flag.is_truthy();
    Ok(flag)
}

fn dbg_stress(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let flag = arg(vm, base, 0);
    vm.heap.stress_gc = flag.is_truthy();
    Ok(flag)
}

fn dbg_stat(vm: &mut Vm, base: usize, _argc: usize) -> NativeResult {
    let flag = arg(vm, base, 0);
    vm.debug.statistics = flag.is_truthy();
    Ok(flag)
}

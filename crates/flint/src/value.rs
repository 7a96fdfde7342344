//! Runtime values and value printing.
//!
//! A [`Value`] is a small `Copy` tag: immediates (`nil`, booleans, the
//! `empty` table sentinel, integers) are stored inline, everything else
//! is a [`Handle`] into the heap arena. Because strings and reals are
//! interned, derived equality on `Value` is identity *and* structural
//! equality at once — the only wrinkle is NaN, which [`values_equal`]
//! handles by comparing reals numerically.

use std::fmt::Write;

use crate::heap::Heap;
use crate::object::ObjData;

/// Index of a heap arena slot. The only way to refer to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u32);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A dynamically typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Nil,
    Bool(bool),
    /// Sentinel distinct from every user-visible value; used to mark
    /// "no previous binding" for dynamic variables and never exposed to
    /// scripts.
    Empty,
    Int(i64),
    Obj(Handle),
}

impl Value {
    /// `false` and `nil` are falsy; everything else is truthy.
    pub fn is_truthy(self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_handle(self) -> Option<Handle> {
        match self {
            Value::Obj(h) => Some(h),
            _ => None,
        }
    }
}

/// Value equality: identity for objects, except reals which compare by
/// numeric value (so a NaN constant is unequal to itself, and `1.0`
/// equals `1.0` regardless of how either was produced).
pub fn values_equal(heap: &Heap, a: Value, b: Value) -> bool {
    if let (Value::Obj(ha), Value::Obj(hb)) = (a, b)
        && let (ObjData::Real(x), ObjData::Real(y)) = (&heap.get(ha).data, &heap.get(hb).data)
    {
        return x == y;
    }
    a == b
}

/// Flags for [`print_value`]: `machine` quotes strings, `compact`
/// elides instance fields and nested structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintFlags {
    pub machine: bool,
    pub compact: bool,
}

impl PrintFlags {
    pub const HUMAN: PrintFlags = PrintFlags {
        machine: false,
        compact: false,
    };
    pub const MACHINE: PrintFlags = PrintFlags {
        machine: true,
        compact: false,
    };

    fn nested(self) -> PrintFlags {
        PrintFlags {
            machine: self.machine,
            compact: true,
        }
    }
}

/// The type name reported by the `type()` native.
pub fn type_name(heap: &Heap, value: Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Bool(_) => "bool",
        Value::Empty => "empty",
        Value::Int(_) => "int",
        Value::Obj(handle) => heap.get(handle).data.type_name(),
    }
}

/// Render a value into a string.
pub fn print_value(heap: &Heap, value: Value, flags: PrintFlags) -> String {
    let mut out = String::new();
    write_value(&mut out, heap, value, flags);
    out
}

fn write_value(out: &mut String, heap: &Heap, value: Value, flags: PrintFlags) {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Empty => out.push_str("<empty>"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Obj(handle) => write_object(out, heap, handle, flags),
    }
}

fn write_object(out: &mut String, heap: &Heap, handle: Handle, flags: PrintFlags) {
    match &heap.get(handle).data {
        ObjData::Str(s) => {
            if flags.machine {
                let _ = write!(out, "\"{}\"", s.chars);
            } else {
                out.push_str(&s.chars);
            }
        }
        ObjData::Real(r) => {
            let _ = write!(out, "{}", format_real(*r));
        }
        ObjData::List(items) => {
            out.push('[');
            let mut sep = "";
            for item in items {
                out.push_str(sep);
                write_value(out, heap, *item, flags.nested());
                sep = ", ";
            }
            out.push(']');
        }
        ObjData::Function(f) => {
            let _ = write!(out, "<fun {}>", heap.function_name(f));
        }
        ObjData::Closure(c) => {
            let _ = write!(out, "<closure {}>", heap.function_name(heap.function(c.function)));
        }
        ObjData::Upvalue(_) => out.push_str("<upvalue>"),
        ObjData::Class(class) => {
            let _ = write!(out, "<class {}>", heap.str_value(class.name));
        }
        ObjData::Instance(instance) => {
            let class = heap.class(instance.class);
            let _ = write!(out, "{}(", heap.str_value(class.name));
            if flags.compact {
                out.push_str("..");
            } else {
                let mut sep = "";
                for (key, value) in &instance.fields {
                    out.push_str(sep);
                    write_value(out, heap, *key, flags.nested());
                    out.push(',');
                    write_value(out, heap, *value, flags.nested());
                    sep = ", ";
                }
            }
            out.push(')');
        }
        ObjData::Bound(bound) => {
            let method = heap.closure(bound.method);
            let _ = write!(out, "<bound {}>", heap.function_name(heap.function(method.function)));
        }
        ObjData::Iterator(it) => {
            let _ = write!(out, "<iterator {}>", it.position);
        }
        ObjData::Native(native) => {
            let _ = write!(out, "<native {}>", native.name);
        }
        ObjData::Dynvar(dynvar) => {
            let _ = write!(out, "<dynvar {}>", heap.str_value(dynvar.name));
        }
    }
}

/// Format a real so it always reads back as a real: integral values get
/// a trailing `.0`, and large magnitudes switch to scientific notation.
pub fn format_real(r: f64) -> String {
    if !r.is_finite() {
        return format!("{r}");
    }
    if r.abs() >= 1e15 {
        return format!("{r:e}");
    }
    if r.fract() == 0.0 {
        return format!("{r:.1}");
    }
    format!("{r}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        // Integer zero is truthy, unlike in some other languages.
        assert!(Value::Int(0).is_truthy());
    }

    #[test]
    fn real_formatting() {
        assert_eq!(format_real(1.0), "1.0");
        assert_eq!(format_real(2.5), "2.5");
        assert_eq!(format_real(f64::INFINITY), "inf");
    }
}

//! Heap object payloads: the closed set of object variants.
//!
//! Every heap object is one [`Obj`] record in the arena — a mark bit for
//! the collector plus an [`ObjData`] payload. There is no virtual
//! dispatch anywhere; the VM pattern-matches on the payload tag.

use indexmap::IndexMap;

use crate::chunk::Chunk;
use crate::native::NativeDef;
use crate::value::{Handle, Value};

/// Insertion-ordered table used for globals, instance fields, and class
/// methods. Keys are arbitrary values; strings and reals are interned so
/// derived key equality is correct. Insertion order is what makes
/// iterator cursors stable positions.
pub type Table = IndexMap<Value, Value>;

/// One arena slot: mark bit plus payload.
#[derive(Debug)]
pub struct Obj {
    pub marked: bool,
    pub data: ObjData,
}

#[derive(Debug)]
pub enum ObjData {
    Str(StrObj),
    Real(f64),
    List(Vec<Value>),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    Bound(BoundMethod),
    Iterator(IterCursor),
    Native(&'static NativeDef),
    Dynvar(Dynvar),
}

impl ObjData {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjData::Str(_) => "string",
            ObjData::Real(_) => "real",
            ObjData::List(_) => "list",
            ObjData::Function(_) => "fun",
            ObjData::Closure(_) => "closure",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::Bound(_) => "bound",
            ObjData::Iterator(_) => "iterator",
            ObjData::Native(_) => "native",
            ObjData::Dynvar(_) => "dynvar",
        }
    }

    /// Leaf objects carry no outgoing references; the collector marks
    /// them but never pushes them onto the grey stack.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            ObjData::Str(_) | ObjData::Real(_) | ObjData::Native(_)
        )
    }

    /// An estimate of the payload's owned storage, fed into the GC
    /// trigger accounting.
    pub fn byte_size(&self) -> usize {
        let owned = match self {
            ObjData::Str(s) => s.chars.len(),
            ObjData::List(items) => items.capacity() * std::mem::size_of::<Value>(),
            ObjData::Function(f) => f.chunk.byte_size(),
            ObjData::Closure(c) => c.upvalues.len() * std::mem::size_of::<Handle>(),
            ObjData::Class(c) => c.methods.len() * 2 * std::mem::size_of::<Value>(),
            ObjData::Instance(i) => i.fields.len() * 2 * std::mem::size_of::<Value>(),
            _ => 0,
        };
        std::mem::size_of::<Obj>() + owned
    }
}

/// An immutable interned string with its precomputed hash.
#[derive(Debug)]
pub struct StrObj {
    pub chars: Box<str>,
    pub hash: u32,
}

/// djb2 string hash, computed once at intern time.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for byte in bytes {
        hash = (hash.wrapping_shl(5).wrapping_add(hash)) ^ u32::from(*byte);
    }
    hash
}

/// A compiled function template. `name` is a string handle, an integer
/// for lambdas, or nil for the top-level script; `class` is set when the
/// function was defined as a method.
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub has_rest_param: bool,
    pub upvalue_count: u8,
    pub name: Value,
    pub class: Value,
    pub chunk: Chunk,
}

/// A function template paired with its captured upvalues.
#[derive(Debug)]
pub struct Closure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// A reified reference to a captured variable. Open upvalues point at a
/// live stack slot; closing moves the value into the upvalue itself.
#[derive(Debug)]
pub struct Upvalue {
    /// `Some(slot)` while open, `None` once closed.
    pub slot: Option<usize>,
    pub closed: Value,
}

#[derive(Debug)]
pub struct Class {
    pub name: Handle,
    pub superclass: Option<Handle>,
    /// Method name (interned string) → closure value.
    pub methods: Table,
}

#[derive(Debug)]
pub struct Instance {
    pub class: Handle,
    pub fields: Table,
}

/// A method pulled off an instance, remembering its receiver.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Handle,
}

/// A cursor over an instance's field table. Position −1 is "before the
/// first entry"; the `next` native advances it.
#[derive(Debug)]
pub struct IterCursor {
    pub instance: Handle,
    pub position: i64,
}

/// The saved previous binding of a dynamically scoped global, restored
/// when the binding frame returns or unwinds.
#[derive(Debug)]
pub struct Dynvar {
    pub name: Handle,
    /// The global's value before the binding; `Value::Empty` when the
    /// global did not exist.
    pub previous: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_discriminating() {
        assert_eq!(hash_bytes(b"init"), hash_bytes(b"init"));
        assert_ne!(hash_bytes(b"init"), hash_bytes(b"this"));
        assert_ne!(hash_bytes(b""), hash_bytes(b"\0"));
    }
}

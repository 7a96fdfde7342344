//! Bytecode disassembler, used by the `dbg_code` / `dbg_trace` debug
//! flags and by tests that inspect emitted code.

use std::fmt::Write;

use crate::chunk::{Chunk, Op};
use crate::heap::Heap;
use crate::object::Function;
use crate::value::{print_value, PrintFlags, Value};

/// Render a whole function's chunk, one instruction per line.
pub fn disassemble_function(heap: &Heap, function: &Function) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", heap.function_name(function));

    let mut offset = 0;
    while offset < function.chunk.code.len() {
        let (line, next) = disassemble_instruction(heap, &function.chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render the instruction at `offset`; returns the text and the offset
/// of the following instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = String::new();
    let _ = write!(out, "{offset:04} ");

    if offset > 0 && chunk.get_line(offset) == chunk.get_line(offset - 1) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.get_line(offset));
    }

    let op = match Op::from_byte(chunk.code[offset]) {
        Some(op) => op,
        None => {
            let _ = write!(out, "??? {:#04x}", chunk.code[offset]);
            return (out, offset + 1);
        }
    };

    let next = match op {
        // Constant-operand instructions.
        Op::Constant
        | Op::GetGlobal
        | Op::DefGlobal
        | Op::SetGlobal
        | Op::GetProperty
        | Op::SetProperty
        | Op::GetSuper
        | Op::Class
        | Op::Method
        | Op::CallBind => {
            let index = chunk.code[offset + 1];
            let constant = constant_text(heap, chunk, index);
            let _ = write!(out, "{:<16} {index:4} {constant}", name(op));
            offset + 2
        }

        // Byte-operand instructions.
        Op::Int
        | Op::GetLocal
        | Op::SetLocal
        | Op::GetUpvalue
        | Op::SetUpvalue
        | Op::Call
        | Op::VCall
        | Op::List
        | Op::VList => {
            let _ = write!(out, "{:<16} {:4}", name(op), chunk.code[offset + 1]);
            offset + 2
        }

        // Invocations: constant + argument count.
        Op::Invoke | Op::VInvoke | Op::SuperInvoke | Op::VSuperInvoke => {
            let index = chunk.code[offset + 1];
            let args = chunk.code[offset + 2];
            let constant = constant_text(heap, chunk, index);
            let _ = write!(out, "{:<16} ({args} args) {index:4} {constant}", name(op));
            offset + 3
        }

        // Jumps.
        Op::Jump | Op::JumpOr | Op::JumpAnd | Op::JumpTrue | Op::JumpFalse => {
            let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let target = offset + 3 + jump as usize;
            let _ = write!(out, "{:<16} {offset:4} -> {target}", name(op));
            offset + 3
        }
        Op::Loop => {
            let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let target = offset + 3 - jump as usize;
            let _ = write!(out, "{:<16} {offset:4} -> {target}", name(op));
            offset + 3
        }

        // Closure: constant + one byte per captured upvalue.
        Op::Closure => {
            let index = chunk.code[offset + 1];
            let constant = constant_text(heap, chunk, index);
            let _ = write!(out, "{:<16} {index:4} {constant}", name(op));

            let upvalue_count = match chunk.constants.get(index as usize) {
                Some(Value::Obj(handle)) => heap.function(*handle).upvalue_count as usize,
                _ => 0,
            };
            for i in 0..upvalue_count {
                let encoded = chunk.code[offset + 2 + i];
                let kind = if encoded & 0x80 != 0 { "local" } else { "upvalue" };
                let _ = write!(out, " [{kind} {}]", encoded & 0x7f);
            }
            offset + 2 + upvalue_count
        }

        // Everything else is a bare opcode.
        _ => {
            out.push_str(name(op));
            offset + 1
        }
    };

    (out, next)
}

fn constant_text(heap: &Heap, chunk: &Chunk, index: u8) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) => print_value(
            heap,
            *value,
            PrintFlags {
                machine: true,
                compact: true,
            },
        ),
        None => "<bad constant>".to_string(),
    }
}

fn name(op: Op) -> &'static str {
    match op {
        Op::Constant => "CONSTANT",
        Op::Nil => "NIL",
        Op::True => "TRUE",
        Op::False => "FALSE",
        Op::Zero => "ZERO",
        Op::Int => "INT",
        Op::Pop => "POP",
        Op::Swap => "SWAP",
        Op::Dup => "DUP",
        Op::GetLocal => "GET_LOCAL",
        Op::SetLocal => "SET_LOCAL",
        Op::GetGlobal => "GET_GLOBAL",
        Op::DefGlobal => "DEF_GLOBAL",
        Op::SetGlobal => "SET_GLOBAL",
        Op::GetUpvalue => "GET_UPVALUE",
        Op::SetUpvalue => "SET_UPVALUE",
        Op::GetProperty => "GET_PROPERTY",
        Op::SetProperty => "SET_PROPERTY",
        Op::GetSuper => "GET_SUPER",
        Op::Equal => "EQUAL",
        Op::Less => "LESS",
        Op::Add => "ADD",
        Op::Sub => "SUB",
        Op::Mul => "MUL",
        Op::Div => "DIV",
        Op::Mod => "MOD",
        Op::Neg => "NEG",
        Op::Not => "NOT",
        Op::Print => "PRINT",
        Op::Println => "PRINTLN",
        Op::Printq => "PRINTQ",
        Op::Jump => "JUMP",
        Op::JumpOr => "JUMP_OR",
        Op::JumpAnd => "JUMP_AND",
        Op::JumpTrue => "JUMP_TRUE",
        Op::JumpFalse => "JUMP_FALSE",
        Op::Loop => "LOOP",
        Op::Call => "CALL",
        Op::Call0 => "CALL0",
        Op::Call1 => "CALL1",
        Op::Call2 => "CALL2",
        Op::VCall => "VCALL",
        Op::Invoke => "INVOKE",
        Op::VInvoke => "VINVOKE",
        Op::SuperInvoke => "SUPER_INVOKE",
        Op::VSuperInvoke => "VSUPER_INVOKE",
        Op::Closure => "CLOSURE",
        Op::CloseUpvalue => "CLOSE_UPVALUE",
        Op::Return => "RETURN",
        Op::ReturnNil => "RETURN_NIL",
        Op::Class => "CLASS",
        Op::Inherit => "INHERIT",
        Op::Method => "METHOD",
        Op::List => "LIST",
        Op::VList => "VLIST",
        Op::GetIndex => "GET_INDEX",
        Op::SetIndex => "SET_INDEX",
        Op::GetSlice => "GET_SLICE",
        Op::Unpack => "UNPACK",
        Op::GetItVal => "GET_ITVAL",
        Op::SetItVal => "SET_ITVAL",
        Op::GetItKey => "GET_ITKEY",
        Op::CallHand => "CALL_HAND",
        Op::CallBind => "CALL_BIND",
    }
}

//! Flint - a small embeddable scripting language.
//!
//! Flint is a dynamically typed language with first-class closures,
//! single-inheritance classes with bound methods, lists with slices,
//! variadic calls with list unpacking, dynamically scoped variables
//! (`dynvar`), and error handlers (`handle`). It compiles to bytecode in
//! a single parser pass and runs on a stack-based virtual machine with a
//! precise mark-and-sweep garbage collector.
//!
//! # Quick Start
//!
//! ```
//! use flint::Session;
//!
//! let mut session = Session::new();
//! session
//!     .interpret("var n = 0; for (var i = 1; i <= 10; i = i + 1) n = n + i; print n;")
//!     .unwrap();
//! assert_eq!(session.take_output(), "55\n");
//! ```
//!
//! # Language Tour
//!
//! ```text
//! fun make_counter() {
//!     var count = 0;
//!     fun tick() { count = count + 1; return count; }
//!     return tick;
//! }
//!
//! class Point {
//!     init(x, y) { this.x = x; this.y = y; }
//!     length() -> sqrt(this.x * this.x + this.y * this.y)
//! }
//!
//! fun sum(..values) {
//!     var total = 0;
//!     for (var i = 0; i < length(values); i = i + 1)
//!         total = total + values[i];
//!     return total;
//! }
//! sum(1, 2, 3);       // 6
//! sum(..[4, 5, 6]);   // 15, list unpacked into arguments
//! ```
//!
//! Top-level expressions not terminated by `;` print their value, which
//! is what makes the REPL echo results.
//!
//! # Errors
//!
//! Compile errors are collected per input and returned as one
//! [`Error::Compile`]; runtime errors carry a stack trace. Both leave
//! the session usable, so a REPL just reports and keeps going.

mod chunk;
mod compiler;
mod debug;
mod error;
mod heap;
mod native;
mod object;
mod scanner;
mod value;
mod vm;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use error::{Error, Result};
pub use vm::DebugFlags;

use vm::Vm;

/// An embedding session: one virtual machine with its heap, globals,
/// and captured output. Globals persist across [`Session::interpret`]
/// calls, so a REPL is a loop around one session.
pub struct Session {
    vm: Vm,
}

impl Session {
    pub fn new() -> Session {
        Session { vm: Vm::new() }
    }

    /// Compile and run one source buffer (a file or a REPL line).
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        self.vm.interpret(source)
    }

    /// Drain everything `print` wrote since the last call.
    pub fn take_output(&mut self) -> String {
        self.vm.take_output()
    }

    /// The flag a SIGINT handler sets to abort execution at the next
    /// dispatch tick.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.vm.interrupt_flag()
    }

    /// Debug switches (also reachable from scripts via the `dbg_*`
    /// natives).
    pub fn debug_flags(&mut self) -> &mut DebugFlags {
        &mut self.vm.debug
    }
}

impl Default for Session {
    fn default() -> Session {
        Session::new()
    }
}

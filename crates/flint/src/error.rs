//! Error types shared by the compiler, the VM, and embedders.

use thiserror::Error;

/// Any failure an [`crate::Session`] can report.
///
/// Compile errors are aggregated: the compiler keeps parsing after the
/// first error (in panic mode) so a single `Compile` value may describe
/// several diagnostics, one per line.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more compile-time diagnostics, already formatted as
    /// `[line N] Error at '<lexeme>': <message>` lines.
    #[error("{0}")]
    Compile(String),

    /// A runtime error with a stack trace, innermost frame first.
    /// Each trace line is formatted as `[line N] in <function>`.
    #[error("{message}")]
    Runtime { message: String, trace: Vec<String> },

    /// Execution was aborted by the interrupt flag (SIGINT in the CLI).
    #[error("Interrupted.")]
    Interrupted,
}

impl Error {
    /// Render the error the way the CLI prints it: the message followed
    /// by the stack trace, if any.
    pub fn report(&self) -> String {
        match self {
            Error::Runtime { message, trace } => {
                let mut out = message.clone();
                for line in trace {
                    out.push('\n');
                    out.push_str(line);
                }
                out
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// File: src/errors.rs
//
// Error types for the Lox pipeline.
// Compile errors carry the line and offending lexeme; runtime errors carry
// the message plus a call trace captured before the VM resets its stack.

use std::fmt;

/// A single parse-time diagnostic in `[line N] Error at 'x': message` form.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub line: usize,
    /// " at 'lexeme'", " at end", or "" when the token itself was malformed.
    pub location: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.line, self.location, self.message)
    }
}

/// A runtime failure with one trace line per active call frame, innermost
/// first, in `[line N] in <fn>` form.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for line in &self.trace {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// The result of an `interpret` call that did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum LoxError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl LoxError {
    /// Conventional interpreter exit codes: 65 for bad input, 70 for an
    /// internal software error.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoxError::Compile(_) => 65,
            LoxError::Runtime(_) => 70,
        }
    }
}

impl fmt::Display for LoxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoxError::Compile(errors) => {
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", error)?;
                }
                Ok(())
            }
            LoxError::Runtime(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for LoxError {}

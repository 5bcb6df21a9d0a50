//! Compile-time diagnostics.

use std::fmt;

/// A single compile error, formatted the way `original_source`'s
/// `errorAt` prints to stderr: `[line N] Error @ 'lexeme': message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    pub at: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.at.is_empty() {
            write!(f, "[line {}] Error: {}", self.line, self.message)
        } else {
            write!(f, "[line {}] Error @ '{}': {}", self.line, self.at, self.message)
        }
    }
}

impl std::error::Error for CompileError {}

/// The result of a compile attempt: either a finished top-level function
/// plus its interned-constant dependencies, or every diagnostic collected
/// during panic-mode recovery (parsing keeps going after the first error so
/// a single `compile()` call can report more than one mistake).
#[derive(Debug)]
pub struct CompileErrors(pub Vec<CompileError>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

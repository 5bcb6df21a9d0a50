//! feline-compiler — lexer, single-pass Pratt parser and code generator.
//!
//! Turns Feline source text into a [`feline_core::object::Function`] whose
//! `chunk` is ready for `feline-vm` to run. There is no separate AST stage:
//! `Compiler` emits bytecode as it parses, exactly as
//! `original_source/src/compiler.c` does.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod compiler;
mod error;
mod lexer;
mod token;

pub use compiler::Compiler;
pub use error::{CompileError, CompileErrors};

use feline_core::object::Function;
use std::path::Path;

/// Compile a source string into a top-level script `Function`.
pub fn compile_str(source: &str) -> Result<Function, CompileErrors> {
    Compiler::compile(source)
}

/// Read and compile a source file.
pub fn compile_file(path: &Path) -> Result<Function, CompileFileError> {
    let source = std::fs::read_to_string(path).map_err(CompileFileError::Io)?;
    compile_str(&source).map_err(CompileFileError::Compile)
}

#[derive(Debug, thiserror::Error)]
pub enum CompileFileError {
    #[error("reading source file failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("{0}")]
    Compile(#[source] CompileErrors),
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn compiles_a_trivial_script() {
        let func = compile_str("print 1 + 2;").expect("should compile");
        assert_eq!(func.arity, 0);
        assert!(!func.chunk.is_empty());
    }

    #[test]
    fn reports_syntax_errors_with_line_numbers() {
        let err = compile_str("var x = ;").unwrap_err();
        assert_eq!(err.0.len(), 1);
        assert_eq!(err.0[0].line, 1);
    }

    #[test]
    fn compiles_classes_and_closures() {
        let source = indoc! {r#"
            class Counter {
                new(start) {
                    this.count = start;
                }

                increment() {
                    function bump() {
                        this.count = this.count + 1;
                        return this.count;
                    }
                    return bump();
                }
            }

            var c = Counter(0);
            print c.increment();
        "#};
        compile_str(source).expect("should compile");
    }

    #[test]
    fn compiles_try_catch_finally() {
        let source = indoc! {r#"
            try {
                throw "boom";
            } catch (e) {
                print e;
            } finally {
                print "done";
            }
        "#};
        compile_str(source).expect("should compile");
    }

    #[test]
    fn rejects_break_outside_loop() {
        let err = compile_str("break;").unwrap_err();
        assert!(err.0[0].message.contains("outside of a loop"));
    }
}

//! Runtime error types.
//!
//! Mirrors the `InternalExceptionType` enum in
//! `original_source/src/builtin/exception.h` — each variant here is the
//! Rust-side reason a `RuntimeError` is raised before it gets turned into a
//! catchable Feline exception object by `Vm::raise`.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum VmError {
    #[error("{0}")]
    TypeError(String),
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("{0}")]
    ArityError(String),
    #[error("undefined property '{0}'")]
    PropertyError(String),
    #[error("index out of range: {0}")]
    IndexRangeError(String),
    #[error("stack overflow")]
    StackOverflow,
    #[error("failed to link native library: {0}")]
    LinkFailure(String),
    /// A value couldn't be converted to the representation an operation
    /// needs (currently: a native call's numeric argument/return ABI).
    /// Distinct from [`VmError::TypeError`], which is a language-level
    /// operand-type violation (`1 + "a"`); this is a representation
    /// failure at a value/FFI boundary.
    #[error("{0}")]
    ValueError(String),
    /// An uncaught `throw`: carries the thrown value's display rendering
    /// (the value itself can't be carried here without a `&mut Heap`).
    #[error("uncaught exception: {0}")]
    Uncaught(String),
}

/// The result of running a top-level script or module, per spec.md §6's
/// exit-code table.
#[derive(Debug)]
pub enum VmOutcome {
    Ok,
    CompileError(String),
    RuntimeError(String),
}

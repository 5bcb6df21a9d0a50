//! feline-core — value/object model, tracing GC, intern table and bytecode
//! `Chunk` for the Feline language.
//!
//! This crate has no knowledge of parsing or dispatch; it only defines the
//! shapes the compiler emits and the VM interprets:
//!
//! - [`value`]  — the tagged [`value::Value`] union.
//! - [`object`] — heap object payloads (`Obj`) referenced by `Value::Object`.
//! - [`heap`]   — the arena + tracing mark-sweep collector.
//! - [`intern`] — the weak, content-deduplicated string table.
//! - [`chunk`]  — bytecode buffer, constant pool, opcodes, line table.
//! - [`module`] — per-file globals/exports table.
//! - [`error`]  — shared error types.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod chunk;
pub mod error;
pub mod heap;
pub mod intern;
pub mod module;
pub mod object;
pub mod value;

pub use chunk::{Chunk, ConstValue, LineTable, Op};
pub use error::CoreError;
pub use heap::{Heap, ObjRef};
pub use intern::InternTable;
pub use module::{Module, ModuleTable};
pub use object::{
    BoundMethod, Class, Closure, Function, Instance, ModuleId, NativeFn, NativeObj, Obj, StrObj,
    Upvalue,
};
pub use value::Value;

//! feline-vm — the stack-based bytecode interpreter and tracing GC driver.
//!
//! Deliberately **not** `#![forbid(unsafe_code)]`: [`ffi`] loads dynamic
//! libraries on the host's behalf, which cannot be expressed without
//! `unsafe` (see that module's doc comment for the exact boundary). Every
//! other module in this crate stays unsafe-free by convention, just not by
//! compiler enforcement.
#![deny(rust_2018_idioms, unused_must_use)]

mod error;
mod ffi;
mod frame;
mod natives;
mod vm;

pub use error::{VmError, VmOutcome};
pub use vm::{Vm, VmOptions};

use std::path::Path;

/// Compile and run a script file end to end, the way the CLI's default
/// subcommand does. Returns a [`VmOutcome`] rather than a `Result` since
/// every branch (compile error, runtime error, success) maps to one of
/// SPEC_FULL.md §6's exit codes, not just the happy path.
pub fn run_file(path: &Path, options: VmOptions) -> VmOutcome {
    let function = match feline_compiler::compile_file(path) {
        Ok(f) => f,
        Err(e) => return VmOutcome::CompileError(e.to_string()),
    };
    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let module_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".into());
    let mut vm = Vm::new(base_dir, options);
    match vm.run(function, &module_name) {
        Ok(()) => VmOutcome::Ok,
        Err(message) => VmOutcome::RuntimeError(message),
    }
}

/// Compile and run a source string as an anonymous top-level module. Used by
/// integration tests; the CLI always goes through [`run_file`] so relative
/// imports have a real directory to resolve against.
pub fn run_source(source: &str, base_dir: &Path, options: VmOptions) -> VmOutcome {
    let function = match feline_compiler::compile_str(source) {
        Ok(f) => f,
        Err(e) => return VmOutcome::CompileError(e.to_string()),
    };
    let mut vm = Vm::new(base_dir.to_path_buf(), options);
    match vm.run(function, "script") {
        Ok(()) => VmOutcome::Ok,
        Err(message) => VmOutcome::RuntimeError(message),
    }
}

//! Dynamic-library FFI loader.
//!
//! Grounded in `original_source/src/object.h`'s `ObjNativeLibrary` plus the
//! `dlopen`/`dlsym` calls in `vm.c`'s native-library import path. Every
//! exported symbol this loader resolves must be named `feline_<name>` and
//! have the C signature `Value feline_<name>(Vm*, int argc, Value* argv)`
//! in the original; here the equivalent contract is expressed as
//! [`RawNativeFn`]. This is the one module in the whole workspace allowed
//! to use `unsafe` — loading and calling into a dylib cannot be expressed
//! safely, which is why `feline-vm` (unlike `feline-core`/`feline-compiler`)
//! does not carry `#![forbid(unsafe_code)]`.

use crate::error::VmError;
use feline_core::object::NativeLibraryObj;
use feline_core::value::Value;
use libloading::Library;
use std::path::Path;

/// C ABI signature every `feline_<name>` export must match. Host data is
/// passed as raw pointers because a dylib built against a different Rust
/// version cannot share `feline_core` types by value.
pub type RawNativeFn = unsafe extern "C" fn(argc: i32, argv: *const f64, out: *mut f64) -> i32;

pub fn load_library(path: &Path) -> Result<NativeLibraryObj, VmError> {
    // SAFETY: dlopen executes the target's static initializers, which is
    // inherently unsound to guarantee safe in general — the caller accepts
    // this by invoking an explicit FFI import in source.
    let lib = unsafe { Library::new(path) }
        .map_err(|e| VmError::LinkFailure(format!("{}: {e}", path.display())))?;
    Ok(NativeLibraryObj { handle: Some(lib), path: path.to_string_lossy().into() })
}

/// Resolve `feline_<name>` in an already-loaded library.
pub fn resolve(lib: &NativeLibraryObj, name: &str) -> Result<RawNativeFn, VmError> {
    let handle = lib
        .handle
        .as_ref()
        .ok_or_else(|| VmError::LinkFailure(format!("{} is closed", lib.path)))?;
    let symbol = format!("feline_{name}");
    // SAFETY: the symbol's actual signature is whatever the dylib author
    // wrote; a mismatch here is a contract violation on their part, the
    // same trust boundary `dlsym` always has.
    unsafe {
        handle
            .get::<RawNativeFn>(symbol.as_bytes())
            .map(|sym| *sym)
            .map_err(|e| VmError::LinkFailure(format!("symbol '{symbol}' not found: {e}")))
    }
}

/// Invoke a resolved `feline_<name>` export. Only the call contract is in
/// scope here (spec.md's FFI Non-goal); arguments and the return value are
/// restricted to numbers, which is all [`RawNativeFn`]'s ABI carries.
pub fn call(f: RawNativeFn, args: &[Value]) -> Result<Value, VmError> {
    let argv: Vec<f64> = args
        .iter()
        .map(|v| match v {
            Value::Number(n) => Ok(*n),
            _ => Err(VmError::ValueError("native functions only accept numeric arguments".into())),
        })
        .collect::<Result<_, _>>()?;
    let mut out: f64 = 0.0;
    // SAFETY: `f` was resolved from a `feline_<name>` export; its actual
    // behavior is the dylib author's contract, the same trust boundary
    // `dlsym` itself has.
    let rc = unsafe { f(argv.len() as i32, argv.as_ptr(), &mut out as *mut f64) };
    if rc == 0 {
        Ok(Value::Number(out))
    } else {
        Err(VmError::LinkFailure(format!("native call returned error code {rc}")))
    }
}

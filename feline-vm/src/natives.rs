//! Built-in native functions and list methods.
//!
//! Grounded in `original_source/src/builtin/natives.c` (`clockNative`,
//! `lenNative`) and `builtin/listnatives.c` (list methods). The original's
//! `sort` has a known off-by-one in its insertion sort for lists of one
//! element; this port uses a textbook bottom-up iterative merge sort
//! instead rather than reproduce the bug.

use crate::error::VmError;
use crate::vm::Vm;
use feline_core::object::Obj;
use feline_core::value::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub type NativeImpl = Box<dyn Fn(&mut Vm, &[Value]) -> Result<Value, VmError>>;

/// A flat table of native function implementations, indexed by the
/// `NativeFn` id stored on `Obj::Native`. Registration order is fixed at
/// startup for the built-ins (see `Vm::new`); FFI-resolved natives (`native
/// name(params);`) append to the same table as they're resolved. Ids are
/// stable for the lifetime of one VM instance — they are never persisted to
/// disk. Boxed (rather than a bare `fn`) so an FFI-resolved native can close
/// over the `RawNativeFn` pointer it was resolved to.
#[derive(Default)]
pub struct NativeRegistry {
    impls: Vec<NativeImpl>,
}

impl NativeRegistry {
    pub fn register(&mut self, f: impl Fn(&mut Vm, &[Value]) -> Result<Value, VmError> + 'static) -> u32 {
        self.impls.push(Box::new(f));
        (self.impls.len() - 1) as u32
    }

    pub fn call(&self, id: u32, vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
        self.impls[id as usize](vm, args)
    }
}

pub fn clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, VmError> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(secs))
}

pub fn len(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let arg = args.first().copied().unwrap_or_default();
    match arg {
        Value::Object(r) => match vm.heap().get(r) {
            Obj::Str(s) => Ok(Value::Number(s.as_str().chars().count() as f64)),
            Obj::List(items) => Ok(Value::Number(items.len() as f64)),
            _ => Err(VmError::TypeError("len() expects a string or list".into())),
        },
        _ => Err(VmError::TypeError("len() expects a string or list".into())),
    }
}

/// Bottom-up iterative merge sort, stable, O(n log n). `less` is the
/// user-supplied comparator for `sortBy`; plain `sort` uses
/// [`default_less`].
pub fn merge_sort(items: &mut Vec<Value>, mut less: impl FnMut(&Value, &Value) -> bool) {
    let n = items.len();
    if n < 2 {
        return;
    }
    let mut buf = items.clone();
    let mut width = 1;
    while width < n {
        let mut i = 0;
        while i < n {
            let mid = (i + width).min(n);
            let end = (i + 2 * width).min(n);
            merge(&items[i..mid], &items[mid..end], &mut buf[i..end], &mut less);
            i += 2 * width;
        }
        std::mem::swap(items, &mut buf);
        width *= 2;
    }
}

fn merge(left: &[Value], right: &[Value], out: &mut [Value], less: &mut impl FnMut(&Value, &Value) -> bool) {
    let (mut i, mut j, mut k) = (0, 0, 0);
    while i < left.len() && j < right.len() {
        if less(&right[j], &left[i]) {
            out[k] = right[j];
            j += 1;
        } else {
            out[k] = left[i];
            i += 1;
        }
        k += 1;
    }
    out[k..k + (left.len() - i)].copy_from_slice(&left[i..]);
    k += left.len() - i;
    out[k..k + (right.len() - j)].copy_from_slice(&right[j..]);
}

pub fn default_less(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a < b,
        _ => false,
    }
}

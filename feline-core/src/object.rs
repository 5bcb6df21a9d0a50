//! Heap object payloads.
//!
//! One variant per row of spec.md §3 "Heap object kinds", grounded in
//! `original_source/src/object.h`'s `ObjType` enum. Each payload is stored
//! inline inside a [`crate::heap::Heap`] slot; there are no extra
//! indirections (`Box`/`Rc`) beyond what `Vec`/`HashMap` already need, since
//! the arena itself is the indirection layer.

use crate::chunk::Chunk;
use crate::heap::ObjRef;
use crate::value::Value;
use ahash::AHashMap;

/// A unique id handed out by the VM's native-function registry. `feline-core`
/// never calls a native function itself — it only stores the id so the VM
/// can dispatch through its own table, keeping this crate free of a
/// dependency on `feline-vm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFn(pub u32);

/// An opaque handle to host-attached instance data (e.g. a native FFI
/// resource bound to an `Instance`). `feline-core` never interprets it.
pub type InstanceDataHandle = u64;

#[derive(Debug, Clone)]
pub struct StrObj {
    pub bytes: Box<str>,
    pub hash: u64,
}

impl StrObj {
    pub fn new(s: impl Into<Box<str>>) -> Self {
        let bytes = s.into();
        let hash = fnv1a64(bytes.as_bytes());
        Self { bytes, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.bytes
    }
}

/// FNV-1a 64-bit, matching `original_source`'s string hash (`ObjString.hash`
/// is 32-bit there; we widen to 64 bits for fewer intern-table collisions,
/// the way `vitte-core`'s `Fnv1a64` helper already does for chunk hashing).
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET_BASIS;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

#[derive(Debug, Clone)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: u8,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(arity: u8, name: Option<ObjRef>) -> Self {
        Self { arity, upvalue_count: 0, name, chunk: Chunk::new() }
    }
}

/// A per-module identifier. Modules are not heap objects (see
/// `crate::module`); closures only remember which one they came from so the
/// VM can resolve globals against the right table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

#[derive(Debug, Clone)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
    pub module: ModuleId,
}

/// An upvalue is either still pointing into the live operand stack (`Open`)
/// or has had its value copied out because the stack slot no longer exists
/// (`Closed`). `Open` variants are threaded through
/// [`crate::heap::Heap::open_upvalues`]-adjacent bookkeeping that the VM
/// maintains (the VM owns the stack, so it owns the open-upvalue list too).
#[derive(Debug, Clone)]
pub enum Upvalue {
    Open { stack_index: usize },
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct NativeObj {
    pub function: NativeFn,
    pub arity: u8,
    /// Set when this native was produced by binding a receiver (mirrors
    /// `ObjNative.bound` in the original, used for native methods).
    pub bound: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: ObjRef,
    /// method name (interned string) -> Closure/Native value
    pub methods: AHashMap<ObjRef, Value>,
    pub superclass: Option<ObjRef>,
}

impl Class {
    pub fn new(name: ObjRef, superclass: Option<ObjRef>) -> Self {
        Self { name, methods: AHashMap::new(), superclass }
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: AHashMap<ObjRef, Value>,
    pub native_data: Option<InstanceDataHandle>,
}

impl Instance {
    pub fn new(class: ObjRef) -> Self {
        Self { class, fields: AHashMap::new(), native_data: None }
    }
}

#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug, Clone)]
pub struct NativeLibraryObj {
    /// Loaded by `feline-vm`'s FFI loader (opening a dylib requires
    /// `unsafe`, which this crate keeps forbidden). `None` only while a
    /// library is mid-construction; a real `Obj::NativeLibrary` always
    /// carries a handle.
    pub handle: Option<libloading::Library>,
    pub path: Box<str>,
}

impl Drop for NativeLibraryObj {
    fn drop(&mut self) {
        // `libloading::Library`'s own Drop calls dlclose/FreeLibrary; taking
        // it here just makes the "closed during sweep" invariant explicit.
        self.handle.take();
    }
}

/// The tagged payload of a heap object. See spec.md §3.
#[derive(Debug)]
pub enum Obj {
    Str(StrObj),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Native(NativeObj),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    List(Vec<Value>),
    NativeLibrary(NativeLibraryObj),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Native(_) => "native",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
            Obj::List(_) => "list",
            Obj::NativeLibrary(_) => "native library",
        }
    }

    /// A rough per-object byte cost, used to drive the GC threshold the way
    /// `original_source`'s `vm->bytesAllocated` does, since Rust gives us no
    /// `realloc` delta hook to piggy-back on (see SPEC_FULL.md §9).
    pub fn approx_size(&self) -> usize {
        use std::mem::size_of;
        match self {
            Obj::Str(s) => size_of::<StrObj>() + s.bytes.len(),
            Obj::Function(_) => size_of::<Function>(),
            Obj::Closure(c) => size_of::<Closure>() + c.upvalues.len() * size_of::<ObjRef>(),
            Obj::Upvalue(_) => size_of::<Upvalue>(),
            Obj::Native(_) => size_of::<NativeObj>(),
            Obj::Class(c) => size_of::<Class>() + c.methods.len() * 48,
            Obj::Instance(i) => size_of::<Instance>() + i.fields.len() * 48,
            Obj::BoundMethod(_) => size_of::<BoundMethod>(),
            Obj::List(items) => size_of::<Value>() * items.capacity(),
            Obj::NativeLibrary(_) => size_of::<NativeLibraryObj>(),
        }
    }
}

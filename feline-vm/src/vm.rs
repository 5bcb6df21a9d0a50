//! The stack-based bytecode interpreter.
//!
//! The dispatch loop, calling convention, and upvalue bookkeeping are
//! grounded in `original_source/src/vm.c`'s `executeVM`/`callValue`/
//! `captureUpvalue`/`closeUpvalues`/`invoke`, translated from the original's
//! raw pointer-chasing (`ObjUpvalue* next`, `CallFrame* frame`) into the
//! handle-based scheme `feline_core::heap` provides. Per-module globals plus
//! a VM-wide "prelude" fallback table (natives, `Exception` and friends) are
//! new relative to the original, which instead re-seeds every module's own
//! globals table with built-ins at `initModule` time (see `module.c`) — the
//! prelude achieves the same visibility without copying built-ins into every
//! module.

use crate::error::VmError;
use crate::ffi;
use crate::frame::{CallFrame, TryRecord};
use crate::natives::{self, NativeRegistry};
use ahash::AHashMap;
use feline_core::heap::{Heap, ObjRef};
use feline_core::module::{Module, ModuleTable};
use feline_core::object::{
    BoundMethod, Class, Closure, Function, Instance, ModuleId, NativeFn, NativeObj, Obj, Upvalue,
};
use feline_core::value::Value;
use feline_core::{ConstValue, Op};
use std::io::Write;
use std::path::{Path, PathBuf};

const MAX_FRAMES: usize = 1024;

/// Runtime knobs, set from the CLI's `--trace`/`--stress-gc` flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    pub trace: bool,
    pub stress_gc: bool,
}

/// The interpreter: heap, operand stack, call frames, loaded modules, and
/// the native/prelude tables every module sees without importing them.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Frame-count floor for each nested `execute()` invocation (the
    /// top-level script, plus one per module eagerly run by `Op::Import`).
    /// An uncaught throw unwinds only down to the innermost floor, then
    /// surfaces as `VmError::Uncaught` to that invocation's caller.
    exec_floors: Vec<usize>,
    open_upvalues: Vec<ObjRef>,
    modules: ModuleTable,
    natives: NativeRegistry,
    /// Built-ins visible from every module without an explicit import:
    /// `clock`, `len`, `Object`, and the `Exception` class hierarchy. Mirrors
    /// `original_source/src/module.c`'s `initModule`, which copies the same
    /// set into each module's own globals; here they live once and are
    /// consulted as a fallback so modules stay isolated for everything else.
    prelude: AHashMap<ObjRef, Value>,
    object_class: ObjRef,
    exception_class: ObjRef,
    /// The eight named subclasses of `Exception` the VM raises internally
    /// (spec.md §7), keyed by the name the script sees in the prelude.
    exception_classes: AHashMap<&'static str, ObjRef>,
    base_dir: PathBuf,
    options: VmOptions,
    /// Dynamic libraries opened for FFI, keyed by resolved path and cached
    /// for the VM's lifetime (spec.md §4.4: "Libraries are cached in the
    /// VM"). Each value is an `Obj::NativeLibrary` heap object so the GC
    /// closes the handle on sweep once unreachable.
    native_libraries: AHashMap<PathBuf, ObjRef>,
    /// Sink for `print` statements. Defaults to stdout; integration tests
    /// substitute an in-memory buffer via [`Vm::with_output`] to assert on
    /// program output (mirrors the teacher's `Host::print`/`DefaultHost`
    /// split, collapsed to just the one sink Feline's `print` needs).
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new(base_dir: PathBuf, options: VmOptions) -> Self {
        let mut heap = Heap::new();
        heap.stress_mode = options.stress_gc;
        let mut natives = NativeRegistry::default();
        let clock_id = natives.register(natives::clock);
        let len_id = natives.register(natives::len);

        let object_name = heap.intern("Object");
        let object_class = heap.alloc(Obj::Class(Class::new(object_name, None)));

        let exception_name = heap.intern("Exception");
        let exception_class = heap.alloc(Obj::Class(Class::new(exception_name, None)));

        const SUBCLASS_NAMES: [&str; 8] = [
            "TypeException",
            "ArityException",
            "PropertyException",
            "IndexRangeException",
            "UndefinedVariableException",
            "StackOverflowException",
            "LinkFailureException",
            "ValueException",
        ];
        let mut exception_classes = AHashMap::new();
        for name in SUBCLASS_NAMES {
            let interned = heap.intern(name);
            let class = heap.alloc(Obj::Class(Class::new(interned, Some(exception_class))));
            exception_classes.insert(name, class);
        }

        let mut vm = Self {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            exec_floors: Vec::new(),
            open_upvalues: Vec::new(),
            modules: ModuleTable::new(),
            natives,
            prelude: AHashMap::new(),
            object_class,
            exception_class,
            exception_classes,
            base_dir,
            options,
            native_libraries: AHashMap::new(),
            output: Box::new(std::io::stdout()),
        };

        vm.install_native("clock", clock_id, 0);
        vm.install_native("len", len_id, 1);
        vm.install_prelude_value("Object", Value::Object(object_class));
        vm.install_prelude_value("Exception", Value::Object(exception_class));
        for (name, class) in vm.exception_classes.clone() {
            vm.install_prelude_value(name, Value::Object(class));
        }
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Redirect `print` output away from stdout. Used by tests asserting on
    /// program output.
    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    fn install_native(&mut self, name: &str, id: u32, arity: u8) {
        let obj = self.heap.alloc(Obj::Native(NativeObj {
            function: NativeFn(id),
            arity,
            bound: None,
        }));
        self.install_prelude_value(name, Value::Object(obj));
    }

    fn install_prelude_value(&mut self, name: &str, value: Value) {
        let key = self.heap.intern(name);
        self.prelude.insert(key, value);
    }

    /// Run a pre-compiled top-level function as the entry module, returning
    /// an `Err` message describing the uncaught exception (if any). Grounded
    /// in `original_source`'s `interpret`: wrap the top-level `Function` in
    /// a `Closure`, push a call frame for it, then run the dispatch loop.
    pub fn run(&mut self, function: Function, module_name: &str) -> Result<(), String> {
        let module = Module::new(module_name, self.base_dir.clone());
        let module_id = self.modules.insert(self.base_dir.join(module_name), module);

        let function_ref = self.heap.alloc(Obj::Function(function));
        let closure_ref = self.heap.alloc(Obj::Closure(Closure {
            function: function_ref,
            upvalues: Vec::new(),
            module: module_id,
        }));
        self.stack.push(Value::Object(closure_ref));
        self.frames.push(CallFrame::new(closure_ref, 0, module_id));

        self.execute().map_err(|e| e.to_string())
    }

    // ---- bytecode access helpers -------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn closure_function(&self, closure: ObjRef) -> ObjRef {
        match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("CallFrame::closure must always be a Closure"),
        }
    }

    fn current_code_byte(&self, ip: usize) -> u8 {
        let function = self.closure_function(self.frame().closure);
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.code()[ip],
            _ => unreachable!(),
        }
    }

    fn current_code_u16(&self, ip: usize) -> u16 {
        let function = self.closure_function(self.frame().closure);
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.read_u16(ip),
            _ => unreachable!(),
        }
    }

    fn current_constant(&self, ix: u16) -> ConstValue {
        let function = self.closure_function(self.frame().closure);
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.constants()[ix as usize].clone(),
            _ => unreachable!(),
        }
    }

    fn current_line(&self, ip: usize) -> u32 {
        let function = self.closure_function(self.frame().closure);
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.line_for(ip.saturating_sub(1)),
            _ => unreachable!(),
        }
    }

    fn read_u8(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.current_code_byte(ip);
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.frame().ip;
        let value = self.current_code_u16(ip);
        self.frame_mut().ip += 2;
        value
    }

    fn read_const(&mut self) -> ConstValue {
        let ix = self.read_u16();
        self.current_constant(ix)
    }

    /// Materialize a constant-pool entry into a runtime `Value`. Strings are
    /// interned lazily here — a `Chunk`'s pool has no heap in scope when it
    /// is built, so `ConstValue::Str` only becomes a `Value::Object` the
    /// first time a running VM actually touches it.
    fn const_to_value(&mut self, c: &ConstValue) -> Value {
        match c {
            ConstValue::Null => Value::Null,
            ConstValue::Bool(b) => Value::Bool(*b),
            ConstValue::Number(n) => Value::Number(*n),
            ConstValue::Str(s) => Value::Object(self.heap.intern(s)),
            ConstValue::Function(_) => {
                unreachable!("function constants are only read by Op::Closure")
            }
        }
    }

    // ---- stack helpers ------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- upvalues -------------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        for &r in &self.open_upvalues {
            if let Obj::Upvalue(Upvalue::Open { stack_index: si }) = self.heap.get(r) {
                if *si == stack_index {
                    return r;
                }
            }
        }
        let r = self.heap.alloc(Obj::Upvalue(Upvalue::Open { stack_index }));
        self.open_upvalues.push(r);
        r
    }

    fn close_upvalues_from(&mut self, from_index: usize) {
        let mut remaining = Vec::new();
        for r in self.open_upvalues.drain(..) {
            let close = matches!(
                self.heap.get(r),
                Obj::Upvalue(Upvalue::Open { stack_index }) if *stack_index >= from_index
            );
            if close {
                let value = match self.heap.get(r) {
                    Obj::Upvalue(Upvalue::Open { stack_index }) => self.stack[*stack_index],
                    _ => unreachable!(),
                };
                *self.heap.get_mut(r) = Obj::Upvalue(Upvalue::Closed(value));
            } else {
                remaining.push(r);
            }
        }
        self.open_upvalues = remaining;
    }

    fn read_upvalue_value(&self, r: ObjRef) -> Value {
        match self.heap.get(r) {
            Obj::Upvalue(Upvalue::Open { stack_index }) => self.stack[*stack_index],
            Obj::Upvalue(Upvalue::Closed(v)) => *v,
            _ => unreachable!(),
        }
    }

    fn write_upvalue_value(&mut self, r: ObjRef, value: Value) {
        let stack_index = match self.heap.get(r) {
            Obj::Upvalue(Upvalue::Open { stack_index }) => Some(*stack_index),
            Obj::Upvalue(Upvalue::Closed(_)) => None,
            _ => unreachable!(),
        };
        match stack_index {
            Some(i) => self.stack[i] = value,
            None => *self.heap.get_mut(r) = Obj::Upvalue(Upvalue::Closed(value)),
        }
    }

    // ---- globals --------------------------------------------------------

    fn module_id(&self) -> ModuleId {
        self.frame().module
    }

    fn access_global(&mut self, name: ObjRef) -> Result<Value, VmError> {
        let module = self.modules.get(self.module_id());
        if let Some(v) = module.globals.get(&name) {
            return Ok(*v);
        }
        if let Some(v) = self.prelude.get(&name) {
            return Ok(*v);
        }
        Err(VmError::UndefinedVariable(self.name_of(name)))
    }

    fn assign_global(&mut self, name: ObjRef, value: Value) -> Result<(), VmError> {
        let module_id = self.module_id();
        if self.modules.get(module_id).globals.contains_key(&name) {
            self.modules.get_mut(module_id).globals.insert(name, value);
            return Ok(());
        }
        if self.prelude.contains_key(&name) {
            return Err(VmError::TypeError(format!(
                "cannot reassign built-in '{}'",
                self.name_of(name)
            )));
        }
        Err(VmError::UndefinedVariable(self.name_of(name)))
    }

    fn define_global(&mut self, name: ObjRef, value: Value) {
        let module_id = self.module_id();
        self.modules.get_mut(module_id).globals.insert(name, value);
    }

    fn name_of(&self, r: ObjRef) -> String {
        self.heap.as_str(r).map(str::to_owned).unwrap_or_else(|| "?".into())
    }

    // ---- calling convention ----------------------------------------------

    /// Mirrors `original_source`'s `callValue`: dispatch on the callee's
    /// runtime type, set up a new frame (or, for natives, call straight
    /// through and adjust the stack in place).
    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), VmError> {
        let Value::Object(callee_ref) = callee else {
            return Err(VmError::TypeError("can only call functions".into()));
        };
        match self.heap.get(callee_ref) {
            Obj::Closure(_) => self.call_closure(callee_ref, argc),
            Obj::Native(n) => {
                let id = n.function.0;
                let base = self.stack.len() - argc as usize;
                let bound = n.bound;
                let mut args: Vec<Value> = self.stack.split_off(base);
                self.pop(); // the callee itself
                if let Some(receiver) = bound {
                    args.insert(0, receiver);
                }
                // `NativeRegistry` is swapped out for the call so `self` can
                // be passed to the native implementation without aliasing
                // `self.natives`.
                let natives = std::mem::take(&mut self.natives);
                let result = natives.call(id, self, &args);
                self.natives = natives;
                self.push(result?);
                Ok(())
            }
            Obj::Class(_) => {
                let instance = self.heap.alloc(Obj::Instance(Instance::new(callee_ref)));
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = Value::Object(instance);
                let ctor_name = self.heap.intern("new");
                let initializer = match self.heap.get(callee_ref) {
                    Obj::Class(c) => c.methods.get(&ctor_name).copied(),
                    _ => unreachable!(),
                };
                match initializer {
                    Some(Value::Object(m)) => self.call_as_method(m, argc),
                    Some(_) | None if argc == 0 => Ok(()),
                    _ => Err(VmError::ArityError(format!(
                        "expected 0 arguments but got {argc}"
                    ))),
                }
            }
            Obj::BoundMethod(b) => {
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = b.receiver;
                let method = b.method;
                self.call_as_method(method, argc)
            }
            _ => Err(VmError::TypeError("can only call functions".into())),
        }
    }

    /// Call a class/instance method value, which may be a compiled
    /// [`Obj::Closure`] or an FFI-backed [`Obj::Native`] installed via
    /// `native methodName(params);` (spec.md's `CLASS_NATIVE` + `METHOD`).
    fn call_as_method(&mut self, method: ObjRef, argc: u8) -> Result<(), VmError> {
        match self.heap.get(method) {
            Obj::Closure(_) => self.call_closure(method, argc),
            Obj::Native(_) => self.call_value(Value::Object(method), argc),
            _ => Err(VmError::TypeError("method must be callable".into())),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), VmError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::StackOverflow);
        }
        let function = self.closure_function(closure);
        let (arity, module) = match self.heap.get(function) {
            Obj::Function(f) => (f.arity, match self.heap.get(closure) {
                Obj::Closure(c) => c.module,
                _ => unreachable!(),
            }),
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(VmError::ArityError(format!(
                "expected {arity} arguments but got {argc}"
            )));
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame::new(closure, base, module));
        Ok(())
    }

    // ---- property / method lookup -----------------------------------

    fn class_of(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Object(r) => match self.heap.get(r) {
                Obj::Instance(i) => Some(i.class),
                _ => None,
            },
            _ => None,
        }
    }

    fn find_method(&self, class: ObjRef, name: ObjRef) -> Option<Value> {
        let mut current = Some(class);
        while let Some(c) = current {
            match self.heap.get(c) {
                Obj::Class(cls) => {
                    if let Some(v) = cls.methods.get(&name) {
                        return Some(*v);
                    }
                    current = cls.superclass;
                }
                _ => return None,
            }
        }
        None
    }

    fn bind_method(&mut self, receiver: Value, class: ObjRef, name: ObjRef) -> Result<Value, VmError> {
        match self.find_method(class, name) {
            Some(Value::Object(method)) => {
                let bound = self.heap.alloc(Obj::BoundMethod(BoundMethod { receiver, method }));
                Ok(Value::Object(bound))
            }
            _ => Err(VmError::PropertyError(self.name_of(name))),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), VmError> {
        let receiver = self.peek(argc as usize);
        let Value::Object(receiver_ref) = receiver else {
            return Err(VmError::TypeError("only instances have methods".into()));
        };
        let (class, field) = match self.heap.get(receiver_ref) {
            Obj::Instance(i) => (i.class, i.fields.get(&name).copied()),
            _ => return Err(VmError::TypeError("only instances have methods".into())),
        };
        if let Some(value) = field {
            let base = self.stack.len() - argc as usize - 1;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        match self.find_method(class, name) {
            Some(Value::Object(m)) => self.call_as_method(m, argc),
            _ => Err(VmError::PropertyError(self.name_of(name))),
        }
    }

    // ---- GC ---------------------------------------------------------

    fn mark_roots(&mut self) {
        for &v in &self.stack {
            self.heap.mark_value(&v);
        }
        for frame in &self.frames {
            self.heap.mark(frame.closure);
        }
        for &r in &self.open_upvalues {
            self.heap.mark(r);
        }
        for module in self.modules.iter() {
            for (&k, &v) in module.globals.iter() {
                self.heap.mark(k);
                self.heap.mark_value(&v);
            }
            for (&k, &v) in module.exports.iter() {
                self.heap.mark(k);
                self.heap.mark_value(&v);
            }
        }
        for (&k, &v) in self.prelude.iter() {
            self.heap.mark(k);
            self.heap.mark_value(&v);
        }
        self.heap.mark(self.object_class);
        self.heap.mark(self.exception_class);
        // A `NativeLibrary` is reachable only from this cache (it's never
        // pushed on the operand stack), so without this it would be swept
        // and its handle closed out from under the next cache hit.
        for &r in self.native_libraries.values() {
            self.heap.mark(r);
        }
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.mark_roots();
            self.heap.trace();
            self.heap.finish_cycle();
        }
    }

    // ---- module import ------------------------------------------------

    fn import_module(&mut self, path_str: &str) -> Result<ModuleId, VmError> {
        let current_dir = self.modules.get(self.module_id()).directory.clone();
        let candidate = current_dir.join(path_str);
        let canonical = candidate
            .canonicalize()
            .unwrap_or(candidate);

        if let Some(id) = self.modules.find_by_path(&canonical) {
            return Ok(id);
        }

        let source = std::fs::read_to_string(&canonical)
            .map_err(|e| VmError::LinkFailure(format!("{}: {e}", canonical.display())))?;
        let compiled = feline_compiler::compile_str(&source)
            .map_err(|e| VmError::TypeError(format!("compile error importing module: {e}")))?;

        let directory = canonical.parent().unwrap_or(Path::new(".")).to_path_buf();
        let name = canonical
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path_str.to_string());
        let module = Module::new(name, directory);
        let module_id = self.modules.insert(canonical, module);

        let function_ref = self.heap.alloc(Obj::Function(compiled));
        let closure_ref = self.heap.alloc(Obj::Closure(Closure {
            function: function_ref,
            upvalues: Vec::new(),
            module: module_id,
        }));
        self.push(Value::Object(closure_ref));
        self.call_closure(closure_ref, 0)?;
        self.execute()?;

        Ok(module_id)
    }

    // ---- the dispatch loop ------------------------------------------

    /// Run until the outermost call frame returns. Mirrors
    /// `original_source`'s `executeVM`, including its exception-unwind loop
    /// at the top (here: `self.raise`), but with an explicit catch/finally
    /// search per frame rather than an unconditional unwind to the script
    /// boundary.
    fn execute(&mut self) -> Result<(), VmError> {
        let base_frame_count = self.frames.len() - 1;
        self.exec_floors.push(base_frame_count);
        let outcome = self.run_loop(base_frame_count);
        self.exec_floors.pop();
        outcome
    }

    fn run_loop(&mut self, base_frame_count: usize) -> Result<(), VmError> {
        loop {
            if self.options.trace {
                self.trace_instruction();
            }
            let op_byte = self.read_u8();
            let op = Op::from_byte(op_byte)
                .ok_or_else(|| VmError::TypeError(format!("invalid opcode byte {op_byte}")))?;

            let result = self.dispatch(op);
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return) => {
                    if self.frames.len() == base_frame_count + 1 {
                        return Ok(());
                    }
                }
                Err(e) => self.raise_error(e)?,
            }
            if self.frames.len() <= base_frame_count {
                return Ok(());
            }
        }
    }

    fn trace_instruction(&self) {
        let ip = self.frame().ip;
        let line = self.current_line(ip + 1);
        let op_byte = self.current_code_byte(ip);
        tracing::trace!(target: "feline_vm::trace", ip, line, op = ?Op::from_byte(op_byte), "executing");
    }

    /// Picks the named subclass a given [`VmError`] maps to (spec.md §7);
    /// falls back to the base `Exception` class for variants with no named
    /// subclass of their own (`Uncaught` never reaches here — it's already a
    /// Feline-level exception value).
    fn exception_class_for(&self, e: &VmError) -> ObjRef {
        let name = match e {
            VmError::TypeError(_) => "TypeException",
            VmError::ArityError(_) => "ArityException",
            VmError::PropertyError(_) => "PropertyException",
            VmError::IndexRangeError(_) => "IndexRangeException",
            VmError::UndefinedVariable(_) => "UndefinedVariableException",
            VmError::StackOverflow => "StackOverflowException",
            VmError::LinkFailure(_) => "LinkFailureException",
            VmError::ValueError(_) => "ValueException",
            VmError::Uncaught(_) => return self.exception_class,
        };
        self.exception_classes[name]
    }

    /// Convert a `VmError` into a thrown Feline exception value and unwind
    /// looking for a handler, exactly like `OP_THROW` would have. Returns
    /// `Err(VmError::Uncaught(..))` if no frame down to the current
    /// `execute()` floor catches it.
    fn raise_error(&mut self, e: VmError) -> Result<(), VmError> {
        let class = self.exception_class_for(&e);
        let reason = self.heap.intern(&e.to_string());
        let exception = self.heap.alloc(Obj::Instance(Instance::new(class)));
        if let Obj::Instance(inst) = self.heap.get_mut(exception) {
            let key = self.heap.intern("reason");
            inst.fields.insert(key, Value::Object(reason));
        }
        self.unwind(Value::Object(exception))
    }

    /// One line of a stack trace, `[<dir>/<module>.fn:<line>] in <fn>`, for
    /// the frame currently on top of the call stack (spec.md §7's uncaught-
    /// exception print format).
    fn frame_trace_entry(&self) -> String {
        let frame = self.frame();
        let module = self.modules.get(frame.module);
        let function = self.closure_function(frame.closure);
        let fn_name = match self.heap.get(function) {
            Obj::Function(f) => f
                .name
                .and_then(|n| self.heap.as_str(n))
                .map(str::to_string)
                .unwrap_or_else(|| "script".to_string()),
            _ => unreachable!(),
        };
        let line = self.current_line(frame.ip + 1);
        format!(
            "[{}/{}.fn:{line}] in {fn_name}",
            module.directory.display(),
            module.name
        )
    }

    /// Appends the trace entry for the frame about to be popped to the
    /// exception instance's `stackTrace` field (creating it on first use).
    fn record_trace(&mut self, exception: Value, entry: String) {
        let Value::Object(r) = exception else { return };
        if !matches!(self.heap.get(r), Obj::Instance(_)) {
            return;
        }
        let key = self.heap.intern("stackTrace");
        let entry_obj = self.heap.intern(&entry);

        let existing_list = match self.heap.get(r) {
            Obj::Instance(inst) => inst.fields.get(&key).copied(),
            _ => None,
        };
        match existing_list {
            Some(Value::Object(list_ref)) => {
                if let Obj::List(items) = self.heap.get_mut(list_ref) {
                    items.push(Value::Object(entry_obj));
                }
            }
            _ => {
                let list = self.heap.alloc(Obj::List(vec![Value::Object(entry_obj)]));
                if let Obj::Instance(inst) = self.heap.get_mut(r) {
                    inst.fields.insert(key, Value::Object(list));
                }
            }
        }
    }

    fn unwind(&mut self, exception: Value) -> Result<(), VmError> {
        let base_frame_count = *self.exec_floors.last().expect("unwind outside execute()");
        loop {
            if self.frames.len() <= base_frame_count {
                return Err(VmError::Uncaught(self.render(exception)));
            }
            let entry = self.frame_trace_entry();
            let frame = self.frame_mut();
            if let Some(record) = frame.try_stack.pop() {
                self.record_trace(exception, entry);
                self.stack.truncate(record.stack_depth);
                self.push(exception);
                self.frame_mut().ip = record.catch_ip;
                return Ok(());
            }
            self.record_trace(exception, entry);
            // No handler in this frame: close its upvalues, pop it, and
            // keep unwinding into the caller, the same as
            // `original_source`'s exception loop walking `vm->frames`.
            let base = self.frame().base;
            self.close_upvalues_from(base);
            self.stack.truncate(base);
            self.frames.pop();
        }
    }

    /// `"<ClassName>: <reason>"` plus one stack-trace line per frame the
    /// exception unwound through, for an uncaught exception's final message
    /// (spec.md §7). Non-instance thrown values (a plain number, string...)
    /// just get displayed, matching `throw` accepting any value.
    fn render(&self, v: Value) -> String {
        let Value::Object(r) = v else { return self.display(v) };
        let Obj::Instance(inst) = self.heap.get(r) else { return self.display(v) };

        let class_name = match self.heap.get(inst.class) {
            Obj::Class(c) => self.heap.as_str(c.name).unwrap_or("Exception").to_string(),
            _ => "Exception".to_string(),
        };
        let reason = inst
            .fields
            .iter()
            .find(|(k, _)| self.heap.as_str(**k) == Some("reason"))
            .map(|(_, v)| self.display(*v))
            .unwrap_or_default();
        let mut out = format!("{class_name}: {reason}");

        if let Some(Value::Object(list_ref)) =
            inst.fields.iter().find(|(k, _)| self.heap.as_str(**k) == Some("stackTrace")).map(|(_, v)| *v)
        {
            if let Obj::List(items) = self.heap.get(list_ref) {
                for item in items {
                    out.push('\n');
                    out.push_str(&self.display(*item));
                }
            }
        }
        out
    }

    fn display(&self, v: Value) -> String {
        match v {
            Value::Object(r) => match self.heap.get(r) {
                Obj::Str(s) => s.as_str().to_string(),
                Obj::List(items) => {
                    let parts: Vec<String> = items.iter().map(|it| self.display(*it)).collect();
                    format!("[{}]", parts.join(", "))
                }
                Obj::Instance(i) => {
                    let class_name = match self.heap.get(i.class) {
                        Obj::Class(c) => self.heap.as_str(c.name).unwrap_or("?"),
                        _ => "?",
                    };
                    format!("<{class_name} instance>")
                }
                Obj::Function(f) => {
                    format!("<fn {}>", f.name.and_then(|n| self.heap.as_str(n)).unwrap_or("anonymous"))
                }
                Obj::Closure(_) => "<closure>".into(),
                Obj::Class(c) => format!("<class {}>", self.heap.as_str(c.name).unwrap_or("?")),
                Obj::Native(_) => "<native fn>".into(),
                Obj::BoundMethod(_) => "<bound method>".into(),
                Obj::NativeLibrary(l) => format!("<native library {}>", l.path),
                Obj::Upvalue(_) => "<upvalue>".into(),
            },
            other => other.to_string(),
        }
    }

    fn dispatch(&mut self, op: Op) -> Result<Flow, VmError> {
        match op {
            Op::UseConstant => {
                let c = self.read_const();
                let v = self.const_to_value(&c);
                self.push(v);
            }
            Op::Null => self.push(Value::Null),
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),
            Op::Pop => {
                self.pop();
            }
            Op::DefineGlobal => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let value = self.peek(0);
                self.define_global(name, value);
                self.pop();
            }
            Op::AccessGlobal => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let v = self.access_global(name)?;
                self.push(v);
            }
            Op::AssignGlobal => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let value = self.peek(0);
                self.assign_global(name, value)?;
            }
            Op::AccessLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frame().base;
                self.push(self.stack[base + slot]);
            }
            Op::AssignLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frame().base;
                self.stack[base + slot] = self.peek(0);
            }
            Op::AccessUpvalue => {
                let ix = self.read_u16() as usize;
                let closure = self.frame().closure;
                let r = match self.heap.get(closure) {
                    Obj::Closure(c) => c.upvalues[ix],
                    _ => unreachable!(),
                };
                self.push(self.read_upvalue_value(r));
            }
            Op::AssignUpvalue => {
                let ix = self.read_u16() as usize;
                let closure = self.frame().closure;
                let r = match self.heap.get(closure) {
                    Obj::Closure(c) => c.upvalues[ix],
                    _ => unreachable!(),
                };
                let value = self.peek(0);
                self.write_upvalue_value(r, value);
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues_from(top);
                self.pop();
            }
            Op::Jump => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip += offset;
            }
            Op::JumpFalse => {
                let offset = self.read_u16() as usize;
                let cond = self.pop();
                if !cond.is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::JumpFalseShortCircuit => {
                let offset = self.read_u16() as usize;
                if !self.peek(0).is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::JumpTrueShortCircuit => {
                let offset = self.read_u16() as usize;
                if self.peek(0).is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::Loop => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip -= offset;
            }
            Op::Add => self.binary_add()?,
            Op::Subtract => self.binary_numeric(|a, b| a - b)?,
            Op::Multiply => self.binary_numeric(|a, b| a * b)?,
            Op::Divide => self.binary_numeric(|a, b| a / b)?,
            Op::Negate => {
                let v = self.pop();
                match v {
                    Value::Number(n) => self.push(Value::Number(-n)),
                    _ => return Err(VmError::TypeError("operand must be a number".into())),
                }
            }
            Op::Not => {
                let v = self.pop();
                self.push(Value::Bool(!v.is_truthy()));
            }
            Op::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b));
            }
            Op::NotEqual => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a != b));
            }
            Op::Greater => self.compare(|a, b| a > b)?,
            Op::GreaterEqual => self.compare(|a, b| a >= b)?,
            Op::Less => self.compare(|a, b| a < b)?,
            Op::LessEqual => self.compare(|a, b| a <= b)?,
            Op::Closure => self.op_closure()?,
            Op::Call => {
                let argc = self.read_u8();
                let callee = self.peek(argc as usize);
                self.call_value(callee, argc)?;
            }
            Op::Return => {
                let result = self.pop();
                let base = self.frame().base;
                self.close_upvalues_from(base);
                self.stack.truncate(base);
                self.frames.pop();
                self.push(result);
                return Ok(Flow::Return);
            }
            Op::Native => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let arity = self.read_u8();
                let native = self.resolve_native(name, arity)?;
                self.push(native);
            }
            Op::Class => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let class = self.heap.alloc(Obj::Class(Class::new(name, None)));
                self.push(Value::Object(class));
            }
            Op::Inherit => {
                let subclass = match self.peek(0) {
                    Value::Object(r) => r,
                    _ => return Err(VmError::TypeError("can only inherit from a class".into())),
                };
                let superclass = match self.peek(1) {
                    Value::Object(r) => r,
                    _ => return Err(VmError::TypeError("superclass must be a class".into())),
                };
                let methods = match self.heap.get(superclass) {
                    Obj::Class(c) => c.methods.clone(),
                    _ => return Err(VmError::TypeError("superclass must be a class".into())),
                };
                match self.heap.get_mut(subclass) {
                    Obj::Class(c) => {
                        c.superclass = Some(superclass);
                        for (k, v) in methods {
                            c.methods.entry(k).or_insert(v);
                        }
                    }
                    _ => unreachable!(),
                }
                self.pop();
            }
            Op::Method => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let method = self.pop();
                let class = match self.peek(0) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                match self.heap.get_mut(class) {
                    Obj::Class(c) => {
                        c.methods.insert(name, method);
                    }
                    _ => unreachable!(),
                }
            }
            Op::AccessProperty => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let receiver = self.pop();
                let Value::Object(receiver_ref) = receiver else {
                    return Err(VmError::TypeError("only instances have properties".into()));
                };
                let (field, class) = match self.heap.get(receiver_ref) {
                    Obj::Instance(i) => (i.fields.get(&name).copied(), i.class),
                    _ => return Err(VmError::TypeError("only instances have properties".into())),
                };
                match field {
                    Some(v) => self.push(v),
                    None => {
                        let bound = self.bind_method(receiver, class, name)?;
                        self.push(bound);
                    }
                }
            }
            Op::AssignProperty => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let value = self.pop();
                let receiver = self.pop();
                let Value::Object(receiver_ref) = receiver else {
                    return Err(VmError::TypeError("only instances have properties".into()));
                };
                match self.heap.get_mut(receiver_ref) {
                    Obj::Instance(i) => {
                        i.fields.insert(name, value);
                    }
                    _ => return Err(VmError::TypeError("only instances have properties".into())),
                }
                self.push(value);
            }
            Op::AssignPropertyKv => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let value = self.pop();
                let receiver = self.peek(0);
                let Value::Object(receiver_ref) = receiver else {
                    return Err(VmError::TypeError("object literal target missing".into()));
                };
                match self.heap.get_mut(receiver_ref) {
                    Obj::Instance(i) => {
                        i.fields.insert(name, value);
                    }
                    _ => return Err(VmError::TypeError("object literal target missing".into())),
                }
            }
            Op::AccessSuper => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let superclass = match self.pop() {
                    Value::Object(r) => r,
                    _ => return Err(VmError::TypeError("'super' must resolve to a class".into())),
                };
                let receiver = self.pop();
                let bound = self.bind_method(receiver, superclass, name)?;
                self.push(bound);
            }
            Op::Invoke => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let argc = self.read_u8();
                self.invoke(name, argc)?;
            }
            Op::SuperInvoke => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let argc = self.read_u8();
                let superclass = match self.pop() {
                    Value::Object(r) => r,
                    _ => return Err(VmError::TypeError("'super' must resolve to a class".into())),
                };
                match self.find_method(superclass, name) {
                    Some(Value::Object(m)) => self.call_as_method(m, argc)?,
                    _ => return Err(VmError::PropertyError(self.name_of(name))),
                }
            }
            Op::Object => {
                let instance = self.heap.alloc(Obj::Instance(Instance::new(self.object_class)));
                self.push(Value::Object(instance));
            }
            Op::CreateObject => {
                // The instance built by `Op::Object` is already on the
                // stack with all its fields assigned via
                // `Op::AssignPropertyKv`; nothing left to do but leave it.
            }
            Op::InstanceOf => {
                let class_val = self.pop();
                let target = self.pop();
                let is = match (target, class_val) {
                    (Value::Object(_), Value::Object(class)) => {
                        let mut current = self.class_of(target);
                        let mut found = false;
                        while let Some(c) = current {
                            if c == class {
                                found = true;
                                break;
                            }
                            current = match self.heap.get(c) {
                                Obj::Class(cls) => cls.superclass,
                                _ => None,
                            };
                        }
                        found
                    }
                    _ => false,
                };
                self.push(Value::Bool(is));
            }
            Op::ClassNative => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let arity = self.read_u8();
                let native = self.resolve_native(name, arity)?;
                self.push(native);
            }
            Op::List => {
                let count = self.read_u16() as usize;
                let base = self.stack.len() - count;
                let items = self.stack.split_off(base);
                let list = self.heap.alloc(Obj::List(items));
                self.push(Value::Object(list));
            }
            Op::AccessSubscript => self.access_subscript()?,
            Op::AssignSubscript => self.assign_subscript()?,
            Op::Throw => {
                let value = self.pop();
                return self.throw(value);
            }
            Op::TryBegin => {
                let catch_rel = self.read_u16();
                let catch_ip = self.frame().ip + catch_rel as usize;
                let stack_depth = self.stack.len();
                self.frame_mut().try_stack.push(TryRecord { catch_ip, stack_depth });
            }
            Op::TryEnd => {
                self.frame_mut().try_stack.pop();
            }
            Op::BoundException => {
                // The caught value was already pushed by `unwind` when it
                // jumped here; nothing further to push.
            }
            Op::Import => {
                let c = self.read_const();
                let path = match &c {
                    ConstValue::Str(s) => s.clone(),
                    _ => unreachable!(),
                };
                let module_id = self.import_module(&path)?;
                let instance = self.heap.alloc(Obj::Instance(Instance::new(self.object_class)));
                let exports = self.modules.get(module_id).exports.clone();
                if let Obj::Instance(inst) = self.heap.get_mut(instance) {
                    inst.fields = exports;
                }
                self.push(Value::Object(instance));
            }
            Op::Export => {
                let c = self.read_const();
                let name = match self.const_to_value(&c) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let value = self.pop();
                let module_id = self.module_id();
                self.modules.get_mut(module_id).exports.insert(name, value);
            }
            Op::Print => {
                let v = self.pop();
                let rendered = self.display(v);
                let _ = writeln!(self.output, "{rendered}");
            }
        }
        self.maybe_collect();
        Ok(Flow::Continue)
    }

    fn throw(&mut self, value: Value) -> Result<Flow, VmError> {
        // Raised from user code (`Op::Throw`), not an internal `VmError`, so
        // unwind directly with the thrown value rather than wrapping it.
        self.unwind(value)?;
        Ok(Flow::Continue)
    }

    fn binary_add(&mut self) -> Result<(), VmError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
            (Value::Object(x), Value::Object(y)) => {
                match (self.heap.get(x), self.heap.get(y)) {
                    (Obj::Str(sx), Obj::Str(sy)) => {
                        let joined = format!("{}{}", sx.as_str(), sy.as_str());
                        let r = self.heap.intern(&joined);
                        self.push(Value::Object(r));
                    }
                    _ => return Err(VmError::TypeError("operands must be two numbers or two strings".into())),
                }
            }
            _ => return Err(VmError::TypeError("operands must be two numbers or two strings".into())),
        }
        Ok(())
    }

    fn binary_numeric(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), VmError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(f(x, y))),
            _ => Err(VmError::TypeError("operands must be numbers".into())),
        }
    }

    fn compare(&mut self, f: impl FnOnce(f64, f64) -> bool) -> Result<(), VmError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Bool(f(x, y)));
                Ok(())
            }
            _ => Err(VmError::TypeError("operands must be numbers".into())),
        }
    }

    /// `GET_SUBSCRIPT` on a list indexes it; on an instance the index must
    /// be a string and behaves like `AccessProperty` — a field read, or a
    /// bound method if no field by that name exists (spec.md §4.4).
    fn access_subscript(&mut self) -> Result<(), VmError> {
        let index = self.pop();
        let target = self.pop();
        let Value::Object(r) = target else {
            return Err(VmError::TypeError("invalid subscript target".into()));
        };
        match self.heap.get(r) {
            Obj::List(items) => {
                let Value::Number(n) = index else {
                    return Err(VmError::TypeError("list index must be a number".into()));
                };
                let real = validate_index(items.len(), n)?;
                self.push(items[real]);
                Ok(())
            }
            Obj::Instance(_) => {
                let Value::Object(key_ref) = index else {
                    return Err(VmError::TypeError("instance subscript must be a string".into()));
                };
                if !matches!(self.heap.get(key_ref), Obj::Str(_)) {
                    return Err(VmError::TypeError("instance subscript must be a string".into()));
                }
                let (field, class) = match self.heap.get(r) {
                    Obj::Instance(inst) => (inst.fields.get(&key_ref).copied(), inst.class),
                    _ => unreachable!(),
                };
                let value = match field {
                    Some(v) => v,
                    None => self.bind_method(target, class, key_ref)?,
                };
                self.push(value);
                Ok(())
            }
            _ => Err(VmError::TypeError("invalid subscript target".into())),
        }
    }

    /// `SET_SUBSCRIPT` on a list stores by index; on an instance the index
    /// must be a string and stores a field, exactly like `AssignProperty`.
    fn assign_subscript(&mut self) -> Result<(), VmError> {
        let value = self.peek(0);
        let index = self.peek(1);
        let target = self.peek(2);
        let Value::Object(r) = target else {
            return Err(VmError::TypeError("invalid subscript target".into()));
        };
        match self.heap.get(r) {
            Obj::List(items) => {
                let Value::Number(n) = index else {
                    return Err(VmError::TypeError("list index must be a number".into()));
                };
                let real = validate_index(items.len(), n)?;
                if let Obj::List(items) = self.heap.get_mut(r) {
                    items[real] = value;
                }
            }
            Obj::Instance(_) => {
                let Value::Object(key_ref) = index else {
                    return Err(VmError::TypeError("instance subscript must be a string".into()));
                };
                if !matches!(self.heap.get(key_ref), Obj::Str(_)) {
                    return Err(VmError::TypeError("instance subscript must be a string".into()));
                }
                if let Obj::Instance(inst) = self.heap.get_mut(r) {
                    inst.fields.insert(key_ref, value);
                }
            }
            _ => return Err(VmError::TypeError("invalid subscript target".into())),
        }
        self.stack.truncate(self.stack.len() - 3);
        self.push(value);
        Ok(())
    }

    /// Reify an `Op::Closure` instruction: build the `Function`/`Closure`
    /// pair from the `FunctionConst` sitting in the enclosing chunk's
    /// constant pool, then capture each upvalue per its `(is_local, index)`
    /// descriptor. Mirrors `original_source`'s `OP_CLOSURE` handling in
    /// `executeVM` plus `captureUpvalue`.
    fn op_closure(&mut self) -> Result<(), VmError> {
        let ix = self.read_u16();
        let const_val = self.current_constant(ix);
        let func_const = match const_val {
            ConstValue::Function(f) => f,
            _ => unreachable!("Closure operand must index a Function constant"),
        };
        let upvalue_count = self.read_u16();

        let name_ref = func_const.name.as_deref().map(|n| self.heap.intern(n));
        let function = Function {
            arity: func_const.arity,
            upvalue_count: func_const.upvalue_count,
            name: name_ref,
            chunk: func_const.chunk,
        };
        let function_ref = self.heap.alloc(Obj::Function(function));

        let base = self.frame().base;
        let enclosing_closure = self.frame().closure;
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_u8();
            let index = self.read_u16() as usize;
            let r = if is_local != 0 {
                self.capture_upvalue(base + index)
            } else {
                match self.heap.get(enclosing_closure) {
                    Obj::Closure(c) => c.upvalues[index],
                    _ => unreachable!(),
                }
            };
            upvalues.push(r);
        }

        let module = self.frame().module;
        let closure_ref = self.heap.alloc(Obj::Closure(Closure { function: function_ref, upvalues, module }));
        self.push(Value::Object(closure_ref));
        Ok(())
    }

    /// Resolve the dynamic library sitting next to the current module's
    /// source (`<dir>/<basename>.<libext>`), opening and caching it on
    /// first use (spec.md §4.4: "Libraries are cached in the VM").
    fn native_library_for_current_module(&mut self) -> Result<ObjRef, VmError> {
        let module = self.modules.get(self.module_id());
        let ext = if cfg!(windows) { "dll" } else { "so" };
        let path = module.directory.join(format!("{}.{ext}", module.name));
        if let Some(&cached) = self.native_libraries.get(&path) {
            return Ok(cached);
        }
        let lib = ffi::load_library(&path)?;
        let lib_ref = self.heap.alloc(Obj::NativeLibrary(lib));
        self.native_libraries.insert(path, lib_ref);
        Ok(lib_ref)
    }

    /// `NATIVE`/`CLASS_NATIVE` share this: resolve `feline_<name>` in the
    /// current module's sibling library and wrap it as a callable Value.
    fn resolve_native(&mut self, name: ObjRef, arity: u8) -> Result<Value, VmError> {
        let name_str = self.heap.as_str(name).unwrap_or_default().to_string();
        let lib_ref = self.native_library_for_current_module()?;
        let raw = match self.heap.get(lib_ref) {
            Obj::NativeLibrary(lib) => ffi::resolve(lib, &name_str)?,
            _ => unreachable!(),
        };
        let id = self.natives.register(move |_vm, args| ffi::call(raw, args));
        let obj = self.heap.alloc(Obj::Native(NativeObj { function: NativeFn(id), arity, bound: None }));
        Ok(Value::Object(obj))
    }
}

enum Flow {
    Continue,
    Return,
}

/// Mirrors `original_source`'s `validateIndex`: negative indices count from
/// the end, anything else out of range is an error.
fn validate_index(len: usize, n: f64) -> Result<usize, VmError> {
    let i = n as isize;
    let real = if i < 0 { i + len as isize } else { i };
    if real < 0 || real as usize >= len {
        return Err(VmError::IndexRangeError(format!("{n} (length {len})")));
    }
    Ok(real as usize)
}

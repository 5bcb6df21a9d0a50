//! Bytecode `Chunk`: opcode stream, constant pool, and line table.
//!
//! The opcode set is grounded one-for-one in `original_source/src/opcode.h`;
//! the container format (byte stream + RLE line table + `bincode` framing
//! with a magic/version/hash header) is grounded in
//! `examples/cartman-fr-vitte`'s `vitte-core/src/bytecode/chunk.rs`. Unlike
//! the teacher, operands here are raw bytes appended to a `Vec<u8>` rather
//! than a separate `Vec<Op>`, because the original's compiler patches jump
//! targets by poking two bytes after the fact (`patchJump`) — a byte buffer
//! supports that directly, a `Vec<Op>` would not.

use serde::{Deserialize, Serialize};

/// One opcode, matching `original_source/src/opcode.h`. Never reorder or
/// remove a variant without also bumping [`Chunk::FORMAT_VERSION`] —
/// operand layout (and therefore every `.flnc` file ever written) depends
/// on the numeric discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Push `constants[u16]`.
    UseConstant = 0,
    Null,
    True,
    False,
    /// Pop and discard the top of stack.
    Pop,
    /// Bind global `constants[u16]` (a string) to the value on top of stack.
    DefineGlobal,
    AccessGlobal,
    AssignGlobal,
    /// Operand is a `u16` frame-local slot index.
    AccessLocal,
    AssignLocal,
    /// Operand is a `u16` upvalue index into the running closure.
    AccessUpvalue,
    AssignUpvalue,
    /// Close every open upvalue at or above the top-of-stack slot, then pop.
    CloseUpvalue,
    /// Unconditional jump; operand is an absolute `u16` offset.
    Jump,
    /// Pop the condition; jump if falsey.
    JumpFalse,
    /// Peek (don't pop) the condition; jump if falsey. Used for `&&`.
    JumpFalseShortCircuit,
    /// Peek (don't pop) the condition; jump if truthy. Used for `||`.
    JumpTrueShortCircuit,
    /// Like `Jump` but backwards, for loop bodies.
    Loop,
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Not,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    /// Operand is a `u16` index into `constants` (a `Function`); builds a
    /// `Closure`, then reads `upvalue_count` `(is_local: u8, index: u16)`
    /// pairs describing how to capture each upvalue.
    Closure,
    /// Operand is a `u8` argument count.
    Call,
    Return,
    /// Operand is a `u16` constant index naming the native to call, `u8`
    /// argument count.
    Native,
    /// Operand is a `u16` constant index (the class name).
    Class,
    Inherit,
    /// Operand is a `u16` constant index (the method name); binds the
    /// closure on top of stack into the class just below it.
    Method,
    AccessProperty,
    AssignProperty,
    /// `obj[key] = value` sugar for object-literal bodies.
    AssignPropertyKv,
    AccessSuper,
    /// Fused `AccessProperty` + `Call`, operands `u16` name, `u8` argc.
    Invoke,
    SuperInvoke,
    /// Start an object literal (`{` ... `}`).
    Object,
    CreateObject,
    InstanceOf,
    /// Resolves a native symbol exactly like [`Op::Native`] (`u16` name
    /// constant, `u8` arity), but leaves the callable on the stack instead
    /// of invoking it, for an immediately following [`Op::Method`] to
    /// install as `native methodName(params);`.
    ClassNative,
    /// Operand is a `u16` element count; pops that many values into a list.
    List,
    AccessSubscript,
    AssignSubscript,
    Throw,
    /// Operand is a `u16` offset to the matching catch block. `catch` is
    /// mandatory in the grammar, so there is no "absent" sentinel; any
    /// trailing `finally` body is ordinary code reached by fall-through
    /// after the catch body, not a separate unwind target.
    TryBegin,
    TryEnd,
    /// Push the exception currently being unwound (inside a catch block).
    BoundException,
    /// Operand is a `u16` constant index naming the module path.
    Import,
    /// Operand is a `u16` constant index naming the export.
    Export,
    Print,
}

impl Op {
    /// Decode a raw opcode byte. Used by both `disassemble` and
    /// `feline-vm`'s dispatch loop, so the mapping lives in exactly one
    /// place.
    pub fn from_byte(byte: u8) -> Option<Op> {
        op_byte_to_op(byte)
    }

    /// Number of operand bytes following this opcode in the code stream.
    /// Not meaningful for [`Op::Closure`], whose operand length depends on
    /// its captured upvalue count — callers decoding a live code stream
    /// must special-case it.
    pub fn operand_len(self) -> usize {
        use Op::*;
        match self {
            UseConstant | DefineGlobal | AccessGlobal | AssignGlobal | AccessLocal
            | AssignLocal | AccessUpvalue | AssignUpvalue | Jump | JumpFalse
            | JumpFalseShortCircuit | JumpTrueShortCircuit | Loop | Class | Method
            | AccessProperty | AssignProperty | AssignPropertyKv | AccessSuper
            | List | Import | Export | TryBegin => 2,
            Call => 1,
            Native | ClassNative | Invoke | SuperInvoke => 3,
            _ => 0,
        }
    }
}

/// A nested function body stored in a constant pool, grounded in how
/// `original_source`'s `OP_CLOSURE` reads an `ObjFunction*` straight out of
/// `constants`. Kept distinct from the runtime `feline_core::object::Function`
/// (which additionally carries a heap `ObjRef` for its name) so `Chunk`
/// itself stays serializable without any heap in scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionConst {
    pub arity: u8,
    pub upvalue_count: u8,
    pub name: Option<String>,
    pub chunk: Chunk,
}

/// A constant-pool entry. Deliberately *not* [`crate::value::Value`]: a
/// `Value::Object` handle is only meaningful inside the heap that produced
/// it, but a `Chunk` must survive being written to disk and reloaded into a
/// fresh VM. Strings are materialized (interned) the first time a loaded
/// chunk runs; see `feline-vm`'s loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Function(Box<FunctionConst>),
}

impl std::fmt::Display for ConstValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstValue::Null => write!(f, "null"),
            ConstValue::Bool(b) => write!(f, "{b}"),
            ConstValue::Number(n) => write!(f, "{n}"),
            ConstValue::Str(s) => write!(f, "{s:?}"),
            ConstValue::Function(func) => {
                write!(f, "<fn {}>", func.name.as_deref().unwrap_or("anonymous"))
            }
        }
    }
}

/// Run-length-encoded line table: `(run_length, line)` pairs, grounded in
/// the teacher's `LineRun`/`LineTable`. The original walks a parallel
/// `int* lines` array instead; RLE is strictly smaller for the long runs a
/// single source line usually compiles to and costs only a linear scan to
/// look up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineTable {
    runs: Vec<(u32, u32)>,
}

impl LineTable {
    pub fn push(&mut self, line: u32) {
        if let Some(last) = self.runs.last_mut() {
            if last.1 == line {
                last.0 += 1;
                return;
            }
        }
        self.runs.push((1, line));
    }

    pub fn line_for(&self, offset: usize) -> u32 {
        let mut remaining = offset;
        for &(len, line) in &self.runs {
            if remaining < len as usize {
                return line;
            }
            remaining -= len as usize;
        }
        self.runs.last().map(|r| r.1).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHeader {
    magic: [u8; 4],
    version: u16,
    hash_fnv1a_64: u64,
}

const MAGIC: [u8; 4] = *b"FLNC";

#[derive(Debug, thiserror::Error)]
pub enum ChunkLoadError {
    #[error("bad magic bytes, not a Feline chunk")]
    BadMagic,
    #[error("unsupported chunk format version {0}")]
    UnsupportedVersion(u16),
    #[error("content hash mismatch: chunk is corrupt or truncated")]
    BadHash,
    #[error("deserialization failed: {0}")]
    Decode(#[from] bincode::Error),
}

/// One compiled function body: its code, constants, and debug line table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<ConstValue>,
    lines: LineTable,
}

impl Chunk {
    pub const FORMAT_VERSION: u16 = 1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Direct mutable access for backpatching operands the high-level
    /// `push_*`/`patch_jump` helpers don't cover (e.g. `feline-compiler`'s
    /// two-field `TryBegin` operand).
    pub fn code_mut(&mut self) -> &mut [u8] {
        &mut self.code
    }

    pub fn constants(&self) -> &[ConstValue] {
        &self.constants
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn line_for(&self, offset: usize) -> u32 {
        self.lines.line_for(offset)
    }

    /// Append an opcode (no operands) at `line`; returns its offset.
    pub fn push_op(&mut self, op: Op, line: u32) -> usize {
        let at = self.code.len();
        self.code.push(op as u8);
        self.lines.push(line);
        at
    }

    pub fn push_u8(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn push_u16(&mut self, value: u16, line: u32) {
        for b in value.to_le_bytes() {
            self.push_u8(b, line);
        }
    }

    /// Add a constant, deduplicating by value (matches the original's
    /// `addConstant`, which also checks for an existing equal entry to keep
    /// the pool small).
    pub fn add_const(&mut self, value: ConstValue) -> u16 {
        if let Some(ix) = self.constants.iter().position(|c| *c == value) {
            return ix as u16;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }

    /// Backpatch a previously-emitted 2-byte jump operand to point at the
    /// current end of the code stream. `operand_at` is the offset of the
    /// first operand byte (i.e. one past the opcode byte).
    pub fn patch_jump(&mut self, operand_at: usize) -> Result<(), String> {
        let target = self.code.len();
        let offset = target
            .checked_sub(operand_at + 2)
            .ok_or_else(|| "jump target precedes operand".to_string())?;
        if offset > u16::MAX as usize {
            return Err(format!("jump body too large to encode ({offset} bytes)"));
        }
        let bytes = (offset as u16).to_le_bytes();
        self.code[operand_at] = bytes[0];
        self.code[operand_at + 1] = bytes[1];
        Ok(())
    }

    pub fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.code[at], self.code[at + 1]])
    }

    fn fnv1a64(bytes: &[u8]) -> u64 {
        const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
        const PRIME: u64 = 0x100000001b3;
        let mut h = OFFSET_BASIS;
        for &b in bytes {
            h ^= b as u64;
            h = h.wrapping_mul(PRIME);
        }
        h
    }

    fn compute_hash(&self) -> Result<u64, bincode::Error> {
        let body = bincode::serialize(&(&self.code, &self.constants, &self.lines))?;
        Ok(Self::fnv1a64(&body))
    }

    /// Serialize to the on-disk `.flnc` framing: header (magic, version,
    /// content hash) followed by the bincode-encoded body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        let header = ChunkHeader {
            magic: MAGIC,
            version: Self::FORMAT_VERSION,
            hash_fnv1a_64: self.compute_hash()?,
        };
        let mut out = bincode::serialize(&header)?;
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkLoadError> {
        let header_len = bincode::serialized_size(&ChunkHeader {
            magic: MAGIC,
            version: 0,
            hash_fnv1a_64: 0,
        })? as usize;
        if bytes.len() < header_len {
            return Err(ChunkLoadError::Decode(bincode::ErrorKind::SizeLimit.into()));
        }
        let header: ChunkHeader = bincode::deserialize(&bytes[..header_len])?;
        if header.magic != MAGIC {
            return Err(ChunkLoadError::BadMagic);
        }
        if header.version != Self::FORMAT_VERSION {
            return Err(ChunkLoadError::UnsupportedVersion(header.version));
        }
        let chunk: Chunk = bincode::deserialize(&bytes[header_len..])?;
        if chunk.compute_hash()? != header.hash_fnv1a_64 {
            return Err(ChunkLoadError::BadHash);
        }
        Ok(chunk)
    }

    /// Human-readable disassembly, used by the CLI's `--trace` output and by
    /// tests that want to eyeball codegen without a debugger.
    pub fn disassemble(&self, name: &str) -> String {
        let mut out = format!("== {name} ==\n");
        let mut offset = 0usize;
        while offset < self.code.len() {
            offset = self.disassemble_one(offset, &mut out);
        }
        out
    }

    fn disassemble_one(&self, offset: usize, out: &mut String) -> usize {
        let op_byte = self.code[offset];
        let line = self.lines.line_for(offset);
        out.push_str(&format!("{offset:04} {line:>4} "));
        let op = match op_byte_to_op(op_byte) {
            Some(op) => op,
            None => {
                out.push_str(&format!("UNKNOWN({op_byte})\n"));
                return offset + 1;
            }
        };
        if op == Op::Closure {
            let ix = self.read_u16(offset + 1);
            let upvalue_count = self.read_u16(offset + 3);
            out.push_str(&format!(
                "Closure {ix} ({} upvalues)\n",
                upvalue_count
            ));
            let mut cursor = offset + 5;
            for _ in 0..upvalue_count {
                cursor += 3;
            }
            return cursor;
        }

        let len = op.operand_len();
        match len {
            2 if matches!(
                op,
                Op::UseConstant | Op::DefineGlobal | Op::AccessGlobal | Op::AssignGlobal
            ) =>
            {
                let ix = self.read_u16(offset + 1);
                let cv = self.constants.get(ix as usize);
                out.push_str(&format!(
                    "{op:?} {ix} ({})\n",
                    cv.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
                ));
            }
            0 => out.push_str(&format!("{op:?}\n")),
            1 => out.push_str(&format!("{op:?} {}\n", self.code[offset + 1])),
            2 => out.push_str(&format!("{op:?} {}\n", self.read_u16(offset + 1))),
            3 => out.push_str(&format!(
                "{op:?} {} {}\n",
                self.read_u16(offset + 1),
                self.code[offset + 3]
            )),
            4 => out.push_str(&format!(
                "{op:?} {} {}\n",
                self.read_u16(offset + 1),
                self.read_u16(offset + 3)
            )),
            _ => out.push_str(&format!("{op:?} <{len} operand bytes>\n")),
        }
        offset + 1 + len
    }
}

fn op_byte_to_op(byte: u8) -> Option<Op> {
    // Kept in lockstep with the `Op` enum's declaration order; a unit test
    // below catches drift if a variant is ever inserted instead of appended.
    const TABLE: &[Op] = &[
        Op::UseConstant,
        Op::Null,
        Op::True,
        Op::False,
        Op::Pop,
        Op::DefineGlobal,
        Op::AccessGlobal,
        Op::AssignGlobal,
        Op::AccessLocal,
        Op::AssignLocal,
        Op::AccessUpvalue,
        Op::AssignUpvalue,
        Op::CloseUpvalue,
        Op::Jump,
        Op::JumpFalse,
        Op::JumpFalseShortCircuit,
        Op::JumpTrueShortCircuit,
        Op::Loop,
        Op::Add,
        Op::Subtract,
        Op::Multiply,
        Op::Divide,
        Op::Negate,
        Op::Not,
        Op::Equal,
        Op::NotEqual,
        Op::Greater,
        Op::GreaterEqual,
        Op::Less,
        Op::LessEqual,
        Op::Closure,
        Op::Call,
        Op::Return,
        Op::Native,
        Op::Class,
        Op::Inherit,
        Op::Method,
        Op::AccessProperty,
        Op::AssignProperty,
        Op::AssignPropertyKv,
        Op::AccessSuper,
        Op::Invoke,
        Op::SuperInvoke,
        Op::Object,
        Op::CreateObject,
        Op::InstanceOf,
        Op::ClassNative,
        Op::List,
        Op::AccessSubscript,
        Op::AssignSubscript,
        Op::Throw,
        Op::TryBegin,
        Op::TryEnd,
        Op::BoundException,
        Op::Import,
        Op::Export,
        Op::Print,
    ];
    TABLE.get(byte as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_byte_round_trips() {
        for (i, op) in [
            Op::UseConstant,
            Op::Jump,
            Op::Invoke,
            Op::TryBegin,
            Op::Print,
        ]
        .into_iter()
        .enumerate()
        {
            let byte = op as u8;
            assert_eq!(op_byte_to_op(byte), Some(op), "mismatch at index {i}");
        }
    }

    #[test]
    fn jump_patching_writes_correct_offset() {
        let mut chunk = Chunk::new();
        chunk.push_op(Op::JumpFalse, 1);
        let operand_at = chunk.len();
        chunk.push_u16(0xffff, 1);
        chunk.push_op(Op::Pop, 2);
        chunk.patch_jump(operand_at).unwrap();
        assert_eq!(chunk.read_u16(operand_at), 1);
    }

    #[test]
    fn constant_pool_dedupes() {
        let mut chunk = Chunk::new();
        let a = chunk.add_const(ConstValue::Number(1.0));
        let b = chunk.add_const(ConstValue::Number(1.0));
        assert_eq!(a, b);
        assert_eq!(chunk.constants().len(), 1);
    }

    #[test]
    fn roundtrip_detects_corruption() {
        let mut chunk = Chunk::new();
        chunk.push_op(Op::Null, 1);
        chunk.push_op(Op::Return, 1);
        let mut bytes = chunk.to_bytes().unwrap();
        let restored = Chunk::from_bytes(&bytes).unwrap();
        assert_eq!(restored.code(), chunk.code());

        *bytes.last_mut().unwrap() ^= 0xff;
        assert!(matches!(
            Chunk::from_bytes(&bytes),
            Err(ChunkLoadError::BadHash) | Err(ChunkLoadError::Decode(_))
        ));
    }
}

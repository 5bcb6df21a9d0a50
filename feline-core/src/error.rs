//! Error types shared across the value/object/chunk layer.

use crate::chunk::ChunkLoadError;
use thiserror::Error;

/// Failures that can occur while building or loading a [`crate::chunk::Chunk`],
/// independent of anything the compiler's grammar does (that's
/// `feline_compiler::CompileError`'s job).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("constant pool overflow: a chunk may hold at most {0} constants")]
    ConstantPoolOverflow(usize),

    #[error("jump body too large to encode: {0} bytes exceeds the 16-bit jump range")]
    JumpTooLarge(usize),

    #[error("loading compiled chunk failed: {0}")]
    ChunkLoad(#[from] ChunkLoadError),
}

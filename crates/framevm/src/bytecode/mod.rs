//! Bytecode representation.
//!
//! # Module Structure
//!
//! - `op` - Opcode enum and instruction decoding
//! - `code` - Code object containing bytecode and metadata
//! - `builder` - CodeBuilder for emitting bytecode

pub use builder::{CodeBuilder, JumpLabel};
pub use code::{Code, CodeFlags, CodeParts, Const};
pub(crate) use code::BlockScan;
pub use op::{Comparison, HAVE_ARGUMENT, Instruction, Instructions, JumpKind, Opcode};

mod builder;
mod code;
mod op;

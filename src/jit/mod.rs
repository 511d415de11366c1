//! Just-in-time compilation for AMX bytecode.
//!
//! The pieces, bottom up:
//! - executable memory allocation
//! - a code buffer with labels and link-time fix-ups
//! - a 32-bit x86 encoder
//! - inline emitters for the float natives
//! - the bytecode translator, runtime trampolines and compiled output

pub mod codebuf;
pub mod compiler;
pub mod intrinsics;
pub mod memory;
pub mod x86;

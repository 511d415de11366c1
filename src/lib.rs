//! amx-jit - a just-in-time compiler for the AMX virtual machine.
//!
//! Translates the bytecode of a loaded AMX program into native 32-bit x86
//! code and executes it through a small runtime bridge. The host compiles an
//! instance once and then invokes its public functions through the `exec`
//! entry point stored in the emitted block:
//!
//! ```no_run
//! use amx_jit::{AmxImageBuilder, JitCompiler};
//!
//! let mut image = AmxImageBuilder::new()
//!     .code(&[46, 48]) // PROC; RETN
//!     .public("entry", 0)
//!     .build();
//! let output = JitCompiler::new(image.ptr()).compile()?;
//! # #[cfg(target_arch = "x86")]
//! # {
//! let mut retval = 0;
//! let _error = unsafe { output.exec(0, &mut retval) };
//! # }
//! # Ok::<(), amx_jit::CompileError>(())
//! ```
//!
//! Generated code targets 32-bit x86 only; compilation itself runs on any
//! host.

pub mod amx;
pub mod jit;

// Re-export commonly used types
pub use amx::{Amx, AmxImage, AmxImageBuilder, AmxPtr, Cell};
pub use jit::compiler::{AmxExecFn, CompileError, JitCompiler, JitOutput};

//! The AMX virtual machine model.
//!
//! The AMX is a stack-based 32-bit VM. A loaded program is a single memory
//! image: a file header followed by the code section, the data section, and
//! room for the heap and the stack. All VM addresses are byte offsets from
//! the start of the data section.
//!
//! This module defines the instance and header layouts plus the error and
//! flag constants shared by the whole crate. The raw-image accessors live in
//! [`ptr`], the bytecode front end in [`opcode`] and [`disasm`], and the
//! in-memory image builder in [`image`].

pub mod disasm;
pub mod image;
pub mod opcode;
pub mod ptr;

pub use disasm::{AmxDisassembler, AmxInstruction};
pub use image::{AmxImage, AmxImageBuilder};
pub use opcode::Opcode;
pub use ptr::{AmxNativeFn, AmxPtr};

/// The VM's 32-bit word.
pub type Cell = i32;

/// Size of a cell in bytes.
pub const CELL_SIZE: usize = std::mem::size_of::<Cell>();

/// Magic number of a 32-bit-cell AMX image.
pub const AMX_MAGIC: u16 = 0xF1E0;

/// File format version written by the image builder.
pub const AMX_FILE_VERSION: u8 = 8;

/// Minimum VM version required to run images built by this crate.
pub const AMX_VERSION: u8 = 8;

/// Pseudo-index selecting the program's main entry point instead of a public.
pub const AMX_EXEC_MAIN: i32 = -1;

/// AMX runtime error codes, as stored in [`Amx::error`] and returned by the
/// JIT's `exec` entry point.
pub mod errors {
    pub const NONE: i32 = 0;
    pub const EXIT: i32 = 1;
    pub const ASSERT: i32 = 2;
    pub const STACKERR: i32 = 3;
    pub const BOUNDS: i32 = 4;
    pub const MEMACCESS: i32 = 5;
    pub const INVINSTR: i32 = 6;
    pub const STACKLOW: i32 = 7;
    pub const HEAPLOW: i32 = 8;
    pub const CALLBACK: i32 = 9;
    pub const NATIVE: i32 = 10;
    pub const DIVIDE: i32 = 11;
    pub const SLEEP: i32 = 12;
    pub const INVSTATE: i32 = 13;
    pub const MEMORY: i32 = 16;
    pub const FORMAT: i32 = 17;
    pub const VERSION: i32 = 18;
    pub const NOTFOUND: i32 = 19;
    pub const INDEX: i32 = 20;
    pub const DEBUG: i32 = 21;
    pub const INIT: i32 = 22;
    pub const USERDATA: i32 = 23;
    pub const INIT_JIT: i32 = 24;
    pub const PARAMS: i32 = 25;
    pub const DOMAIN: i32 = 26;
    pub const GENERAL: i32 = 27;
}

/// Instance flag bits ([`Amx::flags`]).
pub mod flags {
    /// Debug information is present.
    pub const DEBUG: i32 = 0x02;
    /// The code section uses compact encoding.
    pub const COMPACT: i32 = 0x04;
    /// All native functions have been registered.
    pub const NTVREG: i32 = 0x1000;
    /// The instance has been JIT-compiled.
    pub const JITC: i32 = 0x2000;
    /// Jump/call operands have been relocated to image addresses.
    pub const RELOC: i32 = 0x8000;
}

/// A loaded AMX instance.
///
/// `#[repr(C)]` because the JIT reads and writes these fields from generated
/// code by byte offset (`std::mem::offset_of!` feeds the emitter), and
/// because native functions receive a raw `*mut Amx`.
///
/// `frm`, `stk`, `hea`, `hlw` and `stp` are byte offsets from the start of
/// the data section. The stack grows downward from `stp`; the heap grows
/// upward from `hlw`.
#[repr(C)]
pub struct Amx {
    /// Start of the program image (the header).
    pub base: *mut u8,
    /// Start of the data section, or null to derive it from `base` and the
    /// header's `dat` field.
    pub data: *mut u8,
    /// Current frame pointer.
    pub frm: Cell,
    /// Current heap pointer.
    pub hea: Cell,
    /// Heap low-water mark (bottom of the heap).
    pub hlw: Cell,
    /// Current stack pointer.
    pub stk: Cell,
    /// Stack top (one past the highest stack cell).
    pub stp: Cell,
    /// Instance flags, see [`flags`].
    pub flags: i32,
    /// Last error code, see [`errors`].
    pub error: i32,
    /// Number of cells pushed since the last call, consumed by `exec`.
    pub paramcount: i32,
}

/// The fixed-layout header at the start of a program image.
///
/// All offsets are relative to the start of the image. The field order and
/// widths follow the AMX file format for 32-bit cells; the struct has no
/// internal padding.
#[repr(C)]
pub struct AmxHeader {
    /// Total image size in bytes.
    pub size: i32,
    /// [`AMX_MAGIC`] for 32-bit cells.
    pub magic: u16,
    pub file_version: u8,
    pub amx_version: u8,
    pub flags: i16,
    /// Size in bytes of one public/native table record.
    pub defsize: i16,
    /// Offset of the code section.
    pub cod: i32,
    /// Offset of the data section.
    pub dat: i32,
    /// Initial heap pointer (image-relative).
    pub hea: i32,
    /// Stack top (image-relative).
    pub stp: i32,
    /// Entry point of `main`, code-relative, or negative if absent.
    pub cip: i32,
    /// Offset of the publics table.
    pub publics: i32,
    /// Offset of the natives table.
    pub natives: i32,
    pub libraries: i32,
    pub pubvars: i32,
    pub tags: i32,
    /// Offset of the name string region.
    pub nametable: i32,
}

/// One record of the publics or natives table.
///
/// For publics `address` is the function's code-relative entry point. For
/// natives it starts as zero and receives the host function pointer when the
/// native is registered.
#[repr(C)]
pub struct AmxFuncStub {
    pub address: u32,
    pub nameofs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<AmxHeader>(), 56);
        assert_eq!(offset_of!(AmxHeader, magic), 4);
        assert_eq!(offset_of!(AmxHeader, defsize), 10);
        assert_eq!(offset_of!(AmxHeader, cod), 12);
        assert_eq!(offset_of!(AmxHeader, dat), 16);
        assert_eq!(offset_of!(AmxHeader, nametable), 52);
    }

    #[test]
    fn test_funcstub_layout() {
        assert_eq!(std::mem::size_of::<AmxFuncStub>(), 8);
    }
}

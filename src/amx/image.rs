//! In-memory AMX program images.
//!
//! [`AmxImageBuilder`] lays out a loadable image the way the AMX file format
//! does on disk: header, publics/natives tables, name strings, code, data,
//! then room for the heap and the stack. Code is supplied with code-relative
//! control-flow operands; [`build`] relocates them to image addresses, which
//! is the form the JIT expects (it subtracts the code base back out).
//!
//! [`build`]: AmxImageBuilder::build

use super::opcode::{Opcode, Operands};
use super::{
    flags, Amx, AmxPtr, Cell, AMX_FILE_VERSION, AMX_MAGIC, AMX_VERSION, CELL_SIZE,
};

const HEADER_SIZE: usize = std::mem::size_of::<super::AmxHeader>();
const FUNCSTUB_SIZE: usize = std::mem::size_of::<super::AmxFuncStub>();
const NAME_MAX: u16 = 31;

/// Builder for an [`AmxImage`].
pub struct AmxImageBuilder {
    code: Vec<Cell>,
    data: Vec<Cell>,
    memory_size: usize,
    publics: Vec<(String, Cell)>,
    natives: Vec<String>,
    main: Option<Cell>,
}

impl AmxImageBuilder {
    pub fn new() -> AmxImageBuilder {
        AmxImageBuilder {
            code: Vec::new(),
            data: Vec::new(),
            memory_size: 4096,
            publics: Vec::new(),
            natives: Vec::new(),
            main: None,
        }
    }

    /// The code section, one cell per opcode or operand. Control-flow
    /// operands (`CALL`, jumps, `SWITCH`, case-table addresses) are
    /// code-relative byte offsets.
    pub fn code(mut self, cells: &[Cell]) -> AmxImageBuilder {
        self.code = cells.to_vec();
        self
    }

    /// Initial contents of the data section.
    pub fn data(mut self, cells: &[Cell]) -> AmxImageBuilder {
        self.data = cells.to_vec();
        self
    }

    /// Bytes reserved for the heap and the stack (default 4096).
    pub fn memory_size(mut self, bytes: usize) -> AmxImageBuilder {
        self.memory_size = (bytes + CELL_SIZE - 1) & !(CELL_SIZE - 1);
        self
    }

    /// Add a public function at a code-relative address.
    pub fn public(mut self, name: &str, address: Cell) -> AmxImageBuilder {
        self.publics.push((name.to_string(), address));
        self
    }

    /// Declare a native function slot. Its host address is supplied later
    /// through [`AmxPtr::register_natives`].
    pub fn native(mut self, name: &str) -> AmxImageBuilder {
        self.natives.push(name.to_string());
        self
    }

    /// Set the `main` entry point (code-relative).
    pub fn main(mut self, address: Cell) -> AmxImageBuilder {
        self.main = Some(address);
        self
    }

    /// Lay out the image and relocate control-flow operands.
    pub fn build(self) -> AmxImage {
        let publics_off = HEADER_SIZE;
        let natives_off = publics_off + self.publics.len() * FUNCSTUB_SIZE;
        let tables_end = natives_off + self.natives.len() * FUNCSTUB_SIZE;
        let nametable_off = tables_end;

        // Name region: a max-length prefix, then the nul-terminated names in
        // table order.
        let mut names = Vec::new();
        names.extend_from_slice(&NAME_MAX.to_le_bytes());
        let mut name_offsets = Vec::new();
        for name in self.publics.iter().map(|(n, _)| n).chain(self.natives.iter()) {
            name_offsets.push((nametable_off + names.len()) as u32);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        let cod = align_cell(nametable_off + names.len());
        let dat = cod + self.code.len() * CELL_SIZE;
        let hea = dat + self.data.len() * CELL_SIZE;
        let stp = hea + self.memory_size;

        let mut bytes = vec![0u8; stp];
        write_i32(&mut bytes, 0, dat as i32); // size: header through data
        bytes[4..6].copy_from_slice(&AMX_MAGIC.to_le_bytes());
        bytes[6] = AMX_FILE_VERSION;
        bytes[7] = AMX_VERSION;
        bytes[8..10].copy_from_slice(&0i16.to_le_bytes()); // flags
        bytes[10..12].copy_from_slice(&(FUNCSTUB_SIZE as i16).to_le_bytes());
        write_i32(&mut bytes, 12, cod as i32);
        write_i32(&mut bytes, 16, dat as i32);
        write_i32(&mut bytes, 20, hea as i32);
        write_i32(&mut bytes, 24, stp as i32);
        write_i32(&mut bytes, 28, self.main.unwrap_or(-1));
        write_i32(&mut bytes, 32, publics_off as i32);
        write_i32(&mut bytes, 36, natives_off as i32);
        write_i32(&mut bytes, 40, tables_end as i32); // libraries
        write_i32(&mut bytes, 44, tables_end as i32); // pubvars
        write_i32(&mut bytes, 48, tables_end as i32); // tags
        write_i32(&mut bytes, 52, nametable_off as i32);

        for (i, (_, address)) in self.publics.iter().enumerate() {
            let off = publics_off + i * FUNCSTUB_SIZE;
            write_i32(&mut bytes, off, *address);
            write_i32(&mut bytes, off + 4, name_offsets[i] as i32);
        }
        for i in 0..self.natives.len() {
            let off = natives_off + i * FUNCSTUB_SIZE;
            write_i32(&mut bytes, off, 0);
            write_i32(&mut bytes, off + 4, name_offsets[self.publics.len() + i] as i32);
        }

        bytes[nametable_off..nametable_off + names.len()].copy_from_slice(&names);
        for (i, cell) in self.code.iter().enumerate() {
            write_i32(&mut bytes, cod + i * CELL_SIZE, *cell);
        }
        for (i, cell) in self.data.iter().enumerate() {
            write_i32(&mut bytes, dat + i * CELL_SIZE, *cell);
        }

        // Cell-aligned backing storage; `bytes` is a multiple of CELL_SIZE
        // by construction.
        let mut buf: Box<[Cell]> = bytes
            .chunks_exact(CELL_SIZE)
            .map(|c| Cell::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let base = buf.as_mut_ptr() as *mut u8;
        relocate_code(&mut buf, cod, self.code.len(), base);

        let data_len = (self.data.len() * CELL_SIZE) as Cell;
        let stp_rel = (stp - dat) as Cell;
        let mut instance_flags = flags::RELOC;
        if self.natives.is_empty() {
            instance_flags |= flags::NTVREG;
        }
        let amx = Box::new(Amx {
            base,
            data: std::ptr::null_mut(),
            frm: 0,
            hea: data_len,
            hlw: data_len,
            stk: stp_rel,
            stp: stp_rel,
            flags: instance_flags,
            error: 0,
            paramcount: 0,
        });

        AmxImage { buf, amx }
    }
}

impl Default for AmxImageBuilder {
    fn default() -> AmxImageBuilder {
        AmxImageBuilder::new()
    }
}

fn align_cell(n: usize) -> usize {
    (n + CELL_SIZE - 1) & !(CELL_SIZE - 1)
}

fn write_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Turn code-relative control-flow operands into image addresses, the same
/// relocation a loader performs before handing an instance to the JIT.
/// Addresses wrap at 32 bits, matching the VM's cell width.
fn relocate_code(buf: &mut [Cell], cod: usize, code_cells: usize, base: *mut u8) {
    let code_base = (base as usize as u32).wrapping_add(cod as u32);
    let reloc = |cell: Cell| code_base.wrapping_add(cell as u32) as Cell;

    let code = &mut buf[cod / CELL_SIZE..cod / CELL_SIZE + code_cells];
    let mut i = 0;
    while i < code.len() {
        let opcode = match Opcode::from_cell(code[i]) {
            Some(opcode) => opcode,
            None => return,
        };
        i += 1;
        match opcode.operands() {
            Operands::Fixed(n) => {
                if i + n > code.len() {
                    return;
                }
                let relocates = opcode.is_call()
                    || (opcode.is_jump() && n == 1)
                    || opcode == Opcode::Switch;
                if relocates {
                    code[i] = reloc(code[i]);
                }
                i += n;
            }
            Operands::CaseTable => {
                if i >= code.len() || code[i] < 0 {
                    return;
                }
                let num = code[i] as usize;
                if i + 2 + 2 * num > code.len() {
                    return;
                }
                code[i + 1] = reloc(code[i + 1]);
                for k in 0..num {
                    code[i + 3 + 2 * k] = reloc(code[i + 3 + 2 * k]);
                }
                i += 2 + 2 * num;
            }
            Operands::Debug => return,
        }
    }
}

/// An owned, loaded program image plus its [`Amx`] instance.
///
/// The backing storage is heap-allocated and never moves, so raw views
/// handed out by [`ptr`] stay valid for the image's lifetime.
///
/// [`ptr`]: AmxImage::ptr
pub struct AmxImage {
    #[allow(dead_code)] // owns the storage the instance points into
    buf: Box<[Cell]>,
    amx: Box<Amx>,
}

impl AmxImage {
    /// A raw view over the instance. Valid while the image is alive.
    pub fn ptr(&mut self) -> AmxPtr {
        unsafe { AmxPtr::new(&mut *self.amx) }
    }

    pub fn amx(&mut self) -> &mut Amx {
        &mut self.amx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::{errors, AMX_EXEC_MAIN};

    #[test]
    fn test_build_layout() {
        let mut image = AmxImageBuilder::new()
            .code(&[46, 48]) // PROC; RETN
            .data(&[1, 2, 3])
            .public("entry", 0)
            .native("clock")
            .build();
        let ptr = image.ptr();
        let hdr = ptr.header();
        assert_eq!(hdr.magic, AMX_MAGIC);
        assert_eq!(ptr.num_publics(), 1);
        assert_eq!(ptr.num_natives(), 1);
        assert_eq!(ptr.code_size(), 8);
        assert_eq!(ptr.get_public_addr(0), 0);
        assert_eq!(ptr.get_public_addr(1), 0);
        assert_eq!(ptr.get_native_name(0), Some("clock"));
        assert_eq!(ptr.get_native_addr(0), 0);
    }

    #[test]
    fn test_main_entry() {
        let mut image = AmxImageBuilder::new().code(&[46, 48]).main(0).build();
        let ptr = image.ptr();
        assert_eq!(ptr.get_public_addr(AMX_EXEC_MAIN), 0);

        let mut no_main = AmxImageBuilder::new().code(&[46, 48]).build();
        assert_eq!(no_main.ptr().get_public_addr(AMX_EXEC_MAIN), 0);
    }

    #[test]
    fn test_relocation_round_trip() {
        // JUMP +8; NOP; NOP: the operand must come back out relative.
        let mut image = AmxImageBuilder::new().code(&[51, 8, 134, 134]).build();
        let ptr = image.ptr();
        let operand = ptr.read_code_cell(4).unwrap();
        let code_base = ptr.code_ptr() as usize as u32;
        assert_eq!((operand as u32).wrapping_sub(code_base), 8);
    }

    #[test]
    fn test_natives_flag() {
        let mut with = AmxImageBuilder::new().code(&[46, 48]).native("f").build();
        assert_eq!(with.amx().flags & flags::NTVREG, 0);

        let mut without = AmxImageBuilder::new().code(&[46, 48]).build();
        assert_ne!(without.amx().flags & flags::NTVREG, 0);
    }

    #[test]
    fn test_push_args() {
        let mut image = AmxImageBuilder::new().code(&[46, 48]).build();
        let ptr = image.ptr();
        let stk_before = image.amx().stk;
        ptr.push(42).unwrap();
        assert_eq!(image.amx().stk, stk_before - 4);
        assert_eq!(image.amx().paramcount, 1);

        image.amx().stk = image.amx().hea;
        assert_eq!(ptr.push(1), Err(errors::STACKERR));
    }
}

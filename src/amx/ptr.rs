//! Raw access to a loaded AMX program image.
//!
//! [`AmxPtr`] is a copyable, non-owning view over an [`Amx`] instance and the
//! image behind it. It bundles the lookups the JIT needs at compile time
//! (code section reads, native names) and at run time (public and native
//! resolution, invoked from generated code through `extern "C"` shims).
//!
//! All multi-byte image reads go through `read_unaligned`; the image is only
//! required to be byte-addressable.

use std::ffi::{c_char, CStr};

use super::{errors, flags, Amx, AmxFuncStub, AmxHeader, Cell, AMX_EXEC_MAIN, CELL_SIZE};

/// Signature of a host-implemented native function.
///
/// `params[0]` holds the argument size in bytes; `params[1..]` are the
/// cell-sized arguments.
pub type AmxNativeFn = unsafe extern "C" fn(amx: *mut Amx, params: *const Cell) -> Cell;

/// A non-owning view over an AMX instance.
#[derive(Clone, Copy)]
pub struct AmxPtr {
    raw: *mut Amx,
}

impl AmxPtr {
    /// Wrap a raw instance pointer.
    ///
    /// # Safety
    ///
    /// `raw` must point to a live [`Amx`] whose `base` points to a valid
    /// program image (header, code, data, tables, names) that stays
    /// allocated and unmoved for as long as the view or anything compiled
    /// from it is used.
    pub unsafe fn new(raw: *mut Amx) -> AmxPtr {
        AmxPtr { raw }
    }

    /// The underlying instance pointer.
    pub fn amx(self) -> *mut Amx {
        self.raw
    }

    fn base(&self) -> *mut u8 {
        unsafe { (*self.raw).base }
    }

    /// A copy of the image header.
    pub fn header(&self) -> AmxHeader {
        unsafe { (self.base() as *const AmxHeader).read_unaligned() }
    }

    /// Host address of the first code byte.
    pub fn code_ptr(&self) -> *const u8 {
        unsafe { self.base().add(self.header().cod as usize) }
    }

    /// Size of the code section in bytes.
    pub fn code_size(&self) -> usize {
        let hdr = self.header();
        (hdr.dat - hdr.cod) as usize
    }

    /// Host address of the first data byte (`data`, or derived from the
    /// image when `data` is null).
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe {
            let data = (*self.raw).data;
            if !data.is_null() {
                data
            } else {
                self.base().add(self.header().dat as usize)
            }
        }
    }

    /// Read one cell from the code section, `offset` bytes in. `None` when
    /// the read would leave the section.
    pub fn read_code_cell(&self, offset: Cell) -> Option<Cell> {
        let offset = offset as usize;
        if offset % CELL_SIZE != 0 || offset + CELL_SIZE > self.code_size() {
            return None;
        }
        unsafe { Some((self.code_ptr().add(offset) as *const Cell).read_unaligned()) }
    }

    /// Number of entries in the publics table.
    pub fn num_publics(&self) -> usize {
        let hdr = self.header();
        ((hdr.natives - hdr.publics) / hdr.defsize as i32) as usize
    }

    /// Number of entries in the natives table.
    pub fn num_natives(&self) -> usize {
        let hdr = self.header();
        ((hdr.libraries - hdr.natives) / hdr.defsize as i32) as usize
    }

    fn table_entry(&self, table_offset: i32, index: usize) -> *mut AmxFuncStub {
        unsafe {
            self.base()
                .add(table_offset as usize + index * std::mem::size_of::<AmxFuncStub>())
                as *mut AmxFuncStub
        }
    }

    fn entry_name(&self, stub: &AmxFuncStub) -> Option<&str> {
        unsafe {
            let name = self.base().add(stub.nameofs as usize) as *const c_char;
            CStr::from_ptr(name).to_str().ok()
        }
    }

    /// Code-relative address of a public function, or zero on a bad index.
    /// [`AMX_EXEC_MAIN`] selects the program's `main` entry point.
    pub fn get_public_addr(&self, index: i32) -> Cell {
        if index == AMX_EXEC_MAIN {
            let cip = self.header().cip;
            return if cip >= 0 { cip } else { 0 };
        }
        if index < 0 || index as usize >= self.num_publics() {
            return 0;
        }
        let stub = unsafe { self.table_entry(self.header().publics, index as usize).read_unaligned() };
        stub.address as Cell
    }

    /// Registered host address of a native function, or zero when the index
    /// is bad or the native has not been registered.
    pub fn get_native_addr(&self, index: i32) -> Cell {
        if index < 0 || index as usize >= self.num_natives() {
            return 0;
        }
        let stub = unsafe { self.table_entry(self.header().natives, index as usize).read_unaligned() };
        stub.address as Cell
    }

    /// Name of a native, or `None` on a bad index.
    pub fn get_native_name(&self, index: i32) -> Option<&str> {
        if index < 0 || index as usize >= self.num_natives() {
            return None;
        }
        let stub = unsafe { self.table_entry(self.header().natives, index as usize).read_unaligned() };
        self.entry_name(&stub)
    }

    /// Reverse lookup: the index of the native registered at `address`, or
    /// `-1` when no native matches.
    pub fn find_native(&self, address: Cell) -> i32 {
        if address == 0 {
            return -1;
        }
        for index in 0..self.num_natives() {
            let stub = unsafe { self.table_entry(self.header().natives, index).read_unaligned() };
            if stub.address as Cell == address {
                return index as i32;
            }
        }
        -1
    }

    /// Register host implementations for the program's natives by name.
    ///
    /// Unknown names are ignored; natives already registered keep their
    /// address. When every native table entry has an address afterwards the
    /// natives-registered flag is set, which `exec` requires. Returns the
    /// number of entries that remain unresolved.
    pub fn register_natives(&self, natives: &[(&str, AmxNativeFn)]) -> usize {
        let table = self.header().natives;
        let mut missing = 0;
        for index in 0..self.num_natives() {
            let entry = self.table_entry(table, index);
            let mut stub = unsafe { entry.read_unaligned() };
            if stub.address == 0 {
                let name = self.entry_name(&stub);
                let found = natives
                    .iter()
                    .find(|(n, _)| Some(*n) == name)
                    .map(|(_, f)| *f as usize as u32);
                match found {
                    Some(addr) => {
                        stub.address = addr;
                        unsafe { entry.write_unaligned(stub) };
                    }
                    None => missing += 1,
                }
            }
        }
        if missing == 0 {
            unsafe { (*self.raw).flags |= flags::NTVREG };
        }
        missing
    }

    /// Push one argument cell for the next `exec` call.
    pub fn push(&self, value: Cell) -> Result<(), i32> {
        unsafe {
            let amx = &mut *self.raw;
            if amx.stk <= amx.hea {
                return Err(errors::STACKERR);
            }
            amx.stk -= CELL_SIZE as Cell;
            let slot = self.data_ptr().add(amx.stk as usize) as *mut Cell;
            slot.write_unaligned(value);
            amx.paramcount += 1;
        }
        Ok(())
    }
}

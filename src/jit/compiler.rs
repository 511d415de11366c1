//! AMX bytecode to 32-bit x86 translation.
//!
//! The compiler makes one linear pass over the program. The emitted block
//! starts with a fixed runtime-data header (pointers and the instruction-map
//! descriptor), followed by the reserved instruction map, the runtime
//! trampolines, and finally the translated body of every instruction.
//!
//! Inside generated code the register contract is fixed at every instruction
//! boundary:
//!
//! - `eax` is PRI and `ecx` is ALT, the two VM registers
//! - `ebx` holds the host address of the data section
//! - `ebp` is `data + frm` and `esp` is `data + stk`
//!
//! The VM stack *is* the host stack while compiled code runs; the
//! trampolines switch between it and the host's own stack on entry, on
//! native calls and on abort.

use std::collections::{HashMap, HashSet};
use std::mem::offset_of;

use crate::amx::opcode::Opcode as Op;
use crate::amx::{errors, flags, Amx, AmxDisassembler, AmxHeader, AmxInstruction, AmxPtr, Cell};

use super::codebuf::{CodeBuffer, CodeError, Label};
use super::intrinsics;
use super::memory::{ExecutableMemory, MemoryError};
use super::x86::{Cond, Reg, X86Assembler};

const AMX_FRM: i32 = offset_of!(Amx, frm) as i32;
const AMX_HEA: i32 = offset_of!(Amx, hea) as i32;
const AMX_HLW: i32 = offset_of!(Amx, hlw) as i32;
const AMX_STK: i32 = offset_of!(Amx, stk) as i32;
const AMX_STP: i32 = offset_of!(Amx, stp) as i32;
const AMX_BASE: i32 = offset_of!(Amx, base) as i32;
const AMX_DATA: i32 = offset_of!(Amx, data) as i32;
const AMX_FLAGS: i32 = offset_of!(Amx, flags) as i32;
const AMX_ERROR: i32 = offset_of!(Amx, error) as i32;
const AMX_PARAMCOUNT: i32 = offset_of!(Amx, paramcount) as i32;
const HDR_COD: i32 = offset_of!(AmxHeader, cod) as i32;
const HDR_DAT: i32 = offset_of!(AmxHeader, dat) as i32;

/// Word slots at the start of the emitted block. Slots 2 through 5 are only
/// ever addressed through their labels.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
enum RuntimeData {
    ExecPtr = 0,
    AmxPtr = 1,
    Ebp = 2,
    Esp = 3,
    ResetEbp = 4,
    ResetEsp = 5,
    InstrMapSize = 6,
    InstrMapPtr = 7,
}

/// Emitted instruction-map entries are two 32-bit words: the bytecode
/// address, then the native address.
const INSTR_MAP_ENTRY_SIZE: usize = 8;

/// One instruction-map record as generated code reads it at run time.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InstrMapEntry {
    pub amx_addr: Cell,
    pub jit_addr: *const u8,
}

/// Signature of the `exec` entry point stored in slot 0 of the block.
pub type AmxExecFn = unsafe extern "C" fn(index: i32, retval: *mut Cell) -> i32;

type GetAddrFn = unsafe extern "C" fn(*mut Amx, i32) -> Cell;
type GetInstrPtrFn = unsafe extern "C" fn(Cell, *const InstrMapEntry, u32) -> *const u8;

/// Error type for compilation.
#[derive(Debug)]
pub enum CompileError {
    /// The disassembler stopped on malformed bytecode.
    MalformedBytecode,
    /// An instruction the translator cannot compile, carried for
    /// diagnostics.
    UnsupportedInstruction(AmxInstruction),
    Code(CodeError),
    Memory(MemoryError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::MalformedBytecode => write!(f, "malformed bytecode"),
            CompileError::UnsupportedInstruction(instr) => {
                write!(f, "unsupported instruction: {}", instr)
            }
            CompileError::Code(e) => write!(f, "{}", e),
            CompileError::Memory(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<CodeError> for CompileError {
    fn from(e: CodeError) -> CompileError {
        CompileError::Code(e)
    }
}

impl From<MemoryError> for CompileError {
    fn from(e: MemoryError) -> CompileError {
        CompileError::Memory(e)
    }
}

// ==================== Runtime support functions ====================
//
// Generated code calls back into these over plain cdecl. They must stay
// leaf-like: no allocation, no panicking paths.

unsafe extern "C" fn get_public_addr(amx: *mut Amx, index: i32) -> Cell {
    unsafe { AmxPtr::new(amx).get_public_addr(index) }
}

unsafe extern "C" fn get_native_addr(amx: *mut Amx, index: i32) -> Cell {
    unsafe { AmxPtr::new(amx).get_native_addr(index) }
}

fn lookup_instr(entries: &[InstrMapEntry], address: Cell) -> *const u8 {
    match entries.binary_search_by_key(&address, |e| e.amx_addr) {
        Ok(i) => entries[i].jit_addr,
        Err(_) => std::ptr::null(),
    }
}

unsafe extern "C" fn get_instr_ptr(
    address: Cell,
    instr_map: *const InstrMapEntry,
    instr_map_size: u32,
) -> *const u8 {
    let entries = unsafe { std::slice::from_raw_parts(instr_map, instr_map_size as usize) };
    lookup_instr(entries, address)
}

/// Convert an image address back to a code-relative one. Wrapping 32-bit
/// arithmetic, the inverse of the loader's relocation.
fn rel_code_addr(amx: AmxPtr, address: Cell) -> Cell {
    (address as u32).wrapping_sub(amx.code_ptr() as usize as u32) as Cell
}

fn set_runtime_data(buf: &mut CodeBuffer, slot: RuntimeData, value: u32) {
    buf.set_u32(slot as usize * 4, value);
}

/// Labels shared between the trampolines and the translated body.
#[derive(Clone, Copy)]
struct LabelEnv {
    amx: Label,
    ebp: Label,
    esp: Label,
    reset_ebp: Label,
    reset_esp: Label,
    instr_map_size: Label,
    instr_map: Label,
    exec_helper: Label,
    halt_helper: Label,
    jump_helper: Label,
    sysreq_c_helper: Label,
    sysreq_d_helper: Label,
    do_halt: Label,
}

fn emit_get_amx_ptr(asm: &mut X86Assembler, env: LabelEnv, reg: Reg) {
    asm.mov_rm_abs(reg, env.amx);
}

/// Load the data section base into `reg`, deriving it from the image when
/// the instance's `data` field is null. Clobbers eax.
fn emit_get_amx_data_ptr(asm: &mut X86Assembler, env: LabelEnv, reg: Reg) {
    let l_quit = asm.buf().new_label();

    emit_get_amx_ptr(asm, env, Reg::Eax);
    asm.mov_rm(reg, Reg::Eax, AMX_DATA);
    asm.cmp_ri(reg, 0);
    asm.jcc(Cond::Ne, l_quit);

    asm.mov_rm(reg, Reg::Eax, AMX_BASE);
    asm.mov_rm(Reg::Eax, reg, HDR_DAT);
    asm.add_rr(reg, Reg::Eax);

    asm.buf().bind(l_quit);
}

/// The owned result of a compilation: one executable block holding the
/// runtime header, the instruction map, the trampolines and the translated
/// code. Dropping it releases the block.
pub struct JitOutput {
    memory: ExecutableMemory,
    code_size: usize,
}

impl JitOutput {
    /// Base address of the block.
    pub fn code_ptr(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    /// Bytes of code emitted (the backing allocation is page-rounded).
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.memory.as_ptr().add(offset), bytes.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(bytes)
    }

    /// Absolute address of the `exec` trampoline, from slot 0.
    pub fn exec_ptr(&self) -> usize {
        self.read_u32(RuntimeData::ExecPtr as usize * 4) as usize
    }

    /// Decoded copy of the embedded instruction map as
    /// (bytecode address, native address) pairs.
    pub fn instr_map_entries(&self) -> Vec<(Cell, u32)> {
        let size = self.read_u32(RuntimeData::InstrMapSize as usize * 4) as usize;
        let map_abs = self.read_u32(RuntimeData::InstrMapPtr as usize * 4);
        let map_off = map_abs.wrapping_sub(self.memory.as_ptr() as usize as u32) as usize;
        (0..size)
            .map(|i| {
                let off = map_off + i * INSTR_MAP_ENTRY_SIZE;
                (self.read_u32(off) as Cell, self.read_u32(off + 4))
            })
            .collect()
    }

    /// Call a public function through the compiled `exec` entry point.
    ///
    /// # Safety
    ///
    /// The AMX instance this block was compiled for must still be alive, and
    /// no other thread may be executing this block.
    #[cfg(target_arch = "x86")]
    pub unsafe fn exec(&self, index: i32, retval: *mut Cell) -> i32 {
        let f: AmxExecFn = unsafe { std::mem::transmute(self.exec_ptr()) };
        unsafe { f(index, retval) }
    }
}

/// One-shot compiler for a single AMX instance.
pub struct JitCompiler {
    amx: AmxPtr,
    buf: CodeBuffer,
    env: LabelEnv,
    amx_labels: HashMap<Cell, Label>,
    instr_map: Vec<(Cell, usize)>,
    exec_offset: usize,
    map_offset: usize,
}

impl JitCompiler {
    pub fn new(amx: AmxPtr) -> JitCompiler {
        let mut buf = CodeBuffer::with_capacity(4096 + amx.code_size() * 16);
        let env = LabelEnv {
            amx: buf.new_label(),
            ebp: buf.new_label(),
            esp: buf.new_label(),
            reset_ebp: buf.new_label(),
            reset_esp: buf.new_label(),
            instr_map_size: buf.new_label(),
            instr_map: buf.new_label(),
            exec_helper: buf.new_label(),
            halt_helper: buf.new_label(),
            jump_helper: buf.new_label(),
            sysreq_c_helper: buf.new_label(),
            sysreq_d_helper: buf.new_label(),
            do_halt: buf.new_label(),
        };
        JitCompiler {
            amx,
            buf,
            env,
            amx_labels: HashMap::new(),
            instr_map: Vec::new(),
            exec_offset: 0,
            map_offset: 0,
        }
    }

    /// Translate the whole program and finalize it into an executable block.
    pub fn compile(self) -> Result<JitOutput, CompileError> {
        self.assemble()?.finish()
    }

    /// Emit everything into the code buffer. Split from [`finish`] so the
    /// base-independent output can be inspected.
    ///
    /// [`finish`]: JitCompiler::finish
    fn assemble(mut self) -> Result<JitCompiler, CompileError> {
        self.emit_runtime_data();
        self.reserve_instr_map();

        self.buf.bind(self.env.exec_helper);
        self.emit_exec_helper();
        self.emit_exec();
        self.buf.bind(self.env.halt_helper);
        self.emit_halt_helper();
        self.buf.bind(self.env.jump_helper);
        self.emit_jump_helper();
        self.buf.bind(self.env.sysreq_d_helper);
        self.emit_sysreq_d_helper();
        self.buf.bind(self.env.sysreq_c_helper);
        self.emit_sysreq_c_helper();

        let jump_targets = collect_jump_targets(self.amx);

        let mut disas = AmxDisassembler::new(self.amx);
        while let Some(instr) = disas.decode() {
            let cip = instr.address();

            if instr.opcode() == Op::Proc {
                self.buf.align(16, 0x90);
            }
            if jump_targets.contains(&cip) {
                let label = amx_label(&mut self.amx_labels, &mut self.buf, cip);
                self.buf.bind(label);
            }

            // The disassembler walks forward, so the map stays sorted.
            debug_assert!(self.instr_map.last().map_or(true, |(a, _)| *a < cip));
            self.instr_map.push((cip, self.buf.offset()));

            self.translate(&instr)?;
        }
        if disas.had_error() {
            return Err(CompileError::MalformedBytecode);
        }

        // Shared abort exit; the error code was placed in ALT.
        self.buf.bind(self.env.do_halt);
        let env = self.env;
        let mut asm = X86Assembler::new(&mut self.buf);
        asm.push_r(Reg::Ecx);
        asm.call(env.halt_helper);

        Ok(self)
    }

    /// Move the buffer into executable memory and relocate the
    /// base-dependent header slots and instruction-map entries.
    fn finish(self) -> Result<JitOutput, CompileError> {
        let code_size = self.buf.len();
        let mut memory = self.buf.into_memory()?;
        let base = memory.as_ptr() as usize as u32;

        let exec_abs = base.wrapping_add(self.exec_offset as u32);
        memory.write(RuntimeData::ExecPtr as usize * 4, &exec_abs.to_le_bytes())?;
        let map_abs = base.wrapping_add(self.map_offset as u32);
        memory.write(RuntimeData::InstrMapPtr as usize * 4, &map_abs.to_le_bytes())?;

        for (i, (amx_addr, offset)) in self.instr_map.iter().enumerate() {
            let entry = self.map_offset + i * INSTR_MAP_ENTRY_SIZE;
            memory.write(entry, &(*amx_addr as u32).to_le_bytes())?;
            let native = base.wrapping_add(*offset as u32);
            memory.write(entry + 4, &native.to_le_bytes())?;
        }

        memory.make_executable()?;
        Ok(JitOutput { memory, code_size })
    }

    /// Emit the runtime-data header: eight zeroed word slots, each
    /// addressable from code through its label.
    fn emit_runtime_data(&mut self) {
        let slots = [
            None, // exec_ptr, patched in finish()
            Some(self.env.amx),
            Some(self.env.ebp),
            Some(self.env.esp),
            Some(self.env.reset_ebp),
            Some(self.env.reset_esp),
            Some(self.env.instr_map_size),
            Some(self.env.instr_map),
        ];
        for slot in slots {
            if let Some(label) = slot {
                self.buf.bind(label);
            }
            self.buf.emit_u32(0);
        }
        let amx_ptr = self.amx.amx() as usize as u32;
        set_runtime_data(&mut self.buf, RuntimeData::AmxPtr, amx_ptr);
    }

    /// Count the program's instructions and reserve the map region right
    /// after the header. Entries are filled in by [`finish`].
    ///
    /// [`finish`]: JitCompiler::finish
    fn reserve_instr_map(&mut self) {
        let mut disas = AmxDisassembler::new(self.amx);
        let mut size = 0u32;
        while disas.decode().is_some() {
            size += 1;
        }

        self.map_offset = self.buf.offset();
        set_runtime_data(&mut self.buf, RuntimeData::InstrMapSize, size);
        set_runtime_data(&mut self.buf, RuntimeData::InstrMapPtr, self.map_offset as u32);
        for _ in 0..size as usize * INSTR_MAP_ENTRY_SIZE {
            self.buf.emit_u8(0);
        }
    }

    // int exec(cell index, cell *retval);
    //
    // The only entry point the host calls. Validates the instance, resolves
    // the public's native entry, pushes the argument-count cell and runs the
    // function through exec_helper. Returns the AMX error code and writes
    // the public's return value through retval.
    fn emit_exec(&mut self) {
        self.exec_offset = self.buf.offset();
        set_runtime_data(&mut self.buf, RuntimeData::ExecPtr, self.exec_offset as u32);

        let env = self.env;
        let mut asm = X86Assembler::new(&mut self.buf);

        let l_check_heap = asm.buf().new_label();
        let l_check_stack = asm.buf().new_label();
        let l_check_natives = asm.buf().new_label();
        let l_checks_done = asm.buf().new_label();
        let l_do_call = asm.buf().new_label();
        let l_entry_found = asm.buf().new_label();
        let l_cleanup = asm.buf().new_label();
        let l_fail = asm.buf().new_label();
        let l_return = asm.buf().new_label();

        // Frame layout relative to ebp.
        const ARG_INDEX: i32 = 8;
        const ARG_RETVAL: i32 = 12;
        const VAR_ADDRESS: i32 = -4;
        const VAR_RESET_EBP: i32 = -8;
        const VAR_RESET_ESP: i32 = -12;

        asm.push_r(Reg::Ebp);
        asm.mov_rr(Reg::Ebp, Reg::Esp);
        asm.sub_ri(Reg::Esp, 12); // locals

        asm.push_r(Reg::Esi);
        emit_get_amx_ptr(&mut asm, env, Reg::Esi);

        // Translated code expects the data pointer in ebx.
        asm.push_r(Reg::Ebx);
        emit_get_amx_data_ptr(&mut asm, env, Reg::Ebx);

        // if (amx->hea >= amx->stk) return AMX_ERR_STACKERR;
        asm.mov_rm(Reg::Ecx, Reg::Esi, AMX_HEA);
        asm.mov_rm(Reg::Edx, Reg::Esi, AMX_STK);
        asm.cmp_rr(Reg::Ecx, Reg::Edx);
        asm.jcc(Cond::L, l_check_heap);
        asm.mov_ri(Reg::Eax, errors::STACKERR);
        asm.jmp(l_fail);

        // if (amx->hea < amx->hlw) return AMX_ERR_HEAPLOW;
        asm.buf().bind(l_check_heap);
        asm.mov_rm(Reg::Ecx, Reg::Esi, AMX_HEA);
        asm.mov_rm(Reg::Edx, Reg::Esi, AMX_HLW);
        asm.cmp_rr(Reg::Ecx, Reg::Edx);
        asm.jcc(Cond::Ge, l_check_stack);
        asm.mov_ri(Reg::Eax, errors::HEAPLOW);
        asm.jmp(l_fail);

        // if (amx->stk > amx->stp) return AMX_ERR_STACKLOW;
        asm.buf().bind(l_check_stack);
        asm.mov_rm(Reg::Ecx, Reg::Esi, AMX_STK);
        asm.mov_rm(Reg::Edx, Reg::Esi, AMX_STP);
        asm.cmp_rr(Reg::Ecx, Reg::Edx);
        asm.jcc(Cond::Le, l_check_natives);
        asm.mov_ri(Reg::Eax, errors::STACKLOW);
        asm.jmp(l_fail);

        // if ((amx->flags & AMX_FLAG_NTVREG) == 0) return AMX_ERR_NOTFOUND;
        asm.buf().bind(l_check_natives);
        asm.mov_rm(Reg::Ecx, Reg::Esi, AMX_FLAGS);
        asm.and_ri(Reg::Ecx, flags::NTVREG);
        asm.cmp_ri(Reg::Ecx, 0);
        asm.jcc(Cond::Ne, l_checks_done);
        asm.mov_ri(Reg::Eax, errors::NOTFOUND);
        asm.jmp(l_fail);

        asm.buf().bind(l_checks_done);
        asm.mov_mi(Reg::Esi, AMX_ERROR, errors::NONE);

        // Resolve the public's bytecode address.
        asm.push_m(Reg::Ebp, ARG_INDEX);
        emit_get_amx_ptr(&mut asm, env, Reg::Eax);
        asm.push_r(Reg::Eax);
        asm.call_addr(get_public_addr as GetAddrFn as usize);
        asm.add_ri(Reg::Esp, 8);

        asm.cmp_ri(Reg::Eax, 0);
        asm.jcc(Cond::Ne, l_do_call);
        asm.mov_ri(Reg::Eax, errors::INDEX);
        asm.jmp(l_fail);

        // Resolve its native entry through the instruction map.
        asm.buf().bind(l_do_call);
        asm.push_m_abs(env.instr_map_size);
        asm.push_m_abs(env.instr_map);
        asm.push_r(Reg::Eax);
        asm.call_addr(get_instr_ptr as GetInstrPtrFn as usize);
        asm.add_ri(Reg::Esp, 12);

        asm.cmp_ri(Reg::Eax, 0);
        asm.jcc(Cond::Ne, l_entry_found);
        asm.mov_ri(Reg::Eax, errors::INDEX);
        asm.jmp(l_fail);

        asm.buf().bind(l_entry_found);
        asm.mov_mr(Reg::Ebp, VAR_ADDRESS, Reg::Eax);

        // Push the argument-size cell and reset the parameter count:
        //   stk -= sizeof(cell); *(data + stk) = paramcount * sizeof(cell);
        asm.mov_rm(Reg::Eax, Reg::Esi, AMX_PARAMCOUNT);
        asm.imul_ri(Reg::Eax, 4);
        asm.mov_rm(Reg::Ecx, Reg::Esi, AMX_STK);
        asm.sub_ri(Reg::Ecx, 4);
        asm.mov_mr_sib(Reg::Ebx, Reg::Ecx, Reg::Eax);
        asm.mov_mr(Reg::Esi, AMX_STK, Reg::Ecx);
        asm.mov_mi(Reg::Esi, AMX_PARAMCOUNT, 0);

        // Keep the outer reset_ebp/reset_esp in locals for re-entrancy.
        asm.mov_rm_abs(Reg::Eax, env.reset_ebp);
        asm.mov_mr(Reg::Ebp, VAR_RESET_EBP, Reg::Eax);
        asm.mov_rm_abs(Reg::Eax, env.reset_esp);
        asm.mov_mr(Reg::Ebp, VAR_RESET_ESP, Reg::Eax);

        asm.push_m(Reg::Ebp, VAR_ADDRESS);
        asm.call(env.exec_helper);
        asm.add_ri(Reg::Esp, 4);

        // Store the return value if retval is non-null.
        asm.mov_rm(Reg::Ecx, Reg::Ebp, ARG_RETVAL);
        asm.cmp_ri(Reg::Ecx, 0);
        asm.jcc(Cond::E, l_cleanup);
        asm.mov_mr(Reg::Ecx, 0, Reg::Eax);

        asm.buf().bind(l_cleanup);
        asm.mov_rm(Reg::Eax, Reg::Ebp, VAR_RESET_EBP);
        asm.mov_mr_abs(env.reset_ebp, Reg::Eax);
        asm.mov_rm(Reg::Eax, Reg::Ebp, VAR_RESET_ESP);
        asm.mov_mr_abs(env.reset_esp, Reg::Eax);

        // Swap the error code out so a HALT result is returned verbatim.
        asm.mov_ri(Reg::Eax, errors::NONE);
        asm.xchg_mr(Reg::Esi, AMX_ERROR, Reg::Eax);
        asm.jmp(l_return);

        // Early exits record their error code in the instance as well.
        asm.buf().bind(l_fail);
        asm.mov_mr(Reg::Esi, AMX_ERROR, Reg::Eax);

        asm.buf().bind(l_return);
        asm.pop_r(Reg::Ebx);
        asm.pop_r(Reg::Esi);
        asm.mov_rr(Reg::Esp, Reg::Ebp);
        asm.pop_r(Reg::Ebp);
        asm.ret();
    }

    // cell exec_helper(void *address);
    //
    // Switches from the host stack to the VM stack, runs the function, and
    // writes the final frm/stk back into the instance.
    fn emit_exec_helper(&mut self) {
        let env = self.env;
        let mut asm = X86Assembler::new(&mut self.buf);

        asm.mov_rm(Reg::Eax, Reg::Esp, 4);

        // esi and edi are used freely by translated code (MOVS and friends).
        asm.push_r(Reg::Esi);
        asm.push_r(Reg::Edi);
        asm.push_r(Reg::Ebx);
        asm.push_r(Reg::Ecx);
        asm.push_r(Reg::Edx);

        // The previous saved frame/stack go on the host stack, the current
        // ones into the header slots.
        asm.push_m_abs(env.ebp);
        asm.push_m_abs(env.esp);
        asm.mov_mr_abs(env.ebp, Reg::Ebp);
        asm.mov_mr_abs(env.esp, Reg::Esp);

        // ebp = data + frm, esp = data + stk.
        emit_get_amx_ptr(&mut asm, env, Reg::Ecx);
        asm.mov_rm(Reg::Edx, Reg::Ecx, AMX_FRM);
        asm.lea_sib(Reg::Ebp, Reg::Ebx, Reg::Edx);
        asm.mov_rm(Reg::Edx, Reg::Ecx, AMX_STK);
        asm.lea_sib(Reg::Esp, Reg::Ebx, Reg::Edx);

        // Arrange the reset snapshot as if the function were called from
        // right here, so halt_helper can unwind to this frame.
        asm.lea(Reg::Ecx, Reg::Esp, -4);
        asm.mov_mr_abs(env.reset_esp, Reg::Ecx);
        asm.mov_mr_abs(env.reset_ebp, Reg::Ebp);

        asm.call_r(Reg::Eax);

        // RETN pops the arguments, so frm/stk must be written back.
        emit_get_amx_ptr(&mut asm, env, Reg::Eax);
        asm.mov_rr(Reg::Edx, Reg::Ebp);
        asm.sub_rr(Reg::Edx, Reg::Ebx);
        asm.mov_mr(Reg::Eax, AMX_FRM, Reg::Edx);
        asm.mov_rr(Reg::Edx, Reg::Esp);
        asm.sub_rr(Reg::Edx, Reg::Ebx);
        asm.mov_mr(Reg::Eax, AMX_STK, Reg::Edx);

        // Back to the host stack.
        asm.mov_rm_abs(Reg::Ebp, env.ebp);
        asm.mov_rm_abs(Reg::Esp, env.esp);
        asm.pop_m_abs(env.esp);
        asm.pop_m_abs(env.ebp);

        asm.pop_r(Reg::Edx);
        asm.pop_r(Reg::Ecx);
        asm.pop_r(Reg::Ebx);
        asm.pop_r(Reg::Edi);
        asm.pop_r(Reg::Esi);
        asm.ret();
    }

    // void halt_helper(int error);
    //
    // Stores the error, rewinds both stack registers to the snapshot taken
    // in exec_helper, pops the public's argument block and returns straight
    // to exec_helper's call site.
    fn emit_halt_helper(&mut self) {
        let env = self.env;
        let mut asm = X86Assembler::new(&mut self.buf);

        asm.mov_rm(Reg::Eax, Reg::Esp, 4);
        emit_get_amx_ptr(&mut asm, env, Reg::Ecx);
        asm.mov_mr(Reg::Ecx, AMX_ERROR, Reg::Eax);

        asm.mov_rm_abs(Reg::Esp, env.reset_esp);
        asm.mov_rm_abs(Reg::Ebp, env.reset_ebp);

        // Pop the argument-size cell and the arguments, as RETN would.
        asm.pop_r(Reg::Eax);
        asm.add_rm(Reg::Esp, Reg::Esp, 0);
        asm.add_ri(Reg::Esp, 4);
        asm.push_r(Reg::Eax);

        asm.ret();
    }

    // void jump_helper(void *address, void *stack_base, void *stack_ptr);
    //
    // Indirect transfer used by JUMP_PRI and SCTRL 6. An address with no
    // native entry falls through as if no jump happened, matching the
    // reference VM.
    fn emit_jump_helper(&mut self) {
        let env = self.env;
        let mut asm = X86Assembler::new(&mut self.buf);

        let l_do_jump = asm.buf().new_label();

        asm.mov_rm(Reg::Eax, Reg::Esp, 4);

        asm.push_m_abs(env.instr_map_size);
        asm.push_m_abs(env.instr_map);
        asm.push_r(Reg::Eax);
        asm.call_addr(get_instr_ptr as GetInstrPtrFn as usize);
        asm.add_ri(Reg::Esp, 12);

        asm.cmp_ri(Reg::Eax, 0);
        asm.jcc(Cond::Ne, l_do_jump);
        asm.ret();

        asm.buf().bind(l_do_jump);
        asm.mov_rm(Reg::Ebp, Reg::Esp, 8);
        asm.mov_rm(Reg::Esp, Reg::Esp, 12);
        asm.jmp_r(Reg::Eax);
    }

    // cell sysreq_c_helper(int index, void *stack_base, void *stack_ptr);
    //
    // Resolves the native's address and hands over to sysreq_d_helper. The
    // epilogue only runs on the not-found path; on success sysreq_d_helper
    // returns directly into translated code.
    fn emit_sysreq_c_helper(&mut self) {
        let env = self.env;
        let mut asm = X86Assembler::new(&mut self.buf);

        let l_call = asm.buf().new_label();
        let l_return = asm.buf().new_label();

        const ARG_INDEX: i32 = 8;
        const ARG_STACK_BASE: i32 = 12;
        const ARG_STACK_PTR: i32 = 16;

        asm.push_r(Reg::Ebp);
        asm.mov_rr(Reg::Ebp, Reg::Esp);

        asm.push_m(Reg::Ebp, ARG_INDEX);
        emit_get_amx_ptr(&mut asm, env, Reg::Eax);
        asm.push_r(Reg::Eax);
        asm.call_addr(get_native_addr as GetAddrFn as usize);
        asm.add_ri(Reg::Esp, 8);

        asm.cmp_ri(Reg::Eax, 0);
        asm.jcc(Cond::Ne, l_call);
        asm.mov_ri(Reg::Eax, errors::NOTFOUND);
        asm.jmp(l_return);

        asm.buf().bind(l_call);
        asm.push_m(Reg::Ebp, ARG_STACK_PTR);
        asm.push_m(Reg::Ebp, ARG_STACK_BASE);
        asm.push_r(Reg::Eax);
        asm.call(env.sysreq_d_helper);
        asm.add_ri(Reg::Esp, 12);

        asm.buf().bind(l_return);
        asm.mov_rr(Reg::Esp, Reg::Ebp);
        asm.pop_r(Reg::Ebp);
        asm.ret();
    }

    // cell sysreq_d_helper(void *address, void *stack_base, void *stack_ptr);
    //
    // Switches to the host stack, invokes the native as native(amx, params)
    // with params pointing into the VM stack, switches back, and resumes at
    // the instruction after the original call.
    fn emit_sysreq_d_helper(&mut self) {
        let env = self.env;
        let mut asm = X86Assembler::new(&mut self.buf);

        asm.mov_rm(Reg::Eax, Reg::Esp, 4); // address
        asm.mov_rm(Reg::Ebp, Reg::Esp, 8); // stack_base
        asm.mov_rm(Reg::Esp, Reg::Esp, 12); // stack_ptr
        asm.mov_rr(Reg::Ecx, Reg::Esp); // params
        asm.mov_rm(Reg::Esi, Reg::Esp, -16); // return address into JIT code

        emit_get_amx_ptr(&mut asm, env, Reg::Edx);

        // Write frm/stk back and restore the host stack registers.
        asm.sub_rr(Reg::Ebp, Reg::Ebx);
        asm.mov_mr(Reg::Edx, AMX_FRM, Reg::Ebp);
        asm.mov_rm_abs(Reg::Ebp, env.ebp);
        asm.sub_rr(Reg::Esp, Reg::Ebx);
        asm.mov_mr(Reg::Edx, AMX_STK, Reg::Esp);
        asm.mov_rm_abs(Reg::Esp, env.esp);

        // cell native(AMX *amx, cell *params); the result stays in eax.
        asm.push_r(Reg::Ecx);
        asm.push_r(Reg::Edx);
        asm.call_r(Reg::Eax);
        asm.add_ri(Reg::Esp, 8);

        // Back onto the VM stack.
        emit_get_amx_ptr(&mut asm, env, Reg::Edx);
        asm.mov_mr_abs(env.ebp, Reg::Ebp);
        asm.mov_rm(Reg::Ecx, Reg::Edx, AMX_FRM);
        asm.lea_sib(Reg::Ebp, Reg::Ebx, Reg::Ecx);
        asm.mov_mr_abs(env.esp, Reg::Esp);
        asm.mov_rm(Reg::Ecx, Reg::Edx, AMX_STK);
        asm.lea_sib(Reg::Esp, Reg::Ebx, Reg::Ecx);

        asm.push_r(Reg::Esi);
        asm.ret();
    }

    /// Emit the body of one instruction.
    fn translate(&mut self, instr: &AmxInstruction) -> Result<(), CompileError> {
        let env = self.env;
        let amx = self.amx;
        let labels = &mut self.amx_labels;
        let mut asm = X86Assembler::new(&mut self.buf);

        match instr.opcode() {
            Op::LoadPri => {
                // PRI = [address]
                asm.mov_rm(Reg::Eax, Reg::Ebx, instr.operand());
            }
            Op::LoadAlt => {
                // ALT = [address]
                asm.mov_rm(Reg::Ecx, Reg::Ebx, instr.operand());
            }
            Op::LoadSPri => {
                // PRI = [FRM + offset]
                asm.mov_rm(Reg::Eax, Reg::Ebp, instr.operand());
            }
            Op::LoadSAlt => {
                // ALT = [FRM + offset]
                asm.mov_rm(Reg::Ecx, Reg::Ebp, instr.operand());
            }
            Op::LrefPri => {
                // PRI = [[address]]
                asm.mov_rm(Reg::Edx, Reg::Ebx, instr.operand());
                asm.mov_rm_sib(Reg::Eax, Reg::Ebx, Reg::Edx, 0);
            }
            Op::LrefAlt => {
                // ALT = [[address]]
                asm.mov_rm(Reg::Edx, Reg::Ebx, instr.operand());
                asm.mov_rm_sib(Reg::Ecx, Reg::Ebx, Reg::Edx, 0);
            }
            Op::LrefSPri => {
                // PRI = [[FRM + offset]]
                asm.mov_rm(Reg::Edx, Reg::Ebp, instr.operand());
                asm.mov_rm_sib(Reg::Eax, Reg::Ebx, Reg::Edx, 0);
            }
            Op::LrefSAlt => {
                // ALT = [[FRM + offset]]
                asm.mov_rm(Reg::Edx, Reg::Ebp, instr.operand());
                asm.mov_rm_sib(Reg::Ecx, Reg::Ebx, Reg::Edx, 0);
            }
            Op::LoadI => {
                // PRI = [PRI]
                asm.mov_rm_sib(Reg::Eax, Reg::Ebx, Reg::Eax, 0);
            }
            Op::LodbI => {
                // PRI = "operand" bytes at [PRI], zero-extended
                match instr.operand() {
                    1 => asm.movzx_rm8_sib(Reg::Eax, Reg::Ebx, Reg::Eax),
                    2 => asm.movzx_rm16_sib(Reg::Eax, Reg::Ebx, Reg::Eax),
                    4 => asm.mov_rm_sib(Reg::Eax, Reg::Ebx, Reg::Eax, 0),
                    _ => return Err(CompileError::UnsupportedInstruction(instr.clone())),
                }
            }
            Op::ConstPri => {
                // PRI = value
                if instr.operand() == 0 {
                    asm.xor_rr(Reg::Eax, Reg::Eax);
                } else {
                    asm.mov_ri(Reg::Eax, instr.operand());
                }
            }
            Op::ConstAlt => {
                // ALT = value
                if instr.operand() == 0 {
                    asm.xor_rr(Reg::Ecx, Reg::Ecx);
                } else {
                    asm.mov_ri(Reg::Ecx, instr.operand());
                }
            }
            Op::AddrPri => {
                // PRI = FRM + offset, as a VM offset
                asm.lea(Reg::Eax, Reg::Ebp, instr.operand());
                asm.sub_rr(Reg::Eax, Reg::Ebx);
            }
            Op::AddrAlt => {
                // ALT = FRM + offset, as a VM offset
                asm.lea(Reg::Ecx, Reg::Ebp, instr.operand());
                asm.sub_rr(Reg::Ecx, Reg::Ebx);
            }
            Op::StorPri => {
                // [address] = PRI
                asm.mov_mr(Reg::Ebx, instr.operand(), Reg::Eax);
            }
            Op::StorAlt => {
                // [address] = ALT
                asm.mov_mr(Reg::Ebx, instr.operand(), Reg::Ecx);
            }
            Op::StorSPri => {
                // [FRM + offset] = PRI
                asm.mov_mr(Reg::Ebp, instr.operand(), Reg::Eax);
            }
            Op::StorSAlt => {
                // [FRM + offset] = ALT
                asm.mov_mr(Reg::Ebp, instr.operand(), Reg::Ecx);
            }
            Op::SrefPri => {
                // [[address]] = PRI
                asm.mov_rm(Reg::Edx, Reg::Ebx, instr.operand());
                asm.mov_mr_sib(Reg::Ebx, Reg::Edx, Reg::Eax);
            }
            Op::SrefAlt => {
                // [[address]] = ALT
                asm.mov_rm(Reg::Edx, Reg::Ebx, instr.operand());
                asm.mov_mr_sib(Reg::Ebx, Reg::Edx, Reg::Ecx);
            }
            Op::SrefSPri => {
                // [[FRM + offset]] = PRI
                asm.mov_rm(Reg::Edx, Reg::Ebp, instr.operand());
                asm.mov_mr_sib(Reg::Ebx, Reg::Edx, Reg::Eax);
            }
            Op::SrefSAlt => {
                // [[FRM + offset]] = ALT
                asm.mov_rm(Reg::Edx, Reg::Ebp, instr.operand());
                asm.mov_mr_sib(Reg::Ebx, Reg::Edx, Reg::Ecx);
            }
            Op::StorI => {
                // [ALT] = PRI
                asm.mov_mr_sib(Reg::Ebx, Reg::Ecx, Reg::Eax);
            }
            Op::StrbI => {
                // "operand" bytes at [ALT] = PRI
                match instr.operand() {
                    1 => asm.mov_mr8_sib(Reg::Ebx, Reg::Ecx, Reg::Eax),
                    2 => asm.mov_mr16_sib(Reg::Ebx, Reg::Ecx, Reg::Eax),
                    4 => asm.mov_mr_sib(Reg::Ebx, Reg::Ecx, Reg::Eax),
                    _ => return Err(CompileError::UnsupportedInstruction(instr.clone())),
                }
            }
            Op::Lidx => {
                // PRI = [ALT + PRI * cell]
                asm.lea_sib(Reg::Edx, Reg::Ebx, Reg::Ecx);
                asm.mov_rm_sib(Reg::Eax, Reg::Edx, Reg::Eax, 2);
            }
            Op::LidxB => {
                // PRI = [ALT + (PRI << shift)]
                let shift = instr.operand();
                if !(0..=3).contains(&shift) {
                    return Err(CompileError::UnsupportedInstruction(instr.clone()));
                }
                asm.lea_sib(Reg::Edx, Reg::Ebx, Reg::Ecx);
                asm.mov_rm_sib(Reg::Eax, Reg::Edx, Reg::Eax, shift as u8);
            }
            Op::Idxaddr => {
                // PRI = ALT + PRI * cell
                asm.lea_sib_scaled(Reg::Eax, Reg::Ecx, Reg::Eax, 2);
            }
            Op::IdxaddrB => {
                // PRI = ALT + (PRI << shift)
                let shift = instr.operand();
                if !(0..=3).contains(&shift) {
                    return Err(CompileError::UnsupportedInstruction(instr.clone()));
                }
                asm.lea_sib_scaled(Reg::Eax, Reg::Ecx, Reg::Eax, shift as u8);
            }
            Op::AlignPri => {
                // little endian: PRI ^= cell size - operand
                if instr.operand() < 4 {
                    asm.xor_ri(Reg::Eax, 4 - instr.operand());
                }
            }
            Op::AlignAlt => {
                // little endian: ALT ^= cell size - operand
                if instr.operand() < 4 {
                    asm.xor_ri(Reg::Ecx, 4 - instr.operand());
                }
            }
            Op::Lctrl => {
                // PRI = special register: 0=COD 1=DAT 2=HEA 3=STP 4=STK
                // 5=FRM 6=CIP of the next instruction 7=JIT flag
                match instr.operand() {
                    0 => {
                        emit_get_amx_ptr(&mut asm, env, Reg::Eax);
                        asm.mov_rm(Reg::Eax, Reg::Eax, AMX_BASE);
                        asm.mov_rm(Reg::Eax, Reg::Eax, HDR_COD);
                    }
                    1 => {
                        emit_get_amx_ptr(&mut asm, env, Reg::Eax);
                        asm.mov_rm(Reg::Eax, Reg::Eax, AMX_BASE);
                        asm.mov_rm(Reg::Eax, Reg::Eax, HDR_DAT);
                    }
                    2 => {
                        emit_get_amx_ptr(&mut asm, env, Reg::Eax);
                        asm.mov_rm(Reg::Eax, Reg::Eax, AMX_HEA);
                    }
                    3 => {
                        emit_get_amx_ptr(&mut asm, env, Reg::Eax);
                        asm.mov_rm(Reg::Eax, Reg::Eax, AMX_STP);
                    }
                    4 => {
                        asm.mov_rr(Reg::Eax, Reg::Esp);
                        asm.sub_rr(Reg::Eax, Reg::Ebx);
                    }
                    5 => {
                        asm.mov_rr(Reg::Eax, Reg::Ebp);
                        asm.sub_rr(Reg::Eax, Reg::Ebx);
                    }
                    6 => {
                        asm.mov_ri(Reg::Eax, instr.address() + instr.size());
                    }
                    7 => {
                        asm.mov_ri(Reg::Eax, 1);
                    }
                    _ => return Err(CompileError::UnsupportedInstruction(instr.clone())),
                }
            }
            Op::Sctrl => {
                // special register = PRI: 2=HEA 4=STK 5=FRM 6=CIP
                match instr.operand() {
                    2 => {
                        emit_get_amx_ptr(&mut asm, env, Reg::Edx);
                        asm.mov_mr(Reg::Edx, AMX_HEA, Reg::Eax);
                    }
                    4 => {
                        asm.lea_sib(Reg::Esp, Reg::Ebx, Reg::Eax);
                    }
                    5 => {
                        asm.lea_sib(Reg::Ebp, Reg::Ebx, Reg::Eax);
                    }
                    6 => {
                        asm.push_r(Reg::Esp);
                        asm.push_r(Reg::Ebp);
                        asm.push_r(Reg::Eax);
                        asm.call(env.jump_helper);
                    }
                    _ => return Err(CompileError::UnsupportedInstruction(instr.clone())),
                }
            }
            Op::MovePri => {
                // PRI = ALT
                asm.mov_rr(Reg::Eax, Reg::Ecx);
            }
            Op::MoveAlt => {
                // ALT = PRI
                asm.mov_rr(Reg::Ecx, Reg::Eax);
            }
            Op::Xchg => {
                asm.xchg_rr(Reg::Eax, Reg::Ecx);
            }
            Op::PushPri => {
                asm.push_r(Reg::Eax);
            }
            Op::PushAlt => {
                asm.push_r(Reg::Ecx);
            }
            Op::PushC => {
                // [STK] = value
                asm.push_i(instr.operand());
            }
            Op::Push => {
                // [STK] = [address]
                asm.push_m(Reg::Ebx, instr.operand());
            }
            Op::PushS => {
                // [STK] = [FRM + offset]
                asm.push_m(Reg::Ebp, instr.operand());
            }
            Op::PopPri => {
                asm.pop_r(Reg::Eax);
            }
            Op::PopAlt => {
                asm.pop_r(Reg::Ecx);
            }
            Op::Stack => {
                // ALT = STK, STK += value
                asm.mov_rr(Reg::Ecx, Reg::Esp);
                asm.sub_rr(Reg::Ecx, Reg::Ebx);
                if instr.operand() >= 0 {
                    asm.add_ri(Reg::Esp, instr.operand());
                } else {
                    asm.sub_ri(Reg::Esp, instr.operand().wrapping_neg());
                }
            }
            Op::Heap => {
                // ALT = HEA, HEA += value
                emit_get_amx_ptr(&mut asm, env, Reg::Edx);
                asm.mov_rm(Reg::Ecx, Reg::Edx, AMX_HEA);
                if instr.operand() >= 0 {
                    asm.add_mi(Reg::Edx, AMX_HEA, instr.operand());
                } else {
                    asm.sub_mi(Reg::Edx, AMX_HEA, instr.operand().wrapping_neg());
                }
            }
            Op::Proc => {
                // [STK] = FRM, FRM = STK; the saved frame becomes a VM
                // offset
                asm.push_r(Reg::Ebp);
                asm.mov_rr(Reg::Ebp, Reg::Esp);
                asm.sub_mr(Reg::Esp, 0, Reg::Ebx);
            }
            Op::Ret => {
                // FRM = [STK], CIP = [STK]
                asm.pop_r(Reg::Ebp);
                asm.add_rr(Reg::Ebp, Reg::Ebx);
                asm.ret();
            }
            Op::Retn => {
                // FRM = [STK], CIP = [STK], then drop the argument block
                asm.pop_r(Reg::Ebp);
                asm.add_rr(Reg::Ebp, Reg::Ebx);
                asm.pop_r(Reg::Edx);
                asm.add_rm(Reg::Esp, Reg::Esp, 0);
                asm.push_r(Reg::Edx);
                asm.ret_i(4);
            }
            Op::Call => {
                // [STK] = next CIP, CIP = target
                let dest = rel_code_addr(amx, instr.operand());
                let label = amx_label(labels, asm.buf(), dest);
                asm.call(label);
            }
            Op::JumpPri => {
                // CIP = PRI
                asm.push_r(Reg::Esp);
                asm.push_r(Reg::Ebp);
                asm.push_r(Reg::Eax);
                asm.call(env.jump_helper);
            }
            Op::Jump
            | Op::Jzer
            | Op::Jnz
            | Op::Jeq
            | Op::Jneq
            | Op::Jless
            | Op::Jleq
            | Op::Jgrtr
            | Op::Jgeq
            | Op::Jsless
            | Op::Jsleq
            | Op::Jsgrtr
            | Op::Jsgeq => {
                let dest = rel_code_addr(amx, instr.operand());
                let label = amx_label(labels, asm.buf(), dest);
                match instr.opcode() {
                    Op::Jump => asm.jmp(label),
                    Op::Jzer => {
                        // if PRI == 0 jump
                        asm.cmp_ri(Reg::Eax, 0);
                        asm.jcc(Cond::E, label);
                    }
                    Op::Jnz => {
                        // if PRI != 0 jump
                        asm.cmp_ri(Reg::Eax, 0);
                        asm.jcc(Cond::Ne, label);
                    }
                    other => {
                        // compare PRI with ALT; unsigned codes for JLESS
                        // through JGEQ, signed for the JS* forms
                        let cond = match other {
                            Op::Jeq => Cond::E,
                            Op::Jneq => Cond::Ne,
                            Op::Jless => Cond::B,
                            Op::Jleq => Cond::Be,
                            Op::Jgrtr => Cond::A,
                            Op::Jgeq => Cond::Ae,
                            Op::Jsless => Cond::L,
                            Op::Jsleq => Cond::Le,
                            Op::Jsgrtr => Cond::G,
                            _ => Cond::Ge,
                        };
                        asm.cmp_rr(Reg::Eax, Reg::Ecx);
                        asm.jcc(cond, label);
                    }
                }
            }
            Op::Shl => {
                // PRI <<= ALT
                asm.shl_cl(Reg::Eax);
            }
            Op::Shr => {
                // PRI >>= ALT, logical
                asm.shr_cl(Reg::Eax);
            }
            Op::Sshr => {
                // PRI >>= ALT, arithmetic
                asm.sar_cl(Reg::Eax);
            }
            Op::ShlCPri => {
                asm.shl_ri(Reg::Eax, instr.operand() as u8);
            }
            Op::ShlCAlt => {
                asm.shl_ri(Reg::Ecx, instr.operand() as u8);
            }
            Op::ShrCPri => {
                asm.shr_ri(Reg::Eax, instr.operand() as u8);
            }
            Op::ShrCAlt => {
                asm.shr_ri(Reg::Ecx, instr.operand() as u8);
            }
            Op::Smul => {
                // PRI = PRI * ALT, signed
                asm.xor_rr(Reg::Edx, Reg::Edx);
                asm.imul_r(Reg::Ecx);
            }
            Op::Sdiv => {
                // PRI = PRI / ALT, ALT = PRI mod ALT
                asm.cdq();
                asm.idiv_r(Reg::Ecx);
                asm.mov_rr(Reg::Ecx, Reg::Edx);
            }
            Op::SdivAlt => {
                // PRI = ALT / PRI, ALT = ALT mod PRI
                asm.xchg_rr(Reg::Eax, Reg::Ecx);
                asm.cdq();
                asm.idiv_r(Reg::Ecx);
                asm.mov_rr(Reg::Ecx, Reg::Edx);
            }
            Op::Umul => {
                // PRI = PRI * ALT, unsigned
                asm.xor_rr(Reg::Edx, Reg::Edx);
                asm.mul_r(Reg::Ecx);
            }
            Op::Udiv => {
                // PRI = PRI / ALT, ALT = PRI mod ALT, unsigned
                asm.xor_rr(Reg::Edx, Reg::Edx);
                asm.div_r(Reg::Ecx);
                asm.mov_rr(Reg::Ecx, Reg::Edx);
            }
            Op::UdivAlt => {
                // PRI = ALT / PRI, ALT = ALT mod PRI, unsigned
                asm.xchg_rr(Reg::Eax, Reg::Ecx);
                asm.xor_rr(Reg::Edx, Reg::Edx);
                asm.div_r(Reg::Ecx);
                asm.mov_rr(Reg::Ecx, Reg::Edx);
            }
            Op::Add => {
                asm.add_rr(Reg::Eax, Reg::Ecx);
            }
            Op::Sub => {
                asm.sub_rr(Reg::Eax, Reg::Ecx);
            }
            Op::SubAlt => {
                // PRI = ALT - PRI
                asm.sub_rr(Reg::Eax, Reg::Ecx);
                asm.neg_r(Reg::Eax);
            }
            Op::And => {
                asm.and_rr(Reg::Eax, Reg::Ecx);
            }
            Op::Or => {
                asm.or_rr(Reg::Eax, Reg::Ecx);
            }
            Op::Xor => {
                asm.xor_rr(Reg::Eax, Reg::Ecx);
            }
            Op::Not => {
                // PRI = !PRI
                asm.test_rr(Reg::Eax, Reg::Eax);
                asm.setcc(Cond::E, Reg::Eax);
                asm.movzx_rr8(Reg::Eax, Reg::Eax);
            }
            Op::Neg => {
                asm.neg_r(Reg::Eax);
            }
            Op::Invert => {
                asm.not_r(Reg::Eax);
            }
            Op::AddC => {
                // PRI += value
                if instr.operand() >= 0 {
                    asm.add_ri(Reg::Eax, instr.operand());
                } else {
                    asm.sub_ri(Reg::Eax, instr.operand().wrapping_neg());
                }
            }
            Op::SmulC => {
                // PRI *= value
                asm.imul_ri(Reg::Eax, instr.operand());
            }
            Op::ZeroPri => {
                asm.xor_rr(Reg::Eax, Reg::Eax);
            }
            Op::ZeroAlt => {
                asm.xor_rr(Reg::Ecx, Reg::Ecx);
            }
            Op::Zero => {
                // [address] = 0
                asm.mov_mi(Reg::Ebx, instr.operand(), 0);
            }
            Op::ZeroS => {
                // [FRM + offset] = 0
                asm.mov_mi(Reg::Ebp, instr.operand(), 0);
            }
            Op::SignPri => {
                asm.movsx_rr8(Reg::Eax, Reg::Eax);
            }
            Op::SignAlt => {
                asm.movsx_rr8(Reg::Ecx, Reg::Ecx);
            }
            Op::Eq
            | Op::Neq
            | Op::Less
            | Op::Leq
            | Op::Grtr
            | Op::Geq
            | Op::Sless
            | Op::Sleq
            | Op::Sgrtr
            | Op::Sgeq => {
                // PRI = PRI <op> ALT ? 1 : 0
                let cond = match instr.opcode() {
                    Op::Eq => Cond::E,
                    Op::Neq => Cond::Ne,
                    Op::Less => Cond::B,
                    Op::Leq => Cond::Be,
                    Op::Grtr => Cond::A,
                    Op::Geq => Cond::Ae,
                    Op::Sless => Cond::L,
                    Op::Sleq => Cond::Le,
                    Op::Sgrtr => Cond::G,
                    _ => Cond::Ge,
                };
                asm.cmp_rr(Reg::Eax, Reg::Ecx);
                asm.setcc(cond, Reg::Eax);
                asm.movzx_rr8(Reg::Eax, Reg::Eax);
            }
            Op::EqCPri => {
                // PRI = PRI == value ? 1 : 0
                asm.cmp_ri(Reg::Eax, instr.operand());
                asm.setcc(Cond::E, Reg::Eax);
                asm.movzx_rr8(Reg::Eax, Reg::Eax);
            }
            Op::EqCAlt => {
                // PRI = ALT == value ? 1 : 0
                asm.cmp_ri(Reg::Ecx, instr.operand());
                asm.setcc(Cond::E, Reg::Eax);
                asm.movzx_rr8(Reg::Eax, Reg::Eax);
            }
            Op::IncPri => {
                asm.inc_r(Reg::Eax);
            }
            Op::IncAlt => {
                asm.inc_r(Reg::Ecx);
            }
            Op::Inc => {
                asm.inc_m(Reg::Ebx, instr.operand());
            }
            Op::IncS => {
                asm.inc_m(Reg::Ebp, instr.operand());
            }
            Op::IncI => {
                // [PRI] += 1
                asm.inc_m_sib(Reg::Ebx, Reg::Eax);
            }
            Op::DecPri => {
                asm.dec_r(Reg::Eax);
            }
            Op::DecAlt => {
                asm.dec_r(Reg::Ecx);
            }
            Op::Dec => {
                asm.dec_m(Reg::Ebx, instr.operand());
            }
            Op::DecS => {
                asm.dec_m(Reg::Ebp, instr.operand());
            }
            Op::DecI => {
                // [PRI] -= 1
                asm.dec_m_sib(Reg::Ebx, Reg::Eax);
            }
            Op::Movs => {
                // copy "operand" bytes from [PRI] to [ALT]; the regions must
                // not overlap
                let n = instr.operand();
                asm.cld();
                asm.lea_sib(Reg::Esi, Reg::Ebx, Reg::Eax);
                asm.lea_sib(Reg::Edi, Reg::Ebx, Reg::Ecx);
                asm.push_r(Reg::Ecx);
                if n % 4 == 0 {
                    asm.mov_ri(Reg::Ecx, n / 4);
                    asm.rep_movsd();
                } else if n % 2 == 0 {
                    asm.mov_ri(Reg::Ecx, n / 2);
                    asm.rep_movsw();
                } else {
                    asm.mov_ri(Reg::Ecx, n);
                    asm.rep_movsb();
                }
                asm.pop_r(Reg::Ecx);
            }
            Op::Cmps => {
                // compare "operand" bytes at [PRI] and [ALT]; PRI becomes
                // -1/0/1
                let l_above = asm.buf().new_label();
                let l_below = asm.buf().new_label();
                let l_equal = asm.buf().new_label();
                let l_continue = asm.buf().new_label();

                asm.cld();
                asm.lea_sib(Reg::Edi, Reg::Ebx, Reg::Eax);
                asm.lea_sib(Reg::Esi, Reg::Ebx, Reg::Ecx);
                asm.push_r(Reg::Ecx);
                asm.mov_ri(Reg::Ecx, instr.operand());
                asm.repe_cmpsb();
                asm.pop_r(Reg::Ecx);
                asm.jcc(Cond::A, l_above);
                asm.jcc(Cond::B, l_below);
                asm.jcc(Cond::E, l_equal);
                asm.buf().bind(l_above);
                asm.mov_ri(Reg::Eax, 1);
                asm.jmp(l_continue);
                asm.buf().bind(l_below);
                asm.mov_ri(Reg::Eax, -1);
                asm.jmp(l_continue);
                asm.buf().bind(l_equal);
                asm.xor_rr(Reg::Eax, Reg::Eax);
                asm.buf().bind(l_continue);
            }
            Op::Fill => {
                // fill "operand" bytes at [ALT] with PRI, in whole cells
                asm.cld();
                asm.lea_sib(Reg::Edi, Reg::Ebx, Reg::Ecx);
                asm.push_r(Reg::Ecx);
                asm.mov_ri(Reg::Ecx, instr.operand() / 4);
                asm.rep_stosd();
                asm.pop_r(Reg::Ecx);
            }
            Op::Halt => {
                // abort with the operand as the error code
                asm.mov_ri(Reg::Ecx, instr.operand());
                asm.jmp(env.do_halt);
            }
            Op::Bounds => {
                // abort with AMX_ERR_BOUNDS unless 0 <= PRI <= operand
                let l_halt = asm.buf().new_label();
                let l_good = asm.buf().new_label();
                asm.cmp_ri(Reg::Eax, instr.operand());
                asm.jcc(Cond::G, l_halt);
                asm.cmp_ri(Reg::Eax, 0);
                asm.jcc(Cond::L, l_halt);
                asm.jmp(l_good);
                asm.buf().bind(l_halt);
                asm.mov_ri(Reg::Ecx, errors::BOUNDS);
                asm.jmp(env.do_halt);
                asm.buf().bind(l_good);
            }
            Op::SysreqPri => {
                // call the native whose index is in PRI
                asm.push_r(Reg::Esp);
                asm.push_r(Reg::Ebp);
                asm.push_r(Reg::Eax);
                asm.call(env.sysreq_c_helper);
            }
            Op::SysreqC | Op::SysreqD => {
                // call a native by table index or direct address; known
                // float natives are inlined instead
                let name = match instr.opcode() {
                    Op::SysreqC => amx.get_native_name(instr.operand()),
                    _ => amx.get_native_name(amx.find_native(instr.operand())),
                };
                let name = match name {
                    Some(name) => name,
                    _ => return Err(CompileError::UnsupportedInstruction(instr.clone())),
                };
                if let Some(emit) = intrinsics::find(name) {
                    emit(&mut asm);
                } else {
                    asm.push_r(Reg::Esp);
                    asm.push_r(Reg::Ebp);
                    asm.push_i(instr.operand());
                    if instr.opcode() == Op::SysreqC {
                        asm.call(env.sysreq_c_helper);
                    } else {
                        asm.call(env.sysreq_d_helper);
                    }
                }
            }
            Op::Switch => {
                // bounds-check PRI against the case range, then a compare
                // cascade; the table layout is
                // [CASETBL][count][default][(value, address)...]
                let table = rel_code_addr(amx, instr.operand());
                let read = |offset: Cell| {
                    amx.read_code_cell(offset)
                        .ok_or(CompileError::MalformedBytecode)
                };
                let num = read(table + 4)?;
                if num < 0 {
                    return Err(CompileError::MalformedBytecode);
                }
                let default = rel_code_addr(amx, read(table + 8)?);
                let l_default = amx_label(labels, asm.buf(), default);

                if num > 0 {
                    let mut cases = Vec::with_capacity(num as usize);
                    for i in 0..num {
                        let value = read(table + 12 + 8 * i)?;
                        let dest = rel_code_addr(amx, read(table + 16 + 8 * i)?);
                        cases.push((value, dest));
                    }
                    let min = cases.iter().map(|(v, _)| *v).min().unwrap_or(0);
                    let max = cases.iter().map(|(v, _)| *v).max().unwrap_or(0);

                    asm.cmp_ri(Reg::Eax, min);
                    asm.jcc(Cond::L, l_default);
                    asm.cmp_ri(Reg::Eax, max);
                    asm.jcc(Cond::G, l_default);

                    for (value, dest) in cases {
                        let label = amx_label(labels, asm.buf(), dest);
                        asm.cmp_ri(Reg::Eax, value);
                        asm.jcc(Cond::E, label);
                    }
                }
                asm.jmp(l_default);
            }
            Op::Casetbl => {
                // data, consumed by SWITCH
            }
            Op::SwapPri => {
                // [STK] <-> PRI
                asm.xchg_mr(Reg::Esp, 0, Reg::Eax);
            }
            Op::SwapAlt => {
                // [STK] <-> ALT
                asm.xchg_mr(Reg::Esp, 0, Reg::Ecx);
            }
            Op::PushAdr => {
                // [STK] = FRM + offset, as a VM offset
                asm.lea(Reg::Edx, Reg::Ebp, instr.operand());
                asm.sub_rr(Reg::Edx, Reg::Ebx);
                asm.push_r(Reg::Edx);
            }
            Op::Nop | Op::Break => {
                // nothing to emit
            }
            _ => return Err(CompileError::UnsupportedInstruction(instr.clone())),
        }
        Ok(())
    }
}

/// The label for a bytecode address, created on first use.
fn amx_label(labels: &mut HashMap<Cell, Label>, buf: &mut CodeBuffer, address: Cell) -> Label {
    if let Some(&label) = labels.get(&address) {
        label
    } else {
        let label = buf.new_label();
        labels.insert(address, label);
        label
    }
}

/// One pass over the program collecting every address translated code can
/// jump to: call and one-operand jump targets, case-table addresses, and
/// procedure entry points.
fn collect_jump_targets(amx: AmxPtr) -> HashSet<Cell> {
    let mut targets = HashSet::new();
    let mut disas = AmxDisassembler::new(amx);
    while let Some(instr) = disas.decode() {
        let opcode = instr.opcode();
        if opcode.is_call() || (opcode.is_jump() && instr.num_operands() == 1) {
            targets.insert(rel_code_addr(amx, instr.operand()));
        } else if opcode == Op::Casetbl {
            for i in (1..instr.num_operands()).step_by(2) {
                targets.insert(rel_code_addr(amx, instr.operand_at(i)));
            }
        } else if opcode == Op::Proc {
            targets.insert(instr.address());
        }
    }
    targets
}

//! Inline replacements for the floating-point natives.
//!
//! The pawn `float` natives are thin wrappers over single x87 operations, so
//! instead of a full native dispatch the translator pastes the FPU sequence
//! straight into the code stream. Arguments are already on the VM stack in
//! native-call form (`[esp]` holds the argument byte count, `[esp+4]` the
//! first argument), and the result's raw bits are left in PRI.

use super::x86::{Reg, X86Assembler};

/// An inline emitter pastes its sequence into the current code stream.
pub type EmitFn = fn(&mut X86Assembler);

/// Name-keyed table of natives the translator inlines.
static INTRINSICS: &[(&str, EmitFn)] = &[
    ("float", emit_float),
    ("floatabs", emit_floatabs),
    ("floatadd", emit_floatadd),
    ("floatsub", emit_floatsub),
    ("floatmul", emit_floatmul),
    ("floatdiv", emit_floatdiv),
    ("floatsqroot", emit_floatsqroot),
    ("floatlog", emit_floatlog),
];

/// The inline emitter for a native, if it has one.
pub fn find(name: &str) -> Option<EmitFn> {
    INTRINSICS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, emit)| *emit)
}

// Each sequence ends the same way: make room below the arguments, pop the
// x87 result into that slot, and load it into PRI.
fn store_result(asm: &mut X86Assembler) {
    asm.sub_ri(Reg::Esp, 4);
    asm.fstp_m32(Reg::Esp, 0);
    asm.mov_rm(Reg::Eax, Reg::Esp, 0);
    asm.add_ri(Reg::Esp, 4);
}

fn emit_float(asm: &mut X86Assembler) {
    asm.fild_m32(Reg::Esp, 4);
    store_result(asm);
}

fn emit_floatabs(asm: &mut X86Assembler) {
    asm.fld_m32(Reg::Esp, 4);
    asm.fabs();
    store_result(asm);
}

fn emit_floatadd(asm: &mut X86Assembler) {
    asm.fld_m32(Reg::Esp, 4);
    asm.fadd_m32(Reg::Esp, 8);
    store_result(asm);
}

fn emit_floatsub(asm: &mut X86Assembler) {
    asm.fld_m32(Reg::Esp, 4);
    asm.fsub_m32(Reg::Esp, 8);
    store_result(asm);
}

fn emit_floatmul(asm: &mut X86Assembler) {
    asm.fld_m32(Reg::Esp, 4);
    asm.fmul_m32(Reg::Esp, 8);
    store_result(asm);
}

fn emit_floatdiv(asm: &mut X86Assembler) {
    asm.fld_m32(Reg::Esp, 4);
    asm.fdiv_m32(Reg::Esp, 8);
    store_result(asm);
}

fn emit_floatsqroot(asm: &mut X86Assembler) {
    asm.fld_m32(Reg::Esp, 4);
    asm.fsqrt();
    store_result(asm);
}

// log_base(x) computed as log2(x) / log2(base) with fyl2x.
fn emit_floatlog(asm: &mut X86Assembler) {
    asm.fld1();
    asm.fld_m32(Reg::Esp, 8);
    asm.fyl2x();
    asm.fld1();
    asm.fdivrp_st1();
    asm.fld_m32(Reg::Esp, 4);
    asm.fyl2x();
    store_result(asm);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::codebuf::CodeBuffer;

    #[test]
    fn test_table_lookup() {
        assert!(find("float").is_some());
        assert!(find("floatlog").is_some());
        assert!(find("floatsin").is_none());
        assert!(find("").is_none());
    }

    #[test]
    fn test_float_sequence_bytes() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86Assembler::new(&mut buf);
        find("float").unwrap()(&mut asm);
        // fild [esp+4]; sub esp,4; fstp [esp]; mov eax,[esp]; add esp,4
        assert_eq!(
            buf.code(),
            &[
                0xDB, 0x44, 0x24, 0x04, // fild dword [esp+4]
                0x83, 0xEC, 0x04, // sub esp, 4
                0xD9, 0x1C, 0x24, // fstp dword [esp]
                0x8B, 0x04, 0x24, // mov eax, [esp]
                0x83, 0xC4, 0x04, // add esp, 4
            ]
        );
    }
}

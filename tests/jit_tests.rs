//! End-to-end tests for the JIT backend.
//!
//! Compilation is host-independent and tested everywhere; tests that run
//! the emitted code only build on 32-bit x86, the backend's only target.

use amx_jit::amx::opcode::Opcode as Op;
use amx_jit::{AmxImage, AmxImageBuilder, Cell, CompileError, JitCompiler, JitOutput};

const PROC: Cell = Op::Proc as Cell;
const RETN: Cell = Op::Retn as Cell;

fn compile(image: &mut AmxImage) -> Result<JitOutput, CompileError> {
    JitCompiler::new(image.ptr()).compile()
}

#[test]
fn compiles_minimal_program() {
    let mut image = AmxImageBuilder::new()
        .code(&[PROC, Op::ZeroPri as Cell, RETN])
        .public("entry", 0)
        .build();
    let output = compile(&mut image).unwrap();

    let base = output.code_ptr() as usize;
    assert!(output.code_size() > 0);
    let exec = output.exec_ptr();
    assert!(exec > base && exec < base + output.code_size());
}

#[test]
fn instruction_map_covers_every_instruction_in_order() {
    // A frame, a loop and a call, decoded into 17 instructions.
    let code = build_loop_and_call();
    let mut image = AmxImageBuilder::new().code(&code).public("f", 0).build();
    let output = compile(&mut image).unwrap();

    let map = output.instr_map_entries();
    assert_eq!(map.len(), 17);
    for window in map.windows(2) {
        assert!(
            window[0].0 < window[1].0,
            "map not sorted: {:?} then {:?}",
            window[0],
            window[1]
        );
    }
}

// outer: counts 0..3 in a frame local, then calls inner once
fn build_loop_and_call() -> Vec<Cell> {
    vec![
        PROC,              // 0
        Op::Stack as Cell, // 4: one local
        -4,
        Op::ZeroPri as Cell,  // 12
        Op::StorSPri as Cell, // 16: local = 0
        -4,
        // loop:
        Op::LoadSPri as Cell, // 24
        -4,
        Op::EqCPri as Cell, // 32: PRI = (local == 3)
        3,
        Op::Jnz as Cell, // 40 -> done @ 72
        72,
        Op::IncS as Cell, // 48
        -4,
        Op::Jump as Cell, // 56 -> loop @ 24
        24,
        Op::Nop as Cell,   // 64
        Op::Break as Cell, // 68
        // done:
        Op::PushC as Cell, // 72: zero-arg call
        0,
        Op::Call as Cell, // 80 -> inner @ 100
        100,
        Op::Stack as Cell, // 88: drop the local
        4,
        RETN, // 96
        PROC, // 100: inner
        RETN, // 104
    ]
}

#[test]
fn rejects_program_with_unknown_opcode() {
    let mut image = AmxImageBuilder::new()
        .code(&[PROC, 5000])
        .public("f", 0)
        .build();
    assert!(matches!(
        compile(&mut image),
        Err(CompileError::MalformedBytecode)
    ));
}

#[test]
fn kitchen_sink_program_compiles() {
    let mut code: Vec<Cell> = Vec::new();
    let mut jumps_to_end = Vec::new();

    code.push(PROC);
    for (op, operands) in [
        (Op::ConstPri, &[7][..]),
        (Op::ConstAlt, &[2][..]),
        (Op::Add, &[][..]),
        (Op::Sub, &[][..]),
        (Op::SubAlt, &[][..]),
        (Op::Smul, &[][..]),
        (Op::Sdiv, &[][..]),
        (Op::SdivAlt, &[][..]),
        (Op::Umul, &[][..]),
        (Op::Udiv, &[][..]),
        (Op::UdivAlt, &[][..]),
        (Op::And, &[][..]),
        (Op::Or, &[][..]),
        (Op::Xor, &[][..]),
        (Op::Not, &[][..]),
        (Op::Neg, &[][..]),
        (Op::Invert, &[][..]),
        (Op::Xchg, &[][..]),
        (Op::MovePri, &[][..]),
        (Op::MoveAlt, &[][..]),
        (Op::Shl, &[][..]),
        (Op::Shr, &[][..]),
        (Op::Sshr, &[][..]),
        (Op::ShlCPri, &[1][..]),
        (Op::ShlCAlt, &[1][..]),
        (Op::ShrCPri, &[1][..]),
        (Op::ShrCAlt, &[1][..]),
        (Op::AddC, &[5][..]),
        (Op::AddC, &[-5][..]),
        (Op::SmulC, &[3][..]),
        (Op::ZeroPri, &[][..]),
        (Op::ZeroAlt, &[][..]),
        (Op::IncPri, &[][..]),
        (Op::IncAlt, &[][..]),
        (Op::DecPri, &[][..]),
        (Op::DecAlt, &[][..]),
        (Op::SignPri, &[][..]),
        (Op::SignAlt, &[][..]),
        (Op::Eq, &[][..]),
        (Op::Neq, &[][..]),
        (Op::Less, &[][..]),
        (Op::Leq, &[][..]),
        (Op::Grtr, &[][..]),
        (Op::Geq, &[][..]),
        (Op::Sless, &[][..]),
        (Op::Sleq, &[][..]),
        (Op::Sgrtr, &[][..]),
        (Op::Sgeq, &[][..]),
        (Op::EqCPri, &[7][..]),
        (Op::EqCAlt, &[7][..]),
        (Op::LoadPri, &[0][..]),
        (Op::LoadAlt, &[4][..]),
        (Op::StorPri, &[0][..]),
        (Op::StorAlt, &[4][..]),
        (Op::LrefPri, &[0][..]),
        (Op::LrefAlt, &[0][..]),
        (Op::LrefSPri, &[-4][..]),
        (Op::LrefSAlt, &[-4][..]),
        (Op::SrefPri, &[0][..]),
        (Op::SrefAlt, &[0][..]),
        (Op::SrefSPri, &[-4][..]),
        (Op::SrefSAlt, &[-4][..]),
        (Op::LoadSPri, &[-4][..]),
        (Op::LoadSAlt, &[-4][..]),
        (Op::StorSPri, &[-4][..]),
        (Op::StorSAlt, &[-4][..]),
        (Op::LoadI, &[][..]),
        (Op::StorI, &[][..]),
        (Op::LodbI, &[1][..]),
        (Op::LodbI, &[2][..]),
        (Op::LodbI, &[4][..]),
        (Op::StrbI, &[1][..]),
        (Op::StrbI, &[2][..]),
        (Op::StrbI, &[4][..]),
        (Op::Lidx, &[][..]),
        (Op::LidxB, &[2][..]),
        (Op::Idxaddr, &[][..]),
        (Op::IdxaddrB, &[1][..]),
        (Op::AlignPri, &[2][..]),
        (Op::AlignAlt, &[1][..]),
        (Op::AddrPri, &[-4][..]),
        (Op::AddrAlt, &[-4][..]),
        (Op::Lctrl, &[0][..]),
        (Op::Lctrl, &[1][..]),
        (Op::Lctrl, &[2][..]),
        (Op::Lctrl, &[3][..]),
        (Op::Lctrl, &[4][..]),
        (Op::Lctrl, &[5][..]),
        (Op::Lctrl, &[6][..]),
        (Op::Lctrl, &[7][..]),
        (Op::Sctrl, &[2][..]),
        (Op::Sctrl, &[4][..]),
        (Op::Sctrl, &[5][..]),
        (Op::PushPri, &[][..]),
        (Op::PushAlt, &[][..]),
        (Op::PushC, &[9][..]),
        (Op::Push, &[0][..]),
        (Op::PushS, &[-4][..]),
        (Op::PushAdr, &[-4][..]),
        (Op::PopPri, &[][..]),
        (Op::PopAlt, &[][..]),
        (Op::SwapPri, &[][..]),
        (Op::SwapAlt, &[][..]),
        (Op::Stack, &[8][..]),
        (Op::Stack, &[-8][..]),
        (Op::Heap, &[4][..]),
        (Op::Heap, &[-4][..]),
        (Op::Zero, &[0][..]),
        (Op::ZeroS, &[-4][..]),
        (Op::Inc, &[0][..]),
        (Op::IncS, &[-4][..]),
        (Op::IncI, &[][..]),
        (Op::Dec, &[0][..]),
        (Op::DecS, &[-4][..]),
        (Op::DecI, &[][..]),
        (Op::Movs, &[8][..]),
        (Op::Movs, &[6][..]),
        (Op::Movs, &[3][..]),
        (Op::Cmps, &[5][..]),
        (Op::Fill, &[8][..]),
        (Op::Bounds, &[10][..]),
        (Op::SysreqPri, &[][..]),
        (Op::JumpPri, &[][..]),
        (Op::Nop, &[][..]),
        (Op::Break, &[][..]),
    ] {
        code.push(op as Cell);
        code.extend_from_slice(operands);
    }

    // A spread of conditional jumps, all to the common end block.
    for op in [
        Op::Jump,
        Op::Jzer,
        Op::Jnz,
        Op::Jeq,
        Op::Jneq,
        Op::Jless,
        Op::Jleq,
        Op::Jgrtr,
        Op::Jgeq,
        Op::Jsless,
        Op::Jsleq,
        Op::Jsgrtr,
        Op::Jsgeq,
    ] {
        code.push(op as Cell);
        jumps_to_end.push(code.len());
        code.push(0);
    }

    code.push(Op::Halt as Cell);
    code.push(9);

    let end = (code.len() * 4) as Cell;
    for index in jumps_to_end {
        code[index] = end;
    }
    code.push(Op::ZeroPri as Cell); // end:
    code.push(RETN);

    let mut image = AmxImageBuilder::new()
        .code(&code)
        .data(&[0; 64])
        .public("f", 0)
        .build();
    let output = compile(&mut image).unwrap();
    assert!(output.instr_map_entries().len() > 100);
}

#[cfg(target_arch = "x86")]
mod exec {
    //! Runs emitted code on the host. 32-bit x86 only.

    use super::*;
    use amx_jit::amx::{errors, flags, Amx};
    use amx_jit::AmxExecFn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run(image: &mut AmxImage, index: i32) -> (i32, Cell) {
        let output = compile(image).unwrap();
        run_compiled(&output, index)
    }

    fn run_compiled(output: &JitOutput, index: i32) -> (i32, Cell) {
        let mut retval = 0;
        let error = unsafe { output.exec(index, &mut retval) };
        (error, retval)
    }

    #[test]
    fn empty_public_returns_zero() {
        let mut image = AmxImageBuilder::new()
            .code(&[PROC, Op::ZeroPri as Cell, RETN])
            .public("entry", 0)
            .build();
        assert_eq!(run(&mut image, 0), (errors::NONE, 0));
    }

    #[test]
    fn multiply_returns_product() {
        let code = [
            PROC,
            Op::ConstPri as Cell,
            7,
            Op::ConstAlt as Cell,
            5,
            Op::Smul as Cell,
            RETN,
        ];
        let mut image = AmxImageBuilder::new().code(&code).public("f", 0).build();
        assert_eq!(run(&mut image, 0), (errors::NONE, 35));
    }

    fn binop_program(op: Op, a: Cell, b: Cell, return_alt: bool) -> Vec<Cell> {
        let mut code = vec![
            PROC,
            Op::ConstPri as Cell,
            a,
            Op::ConstAlt as Cell,
            b,
            op as Cell,
        ];
        if return_alt {
            code.push(Op::MovePri as Cell); // PRI = ALT
        }
        code.push(RETN);
        code
    }

    fn run_binop(op: Op, a: Cell, b: Cell, return_alt: bool) -> Cell {
        let mut image = AmxImageBuilder::new()
            .code(&binop_program(op, a, b, return_alt))
            .public("f", 0)
            .build();
        let (error, retval) = run(&mut image, 0);
        assert_eq!(error, errors::NONE);
        retval
    }

    #[test]
    fn arithmetic_matches_reference() {
        let values = [0, 1, -1, i32::MAX, i32::MIN];
        for &a in &values {
            for &b in &values {
                assert_eq!(run_binop(Op::Add, a, b, false), a.wrapping_add(b));
                assert_eq!(run_binop(Op::Sub, a, b, false), a.wrapping_sub(b));
                assert_eq!(run_binop(Op::SubAlt, a, b, false), b.wrapping_sub(a));
                assert_eq!(run_binop(Op::Smul, a, b, false), a.wrapping_mul(b));
                assert_eq!(run_binop(Op::And, a, b, false), a & b);
                assert_eq!(run_binop(Op::Or, a, b, false), a | b);
                assert_eq!(run_binop(Op::Xor, a, b, false), a ^ b);

                // Division faults in hardware on zero and on MIN / -1, as
                // the VM's own JIT always has.
                if b != 0 && !(a == i32::MIN && b == -1) {
                    assert_eq!(run_binop(Op::Sdiv, a, b, false), a.wrapping_div(b));
                    assert_eq!(run_binop(Op::Sdiv, a, b, true), a.wrapping_rem(b));
                    let (ua, ub) = (a as u32, b as u32);
                    assert_eq!(run_binop(Op::Udiv, a, b, false), (ua / ub) as Cell);
                    assert_eq!(run_binop(Op::Udiv, a, b, true), (ua % ub) as Cell);
                }
            }
        }
    }

    #[test]
    fn comparisons_match_reference() {
        let values = [0, 1, -1, i32::MAX, i32::MIN];
        for &a in &values {
            for &b in &values {
                assert_eq!(run_binop(Op::Sless, a, b, false), (a < b) as Cell);
                assert_eq!(run_binop(Op::Sgeq, a, b, false), (a >= b) as Cell);
                assert_eq!(
                    run_binop(Op::Less, a, b, false),
                    ((a as u32) < b as u32) as Cell
                );
                assert_eq!(run_binop(Op::Eq, a, b, false), (a == b) as Cell);
            }
        }
    }

    #[test]
    fn signed_conditional_branch() {
        // if (-1 < 0) return 1 else return 0
        let code = [
            PROC,                 // 0
            Op::ConstPri as Cell, // 4
            -1,
            Op::ConstAlt as Cell, // 12
            0,
            Op::Jsless as Cell, // 20 -> 36
            36,
            Op::ZeroPri as Cell, // 28
            RETN,                // 32
            Op::ConstPri as Cell, // 36
            1,
            RETN, // 44
        ];
        let mut image = AmxImageBuilder::new().code(&code).public("f", 0).build();
        assert_eq!(run(&mut image, 0), (errors::NONE, 1));
    }

    fn switch_program(input: Cell) -> Vec<Cell> {
        vec![
            PROC,                 // 0
            Op::ConstPri as Cell, // 4
            input,
            Op::Switch as Cell, // 12
            20,
            Op::Casetbl as Cell, // 20
            3,
            92, // default -> D
            10,
            56, // -> A
            20,
            68, // -> B
            30,
            80, // -> C
            Op::ConstPri as Cell, // 56: A returns 1
            1,
            RETN,
            Op::ConstPri as Cell, // 68: B returns 2
            2,
            RETN,
            Op::ConstPri as Cell, // 80: C returns 3
            3,
            RETN,
            Op::ZeroPri as Cell, // 92: D returns 0
            RETN,
        ]
    }

    #[test]
    fn switch_dispatches_on_case_values() {
        for (input, expected) in [(10, 1), (20, 2), (30, 3), (25, 0), (-7, 0), (1000, 0)] {
            let mut image = AmxImageBuilder::new()
                .code(&switch_program(input))
                .public("f", 0)
                .build();
            assert_eq!(run(&mut image, 0), (errors::NONE, expected), "input {}", input);
        }
    }

    #[test]
    fn halt_surfaces_its_code_and_leaves_the_vm_usable() {
        let code = [
            PROC, // 0: public "halts"
            Op::Halt as Cell,
            7,
            RETN,
            PROC, // 16: public "ok"
            Op::ConstPri as Cell,
            5,
            RETN,
        ];
        let mut image = AmxImageBuilder::new()
            .code(&code)
            .public("halts", 0)
            .public("ok", 16)
            .build();
        let output = compile(&mut image).unwrap();
        assert_eq!(run_compiled(&output, 0).0, 7);
        assert_eq!(run_compiled(&output, 1), (errors::NONE, 5));
        assert_eq!(run_compiled(&output, 0).0, 7);
    }

    #[test]
    fn bounds_check_aborts_out_of_range() {
        let code = [
            PROC,
            Op::ConstPri as Cell,
            100,
            Op::Bounds as Cell,
            50,
            RETN,
        ];
        let mut image = AmxImageBuilder::new().code(&code).public("f", 0).build();
        let (error, _) = run(&mut image, 0);
        assert_eq!(error, errors::BOUNDS);

        let code = [PROC, Op::ConstPri as Cell, 50, Op::Bounds as Cell, 50, RETN];
        let mut image = AmxImageBuilder::new().code(&code).public("f", 0).build();
        assert_eq!(run(&mut image, 0), (errors::NONE, 50));
    }

    #[test]
    fn exec_preconditions_set_and_return_the_error() {
        let mut image = AmxImageBuilder::new()
            .code(&[PROC, Op::ZeroPri as Cell, RETN])
            .public("f", 0)
            .build();
        let output = compile(&mut image).unwrap();

        let hea = image.amx().hea;
        image.amx().stk = hea; // hea >= stk
        assert_eq!(run_compiled(&output, 0).0, errors::STACKERR);
        assert_eq!(image.amx().error, errors::STACKERR);

        let stp = image.amx().stp;
        image.amx().stk = stp + 4; // stk > stp
        assert_eq!(run_compiled(&output, 0).0, errors::STACKLOW);
        assert_eq!(image.amx().error, errors::STACKLOW);

        image.amx().stk = stp;
        image.amx().hea = -4; // hea < hlw
        assert_eq!(run_compiled(&output, 0).0, errors::HEAPLOW);
        assert_eq!(image.amx().error, errors::HEAPLOW);

        let hlw = image.amx().hlw;
        image.amx().hea = hlw;
        image.amx().flags &= !flags::NTVREG;
        assert_eq!(run_compiled(&output, 0).0, errors::NOTFOUND);
        assert_eq!(image.amx().error, errors::NOTFOUND);

        image.amx().flags |= flags::NTVREG;
        assert_eq!(run_compiled(&output, 99).0, errors::INDEX);
        assert_eq!(image.amx().error, errors::INDEX);

        // Preconditions fine again: the instance still runs.
        assert_eq!(run_compiled(&output, 0), (errors::NONE, 0));
    }

    #[test]
    fn movs_then_cmps_compares_equal() {
        for n in [1, 2, 3, 4, 7, 8, 16, 33, 63, 64, 65] {
            // copy n bytes from data[0] to data+128, then compare
            let code = [
                PROC,
                Op::ConstPri as Cell,
                0,
                Op::ConstAlt as Cell,
                128,
                Op::Movs as Cell,
                n,
                Op::Cmps as Cell,
                n,
                RETN,
            ];
            let mut data = [0 as Cell; 64];
            for (i, cell) in data.iter_mut().take(17).enumerate() {
                *cell = (i as Cell) * 0x01010101u32 as Cell + 0x11223344;
            }
            let mut image = AmxImageBuilder::new()
                .code(&code)
                .data(&data)
                .public("f", 0)
                .build();
            assert_eq!(run(&mut image, 0), (errors::NONE, 0), "n = {}", n);
        }
    }

    #[test]
    fn fill_stores_the_cell_pattern() {
        // fill data[8..12] with PRI, then read one back
        let code = [
            PROC,
            Op::ConstPri as Cell,
            0x5A5A5A5A_u32 as Cell,
            Op::ConstAlt as Cell,
            32,
            Op::Fill as Cell,
            16,
            Op::LoadPri as Cell,
            44, // last filled cell
            RETN,
        ];
        let mut image = AmxImageBuilder::new()
            .code(&code)
            .data(&[0; 16])
            .public("f", 0)
            .build();
        assert_eq!(run(&mut image, 0), (errors::NONE, 0x5A5A5A5A_u32 as Cell));
    }

    #[test]
    fn call_preserves_frame_and_stack() {
        let code = [
            PROC,              // 0
            Op::Lctrl as Cell, // 4: PRI = STK before the call
            4,
            Op::StorPri as Cell, // 12
            0,
            Op::PushC as Cell, // 20: one argument
            5,
            Op::PushC as Cell, // 28: argument bytes
            4,
            Op::Call as Cell, // 36 -> inner @ 68
            68,
            Op::Lctrl as Cell, // 44: PRI = STK after the call
            4,
            Op::LoadAlt as Cell, // 52
            0,
            Op::Eq as Cell, // 60
            RETN,           // 64
            PROC,           // 68: inner
            RETN,
        ];
        let mut image = AmxImageBuilder::new()
            .code(&code)
            .data(&[0])
            .public("f", 0)
            .build();
        assert_eq!(run(&mut image, 0), (errors::NONE, 1));
    }

    #[test]
    fn float_intrinsics_inline_without_native_dispatch() {
        // floatabs(2.0) must come back as 2.0's bits without ever entering
        // the registered native, which would return a sentinel.
        unsafe extern "C" fn fake_floatabs(_amx: *mut Amx, _params: *const Cell) -> Cell {
            -999
        }
        let code = [
            PROC,
            Op::PushC as Cell,
            0x40000000, // 2.0f
            Op::PushC as Cell,
            4,
            Op::SysreqC as Cell,
            0,
            Op::Stack as Cell,
            8,
            RETN,
        ];
        let mut image = AmxImageBuilder::new()
            .code(&code)
            .public("f", 0)
            .native("floatabs")
            .build();
        assert_eq!(image.ptr().register_natives(&[("floatabs", fake_floatabs)]), 0);
        assert_eq!(run(&mut image, 0), (errors::NONE, 0x40000000));
    }

    #[test]
    fn floatadd_intrinsic_adds() {
        // floatadd(1.5, 2.25) = 3.75
        let code = [
            PROC,
            Op::PushC as Cell,
            f32::to_bits(2.25) as Cell, // second argument, pushed first
            Op::PushC as Cell,
            f32::to_bits(1.5) as Cell,
            Op::PushC as Cell,
            8,
            Op::SysreqC as Cell,
            0,
            Op::Stack as Cell,
            12,
            RETN,
        ];
        unsafe extern "C" fn unused(_amx: *mut Amx, _params: *const Cell) -> Cell {
            -999
        }
        let mut image = AmxImageBuilder::new()
            .code(&code)
            .public("f", 0)
            .native("floatadd")
            .build();
        image.ptr().register_natives(&[("floatadd", unused)]);
        assert_eq!(
            run(&mut image, 0),
            (errors::NONE, f32::to_bits(3.75) as Cell)
        );
    }

    #[test]
    fn native_call_goes_through_the_helper() {
        unsafe extern "C" fn add3(_amx: *mut Amx, params: *const Cell) -> Cell {
            // params[0] is the argument byte count
            unsafe {
                assert_eq!(*params, 4);
                *params.add(1) + 3
            }
        }
        let code = [
            PROC,
            Op::PushC as Cell,
            39,
            Op::PushC as Cell,
            4,
            Op::SysreqC as Cell,
            0,
            Op::Stack as Cell,
            8,
            RETN,
        ];
        let mut image = AmxImageBuilder::new()
            .code(&code)
            .public("f", 0)
            .native("add3")
            .build();
        assert_eq!(image.ptr().register_natives(&[("add3", add3)]), 0);
        assert_eq!(run(&mut image, 0), (errors::NONE, 42));
    }

    #[test]
    fn sysreq_d_calls_native_by_address() {
        unsafe extern "C" fn add3(_amx: *mut Amx, params: *const Cell) -> Cell {
            unsafe { *params.add(1) + 3 }
        }
        // Learn the address the registry hands out for the native, then
        // embed it as a direct-address call in a second program.
        let mut probe = AmxImageBuilder::new()
            .code(&[PROC, RETN])
            .native("add3")
            .build();
        probe.ptr().register_natives(&[("add3", add3)]);
        let addr = probe.ptr().get_native_addr(0);
        assert_ne!(addr, 0);

        let code = [
            PROC,
            Op::PushC as Cell,
            39,
            Op::PushC as Cell,
            4,
            Op::SysreqD as Cell,
            addr,
            Op::Stack as Cell,
            8,
            RETN,
        ];
        let mut image = AmxImageBuilder::new()
            .code(&code)
            .public("f", 0)
            .native("add3")
            .build();
        assert_eq!(image.ptr().register_natives(&[("add3", add3)]), 0);
        assert_eq!(run(&mut image, 0), (errors::NONE, 42));
    }

    static REENTER_EXEC: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn reenter(_amx: *mut Amx, _params: *const Cell) -> Cell {
        let f: AmxExecFn = unsafe { std::mem::transmute(REENTER_EXEC.load(Ordering::Relaxed)) };
        let mut retval = 0;
        let error = unsafe { f(1, &mut retval) };
        if error != errors::NONE {
            return -1;
        }
        retval
    }

    #[test]
    fn nested_exec_from_a_native_preserves_reset_state() {
        let code = [
            PROC, // 0: public "outer"
            Op::PushC as Cell,
            0,
            Op::SysreqC as Cell,
            0,
            Op::Stack as Cell,
            4,
            RETN,
            PROC, // 32: public "inner"
            Op::ConstPri as Cell,
            42,
            RETN,
        ];
        let mut image = AmxImageBuilder::new()
            .code(&code)
            .public("outer", 0)
            .public("inner", 32)
            .native("reenter")
            .build();
        assert_eq!(image.ptr().register_natives(&[("reenter", reenter)]), 0);
        let output = compile(&mut image).unwrap();
        REENTER_EXEC.store(output.exec_ptr(), Ordering::Relaxed);

        assert_eq!(run_compiled(&output, 0), (errors::NONE, 42));
        // And the outer exec still works a second time.
        assert_eq!(run_compiled(&output, 0), (errors::NONE, 42));
    }

    #[test]
    fn halt_inside_a_call_unwinds_to_exec() {
        let code = [
            PROC, // 0
            Op::PushC as Cell, // 4
            0,
            Op::Call as Cell, // 12 -> callee @ 28
            28,
            Op::ZeroPri as Cell, // 20 (skipped by the halt)
            RETN,                // 24
            PROC,                // 28: callee
            Op::Halt as Cell,    // 32
            11,
            RETN, // 40
        ];
        let mut image = AmxImageBuilder::new().code(&code).public("f", 0).build();
        let (error, _) = run(&mut image, 0);
        assert_eq!(error, 11);
    }
}

//! Compilation throughput over a synthetic program.

use criterion::{criterion_group, criterion_main, Criterion};

use amx_jit::amx::opcode::Opcode as Op;
use amx_jit::{AmxImageBuilder, Cell, JitCompiler};

/// A chain of small functions, each computing a little arithmetic and
/// calling the next one.
fn build_program(functions: usize) -> Vec<Cell> {
    let mut code = Vec::new();
    for i in 0..functions {
        let here = (code.len() * 4) as Cell;
        // each function below is 15 cells (60 bytes) long
        let next = here + 60;
        let last = i + 1 == functions;
        code.extend_from_slice(&[
            Op::Proc as Cell,
            Op::ConstPri as Cell,
            i as Cell,
            Op::ConstAlt as Cell,
            3,
            Op::Smul as Cell,
            Op::AddC as Cell,
            1,
            Op::PushC as Cell,
            0,
            Op::Call as Cell,
            if last { here + 48 } else { next },
            Op::Nop as Cell, // 48
            Op::Nop as Cell,
            Op::Retn as Cell, // 56
        ]);
        debug_assert_eq!(code.len() * 4, (here + 60) as usize);
    }
    code
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for functions in [16usize, 128] {
        let code = build_program(functions);
        group.bench_function(format!("{}_functions", functions), |b| {
            b.iter(|| {
                let mut image = AmxImageBuilder::new()
                    .code(&code)
                    .public("entry", 0)
                    .build();
                JitCompiler::new(image.ptr()).compile().unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);

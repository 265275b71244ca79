//! Benchmarks for the loop transformations and the dependence analysis they
//! rely on

use affine_passes::affine::AffineMap;
use affine_passes::analysis::dependence::dependences_in;
use affine_passes::ir::{ElementType, Function, IrType, MemRefType, OpBuilder, OpId};
use affine_passes::{AffinePass, PassRegistry};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

/// C[i][j] += A[i][k] * B[k][j]
fn matmul(n: i64) -> (Function, OpId) {
    let ty = IrType::MemRef(MemRefType::new(vec![n, n], ElementType::F32));
    let mut func = Function::new("matmul", vec![ty.clone(), ty.clone(), ty]);
    let (a, b_arg, c) = (func.arguments[0], func.arguments[1], func.arguments[2]);
    let body = func.body;
    let i = OpBuilder::at_end(&mut func, body).constant_for(0, n, 1);
    let il = func.loop_op(i).unwrap().clone();
    let j = OpBuilder::at_end(&mut func, il.body).constant_for(0, n, 1);
    let jl = func.loop_op(j).unwrap().clone();
    let k = OpBuilder::at_end(&mut func, jl.body).constant_for(0, n, 1);
    let kl = func.loop_op(k).unwrap().clone();
    let mut b = OpBuilder::at_end(&mut func, kl.body);
    let x = b.load(a, AffineMap::identity(2), vec![il.iv, kl.iv]);
    let y = b.load(b_arg, AffineMap::identity(2), vec![kl.iv, jl.iv]);
    let acc = b.load(c, AffineMap::identity(2), vec![il.iv, jl.iv]);
    let p = b.mul(x, y);
    let s = b.add(acc, p);
    b.store(s, c, AffineMap::identity(2), vec![il.iv, jl.iv]);
    (func, i)
}

fn benchmark_passes(c: &mut Criterion) {
    let registry = PassRegistry::new();
    let configs = [
        ("affine-loop-tile", json!({"tileSize": 32})),
        ("affine-loop-unroll", json!({"unrollFactor": 4})),
        ("affine-loop-unroll-jam", json!({"unrollJamFactor": 4})),
        ("affine-parallelize", json!(null)),
        ("affine-scalrep", json!(null)),
        ("affine-data-copy-generate", json!({"fastMemCapacityBytes": 16384})),
    ];
    let (func, _) = matmul(128);

    let mut group = c.benchmark_group("passes");
    for (name, options) in configs {
        let pass = registry.create(name, options).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(name), &func, |b, func| {
            b.iter(|| {
                let mut func = func.clone();
                let result = pass.run_on_function(black_box(&mut func));
                black_box(result)
            });
        });
    }
    group.finish();
}

fn benchmark_dependence_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependence_analysis");
    for n in [16, 128, 1024] {
        let (func, root) = matmul(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &func, |b, func| {
            b.iter(|| black_box(dependences_in(func, root, 1..=4)));
        });
    }
    group.finish();
}

fn benchmark_pipeline(c: &mut Criterion) {
    let registry = PassRegistry::new();
    let (func, _) = matmul(64);
    c.bench_function("tile_unroll_scalrep_pipeline", |b| {
        b.iter(|| {
            let pm = registry
                .parse_pipeline(
                    r#"["simplify-affine-structures",
                        {"pass": "affine-loop-tile", "options": {"tileSize": 16}},
                        "affine-loop-unroll",
                        "affine-scalrep",
                        "affine-loop-invariant-code-motion"]"#,
                )
                .unwrap();
            let mut func = func.clone();
            black_box(pm.run_on_function(&mut func))
        });
    });
}

criterion_group!(benches, benchmark_passes, benchmark_dependence_analysis, benchmark_pipeline);
criterion_main!(benches);

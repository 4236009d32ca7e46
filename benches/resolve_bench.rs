//! 解析与查找性能基准测试
//!
//! 使用 Criterion 框架进行性能测试，包括：
//! - 导入链解析基准
//! - 委托查找基准

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use chips_modular::{Framework, FrameworkConfig, MemoryArchive, ModuleManifest};
use std::sync::Arc;

/// 安装一条导入链：模块 i 导入模块 i+1 导出的包
fn install_chain(framework: &Framework, length: usize) -> Vec<u64> {
    (0..length)
        .map(|i| {
            let mut builder = ModuleManifest::builder(format!("bench.m{}", i), "1.0.0")
                .export(format!("bench.p{}", i), "1.0.0");
            if i + 1 < length {
                builder = builder.import(format!("bench.p{}", i + 1), "[1.0.0,2.0.0)");
            }
            let archive = MemoryArchive::new(format!("mem:bench/{}", i), builder.build().unwrap())
                .with_class(&format!("bench.p{}.Type", i), vec![0u8; 64]);
            framework.install(Arc::new(archive)).unwrap()
        })
        .collect()
}

fn bench_resolve_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_chain");
    for length in [10usize, 50, 200] {
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, &length| {
            b.iter_with_setup(
                || {
                    let framework = Framework::new(FrameworkConfig::default()).unwrap();
                    let ids = install_chain(&framework, length);
                    (framework, ids[0])
                },
                |(framework, head)| {
                    black_box(framework.resolve(&[head]));
                },
            );
        });
    }
    group.finish();
}

fn bench_delegated_lookup(c: &mut Criterion) {
    let framework = Framework::new(FrameworkConfig::default()).unwrap();
    let ids = install_chain(&framework, 20);
    framework.resolve(&[ids[0]]);

    c.bench_function("lookup_imported_class", |b| {
        b.iter(|| framework.find_class(black_box(ids[0]), black_box("bench.p1.Type")).unwrap())
    });

    c.bench_function("lookup_local_class", |b| {
        b.iter(|| framework.find_class(black_box(ids[0]), black_box("bench.p0.Type")).unwrap())
    });

    c.bench_function("lookup_missing_class", |b| {
        b.iter(|| framework.find_class(black_box(ids[0]), black_box("bench.none.Type")).unwrap())
    });
}

criterion_group!(benches, bench_resolve_chain, bench_delegated_lookup);
criterion_main!(benches);

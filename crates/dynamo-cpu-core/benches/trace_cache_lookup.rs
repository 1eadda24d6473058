use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dynamo_cpu_core::TraceCache;

fn bench_lookup(c: &mut Criterion) {
    let mut tc = TraceCache::new().expect("mmap");
    for i in 0..4096u32 {
        tc.insert(i * 0x10, &[0x90, 0xC3], 2, vec![]).unwrap();
    }

    c.bench_function("trace_cache_lookup_hit", |b| {
        b.iter(|| black_box(tc.lookup(black_box(0x1230))));
    });

    c.bench_function("trace_cache_lookup_miss", |b| {
        b.iter(|| black_box(tc.lookup(black_box(0xffff_0000))));
    });
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);

use sohash::SoList;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::{Arc, Barrier};
use std::time::Instant;

macro_rules! threaded_bench {
    ($name:ident, $list:expr, $op:expr) => {
        pub fn $name(c: &mut Criterion) {
            let mut group = c.benchmark_group(stringify!($name));
            for nthreads in [1usize, 2, 4, 8] {
                group.bench_with_input(
                    BenchmarkId::from_parameter(nthreads),
                    &nthreads,
                    |b, &nthreads| {
                        b.iter_custom(|niters| {
                            let list = Arc::new($list);
                            let barrier = Arc::new(Barrier::new(nthreads + 1));
                            let threads: Vec<_> = (0..nthreads)
                                .map(|tid| {
                                    let list = Arc::clone(&list);
                                    let barrier = Arc::clone(&barrier);
                                    std::thread::spawn(move || {
                                        let mut acc = list.accessor();
                                        barrier.wait();
                                        barrier.wait();
                                        for i in 0..(niters / nthreads as u64) {
                                            let h = (i as u32)
                                                .wrapping_mul(2654435761)
                                                .wrapping_add(tid as u32)
                                                & 0x7fff_ffff;
                                            #[allow(clippy::redundant_closure_call)]
                                            ($op)(&mut acc, h, i);
                                        }
                                    })
                                })
                                .collect();
                            barrier.wait();
                            let start = Instant::now();
                            barrier.wait();
                            for thread in threads {
                                thread.join().unwrap();
                            }
                            start.elapsed()
                        })
                    },
                );
            }
            group.finish();
        }
    };
}

threaded_bench!(
    concurrent_insert,
    SoList::<u64>::new(64),
    |acc: &mut sohash::SolAccessor<'_, u64>, h: u32, i: u64| {
        black_box(acc.insert(h, i));
    }
);

threaded_bench!(
    concurrent_mixed,
    SoList::<u64>::new(64),
    |acc: &mut sohash::SolAccessor<'_, u64>, h: u32, i: u64| {
        match i % 4 {
            0 => {
                black_box(acc.insert(h, i));
            }
            1 => {
                black_box(acc.remove(h));
            }
            _ => {
                black_box(acc.find(h).copied());
            }
        }
    }
);

criterion_group!(benches, concurrent_insert, concurrent_mixed);
criterion_main!(benches);

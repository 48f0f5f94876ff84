//! Benchmarks for wrapped object lifetimes
//!
//! Measures:
//! - Wrap + explicit finalize
//! - Collector pass reclaiming weak handles
//! - Teardown of an environment holding N objects

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use openworkers_host_env::{Environment, EventLoop, LocalHeap, WrappedObject};
use std::hint::black_box;
use std::rc::Rc;

fn setup() -> (Rc<LocalHeap>, EventLoop, Environment) {
    let heap = Rc::new(LocalHeap::new());
    let event_loop = EventLoop::new("bench");
    let env = Environment::new(&event_loop, heap.clone()).unwrap();
    (heap, event_loop, env)
}

/// Benchmark: wrap a small buffer and finalize it right away
fn bench_wrap_finalize(c: &mut Criterion) {
    let (_heap, _event_loop, env) = setup();

    c.bench_function("wrap_finalize", |b| {
        b.iter(|| {
            let object = env.wrap(vec![0u8; 64]).unwrap();
            black_box(object.finalize());
        });
    });
}

/// Benchmark: collector pass over N unreachable wrapped objects
fn bench_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect");

    for count in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let (heap, _event_loop, env) = setup();

            b.iter_batched(
                || {
                    let objects: Vec<WrappedObject<Vec<u8>>> =
                        (0..count).map(|_| env.wrap(Vec::new()).unwrap()).collect();

                    for object in &objects {
                        heap.drop_reference(object.handle());
                    }

                    objects
                },
                |objects| {
                    black_box(heap.collect_garbage());
                    objects
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark: teardown force-finalizing N objects with a few hooks
fn bench_teardown(c: &mut Criterion) {
    let mut group = c.benchmark_group("teardown");

    for count in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let (heap, event_loop, env) = setup();

                    for _ in 0..count {
                        env.wrap(String::with_capacity(32)).unwrap();
                    }
                    for _ in 0..4 {
                        env.register_cleanup_hook(|| Ok(())).unwrap();
                    }

                    (heap, event_loop, env)
                },
                |(heap, event_loop, env)| {
                    black_box(env.teardown());
                    (heap, event_loop, env)
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_wrap_finalize, bench_collect, bench_teardown);
criterion_main!(benches);

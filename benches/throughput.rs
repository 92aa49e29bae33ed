//! Throughput Benchmark for flashcache
//!
//! This benchmark measures the storage engine, the request line parser and
//! the command handler under various workloads.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashcache::commands::{CommandHandler, HandlerSettings};
use flashcache::protocol::parse_command;
use flashcache::storage::{SlabConfig, StorageEngine};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

/// Stores `value` the way a completed `set` does.
fn store(engine: &mut StorageEngine, key: &[u8], value: &[u8]) {
    let Ok(id) = engine.allocate(key, 0, None, value.len() + 2) else {
        return;
    };
    let data = engine.item_mut(id).value_mut();
    data[..value.len()].copy_from_slice(value);
    data[value.len()..].copy_from_slice(b"\r\n");

    match engine.find(key) {
        Some(old) => engine.replace(old, id),
        None => engine.link(id),
    }
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let mut engine = StorageEngine::new(SlabConfig::default());

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i);
            store(&mut engine, key.as_bytes(), b"small_value");
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = vec![b'x'; 1024]; // 1KB value
        b.iter(|| {
            let key = format!("key:{}", i);
            store(&mut engine, key.as_bytes(), &value);
            i += 1;
        });
    });

    // 4MB of memory fills quickly, so this mostly measures eviction
    group.bench_function("set_evicting", |b| {
        let mut engine = StorageEngine::new(SlabConfig {
            mem_limit: 4 * 1024 * 1024,
            ..SlabConfig::default()
        });
        let mut i = 0u64;
        let value = vec![b'x'; 16 * 1024]; // 16KB value
        b.iter(|| {
            let key = format!("key:{}", i);
            store(&mut engine, key.as_bytes(), &value);
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET lookups
fn bench_get(c: &mut Criterion) {
    let mut engine = StorageEngine::new(SlabConfig::default());

    // Pre-populate with data
    for i in 0..100_000 {
        let key = format!("key:{}", i);
        let value = format!("value:{}", i);
        store(&mut engine, key.as_bytes(), value.as_bytes());
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            if let Some(id) = engine.find_live(key.as_bytes(), Instant::now()) {
                engine.touch(id);
                black_box(engine.item(id).data_len());
            }
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(engine.find_live(key.as_bytes(), Instant::now()));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark mixed workload (80% reads, 20% writes)
fn bench_mixed(c: &mut Criterion) {
    let mut engine = StorageEngine::new(SlabConfig::default());

    // Pre-populate
    for i in 0..10_000 {
        let key = format!("key:{}", i);
        let value = format!("value:{}", i);
        store(&mut engine, key.as_bytes(), value.as_bytes());
    }

    let mut group = c.benchmark_group("mixed");
    group.throughput(Throughput::Elements(1));

    group.bench_function("80_read_20_write", |b| {
        let mut i = 0u64;
        b.iter(|| {
            if i % 5 == 0 {
                // 20% writes
                let key = format!("new:{}", i);
                store(&mut engine, key.as_bytes(), b"value");
            } else {
                // 80% reads
                let key = format!("key:{}", i % 10_000);
                black_box(engine.find_live(key.as_bytes(), Instant::now()));
            }
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark request line parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    let set = Bytes::from_static(b"set user:1234 0 3600 512 noreply");
    group.bench_function("set_line", |b| {
        b.iter(|| black_box(parse_command(&set)));
    });

    let keys: Vec<String> = (0..100).map(|i| format!("key:{}", i)).collect();
    let multiget = Bytes::from(format!("get {}", keys.join(" ")));
    group.bench_function("get_100_keys", |b| {
        b.iter(|| black_box(parse_command(&multiget)));
    });

    group.finish();
}

/// Benchmark INCR through the command handler
fn bench_incr(c: &mut Criterion) {
    let storage = Rc::new(RefCell::new(StorageEngine::new(SlabConfig::default())));
    let handler = CommandHandler::new(Rc::clone(&storage), HandlerSettings::default());

    {
        let mut engine = storage.borrow_mut();
        store(&mut engine, b"counter", b"0");
        for i in 0..1000 {
            store(&mut engine, format!("counter:{}", i).as_bytes(), b"0");
        }
    }

    let mut group = c.benchmark_group("incr");
    group.throughput(Throughput::Elements(1));

    // Single counter, grows in place until it needs a bigger item
    group.bench_function("single_counter", |b| {
        let line = Bytes::from_static(b"incr counter 1");
        b.iter(|| black_box(handler.process(&line)));
    });

    group.bench_function("multiple_counters", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let line = Bytes::from(format!("incr counter:{} 1", i % 1000));
            black_box(handler.process(&line));
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_mixed,
    bench_parse,
    bench_incr,
);
criterion_main!(benches);

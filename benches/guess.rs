//! Hash guess vs. ordered page scan for point lookups.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use leafhash::storage::page;
use leafhash::{
    Ahi, AhiConfig, Block, BufferPool, Cursor, Dict, IndexDef, IndexField, LatchMode, RecFormat,
    Tuple, LEFT_SIDE,
};

struct Bench {
    _pool: Arc<BufferPool>,
    ahi: Ahi,
    index: Arc<IndexDef>,
    leaf: *const Block,
    keys: Vec<[u8; 4]>,
}

fn setup() -> Bench {
    let pool = BufferPool::new(64).unwrap();
    let dict = Dict::new();
    let ahi = Ahi::new(Arc::clone(&pool), Arc::clone(&dict), AhiConfig::default());
    let index = IndexDef::new(
        1,
        RecFormat::Compact,
        vec![IndexField::fixed(4), IndexField::variable(16)],
        1,
    );
    dict.register(Arc::clone(&index));

    let keys: Vec<[u8; 4]> = (0..200u32)
        .map(|i| {
            let mut k = [0u8; 4];
            k.copy_from_slice(format!("{:04}", i).as_bytes());
            k
        })
        .collect();

    let block = pool.alloc_block().unwrap();
    unsafe {
        page::leaf_init(block.frame(), &index);
        let mut prev = page::page_infimum(block.frame());
        for key in &keys {
            prev = page::page_insert_after(
                block.frame(),
                prev,
                &index,
                &[Some(&key[..]), Some(b"v")],
                0,
            )
            .unwrap();
        }
    }
    pool.register_page(block, 1);

    let params = LEFT_SIDE | 1;
    block.latch.s_lock();
    ahi.build_page_hash_index(&index, block, params);
    block.latch.s_unlock();

    let info = &index.search_info;
    info.left_bytes_fields.store(params, Ordering::Relaxed);
    info.n_hash_potential.store(100, Ordering::Relaxed);
    info.last_hash_succ.store(true, Ordering::Relaxed);

    let leaf = block as *const Block;
    Bench {
        _pool: pool,
        ahi,
        index,
        leaf,
        keys,
    }
}

fn bench_point_lookup(c: &mut Criterion) {
    let bench = setup();
    let leaf = unsafe { &*bench.leaf };
    let tuples: Vec<Tuple> = bench
        .keys
        .iter()
        .map(|k| Tuple::from_values(&[Some(&k[..])]))
        .collect();

    let mut group = c.benchmark_group("point_lookup");

    group.bench_function("guess_hit", |b| {
        let mut cursor = Cursor::new(Arc::clone(&bench.index));
        let mut i = 0;
        b.iter(|| {
            let tuple = &tuples[i % tuples.len()];
            i += 1;
            let hit = bench.ahi.guess_on_hash(
                &bench.index,
                black_box(tuple),
                true,
                LatchMode::Shared,
                &mut cursor,
            );
            assert!(hit);
            cursor.release();
        });
    });

    group.bench_function("page_scan", |b| {
        let mut i = 0;
        b.iter(|| {
            let tuple = &tuples[i % tuples.len()];
            i += 1;
            // Disarm the guess so the scan path runs.
            bench
                .index
                .search_info
                .last_hash_succ
                .store(false, Ordering::Relaxed);
            let mut cursor = Cursor::new(Arc::clone(&bench.index));
            let exact = cursor.search_leaf(&bench.ahi, leaf, black_box(tuple), true, LatchMode::Shared);
            assert!(exact);
            cursor.release();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_point_lookup);
criterion_main!(benches);

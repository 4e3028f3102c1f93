//! Hash family throughput over a synthetic key stream.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use morsel::config::Node;
use morsel::hash::TupleHasher;
use morsel::schema::{ColumnType, Schema};

fn bench_hashers(c: &mut Criterion) {
    let schema = Schema::new(&[ColumnType::Int64]);
    let keys: Vec<[u8; 8]> = (0..4096i64).map(|i| (i * 2654435761).to_ne_bytes()).collect();

    let mut group = c.benchmark_group("hash");
    for name in ["modulo", "knuth", "willis", "bytes", "tpchorderkey"] {
        let node = Node::group()
            .with("fn", name)
            .with("buckets", 1024)
            .with("field", 0);
        let hasher = TupleHasher::create(&schema, &node).unwrap();

        group.bench_function(name, |b| {
            b.iter(|| {
                let mut acc = 0u32;
                for key in &keys {
                    acc ^= hasher.hash(black_box(key));
                }
                acc
            })
        });
    }
    group.finish();
}

fn bench_table_insert(c: &mut Criterion) {
    use morsel::hashtable::HashTable;

    c.bench_function("hashtable/atomic_allocate", |b| {
        let ht = HashTable::init(1024, 64, 8, &[], 0).unwrap();
        ht.bucketclear(0, 1);
        b.iter(|| {
            // One tuple per bucket, cleared each iteration, so chains
            // never build up across the run.
            for bucket in 0..1024 {
                black_box(ht.atomic_allocate(bucket, 0));
            }
            ht.bucketclear(0, 1);
        });
    });
}

criterion_group!(benches, bench_hashers, bench_table_insert);
criterion_main!(benches);

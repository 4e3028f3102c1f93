//! Hash table iteration and persistence round-trips over random sizes.

use morsel::hashtable::HashTable;
use rand::Rng;

const ROUNDS: usize = 10;

fn write_tuple(ptr: std::ptr::NonNull<u8>, v: i32) {
    unsafe { ptr.as_ptr().cast::<i32>().write_unaligned(v) }
}

fn read_tuple(ptr: std::ptr::NonNull<u8>) -> i32 {
    unsafe { ptr.as_ptr().cast::<i32>().read_unaligned() }
}

/// Insert `0..n` into a single two-tuple bucket and check the chain
/// iterator yields each value exactly once.
fn check_iteration(n: usize) {
    let ht = HashTable::init(1, 2 * 4, 4, &[], 0).unwrap();
    ht.bucketclear(0, 1);

    for i in 0..n {
        write_tuple(ht.allocate(0, 0), i as i32);
    }

    ht.prefetch(0);

    let mut valid = vec![0u32; n];
    let mut it = ht.create_iterator();
    ht.place_iterator(&mut it, 0);
    while let Some(tup) = it.next() {
        let v = read_tuple(tup);
        assert!(v >= 0 && (v as usize) < n, "value outside generated range");
        valid[v as usize] += 1;
    }

    assert!(
        valid.iter().all(|&count| count == 1),
        "a value does not appear exactly once"
    );

    ht.bucketclear(0, 1);
}

/// Insert `0..n` into an `n`-bucket table (one value per bucket, no
/// overflow), serialize, restore into a fresh table, and check every
/// value sits in its original bucket.
fn check_persistence(n: usize) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hashtable.test");

    let ht = HashTable::init(n, 4, 4, &[], 0).unwrap();
    ht.bucketclear(0, 1);
    for i in 0..n {
        write_tuple(ht.allocate(i, 0), i as i32);
    }
    assert_eq!(ht.stat_spills(), 0);
    ht.serialize(&path, 0).unwrap();

    let restored = HashTable::init(n, 4, 4, &[], 0).unwrap();
    restored.deserialize(&path, 0).unwrap();

    let mut valid = vec![0u32; n];
    let mut it = restored.create_iterator();
    for bucket in 0..n {
        restored.place_iterator(&mut it, bucket);
        while let Some(tup) = it.next() {
            let v = read_tuple(tup);
            assert_eq!(v as usize, bucket, "value restored into the wrong bucket");
            valid[v as usize] += 1;
        }
    }
    assert!(
        valid.iter().all(|&count| count == 1),
        "a value does not appear exactly once after restore"
    );

    restored.bucketclear(0, 1);
    ht.bucketclear(0, 1);
}

#[test]
fn test_iteration_random_sizes() {
    let mut rng = rand::thread_rng();
    for _ in 0..ROUNDS {
        check_iteration(rng.gen_range(0..10_000));
    }
}

#[test]
fn test_persistence_random_sizes() {
    let mut rng = rand::thread_rng();
    for _ in 0..ROUNDS {
        check_persistence(rng.gen_range(1..10_000));
    }
}

#[test]
fn test_used_bytes_invariant_across_chains() {
    let mut rng = rand::thread_rng();
    let tuple_size = 8;
    let per_bucket = 4;
    let ht = HashTable::init(16, per_bucket * tuple_size, tuple_size, &[], 0).unwrap();
    ht.bucketclear(0, 1);

    let mut expected = vec![0u64; 16];
    for _ in 0..5_000 {
        let bucket = rng.gen_range(0..16);
        ht.atomic_allocate(bucket, 0);
        expected[bucket] += 1;
    }

    // Sum of used bytes across each chain is a whole number of tuples,
    // bounded by chain length times the bucket payload.
    let mut it = ht.create_iterator();
    for bucket in 0..16 {
        ht.place_iterator(&mut it, bucket);
        let mut count = 0u64;
        while it.next().is_some() {
            count += 1;
        }
        assert_eq!(count, expected[bucket]);
    }

    let spills = ht.stat_spills();
    let overflowed: u64 = expected
        .iter()
        .map(|&tuples| tuples.saturating_sub(per_bucket as u64).div_ceil(per_bucket as u64))
        .sum();
    assert_eq!(spills, overflowed);

    ht.bucketclear(0, 1);
}

#[test]
fn test_histogram_after_clear() {
    let ht = HashTable::init(256, 32, 8, &[], 0).unwrap();
    ht.bucketclear(0, 1);

    let histogram = ht.stat_buckets();
    assert_eq!(histogram, vec![256]);

    for bucket in 0..256 {
        ht.atomic_allocate(bucket, 0);
    }
    assert_eq!(ht.stat_buckets(), vec![0, 256]);

    ht.bucketclear(0, 1);
    assert_eq!(ht.stat_buckets(), vec![256]);
}

//! Hash function properties: bucket bounds, exact-range boundary laws,
//! and multi-pass mask decomposition.

use morsel::config::Node;
use morsel::hash::{log2_ceil, HashFn, TupleHasher};
use morsel::schema::{ColumnType, Schema};
use rand::Rng;

const TESTS: usize = 20_000;

fn hasher(fn_name: &str, buckets: i64) -> TupleHasher {
    let schema = Schema::new(&[ColumnType::Int64]);
    let node = Node::group()
        .with("fn", fn_name)
        .with("buckets", buckets)
        .with("field", 0);
    TupleHasher::create(&schema, &node).unwrap()
}

fn hasher_with_range(fn_name: &str, buckets: i64, min: i64, max: i64) -> TupleHasher {
    let schema = Schema::new(&[ColumnType::Int64]);
    let node = Node::group()
        .with("fn", fn_name)
        .with("buckets", buckets)
        .with("field", 0)
        .with("range", vec![min, max]);
    TupleHasher::create(&schema, &node).unwrap()
}

#[test]
fn test_log2_ceil_matches_float_computation() {
    let mut rng = rand::thread_rng();
    for _ in 0..TESTS {
        let v: u32 = rng.gen_range(1..=1 << 10);
        let expected = (v as f64).log2().ceil() as u32;
        assert_eq!(log2_ceil(v), expected, "log2_ceil({v})");
    }
}

#[test]
fn test_modulo_bounds() {
    let modulo = hasher("modulo", 1024);
    assert_eq!(modulo.buckets(), 1024);

    let mut rng = rand::thread_rng();
    for _ in 0..TESTS {
        let value: i64 = rng.gen();
        let h = modulo.hash(&value.to_ne_bytes());
        assert!(h < 1024, "hash({value}) = {h} out of bounds");
    }
}

#[test]
fn test_always_zero() {
    let zero = hasher("alwayszero", 0);
    assert_eq!(zero.buckets(), 1);

    let mut rng = rand::thread_rng();
    for _ in 0..TESTS {
        let value: i64 = rng.gen();
        assert_eq!(zero.hash(&value.to_ne_bytes()), 0);
    }
}

#[test]
fn test_bucket_count_rounds_up_to_power_of_two() {
    for requested in [1i64, 2, 3, 5, 100, 1000, 1024, 4097] {
        let h = hasher("modulo", requested);
        let buckets = h.buckets() as u64;
        assert!(buckets.is_power_of_two());
        assert!(buckets >= requested as u64);
        assert!(buckets / 2 < requested as u64);
    }
}

#[test]
fn test_exact_range_boundaries() {
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let max: i64 = rng.gen_range(100..1 << 30) & !1;
        let min: i64 = rng.gen_range(0..max);

        let tuple_hasher = hasher_with_range("exactrange", 80, min, max);
        assert_eq!(tuple_hasher.buckets(), 80);

        let exact = match tuple_hasher.function() {
            HashFn::ExactRange(e) => *e,
            other => panic!("expected an exact-range hasher, got {other:?}"),
        };

        let hash = |v: i64| tuple_hasher.hash(&v.to_ne_bytes());
        assert!(hash(max) <= 79, "max value must land in a valid bucket");

        // Monotonic boundary law: the minimum of each internal bucket
        // hashes into it, and its predecessor into the bucket before.
        for b in 1..80u32 {
            let boundary = exact.minimum_for_bucket(b);
            assert_eq!(hash(boundary), b, "minimum for bucket {b}");
            assert_eq!(hash(boundary - 1), b - 1, "value below minimum for bucket {b}");
        }
    }
}

#[test]
fn test_parammodulo_generate_masks() {
    let schema = Schema::new(&[ColumnType::Int64]);
    let node = Node::group()
        .with("fn", "parammodulo")
        .with("buckets", 1024)
        .with("field", 0)
        .with("skipbits", 2);
    let hasher = TupleHasher::create(&schema, &node).unwrap();
    assert_eq!(hasher.buckets(), 1 << 10);

    let passes = hasher.function().generate(3).unwrap();
    assert_eq!(passes.len(), 3);
    assert_eq!(passes[0].buckets(), 1 << 3);
    assert_eq!(passes[1].buckets(), 1 << 3);
    assert_eq!(passes[2].buckets(), 1 << 4);

    // Composing the passes reproduces every bit of the original hash:
    // each pass hashes a disjoint bit range, highest bits first.
    let mut rng = rand::thread_rng();
    for _ in 0..TESTS {
        let value: i64 = rng.gen_range(0..1 << 40);
        let full = hasher.hash(&value.to_ne_bytes());

        let mut recomposed = 0u32;
        for pass in &passes {
            recomposed = (recomposed << (log2_ceil(pass.buckets()))) | pass.hash_value(value);
        }
        assert_eq!(recomposed, full, "passes must compose to the full hash of {value}");
    }
}

#[test]
fn test_knuth_and_willis_bounds() {
    let mut rng = rand::thread_rng();
    for name in ["knuth", "willis", "tpchorderkey"] {
        let h = hasher(name, 512);
        assert_eq!(h.buckets(), 512);
        for _ in 0..TESTS {
            let value: i64 = rng.gen();
            assert!(h.hash(&value.to_ne_bytes()) < 512);
        }
    }
}

#[test]
fn test_byte_hasher_composite_key() {
    let schema = Schema::new(&[ColumnType::Int64, ColumnType::Char(16)]);
    let node = Node::group()
        .with("fn", "bytes")
        .with("buckets", 64)
        .with("fieldrange", vec![0i64, 1]);
    let h = TupleHasher::create(&schema, &node).unwrap();
    assert_eq!(h.buckets(), 64);

    let mut rng = rand::thread_rng();
    for _ in 0..TESTS {
        let mut tuple = [0u8; 24];
        rng.fill(&mut tuple[..]);
        assert!(h.hash(&tuple) < 64);
    }
}

#[test]
fn test_factory_rejections() {
    let longs = Schema::new(&[ColumnType::Int64, ColumnType::Int64]);
    let chars = Schema::new(&[ColumnType::Char(8)]);

    // Zero buckets.
    let node = Node::group().with("fn", "modulo").with("buckets", 0).with("field", 0);
    assert!(TupleHasher::create(&longs, &node).is_err());

    // Unknown function name.
    let node = Node::group().with("fn", "murmur").with("buckets", 8).with("field", 0);
    assert!(TupleHasher::create(&longs, &node).is_err());

    // Composite key for a value hasher.
    let node = Node::group()
        .with("fn", "knuth")
        .with("buckets", 8)
        .with("fieldrange", vec![0i64, 1]);
    assert!(TupleHasher::create(&longs, &node).is_err());

    // Non-numeric key for a value hasher.
    let node = Node::group().with("fn", "modulo").with("buckets", 8).with("field", 0);
    assert!(TupleHasher::create(&chars, &node).is_err());

    // Missing field spec.
    let node = Node::group().with("fn", "modulo").with("buckets", 8);
    assert!(TupleHasher::create(&longs, &node).is_err());
}

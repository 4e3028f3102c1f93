//! Operator lifecycle and end-to-end pipelines: scan → filter →
//! project → aggregate under the state checker, single- and
//! multi-threaded.

use std::sync::Arc;

use morsel::checker::CallStateChecker;
use morsel::config::Node;
use morsel::operator::{Operator, ResultCode, ThreadId};
use morsel::ops::{FilterOp, HashAggregateOp, MemScanOp, ProjectOp};
use morsel::page::Page;
use morsel::perf::PerfCountOp;
use morsel::schema::{ColumnType, Schema};

/// Pages of `(key: i64, value: i64)` tuples.
fn pages_of_pairs(pairs: &[(i64, i64)], per_page: usize) -> Vec<Page> {
    let tuple_size = 16;
    pairs
        .chunks(per_page)
        .map(|chunk| {
            let mut page = Page::new(chunk.len() * tuple_size, tuple_size, 0);
            for &(k, v) in chunk {
                let mut tuple = [0u8; 16];
                tuple[..8].copy_from_slice(&k.to_ne_bytes());
                tuple[8..].copy_from_slice(&v.to_ne_bytes());
                assert!(page.append(&tuple));
            }
            page
        })
        .collect()
}

fn pair_schema() -> Schema {
    Schema::new(&[ColumnType::Int64, ColumnType::Int64])
}

/// Runs one worker through a full scan and collects every output tuple.
fn drain(op: &dyn Operator, thread: ThreadId) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let schema_size = op.schema().tuple_size();

    op.scan_start(thread, None, &Schema::new(&[])).unwrap();
    loop {
        let (code, page) = op.get_next(thread);
        let page = page.expect("non-error calls carry a page");
        for tuple in page.tuples() {
            assert_eq!(tuple.len(), schema_size);
            out.push(tuple.to_vec());
        }
        match code {
            ResultCode::Ready => continue,
            ResultCode::Finished => break,
            ResultCode::Error => panic!("unexpected error from get_next"),
        }
    }
    op.scan_stop(thread).unwrap();
    out
}

#[test]
fn test_scan_filter_project_single_thread() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    let pairs: Vec<(i64, i64)> = (0..1000).map(|i| (i, i * 10)).collect();
    scan.stage(0, pages_of_pairs(&pairs, 100));

    // keep tuples with key < 250, then project the value column
    let filter_cfg = Node::group().with("field", 0).with("op", "<").with("value", 250);
    let filter = Arc::new(FilterOp::new(scan, &filter_cfg).unwrap());

    let project_cfg = Node::group().with("fields", vec![1i64]);
    let project = ProjectOp::new(filter, &project_cfg).unwrap();
    let checked = CallStateChecker::new(Arc::new(project));

    checked.init(&Node::group(), &Node::group()).unwrap();
    checked.thread_init(0).unwrap();

    let tuples = drain(&checked, 0);
    assert_eq!(tuples.len(), 250);
    for (i, tuple) in tuples.iter().enumerate() {
        let v = i64::from_ne_bytes(tuple.as_slice().try_into().unwrap());
        assert_eq!(v, i as i64 * 10);
    }

    checked.thread_close(0);
    checked.destroy();
}

#[test]
fn test_filter_empty_result_is_finished() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    scan.stage(0, pages_of_pairs(&[(1, 1), (2, 2)], 16));

    let cfg = Node::group().with("field", 0).with("op", ">").with("value", 100);
    let filter = CallStateChecker::new(Arc::new(FilterOp::new(scan, &cfg).unwrap()));

    filter.init(&Node::group(), &Node::group()).unwrap();
    filter.thread_init(0).unwrap();
    assert!(drain(&filter, 0).is_empty());
    filter.thread_close(0);
    filter.destroy();
}

#[test]
fn test_aggregate_counts_groups_single_thread() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    // 40 tuples over 8 keys: key k appears k+1 times for k in 0..8
    // minus what doesn't fit; build explicitly.
    let mut pairs = Vec::new();
    for key in 0..8i64 {
        for _ in 0..=key {
            pairs.push((key, 100));
        }
    }
    scan.stage(0, pages_of_pairs(&pairs, 7));

    let cfg = Node::group().with("threads", 1).with(
        "hash",
        Node::group().with("fn", "modulo").with("buckets", 8).with("field", 0),
    );
    let agg = CallStateChecker::new(Arc::new(HashAggregateOp::new(scan, &cfg).unwrap()));

    agg.init(&Node::group(), &Node::group()).unwrap();
    assert_eq!(agg.schema().columns(), 2);
    agg.thread_init(0).unwrap();

    let mut counts = vec![0i64; 8];
    for tuple in drain(&agg, 0) {
        let key = i64::from_ne_bytes(tuple[..8].try_into().unwrap());
        let count = i64::from_ne_bytes(tuple[8..].try_into().unwrap());
        assert_eq!(counts[key as usize], 0, "each group appears once");
        counts[key as usize] = count;
    }
    for key in 0..8i64 {
        assert_eq!(counts[key as usize], key + 1, "count for key {key}");
    }

    agg.thread_close(0);
    agg.destroy();
}

#[test]
fn test_aggregate_sums_across_workers() {
    const THREADS: u16 = 4;
    const KEYS: i64 = 32;

    let scan = Arc::new(MemScanOp::new(pair_schema()));
    // Every worker contributes value `key` for every key, so the global
    // sum per key is THREADS * key.
    for t in 0..THREADS {
        let pairs: Vec<(i64, i64)> = (0..KEYS).map(|k| (k, k)).collect();
        scan.stage(t, pages_of_pairs(&pairs, 5));
    }

    let cfg = Node::group()
        .with("threads", THREADS as i64)
        .with("sumfield", 1)
        .with(
            "hash",
            Node::group().with("fn", "modulo").with("buckets", KEYS).with("field", 0),
        );
    let agg = Arc::new(HashAggregateOp::new(scan, &cfg).unwrap());
    let checked = Arc::new(CallStateChecker::new(agg));

    checked.init(&Node::group(), &Node::group()).unwrap();

    let mut sums = vec![0i64; KEYS as usize];
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let checked = Arc::clone(&checked);
                scope.spawn(move || {
                    checked.thread_init(t).unwrap();
                    let tuples = drain(checked.as_ref(), t);
                    checked.thread_close(t);
                    tuples
                })
            })
            .collect();

        for handle in handles {
            for tuple in handle.join().unwrap() {
                let key = i64::from_ne_bytes(tuple[..8].try_into().unwrap());
                let sum = i64::from_ne_bytes(tuple[8..].try_into().unwrap());
                assert_eq!(sums[key as usize], 0, "each group is emitted by one worker");
                sums[key as usize] = sum;
            }
        }
    });

    for key in 0..KEYS {
        assert_eq!(sums[key as usize], THREADS as i64 * key, "sum for key {key}");
    }

    checked.destroy();
}

#[test]
fn test_keyless_aggregate_counts_everything() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    let pairs: Vec<(i64, i64)> = (0..500).map(|i| (i, 1)).collect();
    scan.stage(0, pages_of_pairs(&pairs, 64));

    let cfg = Node::group()
        .with("threads", 1)
        .with("hash", Node::group().with("fn", "alwayszero"));
    let agg = HashAggregateOp::new(scan, &cfg).unwrap();

    agg.init(&Node::group(), &Node::group()).unwrap();
    assert_eq!(agg.schema().columns(), 1);
    agg.thread_init(0).unwrap();

    let tuples = drain(&agg, 0);
    assert_eq!(tuples.len(), 1);
    let count = i64::from_ne_bytes(tuples[0].as_slice().try_into().unwrap());
    assert_eq!(count, 500);

    agg.thread_close(0);
    agg.destroy();
}

#[test]
fn test_perfcount_wrapper_is_transparent() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    scan.stage(0, pages_of_pairs(&[(1, 10), (2, 20), (3, 30)], 2));

    let wrapped = PerfCountOp::new(scan);
    wrapped.init(&Node::group(), &Node::group()).unwrap();
    wrapped.thread_init(0).unwrap();

    let tuples = drain(&wrapped, 0);
    assert_eq!(tuples.len(), 3);

    // One sample per delegated call: 2 data pages + 1 finished page.
    let stats = wrapped.stats(0, morsel::perf::CallSite::GetNext);
    assert_eq!(stats.calls, 3);
    assert_eq!(wrapped.stats(0, morsel::perf::CallSite::ScanStart).calls, 1);

    wrapped.thread_close(0);
    wrapped.destroy();
}

#[test]
fn test_finished_is_idempotent_under_checker() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    scan.stage(0, pages_of_pairs(&[(1, 1)], 4));
    let checked = CallStateChecker::new(scan);

    checked.init(&Node::group(), &Node::group()).unwrap();
    checked.thread_init(0).unwrap();
    checked.scan_start(0, None, &Schema::new(&[])).unwrap();

    let (code, _) = checked.get_next(0);
    assert_eq!(code, ResultCode::Ready);
    let (code, _) = checked.get_next(0);
    assert_eq!(code, ResultCode::Finished);

    // The checker probes the child ten more times on each further call.
    for _ in 0..3 {
        let (code, page) = checked.get_next(0);
        assert_eq!(code, ResultCode::Finished);
        assert_eq!(page.unwrap().num_tuples(), 0);
    }

    checked.scan_stop(0).unwrap();
    checked.thread_close(0);
    checked.destroy();
}

#[test]
#[should_panic(expected = "illegal state")]
fn test_checker_rejects_get_next_before_scan_start() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    let checked = CallStateChecker::new(scan);
    checked.init(&Node::group(), &Node::group()).unwrap();
    checked.thread_init(0).unwrap();
    let _ = checked.get_next(0);
}

#[test]
#[should_panic(expected = "illegal state")]
fn test_checker_rejects_double_thread_init() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    let checked = CallStateChecker::new(scan);
    checked.init(&Node::group(), &Node::group()).unwrap();
    checked.thread_init(0).unwrap();
    checked.thread_init(0).unwrap();
}

#[test]
#[should_panic(expected = "destroy() called before thread")]
fn test_checker_rejects_destroy_with_open_threads() {
    let scan = Arc::new(MemScanOp::new(pair_schema()));
    let checked = CallStateChecker::new(scan);
    checked.init(&Node::group(), &Node::group()).unwrap();
    checked.thread_init(0).unwrap();
    checked.destroy();
}

#[test]
fn test_double_init_is_rejected() {
    let scan = MemScanOp::new(pair_schema());
    scan.init(&Node::group(), &Node::group()).unwrap();
    assert!(scan.init(&Node::group(), &Node::group()).is_err());
    scan.destroy();
}

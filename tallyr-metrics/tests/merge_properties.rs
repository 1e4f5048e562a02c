use std::sync::Arc;

use tallyr_metrics::{
    Applied, ExecutionId, LatencyHistogram, MergedSampleSummary, RawSample, SampleAggregator,
};

fn node_stream(exec: ExecutionId, node: &str, seed: u64) -> Vec<RawSample> {
    (1..=3u64)
        .map(|step| {
            let mut s = RawSample::new(exec, node, "login", step * 1_000);
            s.counters.transactions = step * 10 * seed;
            s.counters.operations = step * 11 * seed;
            s.counters.errors = step * seed;
            s.counters.iterations = step * 5;
            s.counters.bytes_read = step * 1_024;
            s.duration_secs = step as f64 * seed as f64;
            s.latency.mean = 10.0 + seed as f64 + step as f64;
            s.latency.min = 1.0;
            s.latency.max = 100.0 * seed as f64;
            s.latency.p95 = 40.0 * seed as f64 + step as f64;
            s.threads.active = seed * step;
            s.threads.size = seed * 10;
            s.threads.running = step < 3;
            s.finish = step == 3;
            s
        })
        .collect()
}

/// Every interleaving of `a` and `b` that preserves each side's own order.
fn interleavings(a: &[RawSample], b: &[RawSample]) -> Vec<Vec<RawSample>> {
    if a.is_empty() {
        return vec![b.to_vec()];
    }
    if b.is_empty() {
        return vec![a.to_vec()];
    }

    let mut out = Vec::new();
    for mut rest in interleavings(&a[1..], b) {
        rest.insert(0, a[0].clone());
        out.push(rest);
    }
    for mut rest in interleavings(a, &b[1..]) {
        rest.insert(0, b[0].clone());
        out.push(rest);
    }
    out
}

fn replay(samples: Vec<RawSample>) -> (SampleAggregator, ExecutionId) {
    let exec = samples[0].execution_id;
    let agg = SampleAggregator::new();
    for s in samples {
        agg.ingest(s).unwrap_or_else(|e| panic!("{e}"));
    }
    (agg, exec)
}

fn latest(agg: &SampleAggregator, exec: ExecutionId) -> MergedSampleSummary {
    agg.latest(exec, "login")
        .unwrap_or_else(|| panic!("expected summary"))
}

#[test]
fn interleavings_across_nodes_converge_to_the_same_summary() {
    let exec = ExecutionId::generate();
    let a = node_stream(exec, "node-a", 1);
    let b = node_stream(exec, "node-b", 3);

    let orders = interleavings(&a, &b);
    assert_eq!(orders.len(), 20);

    let (agg, _) = replay(orders[0].clone());
    let expected = latest(&agg, exec);
    assert!(expected.finish);
    assert!(!expected.threads.running);

    for order in orders.into_iter().skip(1) {
        let (agg, _) = replay(order);
        assert_eq!(latest(&agg, exec), expected);
    }
}

#[test]
fn reordering_within_a_node_keeps_the_newest_sample() {
    let exec = ExecutionId::generate();
    let mut a = node_stream(exec, "node-a", 1);
    a.reverse();

    let (agg, _) = replay(a);
    let s = latest(&agg, exec);
    // Only the first delivered (newest) sample was applied.
    assert_eq!(s.counters.transactions, 30);
    assert!(s.finish);
}

#[test]
fn redelivery_is_idempotent() {
    let exec = ExecutionId::generate();
    let a = node_stream(exec, "node-a", 2);
    let b = node_stream(exec, "node-b", 1);

    let (agg, _) = replay(a.iter().chain(b.iter()).cloned().collect());
    let before = latest(&agg, exec);

    for s in a.into_iter().chain(b) {
        let applied = agg.ingest(s).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(applied, Applied::Discarded);
    }
    assert_eq!(latest(&agg, exec), before);
}

#[test]
fn merged_tps_is_recomputed_not_averaged_or_summed() {
    let exec = ExecutionId::generate();
    let mut a = RawSample::new(exec, "a", "login", 1);
    a.counters.transactions = 100;
    a.duration_secs = 10.0;
    a.throughput.tps = 10.0;
    let mut b = RawSample::new(exec, "b", "login", 1);
    b.counters.transactions = 100;
    b.duration_secs = 20.0;
    b.throughput.tps = 5.0;

    let (agg, _) = replay(vec![a, b]);
    let s = latest(&agg, exec);
    assert_eq!(s.counters.transactions, 200);
    assert_eq!(s.duration_secs, 20.0);
    assert!((s.throughput.tps - 10.0).abs() < 1e-9);
}

#[test]
fn counters_are_monotonic_over_any_stream() {
    let exec = ExecutionId::generate();
    let a = node_stream(exec, "node-a", 1);
    let b = node_stream(exec, "node-b", 2);

    for order in interleavings(&a, &b) {
        let agg = SampleAggregator::new();
        let mut prev: Option<MergedSampleSummary> = None;
        for s in order {
            agg.ingest(s).unwrap_or_else(|e| panic!("{e}"));
            let cur = latest(&agg, exec);
            if let Some(prev) = &prev {
                assert!(cur.counters.transactions >= prev.counters.transactions);
                assert!(cur.counters.operations >= prev.counters.operations);
                assert!(cur.counters.bytes_read >= prev.counters.bytes_read);
                assert!(cur.duration_secs >= prev.duration_secs);
            }
            prev = Some(cur);
        }
    }
}

#[test]
fn finish_waits_for_every_contributing_node() {
    let exec = ExecutionId::generate();
    let mut a = RawSample::new(exec, "a", "login", 1);
    a.finish = true;
    let b = RawSample::new(exec, "b", "login", 1);
    let mut b_done = RawSample::new(exec, "b", "login", 2);
    b_done.finish = true;

    let agg = SampleAggregator::new();
    for s in [a, b] {
        agg.ingest(s).unwrap_or_else(|e| panic!("{e}"));
    }
    assert!(!latest(&agg, exec).finish);

    agg.ingest(b_done).unwrap_or_else(|e| panic!("{e}"));
    assert!(latest(&agg, exec).finish);
}

#[test]
fn histograms_on_every_node_yield_exact_percentiles() {
    let exec = ExecutionId::generate();
    let mut a = RawSample::new(exec, "a", "login", 1);
    a.counters.transactions = 99;
    a.latency.p99 = 1.0;
    a.histogram = Some(LatencyHistogram::from_micros(std::iter::repeat_n(1_000, 99)));
    let mut b = RawSample::new(exec, "b", "login", 1);
    b.counters.transactions = 1;
    b.latency.p99 = 500.0;
    b.histogram = Some(LatencyHistogram::from_micros([500_000]));

    let (agg, _) = replay(vec![a.clone(), b]);
    let exact = latest(&agg, exec);
    assert!(exact.exact_percentiles);
    // 99 of 100 observations are 1ms; the max-of-percentiles estimate would say 500ms.
    assert!(exact.latency.p95 < 2.0);
    assert!((exact.latency.max - 500.0).abs() < 1.0);

    let mut c = RawSample::new(exec, "c", "login", 1);
    c.latency.p99 = 500.0;
    let (agg, _) = replay(vec![a, c]);
    let estimated = latest(&agg, exec);
    assert!(!estimated.exact_percentiles);
    assert_eq!(estimated.latency.p99, 500.0);
}

#[test]
fn concurrent_ingestion_matches_sequential_replay() {
    let exec = ExecutionId::generate();
    let nodes: Vec<Vec<RawSample>> = (1..=8u64)
        .map(|n| node_stream(exec, &format!("node-{n}"), n))
        .collect();

    let sequential = {
        let (agg, _) = replay(nodes.iter().flatten().cloned().collect());
        latest(&agg, exec)
    };

    let agg = Arc::new(SampleAggregator::new());
    std::thread::scope(|scope| {
        for stream in &nodes {
            let agg = agg.clone();
            scope.spawn(move || {
                for s in stream {
                    agg.ingest(s.clone()).unwrap_or_else(|e| panic!("{e}"));
                }
            });
        }
    });

    assert_eq!(latest(&agg, exec), sequential);
    assert_eq!(latest(&agg, exec).node_count, 8);
}

use std::fmt;
use std::sync::Arc;

use hdrhistogram::Histogram;

use crate::sample::{Latency, Percentile};

/// Latency distribution recorded in microseconds.
///
/// In-process agents may attach one to a [`crate::RawSample`]; when every node of a key
/// carries one, merged percentiles are exact instead of the max-of-percentiles estimate.
#[derive(Clone)]
pub struct LatencyHistogram(Arc<Histogram<u64>>);

impl LatencyHistogram {
    pub fn from_micros(values: impl IntoIterator<Item = u64>) -> Self {
        let mut h = new_latency_histogram();
        for v in values {
            // Values outside the trackable range are dropped rather than failing the sample.
            let _ = h.record(v.max(1));
        }
        Self(Arc::new(h))
    }

    pub fn inner(&self) -> &Histogram<u64> {
        &self.0
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }
}

impl fmt::Debug for LatencyHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencyHistogram")
            .field("count", &self.0.len())
            .finish()
    }
}

pub(crate) fn new_latency_histogram() -> Histogram<u64> {
    // 1us .. 1h, 3 significant digits.
    match Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3) {
        Ok(h) => h,
        Err(err) => panic!("failed to create histogram: {err}"),
    }
}

pub(crate) fn merge_histograms<'a>(
    parts: impl IntoIterator<Item = &'a Histogram<u64>>,
) -> Histogram<u64> {
    let mut acc = new_latency_histogram();
    for h in parts {
        let _ = acc.add(h);
    }
    acc
}

/// Converts a microsecond histogram into millisecond latency aggregates.
pub(crate) fn summarize_histogram(h: &Histogram<u64>) -> Latency {
    if h.len() == 0 {
        return Latency::default();
    }

    let ms = |v: u64| v as f64 / 1_000.0;
    let mut out = Latency {
        mean: h.mean() / 1_000.0,
        min: ms(h.min()),
        max: ms(h.max()),
        ..Latency::default()
    };
    for p in Percentile::ALL {
        out.set_percentile(p, ms(h.value_at_quantile(p.quantile())));
    }
    out
}

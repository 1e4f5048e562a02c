pub mod aggregator;
pub mod histogram;
pub mod key;
pub mod rate;
pub mod sample;
pub mod summary;

pub use aggregator::{Applied, SampleAggregator, SampleKey};
pub use histogram::LatencyHistogram;
pub use key::{Interner, KeyId};
pub use sample::{
    Counters, ExecutionId, Latency, NodeId, Percentile, RampStage, RawSample, SampleError,
    ThreadPool, Throughput, UploadProgress,
};
pub use summary::{MergedSampleSummary, TOTAL_SAMPLE};

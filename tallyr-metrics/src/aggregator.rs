use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::key::{Interner, KeyId};
use crate::sample::{ExecutionId, RampStage, RawSample, SampleError};
use crate::summary::{FoldRules, Identity, MergedSampleSummary, Part, TOTAL_SAMPLE, fold};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub execution_id: ExecutionId,
    pub sample: KeyId,
    pub ramp_stage: Option<RampStage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Applied {
    /// The sample superseded its node's previous one and the summary was recomputed.
    Merged,
    /// Not newer than the node's last-known sample; nothing changed.
    Discarded,
}

#[derive(Debug, Default)]
struct KeyState {
    // Sorted by node id so reductions are independent of arrival order.
    nodes: SmallVec<[RawSample; 4]>,
    summary: Option<MergedSampleSummary>,
}

impl KeyState {
    fn apply(&mut self, key: &SampleKey, sample: RawSample) -> Applied {
        let identity = Identity {
            execution_id: key.execution_id,
            sample_name: sample.sample_name.clone(),
            ramp_stage: key.ramp_stage,
        };

        match self
            .nodes
            .binary_search_by(|known| known.node_id.cmp(&sample.node_id))
        {
            Ok(idx) => {
                if sample.source_timestamp <= self.nodes[idx].source_timestamp {
                    return Applied::Discarded;
                }
                self.nodes[idx] = sample;
            }
            Err(idx) => self.nodes.insert(idx, sample),
        }

        let parts: SmallVec<[Part<'_>; 4]> = self.nodes.iter().map(Part::from).collect();
        let merged = fold(
            identity,
            &parts,
            FoldRules::ACROSS_NODES,
            self.summary.as_ref(),
        );
        self.summary = Some(merged);
        Applied::Merged
    }
}

/// Merges per-node samples into one summary per (execution, sample, ramp stage).
///
/// Every key has its own lock; samples for unrelated keys never contend.
#[derive(Debug, Default)]
pub struct SampleAggregator {
    names: Interner,
    keys: DashMap<SampleKey, Arc<Mutex<KeyState>>, RandomState>,
    by_execution: DashMap<ExecutionId, BTreeSet<(KeyId, Option<RampStage>)>, RandomState>,
    // Last total handed out per execution; later totals are clamped against it.
    totals: DashMap<ExecutionId, Option<MergedSampleSummary>, RandomState>,
}

impl SampleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `sample` and folds it into its key's summary.
    pub fn ingest(&self, sample: RawSample) -> Result<Applied, SampleError> {
        let sample = sample.normalized()?;
        let key = SampleKey {
            execution_id: sample.execution_id,
            sample: self.names.get_or_intern(&sample.sample_name),
            ramp_stage: sample.ramp_stage,
        };

        // The index entry is held while the key is created so `remove_execution` never
        // sees one without the other.
        let state = {
            let mut index = self.by_execution.entry(key.execution_id).or_default();
            let state = self
                .keys
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(KeyState::default())))
                .clone();
            index.insert((key.sample, key.ramp_stage));
            state
        };

        let node = sample.node_id.clone();
        let timestamp = sample.source_timestamp;
        let applied = state.lock().apply(&key, sample);
        if applied == Applied::Discarded {
            tracing::debug!(
                execution_id = %key.execution_id,
                node = %node,
                timestamp,
                "discarding stale sample"
            );
        }
        Ok(applied)
    }

    /// Stage-less summary of one sample name.
    pub fn latest(
        &self,
        execution_id: ExecutionId,
        sample_name: &str,
    ) -> Option<MergedSampleSummary> {
        let sample = self.names.get(sample_name)?;
        self.snapshot(&SampleKey {
            execution_id,
            sample,
            ramp_stage: None,
        })
    }

    /// Per-stage summaries of one sample name, ordered by stage.
    pub fn latest_by_ramp_stage(
        &self,
        execution_id: ExecutionId,
        sample_name: &str,
    ) -> Vec<MergedSampleSummary> {
        let Some(sample) = self.names.get(sample_name) else {
            return Vec::new();
        };

        self.keys_of(execution_id)
            .into_iter()
            .filter(|(k, stage)| *k == sample && stage.is_some())
            .filter_map(|(sample, ramp_stage)| {
                self.snapshot(&SampleKey {
                    execution_id,
                    sample,
                    ramp_stage,
                })
            })
            .collect()
    }

    /// Every sample name of an execution reduced into one summary named [`TOTAL_SAMPLE`].
    ///
    /// A sample name contributes its stage-less summary when one exists, otherwise its
    /// ramp stages folded end to end. Counters and duration never drop below the last
    /// total returned for the execution, even when a stage-less summary first appears
    /// behind staged data.
    pub fn summary_total(&self, execution_id: ExecutionId) -> Option<MergedSampleSummary> {
        let keys = self.keys_of(execution_id);
        if keys.is_empty() {
            return None;
        }

        let mut per_sample: Vec<MergedSampleSummary> = Vec::new();
        let mut idx = 0;
        while idx < keys.len() {
            let sample = keys[idx].0;
            let end = keys[idx..]
                .iter()
                .position(|(k, _)| *k != sample)
                .map_or(keys.len(), |off| idx + off);
            let group = &keys[idx..end];
            idx = end;

            // `None` sorts before any stage.
            if group[0].1.is_none() {
                if let Some(s) = self.snapshot(&SampleKey {
                    execution_id,
                    sample,
                    ramp_stage: None,
                }) {
                    per_sample.push(s);
                }
                continue;
            }

            let stages: Vec<MergedSampleSummary> = group
                .iter()
                .filter_map(|(sample, ramp_stage)| {
                    self.snapshot(&SampleKey {
                        execution_id,
                        sample: *sample,
                        ramp_stage: *ramp_stage,
                    })
                })
                .collect();
            if stages.is_empty() {
                continue;
            }
            let parts: Vec<Part<'_>> = stages.iter().map(Part::from).collect();
            let name = stages[0].sample_name.clone();
            per_sample.push(fold(
                Identity {
                    execution_id,
                    sample_name: name,
                    ramp_stage: None,
                },
                &parts,
                FoldRules::ACROSS_STAGES,
                None,
            ));
        }

        if per_sample.is_empty() {
            return None;
        }

        let parts: Vec<Part<'_>> = per_sample.iter().map(Part::from).collect();
        let mut published = self.totals.entry(execution_id).or_insert_with(|| None);
        let total = fold(
            Identity {
                execution_id,
                sample_name: TOTAL_SAMPLE.to_string(),
                ramp_stage: None,
            },
            &parts,
            FoldRules::ACROSS_SAMPLES,
            published.as_ref(),
        );
        *published = Some(total.clone());
        Some(total)
    }

    /// Sample names with at least one summary for `execution_id`, sorted.
    pub fn sample_names(&self, execution_id: ExecutionId) -> Vec<String> {
        let mut out: Vec<String> = self
            .keys_of(execution_id)
            .into_iter()
            .filter_map(|(k, _)| self.names.resolve(k).map(|s| s.to_string()))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Drops every key of `execution_id`. Returns how many summaries were removed.
    ///
    /// A sample ingested concurrently either lands before the removal and is dropped with
    /// it, or after and starts the execution afresh.
    pub fn remove_execution(&self, execution_id: ExecutionId) -> usize {
        let Entry::Occupied(index) = self.by_execution.entry(execution_id) else {
            return 0;
        };

        let removed = index
            .get()
            .iter()
            .filter(|(sample, ramp_stage)| {
                self.keys
                    .remove(&SampleKey {
                        execution_id,
                        sample: *sample,
                        ramp_stage: *ramp_stage,
                    })
                    .is_some()
            })
            .count();
        index.remove();
        self.totals.remove(&execution_id);
        removed
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn keys_of(&self, execution_id: ExecutionId) -> Vec<(KeyId, Option<RampStage>)> {
        self.by_execution
            .get(&execution_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self, key: &SampleKey) -> Option<MergedSampleSummary> {
        // Clone the handle first so the map shard is released before the key lock is taken.
        let state = self.keys.get(key)?.value().clone();
        state.lock().summary.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(exec: ExecutionId, node: &str, ts: u64, tx: u64, secs: f64) -> RawSample {
        let mut s = RawSample::new(exec, node, "login", ts);
        s.counters.transactions = tx;
        s.counters.operations = tx;
        s.counters.iterations = tx;
        s.duration_secs = secs;
        s
    }

    fn ingest(agg: &SampleAggregator, s: RawSample) -> Applied {
        agg.ingest(s).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn replace_then_sum_never_accumulates_deltas() {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();

        ingest(&agg, sample(exec, "a", 1, 10, 1.0));
        ingest(&agg, sample(exec, "a", 2, 25, 2.0));
        ingest(&agg, sample(exec, "b", 1, 5, 1.0));

        let s = agg
            .latest(exec, "login")
            .unwrap_or_else(|| panic!("expected summary"));
        assert_eq!(s.counters.transactions, 30);
        assert_eq!(s.node_count, 2);
    }

    #[test]
    fn stale_and_duplicate_samples_are_discarded() {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();

        assert_eq!(ingest(&agg, sample(exec, "a", 5, 50, 5.0)), Applied::Merged);
        let before = agg.latest(exec, "login");

        assert_eq!(ingest(&agg, sample(exec, "a", 5, 50, 5.0)), Applied::Discarded);
        assert_eq!(ingest(&agg, sample(exec, "a", 4, 40, 4.0)), Applied::Discarded);
        assert_eq!(agg.latest(exec, "login"), before);
    }

    #[test]
    fn invalid_samples_never_create_state() {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();
        let mut s = sample(exec, "a", 1, 1, 1.0);
        s.sample_name = String::new();

        assert_eq!(agg.ingest(s).err(), Some(SampleError::EmptySampleName));
        assert!(agg.is_empty());
        assert!(agg.summary_total(exec).is_none());
    }

    #[test]
    fn ramp_stages_are_tracked_separately_and_sorted() {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();

        ingest(&agg, sample(exec, "a", 1, 10, 10.0).with_ramp_stage(2));
        ingest(&agg, sample(exec, "a", 1, 20, 10.0).with_ramp_stage(1));

        let stages = agg.latest_by_ramp_stage(exec, "login");
        let ids: Vec<_> = stages.iter().map(|s| s.ramp_stage).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert!(agg.latest(exec, "login").is_none());

        // Staged-only samples are folded end to end for the total.
        let total = agg
            .summary_total(exec)
            .unwrap_or_else(|| panic!("expected total"));
        assert_eq!(total.sample_name, TOTAL_SAMPLE);
        assert_eq!(total.counters.transactions, 30);
        assert_eq!(total.duration_secs, 20.0);
    }

    #[test]
    fn total_spans_sample_names() {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();

        ingest(&agg, sample(exec, "a", 1, 10, 4.0));
        let mut checkout = sample(exec, "a", 1, 6, 5.0);
        checkout.sample_name = "checkout".to_string();
        checkout.counters.iterations = 10;
        ingest(&agg, checkout);

        let total = agg
            .summary_total(exec)
            .unwrap_or_else(|| panic!("expected total"));
        assert_eq!(total.counters.transactions, 16);
        assert_eq!(total.counters.iterations, 10);
        assert_eq!(total.duration_secs, 5.0);
        assert_eq!(agg.sample_names(exec), vec!["checkout", "login"]);
    }

    #[test]
    fn remove_execution_only_drops_its_keys() {
        let agg = SampleAggregator::new();
        let keep = ExecutionId::generate();
        let gone = ExecutionId::generate();

        ingest(&agg, sample(keep, "a", 1, 1, 1.0));
        ingest(&agg, sample(gone, "a", 1, 1, 1.0));
        ingest(&agg, sample(gone, "a", 1, 1, 1.0).with_ramp_stage(1));

        assert_eq!(agg.remove_execution(gone), 2);
        assert_eq!(agg.remove_execution(gone), 0);
        assert!(agg.latest(keep, "login").is_some());
        assert!(agg.summary_total(gone).is_none());
    }

    #[test]
    fn total_does_not_regress_when_stage_less_data_arrives_late() {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();

        ingest(&agg, sample(exec, "a", 1, 10, 3.0).with_ramp_stage(1));
        ingest(&agg, sample(exec, "b", 1, 50, 3.0).with_ramp_stage(1));
        let staged = agg
            .summary_total(exec)
            .unwrap_or_else(|| panic!("expected total"));
        assert_eq!(staged.counters.iterations, 60);

        // Node a's first stage-less report covers only its own progress.
        ingest(&agg, sample(exec, "a", 2, 12, 1.0));
        let total = agg
            .summary_total(exec)
            .unwrap_or_else(|| panic!("expected total"));
        assert_eq!(total.counters.iterations, 60);
        assert_eq!(total.counters.transactions, 60);
        assert_eq!(total.duration_secs, 3.0);

        // Once the stage-less view overtakes, it drives the total.
        ingest(&agg, sample(exec, "b", 2, 70, 4.0));
        let total = agg
            .summary_total(exec)
            .unwrap_or_else(|| panic!("expected total"));
        assert_eq!(total.counters.iterations, 82);
        assert_eq!(total.duration_secs, 4.0);
    }

    #[test]
    fn removed_execution_starts_its_total_afresh() {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();

        ingest(&agg, sample(exec, "a", 1, 40, 2.0));
        assert!(agg.summary_total(exec).is_some());
        agg.remove_execution(exec);

        ingest(&agg, sample(exec, "a", 1, 5, 1.0));
        let total = agg
            .summary_total(exec)
            .unwrap_or_else(|| panic!("expected total"));
        assert_eq!(total.counters.transactions, 5);
    }

    #[test]
    fn removal_racing_ingest_leaves_no_unindexed_keys() {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();

        std::thread::scope(|scope| {
            for node in ["a", "b", "c"] {
                let agg = &agg;
                scope.spawn(move || {
                    for ts in 1..=500u64 {
                        let stage = u32::try_from(ts % 4).unwrap_or(0);
                        let s = sample(exec, node, ts, ts, 1.0);
                        let s = if stage == 0 { s } else { s.with_ramp_stage(stage) };
                        ingest(agg, s);
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..500 {
                    agg.remove_execution(exec);
                    std::thread::yield_now();
                }
            });
        });

        // Whatever survived is reachable through the index.
        let indexed = agg.keys_of(exec).len();
        assert_eq!(agg.len(), indexed);
        assert_eq!(agg.remove_execution(exec), indexed);
        assert!(agg.is_empty());
    }
}

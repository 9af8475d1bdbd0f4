//! Send-order bookkeeping for one bg worker's share of a table
//!
//! The bg worker folds each touched row's `RowOpLogMeta` into a
//! `TableOpLogMeta`, then drains rows in two passes: first every row whose
//! oldest update belongs to a completed clock, then, budget permitting,
//! extra rows chosen by the update sort policy.
//!
//! # Orders
//!
//! - `Fifo`: clock ascending, ties by row id ascending
//! - `RelativeMagnitude` / `FifoNReMag`: importance descending, ties by row id
//! - `Random`: uniform shuffle of the sampled candidates
//! - `FixedOrder`: row ids ascending, resuming after the last row handed out

use crate::row_oplog::RowOpLogMeta;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use sspps_core::{Clock, RowId, UpdateSortPolicy, INVALID_ROW_ID};
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Pending-row metadata of one table partition
#[derive(Debug)]
pub struct TableOpLogMeta {
    policy: UpdateSortPolicy,
    candidate_factor: usize,
    metas: FxHashMap<RowId, RowOpLogMeta>,
    ordered: VecDeque<RowId>,
    fixed_cursor: RowId,
    rng: StdRng,
}

impl TableOpLogMeta {
    /// Empty meta ordered by `policy`, sampling `candidate_factor` candidates
    /// per row to send
    pub fn new(policy: UpdateSortPolicy, candidate_factor: usize) -> Self {
        Self::with_rng(policy, candidate_factor, StdRng::from_entropy())
    }

    /// Deterministic variant for tests and replays
    pub fn with_seed(policy: UpdateSortPolicy, candidate_factor: usize, seed: u64) -> Self {
        Self::with_rng(policy, candidate_factor, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: UpdateSortPolicy, candidate_factor: usize, rng: StdRng) -> Self {
        Self {
            policy,
            candidate_factor: candidate_factor.max(1),
            metas: FxHashMap::default(),
            ordered: VecDeque::new(),
            fixed_cursor: INVALID_ROW_ID,
            rng,
        }
    }

    /// Ordering policy
    pub fn policy(&self) -> UpdateSortPolicy {
        self.policy
    }

    /// Rows with pending metadata
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    /// Whether no row is pending
    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Metadata of `row_id`
    pub fn get(&self, row_id: RowId) -> Option<&RowOpLogMeta> {
        self.metas.get(&row_id)
    }

    /// Add a row or fold new metadata into an existing entry
    ///
    /// The clock always takes the incoming value. Importance accumulates only
    /// under magnitude-based policies.
    pub fn insert_merge(&mut self, row_id: RowId, meta: RowOpLogMeta) {
        let accumulate = self.policy.accumulates_importance();
        self.metas
            .entry(row_id)
            .and_modify(|existing| {
                existing.clock = meta.clock;
                if accumulate {
                    existing.importance += meta.importance;
                } else {
                    existing.importance = meta.importance;
                }
            })
            .or_insert(meta);
    }

    /// Remove and return every row with `clock <= clock_to_clear`, oldest
    /// first
    pub fn get_and_clear_up_to_clock(&mut self, clock_to_clear: Clock) -> Vec<RowId> {
        let mut due: Vec<(Clock, RowId)> = self
            .metas
            .iter()
            .filter(|(_, meta)| meta.clock <= clock_to_clear)
            .map(|(row_id, meta)| (meta.clock, *row_id))
            .collect();
        due.sort_unstable();
        for (_, row_id) in &due {
            self.metas.remove(row_id);
        }
        due.into_iter().map(|(_, row_id)| row_id).collect()
    }

    /// Order up to `num_rows_to_send` rows for `get_and_clear_next_in_order`
    pub fn prepare(&mut self, num_rows_to_send: usize) {
        self.ordered.clear();
        if num_rows_to_send == 0 || self.metas.is_empty() {
            return;
        }

        let mut rows: Vec<RowId> = self.metas.keys().copied().collect();
        if self.policy.is_fixed_order() {
            rows.sort_unstable();
            let split = rows.partition_point(|r| *r <= self.fixed_cursor);
            rows.rotate_left(split);
            rows.truncate(num_rows_to_send);
            self.ordered = rows.into();
            return;
        }

        let num_candidates = num_rows_to_send
            .saturating_mul(self.candidate_factor)
            .min(rows.len());
        if num_candidates < rows.len() {
            let sampled = rows.partial_shuffle(&mut self.rng, num_candidates).0.to_vec();
            rows = sampled;
        }

        match self.policy {
            UpdateSortPolicy::Random => rows.shuffle(&mut self.rng),
            UpdateSortPolicy::Fifo => {
                let metas = &self.metas;
                rows.sort_unstable_by_key(|r| (metas[r].clock, *r));
            }
            _ => {
                let metas = &self.metas;
                rows.sort_unstable_by(|a, b| by_importance(metas, *a, *b));
            }
        }
        rows.truncate(num_rows_to_send);
        self.ordered = rows.into();
    }

    /// Next prepared row, removed from the meta
    pub fn get_and_clear_next_in_order(&mut self) -> Option<RowId> {
        while let Some(row_id) = self.ordered.pop_front() {
            if self.metas.remove(&row_id).is_some() {
                self.fixed_cursor = row_id;
                return Some(row_id);
            }
        }
        None
    }
}

fn by_importance(metas: &FxHashMap<RowId, RowOpLogMeta>, a: RowId, b: RowId) -> Ordering {
    metas[&b]
        .importance
        .total_cmp(&metas[&a].importance)
        .then(a.cmp(&b))
}

//! Streaming decimator chain (spec §4.E). An array of level-accumulators,
//! base factor 4: level `k` consumes raw samples (level 1) or the
//! previous level's decimated output (level `k>1`), holds up to `factor`
//! samples, and emits one decimated sample per `factor` consumed. On an
//! interval marker every level discards its partial accumulator — no
//! partial decimated sample is ever produced.

use crate::layout::{Dtype, Elem};

const BASE_FACTOR: u32 = 4;

/// One decimated output row: timestamp of the last contributing sample,
/// plus `mean`, `min`, `max` per element (native dtype for min/max,
/// double-precision-rounded for mean per §4.E's numeric semantics).
#[derive(Clone, Debug, PartialEq)]
pub struct DecimatedRow {
    pub timestamp: u64,
    pub mean: Vec<Elem>,
    pub min: Vec<Elem>,
    pub max: Vec<Elem>,
}

impl DecimatedRow {
    /// Flatten to the `3n` element order (mean..., min..., max...) used by
    /// the decimated record codec.
    pub fn to_elems(&self) -> Vec<Elem> {
        let mut out = Vec::with_capacity(self.mean.len() * 3);
        out.extend_from_slice(&self.mean);
        out.extend_from_slice(&self.min);
        out.extend_from_slice(&self.max);
        out
    }
}

struct Accumulator {
    dtype: Dtype,
    count: usize,
    factor: u32,
    mean_sum: Vec<f64>,
    min: Vec<Option<Elem>>,
    max: Vec<Option<Elem>>,
    last_timestamp: u64,
    seen: u32,
}

impl Accumulator {
    fn new(dtype: Dtype, count: usize, factor: u32) -> Self {
        Accumulator {
            dtype,
            count,
            factor,
            mean_sum: vec![0.0; count],
            min: vec![None; count],
            max: vec![None; count],
            last_timestamp: 0,
            seen: 0,
        }
    }

    fn reset(&mut self) {
        self.mean_sum.iter_mut().for_each(|v| *v = 0.0);
        self.min.iter_mut().for_each(|v| *v = None);
        self.max.iter_mut().for_each(|v| *v = None);
        self.seen = 0;
    }

    /// Fold in one raw sample's `n` element values.
    fn push_raw(&mut self, timestamp: u64, values: &[Elem]) -> Option<DecimatedRow> {
        for i in 0..self.count {
            self.mean_sum[i] += values[i].as_f64();
            self.fold_min_max(i, values[i], values[i]);
        }
        self.last_timestamp = timestamp;
        self.seen += 1;
        self.maybe_emit()
    }

    /// Fold in the next level down's decimated output.
    fn push_decimated(&mut self, row: &DecimatedRow) -> Option<DecimatedRow> {
        for i in 0..self.count {
            self.mean_sum[i] += row.mean[i].as_f64();
            self.fold_min_max(i, row.min[i], row.max[i]);
        }
        self.last_timestamp = row.timestamp;
        self.seen += 1;
        self.maybe_emit()
    }

    fn fold_min_max(&mut self, i: usize, candidate_min: Elem, candidate_max: Elem) {
        self.min[i] = Some(match self.min[i] {
            None => candidate_min,
            Some(cur) if candidate_min.native_cmp(&cur) == std::cmp::Ordering::Less => {
                candidate_min
            }
            Some(cur) => cur,
        });
        self.max[i] = Some(match self.max[i] {
            None => candidate_max,
            Some(cur) if candidate_max.native_cmp(&cur) == std::cmp::Ordering::Greater => {
                candidate_max
            }
            Some(cur) => cur,
        });
    }

    fn maybe_emit(&mut self) -> Option<DecimatedRow> {
        if self.seen < self.factor {
            return None;
        }
        let mean = self
            .mean_sum
            .iter()
            .map(|sum| Elem::from_f64(self.dtype, sum / self.factor as f64))
            .collect();
        let min = self.min.iter().map(|v| v.expect("filled")).collect();
        let max = self.max.iter().map(|v| v.expect("filled")).collect();
        let row = DecimatedRow {
            timestamp: self.last_timestamp,
            mean,
            min,
            max,
        };
        self.reset();
        Some(row)
    }
}

/// A chain of decimation levels for one stream. `levels()[0]` is factor
/// `BASE_FACTOR`, `levels()[1]` factor `BASE_FACTOR^2`, and so on.
pub struct DecimatorChain {
    dtype: Dtype,
    count: usize,
    levels: Vec<Accumulator>,
}

impl DecimatorChain {
    pub fn new(dtype: Dtype, count: usize, num_levels: usize) -> Self {
        let levels = (1..=num_levels)
            .map(|_| Accumulator::new(dtype, count, BASE_FACTOR))
            .collect();
        DecimatorChain {
            dtype,
            count,
            levels,
        }
    }

    /// Factor of the decimation level at `index` (0-based): `4^(index+1)`.
    pub fn factor(&self, index: usize) -> u32 {
        BASE_FACTOR.pow(index as u32 + 1)
    }

    /// Feed one raw sample through the whole chain, returning every
    /// decimated row produced at each level (in level order) as a result
    /// of this single push.
    pub fn push(&mut self, timestamp: u64, values: &[Elem]) -> Vec<(usize, DecimatedRow)> {
        let mut emitted = Vec::new();
        let mut carry = self.levels[0].push_raw(timestamp, values);
        let mut level_idx = 0;
        while let Some(row) = carry {
            emitted.push((level_idx, row.clone()));
            level_idx += 1;
            let Some(next) = self.levels.get_mut(level_idx) else {
                break;
            };
            carry = next.push_decimated(&row);
        }
        emitted
    }

    /// Discard every level's partial accumulator without emitting (spec
    /// §4.E, "on interval marker each level discards its partial
    /// accumulator").
    pub fn reset(&mut self) {
        for level in &mut self.levels {
            level.reset();
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Dtype;

    #[test]
    fn emits_mean_min_max_every_factor_samples() {
        let mut chain = DecimatorChain::new(Dtype::Int32, 1, 2);
        let mut last = Vec::new();
        for i in 0..4u64 {
            last = chain.push(i * 10, &[Elem::I32(i as i32)]);
        }
        assert_eq!(last.len(), 1);
        let (level, row) = &last[0];
        assert_eq!(*level, 0);
        assert_eq!(row.mean, vec![Elem::I32(1)]); // mean(0,1,2,3) rounds to 1
        assert_eq!(row.min, vec![Elem::I32(0)]);
        assert_eq!(row.max, vec![Elem::I32(3)]);
    }

    #[test]
    fn second_level_aggregates_four_level_one_outputs() {
        let mut chain = DecimatorChain::new(Dtype::Int32, 1, 2);
        let mut level1_count = 0;
        for block in 0..16u64 {
            let emitted = chain.push(block * 10, &[Elem::I32(block as i32)]);
            level1_count += emitted.iter().filter(|(l, _)| *l == 0).count();
        }
        assert_eq!(level1_count, 4);
    }

    #[test]
    fn interval_marker_discards_partial_accumulator() {
        let mut chain = DecimatorChain::new(Dtype::Int32, 1, 1);
        chain.push(0, &[Elem::I32(10)]);
        chain.push(10, &[Elem::I32(20)]);
        chain.reset();
        let emitted = chain.push(20, &[Elem::I32(30)]);
        assert!(emitted.is_empty());
    }
}

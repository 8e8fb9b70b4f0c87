use super::error::PipelineError;
use crate::core::bucket::PairSumBucket;
use crate::core::cutoffs::CutoffSet;
use crate::core::lattice_sum::{AtomPair, CutoffAwarePairPotential};
use nalgebra::Vector3;

/// Which channels of a [`PairSumBucket`] an accumulator keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorChannels {
    Energy,
    EnergyVirial,
    /// Energy, virial and the three lattice-referenced channels.
    LatticeReferenced,
}

impl AccumulatorChannels {
    pub fn width(self) -> usize {
        match self {
            AccumulatorChannels::Energy => 1,
            AccumulatorChannels::EnergyVirial => 2,
            AccumulatorChannels::LatticeReferenced => 5,
        }
    }

    #[inline]
    fn project(self, bucket: PairSumBucket) -> PairSumBucket {
        match self {
            AccumulatorChannels::Energy => PairSumBucket::new(bucket.energy, 0.0),
            AccumulatorChannels::EnergyVirial => PairSumBucket::new(bucket.energy, bucket.virial),
            AccumulatorChannels::LatticeReferenced => bucket,
        }
    }
}

/// Running per-cutoff sums over every pair visited during one pass.
///
/// A pass is `reset()`, any number of `accumulate*` calls, then `finalize()`.
/// The buckets are owned exclusively by the accumulator; the slice handed out
/// by `finalize()` borrows it, so it cannot outlive the next `reset()`.
#[derive(Debug, Clone)]
pub struct CutoffAccumulator {
    cutoffs: CutoffSet,
    channels: AccumulatorChannels,
    sums: Vec<PairSumBucket>,
    scratch: Vec<PairSumBucket>,
    pairs_accepted: usize,
}

impl CutoffAccumulator {
    pub fn new(cutoffs: CutoffSet, channels: AccumulatorChannels) -> Self {
        let k = cutoffs.len();
        Self {
            cutoffs,
            channels,
            sums: vec![PairSumBucket::default(); k],
            scratch: vec![PairSumBucket::default(); k],
            pairs_accepted: 0,
        }
    }

    pub fn cutoffs(&self) -> &CutoffSet {
        &self.cutoffs
    }

    pub fn channels(&self) -> AccumulatorChannels {
        self.channels
    }

    pub fn reset(&mut self) {
        self.sums.iter_mut().for_each(PairSumBucket::clear);
        self.pairs_accepted = 0;
    }

    /// Adds one pair at squared separation `r2` into every bucket that encloses it.
    #[inline]
    pub fn accumulate(&mut self, r2: f64, u: f64, du: f64) {
        if r2 > self.cutoffs.max_squared() {
            return;
        }
        self.pairs_accepted += 1;
        let contribution = self.channels.project(PairSumBucket::new(u, du));
        for i in (0..self.sums.len()).rev() {
            if r2 > self.cutoffs.radius_squared(i) {
                break;
            }
            self.sums[i] += contribution;
        }
    }

    pub fn accumulate_displacement(&mut self, separation: &Vector3<f64>, u: f64, du: f64) {
        self.accumulate(separation.norm_squared(), u, du);
    }

    /// Lets a cutoff-aware potential produce the per-cutoff sums for `pair`.
    ///
    /// The pair counts as accepted when it reaches the outermost bucket, which
    /// every image inside any cutoff does.
    pub fn accumulate_lattice(
        &mut self,
        pair: &AtomPair,
        edges: &Vector3<f64>,
        potential: &dyn CutoffAwarePairPotential,
    ) {
        potential.sum_by_cutoff(pair, edges, &self.cutoffs, &mut self.scratch);
        match self.scratch.last() {
            Some(outer) if *outer != PairSumBucket::default() => self.pairs_accepted += 1,
            _ => return,
        }
        for (sum, &contribution) in self.sums.iter_mut().zip(&self.scratch) {
            *sum += self.channels.project(contribution);
        }
    }

    /// Snapshot of the per-cutoff sums, valid until the next `reset()`.
    pub fn finalize(&self) -> &[PairSumBucket] {
        &self.sums
    }

    pub fn energies(&self) -> impl Iterator<Item = f64> + '_ {
        self.sums.iter().map(|bucket| bucket.energy)
    }

    pub fn pairs_accepted(&self) -> usize {
        self.pairs_accepted
    }

    /// Adds the sums of another accumulator built from the same cutoffs and
    /// channels. Bucket addition is associative, so partial passes may be
    /// merged in any order.
    pub fn merge(&mut self, other: &CutoffAccumulator) -> Result<(), PipelineError> {
        if self.cutoffs != other.cutoffs {
            return Err(PipelineError::IncompatibleAccumulators { what: "cutoffs" });
        }
        if self.channels != other.channels {
            return Err(PipelineError::IncompatibleAccumulators { what: "channels" });
        }
        for (sum, &contribution) in self.sums.iter_mut().zip(&other.sums) {
            *sum += contribution;
        }
        self.pairs_accepted += other.pairs_accepted;
        Ok(())
    }
}

use super::accumulator::CutoffAccumulator;
use super::error::PipelineError;
use crate::core::configuration::{Configuration, SimulationBox};
use crate::core::cutoffs::CutoffSet;
use crate::core::lattice_sum::{AtomPair, CutoffAwarePairPotential};
use crate::core::potentials::PairPotential;
use itertools::Itertools;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Receiver of the pairs a traversal visits.
pub trait PairCallback {
    fn cutoffs(&self) -> &CutoffSet;

    fn reset(&mut self);

    /// A pair at `separation` whose energy and virial were already evaluated.
    fn pair(&mut self, separation: &Vector3<f64>, u: f64, du: f64);

    /// A pair whose per-cutoff sums are produced by `potential` itself.
    fn lattice_pair(
        &mut self,
        pair: &AtomPair,
        edges: &Vector3<f64>,
        potential: &dyn CutoffAwarePairPotential,
    );
}

impl PairCallback for CutoffAccumulator {
    fn cutoffs(&self) -> &CutoffSet {
        CutoffAccumulator::cutoffs(self)
    }

    fn reset(&mut self) {
        CutoffAccumulator::reset(self);
    }

    fn pair(&mut self, separation: &Vector3<f64>, u: f64, du: f64) {
        self.accumulate_displacement(separation, u, du);
    }

    fn lattice_pair(
        &mut self,
        pair: &AtomPair,
        edges: &Vector3<f64>,
        potential: &dyn CutoffAwarePairPotential,
    ) {
        self.accumulate_lattice(pair, edges, potential);
    }
}

/// Visits every interacting pair of a system once per pass.
///
/// Implementations reset the callback before the first pair of every pass.
pub trait PairTraversal {
    fn compute_all(&mut self, callback: &mut dyn PairCallback) -> Result<(), PipelineError>;
}

/// Minimum-image O(N²) traversal with a plain pair potential.
pub struct AllPairs<'a, P> {
    configuration: &'a Configuration,
    potential: P,
}

impl<'a, P: PairPotential> AllPairs<'a, P> {
    pub fn new(configuration: &'a Configuration, potential: P) -> Self {
        Self {
            configuration,
            potential,
        }
    }

    #[inline]
    fn evaluate(&self, i: usize, j: usize) -> (Vector3<f64>, f64, f64) {
        let dr = self.configuration.separation(i, j);
        let r2 = dr.norm_squared();
        (dr, self.potential.u(r2), self.potential.du(r2))
    }

    /// One pass split across the rayon pool, each worker filling its own
    /// copy of `accumulator`; the copies are merged into the returned one.
    #[cfg(feature = "parallel")]
    pub fn accumulate_parallel(
        &self,
        accumulator: &CutoffAccumulator,
    ) -> Result<CutoffAccumulator, PipelineError>
    where
        P: Sync,
    {
        accumulator
            .cutoffs()
            .check_minimum_image(self.configuration.boundary())?;
        let mut template = accumulator.clone();
        template.reset();

        let n = self.configuration.num_atoms();
        let merged = (0..n)
            .into_par_iter()
            .fold(
                || template.clone(),
                |mut acc, i| {
                    for j in (i + 1)..n {
                        let (dr, u, du) = self.evaluate(i, j);
                        acc.accumulate_displacement(&dr, u, du);
                    }
                    acc
                },
            )
            .map(Ok::<_, PipelineError>)
            .try_reduce(
                || template.clone(),
                |mut left, right| {
                    left.merge(&right)?;
                    Ok(left)
                },
            )?;
        Ok(merged)
    }
}

impl<P: PairPotential> PairTraversal for AllPairs<'_, P> {
    fn compute_all(&mut self, callback: &mut dyn PairCallback) -> Result<(), PipelineError> {
        callback
            .cutoffs()
            .check_minimum_image(self.configuration.boundary())?;
        callback.reset();
        for (i, j) in (0..self.configuration.num_atoms()).tuple_combinations() {
            let (dr, u, du) = self.evaluate(i, j);
            callback.pair(&dr, u, du);
        }
        Ok(())
    }
}

/// Traversal over every unordered pair, self pairs included, delegating the
/// periodic sum to a cutoff-aware potential.
///
/// When the configuration carries lattice sites, each pair is handed over with
/// its lattice separation and a separation that keeps both atoms' own
/// displacements from their sites.
pub struct LatticePairs<'a, C> {
    configuration: &'a Configuration,
    potential: C,
    prepared_for: Option<(Vector3<f64>, CutoffSet)>,
}

impl<'a, C: CutoffAwarePairPotential> LatticePairs<'a, C> {
    pub fn new(configuration: &'a Configuration, potential: C) -> Self {
        Self {
            configuration,
            potential,
            prepared_for: None,
        }
    }

    fn prepare(&mut self, edges: &Vector3<f64>, cutoffs: &CutoffSet) {
        let current = self
            .prepared_for
            .as_ref()
            .is_some_and(|(e, c)| e == edges && c == cutoffs);
        if !current {
            self.potential.prepare(edges, cutoffs);
            self.prepared_for = Some((*edges, cutoffs.clone()));
        }
    }

    fn pair(&self, i: usize, j: usize) -> AtomPair {
        let config = self.configuration;
        match (
            config.lattice_corrected_separation(i, j),
            config.lattice_separation(i, j),
        ) {
            (Some(separation), Some(lattice)) => {
                AtomPair::new(i, j, separation).with_lattice_separation(lattice)
            }
            _ => AtomPair::new(i, j, config.separation(i, j)),
        }
    }
}

impl<C: CutoffAwarePairPotential> PairTraversal for LatticePairs<'_, C> {
    fn compute_all(&mut self, callback: &mut dyn PairCallback) -> Result<(), PipelineError> {
        let edges = self.configuration.boundary().edge_lengths();
        let cutoffs = callback.cutoffs().clone();
        self.prepare(&edges, &cutoffs);

        callback.reset();
        let n = self.configuration.num_atoms();
        for i in 0..n {
            for j in i..n {
                let pair = self.pair(i, j);
                callback.lattice_pair(&pair, &edges, &self.potential);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to open pair recording '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Malformed pair recording: {0}")]
    Csv(#[from] csv::Error),
    #[error("Pair recording exhausted after {frames} frames")]
    Exhausted { frames: usize },
    #[error("Pair recording frames must not decrease: frame {found} follows {previous}")]
    FrameOrder { previous: u64, found: u64 },
}

/// One recorded pair visit: separation, energy and virial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    pub frame: u64,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub u: f64,
    pub du: f64,
}

impl PairRecord {
    pub fn separation(&self) -> Vector3<f64> {
        Vector3::new(self.dx, self.dy, self.dz)
    }
}

/// Replays recorded pair visits, one frame per pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPairs {
    frames: Vec<Vec<PairRecord>>,
    cursor: usize,
}

impl RecordedPairs {
    /// Groups records into frames by their frame number.
    pub fn from_records(records: Vec<PairRecord>) -> Result<Self, ReplayError> {
        let mut frames: Vec<Vec<PairRecord>> = Vec::new();
        let mut previous: Option<u64> = None;
        for record in records {
            match previous {
                Some(prev) if record.frame < prev => {
                    return Err(ReplayError::FrameOrder {
                        previous: prev,
                        found: record.frame,
                    });
                }
                Some(prev) if record.frame == prev => {
                    if let Some(frame) = frames.last_mut() {
                        frame.push(record);
                    }
                }
                _ => frames.push(vec![record]),
            }
            previous = Some(record.frame);
        }
        Ok(Self { frames, cursor: 0 })
    }

    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self, ReplayError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let records = reader
            .deserialize()
            .collect::<Result<Vec<PairRecord>, _>>()?;
        Self::from_records(records)
    }

    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        let file = File::open(path).map_err(|source| ReplayError::Io {
            path: path.to_string_lossy().to_string(),
            source,
        })?;
        Self::from_csv_reader(io::BufReader::new(file))
    }

    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), ReplayError> {
        let mut writer = csv::Writer::from_writer(writer);
        for record in self.frames.iter().flatten() {
            writer.serialize(record)?;
        }
        writer.flush().map_err(|source| ReplayError::Io {
            path: "<writer>".to_string(),
            source,
        })?;
        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Starts the replay over from the first frame.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl PairTraversal for RecordedPairs {
    fn compute_all(&mut self, callback: &mut dyn PairCallback) -> Result<(), PipelineError> {
        let frame = self.frames.get(self.cursor).ok_or(ReplayError::Exhausted {
            frames: self.frames.len(),
        })?;
        callback.reset();
        for record in frame {
            callback.pair(&record.separation(), record.u, record.du);
        }
        self.cursor += 1;
        Ok(())
    }
}

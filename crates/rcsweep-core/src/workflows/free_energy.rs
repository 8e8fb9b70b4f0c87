use crate::core::configuration::SimulationBox;
use crate::core::potentials::PairPotential;
use crate::core::sample::{Field, METER_WIDTH, SampleLayout, SampleVector};
use crate::engine::config::PipelineConfig;
use crate::engine::error::PipelineError;
use nalgebra::DMatrix;
use tracing::{error, info, instrument, warn};

const STAGE: &str = "free energy report";

/// Weight errors below this mark the cutoff the simulation actually sampled,
/// where every weight is one and correlations with it are meaningless.
const SAMPLED_CUTOFF_WEIGHT_ERROR: f64 = 1e-7;

/// `uFac[i] = N·Uᵢ − u_fast` from a raw sample of an initial configuration,
/// so that weights start out close to one.
pub fn calibrate_energy_offsets(raw: &SampleVector, fast_energy: f64) -> Vec<f64> {
    let n = raw.num_atoms as f64;
    raw.blocks()
        .map(|block| n * block[Field::Energy.index()] - fast_energy)
        .collect()
}

/// Offsets for a longer ladder that starts with the radii of `short`: the
/// shared prefix keeps the offsets already in use, the rest are calibrated.
pub fn extend_energy_offsets(short: &[f64], long_raw: &SampleVector, fast_energy: f64) -> Vec<f64> {
    let mut offsets = calibrate_energy_offsets(long_raw, fast_energy);
    let shared = short.len().min(offsets.len());
    offsets[..shared].copy_from_slice(&short[..shared]);
    offsets
}

/// Analytic estimate of what truncating a potential at `rc` leaves out,
/// assuming a uniform pair distribution beyond the cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongRangeCorrection {
    /// Total missing energy.
    pub energy: f64,
    /// Total missing virial, `Σ r·du/dr`.
    pub virial: f64,
    pub num_atoms: usize,
    pub volume: f64,
}

impl LongRangeCorrection {
    /// `None` when the potential has no closed-form tail.
    pub fn for_system(
        potential: &dyn PairPotential,
        rc: f64,
        num_atoms: usize,
        volume: f64,
    ) -> Option<Self> {
        let tails = potential.tail_integrals(rc)?;
        let n = num_atoms as f64;
        let pair_density = n * (n - 1.0) / 2.0 / volume;
        Some(Self {
            energy: pair_density * tails.energy,
            virial: pair_density * tails.virial,
            num_atoms,
            volume,
        })
    }

    pub fn density(&self) -> f64 {
        self.num_atoms as f64 / self.volume
    }

    pub fn energy_per_atom(&self) -> f64 {
        self.energy / self.num_atoms as f64
    }

    pub fn pressure(&self) -> f64 {
        -self.virial / (3.0 * self.volume)
    }

    pub fn da_dy(&self) -> f64 {
        self.energy_per_atom() / (4.0 * self.density().powi(4))
    }

    pub fn da_dv2(&self, temperature: f64) -> f64 {
        let rho = self.density();
        (-self.pressure() / (temperature * rho) + 4.0 * self.energy_per_atom() / temperature)
            * rho
            * rho
            / 2.0
    }
}

/// Block-averaged statistics of a reweighted `k × (w+1)` sample stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStatistics {
    pub average: SampleVector,
    /// Standard error of each average.
    pub error: SampleVector,
    /// Covariance of the block means, indexed by flat sample position.
    pub covariance: DMatrix<f64>,
    /// Only known when the statistics were built from the block means.
    pub block_correlations: Option<BlockCorrelations>,
}

/// How successive blocks, and the per-block ratio estimates `x/w`, are
/// correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCorrelations {
    /// Lag-one correlation of successive block means, per flat position.
    pub lag: SampleVector,
    /// Lag-one correlation of successive per-block ratios, weight dropped.
    pub ratio_lag: SampleVector,
    /// Covariance of the per-block ratios, indexed by flat position of the
    /// weight-free layout.
    pub ratio_covariance: DMatrix<f64>,
}

impl BlockCorrelations {
    fn from_block_means(
        blocks: &[SampleVector],
        layout: SampleLayout,
        centered: &DMatrix<f64>,
    ) -> Result<Self, PipelineError> {
        let ratio_layout = layout.without_weight();
        let mut ratios = DMatrix::from_row_iterator(
            blocks.len(),
            ratio_layout.len(),
            blocks.iter().flat_map(|b| {
                b.blocks().flat_map(|block| {
                    let (&weight, values) = block.split_last().unwrap_or((&1.0, &[][..]));
                    values.iter().map(move |x| x / weight)
                })
            }),
        );
        center_columns(&mut ratios);
        Ok(Self {
            lag: SampleVector::from_values(layout, lag_one_correlations(centered))?,
            ratio_lag: SampleVector::from_values(ratio_layout, lag_one_correlations(&ratios))?,
            ratio_covariance: sample_covariance(&ratios),
        })
    }

    /// Correlation of two per-block ratios, `None` when either has no variance.
    pub fn ratio_correlation(&self, a: usize, b: usize) -> Option<f64> {
        correlation_of(&self.ratio_covariance, a, b)
    }
}

fn center_columns(data: &mut DMatrix<f64>) -> Vec<f64> {
    let mean: Vec<f64> = data.row_mean().iter().copied().collect();
    for (mut column, m) in data.column_iter_mut().zip(&mean) {
        column.add_scalar_mut(-m);
    }
    mean
}

fn sample_covariance(centered: &DMatrix<f64>) -> DMatrix<f64> {
    centered.transpose() * centered / (centered.nrows() as f64 - 1.0)
}

/// Zero where a column has no variance.
fn lag_one_correlations(centered: &DMatrix<f64>) -> Vec<f64> {
    let lagged = centered.nrows().saturating_sub(1);
    centered
        .column_iter()
        .map(|column| {
            let variance = column.dot(&column);
            let lag = column.rows(0, lagged).dot(&column.rows(1, lagged));
            let correlation = lag / variance;
            if variance > 0.0 && correlation.is_finite() {
                correlation
            } else {
                0.0
            }
        })
        .collect()
}

fn correlation_of(covariance: &DMatrix<f64>, a: usize, b: usize) -> Option<f64> {
    let denominator = (covariance[(a, a)] * covariance[(b, b)]).sqrt();
    if denominator > 0.0 && denominator.is_finite() {
        Some(covariance[(a, b)] / denominator)
    } else {
        None
    }
}

impl BlockStatistics {
    pub fn new(
        average: SampleVector,
        error: SampleVector,
        covariance: DMatrix<f64>,
    ) -> Result<Self, PipelineError> {
        let layout = average.layout();
        if error.layout() != layout {
            return Err(PipelineError::LayoutMismatch {
                stage: "block statistics",
                expected: layout,
                found: error.layout(),
            });
        }
        if covariance.shape() != (layout.len(), layout.len()) {
            return Err(PipelineError::LayoutMismatch {
                stage: "block covariance",
                expected: SampleLayout::new(layout.len(), layout.len()),
                found: SampleLayout::new(covariance.nrows(), covariance.ncols()),
            });
        }
        Ok(Self {
            average,
            error,
            covariance,
            block_correlations: None,
        })
    }

    /// Mean, standard error and covariance from a sequence of block means.
    pub fn from_block_means(blocks: &[SampleVector]) -> Result<Self, PipelineError> {
        let first = match blocks {
            [first, _, ..] => first,
            _ => {
                return Err(PipelineError::InsufficientData {
                    needed: 2,
                    found: blocks.len(),
                });
            }
        };
        let layout = first.layout();
        if let Some(odd) = blocks.iter().find(|b| b.layout() != layout) {
            return Err(PipelineError::LayoutMismatch {
                stage: "block statistics",
                expected: layout,
                found: odd.layout(),
            });
        }

        let count = blocks.len();
        let mut centered = DMatrix::from_row_iterator(
            count,
            layout.len(),
            blocks.iter().flat_map(|b| b.as_slice().iter().copied()),
        );
        let mean = center_columns(&mut centered);
        let covariance = sample_covariance(&centered);

        let block_correlations = if layout.width > 0 {
            Some(BlockCorrelations::from_block_means(blocks, layout, &centered)?)
        } else {
            None
        };
        let mut average = SampleVector::from_values(layout, mean)?;
        let mut error = SampleVector::from_values(
            layout,
            covariance
                .diagonal()
                .iter()
                .map(|v| (v / count as f64).sqrt())
                .collect(),
        )?;
        average.num_atoms = first.num_atoms;
        error.num_atoms = first.num_atoms;
        let mut stats = Self::new(average, error, covariance)?;
        stats.block_correlations = block_correlations;
        Ok(stats)
    }

    /// Correlation of two flat positions, `None` when either has no variance.
    pub fn correlation(&self, a: usize, b: usize) -> Option<f64> {
        correlation_of(&self.covariance, a, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Estimate {
    pub value: f64,
    pub error: f64,
    /// Leading-order bias of the ratio, already in units of `value`.
    pub bias: f64,
}

/// Estimate of `⟨x·w⟩/⟨w⟩` with first-order error propagation.
pub fn ratio_estimate(avg_x: f64, err_x: f64, avg_w: f64, err_w: f64, correlation: f64) -> Estimate {
    let ratio = avg_x / avg_w;
    let variance = err_x * err_x + ratio * ratio * err_w * err_w
        - 2.0 * ratio * err_x * err_w * correlation;
    Estimate {
        value: ratio,
        error: variance.max(0.0).sqrt() / avg_w.abs(),
        bias: (ratio * err_w * err_w - err_x * err_w * correlation) / (avg_w * avg_w),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CutoffEstimate {
    pub radius: f64,
    /// `(A − A_fast)/N`.
    pub free_energy: Estimate,
    /// `U`, `P`, `dA/dy` and `dA/dv²`, long-range correction included.
    pub measured: [Estimate; METER_WIDTH],
    /// The long-range correction that was added to `measured`.
    pub correction: [f64; METER_WIDTH],
    pub diagnostics: CutoffDiagnostics,
}

/// Sampling quality of one cutoff's estimates.
///
/// The block-level correlations stay zero unless the statistics were built
/// from block means.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CutoffDiagnostics {
    /// `errW/⟨w⟩`; large values mean the weights are dominated by few samples.
    pub weight_relative_error: f64,
    /// Lag-one correlation of successive block weights.
    pub weight_correlation: f64,
    /// Lag-one correlation of successive block ratios, per measured field.
    pub block_correlation: [f64; METER_WIDTH],
    /// Correlation of the per-block `P` and `U` ratios.
    pub pressure_energy_correlation: f64,
    /// Correlation of the per-block `dA/dy` and `dA/dv²` ratios.
    pub derivative_correlation: f64,
}

impl CutoffDiagnostics {
    fn for_block(stats: &BlockStatistics, block: usize, avg_w: f64, err_w: f64) -> Self {
        let mut diagnostics = Self {
            weight_relative_error: err_w / avg_w,
            ..Self::default()
        };
        let Some(correlations) = &stats.block_correlations else {
            return diagnostics;
        };
        let ratio_layout = correlations.ratio_lag.layout();
        let pair = |a: Field, b: Field| {
            correlations
                .ratio_correlation(
                    ratio_layout.offset(block, a.index()),
                    ratio_layout.offset(block, b.index()),
                )
                .unwrap_or(0.0)
        };
        diagnostics.weight_correlation = correlations.lag.get(block, Field::Weight.index());
        for field in Field::MEASURED {
            diagnostics.block_correlation[field.index()] =
                correlations.ratio_lag.get(block, field.index());
        }
        diagnostics.pressure_energy_correlation = pair(Field::Pressure, Field::Energy);
        diagnostics.derivative_correlation = pair(Field::DaDy, Field::DaDv2);
        diagnostics
    }
}

impl CutoffEstimate {
    pub fn get(&self, field: Field) -> Option<&Estimate> {
        match field {
            Field::Weight => None,
            other => self.measured.get(other.index()),
        }
    }

    fn subtract(&mut self, reference: &CutoffEstimate) {
        self.free_energy.value -= reference.free_energy.value;
        for f in 0..METER_WIDTH {
            self.measured[f].value -= reference.measured[f].value;
            self.correction[f] -= reference.correction[f];
        }
    }

    fn first_non_finite(&self) -> Option<(usize, f64)> {
        std::iter::once(self.free_energy.value)
            .chain(self.measured.iter().map(|e| e.value))
            .enumerate()
            .find(|(_, v)| !v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreeEnergyReport {
    pub entries: Vec<CutoffEstimate>,
    /// Cutoff the entries are differenced against, if any.
    pub reference: Option<usize>,
}

/// Turns block statistics of a reweighted run into per-cutoff estimates.
pub struct FreeEnergyAnalysis<'a> {
    config: &'a PipelineConfig,
    num_atoms: usize,
    volume: f64,
    energy_offsets: Option<Vec<f64>>,
    potential: Option<&'a dyn PairPotential>,
    auxiliary_potential: Option<&'a dyn PairPotential>,
}

impl<'a> FreeEnergyAnalysis<'a> {
    pub fn new(config: &'a PipelineConfig, system: &dyn SimulationBox) -> Self {
        Self {
            config,
            num_atoms: system.num_atoms(),
            volume: system.volume(),
            energy_offsets: config.energy_offsets.clone(),
            potential: None,
            auxiliary_potential: None,
        }
    }

    pub fn with_energy_offsets(mut self, offsets: Vec<f64>) -> Self {
        self.energy_offsets = Some(offsets);
        self
    }

    /// Potential whose tail corrects energy, pressure and `dA/dy`.
    pub fn with_potential(mut self, potential: &'a dyn PairPotential) -> Self {
        self.potential = Some(potential);
        self
    }

    /// Potential whose tail corrects `dA/dv²`; defaults to the main potential.
    pub fn with_auxiliary_potential(mut self, potential: &'a dyn PairPotential) -> Self {
        self.auxiliary_potential = Some(potential);
        self
    }

    fn correction(&self, rc: f64) -> [f64; METER_WIDTH] {
        let temperature = self.config.temperature;
        let main = self
            .potential
            .and_then(|p| LongRangeCorrection::for_system(p, rc, self.num_atoms, self.volume));
        let auxiliary = self
            .auxiliary_potential
            .or(self.potential)
            .and_then(|p| LongRangeCorrection::for_system(p, rc, self.num_atoms, self.volume));
        let [u, p, da_dy] = main
            .map(|lrc| [lrc.energy_per_atom(), lrc.pressure(), lrc.da_dy()])
            .unwrap_or_default();
        let da_dv2 = auxiliary.map_or(0.0, |lrc| lrc.da_dv2(temperature));
        [u, p, da_dy, da_dv2]
    }

    fn correlation_with_weight(
        stats: &BlockStatistics,
        layout: SampleLayout,
        block: usize,
        field: usize,
        err_w: f64,
    ) -> f64 {
        if err_w < SAMPLED_CUTOFF_WEIGHT_ERROR {
            return 0.0;
        }
        let weight = layout.offset(block, Field::Weight.index());
        match stats.correlation(layout.offset(block, field), weight) {
            Some(correlation) => correlation,
            None => {
                warn!(
                    block,
                    field, "Zero-variance channel, using zero correlation with the weight"
                );
                0.0
            }
        }
    }

    #[instrument(skip_all, name = "free_energy_report")]
    pub fn report(&self, stats: &BlockStatistics) -> Result<FreeEnergyReport, PipelineError> {
        let cutoffs = &self.config.cutoffs;
        let layout = SampleLayout::new(cutoffs.len(), METER_WIDTH).with_weight();
        if stats.average.layout() != layout {
            return Err(PipelineError::LayoutMismatch {
                stage: STAGE,
                expected: layout,
                found: stats.average.layout(),
            });
        }
        let offsets = self
            .energy_offsets
            .as_deref()
            .ok_or(PipelineError::NotConfigured {
                component: "FreeEnergyAnalysis",
                missing: "energy offsets",
            })?;
        if offsets.len() != cutoffs.len() {
            return Err(PipelineError::LayoutMismatch {
                stage: STAGE,
                expected: SampleLayout::new(cutoffs.len(), 1),
                found: SampleLayout::new(offsets.len(), 1),
            });
        }

        let n = self.num_atoms as f64;
        let temperature = self.config.temperature;
        let weight_field = Field::Weight.index();
        let mut entries = Vec::with_capacity(cutoffs.len());

        for (i, &radius) in cutoffs.radii().iter().enumerate() {
            let avg_w = stats.average.get(i, weight_field);
            let err_w = stats.error.get(i, weight_field);
            if !(avg_w.is_finite() && avg_w > 0.0) {
                error!(block = i, avg_w, "Average weight is not positive");
                return Err(PipelineError::NumericalCorruption {
                    stage: STAGE,
                    block: i,
                    field: weight_field,
                    value: avg_w,
                });
            }

            let correction = self.correction(radius);
            let lrc_energy = correction[Field::Energy.index()] * n;
            let free_energy = Estimate {
                value: (lrc_energy + offsets[i] - temperature * avg_w.ln()) / n,
                error: temperature * err_w / avg_w / n,
                bias: 0.0,
            };

            let mut measured = [Estimate::default(); METER_WIDTH];
            for (f, estimate) in measured.iter_mut().enumerate() {
                let correlation = Self::correlation_with_weight(stats, layout, i, f, err_w);
                *estimate = ratio_estimate(
                    stats.average.get(i, f),
                    stats.error.get(i, f),
                    avg_w,
                    err_w,
                    correlation,
                );
                estimate.value += correction[f];
            }

            entries.push(CutoffEstimate {
                radius,
                free_energy,
                measured,
                correction,
                diagnostics: CutoffDiagnostics::for_block(stats, i, avg_w, err_w),
            });
        }

        let reference = self.config.reference_cutoff;
        if let Some(index) = reference {
            let baseline = entries
                .get(index)
                .cloned()
                .ok_or(PipelineError::InvalidReference {
                    index,
                    blocks: entries.len(),
                })?;
            for entry in &mut entries {
                entry.subtract(&baseline);
            }
        }

        for (i, entry) in entries.iter().enumerate() {
            if let Some((field, value)) = entry.first_non_finite() {
                error!(block = i, field, value, "Non-finite free-energy estimate");
                return Err(PipelineError::NumericalCorruption {
                    stage: STAGE,
                    block: i,
                    field,
                    value,
                });
            }
            info!(
                rc = entry.radius,
                free_energy = entry.free_energy.value,
                free_energy_error = entry.free_energy.error,
                u = entry.measured[Field::Energy.index()].value,
                p = entry.measured[Field::Pressure.index()].value,
                weight_relative_error = entry.diagnostics.weight_relative_error,
                weight_correlation = entry.diagnostics.weight_correlation,
                "Cutoff estimate"
            );
        }

        Ok(FreeEnergyReport { entries, reference })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::configuration::Configuration;
    use crate::core::cutoffs::CutoffSet;
    use crate::core::geometry::OrthorhombicBoundary;
    use crate::core::potentials::{GaussianCore, LennardJones};
    use crate::engine::meter::MultiCutoffMeter;
    use crate::engine::ratio::RatioEstimator;
    use crate::engine::reweight::ReweightTransform;
    use crate::engine::sink::{DataPump, SampleCollector};
    use crate::engine::traversal::{PairRecord, RecordedPairs};
    use nalgebra::Point3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::PI;

    const TOLERANCE: f64 = 1e-12;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= TOLERANCE * (1.0 + a.abs().max(b.abs()))
    }

    fn weighted(values: Vec<f64>, blocks: usize) -> SampleVector {
        SampleVector::from_values(SampleLayout::new(blocks, METER_WIDTH + 1), values).unwrap()
    }

    fn config(radii: &[f64], temperature: f64, reference: Option<usize>) -> PipelineConfig {
        let mut builder = PipelineConfig::builder()
            .cutoffs(CutoffSet::new(radii.to_vec()).unwrap())
            .temperature(temperature)
            .energy_offsets(vec![0.0; radii.len()]);
        if let Some(index) = reference {
            builder = builder.reference_cutoff(index);
        }
        builder.build().unwrap()
    }

    fn system(num_atoms: usize, edge: f64) -> Configuration {
        Configuration::new(
            OrthorhombicBoundary::cubic(edge).unwrap(),
            vec![Point3::origin(); num_atoms],
        )
    }

    fn mean_of(samples: &[SampleVector]) -> SampleVector {
        let mut mean = SampleVector::zeros(samples[0].layout());
        for sample in samples {
            for (m, &x) in mean.as_mut_slice().iter_mut().zip(sample.as_slice()) {
                *m += x;
            }
        }
        let count = samples.len() as f64;
        mean.as_mut_slice().iter_mut().for_each(|m| *m /= count);
        mean.num_atoms = samples[0].num_atoms;
        mean
    }

    #[test]
    fn calibrated_offsets_reproduce_initial_energies() {
        let raw = SampleVector::from_values(
            SampleLayout::new(2, METER_WIDTH),
            vec![-2.0, 0.0, 0.0, 0.0, -2.5, 0.0, 0.0, 0.0],
        )
        .unwrap()
        .stamped(0, 10);
        assert_eq!(calibrate_energy_offsets(&raw, -19.0), vec![-1.0, -6.0]);
    }

    #[test]
    fn extended_offsets_keep_the_shared_prefix() {
        let raw = SampleVector::from_values(
            SampleLayout::new(3, METER_WIDTH),
            vec![-2.0, 0.0, 0.0, 0.0, -2.5, 0.0, 0.0, 0.0, -3.0, 0.0, 0.0, 0.0],
        )
        .unwrap()
        .stamped(0, 10);
        let offsets = extend_energy_offsets(&[0.25, 0.5], &raw, -20.0);
        assert_eq!(offsets, vec![0.25, 0.5, -10.0]);
    }

    #[test]
    fn lennard_jones_long_range_correction_matches_closed_form() {
        let lj = LennardJones::reduced();
        let (n, volume, rc) = (100, 125.0, 2.5);
        let lrc = LongRangeCorrection::for_system(&lj, rc, n, volume).unwrap();

        let rho: f64 = 0.8;
        let pairs = 100.0 * 99.0 / 2.0 / volume;
        let energy = pairs * 16.0 * PI * (rc.powi(-9) / 9.0 - rc.powi(-3) / 3.0);
        let virial = pairs * 16.0 * PI * (-12.0 * rc.powi(-9) / 9.0 + 6.0 * rc.powi(-3) / 3.0);
        assert!(approx(lrc.energy, energy));
        assert!(approx(lrc.virial, virial));
        assert!(approx(lrc.pressure(), -virial / (3.0 * volume)));
        assert!(approx(lrc.da_dy(), energy / 100.0 / (4.0 * rho.powi(4))));
        let expected_dv2 =
            (-lrc.pressure() / (1.5 * rho) + 4.0 * lrc.energy_per_atom() / 1.5) * rho * rho / 2.0;
        assert!(approx(lrc.da_dv2(1.5), expected_dv2));
    }

    #[test]
    fn potential_without_tail_has_no_correction() {
        let gaussian = GaussianCore::new(1.0, 1.0);
        assert!(LongRangeCorrection::for_system(&gaussian, 2.0, 10, 100.0).is_none());
    }

    #[test]
    fn block_statistics_from_block_means() {
        let blocks = vec![
            weighted(vec![1.0, 0.0, 0.0, 0.0, 1.0], 1),
            weighted(vec![3.0, 0.0, 0.0, 0.0, 2.0], 1),
            weighted(vec![5.0, 0.0, 0.0, 0.0, 3.0], 1),
        ];
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        assert!(approx(stats.average.get(0, 0), 3.0));
        assert!(approx(stats.average.get(0, 4), 2.0));
        // Sample variance 4 over 3 blocks.
        assert!(approx(stats.error.get(0, 0), (4.0f64 / 3.0).sqrt()));
        assert!(approx(stats.covariance[(0, 4)], 2.0));
        assert!(approx(stats.correlation(0, 4).unwrap(), 1.0));
        assert_eq!(stats.correlation(1, 4), None);
    }

    #[test]
    fn report_carries_block_correlations() {
        // Per-block ratios: U = 1, 2, 3, 4 with P = 2U and dA/dv² = −dA/dy.
        let weights = [1.0, 2.0, 1.0, 2.0];
        let blocks: Vec<SampleVector> = weights
            .iter()
            .enumerate()
            .map(|(b, &w)| {
                let u = (b + 1) as f64;
                weighted(vec![u * w, 2.0 * u * w, u * w, -u * w, w], 1)
            })
            .collect();
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        let correlations = stats.block_correlations.as_ref().unwrap();
        assert!(approx(correlations.lag.get(0, Field::Weight.index()), -0.75));
        assert!(approx(correlations.ratio_lag.get(0, Field::Energy.index()), 0.25));

        let config = config(&[2.0], 1.0, None);
        let system = system(10, 5.0);
        let report = FreeEnergyAnalysis::new(&config, &system).report(&stats).unwrap();
        let diagnostics = &report.entries[0].diagnostics;

        let err_w = (1.0f64 / 12.0).sqrt();
        assert!(approx(diagnostics.weight_relative_error, err_w / 1.5));
        assert!(approx(diagnostics.weight_correlation, -0.75));
        assert!(approx(diagnostics.block_correlation[Field::Pressure.index()], 0.25));
        assert!(approx(diagnostics.pressure_energy_correlation, 1.0));
        assert!(approx(diagnostics.derivative_correlation, -1.0));
    }

    #[test]
    fn statistics_without_block_means_report_only_weight_error() {
        let average = weighted(vec![1.0, 1.0, 1.0, 1.0, 2.0], 1);
        let error = weighted(vec![0.1, 0.1, 0.1, 0.1, 0.5], 1);
        let stats = BlockStatistics::new(average, error, DMatrix::identity(5, 5)).unwrap();
        assert!(stats.block_correlations.is_none());

        let config = config(&[2.0], 1.0, None);
        let system = system(10, 5.0);
        let report = FreeEnergyAnalysis::new(&config, &system).report(&stats).unwrap();
        let diagnostics = report.entries[0].diagnostics;
        assert!(approx(diagnostics.weight_relative_error, 0.25));
        assert_eq!(diagnostics.weight_correlation, 0.0);
        assert_eq!(diagnostics.pressure_energy_correlation, 0.0);
    }

    #[test]
    fn block_statistics_need_two_blocks() {
        let blocks = vec![weighted(vec![1.0; 5], 1)];
        assert!(matches!(
            BlockStatistics::from_block_means(&blocks),
            Err(PipelineError::InsufficientData { needed: 2, found: 1 })
        ));
    }

    #[test]
    fn block_statistics_reject_mismatched_covariance() {
        let result = BlockStatistics::new(
            weighted(vec![1.0; 5], 1),
            weighted(vec![0.0; 5], 1),
            DMatrix::zeros(4, 4),
        );
        assert!(matches!(result, Err(PipelineError::LayoutMismatch { .. })));
    }

    #[test]
    fn ratio_estimate_with_exact_weights_keeps_channel_error() {
        let estimate = ratio_estimate(3.0, 0.2, 1.0, 0.0, 0.0);
        assert_eq!(estimate, Estimate { value: 3.0, error: 0.2, bias: 0.0 });
    }

    #[test]
    fn ratio_estimate_propagates_correlated_errors() {
        let (x, ex, w, ew, cor) = (2.0, 0.1, 0.5, 0.05, 0.4);
        let estimate = ratio_estimate(x, ex, w, ew, cor);
        let r = x / w;
        let expected = r.abs()
            * (ex * ex / (x * x) + ew * ew / (w * w) - 2.0 * ex * ew / (x * w) * cor).sqrt();
        assert!(approx(estimate.value, 4.0));
        assert!(approx(estimate.error, expected));
        let relative_bias = ew * ew / (w * w) - ex * ew / (x * w) * cor;
        assert!(approx(estimate.bias, r * relative_bias));
    }

    #[test]
    fn report_with_unit_weights_returns_plain_averages() {
        let config = config(&[2.0, 2.5], 1.0, None);
        let system = system(10, 5.0);
        let blocks = vec![
            weighted(vec![-1.0, 0.5, 0.1, 0.2, 1.0, -1.2, 0.4, 0.1, 0.3, 1.0], 2),
            weighted(vec![-1.2, 0.7, 0.1, 0.4, 1.0, -1.4, 0.6, 0.1, 0.5, 1.0], 2),
        ];
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        let report = FreeEnergyAnalysis::new(&config, &system).report(&stats).unwrap();

        assert_eq!(report.entries.len(), 2);
        let first = &report.entries[0];
        assert_eq!(first.free_energy.value, 0.0);
        assert!(approx(first.measured[0].value, -1.1));
        assert!(approx(first.measured[0].error, stats.error.get(0, 0)));
        assert_eq!(first.measured[0].bias, 0.0);
        assert_eq!(first.correction, [0.0; METER_WIDTH]);
    }

    #[test]
    fn report_adds_long_range_correction() {
        let config = config(&[2.5], 1.2, None);
        let system = system(100, 5.0);
        let blocks = vec![
            weighted(vec![-5.0, 1.0, 0.0, 0.0, 1.0], 1),
            weighted(vec![-5.0, 1.0, 0.0, 0.0, 1.0], 1),
        ];
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        let lj = LennardJones::reduced();
        let report = FreeEnergyAnalysis::new(&config, &system)
            .with_potential(&lj)
            .report(&stats)
            .unwrap();

        let lrc = LongRangeCorrection::for_system(&lj, 2.5, 100, 125.0).unwrap();
        let entry = &report.entries[0];
        assert!(approx(entry.measured[0].value, -5.0 + lrc.energy_per_atom()));
        assert!(approx(entry.measured[1].value, 1.0 + lrc.pressure()));
        assert!(approx(entry.measured[3].value, lrc.da_dv2(1.2)));
        assert!(approx(entry.free_energy.value, lrc.energy / 100.0));
    }

    #[test]
    fn auxiliary_potential_only_corrects_dadv2() {
        let config = config(&[2.5], 1.0, None);
        let system = system(50, 5.0);
        let unit_weight = weighted(vec![0.0, 0.0, 0.0, 0.0, 1.0], 1);
        let blocks = vec![unit_weight.clone(), unit_weight];
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        let lj = LennardJones::reduced();
        let steep = LennardJones::new(1.1, 0.5);

        let report = FreeEnergyAnalysis::new(&config, &system)
            .with_potential(&lj)
            .with_auxiliary_potential(&steep)
            .report(&stats)
            .unwrap();
        let main = LongRangeCorrection::for_system(&lj, 2.5, 50, 125.0).unwrap();
        let aux = LongRangeCorrection::for_system(&steep, 2.5, 50, 125.0).unwrap();
        let correction = report.entries[0].correction;
        assert!(approx(correction[0], main.energy_per_atom()));
        assert!(approx(correction[3], aux.da_dv2(1.0)));
    }

    #[test]
    fn report_with_reference_zeroes_the_reference_entry() {
        let config = config(&[2.0, 2.5, 3.0], 0.9, Some(1));
        let system = system(20, 6.0);
        let blocks = vec![
            weighted(
                vec![
                    -1.0, 0.5, 0.1, 0.2, 1.0, -1.2, 0.4, 0.1, 0.3, 0.9, -1.3, 0.4, 0.1, 0.3, 0.8,
                ],
                3,
            ),
            weighted(
                vec![
                    -1.1, 0.6, 0.1, 0.2, 1.0, -1.3, 0.5, 0.2, 0.3, 1.1, -1.5, 0.5, 0.1, 0.4, 1.3,
                ],
                3,
            ),
        ];
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        let report = FreeEnergyAnalysis::new(&config, &system).report(&stats).unwrap();

        assert_eq!(report.reference, Some(1));
        let reference = &report.entries[1];
        assert_eq!(reference.free_energy.value, 0.0);
        assert!(reference.measured.iter().all(|e| e.value == 0.0));
        assert!(report.entries[2].free_energy.value != 0.0);
    }

    #[test]
    fn report_rejects_non_positive_average_weight() {
        let config = config(&[2.0], 1.0, None);
        let system = system(4, 5.0);
        let blocks = vec![weighted(vec![1.0, 1.0, 1.0, 1.0, 0.0], 1); 2];
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        let err = FreeEnergyAnalysis::new(&config, &system).report(&stats).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NumericalCorruption { block: 0, field: 4, .. }
        ));
    }

    #[test]
    fn report_without_offsets_is_not_configured() {
        let config = PipelineConfig::builder()
            .cutoffs(CutoffSet::new(vec![2.0]).unwrap())
            .temperature(1.0)
            .build()
            .unwrap();
        let system = system(4, 5.0);
        let blocks = vec![weighted(vec![1.0; 5], 1); 2];
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        let err = FreeEnergyAnalysis::new(&config, &system).report(&stats).unwrap_err();
        assert!(matches!(err, PipelineError::NotConfigured { .. }));

        let report = FreeEnergyAnalysis::new(&config, &system)
            .with_energy_offsets(vec![0.0])
            .report(&stats);
        assert!(report.is_ok());
    }

    #[test]
    fn zero_variance_channel_uses_zero_correlation() {
        let config = config(&[2.0], 1.0, None);
        let system = system(4, 5.0);
        let blocks = vec![
            weighted(vec![2.0, 1.0, 1.0, 1.0, 0.8], 1),
            weighted(vec![2.0, 1.0, 1.0, 1.0, 1.2], 1),
        ];
        let stats = BlockStatistics::from_block_means(&blocks).unwrap();
        let report = FreeEnergyAnalysis::new(&config, &system).report(&stats).unwrap();
        let energy = report.entries[0].measured[0];
        let err_w = stats.error.get(0, 4);
        assert!(approx(energy.value, 2.0));
        assert!(approx(energy.error, 2.0 * err_w));
        assert!(approx(energy.bias, 2.0 * err_w * err_w));
    }

    const CUTOFFS: [f64; 3] = [2.0, 2.5, 3.0];
    const NUM_ATOMS: usize = 8;
    const TEMPERATURE: f64 = 1.3;

    /// Seeded frames of LJ pair visits together with each frame's energy
    /// inside the shortest cutoff, which stands in for the simulated potential.
    fn recorded_run(seed: u64, frames: u64) -> (Vec<PairRecord>, Vec<f64>) {
        let lj = LennardJones::reduced();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut records = Vec::new();
        let mut fast = Vec::new();
        for frame in 0..frames {
            let mut energy = 0.0;
            for _ in 0..12 {
                let r: f64 = rng.gen_range(0.95..3.2);
                let cos_theta: f64 = rng.gen_range(-1.0..1.0);
                let phi: f64 = rng.gen_range(0.0..2.0 * PI);
                let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
                let (dx, dy, dz) = (
                    r * sin_theta * phi.cos(),
                    r * sin_theta * phi.sin(),
                    r * cos_theta,
                );
                let r2 = dx * dx + dy * dy + dz * dz;
                let (u, du) = (lj.u(r2), lj.du(r2));
                if r2 <= CUTOFFS[0] * CUTOFFS[0] {
                    energy += u;
                }
                records.push(PairRecord { frame, dx, dy, dz, u, du });
            }
            fast.push(energy);
        }
        (records, fast)
    }

    /// Meter, reweight and collector driven by a pump over a recorded run.
    fn reweighted_samples(records: &[PairRecord], fast: &[f64]) -> Vec<SampleVector> {
        let system = Configuration::new(
            OrthorhombicBoundary::cubic(4.0).unwrap(),
            vec![Point3::origin(); NUM_ATOMS],
        );
        let cutoffs = CutoffSet::new(CUTOFFS.to_vec()).unwrap();
        let mut collector = SampleCollector::new();
        {
            let mut meter = MultiCutoffMeter::new(cutoffs.clone(), TEMPERATURE);
            meter.set_box(&system);
            meter.set_main_evaluator(Box::new(RecordedPairs::from_records(records.to_vec()).unwrap()));

            let mut next = fast.iter().copied();
            let mut reweight = ReweightTransform::new(
                meter.layout(),
                TEMPERATURE,
                vec![0.0; cutoffs.len()],
                move || next.next().unwrap_or(f64::NAN),
            )
            .unwrap();
            reweight.set_data_sink(Box::new(&mut collector));

            let mut pump = DataPump::new(meter, reweight, 1);
            for step in 0..fast.len() as u64 {
                pump.on_step(step).unwrap();
            }
        }
        collector.into_samples()
    }

    #[test]
    fn config_driven_pipeline_matches_hand_assembled_one() {
        let (records, fast) = recorded_run(3, 12);
        let config = PipelineConfig::from_toml_str(
            r#"
            temperature = 1.3
            sampling-interval = 3
            reference-cutoff = 1
            energy-offsets = [0.0, -0.25, -0.5]

            [cutoffs]
            radii = [2.0, 2.5, 3.0]
            "#,
        )
        .unwrap();
        let system = Configuration::new(
            OrthorhombicBoundary::cubic(4.0).unwrap(),
            vec![Point3::origin(); NUM_ATOMS],
        );

        let mut from_config = SampleCollector::new();
        let mut by_hand = SampleCollector::new();
        {
            let mut meter = MultiCutoffMeter::from_config(&config);
            meter.set_box(&system);
            meter.set_main_evaluator(Box::new(RecordedPairs::from_records(records.clone()).unwrap()));
            let mut next = fast.iter().copied();
            let mut reweight =
                ReweightTransform::from_config(&config, move || next.next().unwrap_or(f64::NAN))
                    .unwrap();
            reweight.set_data_sink(Box::new(&mut from_config));
            let mut pump = DataPump::from_config(meter, reweight, &config);
            for step in 1..=fast.len() as u64 {
                pump.on_step(step).unwrap();
            }
            assert_eq!(pump.pumped(), 4);
        }
        {
            let cutoffs = CutoffSet::new(CUTOFFS.to_vec()).unwrap();
            let mut meter = MultiCutoffMeter::new(cutoffs, TEMPERATURE);
            meter.set_box(&system);
            meter.set_main_evaluator(Box::new(RecordedPairs::from_records(records).unwrap()));
            let mut next = fast.iter().copied();
            let mut reweight = ReweightTransform::new(
                meter.layout(),
                TEMPERATURE,
                vec![0.0, -0.25, -0.5],
                move || next.next().unwrap_or(f64::NAN),
            )
            .unwrap();
            reweight.set_data_sink(Box::new(&mut by_hand));
            let mut pump = DataPump::new(meter, reweight, 3);
            for step in 1..=fast.len() as u64 {
                pump.on_step(step).unwrap();
            }
        }

        let steps: Vec<u64> = from_config.samples().iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![3, 6, 9, 12]);
        assert_eq!(from_config, by_hand);

        let mut ratio = RatioEstimator::from_config(&config).unwrap();
        let estimate = ratio.process(&from_config.samples()[0]).unwrap();
        assert!(estimate.block(1).iter().all(|&v| v == 0.0));
    }

    fn analyse(samples: &[SampleVector]) -> (SampleVector, FreeEnergyReport) {
        let block_means: Vec<SampleVector> = samples.chunks(5).map(mean_of).collect();
        let stats = BlockStatistics::from_block_means(&block_means).unwrap();

        let layout = stats.average.layout();
        let mut ratio = RatioEstimator::new(layout).unwrap().with_reference(0).unwrap();
        let estimates = ratio.process(&stats.average).unwrap().clone();

        let config = config(&CUTOFFS, TEMPERATURE, Some(0));
        let system = system(NUM_ATOMS, 4.0);
        let report = FreeEnergyAnalysis::new(&config, &system).report(&stats).unwrap();
        (estimates, report)
    }

    #[test]
    fn recorded_run_replays_identically() {
        let (records, fast) = recorded_run(7, 20);
        let first = reweighted_samples(&records, &fast);
        let second = reweighted_samples(&records, &fast);
        assert_eq!(first.len(), 20);
        assert_eq!(first, second);

        let (estimates_a, report_a) = analyse(&first);
        let (estimates_b, report_b) = analyse(&second);
        assert_eq!(estimates_a, estimates_b);
        assert_eq!(report_a, report_b);
    }

    #[test]
    fn recorded_run_pipeline_is_self_consistent() {
        let (records, fast) = recorded_run(11, 20);
        let samples = reweighted_samples(&records, &fast);

        // The shortest cutoff is the sampled one, so its weights stay at one.
        for sample in &samples {
            assert!((sample.get(0, 4) - 1.0).abs() < 1e-9);
        }

        let (estimates, report) = analyse(&samples);
        assert!(estimates.block(0).iter().all(|&v| v == 0.0));
        assert_eq!(report.entries[0].free_energy.value, 0.0);
        assert!(report.entries.iter().all(|e| e.free_energy.error.is_finite()));

        // Referenced ratio stage and report agree on the measured channels.
        for (i, entry) in report.entries.iter().enumerate() {
            for f in 0..METER_WIDTH {
                let tolerance = 1e-9 * (1.0 + estimates.get(i, f).abs());
                assert!((entry.measured[f].value - estimates.get(i, f)).abs() < tolerance);
            }
        }
    }
}

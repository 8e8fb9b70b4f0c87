use super::accumulator::{AccumulatorChannels, CutoffAccumulator};
use super::config::PipelineConfig;
use super::error::PipelineError;
use super::sink::DataSource;
use super::traversal::PairTraversal;
use crate::core::bucket::PairSumBucket;
use crate::core::configuration::SimulationBox;
use crate::core::cutoffs::CutoffSet;
use crate::core::sample::{Field, METER_WIDTH, SampleLayout, SampleVector};
use tracing::{debug, instrument};

const COMPONENT: &str = "MultiCutoffMeter";

/// Thermodynamic state the per-cutoff quantities are derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatePoint {
    pub num_atoms: usize,
    pub volume: f64,
    pub dimension: usize,
    pub temperature: f64,
}

impl StatePoint {
    pub fn density(&self) -> f64 {
        self.num_atoms as f64 / self.volume
    }

    /// `U`, `P`, `dA/dy` and `dA/dv²` for one cutoff.
    ///
    /// `main` supplies energy and pressure; `auxiliary` supplies the sums the
    /// `dA/dv²` channel is built from, using only their configurational
    /// (virial) pressure.
    pub fn block(&self, main: &PairSumBucket, auxiliary: &PairSumBucket) -> [f64; METER_WIDTH] {
        let n = self.num_atoms as f64;
        let rho = self.density();
        let t = self.temperature;
        let dv = self.volume * self.dimension as f64;

        let u = main.energy / n;
        let p = rho * t - main.virial / dv;
        let da_dy = u / (4.0 * rho.powi(4));

        let u_aux = auxiliary.energy / n;
        let p_aux = -auxiliary.virial / dv;
        let da_dv2 = -(p_aux / (t * rho) - 4.0 * u_aux / t) * rho * rho / 2.0;

        [u, p, da_dy, da_dv2]
    }
}

/// Turns one pass of per-cutoff pair sums into a `k × 4` sample of
/// `{U, P, dA/dy, dA/dv²}` blocks.
///
/// The meter has two evaluator slots. The main evaluator drives energy and
/// pressure. The optional auxiliary evaluator, typically a lattice sum over an
/// unshifted potential, is run in a separate pass and drives only the
/// `dA/dv²` channel; without it that channel falls back to the main sums.
pub struct MultiCutoffMeter<'a> {
    temperature: f64,
    system: Option<&'a dyn SimulationBox>,
    main: Option<Box<dyn PairTraversal + 'a>>,
    auxiliary: Option<Box<dyn PairTraversal + 'a>>,
    main_sums: CutoffAccumulator,
    auxiliary_sums: CutoffAccumulator,
    sample: SampleVector,
}

impl<'a> MultiCutoffMeter<'a> {
    pub fn new(cutoffs: CutoffSet, temperature: f64) -> Self {
        let layout = SampleLayout::new(cutoffs.len(), METER_WIDTH);
        Self {
            temperature,
            system: None,
            main: None,
            auxiliary: None,
            main_sums: CutoffAccumulator::new(cutoffs.clone(), AccumulatorChannels::EnergyVirial),
            auxiliary_sums: CutoffAccumulator::new(cutoffs, AccumulatorChannels::EnergyVirial),
            sample: SampleVector::zeros(layout),
        }
    }

    /// A meter over the configured cutoffs at the configured temperature.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.cutoffs.clone(), config.temperature)
    }

    pub fn set_box(&mut self, system: &'a dyn SimulationBox) {
        self.system = Some(system);
    }

    pub fn set_main_evaluator(&mut self, evaluator: Box<dyn PairTraversal + 'a>) {
        self.main = Some(evaluator);
    }

    pub fn set_auxiliary_evaluator(&mut self, evaluator: Box<dyn PairTraversal + 'a>) {
        self.auxiliary = Some(evaluator);
    }

    pub fn clear_auxiliary_evaluator(&mut self) {
        self.auxiliary = None;
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn cutoffs(&self) -> &CutoffSet {
        self.main_sums.cutoffs()
    }

    pub fn layout(&self) -> SampleLayout {
        self.sample.layout()
    }

    /// Per-cutoff sums of the last main pass.
    pub fn main_sums(&self) -> &[PairSumBucket] {
        self.main_sums.finalize()
    }

    fn state_point(&self) -> Result<StatePoint, PipelineError> {
        let system = self.system.ok_or(PipelineError::NotConfigured {
            component: COMPONENT,
            missing: "box",
        })?;
        let num_atoms = system.num_atoms();
        if num_atoms == 0 {
            return Err(PipelineError::NotConfigured {
                component: COMPONENT,
                missing: "atoms in the box",
            });
        }
        Ok(StatePoint {
            num_atoms,
            volume: system.volume(),
            dimension: system.boundary().dimension(),
            temperature: self.temperature,
        })
    }

    /// Runs the configured evaluators and rebuilds the sample for `step`.
    #[instrument(skip_all, name = "multi_cutoff_sample", fields(step = step))]
    pub fn sample(&mut self, step: u64) -> Result<&SampleVector, PipelineError> {
        let state = self.state_point()?;
        let main = self.main.as_mut().ok_or(PipelineError::NotConfigured {
            component: COMPONENT,
            missing: "main evaluator",
        })?;
        main.compute_all(&mut self.main_sums)?;

        let auxiliary_sums = match self.auxiliary.as_mut() {
            Some(auxiliary) => {
                auxiliary.compute_all(&mut self.auxiliary_sums)?;
                self.auxiliary_sums.finalize()
            }
            None => self.main_sums.finalize(),
        };

        for (i, (main, auxiliary)) in self
            .main_sums
            .finalize()
            .iter()
            .zip(auxiliary_sums)
            .enumerate()
        {
            self.sample.block_mut(i).copy_from_slice(&state.block(main, auxiliary));
        }
        self.sample.step = step;
        self.sample.num_atoms = state.num_atoms;

        debug!(
            cutoffs = self.sample.layout().blocks,
            u_short = self.sample.get(0, Field::Energy.index()),
            pairs = self.main_sums.pairs_accepted(),
            "Multi-cutoff sample taken"
        );
        Ok(&self.sample)
    }
}

impl DataSource for MultiCutoffMeter<'_> {
    fn layout(&self) -> SampleLayout {
        MultiCutoffMeter::layout(self)
    }

    fn get_data(&mut self, step: u64) -> Result<&SampleVector, PipelineError> {
        self.sample(step)
    }
}

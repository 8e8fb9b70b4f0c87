use super::cache::ValueCache;
use super::config::{ConfigError, PipelineConfig};
use super::error::PipelineError;
use super::sink::{DataSink, check_layout};
use crate::core::sample::{Field, METER_WIDTH, SampleLayout, SampleVector};
use tracing::{error, trace};

const STAGE: &str = "reweight";

type FastEnergy<'a> = Box<dyn FnMut() -> f64 + 'a>;

/// Importance-weights every per-cutoff block of a raw sample and appends the
/// weight as a trailing field.
///
/// For block `i` with per-atom energy `Uᵢ`, the weight is
/// `exp(−(N·Uᵢ − (u_fast + uFac[i]))/T)` where `u_fast` is the total energy
/// under the potential actually simulated, memoized per step.
pub struct ReweightTransform<'a> {
    temperature: f64,
    energy_offsets: Vec<f64>,
    fast_energy: ValueCache<FastEnergy<'a>>,
    input: SampleLayout,
    output: SampleVector,
    sink: Option<Box<dyn DataSink + 'a>>,
}

impl<'a> ReweightTransform<'a> {
    pub fn new(
        input: SampleLayout,
        temperature: f64,
        energy_offsets: Vec<f64>,
        fast_energy: impl FnMut() -> f64 + 'a,
    ) -> Result<Self, PipelineError> {
        check_offsets(input, &energy_offsets)?;
        Ok(Self {
            temperature,
            energy_offsets,
            fast_energy: ValueCache::new(Box::new(fast_energy)),
            input,
            output: SampleVector::zeros(input.with_weight()),
            sink: None,
        })
    }

    /// A transform for raw meter samples over the configured cutoffs, using
    /// the configured temperature and energy offsets.
    pub fn from_config(
        config: &PipelineConfig,
        fast_energy: impl FnMut() -> f64 + 'a,
    ) -> Result<Self, PipelineError> {
        let offsets = config
            .energy_offsets
            .clone()
            .ok_or(PipelineError::NotConfigured {
                component: "ReweightTransform",
                missing: "energy offsets",
            })?;
        let input = SampleLayout::new(config.cutoffs.len(), METER_WIDTH);
        Self::new(input, config.temperature, offsets, fast_energy)
    }

    pub fn set_data_sink(&mut self, sink: Box<dyn DataSink + 'a>) {
        self.sink = Some(sink);
    }

    pub fn set_energy_offsets(&mut self, offsets: Vec<f64>) -> Result<(), PipelineError> {
        check_offsets(self.input, &offsets)?;
        self.energy_offsets = offsets;
        Ok(())
    }

    pub fn energy_offsets(&self) -> &[f64] {
        &self.energy_offsets
    }

    pub fn input_layout(&self) -> SampleLayout {
        self.input
    }

    pub fn output_layout(&self) -> SampleLayout {
        self.output.layout()
    }

    /// Reweights `sample`; the result stays valid until the next call.
    pub fn process(&mut self, sample: &SampleVector) -> Result<&SampleVector, PipelineError> {
        self.reweight(sample)?;
        Ok(&self.output)
    }

    fn reweight(&mut self, sample: &SampleVector) -> Result<(), PipelineError> {
        check_layout(STAGE, self.input, sample)?;
        let fast = self.fast_energy.get_value(sample.step);
        let n = sample.num_atoms as f64;
        let width = self.input.width;

        for (i, &offset) in self.energy_offsets.iter().enumerate() {
            let raw = sample.block(i);
            let delta_u = n * raw[Field::Energy.index()] - (fast + offset);
            let weight = (-delta_u / self.temperature).exp();

            let out = self.output.block_mut(i);
            for (o, &x) in out[..width].iter_mut().zip(raw) {
                *o = x * weight;
            }
            out[width] = weight;
        }
        self.output.step = sample.step;
        self.output.num_atoms = sample.num_atoms;

        if let Some((block, field, value)) = self.output.first_non_finite() {
            error!(
                step = sample.step,
                block, field, value, "Non-finite value after reweighting"
            );
            return Err(PipelineError::NumericalCorruption {
                stage: STAGE,
                block,
                field,
                value,
            });
        }
        trace!(step = sample.step, fast, "Sample reweighted");
        Ok(())
    }
}

fn check_offsets(input: SampleLayout, offsets: &[f64]) -> Result<(), ConfigError> {
    if offsets.len() != input.blocks {
        return Err(ConfigError::InvalidParameter {
            name: "energy_offsets",
            reason: format!("expected {} offsets, got {}", input.blocks, offsets.len()),
        });
    }
    Ok(())
}

impl DataSink for ReweightTransform<'_> {
    fn put_data(&mut self, sample: &SampleVector) -> Result<(), PipelineError> {
        self.reweight(sample)?;
        if let Some(sink) = self.sink.as_mut() {
            sink.put_data(&self.output)?;
        }
        Ok(())
    }
}

use super::config::PipelineConfig;
use super::error::PipelineError;
use super::sink::{DataSink, check_layout};
use crate::core::sample::{METER_WIDTH, SampleLayout, SampleVector};
use tracing::error;

const STAGE: &str = "ratio";

/// Self-normalized estimates from a block-averaged weighted sample.
///
/// Each input block ends with the averaged weight; the output drops it and
/// divides every other field by it. With a reference cutoff, the reference
/// block is subtracted from every block, leaving the reference itself zero.
pub struct RatioEstimator<'a> {
    input: SampleLayout,
    reference: Option<usize>,
    output: SampleVector,
    baseline: Vec<f64>,
    sink: Option<Box<dyn DataSink + 'a>>,
}

impl<'a> RatioEstimator<'a> {
    /// `input` is the weighted layout, weight field included.
    pub fn new(input: SampleLayout) -> Result<Self, PipelineError> {
        if input.width == 0 {
            return Err(PipelineError::MissingWeight {
                stage: STAGE,
                found: input,
            });
        }
        let output = input.without_weight();
        Ok(Self {
            input,
            reference: None,
            output: SampleVector::zeros(output),
            baseline: vec![0.0; output.width],
            sink: None,
        })
    }

    /// An estimator for reweighted meter samples over the configured cutoffs,
    /// referenced against the configured reference cutoff.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let input = SampleLayout::new(config.cutoffs.len(), METER_WIDTH).with_weight();
        let mut estimator = Self::new(input)?;
        estimator.set_reference(config.reference_cutoff)?;
        Ok(estimator)
    }

    pub fn with_reference(mut self, index: usize) -> Result<Self, PipelineError> {
        self.set_reference(Some(index))?;
        Ok(self)
    }

    pub fn set_reference(&mut self, reference: Option<usize>) -> Result<(), PipelineError> {
        match reference {
            Some(index) if index >= self.input.blocks => {
                return Err(PipelineError::InvalidReference {
                    index,
                    blocks: self.input.blocks,
                });
            }
            _ => {}
        }
        self.reference = reference;
        Ok(())
    }

    pub fn reference(&self) -> Option<usize> {
        self.reference
    }

    pub fn set_data_sink(&mut self, sink: Box<dyn DataSink + 'a>) {
        self.sink = Some(sink);
    }

    pub fn output_layout(&self) -> SampleLayout {
        self.output.layout()
    }

    pub fn process(&mut self, averaged: &SampleVector) -> Result<&SampleVector, PipelineError> {
        self.estimate(averaged)?;
        Ok(&self.output)
    }

    fn estimate(&mut self, averaged: &SampleVector) -> Result<(), PipelineError> {
        check_layout(STAGE, self.input, averaged)?;
        let width = self.output.layout().width;

        for i in 0..self.input.blocks {
            let block = averaged.block(i);
            let weight = block[width];
            for (o, &x) in self.output.block_mut(i).iter_mut().zip(block) {
                *o = x / weight;
            }
        }

        if let Some(reference) = self.reference {
            self.baseline.copy_from_slice(self.output.block(reference));
            for i in 0..self.input.blocks {
                for (o, &base) in self.output.block_mut(i).iter_mut().zip(&self.baseline) {
                    *o -= base;
                }
            }
        }
        self.output.step = averaged.step;
        self.output.num_atoms = averaged.num_atoms;

        if let Some((block, field, value)) = self.output.first_non_finite() {
            error!(block, field, value, "Non-finite ratio estimate");
            return Err(PipelineError::NumericalCorruption {
                stage: STAGE,
                block,
                field,
                value,
            });
        }
        Ok(())
    }
}

impl DataSink for RatioEstimator<'_> {
    fn put_data(&mut self, sample: &SampleVector) -> Result<(), PipelineError> {
        self.estimate(sample)?;
        if let Some(sink) = self.sink.as_mut() {
            sink.put_data(&self.output)?;
        }
        Ok(())
    }
}

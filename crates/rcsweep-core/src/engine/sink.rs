use super::config::PipelineConfig;
use super::error::PipelineError;
use crate::core::sample::{SampleLayout, SampleVector};
use tracing::trace;

/// A stage that receives samples.
pub trait DataSink {
    fn put_data(&mut self, sample: &SampleVector) -> Result<(), PipelineError>;
}

impl<T: DataSink + ?Sized> DataSink for &mut T {
    fn put_data(&mut self, sample: &SampleVector) -> Result<(), PipelineError> {
        (**self).put_data(sample)
    }
}

impl<T: DataSink + ?Sized> DataSink for Box<T> {
    fn put_data(&mut self, sample: &SampleVector) -> Result<(), PipelineError> {
        (**self).put_data(sample)
    }
}

/// A stage that produces one sample on demand.
pub trait DataSource {
    fn layout(&self) -> SampleLayout;

    /// Produces the sample for simulation step `step`.
    fn get_data(&mut self, step: u64) -> Result<&SampleVector, PipelineError>;
}

impl<T: DataSource + ?Sized> DataSource for &mut T {
    fn layout(&self) -> SampleLayout {
        (**self).layout()
    }

    fn get_data(&mut self, step: u64) -> Result<&SampleVector, PipelineError> {
        (**self).get_data(step)
    }
}

pub(crate) fn check_layout(
    stage: &'static str,
    expected: SampleLayout,
    sample: &SampleVector,
) -> Result<(), PipelineError> {
    if sample.layout() != expected {
        return Err(PipelineError::LayoutMismatch {
            stage,
            expected,
            found: sample.layout(),
        });
    }
    Ok(())
}

/// Terminal sink that keeps every sample it receives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleCollector {
    samples: Vec<SampleVector>,
}

impl SampleCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[SampleVector] {
        &self.samples
    }

    pub fn last(&self) -> Option<&SampleVector> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn into_samples(self) -> Vec<SampleVector> {
        self.samples
    }
}

impl DataSink for SampleCollector {
    fn put_data(&mut self, sample: &SampleVector) -> Result<(), PipelineError> {
        self.samples.push(sample.clone());
        Ok(())
    }
}

/// Moves a sample from a source into a sink every `interval` steps.
pub struct DataPump<S, K> {
    source: S,
    sink: K,
    interval: u64,
    pumped: usize,
}

impl<S: DataSource, K: DataSink> DataPump<S, K> {
    /// An `interval` of zero is treated as one.
    pub fn new(source: S, sink: K, interval: u64) -> Self {
        Self {
            source,
            sink,
            interval: interval.max(1),
            pumped: 0,
        }
    }

    /// A pump that fires every `config.sampling_interval` steps.
    pub fn from_config(source: S, sink: K, config: &PipelineConfig) -> Self {
        Self::new(source, sink, config.sampling_interval)
    }

    /// Called once per simulation step; returns whether a sample was moved.
    pub fn on_step(&mut self, step: u64) -> Result<bool, PipelineError> {
        if step % self.interval != 0 {
            return Ok(false);
        }
        let sample = self.source.get_data(step)?;
        self.sink.put_data(sample)?;
        self.pumped += 1;
        trace!(step, pumped = self.pumped, "Sample pumped");
        Ok(true)
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn pumped(&self) -> usize {
        self.pumped
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_parts(self) -> (S, K) {
        (self.source, self.sink)
    }
}

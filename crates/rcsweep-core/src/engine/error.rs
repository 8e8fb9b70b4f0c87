use thiserror::Error;

use super::config::ConfigError;
use super::traversal::ReplayError;
use crate::core::cutoffs::CutoffError;
use crate::core::sample::{LayoutError, SampleLayout};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{component} must be configured before use: missing {missing}")]
    NotConfigured {
        component: &'static str,
        missing: &'static str,
    },

    #[error("Invalid pipeline configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Invalid cutoff set: {source}")]
    Cutoff {
        #[from]
        source: CutoffError,
    },

    #[error("Malformed sample: {source}")]
    Layout {
        #[from]
        source: LayoutError,
    },

    #[error("Stage '{stage}' expected a {expected} sample, got {found}")]
    LayoutMismatch {
        stage: &'static str,
        expected: SampleLayout,
        found: SampleLayout,
    },

    #[error(
        "Numerical corruption in stage '{stage}': block {block}, field {field} is {value}; the pass is invalid"
    )]
    NumericalCorruption {
        stage: &'static str,
        block: usize,
        field: usize,
        value: f64,
    },

    #[error("Stage '{stage}' needs a trailing weight field, got a {found} layout")]
    MissingWeight {
        stage: &'static str,
        found: SampleLayout,
    },

    #[error("Cannot merge accumulators with different {what}")]
    IncompatibleAccumulators { what: &'static str },

    #[error("Reference cutoff {index} is out of range for {blocks} cutoffs")]
    InvalidReference { index: usize, blocks: usize },

    #[error("Need at least {needed} blocks of data, got {found}")]
    InsufficientData { needed: usize, found: usize },

    #[error("Pair replay failed: {source}")]
    Replay {
        #[from]
        source: ReplayError,
    },
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::NumericalCorruption { .. })
    }
}

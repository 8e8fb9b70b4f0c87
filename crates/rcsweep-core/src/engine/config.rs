use crate::core::cutoffs::{CutoffError, CutoffSet, DEFAULT_LADDER_MAX_EXTRA};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Growth factor of the geometric cutoff ladder when none is given.
pub const DEFAULT_LADDER_FACTOR: f64 = 1.2;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("Invalid cutoffs: {0}")]
    Cutoff(#[from] CutoffError),
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid config file '{path}': {source}")]
    Invalid { path: String, source: ConfigError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub cutoffs: CutoffSet,
    pub temperature: f64,
    pub sampling_interval: u64,
    pub reference_cutoff: Option<usize>,
    pub energy_offsets: Option<Vec<f64>>,
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        debug!("Loading pipeline configuration from file: {:?}", path);
        let path_str = path.to_string_lossy().to_string();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigLoadError::Io {
            path: path_str.clone(),
            source: e,
        })?;
        Self::parse(&content, path_str)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigLoadError> {
        Self::parse(content, "<inline>".to_string())
    }

    fn parse(content: &str, path: String) -> Result<Self, ConfigLoadError> {
        let file: FilePipelineConfig = match toml::from_str(content) {
            Ok(file) => file,
            Err(source) => return Err(ConfigLoadError::Toml { path, source }),
        };
        file.into_config()
            .map_err(|source| ConfigLoadError::Invalid { path, source })
    }
}

#[derive(Default)]
pub struct PipelineConfigBuilder {
    cutoffs: Option<CutoffSet>,
    temperature: Option<f64>,
    sampling_interval: Option<u64>,
    reference_cutoff: Option<usize>,
    energy_offsets: Option<Vec<f64>>,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cutoffs(mut self, cutoffs: CutoffSet) -> Self {
        self.cutoffs = Some(cutoffs);
        self
    }
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
    pub fn sampling_interval(mut self, interval: u64) -> Self {
        self.sampling_interval = Some(interval);
        self
    }
    pub fn reference_cutoff(mut self, index: usize) -> Self {
        self.reference_cutoff = Some(index);
        self
    }
    pub fn energy_offsets(mut self, offsets: Vec<f64>) -> Self {
        self.energy_offsets = Some(offsets);
        self
    }

    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let cutoffs = self
            .cutoffs
            .ok_or(ConfigError::MissingParameter("cutoffs"))?;
        let temperature = self
            .temperature
            .ok_or(ConfigError::MissingParameter("temperature"))?;
        let sampling_interval = self.sampling_interval.unwrap_or(1);

        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "temperature",
                reason: format!("must be finite and positive, got {temperature}"),
            });
        }
        if sampling_interval == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "sampling_interval",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(index) = self.reference_cutoff {
            if index >= cutoffs.len() {
                return Err(ConfigError::InvalidParameter {
                    name: "reference_cutoff",
                    reason: format!("index {index} is out of range for {} cutoffs", cutoffs.len()),
                });
            }
        }
        if let Some(offsets) = &self.energy_offsets {
            if offsets.len() != cutoffs.len() {
                return Err(ConfigError::InvalidParameter {
                    name: "energy_offsets",
                    reason: format!("expected {} offsets, got {}", cutoffs.len(), offsets.len()),
                });
            }
        }

        Ok(PipelineConfig {
            cutoffs,
            temperature,
            sampling_interval,
            reference_cutoff: self.reference_cutoff,
            energy_offsets: self.energy_offsets,
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileRadii {
    radii: Vec<f64>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileLadder {
    short: f64,
    max: f64,
    factor: Option<f64>,
    #[serde(rename = "max-count")]
    max_count: Option<usize>,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum FileCutoffs {
    Explicit(FileRadii),
    Ladder(FileLadder),
}

impl FileCutoffs {
    fn into_cutoffs(self) -> Result<CutoffSet, CutoffError> {
        match self {
            FileCutoffs::Explicit(FileRadii { radii }) => CutoffSet::new(radii),
            FileCutoffs::Ladder(ladder) => CutoffSet::geometric(
                ladder.short,
                ladder.max,
                ladder.factor.unwrap_or(DEFAULT_LADDER_FACTOR),
                ladder.max_count.unwrap_or(DEFAULT_LADDER_MAX_EXTRA),
            ),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FilePipelineConfig {
    cutoffs: Option<FileCutoffs>,
    temperature: Option<f64>,
    #[serde(rename = "sampling-interval")]
    sampling_interval: Option<u64>,
    #[serde(rename = "reference-cutoff")]
    reference_cutoff: Option<usize>,
    #[serde(rename = "energy-offsets")]
    energy_offsets: Option<Vec<f64>>,
}

impl FilePipelineConfig {
    fn into_config(self) -> Result<PipelineConfig, ConfigError> {
        let mut builder = PipelineConfigBuilder::new();
        if let Some(cutoffs) = self.cutoffs {
            builder = builder.cutoffs(cutoffs.into_cutoffs()?);
        }
        if let Some(temperature) = self.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(interval) = self.sampling_interval {
            builder = builder.sampling_interval(interval);
        }
        if let Some(index) = self.reference_cutoff {
            builder = builder.reference_cutoff(index);
        }
        if let Some(offsets) = self.energy_offsets {
            builder = builder.energy_offsets(offsets);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cutoffs() -> CutoffSet {
        CutoffSet::new(vec![2.5, 3.0, 3.6]).unwrap()
    }

    #[test]
    fn builder_reports_first_missing_parameter() {
        assert_eq!(
            PipelineConfig::builder().temperature(1.0).build(),
            Err(ConfigError::MissingParameter("cutoffs"))
        );
        assert_eq!(
            PipelineConfig::builder().cutoffs(cutoffs()).build(),
            Err(ConfigError::MissingParameter("temperature"))
        );
    }

    #[test]
    fn builder_defaults_sampling_interval_to_one() {
        let config = PipelineConfig::builder()
            .cutoffs(cutoffs())
            .temperature(1.1)
            .build()
            .unwrap();
        assert_eq!(config.sampling_interval, 1);
        assert_eq!(config.reference_cutoff, None);
        assert_eq!(config.energy_offsets, None);
    }

    #[test]
    fn builder_rejects_non_positive_temperature() {
        let result = PipelineConfig::builder()
            .cutoffs(cutoffs())
            .temperature(0.0)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter { name: "temperature", .. })
        ));
    }

    #[test]
    fn builder_rejects_reference_outside_ladder() {
        let result = PipelineConfig::builder()
            .cutoffs(cutoffs())
            .temperature(1.0)
            .reference_cutoff(3)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter { name: "reference_cutoff", .. })
        ));
    }

    #[test]
    fn builder_rejects_offsets_of_wrong_length() {
        let result = PipelineConfig::builder()
            .cutoffs(cutoffs())
            .temperature(1.0)
            .energy_offsets(vec![0.0; 2])
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter { name: "energy_offsets", .. })
        ));
    }

    #[test]
    fn toml_with_explicit_radii_parses() {
        let config = PipelineConfig::from_toml_str(
            r#"
            temperature = 1.25
            sampling-interval = 10
            reference-cutoff = 0
            energy-offsets = [0.0, -1.5]

            [cutoffs]
            radii = [2.5, 3.0]
            "#,
        )
        .unwrap();
        assert_eq!(config.cutoffs.radii(), &[2.5, 3.0]);
        assert_eq!(config.temperature, 1.25);
        assert_eq!(config.sampling_interval, 10);
        assert_eq!(config.reference_cutoff, Some(0));
        assert_eq!(config.energy_offsets, Some(vec![0.0, -1.5]));
    }

    #[test]
    fn toml_with_geometric_ladder_uses_default_factor() {
        let config = PipelineConfig::from_toml_str(
            r#"
            temperature = 2.0

            [cutoffs]
            short = 2.5
            max = 6.0
            "#,
        )
        .unwrap();
        assert_eq!(config.cutoffs.len(), 5);
        assert!((config.cutoffs.radius(1) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn toml_ladder_respects_max_count() {
        let config = PipelineConfig::from_toml_str(
            r#"
            temperature = 2.0
            cutoffs = { short = 2.5, max = 60.0, factor = 1.5, max-count = 2 }
            "#,
        )
        .unwrap();
        assert_eq!(config.cutoffs.radii(), &[2.5, 3.75, 5.625]);
    }

    #[test]
    fn toml_ladder_without_max_count_is_capped() {
        let config = PipelineConfig::from_toml_str(
            r#"
            temperature = 2.0
            cutoffs = { short = 1.0, max = 1e6, factor = 1.000000000001 }
            "#,
        )
        .unwrap();
        assert_eq!(config.cutoffs.len(), 1 + DEFAULT_LADDER_MAX_EXTRA);
    }

    #[test]
    fn toml_ladder_with_huge_max_count_is_invalid() {
        let result = PipelineConfig::from_toml_str(
            r#"
            temperature = 2.0
            cutoffs = { short = 1.0, max = 1e6, factor = 1.000000000001, max-count = 1000000000 }
            "#,
        );
        assert!(matches!(
            result,
            Err(ConfigLoadError::Invalid {
                source: ConfigError::Cutoff(CutoffError::InvalidLadder(_)),
                ..
            })
        ));
    }

    #[test]
    fn toml_rejects_unknown_fields() {
        let result = PipelineConfig::from_toml_str("temperature = 1.0\nthermostat = \"andersen\"\n");
        assert!(matches!(result, Err(ConfigLoadError::Toml { .. })));
    }

    #[test]
    fn toml_with_unsorted_radii_is_invalid() {
        let result = PipelineConfig::from_toml_str(
            "temperature = 1.0\n[cutoffs]\nradii = [3.0, 2.0]\n",
        );
        assert!(matches!(
            result,
            Err(ConfigLoadError::Invalid {
                source: ConfigError::Cutoff(CutoffError::NotIncreasing { .. }),
                ..
            })
        ));
    }

    #[test]
    fn load_reads_config_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "temperature = 0.9\n[cutoffs]\nradii = [1.0]").unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.temperature, 0.9);
        assert_eq!(config.cutoffs.len(), 1);
    }

    #[test]
    fn load_fails_for_missing_file() {
        let result = PipelineConfig::load(Path::new("/nonexistent/pipeline.toml"));
        assert!(matches!(result, Err(ConfigLoadError::Io { .. })));
    }
}

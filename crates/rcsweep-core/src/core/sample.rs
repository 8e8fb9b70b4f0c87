use std::fmt;
use thiserror::Error;

/// Named positions inside one per-cutoff block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Energy,
    Pressure,
    DaDy,
    DaDv2,
    Weight,
}

impl Field {
    /// The fields a meter emits, in block order.
    pub const MEASURED: [Field; 4] = [Field::Energy, Field::Pressure, Field::DaDy, Field::DaDv2];

    pub const fn index(self) -> usize {
        match self {
            Field::Energy => 0,
            Field::Pressure => 1,
            Field::DaDy => 2,
            Field::DaDv2 => 3,
            Field::Weight => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Field::Energy => "u",
            Field::Pressure => "p",
            Field::DaDy => "dA/dy",
            Field::DaDv2 => "dA/dv2",
            Field::Weight => "weight",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Width of a raw meter block.
pub const METER_WIDTH: usize = Field::MEASURED.len();

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Sample holds {found} values but a {blocks}x{width} layout needs {expected}")]
pub struct LayoutError {
    pub blocks: usize,
    pub width: usize,
    pub expected: usize,
    pub found: usize,
}

/// Shape of a flat sample: `blocks` per-cutoff blocks of `width` fields each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleLayout {
    pub blocks: usize,
    pub width: usize,
}

impl SampleLayout {
    pub const fn new(blocks: usize, width: usize) -> Self {
        Self { blocks, width }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.blocks * self.width
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The same blocks with a trailing weight field appended.
    pub const fn with_weight(&self) -> Self {
        Self::new(self.blocks, self.width + 1)
    }

    /// The same blocks with the trailing weight field consumed.
    pub const fn without_weight(&self) -> Self {
        Self::new(self.blocks, self.width.saturating_sub(1))
    }

    #[inline]
    pub const fn offset(&self, block: usize, field: usize) -> usize {
        block * self.width + field
    }
}

impl fmt::Display for SampleLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.blocks, self.width)
    }
}

/// One flat per-cutoff sample as it travels down the pipeline.
///
/// Block `i` occupies `[i·width, (i+1)·width)`. The producer stamps the
/// simulation step and the particle count the sample was taken at, so
/// downstream stages never have to reach back into the simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleVector {
    layout: SampleLayout,
    values: Vec<f64>,
    pub step: u64,
    pub num_atoms: usize,
}

impl SampleVector {
    pub fn zeros(layout: SampleLayout) -> Self {
        Self {
            layout,
            values: vec![0.0; layout.len()],
            step: 0,
            num_atoms: 0,
        }
    }

    pub fn from_values(layout: SampleLayout, values: Vec<f64>) -> Result<Self, LayoutError> {
        if values.len() != layout.len() {
            return Err(LayoutError {
                blocks: layout.blocks,
                width: layout.width,
                expected: layout.len(),
                found: values.len(),
            });
        }
        Ok(Self {
            layout,
            values,
            step: 0,
            num_atoms: 0,
        })
    }

    pub fn stamped(mut self, step: u64, num_atoms: usize) -> Self {
        self.step = step;
        self.num_atoms = num_atoms;
        self
    }

    #[inline]
    pub fn layout(&self) -> SampleLayout {
        self.layout
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    pub fn block(&self, block: usize) -> &[f64] {
        let start = self.layout.offset(block, 0);
        &self.values[start..start + self.layout.width]
    }

    pub fn block_mut(&mut self, block: usize) -> &mut [f64] {
        let start = self.layout.offset(block, 0);
        let width = self.layout.width;
        &mut self.values[start..start + width]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.layout.width.max(1))
    }

    #[inline]
    pub fn get(&self, block: usize, field: usize) -> f64 {
        self.values[self.layout.offset(block, field)]
    }

    #[inline]
    pub fn set(&mut self, block: usize, field: usize, value: f64) {
        let offset = self.layout.offset(block, field);
        self.values[offset] = value;
    }

    /// Location and value of the first NaN or infinity, scanning block by block.
    pub fn first_non_finite(&self) -> Option<(usize, usize, f64)> {
        let width = self.layout.width.max(1);
        self.values
            .iter()
            .position(|v| !v.is_finite())
            .map(|i| (i / width, i % width, self.values[i]))
    }
}

use super::geometry::{Boundary, ImageShells};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CutoffError {
    #[error("A cutoff set needs at least one radius")]
    Empty,
    #[error("Cutoff {index} must be finite and positive, got {radius}")]
    NonPositive { index: usize, radius: f64 },
    #[error("Cutoffs must be strictly increasing: cutoff {index} ({radius}) follows {previous}")]
    NotIncreasing {
        index: usize,
        previous: f64,
        radius: f64,
    },
    #[error(
        "Largest cutoff {radius} reaches half the box edge along axis {axis} ({half_edge}); use a lattice sum instead"
    )]
    ExceedsHalfBox {
        radius: f64,
        axis: usize,
        half_edge: f64,
    },
    #[error("Invalid geometric cutoff ladder: {0}")]
    InvalidLadder(String),
}

/// Extra radii a geometric ladder holds when no cap is given.
pub const DEFAULT_LADDER_MAX_EXTRA: usize = 100;

/// Hard ceiling on the extra radii of any geometric ladder.
pub const LADDER_EXTRA_LIMIT: usize = 10_000;

#[derive(Debug, PartialEq)]
struct Radii {
    radii: Vec<f64>,
    squared: Vec<f64>,
}

/// Ordered, strictly increasing truncation radii with cached squares.
///
/// Cloning is cheap and every clone views the same immutable radii, so the
/// stages of one pipeline can hold their own handle and still agree on `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct CutoffSet {
    inner: Arc<Radii>,
}

impl CutoffSet {
    pub fn new(radii: Vec<f64>) -> Result<Self, CutoffError> {
        if radii.is_empty() {
            return Err(CutoffError::Empty);
        }
        for (index, &radius) in radii.iter().enumerate() {
            if !radius.is_finite() || radius <= 0.0 {
                return Err(CutoffError::NonPositive { index, radius });
            }
            if index > 0 && radius <= radii[index - 1] {
                return Err(CutoffError::NotIncreasing {
                    index,
                    previous: radii[index - 1],
                    radius,
                });
            }
        }
        let squared = radii.iter().map(|r| r * r).collect();
        Ok(Self {
            inner: Arc::new(Radii { radii, squared }),
        })
    }

    /// Builds the ladder `short, short·factor, short·factor², …` up to `max`.
    ///
    /// The ladder holds `1 + floor(ln(max/short)/ln(factor))` radii, capped at
    /// `1 + max_extra`. A `max_extra` above [`LADDER_EXTRA_LIMIT`] is rejected.
    pub fn geometric(
        short: f64,
        max: f64,
        factor: f64,
        max_extra: usize,
    ) -> Result<Self, CutoffError> {
        if !(short.is_finite() && short > 0.0) {
            return Err(CutoffError::InvalidLadder(format!(
                "shortest radius must be positive, got {short}"
            )));
        }
        if !(factor.is_finite() && factor > 1.0) {
            return Err(CutoffError::InvalidLadder(format!(
                "growth factor must exceed 1, got {factor}"
            )));
        }
        if !(max.is_finite() && max >= short) {
            return Err(CutoffError::InvalidLadder(format!(
                "longest radius {max} is shorter than {short}"
            )));
        }

        if max_extra > LADDER_EXTRA_LIMIT {
            return Err(CutoffError::InvalidLadder(format!(
                "at most {LADDER_EXTRA_LIMIT} extra radii are allowed, got a cap of {max_extra}"
            )));
        }

        let steps = ((max / short).ln() / factor.ln()).floor();
        if !steps.is_finite() {
            return Err(CutoffError::InvalidLadder(format!(
                "cannot count radii between {short} and {max} with factor {factor}"
            )));
        }
        let count = 1 + (steps as usize).min(max_extra);

        let mut radii = Vec::with_capacity(count);
        let mut radius = short;
        for _ in 0..count {
            radii.push(radius);
            radius *= factor;
        }
        Self::new(radii)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.radii.len()
    }

    /// Always `false`; construction rejects empty sets.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.radii.is_empty()
    }

    #[inline]
    pub fn radius(&self, index: usize) -> f64 {
        self.inner.radii[index]
    }

    #[inline]
    pub fn radius_squared(&self, index: usize) -> f64 {
        self.inner.squared[index]
    }

    pub fn radii(&self) -> &[f64] {
        &self.inner.radii
    }

    pub fn radii_squared(&self) -> &[f64] {
        &self.inner.squared
    }

    #[inline]
    pub fn max(&self) -> f64 {
        self.inner.radii[self.len() - 1]
    }

    #[inline]
    pub fn max_squared(&self) -> f64 {
        self.inner.squared[self.len() - 1]
    }

    /// Index of the smallest cutoff whose bucket receives a pair at squared
    /// separation `r2`, or `None` when the pair lies beyond every cutoff.
    pub fn first_enclosing(&self, r2: f64) -> Option<usize> {
        if r2 > self.max_squared() {
            return None;
        }
        Some(self.inner.squared.partition_point(|&rc2| rc2 < r2))
    }

    pub fn image_shells(&self, boundary: &dyn Boundary) -> ImageShells {
        ImageShells::for_range(self.max(), &boundary.edge_lengths())
    }

    /// Minimum-image evaluation only sees every pair once when the largest
    /// radius stays below half of every edge.
    pub fn check_minimum_image(&self, boundary: &dyn Boundary) -> Result<(), CutoffError> {
        let edges = boundary.edge_lengths();
        for axis in 0..boundary.dimension() {
            let half_edge = 0.5 * edges[axis];
            if self.max() >= half_edge {
                return Err(CutoffError::ExceedsHalfBox {
                    radius: self.max(),
                    axis,
                    half_edge,
                });
            }
        }
        Ok(())
    }
}

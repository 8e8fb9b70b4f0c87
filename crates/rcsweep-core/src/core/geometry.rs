use nalgebra::Vector3;
use thiserror::Error;

/// Offset applied before rounding the per-axis shell count up, so that a
/// cutoff sitting exactly on a half-integer number of edges does not pull in
/// an extra shell of images through rounding noise.
const SHELL_ROUNDING_OFFSET: f64 = 0.49999;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("Box edge along axis {axis} must be finite and positive, got {length}")]
    InvalidEdge { axis: usize, length: f64 },
}

/// Periodic box geometry as seen by the truncation pipeline.
pub trait Boundary {
    fn edge_lengths(&self) -> Vector3<f64>;

    /// Wraps `dr` onto its nearest periodic image in place.
    fn nearest_image(&self, dr: &mut Vector3<f64>);

    fn volume(&self) -> f64 {
        let edges = self.edge_lengths();
        edges.x * edges.y * edges.z
    }

    fn dimension(&self) -> usize {
        3
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrthorhombicBoundary {
    edges: Vector3<f64>,
}

impl OrthorhombicBoundary {
    pub fn new(edges: Vector3<f64>) -> Result<Self, GeometryError> {
        for (axis, &length) in edges.iter().enumerate() {
            if !length.is_finite() || length <= 0.0 {
                return Err(GeometryError::InvalidEdge { axis, length });
            }
        }
        Ok(Self { edges })
    }

    pub fn cubic(edge: f64) -> Result<Self, GeometryError> {
        Self::new(Vector3::new(edge, edge, edge))
    }
}

impl Boundary for OrthorhombicBoundary {
    fn edge_lengths(&self) -> Vector3<f64> {
        self.edges
    }

    fn nearest_image(&self, dr: &mut Vector3<f64>) {
        for axis in 0..3 {
            let edge = self.edges[axis];
            dr[axis] -= edge * (dr[axis] / edge).round();
        }
    }
}

/// Maximum periodic translation index per axis needed to reach every image
/// within a given range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShells {
    extent: [i32; 3],
}

impl ImageShells {
    pub fn for_range(range: f64, edges: &Vector3<f64>) -> Self {
        let mut extent = [0; 3];
        for (axis, slot) in extent.iter_mut().enumerate() {
            *slot = (range / edges[axis] - SHELL_ROUNDING_OFFSET).ceil().max(0.0) as i32;
        }
        Self { extent }
    }

    #[inline]
    pub fn extent(&self, axis: usize) -> i32 {
        self.extent[axis]
    }

    /// Number of image translations visited, zero shift included.
    pub fn image_count(&self) -> usize {
        self.extent
            .iter()
            .map(|&n| (2 * n + 1) as usize)
            .product()
    }
}

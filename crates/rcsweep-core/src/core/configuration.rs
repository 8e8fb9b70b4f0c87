use super::geometry::{Boundary, OrthorhombicBoundary};
use nalgebra::{Point3, Vector3};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("Expected {expected} lattice sites (one per atom), got {found}")]
    LatticeSiteCount { expected: usize, found: usize },
    #[error("Atom index {index} is out of range for {count} atoms")]
    AtomOutOfRange { index: usize, count: usize },
}

/// What the meter needs to know about the simulated system.
pub trait SimulationBox {
    fn num_atoms(&self) -> usize;

    fn boundary(&self) -> &dyn Boundary;

    fn volume(&self) -> f64 {
        self.boundary().volume()
    }

    fn density(&self) -> f64 {
        self.num_atoms() as f64 / self.volume()
    }
}

/// Atom positions in a periodic box, optionally tied to reference lattice sites.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    boundary: OrthorhombicBoundary,
    positions: Vec<Point3<f64>>,
    lattice_sites: Option<Vec<Point3<f64>>>,
}

impl Configuration {
    pub fn new(boundary: OrthorhombicBoundary, positions: Vec<Point3<f64>>) -> Self {
        Self {
            boundary,
            positions,
            lattice_sites: None,
        }
    }

    /// A simple-cubic crystal of `cells³` atoms sitting exactly on their sites.
    pub fn simple_cubic(cells: usize, spacing: f64) -> Result<Self, super::geometry::GeometryError> {
        let boundary = OrthorhombicBoundary::cubic(cells as f64 * spacing)?;
        let mut sites = Vec::with_capacity(cells * cells * cells);
        for ix in 0..cells {
            for iy in 0..cells {
                for iz in 0..cells {
                    sites.push(Point3::new(
                        (ix as f64 + 0.5) * spacing,
                        (iy as f64 + 0.5) * spacing,
                        (iz as f64 + 0.5) * spacing,
                    ));
                }
            }
        }
        Ok(Self {
            boundary,
            positions: sites.clone(),
            lattice_sites: Some(sites),
        })
    }

    pub fn with_lattice_sites(mut self, sites: Vec<Point3<f64>>) -> Result<Self, ConfigurationError> {
        if sites.len() != self.positions.len() {
            return Err(ConfigurationError::LatticeSiteCount {
                expected: self.positions.len(),
                found: sites.len(),
            });
        }
        self.lattice_sites = Some(sites);
        Ok(self)
    }

    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    pub fn lattice_sites(&self) -> Option<&[Point3<f64>]> {
        self.lattice_sites.as_deref()
    }

    pub fn orthorhombic_boundary(&self) -> &OrthorhombicBoundary {
        &self.boundary
    }

    pub fn set_boundary(&mut self, boundary: OrthorhombicBoundary) {
        self.boundary = boundary;
    }

    pub fn set_position(&mut self, index: usize, position: Point3<f64>) -> Result<(), ConfigurationError> {
        let count = self.positions.len();
        let slot = self
            .positions
            .get_mut(index)
            .ok_or(ConfigurationError::AtomOutOfRange { index, count })?;
        *slot = position;
        Ok(())
    }

    /// Minimum-image separation `r_i − r_j`.
    pub fn separation(&self, i: usize, j: usize) -> Vector3<f64> {
        let mut dr = self.positions[i] - self.positions[j];
        self.boundary.nearest_image(&mut dr);
        dr
    }

    /// Minimum-image separation of the lattice sites of `i` and `j`.
    pub fn lattice_separation(&self, i: usize, j: usize) -> Option<Vector3<f64>> {
        self.lattice_sites.as_ref().map(|sites| {
            let mut dr = sites[i] - sites[j];
            self.boundary.nearest_image(&mut dr);
            dr
        })
    }

    /// Separation that keeps the atoms' own displacements from their sites
    /// intact: the imaged lattice separation plus `(r_i − R_i) − (r_j − R_j)`.
    pub fn lattice_corrected_separation(&self, i: usize, j: usize) -> Option<Vector3<f64>> {
        let sites = self.lattice_sites.as_ref()?;
        let lattice = self.lattice_separation(i, j)?;
        let mut di = self.positions[i] - sites[i];
        let mut dj = self.positions[j] - sites[j];
        self.boundary.nearest_image(&mut di);
        self.boundary.nearest_image(&mut dj);
        Some(lattice + di - dj)
    }
}

impl SimulationBox for Configuration {
    fn num_atoms(&self) -> usize {
        self.positions.len()
    }

    fn boundary(&self) -> &dyn Boundary {
        &self.boundary
    }
}

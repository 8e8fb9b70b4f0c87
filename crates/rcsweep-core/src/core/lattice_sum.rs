//! Pair sums over periodic images, evaluated for every cutoff of a ladder in a
//! single pass over the image shells.

use super::bucket::PairSumBucket;
use super::cutoffs::CutoffSet;
use super::geometry::ImageShells;
use super::potentials::PairPotential;
use nalgebra::Vector3;

/// An ordered atom pair handed over by the pair traversal.
///
/// `separation` is the base separation `r_first − r_second`. When the system
/// carries a reference lattice, `lattice_separation` is the separation of the
/// two lattice sites the atoms belong to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtomPair {
    pub first: usize,
    pub second: usize,
    pub separation: Vector3<f64>,
    pub lattice_separation: Option<Vector3<f64>>,
}

impl AtomPair {
    pub fn new(first: usize, second: usize, separation: Vector3<f64>) -> Self {
        Self {
            first,
            second,
            separation,
            lattice_separation: None,
        }
    }

    /// An atom paired with its own periodic images.
    pub fn self_pair(atom: usize) -> Self {
        Self::new(atom, atom, Vector3::zeros())
    }

    pub fn with_lattice_separation(mut self, lattice_separation: Vector3<f64>) -> Self {
        self.lattice_separation = Some(lattice_separation);
        self
    }

    #[inline]
    pub fn is_self_pair(&self) -> bool {
        self.first == self.second
    }
}

/// Cartesian axis of a diagonal pressure-tensor component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Axis {
    #[default]
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// A pair potential that produces its own per-cutoff sums for a pair.
///
/// The accumulator talks to periodic lattice sums only through this trait.
pub trait CutoffAwarePairPotential {
    /// Called by the traversal once per box geometry, before any pair.
    fn prepare(&mut self, edges: &Vector3<f64>, cutoffs: &CutoffSet);

    /// Overwrites `out[i]` with the contribution of `pair` inside cutoff `i`.
    fn sum_by_cutoff(
        &self,
        pair: &AtomPair,
        edges: &Vector3<f64>,
        cutoffs: &CutoffSet,
        out: &mut [PairSumBucket],
    );
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ShellCache {
    edges: Vector3<f64>,
    range: f64,
    shells: ImageShells,
}

/// Lattice sum of a plain pair potential over all periodic images.
///
/// Pairs with a lattice separation are selected by their lattice-referenced
/// distance and additionally fill the lattice gradient, lattice cross and
/// pressure-tensor channels:
///
/// - `lattice_gradient += (du/r²)·(r·Δ)`
/// - `lattice_cross += (du/r²)·(r_lat·Δ)`
/// - `pressure_tensor += (du/r²)·r_a²` along `tensor_axis`
///
/// where `r` is the imaged separation, `r_lat` the imaged lattice separation
/// and `Δ = r − r_lat` the relative displacement of the two atoms from their
/// sites.
#[derive(Debug, Clone)]
pub struct LatticeSum<P> {
    potential: P,
    tensor_axis: Axis,
    cache: Option<ShellCache>,
}

impl<P: PairPotential> LatticeSum<P> {
    pub fn new(potential: P) -> Self {
        Self {
            potential,
            tensor_axis: Axis::X,
            cache: None,
        }
    }

    /// Selects the diagonal pressure-tensor component.
    pub fn with_tensor_axis(mut self, axis: Axis) -> Self {
        self.tensor_axis = axis;
        self
    }

    pub fn tensor_axis(&self) -> Axis {
        self.tensor_axis
    }

    pub fn potential(&self) -> &P {
        &self.potential
    }

    fn shells_for(&self, edges: &Vector3<f64>, range: f64) -> ImageShells {
        match self.cache {
            Some(cache) if cache.edges == *edges && cache.range == range => cache.shells,
            _ => ImageShells::for_range(range, edges),
        }
    }

    #[inline]
    fn contribution(&self, r: &Vector3<f64>, r2: f64, delta: Option<&Vector3<f64>>) -> PairSumBucket {
        let u = self.potential.u(r2);
        let du = self.potential.du(r2);
        match delta {
            None => PairSumBucket::new(u, du),
            Some(delta) => {
                let lattice = r - delta;
                let f = du / r2;
                PairSumBucket {
                    energy: u,
                    virial: du,
                    lattice_gradient: f * r.dot(delta),
                    lattice_cross: f * lattice.dot(delta),
                    pressure_tensor: f * r[self.tensor_axis.index()] * r[self.tensor_axis.index()],
                }
            }
        }
    }
}

impl<P: PairPotential> CutoffAwarePairPotential for LatticeSum<P> {
    fn prepare(&mut self, edges: &Vector3<f64>, cutoffs: &CutoffSet) {
        let range = cutoffs.max();
        self.cache = Some(ShellCache {
            edges: *edges,
            range,
            shells: ImageShells::for_range(range, edges),
        });
    }

    fn sum_by_cutoff(
        &self,
        pair: &AtomPair,
        edges: &Vector3<f64>,
        cutoffs: &CutoffSet,
        out: &mut [PairSumBucket],
    ) {
        debug_assert_eq!(out.len(), cutoffs.len());
        out.iter_mut().for_each(PairSumBucket::clear);

        let shells = self.shells_for(edges, cutoffs.max());
        let rc2_max = cutoffs.max_squared();
        let self_pair = pair.is_self_pair();
        let delta = pair.lattice_separation.map(|lattice| pair.separation - lattice);
        let reference = pair.lattice_separation.unwrap_or(pair.separation);

        let (nx_max, ny_max, nz_max) = (shells.extent(0), shells.extent(1), shells.extent(2));
        let mut shift = Vector3::zeros();
        for nx in -nx_max..=nx_max {
            shift.x = nx as f64 * edges.x;
            for ny in -ny_max..=ny_max {
                shift.y = ny as f64 * edges.y;
                for nz in -nz_max..=nz_max {
                    if self_pair && nx == 0 && ny == 0 && nz == 0 {
                        continue;
                    }
                    shift.z = nz as f64 * edges.z;

                    let reference_r2 = (reference + shift).norm_squared();
                    if reference_r2 > rc2_max {
                        continue;
                    }
                    let r = pair.separation + shift;
                    let mut term = self.contribution(&r, r.norm_squared(), delta.as_ref());
                    if self_pair {
                        term = term * 0.5;
                    }

                    for i in (0..cutoffs.len()).rev() {
                        if reference_r2 > cutoffs.radius_squared(i) {
                            break;
                        }
                        out[i] += term;
                    }
                }
            }
        }
    }
}

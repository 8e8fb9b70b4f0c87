use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul};

/// Per-cutoff running sums over pair contributions.
///
/// Plain evaluations only touch `energy` and `virial`; the remaining channels
/// are filled by the lattice-referenced lattice sum.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PairSumBucket {
    pub energy: f64,
    pub virial: f64,
    pub lattice_gradient: f64,
    pub lattice_cross: f64,
    pub pressure_tensor: f64,
}

impl PairSumBucket {
    pub fn new(energy: f64, virial: f64) -> Self {
        Self {
            energy,
            virial,
            ..Self::default()
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_finite(&self) -> bool {
        self.energy.is_finite()
            && self.virial.is_finite()
            && self.lattice_gradient.is_finite()
            && self.lattice_cross.is_finite()
            && self.pressure_tensor.is_finite()
    }
}

impl Add for PairSumBucket {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            energy: self.energy + rhs.energy,
            virial: self.virial + rhs.virial,
            lattice_gradient: self.lattice_gradient + rhs.lattice_gradient,
            lattice_cross: self.lattice_cross + rhs.lattice_cross,
            pressure_tensor: self.pressure_tensor + rhs.pressure_tensor,
        }
    }
}

impl AddAssign for PairSumBucket {
    fn add_assign(&mut self, rhs: Self) {
        self.energy += rhs.energy;
        self.virial += rhs.virial;
        self.lattice_gradient += rhs.lattice_gradient;
        self.lattice_cross += rhs.lattice_cross;
        self.pressure_tensor += rhs.pressure_tensor;
    }
}

impl Mul<f64> for PairSumBucket {
    type Output = Self;

    fn mul(self, factor: f64) -> Self::Output {
        Self {
            energy: self.energy * factor,
            virial: self.virial * factor,
            lattice_gradient: self.lattice_gradient * factor,
            lattice_cross: self.lattice_cross * factor,
            pressure_tensor: self.pressure_tensor * factor,
        }
    }
}

impl Sum for PairSumBucket {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, bucket| acc + bucket)
    }
}

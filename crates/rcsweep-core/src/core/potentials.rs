use std::f64::consts::PI;

/// Radial integrals of a pair potential beyond a truncation radius `rc`,
/// including the 4π solid-angle factor:
/// `energy = 4π∫ r² u(r) dr` and `virial = 4π∫ r² (r du/dr) dr`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TailIntegrals {
    pub energy: f64,
    pub virial: f64,
}

/// A spherically symmetric pair potential expressed in the squared separation.
pub trait PairPotential {
    fn u(&self, r2: f64) -> f64;

    /// `r·du/dr`, the pair virial.
    fn du(&self, r2: f64) -> f64;

    /// Tail integrals beyond `rc`; `None` when they diverge or have no closed form.
    fn tail_integrals(&self, _rc: f64) -> Option<TailIntegrals> {
        None
    }
}

impl<P: PairPotential + ?Sized> PairPotential for &P {
    fn u(&self, r2: f64) -> f64 {
        (**self).u(r2)
    }
    fn du(&self, r2: f64) -> f64 {
        (**self).du(r2)
    }
    fn tail_integrals(&self, rc: f64) -> Option<TailIntegrals> {
        (**self).tail_integrals(rc)
    }
}

impl<P: PairPotential + ?Sized> PairPotential for Box<P> {
    fn u(&self, r2: f64) -> f64 {
        (**self).u(r2)
    }
    fn du(&self, r2: f64) -> f64 {
        (**self).du(r2)
    }
    fn tail_integrals(&self, rc: f64) -> Option<TailIntegrals> {
        (**self).tail_integrals(rc)
    }
}

#[inline]
fn inverse_power(r2: f64, sigma: f64, exponent: u32) -> f64 {
    let s2 = sigma * sigma / r2;
    if exponent % 2 == 0 {
        s2.powi((exponent / 2) as i32)
    } else {
        s2.powf(0.5 * exponent as f64)
    }
}

/// `4π∫_rc^∞ r² · a·r⁻ⁿ dr` for n > 3.
#[inline]
fn power_law_tail(coefficient: f64, exponent: u32, rc: f64) -> f64 {
    let n = exponent as f64;
    4.0 * PI * coefficient * rc.powf(3.0 - n) / (n - 3.0)
}

#[inline]
pub fn lennard_jones_12_6(r2: f64, sigma: f64, epsilon: f64) -> f64 {
    let s6 = inverse_power(r2, sigma, 6);
    4.0 * epsilon * (s6 * s6 - s6)
}

#[inline]
pub fn lennard_jones_12_6_virial(r2: f64, sigma: f64, epsilon: f64) -> f64 {
    let s6 = inverse_power(r2, sigma, 6);
    -4.0 * epsilon * (12.0 * s6 * s6 - 6.0 * s6)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LennardJones {
    pub sigma: f64,
    pub epsilon: f64,
}

impl LennardJones {
    pub fn new(sigma: f64, epsilon: f64) -> Self {
        Self { sigma, epsilon }
    }

    /// Reduced units, σ = ε = 1.
    pub fn reduced() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl PairPotential for LennardJones {
    fn u(&self, r2: f64) -> f64 {
        lennard_jones_12_6(r2, self.sigma, self.epsilon)
    }

    fn du(&self, r2: f64) -> f64 {
        lennard_jones_12_6_virial(r2, self.sigma, self.epsilon)
    }

    fn tail_integrals(&self, rc: f64) -> Option<TailIntegrals> {
        let a12 = 4.0 * self.epsilon * self.sigma.powi(12);
        let a6 = -4.0 * self.epsilon * self.sigma.powi(6);
        let energy = power_law_tail(a12, 12, rc) + power_law_tail(a6, 6, rc);
        let virial = -12.0 * power_law_tail(a12, 12, rc) - 6.0 * power_law_tail(a6, 6, rc);
        Some(TailIntegrals { energy, virial })
    }
}

/// Purely repulsive inverse-power potential `ε(σ/r)ⁿ`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftSphere {
    pub sigma: f64,
    pub epsilon: f64,
    pub exponent: u32,
}

impl SoftSphere {
    pub fn new(sigma: f64, epsilon: f64, exponent: u32) -> Self {
        Self {
            sigma,
            epsilon,
            exponent,
        }
    }
}

impl PairPotential for SoftSphere {
    fn u(&self, r2: f64) -> f64 {
        self.epsilon * inverse_power(r2, self.sigma, self.exponent)
    }

    fn du(&self, r2: f64) -> f64 {
        -(self.exponent as f64) * self.u(r2)
    }

    fn tail_integrals(&self, rc: f64) -> Option<TailIntegrals> {
        if self.exponent <= 3 {
            return None;
        }
        let coefficient = self.epsilon * self.sigma.powi(self.exponent as i32);
        let energy = power_law_tail(coefficient, self.exponent, rc);
        Some(TailIntegrals {
            energy,
            virial: -(self.exponent as f64) * energy,
        })
    }
}

/// Bounded Gaussian-core repulsion `ε·exp(−r²/σ²)`, finite at zero separation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianCore {
    pub sigma: f64,
    pub epsilon: f64,
}

impl GaussianCore {
    pub fn new(sigma: f64, epsilon: f64) -> Self {
        Self { sigma, epsilon }
    }
}

impl PairPotential for GaussianCore {
    fn u(&self, r2: f64) -> f64 {
        self.epsilon * (-r2 / (self.sigma * self.sigma)).exp()
    }

    fn du(&self, r2: f64) -> f64 {
        -2.0 * r2 / (self.sigma * self.sigma) * self.u(r2)
    }
}

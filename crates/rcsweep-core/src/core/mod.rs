//! # Core Module
//!
//! Stateless building blocks of the truncation-correction pipeline.
//!
//! ## Overview
//!
//! Everything in this module is a plain value or a pure function of its inputs:
//! cutoff ladders, periodic box geometry, pair potentials and the lattice sum
//! that evaluates a pair over every periodic image for all cutoffs at once.
//! The stateful stages built on top of these live in [`crate::engine`].
//!
//! ## Architecture
//!
//! - **Cutoff ladders** ([`cutoffs`]) - Strictly increasing truncation radii shared by every stage
//! - **Geometry** ([`geometry`]) - The [`geometry::Boundary`] seam and periodic image shells
//! - **Configurations** ([`configuration`]) - Atom positions, optional lattice sites, the [`configuration::SimulationBox`] seam
//! - **Pair potentials** ([`potentials`]) - Radial potentials in `r²` with optional tail integrals
//! - **Per-cutoff sums** ([`bucket`]) - The five summation channels kept per cutoff
//! - **Lattice sums** ([`lattice_sum`]) - Multi-cutoff sums over periodic images
//! - **Samples** ([`sample`]) - Flat per-cutoff sample vectors and their layout
//!
//! ## Conventions
//!
//! Potentials are evaluated on the squared separation. The "virial" of a pair
//! is always `r·du/dr`, so the configurational pressure reads
//! `−Σ virial / (D·V)`.

pub mod bucket;
pub mod configuration;
pub mod cutoffs;
pub mod geometry;
pub mod lattice_sum;
pub mod potentials;
pub mod sample;

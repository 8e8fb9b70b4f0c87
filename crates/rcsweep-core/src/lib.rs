//! # rcsweep
//!
//! Truncation corrections and free-energy reweighting across a ladder of
//! pair-potential cutoffs, measured in one pass over a periodic system.
//!
//! ## Architectural Philosophy
//!
//! The library follows a three-layer split:
//!
//! - **[`core`]: The Foundation.** Stateless models: periodic boundaries,
//!   cutoff ladders, pair potentials, per-cutoff sum buckets, the lattice sum
//!   with explicit periodic images, and the fixed-layout sample vector.
//!
//! - **[`engine`]: The Sampling Pipeline.** Stateful stages chained through a
//!   data-sink seam: the cutoff accumulator and pair traversals, the
//!   multi-cutoff meter, the reweighting transform, the ratio estimator and
//!   the per-step value cache, plus configuration and errors.
//!
//! - **[`workflows`]: The Analysis API.** Offset calibration, long-range
//!   corrections and the per-cutoff free-energy report built on block
//!   statistics of a finished run.

pub mod core;
pub mod engine;
pub mod workflows;

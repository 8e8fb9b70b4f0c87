//! # Workflows Module
//!
//! High-level analysis that turns the output of a reweighted sampling run into
//! per-cutoff free-energy and thermodynamic estimates.
//!
//! ## Overview
//!
//! A run feeds [`crate::engine`] stages with configurations; the resulting
//! weighted samples are block averaged outside this crate. The workflows here
//! pick up from there:
//!
//! - **Calibration** - Energy offsets that keep initial weights near one, and
//!   their extension from a short cutoff ladder to a longer one
//! - **Long-range corrections** - Analytic tails for the energy, pressure and
//!   both free-energy derivatives beyond each cutoff
//! - **Reporting** ([`free_energy`]) - Free-energy shifts and self-normalized
//!   estimates with propagated errors and leading-order bias, optionally
//!   differenced against a reference cutoff

pub mod free_energy;

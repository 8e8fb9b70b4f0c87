//! # Engine Module
//!
//! The stateful sampling pipeline that turns pair visits into per-cutoff
//! thermodynamic estimates.
//!
//! ## Overview
//!
//! One sampling event flows through the stages in order:
//!
//! ```text
//! PairTraversal ─▶ CutoffAccumulator ─▶ MultiCutoffMeter ─▶ ReweightTransform
//!                                                                 │
//!      RatioEstimator ◀── external block averaging ◀──────────────┘
//! ```
//!
//! Stages hand samples downstream through the [`sink::DataSink`] seam, so a
//! pipeline is assembled by giving each stage the next one with
//! `set_data_sink`. A [`sink::DataPump`] drives the head of the chain at the
//! configured sampling interval.
//!
//! ## Architecture
//!
//! - **Accumulation** ([`accumulator`]) - Per-cutoff pair sums with a descending early-break scan
//! - **Pair traversal** ([`traversal`]) - The seam to the pair loop, reference traversals and replay
//! - **Measurement** ([`meter`]) - `{U, P, dA/dy, dA/dv²}` per cutoff from one or two evaluators
//! - **Reweighting** ([`reweight`]) - Importance weights appended to every block
//! - **Ratio estimation** ([`ratio`]) - Self-normalized estimates with optional reference cutoff
//! - **Step caching** ([`cache`]) - Per-step memoization of the fast reference energy
//! - **Chaining** ([`sink`]) - Data sources, sinks, pumps and collectors
//! - **Configuration** ([`config`]) - Builder and TOML file form
//! - **Error Handling** ([`error`]) - [`error::PipelineError`] and its fatal numerical variant
//!
//! ## Concurrency
//!
//! Every stage is single-threaded and mutated in place. Accumulators can be
//! cloned per worker and merged afterwards, which the `parallel` feature uses
//! for the all-pairs traversal.

pub mod accumulator;
pub mod cache;
pub mod config;
pub mod error;
pub mod meter;
pub mod ratio;
pub mod reweight;
pub mod sink;
pub mod traversal;

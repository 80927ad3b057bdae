#![deny(missing_docs)]

//! adsorb - Multi-stage DFT adsorption-energy workflow driver
//!
//! `adsorb` orchestrates the calculation of an adsorption energy for a
//! molecule on a metal surface (the reference system is CO2 on Cu(111))
//! by driving an external plane-wave DFT engine, Quantum ESPRESSO's
//! `pw.x`, through five sequential stages:
//!
//! 1. **Bulk**: variable-cell relaxation of the metal's conventional
//!    cubic cell to find the lattice constant
//! 2. **Adsorbate**: relaxation of the isolated molecule in a vacuum box
//! 3. **Slab**: relaxation of a (111) surface slab cleaved from the
//!    relaxed bulk, bottom layers frozen
//! 4. **Placement**: geometric placement of the adsorbate above the
//!    configured surface site at a trial height
//! 5. **System**: relaxation of the combined adsorbate+slab system
//!
//! The adsorption energy is `E_system - (E_slab + E_adsorbate)`.
//!
//! # Design
//!
//! The physics lives entirely in the external engine; this crate shapes
//! inputs, manages the run directory tree, and records provenance:
//!
//! - every stage owns one subdirectory under the base directory
//!   (`s1_bulk` .. `s5_system`), created idempotently before any work
//! - every stage persists a JSON artifact that doubles as a completed
//!   marker, so re-running the workflow skips finished stages
//! - the settings record is written to YAML once per run for provenance
//! - the engine call is bounded by a timeout and retried with exponential
//!   backoff on transient failures; all failure modes are typed errors,
//!   never crashes
//! - pseudopotential files are checked for every species before the
//!   engine is ever invoked
//!
//! # Modules
//!
//! - [`config`] - runner configuration (paths, engine command, timeout,
//!   retry policy)
//! - [`settings`] - the immutable per-run calculation settings record
//! - [`structure`] - atomic structures and the bulk/molecule/slab builders
//! - [`engine`] - the external engine seam and the `pw.x` driver
//! - [`artifact`] - per-stage persisted artifacts / restart markers
//! - [`pipeline`] - the five-stage sequential workflow
//! - [`validation`] - preflight checks with user guidance
//! - [`logging`] - rotated run log duplicated to the console

pub mod artifact;
pub mod config;
pub mod engine;
pub mod logging;
pub mod pipeline;
pub mod settings;
pub mod structure;
pub mod validation;

pub use config::RunnerConfig;
pub use pipeline::{AdsorptionReport, Pipeline, Stage};
pub use settings::Settings;
pub use structure::Structure;

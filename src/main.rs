//! adsorb command-line entry point.
//!
//! Usage:
//!
//! ```bash
//! # Base directory from the command line, pseudopotentials from the env
//! ESPRESSO_PSEUDO_DIR=~/espresso/pseudos adsorb /scratch/copper111/co2
//!
//! # Everything from the environment
//! ADSORB_BASE_DIR=/scratch/copper111/co2 \
//! ESPRESSO_PSEUDO_DIR=~/espresso/pseudos adsorb
//! ```
//!
//! The process exits nonzero with a logged error message on any failure;
//! expected failure modes (missing pseudopotentials, engine crashes,
//! timeouts, non-convergence) never panic.

use adsorb::engine::EspressoEngine;
use adsorb::{logging, validation, Pipeline, RunnerConfig, Settings};
use log::info;
use std::env;
use std::error::Error;
use std::path::Path;
use std::process;

fn main() {
    if let Err(e) = run() {
        // The logger may not be initialized yet when setup fails, so the
        // message goes to stderr directly.
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    let base_override = args.get(1).map(Path::new);
    let config = RunnerConfig::from_env(base_override)?;
    config.validate()?;

    logging::init(&config.base_dir.join(logging::LOG_FILE))?;
    info!("Starting DFT adsorption calculation");
    info!("base directory: {}", config.base_dir.display());
    info!("pseudopotential directory: {}", config.pseudo_dir.display());

    let settings = Settings::default();
    info!("Settings:\n{}", settings.to_yaml()?);
    let settings_path = settings.save(&config.base_dir)?;
    info!("settings written to {}", settings_path.display());

    validation::preflight(&settings, &config)?;

    let engine = EspressoEngine::new(&config);
    let pipeline = Pipeline::new(&config, &settings, &engine);
    let report = pipeline.run()?;

    info!(
        "Done. Adsorption energy of {} on {}({:?}): {:.6} eV",
        settings.adsorbate, settings.metal, settings.site, report.adsorption_energy
    );
    Ok(())
}

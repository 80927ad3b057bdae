//! The five-stage adsorption workflow.
//!
//! Stages run strictly sequentially along the dependency chain
//! Bulk -> {Adsorbate, Slab} -> Placement -> System. Each stage owns one
//! subdirectory under the base directory, checks it for a completed
//! artifact before doing any work, and finalizes its own artifact before
//! the next stage starts. Data flows forward only: downstream stages see
//! upstream results exclusively through their persisted artifacts.
//!
//! The final report is the adsorption energy
//! `E_ads = E_system - (E_slab + E_adsorbate)`, all in eV.

use crate::artifact::{ArtifactError, StageArtifact};
use crate::config::RunnerConfig;
use crate::engine::{CalculationMode, Engine, EngineError, KpointSpec, RelaxationJob};
use crate::settings::Settings;
use crate::structure::{Structure, StructureError};
use log::info;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from pipeline execution.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Stage directory could not be created
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The external engine failed
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// A structure could not be built
    #[error(transparent)]
    Structure(#[from] StructureError),
    /// A stage artifact could not be persisted or restored
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// An upstream artifact lacks the energy a stage depends on
    #[error("artifact for stage {0} carries no energy")]
    MissingEnergy(&'static str),
}

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Bulk lattice-constant relaxation
    Bulk,
    /// Isolated adsorbate relaxation
    Adsorbate,
    /// Surface slab relaxation
    Slab,
    /// Adsorbate placement on the slab (geometric, no engine call)
    Placement,
    /// Combined-system relaxation
    System,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Bulk,
        Stage::Adsorbate,
        Stage::Slab,
        Stage::Placement,
        Stage::System,
    ];

    /// Subdirectory name under the base directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Bulk => "s1_bulk",
            Stage::Adsorbate => "s2_adsorbate",
            Stage::Slab => "s3_slab",
            Stage::Placement => "s4_ads_height",
            Stage::System => "s5_system",
        }
    }

    /// Human-readable banner for the log.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Bulk => "1. Compute bulk lattice constant",
            Stage::Adsorbate => "2. Compute adsorbate geometry",
            Stage::Slab => "3. Compute slab geometry",
            Stage::Placement => "4. Place adsorbate",
            Stage::System => "5. Compute system geometry",
        }
    }
}

/// Energies of the completed run, all in eV.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsorptionReport {
    /// Relaxed bulk total energy
    pub bulk_energy: f64,
    /// Isolated adsorbate total energy
    pub adsorbate_energy: f64,
    /// Clean slab total energy
    pub slab_energy: f64,
    /// Combined adsorbate+slab total energy
    pub system_energy: f64,
    /// `system - (slab + adsorbate)`
    pub adsorption_energy: f64,
}

/// Sequential executor for the five stages.
pub struct Pipeline<'a, E: Engine> {
    config: &'a RunnerConfig,
    settings: &'a Settings,
    engine: &'a E,
}

impl<'a, E: Engine> Pipeline<'a, E> {
    /// Creates a pipeline over a validated configuration and settings record.
    pub fn new(config: &'a RunnerConfig, settings: &'a Settings, engine: &'a E) -> Self {
        Self {
            config,
            settings,
            engine,
        }
    }

    /// Directory of a stage under the base directory.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.config.base_dir.join(stage.dir_name())
    }

    /// Creates every stage directory idempotently, before any stage logic.
    pub fn prepare_directories(&self) -> Result<(), PipelineError> {
        for stage in Stage::ALL {
            fs::create_dir_all(self.stage_dir(stage))?;
        }
        Ok(())
    }

    /// Runs the full workflow and returns the adsorption-energy report.
    pub fn run(&self) -> Result<AdsorptionReport, PipelineError> {
        self.prepare_directories()?;

        let bulk = self.run_bulk()?;
        let adsorbate = self.run_adsorbate()?;
        let slab = self.run_slab(&bulk)?;
        let placed = self.run_placement(&adsorbate, &slab)?;
        let system = self.run_system(&placed)?;

        let bulk_energy = bulk.energy.ok_or(PipelineError::MissingEnergy("s1_bulk"))?;
        let adsorbate_energy = adsorbate
            .energy
            .ok_or(PipelineError::MissingEnergy("s2_adsorbate"))?;
        let slab_energy = slab.energy.ok_or(PipelineError::MissingEnergy("s3_slab"))?;
        let system_energy = system
            .energy
            .ok_or(PipelineError::MissingEnergy("s5_system"))?;
        let report = AdsorptionReport {
            bulk_energy,
            adsorbate_energy,
            slab_energy,
            system_energy,
            adsorption_energy: system_energy - (slab_energy + adsorbate_energy),
        };
        info!(
            "adsorption energy: {:.6} eV (system {:.6}, slab {:.6}, adsorbate {:.6})",
            report.adsorption_energy, system_energy, slab_energy, adsorbate_energy
        );
        Ok(report)
    }

    /// Loads a completed artifact if the stage already ran.
    fn completed(&self, stage: Stage) -> Result<Option<StageArtifact>, PipelineError> {
        let dir = self.stage_dir(stage);
        if StageArtifact::exists(&dir) {
            info!("{} — found completed artifact, skipping", stage.label());
            Ok(Some(StageArtifact::load(&dir)?))
        } else {
            Ok(None)
        }
    }

    fn base_job(&self, mode: CalculationMode, prefix: &str, kpts: KpointSpec) -> RelaxationJob {
        let functional = match self.settings.dft_functional.as_str() {
            "default" => None,
            other => Some(other.to_string()),
        };
        RelaxationJob {
            mode,
            prefix: prefix.to_string(),
            forc_conv_thr: self.settings.forc_conv_thr,
            max_ionic_steps: self.settings.forc_conv_n,
            ecutwfc: self.settings.ecutwfc,
            ecutrho: self.settings.ecutrho,
            smearing: true,
            degauss: 0.1,
            functional,
            kpts,
            pseudopotentials: self.settings.pseudopotentials.clone(),
            pseudo_dir: self.config.pseudo_dir.clone(),
        }
    }

    /// Stage 1: variable-cell relaxation of the conventional bulk cell.
    fn run_bulk(&self) -> Result<StageArtifact, PipelineError> {
        let stage = Stage::Bulk;
        info!("{}", stage.label());
        if let Some(artifact) = self.completed(stage)? {
            return Ok(artifact);
        }
        let structure = Structure::bulk(
            &self.settings.metal,
            self.settings.crystal_structure,
            self.settings.lattice_constant_guess,
        );
        let (k1, k2, k3) = self.settings.kpts_bulk;
        let job = self.base_job(CalculationMode::VcRelax, "bulk", KpointSpec::Automatic(k1, k2, k3));
        let result = self.engine.relax(&structure, &job, &self.stage_dir(stage))?;
        let a = result.structure.cell.row(0).norm();
        info!("relaxed lattice constant: {:.4} A", a);
        let artifact = StageArtifact::new(stage.dir_name(), Some(result.energy), &result.structure);
        artifact.save(&self.stage_dir(stage))?;
        Ok(artifact)
    }

    /// Stage 2: fixed-cell relaxation of the isolated adsorbate.
    ///
    /// Independent of stage 1. The molecule sits in a cubic vacuum box and
    /// uses gamma-point sampling unless an explicit grid was configured.
    /// No metallic smearing for the molecule.
    fn run_adsorbate(&self) -> Result<StageArtifact, PipelineError> {
        let stage = Stage::Adsorbate;
        info!("{}", stage.label());
        if let Some(artifact) = self.completed(stage)? {
            return Ok(artifact);
        }
        let structure = Structure::molecule(&self.settings.adsorbate)?
            .centered_in_box(self.settings.vacuum_ads);
        let kpts = match self.settings.kpts_ads {
            Some((k1, k2, k3)) => KpointSpec::Automatic(k1, k2, k3),
            None => KpointSpec::Gamma,
        };
        let mut job = self.base_job(CalculationMode::Relax, "adsorbate", kpts);
        job.smearing = false;
        let result = self.engine.relax(&structure, &job, &self.stage_dir(stage))?;
        let artifact = StageArtifact::new(stage.dir_name(), Some(result.energy), &result.structure);
        artifact.save(&self.stage_dir(stage))?;
        Ok(artifact)
    }

    /// Stage 3: slab cleaved from the relaxed bulk and relaxed at fixed cell.
    ///
    /// Depends on stage 1: the (111) surface is built from the relaxed
    /// lattice constant, with the configured bottom layers held fixed.
    fn run_slab(&self, bulk: &StageArtifact) -> Result<StageArtifact, PipelineError> {
        let stage = Stage::Slab;
        info!("{}", stage.label());
        if let Some(artifact) = self.completed(stage)? {
            return Ok(artifact);
        }
        let a = bulk.structure().cell.row(0).norm();
        let mut slab = Structure::fcc111(
            &self.settings.metal,
            a,
            self.settings.slab_size,
            self.settings.slab_layers,
            self.settings.vacuum_ads,
        );
        slab.fix_bottom_layers(self.settings.slab_fixed_layers);
        let (k1, k2, k3) = self.settings.kpts_slab;
        let job = self.base_job(CalculationMode::Relax, "slab", KpointSpec::Automatic(k1, k2, k3));
        let result = self.engine.relax(&slab, &job, &self.stage_dir(stage))?;
        let artifact = StageArtifact::new(stage.dir_name(), Some(result.energy), &result.structure);
        artifact.save(&self.stage_dir(stage))?;
        Ok(artifact)
    }

    /// Stage 4: geometric placement of the adsorbate above the slab.
    ///
    /// Depends on stages 2 and 3. No engine call: the artifact carries the
    /// combined trial structure and no energy.
    fn run_placement(
        &self,
        adsorbate: &StageArtifact,
        slab: &StageArtifact,
    ) -> Result<StageArtifact, PipelineError> {
        let stage = Stage::Placement;
        info!("{}", stage.label());
        if let Some(artifact) = self.completed(stage)? {
            return Ok(artifact);
        }
        let combined = Structure::add_adsorbate(
            &slab.structure(),
            &adsorbate.structure(),
            self.settings.site,
            self.settings.adsorbate_height_guess,
        )?;
        info!(
            "placed {} at {:?} site, {:.2} A above the surface",
            self.settings.adsorbate, self.settings.site, self.settings.adsorbate_height_guess
        );
        let artifact = StageArtifact::new(stage.dir_name(), None, &combined);
        artifact.save(&self.stage_dir(stage))?;
        Ok(artifact)
    }

    /// Stage 5: fixed-cell relaxation of the combined system.
    fn run_system(&self, placed: &StageArtifact) -> Result<StageArtifact, PipelineError> {
        let stage = Stage::System;
        info!("{}", stage.label());
        if let Some(artifact) = self.completed(stage)? {
            return Ok(artifact);
        }
        let structure = placed.structure();
        let (k1, k2, k3) = self.settings.kpts_slab;
        let job = self.base_job(CalculationMode::Relax, "system", KpointSpec::Automatic(k1, k2, k3));
        let result = self.engine.relax(&structure, &job, &self.stage_dir(stage))?;
        let artifact = StageArtifact::new(stage.dir_name(), Some(result.energy), &result.structure);
        artifact.save(&self.stage_dir(stage))?;
        Ok(artifact)
    }
}

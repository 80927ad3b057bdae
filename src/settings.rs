//! Calculation settings for the adsorption workflow.
//!
//! The [`Settings`] record collects every physical and numerical parameter
//! of a run: the metal and its crystal family, the adsorbate and site,
//! plane-wave cutoffs, k-point grids per context, convergence thresholds,
//! and slab geometry knobs. It is built once at startup, logged in full,
//! persisted to a YAML file inside the base directory for provenance, and
//! never mutated afterwards.
//!
//! Defaults describe the reference run: CO2 on Cu(111) with PBE KJPAW
//! pseudopotentials.

use crate::structure::{CrystalFamily, Site};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the persisted settings record inside the base directory.
pub const SETTINGS_FILE: &str = "adsorption_settings.yaml";

/// Errors from settings persistence.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Settings file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Settings could not be serialized or deserialized
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Complete parameter record for one workflow run.
///
/// The record is immutable by convention: stages receive it by shared
/// reference and the persisted YAML file is the authoritative provenance
/// trail for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Surface metal element symbol (e.g., "Cu")
    pub metal: String,
    /// Crystal structure family of the metal
    pub crystal_structure: CrystalFamily,
    /// Initial guess for the cubic lattice constant in Angstroms
    pub lattice_constant_guess: f64,
    /// Adsorbate molecule name (e.g., "CO2")
    pub adsorbate: String,
    /// Adsorption site on the surface
    pub site: Site,
    /// Exchange-correlation functional label; "default" leaves the choice
    /// to the pseudopotentials
    pub dft_functional: String,
    /// Pseudopotential file per element symbol
    pub pseudopotentials: BTreeMap<String, String>,
    /// Plane-wave kinetic energy cutoff for wavefunctions (Ry)
    pub ecutwfc: f64,
    /// Charge-density cutoff (Ry); PAW sets typically need ~10x `ecutwfc`
    pub ecutrho: f64,
    /// k-point grid for the bulk cell
    pub kpts_bulk: (u32, u32, u32),
    /// k-point grid for slab and combined-system cells
    pub kpts_slab: (u32, u32, u32),
    /// k-point grid for the isolated adsorbate; `None` means gamma-point
    /// sampling, appropriate for a molecule in a large vacuum box
    pub kpts_ads: Option<(u32, u32, u32)>,
    /// Force convergence threshold for ionic relaxation (Ry/Bohr)
    pub forc_conv_thr: f64,
    /// Maximum ionic steps; 0 leaves the engine default in place
    pub forc_conv_n: u32,
    /// Vacuum spacing around adsorbate and above the slab (Angstrom)
    pub vacuum_ads: f64,
    /// Number of atomic layers in the slab
    pub slab_layers: usize,
    /// Lateral repetition of the surface cell
    pub slab_size: (usize, usize),
    /// Number of bottom slab layers held fixed during relaxation
    pub slab_fixed_layers: usize,
    /// Trial height of the adsorbate above the top layer (Angstrom)
    pub adsorbate_height_guess: f64,
}

impl Default for Settings {
    fn default() -> Self {
        let mut pseudopotentials = BTreeMap::new();
        pseudopotentials.insert("Cu".to_string(), "Cu.pbe-dn-kjpaw_psl.1.0.0.UPF".to_string());
        pseudopotentials.insert("C".to_string(), "C.pbe-n-kjpaw_psl.1.0.0.UPF".to_string());
        pseudopotentials.insert("O".to_string(), "O.pbe-n-kjpaw_psl.1.0.0.UPF".to_string());
        Self {
            metal: "Cu".to_string(),
            crystal_structure: CrystalFamily::Fcc,
            lattice_constant_guess: 3.6,
            adsorbate: "CO2".to_string(),
            site: Site::Top,
            dft_functional: "default".to_string(),
            pseudopotentials,
            ecutwfc: 50.0,
            ecutrho: 500.0,
            kpts_bulk: (4, 4, 4),
            kpts_slab: (4, 4, 1),
            kpts_ads: None,
            forc_conv_thr: 0.001,
            forc_conv_n: 0,
            vacuum_ads: 7.5,
            slab_layers: 4,
            slab_size: (3, 3),
            slab_fixed_layers: 2,
            adsorbate_height_guess: 2.0,
        }
    }
}

impl Settings {
    /// Serializes the record to YAML.
    pub fn to_yaml(&self) -> Result<String, SettingsError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the settings file into `base_dir`, overwriting any existing
    /// file at that path, and returns the path written.
    pub fn save(&self, base_dir: &Path) -> Result<PathBuf, SettingsError> {
        let path = base_dir.join(SETTINGS_FILE);
        fs::write(&path, self.to_yaml()?)?;
        Ok(path)
    }

    /// Reads a settings record back from a YAML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

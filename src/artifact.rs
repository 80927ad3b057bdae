//! Stage artifacts: persisted outputs that double as restart markers.
//!
//! Each pipeline stage finalizes exactly one [`StageArtifact`] in its own
//! subdirectory, holding the stage's relaxed structure and total energy.
//! The artifact file is also the completed marker: when it exists, the
//! stage is skipped on re-runs and the persisted result is handed
//! downstream instead of redoing the engine call. A malformed artifact is
//! an error, not a silent re-run.
//!
//! # Serialization Strategy
//!
//! Artifacts are pretty-printed JSON. Since [`Structure`] stores nalgebra
//! types, a wrapper with plain vectors ([`SerializableStructure`]) is used
//! for the on-disk form.

use crate::structure::Structure;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the artifact inside a stage directory.
pub const ARTIFACT_FILE: &str = "artifact.json";

/// Errors from artifact persistence.
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// Artifact file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Artifact contents are not valid JSON for this schema
    #[error("malformed artifact: {0}")]
    Json(#[from] serde_json::Error),
}

/// Plain-vector form of [`Structure`] for JSON serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableStructure {
    /// Chemical element symbols
    elements: Vec<String>,
    /// Flattened Cartesian coordinates [x1, y1, z1, x2, ...] in Angstroms
    coords: Vec<f64>,
    /// Cell rows (lattice vectors, Angstrom)
    cell: [[f64; 3]; 3],
    /// Per-atom fixed flags
    fixed: Vec<bool>,
}

impl From<&Structure> for SerializableStructure {
    fn from(s: &Structure) -> Self {
        let mut coords = Vec::with_capacity(s.num_atoms() * 3);
        for p in &s.positions {
            coords.extend_from_slice(&[p.x, p.y, p.z]);
        }
        let mut cell = [[0.0; 3]; 3];
        for (i, row) in cell.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = s.cell[(i, j)];
            }
        }
        Self {
            elements: s.elements.clone(),
            coords,
            cell,
            fixed: s.fixed.clone(),
        }
    }
}

impl From<&SerializableStructure> for Structure {
    fn from(s: &SerializableStructure) -> Self {
        let positions = s
            .coords
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();
        let cell = Matrix3::new(
            s.cell[0][0], s.cell[0][1], s.cell[0][2],
            s.cell[1][0], s.cell[1][1], s.cell[1][2],
            s.cell[2][0], s.cell[2][1], s.cell[2][2],
        );
        let mut out = Structure::new(s.elements.clone(), positions, cell);
        out.fixed = s.fixed.clone();
        out
    }
}

/// Persisted output of one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageArtifact {
    /// Stage name (directory name of the producing stage)
    pub stage: String,
    /// Total energy in eV; `None` for purely geometric stages
    pub energy: Option<f64>,
    /// Finalized structure of the stage
    pub structure: SerializableStructure,
}

impl StageArtifact {
    /// Creates an artifact from a stage result.
    pub fn new(stage: &str, energy: Option<f64>, structure: &Structure) -> Self {
        Self {
            stage: stage.to_string(),
            energy,
            structure: structure.into(),
        }
    }

    /// Reconstructs the runtime structure.
    pub fn structure(&self) -> Structure {
        (&self.structure).into()
    }

    /// Path of the artifact file inside a stage directory.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(ARTIFACT_FILE)
    }

    /// Whether a stage directory already holds a completed artifact.
    pub fn exists(dir: &Path) -> bool {
        Self::path_in(dir).is_file()
    }

    /// Saves the artifact into the stage directory.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ArtifactError> {
        let path = Self::path_in(dir);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Loads the artifact from a stage directory.
    pub fn load(dir: &Path) -> Result<Self, ArtifactError> {
        let content = fs::read_to_string(Self::path_in(dir))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::CrystalFamily;

    #[test]
    fn structure_round_trips_through_artifact() {
        let mut bulk = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
        bulk.fixed[0] = true;
        let artifact = StageArtifact::new("s1_bulk", Some(-1234.5), &bulk);
        let json = serde_json::to_string(&artifact).unwrap();
        let back: StageArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.structure(), bulk);
        assert_eq!(back.energy, Some(-1234.5));
    }
}

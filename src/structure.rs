//! Atomic structure representation and builders.
//!
//! This module provides the [`Structure`] type used by every pipeline stage
//! and the geometric builders the workflow needs:
//!
//! - [`Structure::bulk`]: conventional cubic crystal cells (fcc/bcc/sc)
//! - [`Structure::molecule`]: reference geometries for small adsorbates
//! - [`Structure::fcc111`]: orthogonal-in-z (111) surface slabs
//! - [`Structure::add_adsorbate`]: adsorbate placement above a surface site
//!
//! All coordinates and cell vectors are in Angstroms. Cells are stored as a
//! 3x3 matrix whose *rows* are the lattice vectors.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Errors from structure construction and manipulation.
#[derive(Error, Debug)]
pub enum StructureError {
    /// Crystal structure family is not one of the supported cubic families
    #[error("unsupported crystal structure '{0}' (supported: fcc, bcc, sc)")]
    UnsupportedCrystal(String),
    /// Adsorbate name has no built-in reference geometry
    #[error("unknown adsorbate '{0}' (supported: CO2, CO, O2, N2, H2, H2O)")]
    UnknownAdsorbate(String),
    /// Adsorption site label is not recognized
    #[error("unknown adsorption site '{0}' (supported: top, bridge, hollow)")]
    UnknownSite(String),
    /// Slab does not contain enough atoms for the requested operation
    #[error("slab is too small: {0}")]
    SlabTooSmall(String),
}

/// Cubic crystal structure families supported by the bulk builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrystalFamily {
    /// Face-centered cubic (4 atoms in the conventional cell)
    Fcc,
    /// Body-centered cubic (2 atoms in the conventional cell)
    Bcc,
    /// Simple cubic (1 atom in the conventional cell)
    Sc,
}

impl FromStr for CrystalFamily {
    type Err = StructureError;

    fn from_str(s: &str) -> Result<Self, StructureError> {
        match s.to_ascii_lowercase().as_str() {
            "fcc" => Ok(CrystalFamily::Fcc),
            "bcc" => Ok(CrystalFamily::Bcc),
            "sc" => Ok(CrystalFamily::Sc),
            other => Err(StructureError::UnsupportedCrystal(other.to_string())),
        }
    }
}

/// High-symmetry adsorption sites on a close-packed surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    /// Directly above a surface atom
    Top,
    /// Midpoint between two neighboring surface atoms
    Bridge,
    /// Threefold hollow between three surface atoms
    Hollow,
}

impl FromStr for Site {
    type Err = StructureError;

    fn from_str(s: &str) -> Result<Self, StructureError> {
        match s.to_ascii_lowercase().as_str() {
            "top" => Ok(Site::Top),
            "bridge" => Ok(Site::Bridge),
            "hollow" => Ok(Site::Hollow),
            other => Err(StructureError::UnknownSite(other.to_string())),
        }
    }
}

/// Tolerance for grouping atoms into layers by their z coordinate (Angstrom).
const LAYER_TOL: f64 = 0.1;

/// A periodic atomic structure: element symbols, Cartesian positions, cell,
/// and per-atom fixed flags.
///
/// Fixed atoms keep their positions during ionic relaxation; the engine
/// interface translates the flags into zeroed force multipliers in the
/// input file. Every builder starts with all atoms free.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    /// Chemical element symbols, one per atom
    pub elements: Vec<String>,
    /// Cartesian positions in Angstroms
    pub positions: Vec<Vector3<f64>>,
    /// Periodic cell; rows are the lattice vectors (Angstrom)
    pub cell: Matrix3<f64>,
    /// Per-atom relaxation constraint (true = held fixed)
    pub fixed: Vec<bool>,
}

impl Structure {
    /// Creates a structure with all atoms free to relax.
    ///
    /// # Panics
    ///
    /// Panics if `elements` and `positions` have different lengths.
    pub fn new(elements: Vec<String>, positions: Vec<Vector3<f64>>, cell: Matrix3<f64>) -> Self {
        assert_eq!(elements.len(), positions.len());
        let fixed = vec![false; elements.len()];
        Self {
            elements,
            positions,
            cell,
            fixed,
        }
    }

    /// Number of atoms in the structure.
    pub fn num_atoms(&self) -> usize {
        self.elements.len()
    }

    /// Element symbols present in the structure, in order of first appearance.
    pub fn unique_species(&self) -> Vec<String> {
        let mut species: Vec<String> = Vec::new();
        for el in &self.elements {
            if !species.contains(el) {
                species.push(el.clone());
            }
        }
        species
    }

    /// Builds the conventional cubic cell of a bulk crystal.
    ///
    /// For `Fcc` the cell holds exactly 4 atoms, for `Bcc` 2, for `Sc` 1.
    /// `a` is the cubic lattice constant in Angstroms.
    pub fn bulk(element: &str, family: CrystalFamily, a: f64) -> Self {
        let fractional: &[[f64; 3]] = match family {
            CrystalFamily::Fcc => &[
                [0.0, 0.0, 0.0],
                [0.0, 0.5, 0.5],
                [0.5, 0.0, 0.5],
                [0.5, 0.5, 0.0],
            ],
            CrystalFamily::Bcc => &[[0.0, 0.0, 0.0], [0.5, 0.5, 0.5]],
            CrystalFamily::Sc => &[[0.0, 0.0, 0.0]],
        };
        let cell = Matrix3::from_diagonal(&Vector3::new(a, a, a));
        let positions = fractional
            .iter()
            .map(|f| Vector3::new(f[0] * a, f[1] * a, f[2] * a))
            .collect::<Vec<_>>();
        let elements = vec![element.to_string(); positions.len()];
        Self::new(elements, positions, cell)
    }

    /// Builds the reference gas-phase geometry of a supported adsorbate.
    ///
    /// Geometries use standard experimental bond lengths (Angstrom) and are
    /// oriented along z with the first atom at the lowest z, so placement
    /// routines can treat the first atom as the anchor. The returned
    /// structure has a zero cell; call [`Structure::centered_in_box`] to
    /// give it a vacuum cell before any calculation.
    pub fn molecule(name: &str) -> Result<Self, StructureError> {
        let (elements, positions): (Vec<&str>, Vec<[f64; 3]>) =
            match name.to_ascii_uppercase().as_str() {
                // Linear O=C=O, d(C-O) = 1.16
                "CO2" => (
                    vec!["C", "O", "O"],
                    vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.16], [0.0, 0.0, -1.16]],
                ),
                "CO" => (vec!["C", "O"], vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.128]]),
                "O2" => (vec!["O", "O"], vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.21]]),
                "N2" => (vec!["N", "N"], vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.10]]),
                "H2" => (vec!["H", "H"], vec![[0.0, 0.0, 0.0], [0.0, 0.0, 0.74]]),
                // Bent, d(O-H) = 0.957, angle 104.5 degrees
                "H2O" => (
                    vec!["O", "H", "H"],
                    vec![
                        [0.0, 0.0, 0.0],
                        [0.757, 0.0, 0.587],
                        [-0.757, 0.0, 0.587],
                    ],
                ),
                _ => return Err(StructureError::UnknownAdsorbate(name.to_string())),
            };
        Ok(Self::new(
            elements.into_iter().map(String::from).collect(),
            positions
                .into_iter()
                .map(|p| Vector3::new(p[0], p[1], p[2]))
                .collect(),
            Matrix3::zeros(),
        ))
    }

    /// Returns a copy of the structure centered in a cubic vacuum box.
    ///
    /// The box edge is the molecular extent plus `vacuum` on each side, so
    /// periodic images are separated by at least `2 * vacuum`.
    pub fn centered_in_box(&self, vacuum: f64) -> Self {
        let mut min = Vector3::repeat(f64::INFINITY);
        let mut max = Vector3::repeat(f64::NEG_INFINITY);
        for p in &self.positions {
            min = min.inf(p);
            max = max.sup(p);
        }
        let extent = max - min;
        let edge = extent.max().max(0.0) + 2.0 * vacuum;
        let center = Vector3::repeat(edge / 2.0);
        let mid = (min + max) / 2.0;
        let shift = center - mid;
        let mut out = self.clone();
        for p in &mut out.positions {
            *p += shift;
        }
        out.cell = Matrix3::from_diagonal(&Vector3::new(edge, edge, edge));
        out
    }

    /// Cleaves an fcc(111) slab.
    ///
    /// The surface lattice constant is `a / sqrt(2)` (nearest-neighbor
    /// distance) and the interlayer spacing is `a / sqrt(3)`. Layers follow
    /// ABC stacking; the lateral cell is the hexagonal surface cell repeated
    /// `size.0 x size.1` times, and `vacuum` Angstroms of empty space pad
    /// the slab on both sides along z.
    pub fn fcc111(element: &str, a: f64, size: (usize, usize), layers: usize, vacuum: f64) -> Self {
        let a_surf = a / 2.0_f64.sqrt();
        let d = a / 3.0_f64.sqrt();
        let a1 = Vector3::new(a_surf, 0.0, 0.0);
        let a2 = Vector3::new(a_surf / 2.0, a_surf * 3.0_f64.sqrt() / 2.0, 0.0);
        let (nx, ny) = size;

        let mut elements = Vec::with_capacity(nx * ny * layers);
        let mut positions = Vec::with_capacity(nx * ny * layers);
        for layer in 0..layers {
            // ABC stacking: successive layers shift by (a1 + a2) / 3
            let stack = (layer % 3) as f64 / 3.0;
            let z = vacuum + layer as f64 * d;
            for i in 0..nx {
                for j in 0..ny {
                    let frac_x = i as f64 + stack;
                    let frac_y = j as f64 + stack;
                    let p = a1 * frac_x + a2 * frac_y + Vector3::new(0.0, 0.0, z);
                    elements.push(element.to_string());
                    positions.push(p);
                }
            }
        }

        let c = (layers.saturating_sub(1)) as f64 * d + 2.0 * vacuum;
        let cell = Matrix3::from_rows(&[
            (a1 * nx as f64).transpose(),
            (a2 * ny as f64).transpose(),
            Vector3::new(0.0, 0.0, c).transpose(),
        ]);
        Self::new(elements, positions, cell)
    }

    /// z coordinate of the topmost layer.
    pub fn top_layer_z(&self) -> f64 {
        self.positions
            .iter()
            .map(|p| p.z)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Marks all atoms in the `n` lowest layers as fixed.
    ///
    /// Layers are identified by clustering z coordinates within a small
    /// tolerance, so slightly relaxed slabs still group correctly.
    pub fn fix_bottom_layers(&mut self, n: usize) {
        if n == 0 || self.positions.is_empty() {
            return;
        }
        let mut zs: Vec<f64> = self.positions.iter().map(|p| p.z).collect();
        zs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut layer_zs: Vec<f64> = Vec::new();
        for z in zs {
            if layer_zs.last().map_or(true, |last| z - last > LAYER_TOL) {
                layer_zs.push(z);
            }
        }
        let cutoff = match layer_zs.get(n - 1) {
            Some(z) => z + LAYER_TOL,
            None => return,
        };
        for (i, p) in self.positions.iter().enumerate() {
            if p.z <= cutoff {
                self.fixed[i] = true;
            }
        }
    }

    /// Places an adsorbate above a surface site of a slab.
    ///
    /// The anchor atom is the top-layer atom nearest the lateral center of
    /// the cell. `Top` places the adsorbate directly above it, `Bridge`
    /// halfway to its nearest in-layer neighbor, and `Hollow` at the
    /// centroid of the triangle formed with its two nearest neighbors. The
    /// adsorbate is translated so its lowest atom sits `height` Angstroms
    /// above the top layer; the combined structure keeps the slab cell and
    /// the slab's fixed flags.
    pub fn add_adsorbate(
        slab: &Structure,
        adsorbate: &Structure,
        site: Site,
        height: f64,
    ) -> Result<Structure, StructureError> {
        let top_z = slab.top_layer_z();
        let top_atoms: Vec<Vector3<f64>> = slab
            .positions
            .iter()
            .filter(|p| (top_z - p.z).abs() < LAYER_TOL)
            .cloned()
            .collect();
        if top_atoms.is_empty() {
            return Err(StructureError::SlabTooSmall("no top layer atoms".into()));
        }

        let lateral_center = (slab.cell.row(0).transpose() + slab.cell.row(1).transpose()) / 2.0;
        let anchor = *top_atoms
            .iter()
            .min_by(|a, b| {
                let da = (a.xy() - lateral_center.xy()).norm();
                let db = (b.xy() - lateral_center.xy()).norm();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| StructureError::SlabTooSmall("empty top layer".into()))?;

        let mut neighbors: Vec<Vector3<f64>> = top_atoms
            .iter()
            .filter(|p| (*p - anchor).norm() > 1e-6)
            .cloned()
            .collect();
        neighbors.sort_by(|a, b| {
            let da = (a - anchor).norm();
            let db = (b - anchor).norm();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });

        let target = match site {
            Site::Top => anchor,
            Site::Bridge => {
                let n1 = *neighbors.first().ok_or_else(|| {
                    StructureError::SlabTooSmall("bridge site needs 2 top-layer atoms".into())
                })?;
                (anchor + n1) / 2.0
            }
            Site::Hollow => {
                let n1 = *neighbors.first().ok_or_else(|| {
                    StructureError::SlabTooSmall("hollow site needs 3 top-layer atoms".into())
                })?;
                // The second neighbor must form a proper triangle with the
                // first, not sit collinear across the anchor.
                let v1 = n1 - anchor;
                let n2 = *neighbors
                    .iter()
                    .skip(1)
                    .find(|p| {
                        let v2 = *p - anchor;
                        (v1.x * v2.y - v1.y * v2.x).abs() > 1e-6
                    })
                    .ok_or_else(|| {
                        StructureError::SlabTooSmall("hollow site needs 3 top-layer atoms".into())
                    })?;
                (anchor + n1 + n2) / 3.0
            }
        };

        let mol_min_z = adsorbate
            .positions
            .iter()
            .map(|p| p.z)
            .fold(f64::INFINITY, f64::min);
        let mut mol_xy = Vector3::zeros();
        for p in &adsorbate.positions {
            mol_xy += Vector3::new(p.x, p.y, 0.0);
        }
        mol_xy /= adsorbate.num_atoms() as f64;
        let shift = Vector3::new(
            target.x - mol_xy.x,
            target.y - mol_xy.y,
            top_z + height - mol_min_z,
        );

        let mut combined = slab.clone();
        for (i, p) in adsorbate.positions.iter().enumerate() {
            combined.elements.push(adsorbate.elements[i].clone());
            combined.positions.push(p + shift);
            combined.fixed.push(false);
        }
        Ok(combined)
    }
}

//! External calculation engine interface.
//!
//! The workflow delegates all electronic-structure work to an external
//! plane-wave DFT engine (Quantum ESPRESSO's `pw.x`). This module provides
//! a uniform interface for:
//!
//! - Writing engine input files (namelists plus structure cards)
//! - Executing the engine with a wall-clock timeout and retry policy
//! - Parsing the output for the total energy and relaxed structure
//!
//! # Interface Design
//!
//! The [`Engine`] trait is the seam between the pipeline and the external
//! program: stages hand it a [`Structure`] and a [`RelaxationJob`] and get
//! back a tagged [`Relaxation`] result or an [`EngineError`]. Tests drive
//! the pipeline through a mock implementation; production uses
//! [`EspressoEngine`].
//!
//! # Failure model
//!
//! Nothing from the engine propagates as a crash. Every failure mode is a
//! variant of [`EngineError`]:
//!
//! - `MissingPseudopotential`: raised *before* the engine runs, for every
//!   species in the structure
//! - `EngineFailure` / `Timeout`: transient classes, retried with
//!   exponential backoff up to the configured attempt limit
//! - `Parse` / `Unconverged`: permanent, never retried

use crate::config::{RetryPolicy, RunnerConfig};
use crate::structure::Structure;
use lazy_static::lazy_static;
use log::{info, warn};
use nalgebra::{Matrix3, Vector3};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Rydberg to electronvolt conversion (CODATA 2018).
pub const RY_TO_EV: f64 = 13.605693122994;

/// Interval between liveness polls of a running engine process.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// File system or process-spawn failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A pseudopotential file required by the structure is absent
    #[error("missing pseudopotential for {element}: {file} not found in pseudo dir")]
    MissingPseudopotential {
        /// Element whose pseudopotential is missing
        element: String,
        /// Expected file path
        file: PathBuf,
    },
    /// No pseudopotential is mapped for an element in the structure
    #[error("no pseudopotential configured for element {0}")]
    UnmappedElement(String),
    /// The engine exited abnormally
    #[error("engine failed: {0}")]
    EngineFailure(String),
    /// The engine exceeded the configured wall-clock limit
    #[error("engine timed out after {0:?}")]
    Timeout(Duration),
    /// The output file could not be interpreted
    #[error("parse error: {0}")]
    Parse(String),
    /// The engine finished but did not reach convergence
    #[error("relaxation did not converge")]
    Unconverged,
}

impl EngineError {
    /// Whether the failure class is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::EngineFailure(_) | EngineError::Timeout(_))
    }
}

/// Type alias for engine operation results.
type Result<T> = std::result::Result<T, EngineError>;

/// Calculation mode requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationMode {
    /// Relax ions and cell (variable-cell relaxation)
    VcRelax,
    /// Relax ions at fixed cell
    Relax,
    /// Single self-consistent-field point, no ionic motion
    Scf,
}

impl CalculationMode {
    /// Engine keyword for the mode.
    pub fn keyword(&self) -> &'static str {
        match self {
            CalculationMode::VcRelax => "vc-relax",
            CalculationMode::Relax => "relax",
            CalculationMode::Scf => "scf",
        }
    }
}

/// k-point sampling specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KpointSpec {
    /// Uniform Monkhorst-Pack grid, no offset
    Automatic(u32, u32, u32),
    /// Gamma point only (isolated molecules in vacuum boxes)
    Gamma,
}

/// Job descriptor for one engine invocation.
///
/// Invariant: `pseudopotentials` must map every element present in the
/// accompanying structure to a file that exists inside `pseudo_dir`;
/// [`EspressoEngine`] enforces this before running anything.
#[derive(Debug, Clone)]
pub struct RelaxationJob {
    /// Calculation mode
    pub mode: CalculationMode,
    /// File prefix for input/output inside the stage directory
    pub prefix: String,
    /// Force convergence threshold (Ry/Bohr)
    pub forc_conv_thr: f64,
    /// Maximum ionic steps; 0 keeps the engine default
    pub max_ionic_steps: u32,
    /// Wavefunction cutoff (Ry)
    pub ecutwfc: f64,
    /// Charge-density cutoff (Ry)
    pub ecutrho: f64,
    /// Metallic smearing of occupations
    pub smearing: bool,
    /// Smearing width (Ry), used when `smearing` is on
    pub degauss: f64,
    /// Explicit exchange-correlation functional; `None` defers to the
    /// pseudopotentials
    pub functional: Option<String>,
    /// k-point sampling
    pub kpts: KpointSpec,
    /// Pseudopotential file per element
    pub pseudopotentials: BTreeMap<String, String>,
    /// Pseudopotential search directory
    pub pseudo_dir: PathBuf,
}

/// Result of a successful engine invocation.
#[derive(Debug, Clone)]
pub struct Relaxation {
    /// Total energy in eV
    pub energy: f64,
    /// Final structure (equal to the input structure for `Scf` jobs)
    pub structure: Structure,
}

/// The seam between the pipeline and the external DFT engine.
pub trait Engine {
    /// Runs one calculation in `dir` and returns the relaxed result.
    ///
    /// Implementations must be synchronous: the call blocks until the
    /// engine finishes, fails, or times out.
    fn relax(&self, structure: &Structure, job: &RelaxationJob, dir: &Path) -> Result<Relaxation>;
}

lazy_static! {
    static ref FLOAT: String = r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eEdD][-+]?\d+)?".to_string();

    // Final total energy: "!    total energy              =    -547.12345678 Ry"
    static ref ENERGY_RE: Regex =
        Regex::new(&format!(r"^!\s+total energy\s*=\s*({0})\s*Ry", *FLOAT)).unwrap();

    // Position line inside the final coordinates block: "Cu  0.0  0.0  0.0 [0 0 0]"
    static ref POSITION_RE: Regex = Regex::new(&format!(
        r"^\s*([A-Z][a-z]?)\s+({0})\s+({0})\s+({0})",
        *FLOAT
    )).unwrap();

    // Cell vector row: three floats
    static ref CELL_ROW_RE: Regex =
        Regex::new(&format!(r"^\s*({0})\s+({0})\s+({0})\s*$", *FLOAT)).unwrap();
}

/// Quantum ESPRESSO `pw.x` engine driver.
///
/// Writes a complete input file per job, runs the configured command inside
/// the stage directory (stdout captured to `<prefix>.pwo`, stderr to
/// `<prefix>.err`), and parses the output. The invocation is bounded by the
/// configured timeout and retried per the retry policy for transient
/// failures.
pub struct EspressoEngine {
    /// Engine executable
    pub command: String,
    /// Wall-clock limit per invocation
    pub timeout: Option<Duration>,
    /// Retry policy for transient failures
    pub retry: RetryPolicy,
}

impl EspressoEngine {
    /// Creates an engine driver from the runner configuration.
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            command: config.engine_command.clone(),
            timeout: config.timeout,
            retry: config.retry,
        }
    }

    /// Verifies that a mapped pseudopotential file exists on disk for every
    /// species in the structure. Runs before any engine invocation.
    pub fn check_pseudopotentials(&self, structure: &Structure, job: &RelaxationJob) -> Result<()> {
        for element in structure.unique_species() {
            let file = job
                .pseudopotentials
                .get(&element)
                .ok_or_else(|| EngineError::UnmappedElement(element.clone()))?;
            let path = job.pseudo_dir.join(file);
            if !path.is_file() {
                return Err(EngineError::MissingPseudopotential {
                    element,
                    file: path,
                });
            }
        }
        Ok(())
    }

    fn run_once(&self, dir: &Path, input_name: &str, output_name: &str) -> Result<()> {
        let stdout = File::create(dir.join(output_name))?;
        let stderr_path = dir.join(format!("{}.err", input_name.trim_end_matches(".pwi")));
        let stderr = File::create(&stderr_path)?;
        let mut child = Command::new(&self.command)
            .arg("-in")
            .arg(input_name)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;

        let status = match self.timeout {
            None => child.wait()?,
            Some(limit) => {
                let start = Instant::now();
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if start.elapsed() > limit {
                        child.kill()?;
                        child.wait()?;
                        return Err(EngineError::Timeout(limit));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        };

        if !status.success() {
            let detail = fs::read_to_string(&stderr_path).unwrap_or_default();
            return Err(EngineError::EngineFailure(format!(
                "{} exited with {}: {}",
                self.command,
                status,
                detail.trim()
            )));
        }
        Ok(())
    }
}

impl Engine for EspressoEngine {
    fn relax(&self, structure: &Structure, job: &RelaxationJob, dir: &Path) -> Result<Relaxation> {
        self.check_pseudopotentials(structure, job)?;
        fs::create_dir_all(dir)?;

        let input_name = format!("{}.pwi", job.prefix);
        let output_name = format!("{}.pwo", job.prefix);
        write_input(structure, job, &dir.join(&input_name))?;

        let mut attempt: u32 = 1;
        loop {
            info!(
                "running {} ({}) in {} [attempt {}/{}]",
                self.command,
                job.mode.keyword(),
                dir.display(),
                attempt,
                self.retry.max_attempts
            );
            // Parsing happens inside the loop: a zero-exit run whose output
            // is truncated is as transient as an abnormal exit
            let outcome = self.run_once(dir, &input_name, &output_name).and_then(|()| {
                let content = fs::read_to_string(dir.join(&output_name))?;
                parse_output(&content, structure, job.mode)
            });
            match outcome {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!("engine attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Writes a complete `pw.x` input file for the job.
///
/// The file contains the CONTROL/SYSTEM/ELECTRONS/IONS/CELL namelists in
/// `pw.x`'s required order (ELECTRONS is mandatory even when empty; IONS
/// and CELL appear only for modes that move ions or the cell) followed by
/// ATOMIC_SPECIES,
/// CELL_PARAMETERS, ATOMIC_POSITIONS, and K_POINTS cards. Fixed atoms get
/// zeroed force multipliers on their position lines.
pub fn write_input(structure: &Structure, job: &RelaxationJob, path: &Path) -> Result<()> {
    let species = structure.unique_species();
    let mut s = String::new();

    let _ = writeln!(s, "&CONTROL");
    let _ = writeln!(s, "  calculation = '{}'", job.mode.keyword());
    let _ = writeln!(s, "  prefix = '{}'", job.prefix);
    let _ = writeln!(s, "  outdir = './out'");
    let _ = writeln!(s, "  pseudo_dir = '{}'", job.pseudo_dir.display());
    if job.mode != CalculationMode::Scf {
        let _ = writeln!(s, "  forc_conv_thr = {}", job.forc_conv_thr);
        if job.max_ionic_steps > 0 {
            let _ = writeln!(s, "  nstep = {}", job.max_ionic_steps);
        }
    }
    let _ = writeln!(s, "  tstress = .true.");
    let _ = writeln!(s, "  tprnfor = .true.");
    let _ = writeln!(s, "/");

    let _ = writeln!(s, "&SYSTEM");
    let _ = writeln!(s, "  ibrav = 0");
    let _ = writeln!(s, "  nat = {}", structure.num_atoms());
    let _ = writeln!(s, "  ntyp = {}", species.len());
    let _ = writeln!(s, "  ecutwfc = {}", job.ecutwfc);
    let _ = writeln!(s, "  ecutrho = {}", job.ecutrho);
    if job.smearing {
        let _ = writeln!(s, "  occupations = 'smearing'");
        let _ = writeln!(s, "  degauss = {}", job.degauss);
    }
    if let Some(functional) = &job.functional {
        let _ = writeln!(s, "  input_dft = '{}'", functional);
    }
    let _ = writeln!(s, "/");

    // Mandatory even when empty; pw.x aborts on input without it
    let _ = writeln!(s, "&ELECTRONS");
    let _ = writeln!(s, "/");

    if job.mode != CalculationMode::Scf {
        let _ = writeln!(s, "&IONS");
        let _ = writeln!(s, "  ion_dynamics = 'bfgs'");
        let _ = writeln!(s, "/");
    }
    if job.mode == CalculationMode::VcRelax {
        let _ = writeln!(s, "&CELL");
        let _ = writeln!(s, "  cell_dynamics = 'bfgs'");
        let _ = writeln!(s, "  press = 0.0");
        let _ = writeln!(s, "  press_conv_thr = 0.5");
        let _ = writeln!(s, "/");
    }

    let _ = writeln!(s, "ATOMIC_SPECIES");
    for element in &species {
        let file = job
            .pseudopotentials
            .get(element)
            .ok_or_else(|| EngineError::UnmappedElement(element.clone()))?;
        let _ = writeln!(s, "  {}  {}  {}", element, atomic_mass(element), file);
    }

    let _ = writeln!(s, "CELL_PARAMETERS angstrom");
    for i in 0..3 {
        let row = structure.cell.row(i);
        let _ = writeln!(s, "  {:.10}  {:.10}  {:.10}", row[0], row[1], row[2]);
    }

    let _ = writeln!(s, "ATOMIC_POSITIONS angstrom");
    for i in 0..structure.num_atoms() {
        let p = structure.positions[i];
        if structure.fixed[i] {
            let _ = writeln!(
                s,
                "  {}  {:.10}  {:.10}  {:.10}  0 0 0",
                structure.elements[i], p.x, p.y, p.z
            );
        } else {
            let _ = writeln!(
                s,
                "  {}  {:.10}  {:.10}  {:.10}",
                structure.elements[i], p.x, p.y, p.z
            );
        }
    }

    match job.kpts {
        KpointSpec::Automatic(k1, k2, k3) => {
            let _ = writeln!(s, "K_POINTS automatic");
            let _ = writeln!(s, "  {} {} {} 0 0 0", k1, k2, k3);
        }
        KpointSpec::Gamma => {
            let _ = writeln!(s, "K_POINTS gamma");
        }
    }

    fs::write(path, s)?;
    Ok(())
}

/// Parses a `pw.x` output.
///
/// Extracts the last `!    total energy` line (converted Ry to eV) and,
/// for relaxation modes, the structure from the `Begin final coordinates`
/// block. `Scf` jobs return the input structure unchanged. Non-convergence
/// and truncated output are reported as errors, never silently accepted.
pub fn parse_output(
    content: &str,
    input: &Structure,
    mode: CalculationMode,
) -> Result<Relaxation> {
    if content.contains("convergence NOT achieved") {
        return Err(EngineError::Unconverged);
    }
    if !content.contains("JOB DONE.") {
        return Err(EngineError::EngineFailure(
            "engine output ended without JOB DONE marker".to_string(),
        ));
    }

    let mut energy_ry: Option<f64> = None;
    for line in content.lines() {
        if let Some(caps) = ENERGY_RE.captures(line) {
            energy_ry = caps[1].replace(['d', 'D'], "e").parse::<f64>().ok();
        }
    }
    let energy_ry =
        energy_ry.ok_or_else(|| EngineError::Parse("no total energy line found".to_string()))?;

    let structure = if mode == CalculationMode::Scf {
        input.clone()
    } else {
        parse_final_coordinates(content, input)?
    };

    Ok(Relaxation {
        energy: energy_ry * RY_TO_EV,
        structure,
    })
}

/// Parses the `Begin/End final coordinates` block of a relaxation output.
fn parse_final_coordinates(content: &str, input: &Structure) -> Result<Structure> {
    let mut in_block = false;
    let mut in_cell = false;
    let mut in_positions = false;
    let mut cell_rows: Vec<[f64; 3]> = Vec::new();
    let mut elements: Vec<String> = Vec::new();
    let mut positions: Vec<Vector3<f64>> = Vec::new();

    for line in content.lines() {
        if line.contains("Begin final coordinates") {
            in_block = true;
            continue;
        }
        if line.contains("End final coordinates") {
            break;
        }
        if !in_block {
            continue;
        }
        if line.contains("CELL_PARAMETERS") {
            in_cell = true;
            in_positions = false;
            continue;
        }
        if line.contains("ATOMIC_POSITIONS") {
            in_positions = true;
            in_cell = false;
            continue;
        }
        if in_cell && cell_rows.len() < 3 {
            if let Some(caps) = CELL_ROW_RE.captures(line) {
                cell_rows.push([
                    caps[1].parse().unwrap_or(0.0),
                    caps[2].parse().unwrap_or(0.0),
                    caps[3].parse().unwrap_or(0.0),
                ]);
            }
        } else if in_positions {
            if let Some(caps) = POSITION_RE.captures(line) {
                elements.push(caps[1].to_string());
                positions.push(Vector3::new(
                    caps[2].parse().unwrap_or(0.0),
                    caps[3].parse().unwrap_or(0.0),
                    caps[4].parse().unwrap_or(0.0),
                ));
            }
        }
    }

    if positions.is_empty() {
        return Err(EngineError::Parse(
            "no final coordinates block in relaxation output".to_string(),
        ));
    }
    if positions.len() != input.num_atoms() {
        return Err(EngineError::Parse(format!(
            "final coordinates have {} atoms, input had {}",
            positions.len(),
            input.num_atoms()
        )));
    }

    let cell = if cell_rows.len() == 3 {
        Matrix3::from_rows(&[
            Vector3::from_row_slice(&cell_rows[0]).transpose(),
            Vector3::from_row_slice(&cell_rows[1]).transpose(),
            Vector3::from_row_slice(&cell_rows[2]).transpose(),
        ])
    } else {
        input.cell
    };

    let mut out = Structure::new(elements, positions, cell);
    out.fixed = input.fixed.clone();
    Ok(out)
}

/// Standard atomic mass (amu) for the elements the workflow handles.
///
/// Unknown elements fall back to 1.0 with a warning; the mass only affects
/// fictitious dynamics, not the relaxed result.
pub fn atomic_mass(element: &str) -> f64 {
    match element {
        "H" => 1.008,
        "C" => 12.011,
        "N" => 14.007,
        "O" => 15.999,
        "Al" => 26.982,
        "Fe" => 55.845,
        "Ni" => 58.693,
        "Cu" => 63.546,
        "Zn" => 65.38,
        "Pd" => 106.42,
        "Ag" => 107.868,
        "Pt" => 195.084,
        "Au" => 196.967,
        _ => {
            warn!("no tabulated mass for {}, using 1.0", element);
            1.0
        }
    }
}

use adsorb::config::{RetryPolicy, RunnerConfig};
use adsorb::engine::{
    parse_output, write_input, CalculationMode, EngineError, EspressoEngine, KpointSpec,
    RelaxationJob, RY_TO_EV,
};
use adsorb::structure::{CrystalFamily, Structure};
use approx::assert_relative_eq;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;

fn cu_job(mode: CalculationMode, pseudo_dir: PathBuf) -> RelaxationJob {
    let mut pseudopotentials = BTreeMap::new();
    pseudopotentials.insert("Cu".to_string(), "Cu.pbe-dn-kjpaw_psl.1.0.0.UPF".to_string());
    RelaxationJob {
        mode,
        prefix: "bulk".to_string(),
        forc_conv_thr: 0.001,
        max_ionic_steps: 0,
        ecutwfc: 50.0,
        ecutrho: 500.0,
        smearing: true,
        degauss: 0.1,
        functional: None,
        kpts: KpointSpec::Automatic(4, 4, 4),
        pseudopotentials,
        pseudo_dir,
    }
}

#[test]
fn input_file_contains_all_cards() {
    let dir = tempdir().unwrap();
    let bulk = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let job = cu_job(CalculationMode::VcRelax, dir.path().to_path_buf());

    let path = dir.path().join("bulk.pwi");
    write_input(&bulk, &job, &path).unwrap();
    let content = fs::read_to_string(&path).unwrap();

    assert!(content.contains("calculation = 'vc-relax'"));
    assert!(content.contains("forc_conv_thr = 0.001"));
    assert!(content.contains("tstress = .true."));
    assert!(content.contains("tprnfor = .true."));
    assert!(content.contains("nat = 4"));
    assert!(content.contains("ntyp = 1"));
    assert!(content.contains("occupations = 'smearing'"));
    assert!(content.contains("degauss = 0.1"));
    assert!(content.contains("ion_dynamics = 'bfgs'"));
    assert!(content.contains("cell_dynamics = 'bfgs'"));
    assert!(content.contains("press_conv_thr = 0.5"));
    assert!(content.contains("Cu  63.546  Cu.pbe-dn-kjpaw_psl.1.0.0.UPF"));
    assert!(content.contains("K_POINTS automatic"));
    assert!(content.contains("  4 4 4 0 0 0"));
    // pw.x requires the namelists in order, ELECTRONS included even if empty
    assert!(content.contains("&ELECTRONS\n/\n"));
    let system = content.find("&SYSTEM").unwrap();
    let electrons = content.find("&ELECTRONS").unwrap();
    let ions = content.find("&IONS").unwrap();
    assert!(system < electrons && electrons < ions);
    // Four position lines, none fixed
    let positions: Vec<&str> = content
        .lines()
        .skip_while(|l| !l.starts_with("ATOMIC_POSITIONS"))
        .skip(1)
        .take_while(|l| l.trim_start().starts_with("Cu"))
        .collect();
    assert_eq!(positions.len(), 4);
    assert!(positions.iter().all(|l| !l.ends_with("0 0 0")));
}

#[test]
fn fixed_atoms_get_zeroed_force_multipliers() {
    let dir = tempdir().unwrap();
    let mut slab = Structure::fcc111("Cu", 3.6, (2, 2), 3, 7.5);
    slab.fix_bottom_layers(1);
    let job = cu_job(CalculationMode::Relax, dir.path().to_path_buf());

    let path = dir.path().join("slab.pwi");
    write_input(&slab, &job, &path).unwrap();
    let content = fs::read_to_string(&path).unwrap();

    assert!(!content.contains("&CELL"));
    let frozen = content
        .lines()
        .filter(|l| l.trim_start().starts_with("Cu") && l.ends_with("0 0 0"))
        .count();
    assert_eq!(frozen, 4);
}

#[test]
fn gamma_sampling_for_molecules() {
    let dir = tempdir().unwrap();
    let mol = Structure::molecule("CO2").unwrap().centered_in_box(7.5);
    let mut pseudopotentials = BTreeMap::new();
    pseudopotentials.insert("C".to_string(), "C.UPF".to_string());
    pseudopotentials.insert("O".to_string(), "O.UPF".to_string());
    let mut job = cu_job(CalculationMode::Relax, dir.path().to_path_buf());
    job.pseudopotentials = pseudopotentials;
    job.kpts = KpointSpec::Gamma;
    job.smearing = false;

    let path = dir.path().join("ads.pwi");
    write_input(&mol, &job, &path).unwrap();
    let content = fs::read_to_string(&path).unwrap();

    assert!(content.contains("K_POINTS gamma"));
    assert!(!content.contains("occupations"));
    assert!(content.contains("ntyp = 2"));
}

const VC_RELAX_OUTPUT: &str = r#"
     Program PWSCF v.7.2 starts on 23Aug2026

!    total energy              =    -546.99000000 Ry

     BFGS Geometry Optimization

!    total energy              =    -547.12345678 Ry

Begin final coordinates
     new unit-cell volume =    323.15 a.u.^3

CELL_PARAMETERS (angstrom)
   3.6300000000   0.0000000000   0.0000000000
   0.0000000000   3.6300000000   0.0000000000
   0.0000000000   0.0000000000   3.6300000000

ATOMIC_POSITIONS (angstrom)
Cu   0.0000000000   0.0000000000   0.0000000000
Cu   0.0000000000   1.8150000000   1.8150000000
Cu   1.8150000000   0.0000000000   1.8150000000
Cu   1.8150000000   1.8150000000   0.0000000000
End final coordinates

     JOB DONE.
"#;

#[test]
fn parses_final_energy_and_relaxed_cell() {
    let input = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let result = parse_output(VC_RELAX_OUTPUT, &input, CalculationMode::VcRelax).unwrap();

    // The *last* total-energy line wins
    assert_relative_eq!(result.energy, -547.12345678 * RY_TO_EV, epsilon = 1e-9);
    assert_eq!(result.structure.num_atoms(), 4);
    assert_relative_eq!(result.structure.cell[(0, 0)], 3.63, epsilon = 1e-9);
    assert_relative_eq!(result.structure.positions[1].y, 1.815, epsilon = 1e-9);
}

#[test]
fn scf_output_keeps_the_input_structure() {
    let input = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let output = "!    total energy = -100.0 Ry\n     JOB DONE.\n";
    let result = parse_output(output, &input, CalculationMode::Scf).unwrap();
    assert_eq!(result.structure, input);
    assert_relative_eq!(result.energy, -100.0 * RY_TO_EV, epsilon = 1e-9);
}

#[test]
fn nonconvergence_is_a_typed_error() {
    let input = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let output = "     convergence NOT achieved after 100 iterations: stopping\n";
    assert!(matches!(
        parse_output(output, &input, CalculationMode::Relax),
        Err(EngineError::Unconverged)
    ));
}

#[test]
fn truncated_output_is_an_engine_failure() {
    let input = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let output = "!    total energy = -100.0 Ry\n";
    assert!(matches!(
        parse_output(output, &input, CalculationMode::Relax),
        Err(EngineError::EngineFailure(_))
    ));
}

#[test]
fn missing_pseudopotential_fails_before_the_engine_runs() {
    use adsorb::engine::Engine;

    let work = tempdir().unwrap();
    let pseudos = tempdir().unwrap();
    // Only the Cu file exists on disk
    fs::write(pseudos.path().join("Cu.pbe-dn-kjpaw_psl.1.0.0.UPF"), b"").unwrap();

    let mut config = RunnerConfig::new(work.path(), pseudos.path());
    // A command that cannot exist: if the check did not come first, the
    // error would be Io, not MissingPseudopotential
    config.engine_command = "/nonexistent/pw.x".to_string();
    config.timeout = Some(Duration::from_secs(1));
    config.retry = RetryPolicy {
        max_attempts: 1,
        initial_backoff: Duration::from_millis(1),
    };
    let engine = EspressoEngine::new(&config);

    let mut job = cu_job(CalculationMode::Relax, pseudos.path().to_path_buf());
    job.pseudopotentials
        .insert("O".to_string(), "O.pbe-n-kjpaw_psl.1.0.0.UPF".to_string());

    // Cu alone passes the check and reaches the (unspawnable) engine
    let bulk = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    assert!(matches!(
        engine.relax(&bulk, &job, work.path()),
        Err(EngineError::Io(_))
    ));

    // A structure containing O fails fast on the absent file
    let o2 = Structure::molecule("O2").unwrap().centered_in_box(7.5);
    assert!(matches!(
        engine.relax(&o2, &job, work.path()),
        Err(EngineError::MissingPseudopotential { .. })
    ));

    // An element with no mapping at all is its own error
    let n2 = Structure::molecule("N2").unwrap().centered_in_box(7.5);
    assert!(matches!(
        engine.relax(&n2, &job, work.path()),
        Err(EngineError::UnmappedElement(_))
    ));
}

/// Writes a stand-in engine executable and returns its path as a command.
#[cfg(unix)]
fn fake_engine(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake_pw.sh");
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[cfg(unix)]
fn engine_with_script(work: &Path, pseudos: &Path, body: &str, attempts: u32) -> EspressoEngine {
    fs::write(pseudos.join("Cu.pbe-dn-kjpaw_psl.1.0.0.UPF"), b"").unwrap();
    let mut config = RunnerConfig::new(work, pseudos);
    config.engine_command = fake_engine(work, body);
    config.retry = RetryPolicy {
        max_attempts: attempts,
        initial_backoff: Duration::from_millis(1),
    };
    EspressoEngine::new(&config)
}

#[cfg(unix)]
fn attempt_count(work: &Path) -> usize {
    fs::read_to_string(work.join("attempts.txt")).unwrap().lines().count()
}

#[cfg(unix)]
#[test]
fn abnormal_exits_are_retried_up_to_the_attempt_limit() {
    use adsorb::engine::Engine;

    let work = tempdir().unwrap();
    let pseudos = tempdir().unwrap();
    let engine = engine_with_script(
        work.path(),
        pseudos.path(),
        "#!/bin/sh\necho run >> attempts.txt\nexit 1\n",
        3,
    );

    let bulk = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let job = cu_job(CalculationMode::Relax, pseudos.path().to_path_buf());
    assert!(matches!(
        engine.relax(&bulk, &job, work.path()),
        Err(EngineError::EngineFailure(_))
    ));
    assert_eq!(attempt_count(work.path()), 3);
}

#[cfg(unix)]
#[test]
fn truncated_output_from_a_clean_exit_is_also_retried() {
    use adsorb::engine::Engine;

    let work = tempdir().unwrap();
    let pseudos = tempdir().unwrap();
    // Exits zero but never prints the completion marker
    let engine = engine_with_script(
        work.path(),
        pseudos.path(),
        "#!/bin/sh\necho run >> attempts.txt\necho '!    total energy = -100.0 Ry'\nexit 0\n",
        2,
    );

    let bulk = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let job = cu_job(CalculationMode::Relax, pseudos.path().to_path_buf());
    assert!(matches!(
        engine.relax(&bulk, &job, work.path()),
        Err(EngineError::EngineFailure(_))
    ));
    assert_eq!(attempt_count(work.path()), 2);
}

#[cfg(unix)]
#[test]
fn nonconvergence_is_not_retried() {
    use adsorb::engine::Engine;

    let work = tempdir().unwrap();
    let pseudos = tempdir().unwrap();
    let engine = engine_with_script(
        work.path(),
        pseudos.path(),
        "#!/bin/sh\necho run >> attempts.txt\necho ' convergence NOT achieved after 100 iterations: stopping'\nexit 0\n",
        3,
    );

    let bulk = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let job = cu_job(CalculationMode::Relax, pseudos.path().to_path_buf());
    assert!(matches!(
        engine.relax(&bulk, &job, work.path()),
        Err(EngineError::Unconverged)
    ));
    assert_eq!(attempt_count(work.path()), 1);
}

#[cfg(unix)]
#[test]
fn a_hung_engine_is_killed_at_the_timeout() {
    use adsorb::engine::Engine;

    let work = tempdir().unwrap();
    let pseudos = tempdir().unwrap();
    let mut engine = engine_with_script(work.path(), pseudos.path(), "#!/bin/sh\nsleep 30\n", 1);
    engine.timeout = Some(Duration::from_millis(50));

    let bulk = Structure::bulk("Cu", CrystalFamily::Fcc, 3.6);
    let job = cu_job(CalculationMode::Relax, pseudos.path().to_path_buf());
    assert!(matches!(
        engine.relax(&bulk, &job, work.path()),
        Err(EngineError::Timeout(_))
    ));
}

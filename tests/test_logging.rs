use adsorb::logging::rotate_log_file;
use std::fs;
use tempfile::tempdir;

#[test]
fn rotation_renames_the_previous_log() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("DFT_ADSORPTION.log");
    let old = dir.path().join("DFT_ADSORPTION.log.old");

    // Nothing to rotate on the first run
    assert!(!rotate_log_file(&log).unwrap());

    fs::write(&log, "run 1\n").unwrap();
    assert!(rotate_log_file(&log).unwrap());
    assert!(!log.exists());
    assert_eq!(fs::read_to_string(&old).unwrap(), "run 1\n");
}

#[test]
fn a_third_run_loses_the_first_runs_log() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("DFT_ADSORPTION.log");
    let old = dir.path().join("DFT_ADSORPTION.log.old");

    fs::write(&log, "run 1\n").unwrap();
    rotate_log_file(&log).unwrap();
    fs::write(&log, "run 2\n").unwrap();
    rotate_log_file(&log).unwrap();
    fs::write(&log, "run 3\n").unwrap();

    // Single-slot rotation: run 1 is gone, run 2 occupies the .old slot
    assert_eq!(fs::read_to_string(&old).unwrap(), "run 2\n");
    assert_eq!(fs::read_to_string(&log).unwrap(), "run 3\n");
}

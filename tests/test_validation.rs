use adsorb::validation::{preflight, ErrorCategory};
use adsorb::{RunnerConfig, Settings};
use std::fs;
use tempfile::tempdir;

fn config_with_default_pseudos() -> (tempfile::TempDir, RunnerConfig) {
    let dir = tempdir().unwrap();
    let settings = Settings::default();
    for file in settings.pseudopotentials.values() {
        fs::write(dir.path().join(file), b"").unwrap();
    }
    let config = RunnerConfig::new(dir.path(), dir.path());
    (dir, config)
}

#[test]
fn default_settings_pass_preflight() {
    let (_dir, config) = config_with_default_pseudos();
    preflight(&Settings::default(), &config).unwrap();
}

#[test]
fn absent_pseudopotential_file_is_caught() {
    let (dir, config) = config_with_default_pseudos();
    let settings = Settings::default();
    fs::remove_file(dir.path().join(&settings.pseudopotentials["O"])).unwrap();

    let err = preflight(&settings, &config).unwrap_err();
    assert_eq!(err.category, ErrorCategory::MissingPseudopotential);
    assert!(err.message.contains("O"));
    assert!(err.suggestion.is_some());
}

#[test]
fn unmapped_adsorbate_element_is_caught() {
    let (_dir, config) = config_with_default_pseudos();
    let mut settings = Settings::default();
    settings.pseudopotentials.remove("C");

    let err = preflight(&settings, &config).unwrap_err();
    assert_eq!(err.category, ErrorCategory::MissingPseudopotential);
    assert!(err.message.contains("C"));
}

#[test]
fn unsupported_adsorbate_is_caught() {
    let (_dir, config) = config_with_default_pseudos();
    let mut settings = Settings::default();
    settings.adsorbate = "C6H6".to_string();

    let err = preflight(&settings, &config).unwrap_err();
    assert_eq!(err.category, ErrorCategory::UnsupportedSystem);
}

#[test]
fn nonsensical_parameters_are_caught() {
    let (_dir, config) = config_with_default_pseudos();

    let mut settings = Settings::default();
    settings.ecutrho = 10.0;
    let err = preflight(&settings, &config).unwrap_err();
    assert_eq!(err.category, ErrorCategory::InvalidParameter);

    let mut settings = Settings::default();
    settings.kpts_slab = (4, 0, 1);
    assert!(preflight(&settings, &config).is_err());

    let mut settings = Settings::default();
    settings.slab_fixed_layers = 4;
    assert!(preflight(&settings, &config).is_err());

    let mut settings = Settings::default();
    settings.lattice_constant_guess = -1.0;
    assert!(preflight(&settings, &config).is_err());
}

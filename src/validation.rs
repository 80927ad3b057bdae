//! Preflight validation of settings and runner configuration.
//!
//! The original driver performed no validation at all: a missing
//! pseudopotential or a nonsensical cutoff surfaced hours later as an
//! engine crash. Here every check runs before the first stage, with error
//! messages that say what is wrong and how to fix it.

use crate::config::RunnerConfig;
use crate::settings::Settings;
use crate::structure::Structure;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error with user guidance.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Error category for programmatic handling
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
}

/// Categories of validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A required pseudopotential file or mapping is missing
    MissingPseudopotential,
    /// A numerical parameter is outside its physically sensible range
    InvalidParameter,
    /// The requested adsorbate or geometry is not supported
    UnsupportedSystem,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            suggestion: None,
        }
    }

    fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Validates the full run before any stage executes.
///
/// Checks, in order: numerical parameters, adsorbate support, and the
/// presence of a pseudopotential file for every element that will appear
/// in any structure of the run (the metal plus all adsorbate elements).
pub fn preflight(settings: &Settings, config: &RunnerConfig) -> ValidationResult<()> {
    validate_parameters(settings)?;
    let adsorbate = validate_adsorbate(settings)?;
    validate_pseudopotentials(settings, config, &adsorbate)?;
    Ok(())
}

fn validate_parameters(settings: &Settings) -> ValidationResult<()> {
    if settings.lattice_constant_guess <= 0.0 {
        return Err(ValidationError::new(
            ErrorCategory::InvalidParameter,
            format!(
                "lattice constant guess must be positive, got {}",
                settings.lattice_constant_guess
            ),
        ));
    }
    if settings.ecutwfc <= 0.0 {
        return Err(ValidationError::new(
            ErrorCategory::InvalidParameter,
            format!("ecutwfc must be positive, got {}", settings.ecutwfc),
        ));
    }
    if settings.ecutrho < settings.ecutwfc {
        return Err(ValidationError::new(
            ErrorCategory::InvalidParameter,
            format!(
                "ecutrho ({}) must be at least ecutwfc ({})",
                settings.ecutrho, settings.ecutwfc
            ),
        )
        .suggest("PAW pseudopotentials typically need ecutrho around 8-12x ecutwfc"));
    }
    for (label, kpts) in [("kpts_bulk", settings.kpts_bulk), ("kpts_slab", settings.kpts_slab)] {
        if kpts.0 == 0 || kpts.1 == 0 || kpts.2 == 0 {
            return Err(ValidationError::new(
                ErrorCategory::InvalidParameter,
                format!("{} has a zero component: {:?}", label, kpts),
            ));
        }
    }
    if let Some(kpts) = settings.kpts_ads {
        if kpts.0 == 0 || kpts.1 == 0 || kpts.2 == 0 {
            return Err(ValidationError::new(
                ErrorCategory::InvalidParameter,
                format!("kpts_ads has a zero component: {:?}", kpts),
            )
            .suggest("omit kpts_ads entirely for gamma-point sampling"));
        }
    }
    if settings.forc_conv_thr <= 0.0 {
        return Err(ValidationError::new(
            ErrorCategory::InvalidParameter,
            format!("forc_conv_thr must be positive, got {}", settings.forc_conv_thr),
        ));
    }
    if settings.vacuum_ads < 0.0 {
        return Err(ValidationError::new(
            ErrorCategory::InvalidParameter,
            format!("vacuum spacing must be nonnegative, got {}", settings.vacuum_ads),
        ));
    }
    if settings.slab_layers == 0 || settings.slab_size.0 == 0 || settings.slab_size.1 == 0 {
        return Err(ValidationError::new(
            ErrorCategory::InvalidParameter,
            "slab must have at least one layer and a nonzero lateral size",
        ));
    }
    if settings.slab_fixed_layers >= settings.slab_layers {
        return Err(ValidationError::new(
            ErrorCategory::InvalidParameter,
            format!(
                "cannot fix {} of {} slab layers; at least one layer must relax",
                settings.slab_fixed_layers, settings.slab_layers
            ),
        ));
    }
    Ok(())
}

fn validate_adsorbate(settings: &Settings) -> ValidationResult<Structure> {
    Structure::molecule(&settings.adsorbate).map_err(|e| {
        ValidationError::new(ErrorCategory::UnsupportedSystem, e.to_string())
            .suggest("add a reference geometry for the adsorbate or pick a supported one")
    })
}

fn validate_pseudopotentials(
    settings: &Settings,
    config: &RunnerConfig,
    adsorbate: &Structure,
) -> ValidationResult<()> {
    let mut elements = vec![settings.metal.clone()];
    for el in adsorbate.unique_species() {
        if !elements.contains(&el) {
            elements.push(el);
        }
    }
    for element in elements {
        let file = settings.pseudopotentials.get(&element).ok_or_else(|| {
            ValidationError::new(
                ErrorCategory::MissingPseudopotential,
                format!("no pseudopotential mapped for element {}", element),
            )
            .suggest(format!(
                "add a '{}' entry to the pseudopotentials map in the settings",
                element
            ))
        })?;
        let path = config.pseudo_dir.join(file);
        if !path.is_file() {
            return Err(ValidationError::new(
                ErrorCategory::MissingPseudopotential,
                format!(
                    "pseudopotential file for {} not found: {}",
                    element,
                    path.display()
                ),
            )
            .suggest(format!(
                "download {} into {} or point ESPRESSO_PSEUDO_DIR elsewhere",
                file,
                config.pseudo_dir.display()
            )));
        }
    }
    Ok(())
}

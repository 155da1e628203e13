//! Configuration validation system.

use std::collections::HashSet;

use super::types::DataplaneConfig;

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// Error message.
    pub message: String,
    /// Severity level.
    pub severity: ValidationSeverity,
}

impl ValidationError {
    /// Create a new error.
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    /// Create a new warning.
    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

/// Severity of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Error - configuration is invalid.
    Error,
    /// Warning - configuration may have issues.
    Warning,
}

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a new empty (valid) result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error to the result.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Check if the validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .errors
            .iter()
            .any(|e| e.severity == ValidationSeverity::Error)
    }

    /// Get all validation errors.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Get only warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Warning)
            .collect()
    }
}

/// Trait for configuration validators.
pub trait Validator: std::fmt::Debug + Send + Sync {
    /// Validate a configuration and return any errors.
    fn validate(&self, config: &DataplaneConfig) -> ValidationResult;
}

/// Built-in validator for structural checks: names, references and ports.
#[derive(Debug, Default)]
pub struct BasicValidator;

impl BasicValidator {
    /// Create a new basic validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for BasicValidator {
    fn validate(&self, config: &DataplaneConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.engine.workers == 0 {
            result.add_error(ValidationError::error(
                "engine.workers",
                "Worker count cannot be 0",
            ));
        }
        if config.engine.lane_capacity == 0 {
            result.add_error(ValidationError::error(
                "engine.lane_capacity",
                "Lane capacity cannot be 0",
            ));
        }

        let mut vault_names = HashSet::new();
        for vault in &config.vaults {
            if vault.name.is_empty() {
                result.add_error(ValidationError::error(
                    "vaults[].name",
                    "Vault name cannot be empty",
                ));
            } else if !vault_names.insert(vault.name.as_str()) {
                result.add_error(ValidationError::error(
                    format!("vaults.{}", vault.name),
                    format!("Duplicate vault name: {}", vault.name),
                ));
            }
        }

        let mut binding_names = HashSet::new();
        for binding in &config.bindings {
            if binding.name.is_empty() {
                result.add_error(ValidationError::error(
                    "bindings[].name",
                    "Binding name cannot be empty",
                ));
            } else if !binding_names.insert(binding.name.as_str()) {
                result.add_error(ValidationError::error(
                    format!("bindings.{}", binding.name),
                    format!("Duplicate binding name: {}", binding.name),
                ));
            }

            if binding.binding_type.is_empty() {
                result.add_error(ValidationError::error(
                    format!("bindings.{}.type", binding.name),
                    "Binding type cannot be empty",
                ));
            }

            if let Some(vault) = &binding.vault {
                if config.vault(vault).is_none() {
                    result.add_error(ValidationError::error(
                        format!("bindings.{}.vault", binding.name),
                        format!("Unknown vault: {vault}"),
                    ));
                }
            }
        }

        for binding in &config.bindings {
            let exits = binding
                .routes
                .iter()
                .map(|r| &r.exit)
                .chain(binding.exit.iter());
            for exit in exits {
                if !binding_names.contains(exit.as_str()) {
                    result.add_error(ValidationError::error(
                        format!("bindings.{}.routes", binding.name),
                        format!("Route exit '{exit}' is not a binding"),
                    ));
                }
            }

            for (index, route) in binding.routes.iter().enumerate() {
                for condition in &route.when {
                    let Some(ports) = &condition.port else {
                        continue;
                    };
                    for spec in ports.specs() {
                        if let Err(e) = spec.bounds() {
                            result.add_error(ValidationError::error(
                                format!("bindings.{}.routes[{index}].when.port", binding.name),
                                e.to_string(),
                            ));
                        }
                    }
                }
                if route.when.is_empty() && index + 1 < binding.routes.len() {
                    result.add_error(ValidationError::warning(
                        format!("bindings.{}.routes[{index}]", binding.name),
                        "Unconditional route shadows the routes after it",
                    ));
                }
            }
        }

        result
    }
}

//! Configuration file loader.

use super::error::{ConfigError, ConfigResult};
use super::types::DataplaneConfig;
use super::validation::Validator;
use std::path::Path;
use tracing::warn;

/// Configuration loader with validation support.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Validators to run on loaded configuration.
    validators: Vec<Box<dyn Validator>>,
}

impl ConfigLoader {
    /// Create a new configuration loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validator to the loader.
    #[must_use]
    pub fn with_validator<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist
    /// - The file cannot be read
    /// - The TOML is malformed
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(&self, path: P) -> ConfigResult<DataplaneConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        self.load_str(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is malformed
    /// - Validation fails
    pub fn load_str(&self, content: &str) -> ConfigResult<DataplaneConfig> {
        let config: DataplaneConfig = toml::from_str(content)?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration against all registered validators.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] joining every error message
    /// of the first validator that fails.
    pub fn validate(&self, config: &DataplaneConfig) -> ConfigResult<()> {
        for validator in &self.validators {
            let result = validator.validate(config);
            for warning in result.warnings() {
                warn!(field = %warning.field, "{}", warning.message);
            }
            if !result.is_valid() {
                let errors: Vec<String> = result
                    .errors()
                    .iter()
                    .filter(|e| e.severity == super::validation::ValidationSeverity::Error)
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect();
                return Err(ConfigError::ValidationError(errors.join("; ")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BasicValidator;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
        [[bindings]]
        name = "net"
        type = "proxy"
        kind = "proxy"

        [[bindings.routes]]
        exit = "app"

        [[bindings]]
        name = "app"
        type = "echo"
    "#;

    #[test]
    fn test_load_from_string() {
        let loader = ConfigLoader::new().with_validator(BasicValidator::new());
        let config = loader.load_str(CONFIG).unwrap();
        assert_eq!(config.bindings.len(), 2);
        assert_eq!(config.bindings[0].routes[0].exit, "app");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("dataplane.toml");
        std::fs::write(&config_path, CONFIG).unwrap();

        let loader = ConfigLoader::new();
        let config = loader.load(&config_path).unwrap();
        assert!(config.binding("app").is_some());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let loader = ConfigLoader::new();
        let result = loader.load("/nonexistent/path/dataplane.toml");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_validation_failure() {
        let loader = ConfigLoader::new().with_validator(BasicValidator::new());
        let result = loader.load_str(
            r#"
            [[bindings]]
            name = "net"
            type = "proxy"

            [[bindings.routes]]
            exit = "missing"
            "#,
        );
        match result {
            Err(ConfigError::ValidationError(message)) => {
                assert!(message.contains("missing"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_toml() {
        let loader = ConfigLoader::new();
        assert!(matches!(
            loader.load_str("[[bindings]\nname ="),
            Err(ConfigError::ParseError(_))
        ));
    }
}

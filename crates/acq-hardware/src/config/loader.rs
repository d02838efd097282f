//! Settings file loading.
//!
//! # Usage
//!
//! ```rust,no_run
//! use acq_hardware::config::loader::load_settings;
//! use std::path::Path;
//!
//! let settings = load_settings(Path::new("config/acquisition.toml"))?;
//! # Ok::<(), acq_hardware::config::ConfigLoadError>(())
//! ```

use acq_core::{AcqError, Settings};
use std::path::Path;
use tracing::{debug, info};

/// Error types for settings loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Invalid TOML, a wrongly typed field or a bad environment override
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigLoadError> for AcqError {
    fn from(e: ConfigLoadError) -> Self {
        AcqError::Configuration(e.to_string())
    }
}

/// Load settings from a TOML file, apply `ACQ_*` environment overrides and
/// validate the result.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()));
    }

    debug!("Loading settings from: {}", path.display());
    let settings =
        Settings::load_from(path).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
    validate(&settings)?;

    info!(
        "Loaded settings from {} ({} configured devices)",
        path.display(),
        settings.devices.len()
    );
    Ok(settings)
}

/// Load settings from TOML text. Environment overrides are not applied.
pub fn load_settings_from_str(toml_content: &str) -> Result<Settings, ConfigLoadError> {
    let settings = Settings::from_toml_str(toml_content)
        .map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigLoadError> {
    settings.validate().map_err(|e| match e {
        AcqError::Configuration(msg) => ConfigLoadError::ValidationError(msg),
        other => ConfigLoadError::ValidationError(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_settings_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[decoder]
buffer_size = 512

[[devices]]
driver = "demo"
options = {{ num_logic_channels = 4 }}
"#
        )
        .unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.decoder.buffer_size, 512);
        assert_eq!(settings.devices.len(), 1);
        assert_eq!(settings.devices[0].driver, "demo");
        assert_eq!(settings.serial.default_serialcomm, "9600/8n1");
    }

    #[test]
    fn test_missing_file() {
        let err = load_settings(Path::new("/nonexistent/acquisition.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound(_)));
    }

    #[test]
    fn test_invalid_toml() {
        let err = load_settings_from_str("[decoder\nbuffer_size = ").unwrap_err();
        assert!(matches!(err, ConfigLoadError::ParseError(_)));

        let err = load_settings_from_str("[decoder]\nbuffer_size = \"big\"").unwrap_err();
        assert!(matches!(err, ConfigLoadError::ParseError(_)));
    }

    #[test]
    fn test_validation_failures() {
        let err = load_settings_from_str("[decoder]\nbuffer_size = 0").unwrap_err();
        assert!(matches!(err, ConfigLoadError::ValidationError(_)));

        let err = load_settings_from_str(
            r#"
[[devices]]
driver = "demo"
options = { no_such_key = 1 }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigLoadError::ValidationError(_)));

        let acq: AcqError = err.into();
        assert!(matches!(acq, AcqError::Configuration(_)));
    }
}

//! Runtime settings loaded with Figment.
//!
//! Settings come from a TOML file merged with `ACQ_`-prefixed environment
//! variables; nested keys are separated by a double underscore
//! (`ACQ_LOG__LEVEL=debug`, `ACQ_DECODER__BUFFER_SIZE=8192`).
//!
//! ```toml
//! [log]
//! level = "debug"
//! format = "compact"
//!
//! [decoder]
//! buffer_size = 4096
//!
//! [serial]
//! detect_timeout_ms = 1000
//! default_serialcomm = "9600/8n1"
//!
//! [[devices]]
//! driver = "demo"
//!
//! [[devices]]
//! driver = "serial-dmm"
//! options = { conn = "/dev/ttyUSB0", serialcomm = "19200/8n1" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigKey, ConfigValue, DataType};
use crate::error::{AcqError, AcqResult};
use crate::logging::{parse_level, OutputFormat};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ACQ_";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub decoder: DecoderSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogSettings {
    /// trace, debug, info, warn or error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecoderSettings {
    /// Capacity of each device's decode buffer, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialSettings {
    /// How long scan-time probing waits for a valid frame.
    #[serde(default = "default_detect_timeout")]
    pub detect_timeout_ms: u64,
    /// Used when a scan gives no `serialcomm` option.
    #[serde(default = "default_serialcomm")]
    pub default_serialcomm: String,
}

/// One device to scan for at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSpec {
    pub driver: String,
    /// Scan options keyed by config-key identifier (`conn`, `samplerate`).
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_buffer_size() -> usize {
    4096
}

fn default_detect_timeout() -> u64 {
    1000
}

fn default_serialcomm() -> String {
    "9600/8n1".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            detect_timeout_ms: default_detect_timeout(),
            default_serialcomm: default_serialcomm(),
        }
    }
}

impl Settings {
    /// Load from a TOML file plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Load from TOML text (no environment overrides).
    pub fn from_toml_str(text: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(text)).extract()
    }

    pub fn validate(&self) -> AcqResult<()> {
        parse_level(&self.log.level).map_err(AcqError::Configuration)?;
        self.log
            .format
            .parse::<OutputFormat>()
            .map_err(AcqError::Configuration)?;

        if self.decoder.buffer_size == 0 {
            return Err(AcqError::Configuration(
                "decoder.buffer_size must be greater than zero".to_string(),
            ));
        }

        for (i, device) in self.devices.iter().enumerate() {
            if device.driver.trim().is_empty() {
                return Err(AcqError::Configuration(format!(
                    "devices[{}] has an empty driver name",
                    i
                )));
            }
            device.scan_options().map_err(|e| {
                AcqError::Configuration(format!("devices[{}] ({}): {}", i, device.driver, e))
            })?;
        }
        Ok(())
    }
}

impl DeviceSpec {
    /// Typed scan options, each value parsed per its key's declared type.
    pub fn scan_options(&self) -> AcqResult<Vec<Config>> {
        self.options
            .iter()
            .map(|(id, value)| {
                let key = ConfigKey::from_id(id).ok_or_else(|| {
                    AcqError::Configuration(format!("unknown config key '{}'", id))
                })?;
                Ok(Config::new(key, toml_to_value(key, value)?))
            })
            .collect()
    }
}

fn toml_to_value(key: ConfigKey, value: &toml::Value) -> AcqResult<ConfigValue> {
    let datatype = key.datatype();
    let mismatch = || {
        AcqError::Configuration(format!(
            "'{}' expects {:?}, got {}",
            key,
            datatype,
            value.type_str()
        ))
    };

    match (datatype, value) {
        (_, toml::Value::String(text)) => ConfigValue::parse_as(datatype, text)
            .map_err(|e| AcqError::Configuration(format!("'{}': {}", key, e))),
        (DataType::UInt64, toml::Value::Integer(i)) => {
            u64::try_from(*i).map(ConfigValue::UInt64).map_err(|_| mismatch())
        }
        (DataType::Float, toml::Value::Integer(i)) => Ok(ConfigValue::Float(*i as f64)),
        (DataType::Float, toml::Value::Float(f)) => Ok(ConfigValue::Float(*f)),
        (DataType::Bool, toml::Value::Boolean(b)) => Ok(ConfigValue::Bool(*b)),
        (DataType::Rational, toml::Value::Array(items)) => match items.as_slice() {
            [toml::Value::Integer(n), toml::Value::Integer(d)] if *n >= 0 && *d > 0 => {
                Ok(ConfigValue::Rational(*n as u64, *d as u64))
            }
            _ => Err(mismatch()),
        },
        (DataType::UInt64List, toml::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                toml::Value::Integer(i) => u64::try_from(*i).map_err(|_| mismatch()),
                _ => Err(mismatch()),
            })
            .collect::<AcqResult<Vec<_>>>()
            .map(ConfigValue::UInt64List),
        (DataType::StringList, toml::Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(mismatch))
            .collect::<AcqResult<Vec<_>>>()
            .map(ConfigValue::Strings),
        _ => Err(mismatch()),
    }
}

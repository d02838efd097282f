//! Configuration keys and dynamically typed configuration values.
//!
//! A [`ConfigKey`] names one capability or option (sample rate, sample limit,
//! pattern mode, ...). Every key declares the [`DataType`] of the values it
//! accepts, and [`ConfigValue`] is the tagged union carrying such a value.
//! The same pair is used for scan options and for post-open configuration.
//!
//! Values are checked against the key's declared type at the API boundary
//! (see [`Config::check`]), so drivers can match on the variant they expect
//! without casting.
//!
//! Numeric identifiers are grouped by class:
//!
//! | Range | Class |
//! |-------|-------|
//! | 10000 | device classes (advertised in `DeviceOptions`) |
//! | 20000 | connection / scan options |
//! | 30000 | device configuration |
//! | 40000 | option lists |
//! | 50000 | acquisition limits and modes |

use crate::error::{AcqError, AcqResult};

// =============================================================================
// Keys
// =============================================================================

/// Declared value kind of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Key carries no value (device class markers).
    None,
    UInt64,
    String,
    Bool,
    Float,
    /// `(numerator, denominator)` pair.
    Rational,
    /// List of other keys (option lists).
    KeyList,
    StringList,
    UInt64List,
}

/// Enumerated capability / option identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ConfigKey {
    // Device classes
    LogicAnalyzer = 10001,
    Oscilloscope = 10002,
    Multimeter = 10003,
    DemoDevice = 10004,

    // Connection / scan
    Conn = 20000,
    SerialComm = 20001,
    NumLogicChannels = 20002,
    NumAnalogChannels = 20003,

    // Device configuration
    SampleRate = 30000,
    CaptureRatio = 30001,
    PatternMode = 30002,
    Rle = 30003,
    Amplitude = 30004,
    Timebase = 30005,
    TriggerSlope = 30006,
    BufferSize = 30007,

    // Option lists
    ScanOptions = 40000,
    DeviceOptions = 40001,

    // Limits and acquisition modes
    LimitMsec = 50000,
    LimitSamples = 50001,
    LimitFrames = 50002,
    Continuous = 50003,
}

/// Static description of a [`ConfigKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: ConfigKey,
    pub datatype: DataType,
    /// Short machine identifier, used in config files (`"samplerate"`).
    pub id: &'static str,
    /// Human readable name.
    pub name: &'static str,
}

const KEY_INFO: &[KeyInfo] = &[
    KeyInfo { key: ConfigKey::LogicAnalyzer, datatype: DataType::None, id: "logic_analyzer", name: "Logic analyzer" },
    KeyInfo { key: ConfigKey::Oscilloscope, datatype: DataType::None, id: "oscilloscope", name: "Oscilloscope" },
    KeyInfo { key: ConfigKey::Multimeter, datatype: DataType::None, id: "multimeter", name: "Multimeter" },
    KeyInfo { key: ConfigKey::DemoDevice, datatype: DataType::None, id: "demo", name: "Demo device" },
    KeyInfo { key: ConfigKey::Conn, datatype: DataType::String, id: "conn", name: "Connection" },
    KeyInfo { key: ConfigKey::SerialComm, datatype: DataType::String, id: "serialcomm", name: "Serial communication" },
    KeyInfo { key: ConfigKey::NumLogicChannels, datatype: DataType::UInt64, id: "num_logic_channels", name: "Number of logic channels" },
    KeyInfo { key: ConfigKey::NumAnalogChannels, datatype: DataType::UInt64, id: "num_analog_channels", name: "Number of analog channels" },
    KeyInfo { key: ConfigKey::SampleRate, datatype: DataType::UInt64, id: "samplerate", name: "Sample rate" },
    KeyInfo { key: ConfigKey::CaptureRatio, datatype: DataType::UInt64, id: "captureratio", name: "Pre-trigger capture ratio" },
    KeyInfo { key: ConfigKey::PatternMode, datatype: DataType::String, id: "pattern", name: "Pattern" },
    KeyInfo { key: ConfigKey::Rle, datatype: DataType::Bool, id: "rle", name: "Run length encoding" },
    KeyInfo { key: ConfigKey::Amplitude, datatype: DataType::Float, id: "amplitude", name: "Amplitude" },
    KeyInfo { key: ConfigKey::Timebase, datatype: DataType::Rational, id: "timebase", name: "Time base" },
    KeyInfo { key: ConfigKey::TriggerSlope, datatype: DataType::String, id: "triggerslope", name: "Trigger slope" },
    KeyInfo { key: ConfigKey::BufferSize, datatype: DataType::UInt64, id: "buffersize", name: "Buffer size" },
    KeyInfo { key: ConfigKey::ScanOptions, datatype: DataType::KeyList, id: "scan_options", name: "Scan options" },
    KeyInfo { key: ConfigKey::DeviceOptions, datatype: DataType::KeyList, id: "device_options", name: "Device options" },
    KeyInfo { key: ConfigKey::LimitMsec, datatype: DataType::UInt64, id: "limit_time", name: "Time limit" },
    KeyInfo { key: ConfigKey::LimitSamples, datatype: DataType::UInt64, id: "limit_samples", name: "Sample limit" },
    KeyInfo { key: ConfigKey::LimitFrames, datatype: DataType::UInt64, id: "limit_frames", name: "Frame limit" },
    KeyInfo { key: ConfigKey::Continuous, datatype: DataType::Bool, id: "continuous", name: "Continuous sampling" },
];

impl ConfigKey {
    /// Look up the static description of this key.
    pub fn info(self) -> KeyInfo {
        // KEY_INFO covers every variant; the fallback keeps this total.
        KEY_INFO
            .iter()
            .copied()
            .find(|info| info.key == self)
            .unwrap_or(KeyInfo {
                key: self,
                datatype: DataType::None,
                id: "unknown",
                name: "Unknown",
            })
    }

    pub fn datatype(self) -> DataType {
        self.info().datatype
    }

    /// Numeric identifier.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Resolve a key from its short identifier (`"samplerate"`).
    pub fn from_id(id: &str) -> Option<ConfigKey> {
        KEY_INFO.iter().find(|info| info.id == id).map(|info| info.key)
    }

    /// Resolve a key from its numeric identifier.
    pub fn from_code(code: u32) -> Option<ConfigKey> {
        KEY_INFO
            .iter()
            .find(|info| info.key.code() == code)
            .map(|info| info.key)
    }

    /// Every known key, in numeric order.
    pub fn all() -> impl Iterator<Item = ConfigKey> {
        KEY_INFO.iter().map(|info| info.key)
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.info().id)
    }
}

// =============================================================================
// Values
// =============================================================================

/// Dynamically typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    None,
    UInt64(u64),
    String(String),
    Bool(bool),
    Float(f64),
    Rational(u64, u64),
    Keys(Vec<ConfigKey>),
    Strings(Vec<String>),
    UInt64List(Vec<u64>),
}

impl ConfigValue {
    pub fn datatype(&self) -> DataType {
        match self {
            ConfigValue::None => DataType::None,
            ConfigValue::UInt64(_) => DataType::UInt64,
            ConfigValue::String(_) => DataType::String,
            ConfigValue::Bool(_) => DataType::Bool,
            ConfigValue::Float(_) => DataType::Float,
            ConfigValue::Rational(_, _) => DataType::Rational,
            ConfigValue::Keys(_) => DataType::KeyList,
            ConfigValue::Strings(_) => DataType::StringList,
            ConfigValue::UInt64List(_) => DataType::UInt64List,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse a textual value into the representation `datatype` declares.
    ///
    /// Unsigned integers accept size suffixes (`"200k"`), rationals accept
    /// `"n/d"`, lists are comma separated.
    pub fn parse_as(datatype: DataType, text: &str) -> AcqResult<ConfigValue> {
        let text = text.trim();
        match datatype {
            DataType::None => Ok(ConfigValue::None),
            DataType::UInt64 => parse_sizestring(text).map(ConfigValue::UInt64),
            DataType::String => Ok(ConfigValue::String(text.to_string())),
            DataType::Bool => parse_bool(text).map(ConfigValue::Bool),
            DataType::Float => text
                .parse::<f64>()
                .map(ConfigValue::Float)
                .map_err(|_| AcqError::arg(format!("'{}' is not a number", text))),
            DataType::Rational => {
                parse_rational(text).map(|(num, den)| ConfigValue::Rational(num, den))
            }
            DataType::KeyList => text
                .split(',')
                .map(|id| {
                    ConfigKey::from_id(id.trim())
                        .ok_or_else(|| AcqError::arg(format!("unknown config key '{}'", id.trim())))
                })
                .collect::<AcqResult<Vec<_>>>()
                .map(ConfigValue::Keys),
            DataType::StringList => Ok(ConfigValue::Strings(
                text.split(',').map(|s| s.trim().to_string()).collect(),
            )),
            DataType::UInt64List => text
                .split(',')
                .map(parse_sizestring)
                .collect::<AcqResult<Vec<_>>>()
                .map(ConfigValue::UInt64List),
        }
    }
}

/// A key paired with a value: the unit passed to scan and config calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub key: ConfigKey,
    pub value: ConfigValue,
}

impl Config {
    pub fn new(key: ConfigKey, value: ConfigValue) -> Self {
        Self { key, value }
    }

    /// Verify the value carries the type the key declares.
    pub fn check(&self) -> AcqResult<()> {
        check_type(self.key, &self.value)
    }
}

/// Verify `value` matches the declared type of `key`.
pub fn check_type(key: ConfigKey, value: &ConfigValue) -> AcqResult<()> {
    let expected = key.datatype();
    if value.datatype() == expected {
        Ok(())
    } else {
        Err(AcqError::arg(format!(
            "config key '{}' expects {:?}, got {:?}",
            key,
            expected,
            value.datatype()
        )))
    }
}

/// Find the value for `key` in an option list.
pub fn find_option(options: &[Config], key: ConfigKey) -> Option<&ConfigValue> {
    options.iter().find(|c| c.key == key).map(|c| &c.value)
}

// =============================================================================
// String helpers
// =============================================================================

const KHZ: u64 = 1_000;
const MHZ: u64 = 1_000_000;
const GHZ: u64 = 1_000_000_000;

/// Parse a size string such as `"200"`, `"200k"`, `"1.5M"` or `"2 G"`.
///
/// Suffixes are decimal (`k` = 1000). A fractional part is only allowed
/// together with a suffix and must resolve to a whole number.
pub fn parse_sizestring(text: &str) -> AcqResult<u64> {
    let text = text.trim();
    let invalid = || AcqError::arg(format!("invalid size '{}'", text));

    let numeric_end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, rest) = text.split_at(numeric_end);
    if number.is_empty() {
        return Err(invalid());
    }

    let multiplier = match rest.trim() {
        "" => 1,
        "k" | "K" => KHZ,
        "m" | "M" => MHZ,
        "g" | "G" => GHZ,
        _ => return Err(invalid()),
    };

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() || frac_part.contains('.') {
        return Err(invalid());
    }

    let int_value: u64 = int_part.parse().map_err(|_| invalid())?;
    let mut value = int_value.checked_mul(multiplier).ok_or_else(invalid)?;

    if !frac_part.is_empty() {
        let scale = 10u64
            .checked_pow(frac_part.len() as u32)
            .ok_or_else(invalid)?;
        let frac_value: u64 = frac_part.parse().map_err(|_| invalid())?;
        let scaled = frac_value.checked_mul(multiplier).ok_or_else(invalid)?;
        if scaled % scale != 0 {
            return Err(invalid());
        }
        value = value.checked_add(scaled / scale).ok_or_else(invalid)?;
    }

    Ok(value)
}

/// Render a sample rate using the largest exact unit (`"200 kHz"`).
pub fn samplerate_string(rate: u64) -> String {
    if rate >= GHZ && rate % GHZ == 0 {
        format!("{} GHz", rate / GHZ)
    } else if rate >= MHZ && rate % MHZ == 0 {
        format!("{} MHz", rate / MHZ)
    } else if rate >= KHZ && rate % KHZ == 0 {
        format!("{} kHz", rate / KHZ)
    } else {
        format!("{} Hz", rate)
    }
}

/// Parse `"n/d"` (or a bare `"n"`, meaning `n/1`).
pub fn parse_rational(text: &str) -> AcqResult<(u64, u64)> {
    let invalid = || AcqError::arg(format!("invalid rational '{}'", text));
    let (num, den) = match text.trim().split_once('/') {
        Some((n, d)) => (n.trim(), d.trim()),
        None => (text.trim(), "1"),
    };
    let num: u64 = num.parse().map_err(|_| invalid())?;
    let den: u64 = den.parse().map_err(|_| invalid())?;
    if den == 0 {
        return Err(invalid());
    }
    Ok((num, den))
}

fn parse_bool(text: &str) -> AcqResult<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AcqError::arg(format!("'{}' is not a boolean", text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_lookup() {
        assert_eq!(ConfigKey::from_id("samplerate"), Some(ConfigKey::SampleRate));
        assert_eq!(ConfigKey::from_code(50001), Some(ConfigKey::LimitSamples));
        assert_eq!(ConfigKey::from_id("nope"), None);
        assert_eq!(ConfigKey::SampleRate.datatype(), DataType::UInt64);
        assert_eq!(ConfigKey::Timebase.info().name, "Time base");
    }

    #[test]
    fn test_every_key_has_info() {
        for key in ConfigKey::all() {
            assert_ne!(key.info().id, "unknown");
        }
        assert_eq!(ConfigKey::all().count(), KEY_INFO.len());
    }

    #[test]
    fn test_type_check() {
        assert!(Config::new(ConfigKey::SampleRate, ConfigValue::UInt64(1)).check().is_ok());
        let err = Config::new(ConfigKey::SampleRate, ConfigValue::Bool(true))
            .check()
            .unwrap_err();
        assert!(matches!(err, AcqError::Arg(_)));
    }

    #[test]
    fn test_parse_sizestring() {
        assert_eq!(parse_sizestring("200").unwrap(), 200);
        assert_eq!(parse_sizestring("200k").unwrap(), 200_000);
        assert_eq!(parse_sizestring("1.5M").unwrap(), 1_500_000);
        assert_eq!(parse_sizestring("2 G").unwrap(), 2_000_000_000);
        assert!(parse_sizestring("").is_err());
        assert!(parse_sizestring("12x").is_err());
        assert!(parse_sizestring("1.0001k").is_err());
    }

    #[test]
    fn test_samplerate_string() {
        assert_eq!(samplerate_string(200_000), "200 kHz");
        assert_eq!(samplerate_string(1_000_000), "1 MHz");
        assert_eq!(samplerate_string(3_000_000_000), "3 GHz");
        assert_eq!(samplerate_string(1_500), "1500 Hz");
        assert_eq!(samplerate_string(0), "0 Hz");
    }

    #[test]
    fn test_parse_rational() {
        assert_eq!(parse_rational("1/1000").unwrap(), (1, 1000));
        assert_eq!(parse_rational("5").unwrap(), (5, 1));
        assert!(parse_rational("1/0").is_err());
    }

    #[test]
    fn test_parse_as() {
        assert_eq!(
            ConfigValue::parse_as(DataType::UInt64, "4k").unwrap(),
            ConfigValue::UInt64(4000)
        );
        assert_eq!(
            ConfigValue::parse_as(DataType::Bool, "on").unwrap(),
            ConfigValue::Bool(true)
        );
        assert_eq!(
            ConfigValue::parse_as(DataType::KeyList, "samplerate, limit_samples").unwrap(),
            ConfigValue::Keys(vec![ConfigKey::SampleRate, ConfigKey::LimitSamples])
        );
    }
}

//! Settings files.
//!
//! The settings schema lives in `acq_core::settings`; this module finds,
//! loads and validates files that follow it:
//!
//! ```toml
//! [log]
//! level = "debug"
//! format = "compact"
//!
//! [serial]
//! detect_timeout_ms = 2000
//!
//! [[devices]]
//! driver = "serial-dmm"
//! options = { conn = "/dev/ttyUSB0", serialcomm = "2400/8n1" }
//! ```
//!
//! Every field can be overridden from the environment with the `ACQ_`
//! prefix and `__` as the section separator, e.g. `ACQ_LOG__LEVEL=trace`.

pub mod loader;

pub use loader::{load_settings, load_settings_from_str, ConfigLoadError};

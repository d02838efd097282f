//! Hardware side of rust-acq: the serial transport, the built-in driver
//! registry, settings-file loading and the transport-backed drivers.
//!
//! - [`serial`]: `serialcomm` parsing, [`serial::SerialTransport`],
//!   connection strings and scan-time stream detection
//! - [`registry`]: the static driver list and the library [`Context`]
//! - [`config`]: loading and validating settings files
//! - [`drivers`]: instrument drivers

pub mod config;
pub mod drivers;
pub mod registry;
pub mod serial;

pub use config::{load_settings, load_settings_from_str, ConfigLoadError};
pub use registry::{driver_list, find_driver, Context};
pub use serial::{open_conn, stream_detect, SerialParams, SerialTransport};

//! Driver registry and library context.
//!
//! The set of drivers is fixed at build time. A [`Context`] initializes
//! every driver with the loaded settings, runs scans by driver name and
//! cleans all drivers up again when dropped.
//!
//! | Driver | Devices | Connection |
//! |--------|---------|------------|
//! | `demo` | Virtual logic/analog pattern generator | none |
//! | `serial-dmm` | Framed-binary multimeters | serial port or `tcp-raw/<host>/<port>` |
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use acq_core::{AcqResult, Settings};
//! use acq_hardware::registry::Context;
//!
//! fn main() -> AcqResult<()> {
//!     let ctx = Context::new(Settings::default())?;
//!     for device in ctx.scan("demo", &[])? {
//!         println!("found {:?}", device);
//!     }
//!     Ok(())
//! }
//! ```

use acq_core::driver::{self, Driver, DriverContext};
use acq_core::{AcqError, AcqResult, Config, Device, Settings};

use crate::drivers::serial_dmm;

static DRIVERS: &[&dyn Driver] = &[&acq_driver_demo::DRIVER, &serial_dmm::DRIVER];

/// Every driver built into the library.
pub fn driver_list() -> &'static [&'static dyn Driver] {
    DRIVERS
}

pub fn find_driver(name: &str) -> Option<&'static dyn Driver> {
    DRIVERS.iter().copied().find(|d| d.name() == name)
}

/// Initialized library instance.
///
/// Drivers are process-wide statics, so only one context should be alive
/// at a time.
#[derive(Debug)]
pub struct Context {
    settings: Settings,
}

impl Context {
    /// Validate `settings` and initialize every driver with them.
    pub fn new(settings: Settings) -> AcqResult<Self> {
        settings.validate()?;
        let driver_ctx = DriverContext::new(settings.clone());
        for driver in driver_list() {
            driver::driver_init(*driver, &driver_ctx)?;
        }
        tracing::info!(drivers = driver_list().len(), "Acquisition context initialized");
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn drivers(&self) -> &'static [&'static dyn Driver] {
        driver_list()
    }

    /// Scan with the named driver.
    pub fn scan(&self, driver_name: &str, options: &[Config]) -> AcqResult<Vec<Device>> {
        let driver = find_driver(driver_name)
            .ok_or_else(|| AcqError::arg(format!("unknown driver '{}'", driver_name)))?;
        driver::driver_scan(driver, options)
    }

    /// Scan for every device listed in the settings' `[[devices]]` tables.
    pub fn scan_configured(&self) -> AcqResult<Vec<Device>> {
        let mut found = Vec::new();
        for spec in &self.settings.devices {
            let driver = find_driver(&spec.driver).ok_or_else(|| {
                AcqError::Configuration(format!("unknown driver '{}'", spec.driver))
            })?;
            let options = spec.scan_options()?;
            let devices = driver::driver_scan(driver, &options)?;
            if devices.is_empty() {
                tracing::warn!(driver = %spec.driver, "Configured device not found");
            }
            found.extend(devices);
        }
        Ok(found)
    }

    /// Devices found by any scan so far, across all drivers.
    pub fn list_devices(&self) -> Vec<Device> {
        driver_list().iter().flat_map(|d| d.list()).collect()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for driver in driver_list() {
            if let Err(e) = driver.cleanup() {
                tracing::warn!(driver = driver.name(), error = %e, "Driver cleanup failed");
            }
        }
        tracing::debug!("Acquisition context released");
    }
}

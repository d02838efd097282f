//! Driver contract and the generic configuration entry points built on it.
//!
//! One [`Driver`] implementation exists per instrument family and lives in a
//! `static`; the process-wide list of linked drivers is read-only after
//! start-up. Configuration methods answer [`AcqError::NotApplicable`] for
//! keys they do not handle; that answer is a probe result, and the helpers in
//! this module pass it through untouched so generic callers can skip the key.
//!
//! The free functions (`config_get`, `config_set`, `driver_scan`, `open`, ...)
//! are what applications call. They check preconditions and value types at
//! the boundary before dispatching to the driver.

use crate::config::{check_type, Config, ConfigKey, ConfigValue};
use crate::device::{ChannelGroup, Device, DeviceInstance, DeviceStatus};
use crate::error::{AcqError, AcqResult};
use crate::session::Session;
use crate::settings::Settings;

/// Shared state handed to every driver's `init`.
#[derive(Debug, Clone, Default)]
pub struct DriverContext {
    pub settings: Settings,
}

impl DriverContext {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

/// Capability table of one instrument family.
///
/// Device-touching methods receive the instance already locked by the caller,
/// except `acquisition_start`/`acquisition_stop`, which receive the shared
/// handle because they register callbacks that outlive the call.
pub trait Driver: Send + Sync {
    /// Short identifier (`"demo"`, `"serial-dmm"`).
    fn name(&self) -> &'static str;

    fn long_name(&self) -> &'static str;

    /// One-time setup of driver-private registry state.
    fn init(&self, ctx: &DriverContext) -> AcqResult<()>;

    /// Release everything `init` and `scan` created.
    fn cleanup(&self) -> AcqResult<()> {
        self.clear()
    }

    /// Discover devices. Found devices are also kept in the driver's list.
    fn scan(&'static self, options: &[Config]) -> AcqResult<Vec<Device>>;

    /// Devices found by earlier scans.
    fn list(&self) -> Vec<Device>;

    /// Forget all scanned devices, closing any still open.
    fn clear(&self) -> AcqResult<()>;

    fn open(&self, sdi: &mut DeviceInstance) -> AcqResult<()>;

    fn close(&self, sdi: &mut DeviceInstance) -> AcqResult<()>;

    fn config_get(
        &self,
        _key: ConfigKey,
        _sdi: Option<&DeviceInstance>,
        _cg: Option<&ChannelGroup>,
    ) -> AcqResult<ConfigValue> {
        Err(AcqError::NotApplicable)
    }

    fn config_set(
        &self,
        _key: ConfigKey,
        _value: &ConfigValue,
        _sdi: &mut DeviceInstance,
        _cg: Option<&ChannelGroup>,
    ) -> AcqResult<()> {
        Err(AcqError::NotApplicable)
    }

    /// List possible values for `key`, or the supported keys when `key` is
    /// `ScanOptions`/`DeviceOptions`.
    fn config_list(
        &self,
        _key: ConfigKey,
        _sdi: Option<&DeviceInstance>,
        _cg: Option<&ChannelGroup>,
    ) -> AcqResult<ConfigValue> {
        Err(AcqError::NotApplicable)
    }

    /// Push pending configuration to the hardware.
    fn config_commit(&self, _sdi: &mut DeviceInstance) -> AcqResult<()> {
        Ok(())
    }

    /// Register event sources with `session` and send a header.
    fn acquisition_start(&self, device: &Device, session: &Session) -> AcqResult<()>;

    /// Remove this device's event sources and send an end packet.
    fn acquisition_stop(&self, device: &Device, session: &Session) -> AcqResult<()>;
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Driver({})", self.name())
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

pub fn driver_init(driver: &dyn Driver, ctx: &DriverContext) -> AcqResult<()> {
    tracing::debug!(driver = driver.name(), "Initializing driver");
    driver.init(ctx)
}

/// Scan with `driver` after validating `options` against its scan options.
pub fn driver_scan(driver: &'static dyn Driver, options: &[Config]) -> AcqResult<Vec<Device>> {
    let supported = keys_of(driver.config_list(ConfigKey::ScanOptions, None, None))?;
    for option in options {
        if !supported.contains(&option.key) {
            return Err(AcqError::arg(format!(
                "driver '{}' does not accept scan option '{}'",
                driver.name(),
                option.key
            )));
        }
        option.check()?;
    }

    let devices = driver.scan(options)?;
    tracing::info!(driver = driver.name(), found = devices.len(), "Scan complete");
    Ok(devices)
}

/// Open the device through its driver. Opening an active device is a no-op.
///
/// The driver sees `Initializing` while it opens; a failed open leaves the
/// device `Inactive`.
pub fn open(sdi: &mut DeviceInstance) -> AcqResult<()> {
    if sdi.status == DeviceStatus::Active {
        return Ok(());
    }
    let driver = sdi
        .driver()
        .ok_or_else(|| AcqError::arg(format!("{} is virtual and cannot be opened", sdi.id())))?;
    sdi.status = DeviceStatus::Initializing;
    if let Err(e) = driver.open(sdi) {
        sdi.status = DeviceStatus::Inactive;
        tracing::error!(device = %sdi.id(), driver = driver.name(), error = %e, "Failed to open device");
        return Err(e);
    }
    sdi.status = DeviceStatus::Active;
    tracing::debug!(device = %sdi.id(), driver = driver.name(), "Device opened");
    Ok(())
}

pub fn close(sdi: &mut DeviceInstance) -> AcqResult<()> {
    if sdi.status != DeviceStatus::Active {
        return Err(AcqError::DeviceClosed);
    }
    let driver = sdi
        .driver()
        .ok_or_else(|| AcqError::arg(format!("{} is virtual and cannot be closed", sdi.id())))?;
    let result = driver.close(sdi);
    sdi.status = DeviceStatus::Inactive;
    tracing::debug!(device = %sdi.id(), driver = driver.name(), "Device closed");
    result
}

// =============================================================================
// Configuration
// =============================================================================

fn keys_of(listed: AcqResult<ConfigValue>) -> AcqResult<Vec<ConfigKey>> {
    match listed {
        Ok(ConfigValue::Keys(keys)) => Ok(keys),
        Ok(other) => Err(AcqError::bug(format!(
            "option list returned {:?} instead of a key list",
            other.datatype()
        ))),
        Err(AcqError::NotApplicable) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Keys the driver advertises for this device / channel group.
pub fn device_options(
    driver: &dyn Driver,
    sdi: Option<&DeviceInstance>,
    cg: Option<&ChannelGroup>,
) -> AcqResult<Vec<ConfigKey>> {
    keys_of(driver.config_list(ConfigKey::DeviceOptions, sdi, cg))
}

/// Whether `key` is advertised in the driver's device options.
pub fn has_option(
    driver: &dyn Driver,
    sdi: Option<&DeviceInstance>,
    cg: Option<&ChannelGroup>,
    key: ConfigKey,
) -> bool {
    device_options(driver, sdi, cg)
        .map(|keys| keys.contains(&key))
        .unwrap_or(false)
}

/// Query a value.
///
/// Keys the driver does not advertise answer `NotApplicable`, whatever the
/// device state; a value of the wrong type from the driver is a bug.
pub fn config_get(
    driver: &dyn Driver,
    sdi: Option<&DeviceInstance>,
    cg: Option<&ChannelGroup>,
    key: ConfigKey,
) -> AcqResult<ConfigValue> {
    if !has_option(driver, sdi, cg, key) {
        return Err(AcqError::NotApplicable);
    }
    if let Some(sdi) = sdi {
        if sdi.status != DeviceStatus::Active {
            tracing::error!(device = %sdi.id(), %key, "Device instance not active, can't get config");
            return Err(AcqError::DeviceClosed);
        }
    }
    let value = driver.config_get(key, sdi, cg)?;
    check_type(key, &value).map_err(|_| {
        AcqError::bug(format!(
            "driver '{}' returned {:?} for '{}'",
            driver.name(),
            value.datatype(),
            key
        ))
    })?;
    tracing::trace!(driver = driver.name(), %key, ?value, "config_get");
    Ok(value)
}

/// Set a value on an open device.
///
/// Keys the driver does not advertise answer `NotApplicable`; a value whose
/// type differs from the key's declared type is an argument error.
pub fn config_set(
    sdi: &mut DeviceInstance,
    cg: Option<&ChannelGroup>,
    key: ConfigKey,
    value: ConfigValue,
) -> AcqResult<()> {
    let driver = sdi
        .driver()
        .ok_or_else(|| AcqError::arg(format!("{} has no driver", sdi.id())))?;
    if sdi.status != DeviceStatus::Active {
        tracing::error!(device = %sdi.id(), %key, "Device instance not active, can't set config");
        return Err(AcqError::DeviceClosed);
    }
    if !has_option(driver, Some(sdi), cg, key) {
        return Err(AcqError::NotApplicable);
    }
    check_type(key, &value)?;
    tracing::debug!(device = %sdi.id(), %key, ?value, "config_set");
    driver.config_set(key, &value, sdi, cg)
}

pub fn config_list(
    driver: &dyn Driver,
    sdi: Option<&DeviceInstance>,
    cg: Option<&ChannelGroup>,
    key: ConfigKey,
) -> AcqResult<ConfigValue> {
    driver.config_list(key, sdi, cg)
}

/// Apply pending settings. Virtual devices have nothing to commit.
pub fn config_commit(sdi: &mut DeviceInstance) -> AcqResult<()> {
    let Some(driver) = sdi.driver() else {
        return Ok(());
    };
    if sdi.status != DeviceStatus::Active {
        tracing::error!(device = %sdi.id(), "Device instance not active, can't commit config");
        return Err(AcqError::DeviceClosed);
    }
    driver.config_commit(sdi)
}

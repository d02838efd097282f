//! Device instances and their channels.
//!
//! A [`DeviceInstance`] is one connected instrument as the process sees it:
//! identity strings, a status, an optional transport, an ordered channel
//! list, driver-private state and a relation to at most one session.
//!
//! Instances are created by a driver's `scan` and shared through the
//! [`Device`] handle, which the driver's device list, the session and any
//! event-source callbacks all hold. The session relation is a plain
//! [`SessionId`] token: it never keeps a session alive and is cleared when
//! the device is removed.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::driver::Driver;
use crate::error::{AcqError, AcqResult};
use crate::transport::Transport;
use crate::trigger::TriggerMatchType;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    fn next() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Relation token naming the session a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session{}", self.0)
    }
}

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceStatus {
    #[default]
    Inactive,
    /// The driver's `open` is in progress.
    Initializing,
    Active,
    /// An acquisition is being torn down; back to `Active` before the end
    /// packet is sent.
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Logic,
    Analog,
}

/// One measured signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Stable index, unique within the device, never renumbered.
    pub index: usize,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub name: String,
    pub trigger: Option<TriggerMatchType>,
}

/// Named subset of a device's channels, addressed by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    pub name: String,
    pub channels: Vec<usize>,
}

impl ChannelGroup {
    pub fn new(name: &str, channels: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            channels,
        }
    }
}

// =============================================================================
// DeviceInstance
// =============================================================================

pub struct DeviceInstance {
    id: DeviceId,
    pub vendor: String,
    pub model: String,
    pub version: String,
    pub serial_num: Option<String>,
    pub connection_id: Option<String>,
    pub status: DeviceStatus,
    /// Transport handle; `None` for virtual devices.
    pub conn: Option<Box<dyn Transport>>,
    pub channel_groups: Vec<ChannelGroup>,
    channels: Vec<Channel>,
    driver_state: Option<Box<dyn Any + Send>>,
    driver: Option<&'static dyn Driver>,
    session: Option<SessionId>,
}

impl std::fmt::Debug for DeviceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("id", &self.id)
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .field("status", &self.status)
            .field("channels", &self.channels.len())
            .field("driver", &self.driver.map(|d| d.name()))
            .field("session", &self.session)
            .finish()
    }
}

impl DeviceInstance {
    pub fn new(vendor: &str, model: &str, version: &str) -> Self {
        Self {
            id: DeviceId::next(),
            vendor: vendor.to_string(),
            model: model.to_string(),
            version: version.to_string(),
            serial_num: None,
            connection_id: None,
            status: DeviceStatus::Inactive,
            conn: None,
            channel_groups: Vec::new(),
            channels: Vec::new(),
            driver_state: None,
            driver: None,
            session: None,
        }
    }

    /// Attach the driver that scanned this instance.
    pub fn with_driver(mut self, driver: &'static dyn Driver) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn driver(&self) -> Option<&'static dyn Driver> {
        self.driver
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub(crate) fn set_session(&mut self, session: Option<SessionId>) {
        self.session = session;
    }

    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }

    // -------------------------------------------------------------------------
    // Channels
    // -------------------------------------------------------------------------

    /// Append a channel; its index is one past the highest index in use.
    pub fn add_channel(&mut self, kind: ChannelKind, name: &str, enabled: bool) -> usize {
        let index = self
            .channels
            .iter()
            .map(|ch| ch.index + 1)
            .max()
            .unwrap_or(0);
        self.channels.push(Channel {
            index,
            kind,
            enabled,
            name: name.to_string(),
            trigger: None,
        });
        index
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.iter().find(|ch| ch.index == index)
    }

    fn channel_mut(&mut self, index: usize) -> AcqResult<&mut Channel> {
        let id = self.id;
        self.channels
            .iter_mut()
            .find(|ch| ch.index == index)
            .ok_or_else(|| AcqError::arg(format!("{} has no channel {}", id, index)))
    }

    pub fn enable_channel(&mut self, index: usize, enabled: bool) -> AcqResult<()> {
        self.channel_mut(index)?.enabled = enabled;
        Ok(())
    }

    pub fn set_channel_name(&mut self, index: usize, name: &str) -> AcqResult<()> {
        self.channel_mut(index)?.name = name.to_string();
        Ok(())
    }

    /// Replace the channel's trigger condition; `None` clears it.
    pub fn set_channel_trigger(
        &mut self,
        index: usize,
        trigger: Option<TriggerMatchType>,
    ) -> AcqResult<()> {
        self.channel_mut(index)?.trigger = trigger;
        Ok(())
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|ch| ch.enabled)
    }

    pub fn has_enabled_channels(&self) -> bool {
        self.channels.iter().any(|ch| ch.enabled)
    }

    pub fn channel_group(&self, name: &str) -> Option<&ChannelGroup> {
        self.channel_groups.iter().find(|cg| cg.name == name)
    }

    // -------------------------------------------------------------------------
    // Driver-private state
    // -------------------------------------------------------------------------

    pub fn set_driver_state<T: Any + Send>(&mut self, state: T) {
        self.driver_state = Some(Box::new(state));
    }

    /// Borrow the driver-private state as `T`.
    ///
    /// A missing or differently typed state is a driver bug.
    pub fn driver_state<T: Any + Send>(&self) -> AcqResult<&T> {
        self.driver_state
            .as_ref()
            .and_then(|s| s.downcast_ref::<T>())
            .ok_or_else(|| AcqError::bug(format!("{} has no driver state of the expected type", self.id)))
    }

    pub fn driver_state_mut<T: Any + Send>(&mut self) -> AcqResult<&mut T> {
        let id = self.id;
        self.driver_state
            .as_mut()
            .and_then(|s| s.downcast_mut::<T>())
            .ok_or_else(|| AcqError::bug(format!("{} has no driver state of the expected type", id)))
    }

    /// Split borrow: driver state and transport together.
    pub fn state_and_conn<T: Any + Send>(
        &mut self,
    ) -> AcqResult<(&mut T, Option<&mut Box<dyn Transport>>)> {
        let id = self.id;
        let state = self
            .driver_state
            .as_mut()
            .and_then(|s| s.downcast_mut::<T>())
            .ok_or_else(|| AcqError::bug(format!("{} has no driver state of the expected type", id)))?;
        Ok((state, self.conn.as_mut()))
    }
}

// =============================================================================
// Shared handle
// =============================================================================

/// Shared handle to a [`DeviceInstance`].
///
/// The lock is not reentrant: code that calls back into a driver or the
/// session must release its guard first.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    inner: Arc<Mutex<DeviceInstance>>,
}

impl Device {
    pub fn new(instance: DeviceInstance) -> Self {
        Self {
            id: instance.id,
            inner: Arc::new(Mutex::new(instance)),
        }
    }

    /// Identifier, readable without taking the lock.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceInstance> {
        self.inner.lock()
    }

    pub fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Driver of the instance, read under a short-lived lock.
    pub fn driver(&self) -> Option<&'static dyn Driver> {
        self.inner.lock().driver()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Device({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceInstance {
        let mut sdi = DeviceInstance::new("Acme", "LA-8", "1.0");
        for i in 0..4 {
            sdi.add_channel(ChannelKind::Logic, &format!("D{}", i), true);
        }
        sdi
    }

    #[test]
    fn test_add_channel_assigns_next_index() {
        let mut sdi = sample();
        let idx: Vec<usize> = sdi.channels().iter().map(|c| c.index).collect();
        assert_eq!(idx, vec![0, 1, 2, 3]);

        let next = sdi.add_channel(ChannelKind::Analog, "A0", false);
        assert_eq!(next, 4);
        assert_eq!(sdi.channel(4).unwrap().kind, ChannelKind::Analog);
    }

    #[test]
    fn test_channel_indices_unique() {
        let mut sdi = sample();
        sdi.add_channel(ChannelKind::Logic, "X", true);
        let mut idx: Vec<usize> = sdi.channels().iter().map(|c| c.index).collect();
        idx.dedup();
        assert_eq!(idx.len(), sdi.channels().len());
    }

    #[test]
    fn test_set_channel_trigger_replaces() {
        let mut sdi = sample();
        sdi.set_channel_trigger(1, Some(TriggerMatchType::Rising)).unwrap();
        sdi.set_channel_trigger(1, Some(TriggerMatchType::Zero)).unwrap();
        assert_eq!(sdi.channel(1).unwrap().trigger, Some(TriggerMatchType::Zero));

        sdi.set_channel_trigger(1, None).unwrap();
        assert_eq!(sdi.channel(1).unwrap().trigger, None);
    }

    #[test]
    fn test_invalid_index_is_arg_error() {
        let mut sdi = sample();
        assert!(matches!(
            sdi.set_channel_trigger(42, Some(TriggerMatchType::One)),
            Err(AcqError::Arg(_))
        ));
        assert!(matches!(sdi.enable_channel(42, true), Err(AcqError::Arg(_))));
        assert!(matches!(sdi.set_channel_name(42, "x"), Err(AcqError::Arg(_))));
    }

    #[test]
    fn test_enabled_channels() {
        let mut sdi = sample();
        for i in 0..4 {
            sdi.enable_channel(i, false).unwrap();
        }
        assert!(!sdi.has_enabled_channels());
        sdi.enable_channel(2, true).unwrap();
        let names: Vec<&str> = sdi.enabled_channels().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["D2"]);
    }

    #[test]
    fn test_driver_state_downcast() {
        struct State(u32);
        let mut sdi = sample();
        assert!(matches!(sdi.driver_state::<State>(), Err(AcqError::Bug(_))));
        sdi.set_driver_state(State(7));
        sdi.driver_state_mut::<State>().unwrap().0 += 1;
        assert_eq!(sdi.driver_state::<State>().unwrap().0, 8);
        assert!(sdi.driver_state::<u64>().is_err());
    }

    #[test]
    fn test_device_handle_identity() {
        let a = Device::new(sample());
        let b = Device::new(sample());
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.lock().id(), a.id());
    }
}

//! Acquisition session.
//!
//! A [`Session`] owns a set of devices, drives the event-source
//! [`Multiplexer`] and distributes datafeed packets to subscribers.
//!
//! # State machine
//!
//! ```text
//! Idle --start()--> Running --stop()/abort observed--> Idle
//! ```
//!
//! - [`Session::start`] verifies the trigger, checks every device for an
//!   enabled channel and commits its configuration, and only then starts the
//!   devices' acquisitions. A start failure is returned; devices started
//!   before it keep running and the session stays running.
//! - [`Session::run`] hands control to the multiplexer until no event source
//!   remains.
//! - [`Session::stop`] (or a [`StopHandle`] from another thread) requests an
//!   abort. The loop observes it after the callback in progress returns and
//!   calls [`Session::stop_sync`], which stops every device's acquisition.
//!
//! # Threading
//!
//! The session itself is single-threaded (`!Send`): all device and source
//! bookkeeping happens on the thread running the loop. The abort flag is the
//! only state shared across threads; it lives behind a mutex together with a
//! waker that interrupts a blocked poll.
//!
//! # Re-entrancy
//!
//! Callbacks and subscribers receive `&Session` and may add or remove devices
//! and sources while a dispatch is in progress. Lists are snapshotted before
//! they are walked, so such changes take effect from the next element on.
//! A subscriber runs while the sending device is locked and therefore must not
//! remove that same device; removing any other device is fine.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::datafeed::Packet;
use crate::device::{Device, DeviceInstance, SessionId};
use crate::driver::config_commit;
use crate::error::{AcqError, AcqResult};
use crate::mux::{Multiplexer, PollEvents, PollObject, SourceCallback, Waker};
use crate::transport::Transport;
use crate::trigger::Trigger;

/// Subscriber invoked synchronously for every packet sent in the session.
pub type DatafeedCallback = Box<dyn FnMut(&DeviceInstance, &Packet)>;

struct AbortState {
    requested: Mutex<bool>,
    waker: Arc<Waker>,
}

/// Thread-safe handle that requests a session stop.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<AbortState>,
}

impl StopHandle {
    /// Request a stop. Safe from any thread; returns immediately.
    pub fn stop(&self) {
        *self.state.requested.lock() = true;
        self.state.waker.wake();
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("requested", &*self.state.requested.lock())
            .finish()
    }
}

pub struct Session {
    id: SessionId,
    devices: RefCell<Vec<Device>>,
    subscribers: RefCell<Vec<Rc<RefCell<DatafeedCallback>>>>,
    trigger: RefCell<Option<Trigger>>,
    mux: Multiplexer<Session>,
    running: Cell<bool>,
    abort: Arc<AbortState>,
}

impl Session {
    pub fn new() -> AcqResult<Self> {
        let mux = Multiplexer::new()?;
        let abort = Arc::new(AbortState {
            requested: Mutex::new(false),
            waker: mux.waker(),
        });
        let session = Self {
            id: SessionId::next(),
            devices: RefCell::new(Vec::new()),
            subscribers: RefCell::new(Vec::new()),
            trigger: RefCell::new(None),
            mux,
            running: Cell::new(false),
            abort,
        };
        tracing::debug!(session = %session.id, "Session created");
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Add a device. When the session is already running the device's
    /// configuration is committed and its acquisition started right away.
    pub fn add_device(&self, device: &Device) -> AcqResult<()> {
        let driver = {
            let mut sdi = device.lock();
            if let Some(owner) = sdi.session() {
                return Err(AcqError::arg(format!(
                    "{} already belongs to {}",
                    sdi.id(),
                    owner
                )));
            }
            sdi.set_session(Some(self.id));
            sdi.driver()
        };
        self.devices.borrow_mut().push(device.clone());
        tracing::debug!(session = %self.id, device = %device.id(), "Device added");

        let Some(driver) = driver else {
            // Virtual device: nothing to start.
            return Ok(());
        };

        if self.running.get() {
            config_commit(&mut device.lock()).map_err(|e| {
                tracing::error!(device = %device.id(), error = %e, "Failed to commit device settings");
                e
            })?;
            driver.acquisition_start(device, self).map_err(|e| {
                tracing::error!(device = %device.id(), error = %e, "Failed to start acquisition of late-joining device");
                e
            })?;
        }
        Ok(())
    }

    /// Remove a device, stopping its acquisition first while running.
    pub fn remove_device(&self, device: &Device) -> AcqResult<()> {
        let position = self
            .devices
            .borrow()
            .iter()
            .position(|d| d.ptr_eq(device))
            .ok_or_else(|| {
                AcqError::arg(format!("{} is not part of {}", device.id(), self.id))
            })?;

        if self.running.get() {
            if let Some(driver) = device.driver() {
                if let Err(e) = driver.acquisition_stop(device, self) {
                    tracing::warn!(device = %device.id(), error = %e, "Stopping removed device failed");
                }
            }
        }

        {
            let mut devices = self.devices.borrow_mut();
            // The stop above may have changed the list.
            match devices.get(position) {
                Some(d) if d.ptr_eq(device) => {
                    devices.remove(position);
                }
                _ => devices.retain(|d| !d.ptr_eq(device)),
            }
        }
        device.lock().set_session(None);
        tracing::debug!(session = %self.id, device = %device.id(), "Device removed");
        Ok(())
    }

    /// Detach every device without stopping it.
    pub fn remove_all_devices(&self) {
        let devices = std::mem::take(&mut *self.devices.borrow_mut());
        for device in devices {
            device.lock().set_session(None);
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.borrow().clone()
    }

    // =========================================================================
    // Datafeed
    // =========================================================================

    pub fn add_datafeed_callback(&self, callback: impl FnMut(&DeviceInstance, &Packet) + 'static) {
        self.subscribers
            .borrow_mut()
            .push(Rc::new(RefCell::new(Box::new(callback))));
    }

    pub fn remove_all_datafeed_callbacks(&self) {
        self.subscribers.borrow_mut().clear();
    }

    /// Deliver `packet` from `sdi` to every subscriber, in registration order.
    ///
    /// `sdi` must belong to this session.
    pub fn send(&self, sdi: &DeviceInstance, packet: &Packet) -> AcqResult<()> {
        match sdi.session() {
            Some(id) if id == self.id => {}
            Some(other) => {
                return Err(AcqError::bug(format!(
                    "{} sent a packet to {} but belongs to {}",
                    sdi.id(),
                    self.id,
                    other
                )))
            }
            None => {
                return Err(AcqError::bug(format!(
                    "{} sent a packet without belonging to a session",
                    sdi.id()
                )))
            }
        }

        let kind = packet.kind();
        tracing::debug!(device = %sdi.id(), %kind, detail = %packet.summary(), "bus: Received {} packet", kind);

        let subscribers: Vec<_> = self.subscribers.borrow().iter().cloned().collect();
        for subscriber in subscribers {
            match subscriber.try_borrow_mut() {
                Ok(mut callback) => (*callback)(sdi, packet),
                Err(_) => {
                    tracing::warn!(device = %sdi.id(), %kind, "Datafeed subscriber re-entered; packet skipped for it");
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Trigger
    // =========================================================================

    pub fn trigger(&self) -> Option<Trigger> {
        self.trigger.borrow().clone()
    }

    pub fn set_trigger(&self, trigger: Option<Trigger>) {
        *self.trigger.borrow_mut() = trigger;
    }

    // =========================================================================
    // Event sources
    // =========================================================================

    /// Register an event source. `timeout` of zero never forces a wake.
    pub fn source_add(
        &self,
        object: PollObject,
        events: PollEvents,
        timeout: Duration,
        callback: SourceCallback<Session>,
    ) -> AcqResult<()> {
        self.mux.add(object, events, timeout, callback)
    }

    /// Register a source on a transport's poll object.
    pub fn source_add_transport(
        &self,
        transport: &dyn Transport,
        events: PollEvents,
        timeout: Duration,
        callback: SourceCallback<Session>,
    ) -> AcqResult<()> {
        self.mux.add(transport.poll_object(), events, timeout, callback)
    }

    pub fn source_remove(&self, object: PollObject) -> AcqResult<()> {
        self.mux.remove(object)
    }

    pub fn source_count(&self) -> usize {
        self.mux.len()
    }

    pub fn has_source(&self, object: PollObject) -> bool {
        self.mux.contains(object)
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Start acquisition on every device.
    ///
    /// Every device is checked for an enabled channel and has its settings
    /// committed before any of them starts. A driver failing to start returns
    /// its error; devices started before it keep running.
    pub fn start(&self) -> AcqResult<()> {
        if self.running.get() {
            tracing::error!(session = %self.id, "Cannot (re-)start session while it is still running");
            return Err(AcqError::Generic(format!("{} is already running", self.id)));
        }
        if let Some(trigger) = self.trigger.borrow().as_ref() {
            trigger.verify()?;
        }

        let devices = self.devices();
        for device in &devices {
            let mut sdi = device.lock();
            if !sdi.has_enabled_channels() {
                tracing::error!(device = %device.id(), "No channels enabled");
                return Err(AcqError::arg(format!("{} has no enabled channels", sdi.id())));
            }
            config_commit(&mut sdi).map_err(|e| {
                tracing::error!(device = %device.id(), error = %e, "Failed to commit device settings");
                e
            })?;
        }

        *self.abort.requested.lock() = false;
        tracing::info!(session = %self.id, devices = devices.len(), "Starting acquisition");
        self.running.set(true);

        let mut started = 0usize;
        for device in &devices {
            let Some(driver) = device.driver() else {
                continue;
            };
            if let Err(e) = driver.acquisition_start(device, self) {
                tracing::error!(device = %device.id(), driver = driver.name(), error = %e, "Could not start acquisition");
                if started == 0 {
                    self.running.set(false);
                }
                return Err(e);
            }
            started += 1;
        }
        Ok(())
    }

    /// Dispatch events until no source remains.
    pub fn run(&self) -> AcqResult<()> {
        if self.devices.borrow().is_empty() {
            return Err(AcqError::arg("session has no devices"));
        }
        tracing::debug!(session = %self.id, sources = self.mux.len(), "Running session");

        let mut check_abort = |session: &Session| session.check_abort();
        while !self.mux.is_empty() {
            self.mux.iterate(self, &mut check_abort)?;
        }
        self.running.set(false);
        tracing::debug!(session = %self.id, "Session run finished");
        Ok(())
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: Arc::clone(&self.abort),
        }
    }

    /// Request a stop; observed by the loop after the current callback.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    fn check_abort(&self) {
        let requested = std::mem::replace(&mut *self.abort.requested.lock(), false);
        if requested {
            tracing::debug!(session = %self.id, "Stop requested");
            self.stop_sync();
        }
    }

    /// Stop every device's acquisition now.
    ///
    /// Must not be called from inside an event-source callback; use
    /// [`stop`](Self::stop) there.
    pub fn stop_sync(&self) {
        for device in self.devices() {
            if let Some(driver) = device.driver() {
                if let Err(e) = driver.acquisition_stop(&device, self) {
                    tracing::warn!(device = %device.id(), driver = driver.name(), error = %e, "acquisition_stop failed");
                }
            }
        }
        if !self.mux.is_empty() {
            tracing::warn!(
                session = %self.id,
                sources = self.mux.len(),
                "Event sources left after stop; dropping them"
            );
            self.mux.clear();
        }
        self.running.set(false);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("devices", &self.devices.borrow().len())
            .field("sources", &self.mux.len())
            .field("running", &self.running.get())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Devices outlive sessions; leave no dangling relation behind.
        for device in self.devices.get_mut().drain(..) {
            device.lock().set_session(None);
        }
    }
}

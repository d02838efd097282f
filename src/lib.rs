//! # rust-acq
//!
//! Instrument acquisition middleware: one API and one sample stream for many
//! measurement devices (logic analyzers, oscilloscopes, multimeters).
//!
//! ## Crate Structure
//!
//! - **`acq-core`**: device and channel model, datafeed packets, config keys,
//!   the [`Driver`](acq_core::Driver) contract, the event-source multiplexer,
//!   the [`Session`](acq_core::Session), the streaming frame decoder and
//!   transports.
//! - **`acq-driver-demo`**: a virtual logic/analog device with a pattern
//!   generator.
//! - **`acq-hardware`**: the serial transport, the built-in driver registry,
//!   settings-file loading and transport-backed drivers.
//!
//! ## Example
//!
//! ```no_run
//! use rust_acq::prelude::*;
//!
//! fn main() -> AcqResult<()> {
//!     let ctx = Context::new(Settings::default())?;
//!     let device = ctx.scan("demo", &[])?.remove(0);
//!     {
//!         let mut sdi = device.lock();
//!         driver::open(&mut sdi)?;
//!         driver::config_set(&mut sdi, None, ConfigKey::LimitSamples, ConfigValue::UInt64(1000))?;
//!     }
//!
//!     let session = Session::new()?;
//!     session.add_device(&device)?;
//!     session.add_datafeed_callback(|sdi, packet| {
//!         println!("{}: {}", sdi.id(), packet.summary());
//!     });
//!     session.start()?;
//!     session.run()
//! }
//! ```

pub use acq_core;
pub use acq_driver_demo;
pub use acq_hardware;

pub use acq_core::{
    driver, AcqError, AcqResult, Config, ConfigKey, ConfigValue, Device, DeviceInstance, Packet,
    PacketKind, Session, Settings, StopHandle,
};
pub use acq_hardware::{driver_list, find_driver, load_settings, Context};

/// Everything a typical acquisition front end needs.
pub mod prelude {
    pub use acq_core::driver::{self, Driver};
    pub use acq_core::logging::{self, LogConfig};
    pub use acq_core::{
        AcqError, AcqResult, Analog, ChannelGroup, ChannelKind, Config, ConfigKey, ConfigValue,
        Device, DeviceInstance, DeviceStatus, Logic, MqFlags, Packet, PacketKind, Quantity,
        Session, Settings, StopHandle, Unit,
    };
    pub use acq_hardware::{load_settings, Context};
}

//! `acq-core`
//!
//! Core building blocks of the rust-acq instrument acquisition layer: one
//! API and one sample stream for logic analyzers, oscilloscopes and meters
//! behind many different transports.
//!
//! ## Layers (leaves first)
//!
//! - **Device/Channel model** ([`device`]): device instances, channels,
//!   channel groups and their lifecycle status.
//! - **Datafeed** ([`datafeed`]): the tagged packet types that carry samples
//!   and metadata from drivers to consumers.
//! - **Driver contract** ([`driver`]): the capability table each instrument
//!   family implements, plus the checked `config_*` entry points.
//! - **Event-source multiplexer** ([`mux`]): poll-based cooperative
//!   scheduler; no thread per device.
//! - **Session** ([`session`]): owns devices, runs the multiplexer and
//!   distributes packets to subscribers.
//! - **Streaming decoder** ([`decoder`]): buffer, resync and checksum loop
//!   shared by every framed serial/USB protocol.
//!
//! Supporting modules: [`config`] (keys and typed values), [`trigger`],
//! [`transport`], [`sw_limits`], [`std_driver`] (helpers for driver
//! authors), [`settings`] (Figment-based configuration) and [`logging`].
//!
//! ## Example
//!
//! ```
//! use acq_core::{ChannelKind, Device, DeviceInstance, Packet, Session};
//!
//! let session = Session::new().unwrap();
//! let mut sdi = DeviceInstance::new("Acme", "Virtual", "1.0");
//! sdi.add_channel(ChannelKind::Logic, "D0", true);
//! let device = Device::new(sdi);
//!
//! session.add_device(&device).unwrap();
//! session.add_datafeed_callback(|sdi, packet| {
//!     println!("{}: {}", sdi.id(), packet.kind());
//! });
//! session.send(&device.lock(), &Packet::Trigger).unwrap();
//! ```

pub mod config;
pub mod datafeed;
pub mod decoder;
pub mod device;
pub mod driver;
pub mod error;
pub mod logging;
pub mod mux;
pub mod session;
pub mod settings;
pub mod std_driver;
pub mod sw_limits;
pub mod transport;
pub mod trigger;

pub use config::{Config, ConfigKey, ConfigValue, DataType, KeyInfo};
pub use datafeed::{Analog, Header, Logic, MqFlags, Packet, PacketKind, Quantity, Unit};
pub use decoder::{Checksum, DecodeEvent, DecoderStats, FrameFormat, LengthField, MagicFrame, NibbleSyncFrame, StreamDecoder};
pub use device::{Channel, ChannelGroup, ChannelKind, Device, DeviceId, DeviceInstance, DeviceStatus, SessionId};
pub use driver::{Driver, DriverContext};
pub use error::{AcqError, AcqResult, ErrorKind};
pub use mux::{PollEvents, PollObject};
pub use session::{Session, StopHandle};
pub use settings::Settings;
pub use sw_limits::SwLimits;
pub use transport::{StreamTransport, Transport};
pub use trigger::{Trigger, TriggerMatch, TriggerMatchType, TriggerStage};

pub use bytes::Bytes;

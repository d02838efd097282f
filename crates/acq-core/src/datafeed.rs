//! Datafeed packets: the only channel by which samples and metadata travel
//! from a driver to session subscribers.
//!
//! Packets are immutable once built. Subscribers see them by reference for
//! the duration of one dispatch; a consumer that must keep one longer calls
//! [`Packet::deep_copy`], which detaches it from any buffer shared with the
//! driver.
//!
//! Every acquisition on a device is framed as
//!
//! ```text
//! Header, (Meta | Trigger | Logic | Analog | FrameBegin .. FrameEnd)*, End
//! ```

use std::time::SystemTime;

use bitflags::bitflags;
use bytes::Bytes;

use crate::config::Config;
use crate::error::{AcqError, AcqResult};

/// Version of the packet stream layout carried in every header.
pub const FEED_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
}

impl Header {
    pub fn now() -> Self {
        Self {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
        }
    }
}

/// Logic samples: `unit_size` bytes per sample, one bit per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Logic {
    data: Bytes,
    unit_size: usize,
}

impl Logic {
    /// Build a logic packet; the byte length must be a multiple of `unit_size`.
    pub fn new(data: impl Into<Bytes>, unit_size: usize) -> AcqResult<Self> {
        let data = data.into();
        if unit_size == 0 {
            return Err(AcqError::arg("logic unit size must be non-zero"));
        }
        if data.len() % unit_size != 0 {
            return Err(AcqError::arg(format!(
                "logic buffer of {} bytes is not a multiple of unit size {}",
                data.len(),
                unit_size
            )));
        }
        Ok(Self { data, unit_size })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Length in bytes.
    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn num_samples(&self) -> usize {
        self.data.len() / self.unit_size
    }

    /// Bytes of sample `n`.
    pub fn sample(&self, n: usize) -> Option<&[u8]> {
        let start = n.checked_mul(self.unit_size)?;
        let end = start.checked_add(self.unit_size)?;
        self.data.get(start..end)
    }
}

/// Measured quantity of analog samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Voltage,
    Current,
    Resistance,
    Capacitance,
    Temperature,
    Frequency,
    DutyCycle,
    Continuity,
    PulseWidth,
    Conductance,
    Power,
    Gain,
    SoundPressureLevel,
    RelativeHumidity,
    Time,
}

impl Quantity {
    const ALL: [Quantity; 15] = [
        Quantity::Voltage,
        Quantity::Current,
        Quantity::Resistance,
        Quantity::Capacitance,
        Quantity::Temperature,
        Quantity::Frequency,
        Quantity::DutyCycle,
        Quantity::Continuity,
        Quantity::PulseWidth,
        Quantity::Conductance,
        Quantity::Power,
        Quantity::Gain,
        Quantity::SoundPressureLevel,
        Quantity::RelativeHumidity,
        Quantity::Time,
    ];

    /// Wire code used by framed meters (1-based position in the list above).
    pub fn from_code(code: u8) -> Option<Self> {
        (code as usize)
            .checked_sub(1)
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn code(self) -> u8 {
        Self::ALL
            .iter()
            .position(|q| *q == self)
            .map_or(0, |i| i as u8 + 1)
    }
}

/// Unit of analog samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Farad,
    Kelvin,
    Celsius,
    Fahrenheit,
    Hertz,
    Percentage,
    Boolean,
    Second,
    Siemens,
    DecibelMw,
    DecibelVolt,
    Unitless,
    DecibelSpl,
    Watt,
}

impl Unit {
    const ALL: [Unit; 17] = [
        Unit::Volt,
        Unit::Ampere,
        Unit::Ohm,
        Unit::Farad,
        Unit::Kelvin,
        Unit::Celsius,
        Unit::Fahrenheit,
        Unit::Hertz,
        Unit::Percentage,
        Unit::Boolean,
        Unit::Second,
        Unit::Siemens,
        Unit::DecibelMw,
        Unit::DecibelVolt,
        Unit::Unitless,
        Unit::DecibelSpl,
        Unit::Watt,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        (code as usize)
            .checked_sub(1)
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn code(self) -> u8 {
        Self::ALL
            .iter()
            .position(|u| *u == self)
            .map_or(0, |i| i as u8 + 1)
    }
}

bitflags! {
    /// Qualifiers of a measured quantity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MqFlags: u32 {
        const AC = 1 << 0;
        const DC = 1 << 1;
        const RMS = 1 << 2;
        const DIODE = 1 << 3;
        const HOLD = 1 << 4;
        const MAX = 1 << 5;
        const MIN = 1 << 6;
        const AUTORANGE = 1 << 7;
        const RELATIVE = 1 << 8;
        const AVG = 1 << 9;
    }
}

/// Analog samples, interleaved by channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Analog {
    /// Channel indices covered, in interleave order.
    pub channels: Vec<usize>,
    pub data: Vec<f32>,
    pub mq: Quantity,
    pub unit: Unit,
    pub flags: MqFlags,
}

impl Analog {
    pub fn new(
        channels: Vec<usize>,
        data: Vec<f32>,
        mq: Quantity,
        unit: Unit,
        flags: MqFlags,
    ) -> AcqResult<Self> {
        if channels.is_empty() {
            return Err(AcqError::arg("analog packet without channels"));
        }
        if data.len() % channels.len() != 0 {
            return Err(AcqError::arg(format!(
                "{} analog values do not divide over {} channels",
                data.len(),
                channels.len()
            )));
        }
        Ok(Self {
            channels,
            data,
            mq,
            unit,
            flags,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.data.len() / self.channels.len().max(1)
    }
}

// =============================================================================
// Packet
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Header(Header),
    End,
    Meta(Vec<Config>),
    Trigger,
    Logic(Logic),
    Analog(Analog),
    FrameBegin,
    FrameEnd,
}

/// Payload-free packet tag, used for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Header,
    End,
    Meta,
    Trigger,
    Logic,
    Analog,
    FrameBegin,
    FrameEnd,
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PacketKind::Header => "header",
            PacketKind::End => "end",
            PacketKind::Meta => "meta",
            PacketKind::Trigger => "trigger",
            PacketKind::Logic => "logic",
            PacketKind::Analog => "analog",
            PacketKind::FrameBegin => "frame_begin",
            PacketKind::FrameEnd => "frame_end",
        };
        write!(f, "{}", label)
    }
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Header(_) => PacketKind::Header,
            Packet::End => PacketKind::End,
            Packet::Meta(_) => PacketKind::Meta,
            Packet::Trigger => PacketKind::Trigger,
            Packet::Logic(_) => PacketKind::Logic,
            Packet::Analog(_) => PacketKind::Analog,
            Packet::FrameBegin => PacketKind::FrameBegin,
            Packet::FrameEnd => PacketKind::FrameEnd,
        }
    }

    /// Copy that shares no buffer with the original.
    pub fn deep_copy(&self) -> Packet {
        match self {
            Packet::Logic(logic) => Packet::Logic(Logic {
                data: Bytes::copy_from_slice(&logic.data),
                unit_size: logic.unit_size,
            }),
            other => other.clone(),
        }
    }

    /// Short description for the datafeed dump.
    pub fn summary(&self) -> String {
        match self {
            Packet::Logic(logic) => format!(
                "{} bytes, unit size {}",
                logic.length(),
                logic.unit_size()
            ),
            Packet::Analog(analog) => format!(
                "{} samples on {} channel(s), {:?} in {:?}",
                analog.num_samples(),
                analog.channels.len(),
                analog.mq,
                analog.unit
            ),
            Packet::Meta(config) => format!("{} item(s)", config.len()),
            Packet::Header(header) => format!("feed version {}", header.feed_version),
            _ => String::new(),
        }
    }
}

//! Generic framed-binary multimeter driver (`serial-dmm`).
//!
//! Protocol Overview:
//! - Frame: `55 55 | len | payload | sum8`, checksum over everything before it
//! - Payload (10 bytes): quantity code u8, unit code u8, flags u32 LE, value f32 LE
//! - The meter streams frames on its own; the host never sends anything
//! - Default line settings: 9600 baud, 8N1, no flow control
//!
//! Scanning opens `conn` (a serial port or `tcp-raw/<host>/<port>`) and
//! waits for one valid frame before creating the device. Acquisition turns
//! every valid frame into a single-sample analog packet on channel `P1`.

use std::time::Duration;

use parking_lot::Mutex;

use acq_core::config::{find_option, ConfigKey, ConfigValue};
use acq_core::datafeed::{Analog, MqFlags, Packet, Quantity, Unit};
use acq_core::decoder::{Checksum, DecodeEvent, LengthField, MagicFrame, StreamDecoder};
use acq_core::driver::{Driver, DriverContext};
use acq_core::mux::PollEvents;
use acq_core::settings::{DecoderSettings, SerialSettings};
use acq_core::std_driver::{send_header, serial_acquisition_stop};
use acq_core::{
    AcqError, AcqResult, ChannelGroup, ChannelKind, Config, Device, DeviceInstance, DeviceStatus,
    Session, SwLimits,
};

use crate::serial::{open_conn, stream_detect};

const MAGIC: [u8; 2] = [0x55, 0x55];
const PAYLOAD_LEN: usize = 10;

/// Wake-up interval while no bytes arrive, so time limits still apply.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

const SCAN_OPTIONS: &[ConfigKey] = &[ConfigKey::Conn, ConfigKey::SerialComm];

const DEVICE_OPTIONS: &[ConfigKey] = &[
    ConfigKey::Multimeter,
    ConfigKey::Continuous,
    ConfigKey::LimitSamples,
    ConfigKey::LimitMsec,
];

/// Wire format of the meter.
pub fn frame_format() -> MagicFrame {
    MagicFrame::new(&MAGIC, LengthField::U8, Checksum::Sum8).with_max_payload(PAYLOAD_LEN)
}

/// One decoded measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub mq: Quantity,
    pub unit: Unit,
    pub flags: MqFlags,
    pub value: f32,
}

impl Reading {
    pub fn parse(payload: &[u8]) -> AcqResult<Self> {
        let payload: &[u8; PAYLOAD_LEN] = payload.try_into().map_err(|_| {
            AcqError::Decode(format!("expected {} payload bytes, got {}", PAYLOAD_LEN, payload.len()))
        })?;
        let mq = Quantity::from_code(payload[0])
            .ok_or_else(|| AcqError::Decode(format!("unknown quantity code {}", payload[0])))?;
        let unit = Unit::from_code(payload[1])
            .ok_or_else(|| AcqError::Decode(format!("unknown unit code {}", payload[1])))?;
        let flags = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
        let value = f32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]);
        Ok(Self {
            mq,
            unit,
            flags: MqFlags::from_bits_truncate(flags),
            value,
        })
    }

    pub fn to_payload(&self) -> [u8; PAYLOAD_LEN] {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0] = self.mq.code();
        payload[1] = self.unit.code();
        payload[2..6].copy_from_slice(&self.flags.bits().to_le_bytes());
        payload[6..].copy_from_slice(&self.value.to_le_bytes());
        payload
    }

    /// Complete wire frame, as the meter would send it.
    pub fn encode(&self) -> AcqResult<Vec<u8>> {
        frame_format().encode(&self.to_payload())
    }
}

#[derive(Debug, Clone, Default)]
struct ProbeConfig {
    serial: SerialSettings,
    decoder: DecoderSettings,
}

struct DmmState {
    conn: String,
    serialcomm: String,
    decoder: StreamDecoder<MagicFrame>,
    limits: SwLimits,
    continuous: bool,
    running: bool,
}

pub static DRIVER: SerialDmmDriver = SerialDmmDriver::new();

pub struct SerialDmmDriver {
    config: Mutex<Option<ProbeConfig>>,
    devices: Mutex<Vec<Device>>,
}

impl SerialDmmDriver {
    pub const fn new() -> Self {
        Self {
            config: parking_lot::const_mutex(None),
            devices: parking_lot::const_mutex(Vec::new()),
        }
    }

    fn probe_config(&self) -> ProbeConfig {
        self.config.lock().clone().unwrap_or_default()
    }
}

impl Default for SerialDmmDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn option_str<'a>(options: &'a [Config], key: ConfigKey) -> AcqResult<Option<&'a str>> {
    find_option(options, key)
        .map(|value| {
            value
                .as_str()
                .ok_or_else(|| AcqError::arg(format!("'{}' expects a string", key)))
        })
        .transpose()
}

/// Pull buffered bytes through the decoder and send one packet per frame.
/// Returns whether the software limits are reached.
fn read_and_send(sdi: &mut DeviceInstance, session: &Session, events: PollEvents) -> AcqResult<bool> {
    let id = sdi.id();
    let (state, conn) = sdi.state_and_conn::<DmmState>()?;
    let conn = conn.ok_or_else(|| AcqError::bug(format!("{} has no transport", id)))?;

    if events.intersects(PollEvents::IN | PollEvents::HUP | PollEvents::ERR) {
        state.decoder.read_from(&mut **conn)?;
    }

    let mut readings = Vec::new();
    state.decoder.process(|event| {
        match event {
            DecodeEvent::Frame(payload) => match Reading::parse(payload) {
                Ok(reading) => readings.push(reading),
                Err(e) => tracing::warn!(device = %id, error = %e, "Dropping unparseable frame"),
            },
            DecodeEvent::Corrupt(_) => {}
        }
        Ok(())
    })?;

    let channel = sdi
        .channels()
        .iter()
        .find(|ch| ch.kind == ChannelKind::Analog && ch.enabled)
        .map(|ch| ch.index);
    for reading in readings {
        if let Some(channel) = channel {
            let analog = Analog::new(vec![channel], vec![reading.value], reading.mq, reading.unit, reading.flags)?;
            session.send(sdi, &Packet::Analog(analog))?;
        }
        let state = sdi.driver_state_mut::<DmmState>()?;
        state.limits.update_samples_read(1);
        if !state.continuous && state.limits.check() {
            break;
        }
    }

    let state = sdi.driver_state::<DmmState>()?;
    Ok(!state.continuous && state.limits.check())
}

fn stop_acquisition(sdi: &mut DeviceInstance, session: &Session) -> AcqResult<()> {
    let state = sdi.driver_state_mut::<DmmState>()?;
    if !state.running {
        return Ok(());
    }
    state.running = false;
    tracing::debug!(device = %sdi.id(), "Stopping meter acquisition");
    serial_acquisition_stop(session, sdi)
}

fn receive_data(device: &Device, session: &Session, events: PollEvents) -> bool {
    let mut sdi = device.lock();
    let done = match read_and_send(&mut sdi, session, events) {
        Ok(done) => done,
        Err(e) => {
            tracing::error!(device = %sdi.id(), error = %e, "Meter acquisition failed");
            true
        }
    };
    if !done {
        return true;
    }
    if let Err(e) = stop_acquisition(&mut sdi, session) {
        tracing::warn!(device = %sdi.id(), error = %e, "Failed to stop meter acquisition");
    }
    false
}

impl Driver for SerialDmmDriver {
    fn name(&self) -> &'static str {
        "serial-dmm"
    }

    fn long_name(&self) -> &'static str {
        "Generic framed-binary multimeter"
    }

    fn init(&self, ctx: &DriverContext) -> AcqResult<()> {
        *self.config.lock() = Some(ProbeConfig {
            serial: ctx.settings.serial.clone(),
            decoder: ctx.settings.decoder.clone(),
        });
        Ok(())
    }

    fn cleanup(&self) -> AcqResult<()> {
        self.clear()?;
        *self.config.lock() = None;
        Ok(())
    }

    fn scan(&'static self, options: &[Config]) -> AcqResult<Vec<Device>> {
        let config = self.probe_config();
        let conn = option_str(options, ConfigKey::Conn)?
            .ok_or_else(|| AcqError::arg("serial-dmm needs a 'conn' scan option"))?;
        let serialcomm = option_str(options, ConfigKey::SerialComm)?
            .unwrap_or(config.serial.default_serialcomm.as_str())
            .to_string();

        let mut transport = open_conn(conn, &serialcomm)?;
        let mut decoder = StreamDecoder::new(frame_format(), config.decoder.buffer_size);
        let timeout = Duration::from_millis(config.serial.detect_timeout_ms);
        let first = match stream_detect(&mut *transport, &mut decoder, timeout) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::info!(conn, error = %e, "No meter found");
                transport.close()?;
                return Ok(Vec::new());
            }
        };
        if let Err(e) = Reading::parse(&first) {
            tracing::info!(conn, error = %e, "Device does not speak the meter protocol");
            transport.close()?;
            return Ok(Vec::new());
        }

        let mut sdi = DeviceInstance::new("Generic", "Serial DMM", "").with_driver(self);
        sdi.connection_id = Some(conn.to_string());
        sdi.conn = Some(transport);
        let p1 = sdi.add_channel(ChannelKind::Analog, "P1", true);
        sdi.channel_groups.push(ChannelGroup::new("P1", vec![p1]));
        sdi.set_driver_state(DmmState {
            conn: conn.to_string(),
            serialcomm,
            decoder,
            limits: SwLimits::new(),
            continuous: false,
            running: false,
        });

        tracing::info!(device = %sdi.id(), conn, "Found meter");
        let device = Device::new(sdi);
        self.devices.lock().push(device.clone());
        Ok(vec![device])
    }

    fn list(&self) -> Vec<Device> {
        self.devices.lock().clone()
    }

    fn clear(&self) -> AcqResult<()> {
        let devices = std::mem::take(&mut *self.devices.lock());
        for device in devices {
            let mut sdi = device.lock();
            if let Some(conn) = sdi.conn.as_mut() {
                conn.close()?;
            }
        }
        Ok(())
    }

    fn open(&self, sdi: &mut DeviceInstance) -> AcqResult<()> {
        if sdi.conn.as_ref().is_some_and(|conn| conn.is_open()) {
            return Ok(());
        }
        let state = sdi.driver_state::<DmmState>()?;
        let transport = open_conn(&state.conn, &state.serialcomm)?;
        sdi.conn = Some(transport);
        Ok(())
    }

    fn close(&self, sdi: &mut DeviceInstance) -> AcqResult<()> {
        match sdi.conn.as_mut() {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }

    fn config_get(
        &self,
        key: ConfigKey,
        sdi: Option<&DeviceInstance>,
        _cg: Option<&ChannelGroup>,
    ) -> AcqResult<ConfigValue> {
        let Some(sdi) = sdi else {
            return Err(AcqError::NotApplicable);
        };
        let state = sdi.driver_state::<DmmState>()?;
        match key {
            ConfigKey::LimitSamples | ConfigKey::LimitMsec => state.limits.config_get(key),
            ConfigKey::Continuous => Ok(ConfigValue::Bool(state.continuous)),
            _ => Err(AcqError::NotApplicable),
        }
    }

    fn config_set(
        &self,
        key: ConfigKey,
        value: &ConfigValue,
        sdi: &mut DeviceInstance,
        _cg: Option<&ChannelGroup>,
    ) -> AcqResult<()> {
        if sdi.status != DeviceStatus::Active {
            return Err(AcqError::DeviceClosed);
        }
        let state = sdi.driver_state_mut::<DmmState>()?;
        match key {
            ConfigKey::LimitSamples | ConfigKey::LimitMsec => state.limits.config_set(key, value),
            ConfigKey::Continuous => {
                state.continuous = value
                    .as_bool()
                    .ok_or_else(|| AcqError::arg(format!("'{}' expects a boolean", key)))?;
                Ok(())
            }
            _ => Err(AcqError::NotApplicable),
        }
    }

    fn config_list(
        &self,
        key: ConfigKey,
        _sdi: Option<&DeviceInstance>,
        _cg: Option<&ChannelGroup>,
    ) -> AcqResult<ConfigValue> {
        match key {
            ConfigKey::ScanOptions => Ok(ConfigValue::Keys(SCAN_OPTIONS.to_vec())),
            ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(DEVICE_OPTIONS.to_vec())),
            _ => Err(AcqError::NotApplicable),
        }
    }

    fn acquisition_start(&self, device: &Device, session: &Session) -> AcqResult<()> {
        let mut sdi = device.lock();
        if sdi.status != DeviceStatus::Active {
            return Err(AcqError::DeviceClosed);
        }
        let id = sdi.id();
        let (state, conn) = sdi.state_and_conn::<DmmState>()?;
        let conn = conn.ok_or_else(|| AcqError::bug(format!("{} has no transport", id)))?;
        if state.running {
            return Err(AcqError::arg("meter acquisition already running"));
        }

        state.decoder.clear();
        if let Err(e) = conn.flush_input() {
            tracing::warn!(device = %id, error = %e, "Failed to flush stale input");
        }
        state.limits.acquisition_start();

        let source_device = device.clone();
        session.source_add_transport(
            &**conn,
            PollEvents::IN,
            POLL_TIMEOUT,
            Box::new(move |session, events| receive_data(&source_device, session, events)),
        )?;
        state.running = true;

        tracing::info!(device = %id, "Meter acquisition started");
        send_header(session, &sdi)
    }

    fn acquisition_stop(&self, device: &Device, session: &Session) -> AcqResult<()> {
        stop_acquisition(&mut device.lock(), session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::decoder::FrameFormat;

    #[test]
    fn test_reading_wire_layout() {
        let reading = Reading {
            mq: Quantity::Voltage,
            unit: Unit::Volt,
            flags: MqFlags::DC | MqFlags::AUTORANGE,
            value: 1.5,
        };
        let frame = reading.encode().unwrap();
        assert_eq!(&frame[..3], &[0x55, 0x55, PAYLOAD_LEN as u8]);
        assert_eq!(frame.len(), 3 + PAYLOAD_LEN + 1);
        assert_eq!(frame[3], Quantity::Voltage.code());
        assert_eq!(&frame[9..13], &1.5f32.to_le_bytes());

        let format = frame_format();
        assert!(format.validate(&frame));
        assert_eq!(Reading::parse(format.payload(&frame)).unwrap(), reading);
    }

    #[test]
    fn test_reading_rejects_unknown_codes() {
        let mut payload = Reading {
            mq: Quantity::Current,
            unit: Unit::Ampere,
            flags: MqFlags::empty(),
            value: 0.0,
        }
        .to_payload();
        payload[0] = 0;
        assert!(matches!(Reading::parse(&payload), Err(AcqError::Decode(_))));
        assert!(matches!(Reading::parse(&payload[..4]), Err(AcqError::Decode(_))));
    }

    #[test]
    fn test_scan_requires_conn() {
        let defaults = SerialDmmDriver::new().probe_config();
        assert_eq!(defaults.serial.default_serialcomm, "9600/8n1");
        let options = [Config::new(ConfigKey::SerialComm, ConfigValue::String("9600/8n1".into()))];
        assert!(matches!(DRIVER.scan(&options), Err(AcqError::Arg(_))));
    }
}

//! The `demo` driver.
//!
//! Scanning creates one virtual device with logic channels `D0..` in the
//! `Logic` channel group and analog channels `A0..` in the `Analog` group.
//! Acquisition registers a descriptor-less event source; while it is the
//! only source the session free-wheels over it. Each callback emits as many
//! samples as the configured samplerate calls for since the start, in logic
//! chunks of at most [`LOGIC_BUFSIZE`] bytes plus one analog packet per
//! enabled analog channel, and stops itself once the software limits are
//! reached.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use acq_core::config::{ConfigKey, ConfigValue};
use acq_core::datafeed::{Analog, Logic, MqFlags, Packet, Quantity, Unit};
use acq_core::driver::{Driver, DriverContext};
use acq_core::mux::{PollEvents, PollObject};
use acq_core::std_driver::{send_end, send_header, send_meta};
use acq_core::{
    AcqError, AcqResult, ChannelGroup, ChannelKind, Config, Device, DeviceInstance, DeviceStatus,
    Session, SwLimits,
};

use crate::pattern::{AnalogPattern, LogicGenerator, LogicPattern, DEFAULT_AMPLITUDE};
use crate::rng::DemoRng;

/// Largest logic packet, in bytes.
pub const LOGIC_BUFSIZE: usize = 4096;

pub const DEFAULT_SAMPLERATE: u64 = 200_000;
pub const DEFAULT_NUM_LOGIC_CHANNELS: u64 = 8;
pub const DEFAULT_NUM_ANALOG_CHANNELS: u64 = 4;

/// Wake-up interval of the acquisition source when other sources exist.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Samplerate range as `[min, max, step]`.
const SAMPLERATE_STEPS: [u64; 3] = [1, 1_000_000_000, 1];

const SCAN_OPTIONS: &[ConfigKey] = &[ConfigKey::NumLogicChannels, ConfigKey::NumAnalogChannels];

const DEVICE_OPTIONS: &[ConfigKey] = &[
    ConfigKey::LogicAnalyzer,
    ConfigKey::DemoDevice,
    ConfigKey::SampleRate,
    ConfigKey::Continuous,
    ConfigKey::LimitSamples,
    ConfigKey::LimitMsec,
];

const LOGIC_GROUP_OPTIONS: &[ConfigKey] = &[ConfigKey::PatternMode];
const ANALOG_GROUP_OPTIONS: &[ConfigKey] = &[ConfigKey::PatternMode, ConfigKey::Amplitude];

struct AnalogGen {
    channel: usize,
    pattern: AnalogPattern,
    period: Vec<f32>,
}

/// Per-device private state.
struct DemoState {
    samplerate: u64,
    limits: SwLimits,
    continuous: bool,
    num_logic: usize,
    logic_channels: Vec<usize>,
    logic: LogicGenerator,
    analog: Vec<AnalogGen>,
    amplitude: f64,
    rng: DemoRng,
    /// Samples emitted since the acquisition started.
    sent: u64,
    /// Samples already emitted when `started` was last reset.
    base_sent: u64,
    started: Option<Instant>,
    /// Settings changed mid-acquisition, reported before the next data.
    pending_meta: Vec<Config>,
    source: Option<PollObject>,
}

impl DemoState {
    fn begin(&mut self) {
        self.sent = 0;
        self.base_sent = 0;
        self.pending_meta.clear();
        self.logic.reset();
        self.limits.acquisition_start();
        for gen in &mut self.analog {
            gen.period = gen.pattern.period(self.amplitude);
        }
        self.started = Some(Instant::now());
    }

    fn pattern_name(&self, kind: ChannelKind, cg: &ChannelGroup) -> AcqResult<String> {
        match kind {
            ChannelKind::Logic => Ok(self.logic.pattern.to_string()),
            ChannelKind::Analog => self
                .analog
                .iter()
                .find(|gen| cg.channels.contains(&gen.channel))
                .map(|gen| gen.pattern.to_string())
                .ok_or_else(|| AcqError::arg(format!("channel group '{}' has no analog channel", cg.name))),
        }
    }

    /// Generate everything that is due. Returns the packets and whether the
    /// acquisition has reached its limits.
    fn produce(&mut self, enabled: &[usize]) -> AcqResult<(Vec<Packet>, bool)> {
        let Some(started) = self.started else {
            return Ok((Vec::new(), true));
        };

        let due = started.elapsed().as_micros() * u128::from(self.samplerate) / 1_000_000;
        let mut expected = u64::try_from(due)
            .unwrap_or(u64::MAX)
            .saturating_add(self.base_sent);
        if !self.continuous && self.limits.limit_samples > 0 {
            expected = expected.min(self.limits.limit_samples);
        }
        let mut todo = expected.saturating_sub(self.sent);

        let send_logic = self.num_logic > 0 && self.logic_channels.iter().any(|ch| enabled.contains(ch));
        let unit_size = self.logic.unit_size();
        let chunk_max = (LOGIC_BUFSIZE / unit_size).max(1) as u64;

        let mut packets = Vec::new();
        while todo > 0 {
            let n = todo.min(chunk_max);
            let count = n as usize;

            if send_logic {
                let mut data = vec![0u8; count * unit_size];
                self.logic.fill(&mut data, &mut self.rng);
                packets.push(Packet::Logic(Logic::new(data, unit_size)?));
            }

            for gen in self.analog.iter().filter(|gen| enabled.contains(&gen.channel)) {
                let len = gen.period.len() as u64;
                let data = (0..n)
                    .map(|k| gen.period[((self.sent + k) % len) as usize])
                    .collect();
                packets.push(Packet::Analog(Analog::new(
                    vec![gen.channel],
                    data,
                    Quantity::Voltage,
                    Unit::Volt,
                    MqFlags::empty(),
                )?));
            }

            self.sent += n;
            self.limits.update_samples_read(n);
            todo -= n;
        }

        let done = !self.continuous && self.limits.check();
        Ok((packets, done))
    }
}

/// Kind of the channels in `cg`, looked up on the device.
fn group_kind(sdi: &DeviceInstance, cg: &ChannelGroup) -> AcqResult<ChannelKind> {
    cg.channels
        .first()
        .and_then(|&idx| sdi.channel(idx))
        .map(|ch| ch.kind)
        .ok_or_else(|| AcqError::arg(format!("channel group '{}' has no channels on {}", cg.name, sdi.id())))
}

fn expect_u64(key: ConfigKey, value: &ConfigValue) -> AcqResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| AcqError::arg(format!("'{}' expects an unsigned integer", key)))
}

/// Replace the seed of the device's random pattern.
pub fn set_random_seed(sdi: &mut DeviceInstance, seed: u64) -> AcqResult<()> {
    sdi.driver_state_mut::<DemoState>()?.rng = DemoRng::new(Some(seed));
    Ok(())
}

pub struct DemoDriver {
    devices: Mutex<Vec<Device>>,
}

impl DemoDriver {
    pub const fn new() -> Self {
        Self {
            devices: parking_lot::const_mutex(Vec::new()),
        }
    }
}

impl Default for DemoDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Event-source callback body; `false` removes the source.
fn prepare_data(device: &Device, session: &Session) -> bool {
    let finished = {
        let mut sdi = device.lock();
        let enabled: Vec<usize> = sdi.enabled_channels().map(|ch| ch.index).collect();
        let produced = sdi.driver_state_mut::<DemoState>().and_then(|state| {
            let meta = std::mem::take(&mut state.pending_meta);
            state.produce(&enabled).map(|(packets, done)| (meta, packets, done))
        });
        match produced {
            Ok((meta, packets, done)) => {
                let mut failed = false;
                if !meta.is_empty() {
                    if let Err(e) = send_meta(session, &sdi, meta) {
                        tracing::error!(device = %sdi.id(), error = %e, "Failed to send demo metadata");
                        failed = true;
                    }
                }
                if !failed {
                    for packet in &packets {
                        if let Err(e) = session.send(&sdi, packet) {
                            tracing::error!(device = %sdi.id(), error = %e, "Failed to send demo data");
                            failed = true;
                            break;
                        }
                    }
                }
                done || failed
            }
            Err(e) => {
                tracing::error!(device = %sdi.id(), error = %e, "Failed to generate demo data");
                true
            }
        }
    };

    if finished {
        tracing::debug!(device = %device.id(), "Requested number of samples reached");
        if let Err(e) = stop_acquisition(device, session) {
            tracing::warn!(device = %device.id(), error = %e, "Failed to stop demo acquisition");
        }
        return false;
    }
    true
}

/// Remove the acquisition source and send the end packet. A second call is
/// a no-op.
fn stop_acquisition(device: &Device, session: &Session) -> AcqResult<()> {
    let source = {
        let mut sdi = device.lock();
        let state = sdi.driver_state_mut::<DemoState>()?;
        state.started = None;
        let source = state.source.take();
        if source.is_some() && sdi.status == DeviceStatus::Active {
            sdi.status = DeviceStatus::Stopping;
        }
        source
    };
    let Some(source) = source else {
        return Ok(());
    };
    let removed = session.source_remove(source);

    let mut sdi = device.lock();
    if sdi.status == DeviceStatus::Stopping {
        sdi.status = DeviceStatus::Active;
    }
    removed?;
    tracing::debug!(device = %sdi.id(), "Stopping demo acquisition");
    send_end(session, &sdi)
}

impl Driver for DemoDriver {
    fn name(&self) -> &'static str {
        "demo"
    }

    fn long_name(&self) -> &'static str {
        "Demo driver and pattern generator"
    }

    fn init(&self, _ctx: &DriverContext) -> AcqResult<()> {
        tracing::debug!(driver = self.name(), "Demo driver ready");
        Ok(())
    }

    fn scan(&'static self, options: &[Config]) -> AcqResult<Vec<Device>> {
        let mut num_logic = DEFAULT_NUM_LOGIC_CHANNELS;
        let mut num_analog = DEFAULT_NUM_ANALOG_CHANNELS;
        for option in options {
            match option.key {
                ConfigKey::NumLogicChannels => num_logic = expect_u64(option.key, &option.value)?,
                ConfigKey::NumAnalogChannels => num_analog = expect_u64(option.key, &option.value)?,
                _ => {}
            }
        }
        if num_logic > 64 || num_analog > 64 {
            return Err(AcqError::arg("demo device supports at most 64 channels per kind"));
        }
        if num_logic + num_analog == 0 {
            return Err(AcqError::arg("demo device needs at least one channel"));
        }

        let mut sdi = DeviceInstance::new("Demo device", "", "").with_driver(self);

        let logic_channels: Vec<usize> = (0..num_logic)
            .map(|i| sdi.add_channel(ChannelKind::Logic, &format!("D{}", i), true))
            .collect();
        if !logic_channels.is_empty() {
            sdi.channel_groups.push(ChannelGroup::new("Logic", logic_channels.clone()));
        }

        let analog_channels: Vec<usize> = (0..num_analog)
            .map(|i| sdi.add_channel(ChannelKind::Analog, &format!("A{}", i), true))
            .collect();
        if !analog_channels.is_empty() {
            sdi.channel_groups.push(ChannelGroup::new("Analog", analog_channels.clone()));
        }

        let analog = analog_channels
            .iter()
            .enumerate()
            .map(|(n, &channel)| AnalogGen {
                channel,
                pattern: AnalogPattern::nth_default(n),
                period: Vec::new(),
            })
            .collect();

        let num_logic = logic_channels.len();
        sdi.set_driver_state(DemoState {
            samplerate: DEFAULT_SAMPLERATE,
            limits: SwLimits::new(),
            continuous: false,
            num_logic,
            logic_channels,
            logic: LogicGenerator::new(LogicPattern::default(), num_logic.div_ceil(8)),
            analog,
            amplitude: DEFAULT_AMPLITUDE,
            rng: DemoRng::default(),
            sent: 0,
            base_sent: 0,
            started: None,
            pending_meta: Vec::new(),
            source: None,
        });

        tracing::debug!(
            device = %sdi.id(),
            logic = num_logic,
            analog = num_analog,
            "Demo device created"
        );
        let device = Device::new(sdi);
        self.devices.lock().push(device.clone());
        Ok(vec![device])
    }

    fn list(&self) -> Vec<Device> {
        self.devices.lock().clone()
    }

    fn clear(&self) -> AcqResult<()> {
        self.devices.lock().clear();
        Ok(())
    }

    fn open(&self, _sdi: &mut DeviceInstance) -> AcqResult<()> {
        Ok(())
    }

    fn close(&self, _sdi: &mut DeviceInstance) -> AcqResult<()> {
        Ok(())
    }

    fn config_get(
        &self,
        key: ConfigKey,
        sdi: Option<&DeviceInstance>,
        cg: Option<&ChannelGroup>,
    ) -> AcqResult<ConfigValue> {
        let Some(sdi) = sdi else {
            return Err(AcqError::NotApplicable);
        };
        let state = sdi.driver_state::<DemoState>()?;

        let Some(cg) = cg else {
            return match key {
                ConfigKey::SampleRate => Ok(ConfigValue::UInt64(state.samplerate)),
                ConfigKey::LimitSamples | ConfigKey::LimitMsec => state.limits.config_get(key),
                ConfigKey::Continuous => Ok(ConfigValue::Bool(state.continuous)),
                _ => Err(AcqError::NotApplicable),
            };
        };

        let kind = group_kind(sdi, cg)?;
        match (kind, key) {
            (_, ConfigKey::PatternMode) => state.pattern_name(kind, cg).map(ConfigValue::String),
            (ChannelKind::Analog, ConfigKey::Amplitude) => Ok(ConfigValue::Float(state.amplitude)),
            _ => Err(AcqError::NotApplicable),
        }
    }

    fn config_set(
        &self,
        key: ConfigKey,
        value: &ConfigValue,
        sdi: &mut DeviceInstance,
        cg: Option<&ChannelGroup>,
    ) -> AcqResult<()> {
        if sdi.status != DeviceStatus::Active {
            return Err(AcqError::DeviceClosed);
        }
        let kind = cg.map(|cg| group_kind(sdi, cg)).transpose()?;
        let id = sdi.id();
        let state = sdi.driver_state_mut::<DemoState>()?;

        match (cg.zip(kind), key) {
            (None, ConfigKey::SampleRate) => {
                let rate = expect_u64(key, value)?;
                if rate == 0 {
                    return Err(AcqError::arg("samplerate must be greater than zero"));
                }
                state.samplerate = rate;
                if state.started.is_some() {
                    // Pace the new rate from now on.
                    state.base_sent = state.sent;
                    state.started = Some(Instant::now());
                    state.pending_meta.push(Config::new(key, ConfigValue::UInt64(rate)));
                }
                tracing::debug!(device = %id, samplerate = rate, "Setting samplerate");
            }
            (None, ConfigKey::LimitSamples) => {
                state.limits.limit_msec = 0;
                state.limits.config_set(key, value)?;
                tracing::debug!(device = %id, limit = state.limits.limit_samples, "Setting sample limit");
            }
            (None, ConfigKey::LimitMsec) => {
                state.limits.limit_samples = 0;
                state.limits.config_set(key, value)?;
                tracing::debug!(device = %id, limit_ms = state.limits.limit_msec, "Setting time limit");
            }
            (None, ConfigKey::Continuous) => {
                state.continuous = value
                    .as_bool()
                    .ok_or_else(|| AcqError::arg(format!("'{}' expects a boolean", key)))?;
            }
            (Some((_, ChannelKind::Logic)), ConfigKey::PatternMode) => {
                let name = value
                    .as_str()
                    .ok_or_else(|| AcqError::arg(format!("'{}' expects a string", key)))?;
                state.logic.pattern = name.parse()?;
                tracing::debug!(device = %id, pattern = name, "Setting logic pattern");
            }
            (Some((cg, ChannelKind::Analog)), ConfigKey::PatternMode) => {
                let name = value
                    .as_str()
                    .ok_or_else(|| AcqError::arg(format!("'{}' expects a string", key)))?;
                let pattern: AnalogPattern = name.parse()?;
                for gen in state.analog.iter_mut().filter(|gen| cg.channels.contains(&gen.channel)) {
                    gen.pattern = pattern;
                }
                tracing::debug!(device = %id, group = %cg.name, pattern = name, "Setting analog pattern");
            }
            (Some((_, ChannelKind::Analog)), ConfigKey::Amplitude) => {
                let amplitude = value
                    .as_f64()
                    .filter(|a| a.is_finite() && *a > 0.0)
                    .ok_or_else(|| AcqError::arg("amplitude must be a positive number"))?;
                state.amplitude = amplitude;
            }
            _ => return Err(AcqError::NotApplicable),
        }
        Ok(())
    }

    fn config_list(
        &self,
        key: ConfigKey,
        sdi: Option<&DeviceInstance>,
        cg: Option<&ChannelGroup>,
    ) -> AcqResult<ConfigValue> {
        if key == ConfigKey::ScanOptions {
            return Ok(ConfigValue::Keys(SCAN_OPTIONS.to_vec()));
        }

        let Some(cg) = cg else {
            return match key {
                ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(DEVICE_OPTIONS.to_vec())),
                ConfigKey::SampleRate => Ok(ConfigValue::UInt64List(SAMPLERATE_STEPS.to_vec())),
                _ => Err(AcqError::NotApplicable),
            };
        };

        let sdi = sdi.ok_or_else(|| AcqError::arg("channel group options need a device instance"))?;
        match (group_kind(sdi, cg)?, key) {
            (ChannelKind::Logic, ConfigKey::DeviceOptions) => {
                Ok(ConfigValue::Keys(LOGIC_GROUP_OPTIONS.to_vec()))
            }
            (ChannelKind::Analog, ConfigKey::DeviceOptions) => {
                Ok(ConfigValue::Keys(ANALOG_GROUP_OPTIONS.to_vec()))
            }
            (ChannelKind::Logic, ConfigKey::PatternMode) => Ok(ConfigValue::Strings(LogicPattern::names())),
            (ChannelKind::Analog, ConfigKey::PatternMode) => Ok(ConfigValue::Strings(AnalogPattern::names())),
            _ => Err(AcqError::NotApplicable),
        }
    }

    fn acquisition_start(&self, device: &Device, session: &Session) -> AcqResult<()> {
        {
            let mut sdi = device.lock();
            if sdi.status != DeviceStatus::Active {
                return Err(AcqError::DeviceClosed);
            }
            let state = sdi.driver_state_mut::<DemoState>()?;
            if state.source.is_some() {
                return Err(AcqError::arg("demo acquisition already running"));
            }
            state.begin();
        }

        let object = PollObject::dummy();
        let source_device = device.clone();
        session.source_add(
            object,
            PollEvents::empty(),
            POLL_INTERVAL,
            Box::new(move |session, _events| prepare_data(&source_device, session)),
        )?;

        let mut sdi = device.lock();
        sdi.driver_state_mut::<DemoState>()?.source = Some(object);
        tracing::info!(device = %sdi.id(), "Demo acquisition started");
        send_header(session, &sdi)
    }

    fn acquisition_stop(&self, device: &Device, session: &Session) -> AcqResult<()> {
        stop_acquisition(device, session)
    }
}

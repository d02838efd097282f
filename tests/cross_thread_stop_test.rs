//! Stopping a session that is blocked in poll from another thread.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use acq_core::mux::PollEvents;
use acq_core::std_driver::{send_header, serial_acquisition_stop};
use acq_core::StreamTransport;
use parking_lot::Mutex;
use rust_acq::prelude::*;

/// Per-device state: how often `acquisition_stop` ran, plus the far end of
/// the device's socket so it never hangs up.
struct PipeState {
    stops: usize,
    _peer: UnixStream,
}

/// Devices backed by a silent socket: their sources never become ready, so
/// `run()` blocks in poll until something wakes it.
struct PipeDriver {
    devices: Mutex<Vec<Device>>,
    reads: AtomicUsize,
}

static PIPE: PipeDriver = PipeDriver {
    devices: parking_lot::const_mutex(Vec::new()),
    reads: AtomicUsize::new(0),
};

impl Driver for PipeDriver {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn long_name(&self) -> &'static str {
        "Silent socket test driver"
    }

    fn init(&self, _ctx: &acq_core::DriverContext) -> AcqResult<()> {
        Ok(())
    }

    fn scan(&'static self, _options: &[Config]) -> AcqResult<Vec<Device>> {
        let (ours, peer) = UnixStream::pair()?;
        let mut sdi = DeviceInstance::new("Test", "Pipe", "1").with_driver(self);
        sdi.add_channel(ChannelKind::Logic, "D0", true);
        sdi.conn = Some(Box::new(StreamTransport::new(ours, "pipe")?));
        sdi.set_driver_state(PipeState { stops: 0, _peer: peer });
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

    fn config_list(
        &self,
        key: ConfigKey,
        _sdi: Option<&DeviceInstance>,
        _cg: Option<&ChannelGroup>,
    ) -> AcqResult<ConfigValue> {
        match key {
            ConfigKey::ScanOptions | ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(Vec::new())),
            _ => Err(AcqError::NotApplicable),
        }
    }

    fn acquisition_start(&self, device: &Device, session: &Session) -> AcqResult<()> {
        let sdi = device.lock();
        let conn = sdi.conn.as_ref().ok_or_else(|| AcqError::bug("pipe device without socket"))?;
        let source_device = device.clone();
        session.source_add_transport(
            &**conn,
            PollEvents::IN,
            Duration::ZERO,
            Box::new(move |_, _| {
                let mut sdi = source_device.lock();
                let mut buf = [0u8; 16];
                if let Some(conn) = sdi.conn.as_mut() {
                    let _ = conn.read_nonblocking(&mut buf);
                }
                PIPE.reads.fetch_add(1, Ordering::SeqCst);
                true
            }),
        )?;
        send_header(session, &sdi)
    }

    fn acquisition_stop(&self, device: &Device, session: &Session) -> AcqResult<()> {
        let mut sdi = device.lock();
        sdi.driver_state_mut::<PipeState>()?.stops += 1;
        serial_acquisition_stop(session, &mut sdi)
    }
}

fn pipe_device() -> Device {
    let device = driver::driver_scan(&PIPE, &[]).unwrap().remove(0);
    driver::open(&mut device.lock()).unwrap();
    device
}

#[test]
fn stop_from_another_thread_unblocks_run() {
    let devices = [pipe_device(), pipe_device()];
    let session = Session::new().unwrap();
    for device in &devices {
        session.add_device(device).unwrap();
    }

    let ends = std::rc::Rc::new(std::cell::Cell::new(0));
    let sink = std::rc::Rc::clone(&ends);
    session.add_datafeed_callback(move |_, packet| {
        if packet.kind() == PacketKind::End {
            sink.set(sink.get() + 1);
        }
    });

    session.start().unwrap();
    assert_eq!(session.source_count(), 2);

    let stop = session.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stop.stop();
    });

    let started = Instant::now();
    session.run().unwrap();
    let elapsed = started.elapsed();
    stopper.join().unwrap();

    assert!(elapsed >= Duration::from_millis(40), "run returned before the stop: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "run took {:?}", elapsed);
    assert_eq!(PIPE.reads.load(Ordering::SeqCst), 0);
    for device in &devices {
        assert_eq!(device.lock().driver_state::<PipeState>().unwrap().stops, 1);
        assert_eq!(device.lock().status, DeviceStatus::Active);
    }
    assert_eq!(ends.get(), 2);
    assert_eq!(session.source_count(), 0);
    assert!(!session.is_running());
}

#[test]
fn stop_requested_before_run_is_observed_immediately() {
    let device = pipe_device();
    let session = Session::new().unwrap();
    session.add_device(&device).unwrap();
    session.start().unwrap();

    session.stop_handle().stop();
    session.run().unwrap();
    assert_eq!(device.lock().driver_state::<PipeState>().unwrap().stops, 1);
    assert_eq!(session.source_count(), 0);
}

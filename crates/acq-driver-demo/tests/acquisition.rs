//! Demo acquisitions run through a real session.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use acq_core::config::{ConfigKey, ConfigValue};
use acq_core::{driver, Device, DeviceStatus, Packet, PacketKind, Session};
use acq_driver_demo::{set_random_seed, DRIVER};

fn demo_device(settings: &[(ConfigKey, ConfigValue)]) -> Device {
    let device = driver::driver_scan(&DRIVER, &[]).unwrap().remove(0);
    {
        let mut sdi = device.lock();
        driver::open(&mut sdi).unwrap();
        for (key, value) in settings {
            driver::config_set(&mut sdi, None, *key, value.clone()).unwrap();
        }
    }
    device
}

/// Run a session over `device` and return every packet it produced.
fn capture(device: &Device) -> Vec<Packet> {
    let session = Session::new().unwrap();
    session.add_device(device).unwrap();
    let packets = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&packets);
    session.add_datafeed_callback(move |_, packet| sink.borrow_mut().push(packet.deep_copy()));

    session.start().unwrap();
    session.run().unwrap();
    assert_eq!(session.source_count(), 0);
    assert!(!session.is_running());

    let captured = packets.borrow().clone();
    captured
}

fn logic_samples(packets: &[Packet]) -> usize {
    packets
        .iter()
        .map(|p| match p {
            Packet::Logic(l) => l.num_samples(),
            _ => 0,
        })
        .sum()
}

fn analog_samples(packets: &[Packet], channel: usize) -> usize {
    packets
        .iter()
        .map(|p| match p {
            Packet::Analog(a) if a.channels == [channel] => a.num_samples(),
            _ => 0,
        })
        .sum()
}

#[test]
fn sample_limit_is_met_exactly() {
    let device = demo_device(&[
        (ConfigKey::SampleRate, ConfigValue::UInt64(1_000_000)),
        (ConfigKey::LimitSamples, ConfigValue::UInt64(5_000)),
    ]);
    let packets = capture(&device);

    assert_eq!(packets.first().map(Packet::kind), Some(PacketKind::Header));
    assert_eq!(packets.last().map(Packet::kind), Some(PacketKind::End));
    assert_eq!(packets.iter().filter(|p| p.kind() == PacketKind::Header).count(), 1);
    assert_eq!(packets.iter().filter(|p| p.kind() == PacketKind::End).count(), 1);

    assert_eq!(logic_samples(&packets), 5_000);
    for channel in 8..12 {
        assert_eq!(analog_samples(&packets, channel), 5_000);
    }
    // Stopping is only held while the acquisition is torn down.
    assert_eq!(device.lock().status, DeviceStatus::Active);
}

#[test]
fn time_limit_stops_acquisition() {
    let device = demo_device(&[
        (ConfigKey::SampleRate, ConfigValue::UInt64(100_000)),
        (ConfigKey::LimitMsec, ConfigValue::UInt64(30)),
    ]);
    let started = Instant::now();
    let packets = capture(&device);

    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(packets.last().map(Packet::kind), Some(PacketKind::End));
    assert!(logic_samples(&packets) > 0);
}

#[test]
fn disabled_channels_are_not_sent() {
    let device = demo_device(&[(ConfigKey::LimitSamples, ConfigValue::UInt64(1_000))]);
    {
        let mut sdi = device.lock();
        for index in 0..8 {
            sdi.enable_channel(index, false).unwrap();
        }
        sdi.enable_channel(9, false).unwrap();
    }
    let packets = capture(&device);

    assert_eq!(logic_samples(&packets), 0);
    assert_eq!(analog_samples(&packets, 8), 1_000);
    assert_eq!(analog_samples(&packets, 9), 0);
}

#[test]
fn random_pattern_is_reproducible() {
    let run = || {
        let device = demo_device(&[
            (ConfigKey::SampleRate, ConfigValue::UInt64(1_000_000_000)),
            (ConfigKey::LimitSamples, ConfigValue::UInt64(256)),
        ]);
        {
            let mut sdi = device.lock();
            let logic = sdi.channel_group("Logic").unwrap().clone();
            driver::config_set(&mut sdi, Some(&logic), ConfigKey::PatternMode, ConfigValue::String("random".into()))
                .unwrap();
            set_random_seed(&mut sdi, 1234).unwrap();
        }
        capture(&device)
            .into_iter()
            .filter_map(|p| match p {
                Packet::Logic(l) => Some(l.data().to_vec()),
                _ => None,
            })
            .flatten()
            .collect::<Vec<u8>>()
    };

    let first = run();
    assert_eq!(first.len(), 256);
    assert_eq!(first, run());
}

#[test]
fn continuous_acquisition_stops_on_request() {
    let device = demo_device(&[(ConfigKey::Continuous, ConfigValue::Bool(true))]);
    let session = Session::new().unwrap();
    session.add_device(&device).unwrap();

    let stop = session.stop_handle();
    let kinds = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&kinds);
    session.add_datafeed_callback(move |_, packet| {
        let mut kinds = sink.borrow_mut();
        kinds.push(packet.kind());
        if kinds.iter().filter(|k| **k == PacketKind::Logic).count() == 3 {
            stop.stop();
        }
    });

    session.start().unwrap();
    session.run().unwrap();

    let kinds = kinds.borrow();
    assert_eq!(kinds.first(), Some(&PacketKind::Header));
    assert_eq!(kinds.last(), Some(&PacketKind::End));
    assert!(kinds.iter().filter(|k| **k == PacketKind::Logic).count() >= 3);
    assert_eq!(session.source_count(), 0);
}

#[test]
fn closed_device_cannot_start() {
    let device = driver::driver_scan(&DRIVER, &[]).unwrap().remove(0);
    let session = Session::new().unwrap();
    session.add_device(&device).unwrap();
    assert!(session.start().is_err());
}

#[test]
fn device_added_while_running_starts_at_once() {
    let first = demo_device(&[
        (ConfigKey::SampleRate, ConfigValue::UInt64(1_000_000)),
        (ConfigKey::LimitSamples, ConfigValue::UInt64(100_000)),
    ]);
    let late = demo_device(&[(ConfigKey::LimitSamples, ConfigValue::UInt64(1_000))]);

    let session = Rc::new(Session::new().unwrap());
    session.add_device(&first).unwrap();

    // Joins the session from inside dispatch, on the first device's first
    // logic packet.
    let weak = Rc::downgrade(&session);
    let pending = RefCell::new(Some(late.clone()));
    let first_id = first.id();
    session.add_datafeed_callback(move |sdi, packet| {
        if sdi.id() != first_id || packet.kind() != PacketKind::Logic {
            return;
        }
        if let (Some(device), Some(session)) = (pending.borrow_mut().take(), weak.upgrade()) {
            assert!(session.is_running());
            session.add_device(&device).unwrap();
        }
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let late_id = late.id();
    session.add_datafeed_callback(move |sdi, packet| {
        if sdi.id() == late_id {
            sink.borrow_mut().push(packet.deep_copy());
        }
    });

    session.start().unwrap();
    session.run().unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.first().map(Packet::kind), Some(PacketKind::Header));
    assert_eq!(seen.last().map(Packet::kind), Some(PacketKind::End));
    assert_eq!(seen.iter().filter(|p| p.kind() == PacketKind::End).count(), 1);
    assert_eq!(logic_samples(&seen), 1_000);
    assert_eq!(session.devices().len(), 2);
    assert_eq!(session.source_count(), 0);
}

//! Settings changed during an acquisition are reported in the datafeed.

use std::cell::RefCell;
use std::rc::Rc;

use acq_driver_demo::DRIVER;
use rust_acq::prelude::*;
use tracing_test::traced_test;

#[test]
#[traced_test]
fn samplerate_change_is_reported_before_more_data() {
    let device = driver::driver_scan(&DRIVER, &[]).unwrap().remove(0);
    {
        let mut sdi = device.lock();
        driver::open(&mut sdi).unwrap();
        driver::config_set(&mut sdi, None, ConfigKey::LimitSamples, ConfigValue::UInt64(2_000)).unwrap();
    }

    let session = Session::new().unwrap();
    session.add_device(&device).unwrap();
    let packets = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&packets);
    session.add_datafeed_callback(move |_, packet| sink.borrow_mut().push(packet.deep_copy()));

    session.start().unwrap();
    driver::config_set(&mut device.lock(), None, ConfigKey::SampleRate, ConfigValue::UInt64(500_000)).unwrap();
    session.run().unwrap();

    let packets = packets.borrow();
    let kinds: Vec<PacketKind> = packets.iter().map(Packet::kind).collect();
    assert_eq!(kinds[..2], [PacketKind::Header, PacketKind::Meta]);
    assert_eq!(kinds.last(), Some(&PacketKind::End));
    assert_eq!(kinds.iter().filter(|k| **k == PacketKind::Meta).count(), 1);
    assert_eq!(
        packets[1],
        Packet::Meta(vec![Config::new(ConfigKey::SampleRate, ConfigValue::UInt64(500_000))])
    );
    assert!(logs_contain("bus: Received meta packet"));
    assert!(logs_contain("Sending meta packet"));
}

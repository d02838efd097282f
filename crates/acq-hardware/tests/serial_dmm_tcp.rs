//! The meter driver end to end over a raw TCP connection to a simulated
//! meter.

use std::cell::RefCell;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use acq_core::config::{ConfigKey, ConfigValue};
use acq_core::{driver, Config, Device, MqFlags, Packet, PacketKind, Quantity, Session, Settings, Unit};
use acq_hardware::drivers::Reading;
use acq_hardware::Context;
use serial_test::serial;

fn frame(value: f32) -> Vec<u8> {
    Reading {
        mq: Quantity::Voltage,
        unit: Unit::Volt,
        flags: MqFlags::DC,
        value,
    }
    .encode()
    .unwrap()
}

/// Bind a simulated meter and run `serve` on its first connection.
fn spawn_meter<F>(serve: F) -> (String, thread::JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            serve(stream);
        }
    });
    (format!("tcp-raw/127.0.0.1/{}", port), handle)
}

/// Stream one frame every 5 ms until the client goes away.
fn stream_frames(mut stream: TcpStream) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut value = 0.0f32;
    while Instant::now() < deadline {
        if stream.write_all(&frame(value)).is_err() {
            return;
        }
        value += 1.0;
        thread::sleep(Duration::from_millis(5));
    }
}

fn context(detect_timeout_ms: u64) -> Context {
    let mut settings = Settings::default();
    settings.serial.detect_timeout_ms = detect_timeout_ms;
    Context::new(settings).unwrap()
}

fn scan_one(ctx: &Context, conn: &str) -> Device {
    let mut devices = ctx
        .scan("serial-dmm", &[Config::new(ConfigKey::Conn, ConfigValue::String(conn.into()))])
        .unwrap();
    assert_eq!(devices.len(), 1);
    let device = devices.remove(0);
    driver::open(&mut device.lock()).unwrap();
    device
}

fn capture(device: &Device) -> Vec<Packet> {
    let session = Session::new().unwrap();
    session.add_device(device).unwrap();
    let packets = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&packets);
    session.add_datafeed_callback(move |_, packet| sink.borrow_mut().push(packet.clone()));
    session.start().unwrap();
    session.run().unwrap();
    assert_eq!(session.source_count(), 0);
    let captured = packets.borrow().clone();
    captured
}

#[test]
#[serial]
fn sample_limit_over_tcp() {
    let (conn, server) = spawn_meter(stream_frames);
    let ctx = context(2_000);
    let device = scan_one(&ctx, &conn);
    {
        let sdi = device.lock();
        assert_eq!(sdi.connection_id.as_deref(), Some(conn.as_str()));
        assert_eq!(sdi.channels()[0].name, "P1");
    }
    driver::config_set(&mut device.lock(), None, ConfigKey::LimitSamples, ConfigValue::UInt64(5)).unwrap();

    let packets = capture(&device);
    assert_eq!(packets.first().map(Packet::kind), Some(PacketKind::Header));
    assert_eq!(packets.last().map(Packet::kind), Some(PacketKind::End));

    let values: Vec<f32> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Analog(a) => {
                assert_eq!(a.mq, Quantity::Voltage);
                assert_eq!(a.unit, Unit::Volt);
                assert_eq!(a.flags, MqFlags::DC);
                Some(a.data[0])
            }
            _ => None,
        })
        .collect();
    assert_eq!(values.len(), 5);
    assert!(values.windows(2).all(|w| w[1] > w[0]));

    driver::close(&mut device.lock()).unwrap();
    drop(ctx);
    server.join().unwrap();
}

#[test]
#[serial]
fn peer_hangup_ends_acquisition() {
    let (conn, server) = spawn_meter(|mut stream| {
        stream.write_all(&frame(0.5)).unwrap();
        thread::sleep(Duration::from_millis(300));
        stream.write_all(&frame(1.5)).unwrap();
        stream.write_all(&frame(2.5)).unwrap();
    });
    let ctx = context(2_000);
    let device = scan_one(&ctx, &conn);
    driver::config_set(&mut device.lock(), None, ConfigKey::Continuous, ConfigValue::Bool(true)).unwrap();

    let packets = capture(&device);
    let values: Vec<f32> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Analog(a) => Some(a.data[0]),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![1.5, 2.5]);
    assert_eq!(packets.last().map(Packet::kind), Some(PacketKind::End));
    server.join().unwrap();
}

#[test]
#[serial]
fn silent_peer_yields_no_device() {
    let (conn, server) = spawn_meter(|mut stream| {
        let _ = stream.write_all(b"hello, not a meter\r\n");
        thread::sleep(Duration::from_millis(300));
    });
    let ctx = context(100);
    let devices = ctx
        .scan("serial-dmm", &[Config::new(ConfigKey::Conn, ConfigValue::String(conn))])
        .unwrap();
    assert!(devices.is_empty());
    drop(ctx);
    server.join().unwrap();
}

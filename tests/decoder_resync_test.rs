//! Streaming decoder recovery on a meter-style byte stream.

use acq_core::decoder::{Checksum, DecodeEvent, LengthField, MagicFrame, StreamDecoder};
use acq_hardware::drivers::Reading;
use rust_acq::prelude::*;

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[derive(Debug, PartialEq)]
enum Seen {
    Frame(Vec<u8>),
    Corrupt(Vec<u8>),
}

fn drain<F: acq_core::decoder::FrameFormat>(decoder: &mut StreamDecoder<F>) -> Vec<Seen> {
    let mut seen = Vec::new();
    decoder
        .process(|event| {
            seen.push(match event {
                DecodeEvent::Frame(p) => Seen::Frame(p.to_vec()),
                DecodeEvent::Corrupt(span) => Seen::Corrupt(span.to_vec()),
            });
            Ok(())
        })
        .unwrap();
    seen
}

#[test]
fn corrupted_span_is_skipped_and_next_frame_decoded() {
    let corrupt = [0x55, 0x55, 0x02, 0x01, 0x02, sum8(&[0x55, 0x55, 0x02, 0x01, 0x02]).wrapping_add(1)];
    let valid = [0x55, 0x55, 0x01, 0x07, sum8(&[0x55, 0x55, 0x01, 0x07])];

    let mut bytes = vec![0xAA];
    bytes.extend_from_slice(&corrupt);
    bytes.extend_from_slice(&valid);

    let format = MagicFrame::new(&[0x55, 0x55], LengthField::U8, Checksum::Sum8);
    let mut decoder = StreamDecoder::new(format, 64);
    assert_eq!(decoder.feed(&bytes), bytes.len());

    let seen = drain(&mut decoder);
    assert_eq!(seen, vec![Seen::Corrupt(corrupt.to_vec()), Seen::Frame(vec![0x07])]);
    assert!(decoder.buffered().is_empty());

    let stats = decoder.stats();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.checksum_errors, 1);
    assert_eq!(stats.bytes_skipped, 1 + corrupt.len() as u64);
}

#[test]
fn meter_frames_survive_line_noise() {
    let readings = [
        Reading {
            mq: Quantity::Voltage,
            unit: Unit::Volt,
            flags: MqFlags::DC,
            value: 3.3,
        },
        Reading {
            mq: Quantity::Resistance,
            unit: Unit::Ohm,
            flags: MqFlags::AUTORANGE,
            value: 470.0,
        },
    ];
    let mut bytes = vec![0x55, 0x00, 0xff];
    bytes.extend(readings[0].encode().unwrap());
    bytes.extend([0x55, 0x55, 0xff]);
    bytes.extend(readings[1].encode().unwrap());

    let mut decoder = StreamDecoder::new(acq_hardware::drivers::serial_dmm::frame_format(), 128);
    // One byte at a time, as a slow serial line delivers it.
    let mut decoded = Vec::new();
    for byte in bytes {
        decoder.feed(&[byte]);
        decoder
            .process(|event| {
                if let DecodeEvent::Frame(payload) = event {
                    decoded.push(Reading::parse(payload)?);
                }
                Ok(())
            })
            .unwrap();
    }
    assert_eq!(decoded, readings);
}

#[test]
fn full_buffer_without_frame_resets_with_io_error() {
    let format = MagicFrame::new(&[0x55, 0x55], LengthField::U8, Checksum::Sum8);
    let mut decoder = StreamDecoder::new(format, 8);
    // A header announcing a payload longer than the buffer can ever hold.
    decoder.feed(&[0x55, 0x55, 0xf0, 1, 2, 3, 4, 5]);
    let err = decoder.process(|_| Ok(())).unwrap_err();
    assert!(matches!(err, AcqError::Io(_)));
    assert!(decoder.buffered().is_empty());
    assert_eq!(decoder.stats().overflows, 1);
}

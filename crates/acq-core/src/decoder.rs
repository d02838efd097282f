//! Streaming protocol decoder.
//!
//! Serial and USB instruments deliver a byte stream in which framed packets
//! may be split across reads, preceded by garbage, or corrupted. Every such
//! driver runs the same algorithm inside its event-source callback:
//!
//! 1. append newly read bytes to a fixed-capacity buffer;
//! 2. look for a frame start at the buffer head, dropping **one** byte at a
//!    time until one matches;
//! 3. wait (`NeedMoreData`) until the self-declared frame length is buffered;
//! 4. validate the checksum; a bad frame is skipped as a whole span and
//!    reported as [`DecodeEvent::Corrupt`];
//! 5. hand a valid payload to the driver, then compact the unconsumed tail to
//!    offset 0;
//! 6. if the buffer is full and nothing in it could be consumed, wipe it and
//!    report an I/O error.
//!
//! Only steps 2 and 4 differ between instruments; they are captured by the
//! [`FrameFormat`] trait, with [`MagicFrame`] and [`NibbleSyncFrame`] covering
//! the two families seen in practice.
//!
//! # Example
//!
//! ```
//! use acq_core::decoder::{Checksum, DecodeEvent, LengthField, MagicFrame, StreamDecoder};
//!
//! let format = MagicFrame::new(&[0x55, 0x55], LengthField::U8, Checksum::Sum8);
//! let mut decoder = StreamDecoder::new(format, 256);
//! decoder.feed(&[0x00, 0x55, 0x55, 0x01, 0x07, 0xB2]);
//!
//! let mut payloads = Vec::new();
//! decoder
//!     .process(|event| {
//!         if let DecodeEvent::Frame(payload) = event {
//!             payloads.push(payload.to_vec());
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(payloads, vec![vec![0x07]]);
//! ```

use std::io;

use crc::{Crc, CRC_16_MODBUS, CRC_16_XMODEM, CRC_32_ISO_HDLC};

use crate::error::{AcqError, AcqResult};
use crate::transport::Transport;

// =============================================================================
// Checksums
// =============================================================================

const CRC16_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
const CRC16_XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checksum rule appended to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// 8-bit wrapping sum.
    Sum8,
    /// 8-bit XOR (LRC style).
    Xor8,
    /// CRC-16/MODBUS, little endian on the wire.
    Crc16Modbus,
    /// CRC-16/XMODEM, big endian on the wire.
    Crc16Xmodem,
    /// CRC-32 (ISO-HDLC), little endian on the wire.
    Crc32,
}

impl Checksum {
    /// Width on the wire in bytes.
    pub fn size(self) -> usize {
        match self {
            Checksum::Sum8 | Checksum::Xor8 => 1,
            Checksum::Crc16Modbus | Checksum::Crc16Xmodem => 2,
            Checksum::Crc32 => 4,
        }
    }

    /// Wire bytes of the checksum over `data`.
    pub fn compute(self, data: &[u8]) -> Vec<u8> {
        match self {
            Checksum::Sum8 => vec![data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))],
            Checksum::Xor8 => vec![data.iter().fold(0u8, |acc, &b| acc ^ b)],
            Checksum::Crc16Modbus => CRC16_MODBUS.checksum(data).to_le_bytes().to_vec(),
            Checksum::Crc16Xmodem => CRC16_XMODEM.checksum(data).to_be_bytes().to_vec(),
            Checksum::Crc32 => CRC32.checksum(data).to_le_bytes().to_vec(),
        }
    }

    /// Check a frame whose last `size()` bytes are the checksum of the rest.
    pub fn verify(self, frame: &[u8]) -> bool {
        let size = self.size();
        if frame.len() < size {
            return false;
        }
        let (data, received) = frame.split_at(frame.len() - size);
        self.compute(data) == received
    }
}

// =============================================================================
// Frame formats
// =============================================================================

/// Framing rules of one instrument protocol.
pub trait FrameFormat {
    /// Bytes needed before [`frame_len`](Self::frame_len) can be evaluated.
    fn header_len(&self) -> usize;

    /// Whether `prefix` (possibly shorter than the header) can begin a frame.
    fn is_frame_start(&self, prefix: &[u8]) -> bool;

    /// Total frame length declared by a complete header, `None` when the
    /// header is implausible.
    fn frame_len(&self, header: &[u8]) -> Option<usize>;

    /// Checksum / parity check over a complete frame.
    fn validate(&self, frame: &[u8]) -> bool;

    /// Payload slice of a validated frame.
    fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8];
}

/// Width and byte order of a length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    U8,
    U16Le,
    U16Be,
}

impl LengthField {
    fn size(self) -> usize {
        match self {
            LengthField::U8 => 1,
            LengthField::U16Le | LengthField::U16Be => 2,
        }
    }

    fn read(self, bytes: &[u8]) -> Option<usize> {
        match self {
            LengthField::U8 => bytes.first().map(|&b| b as usize),
            LengthField::U16Le => Some(u16::from_le_bytes([*bytes.first()?, *bytes.get(1)?]) as usize),
            LengthField::U16Be => Some(u16::from_be_bytes([*bytes.first()?, *bytes.get(1)?]) as usize),
        }
    }
}

/// `magic | length | payload | checksum`, the length counting payload bytes
/// and the checksum covering everything before it.
#[derive(Debug, Clone)]
pub struct MagicFrame {
    magic: Vec<u8>,
    length: LengthField,
    checksum: Checksum,
    max_payload: Option<usize>,
}

impl MagicFrame {
    pub fn new(magic: &[u8], length: LengthField, checksum: Checksum) -> Self {
        Self {
            magic: magic.to_vec(),
            length,
            checksum,
            max_payload: None,
        }
    }

    /// Treat declared lengths above `max` as a failed sync.
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = Some(max);
        self
    }

    /// Build a complete frame around `payload`.
    pub fn encode(&self, payload: &[u8]) -> AcqResult<Vec<u8>> {
        let too_long = || AcqError::arg(format!("payload of {} bytes does not fit the length field", payload.len()));
        let mut frame = self.magic.clone();
        match self.length {
            LengthField::U8 => frame.push(u8::try_from(payload.len()).map_err(|_| too_long())?),
            LengthField::U16Le => frame.extend_from_slice(
                &u16::try_from(payload.len()).map_err(|_| too_long())?.to_le_bytes(),
            ),
            LengthField::U16Be => frame.extend_from_slice(
                &u16::try_from(payload.len()).map_err(|_| too_long())?.to_be_bytes(),
            ),
        }
        frame.extend_from_slice(payload);
        let checksum = self.checksum.compute(&frame);
        frame.extend_from_slice(&checksum);
        Ok(frame)
    }
}

impl FrameFormat for MagicFrame {
    fn header_len(&self) -> usize {
        self.magic.len() + self.length.size()
    }

    fn is_frame_start(&self, prefix: &[u8]) -> bool {
        let n = prefix.len().min(self.magic.len());
        prefix[..n] == self.magic[..n]
    }

    fn frame_len(&self, header: &[u8]) -> Option<usize> {
        let payload = self.length.read(header.get(self.magic.len()..)?)?;
        if self.max_payload.is_some_and(|max| payload > max) {
            return None;
        }
        Some(self.header_len() + payload + self.checksum.size())
    }

    fn validate(&self, frame: &[u8]) -> bool {
        self.checksum.verify(frame)
    }

    fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        let end = frame.len().saturating_sub(self.checksum.size());
        frame.get(self.header_len()..end).unwrap_or(&[])
    }
}

/// Fixed-length frames whose every byte carries its 1-based position in the
/// high nibble (`0x1?, 0x2?, ...`), as used by many handheld meters.
///
/// The payload is the whole frame; data lives in the low nibbles.
#[derive(Debug, Clone, Copy)]
pub struct NibbleSyncFrame {
    len: usize,
}

impl NibbleSyncFrame {
    /// Frames of `len` bytes; positions must fit a nibble (1..=15).
    pub fn new(len: usize) -> AcqResult<Self> {
        if !(1..=15).contains(&len) {
            return Err(AcqError::arg(format!("nibble-sync frames must be 1..=15 bytes, got {}", len)));
        }
        Ok(Self { len })
    }

    fn position_ok(index: usize, byte: u8) -> bool {
        (byte >> 4) as usize == index + 1
    }
}

impl FrameFormat for NibbleSyncFrame {
    fn header_len(&self) -> usize {
        self.len
    }

    fn is_frame_start(&self, prefix: &[u8]) -> bool {
        prefix
            .iter()
            .take(self.len)
            .enumerate()
            .all(|(i, &b)| Self::position_ok(i, b))
    }

    fn frame_len(&self, _header: &[u8]) -> Option<usize> {
        Some(self.len)
    }

    fn validate(&self, frame: &[u8]) -> bool {
        frame.len() == self.len && self.is_frame_start(frame)
    }

    fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        frame
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// What a parse pass hands to the driver.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeEvent<'a> {
    /// Payload of a validated frame.
    Frame(&'a [u8]),
    /// A complete frame span that failed validation and was skipped.
    Corrupt(&'a [u8]),
}

/// Running totals for one decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub checksum_errors: u64,
    pub bytes_skipped: u64,
    pub overflows: u64,
}

enum Step {
    NeedMoreData,
    Consumed { frame: bool },
}

/// Fixed-capacity accumulation buffer plus the parse loop.
pub struct StreamDecoder<F> {
    format: F,
    buf: Box<[u8]>,
    len: usize,
    stats: DecoderStats,
}

impl<F: FrameFormat> StreamDecoder<F> {
    pub fn new(format: F, capacity: usize) -> Self {
        Self {
            format,
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            len: 0,
            stats: DecoderStats::default(),
        }
    }

    pub fn format(&self) -> &F {
        &self.format
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn spare_capacity(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Bytes read but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append as much of `data` as fits; returns the number of bytes taken.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.spare_capacity());
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// Fill the free tail of the buffer from a non-blocking transport.
    pub fn read_from(&mut self, transport: &mut dyn Transport) -> AcqResult<usize> {
        if self.spare_capacity() == 0 {
            return Ok(0);
        }
        let n = transport.read_nonblocking(&mut self.buf[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// Parse every complete frame in the buffer.
    ///
    /// Returns the number of valid frames handed to `handler`. A handler
    /// error stops the pass after its frame has been consumed.
    pub fn process<H>(&mut self, handler: H) -> AcqResult<usize>
    where
        H: FnMut(DecodeEvent<'_>) -> AcqResult<()>,
    {
        self.run(handler, usize::MAX)
    }

    /// Like [`process`](Self::process) but stops after the first valid frame,
    /// leaving the rest of the buffer untouched.
    pub fn process_one<H>(&mut self, handler: H) -> AcqResult<usize>
    where
        H: FnMut(DecodeEvent<'_>) -> AcqResult<()>,
    {
        self.run(handler, 1)
    }

    fn run<H>(&mut self, mut handler: H, max_frames: usize) -> AcqResult<usize>
    where
        H: FnMut(DecodeEvent<'_>) -> AcqResult<()>,
    {
        let mut offset = 0;
        let mut frames = 0;
        let mut failure = None;

        while frames < max_frames && offset < self.len {
            match self.step(offset, &mut handler) {
                Ok((Step::NeedMoreData, _)) => break,
                Ok((Step::Consumed { frame }, used)) => {
                    offset += used;
                    if frame {
                        frames += 1;
                    }
                }
                Err((e, used)) => {
                    offset += used;
                    failure = Some(e);
                    break;
                }
            }
        }

        // Compact the unconsumed tail to the buffer head.
        if offset > 0 {
            self.buf.copy_within(offset..self.len, 0);
            self.len -= offset;
        }

        if let Some(e) = failure {
            return Err(e);
        }

        if self.len == self.buf.len() {
            self.stats.overflows += 1;
            tracing::warn!(
                capacity = self.buf.len(),
                "Decoder buffer full without a valid frame; discarding"
            );
            self.len = 0;
            return Err(AcqError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "decoder buffer full without a valid frame",
            )));
        }

        Ok(frames)
    }

    /// Examine the buffer at `offset`; returns what happened and how many
    /// bytes were consumed.
    #[allow(clippy::type_complexity)]
    fn step<H>(&mut self, offset: usize, handler: &mut H) -> Result<(Step, usize), (AcqError, usize)>
    where
        H: FnMut(DecodeEvent<'_>) -> AcqResult<()>,
    {
        let avail = &self.buf[offset..self.len];

        if !self.format.is_frame_start(avail) {
            self.stats.bytes_skipped += 1;
            return Ok((Step::Consumed { frame: false }, 1));
        }

        let header_len = self.format.header_len();
        if avail.len() < header_len {
            return Ok((Step::NeedMoreData, 0));
        }

        let Some(frame_len) = self.format.frame_len(&avail[..header_len]) else {
            self.stats.bytes_skipped += 1;
            return Ok((Step::Consumed { frame: false }, 1));
        };
        if avail.len() < frame_len {
            return Ok((Step::NeedMoreData, 0));
        }

        let frame = &avail[..frame_len];
        if !self.format.validate(frame) {
            self.stats.checksum_errors += 1;
            self.stats.bytes_skipped += frame_len as u64;
            tracing::warn!(len = frame_len, "Frame failed validation; skipping its span");
            return match handler(DecodeEvent::Corrupt(frame)) {
                Ok(()) => Ok((Step::Consumed { frame: false }, frame_len)),
                Err(e) => Err((e, frame_len)),
            };
        }

        self.stats.frames += 1;
        match handler(DecodeEvent::Frame(self.format.payload(frame))) {
            Ok(()) => Ok((Step::Consumed { frame: true }, frame_len)),
            Err(e) => Err((e, frame_len)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sum8_format() -> MagicFrame {
        MagicFrame::new(&[0x55, 0x55], LengthField::U8, Checksum::Sum8)
    }

    fn collect<F: FrameFormat>(decoder: &mut StreamDecoder<F>) -> (Vec<Vec<u8>>, usize) {
        let mut frames = Vec::new();
        let mut corrupt = 0;
        decoder
            .process(|event| {
                match event {
                    DecodeEvent::Frame(p) => frames.push(p.to_vec()),
                    DecodeEvent::Corrupt(_) => corrupt += 1,
                }
                Ok(())
            })
            .unwrap();
        (frames, corrupt)
    }

    #[test]
    fn test_checksums() {
        assert_eq!(Checksum::Sum8.compute(&[0x55, 0x55, 0x01, 0x07]), vec![0xB2]);
        assert_eq!(Checksum::Xor8.compute(&[0x0F, 0xF0]), vec![0xFF]);
        // CRC-16/MODBUS check value for "123456789" is 0x4B37.
        assert_eq!(Checksum::Crc16Modbus.compute(b"123456789"), vec![0x37, 0x4B]);
        assert_eq!(Checksum::Crc16Xmodem.compute(b"123456789"), vec![0x31, 0xC3]);
        assert_eq!(Checksum::Crc32.compute(b"123456789"), 0xCBF4_3926u32.to_le_bytes().to_vec());
        assert!(!Checksum::Crc32.verify(&[1, 2]));
    }

    #[test]
    fn test_corrupt_span_skipped_then_valid_frame() {
        let mut decoder = StreamDecoder::new(sum8_format(), 64);
        decoder.feed(&[0xAA, 0x55, 0x55, 0x02, 0x01, 0x02, 0x00]);
        decoder.feed(&[0x55, 0x55, 0x01, 0x07, 0xB2]);

        let (frames, corrupt) = collect(&mut decoder);
        assert_eq!(frames, vec![vec![0x07]]);
        assert_eq!(corrupt, 1);
        assert!(decoder.buffered().is_empty());

        let stats = decoder.stats();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.bytes_skipped, 1 + 6);
    }

    #[test]
    fn test_need_more_data_keeps_bytes() {
        let format = sum8_format();
        let frame = format.encode(&[1, 2, 3]).unwrap();
        let mut decoder = StreamDecoder::new(format, 64);

        decoder.feed(&frame[..4]);
        let (frames, _) = collect(&mut decoder);
        assert!(frames.is_empty());
        assert_eq!(decoder.buffered(), &frame[..4]);

        decoder.feed(&frame[4..]);
        let (frames, _) = collect(&mut decoder);
        assert_eq!(frames, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_partial_magic_waits() {
        let mut decoder = StreamDecoder::new(sum8_format(), 64);
        decoder.feed(&[0x00, 0x55]);
        collect(&mut decoder);
        assert_eq!(decoder.buffered(), &[0x55]);
    }

    #[test]
    fn test_full_buffer_without_frame_resets() {
        let mut decoder = StreamDecoder::new(sum8_format(), 8);
        assert_eq!(decoder.feed(&[0x55; 20]), 8);
        // 55 55 55 declares an 85-byte payload that can never fit.
        let err = decoder.process(|_| Ok(())).unwrap_err();
        assert!(matches!(err, AcqError::Io(_)));
        assert!(decoder.buffered().is_empty());
        assert_eq!(decoder.stats().overflows, 1);
    }

    #[test]
    fn test_max_payload_forces_resync() {
        let format = sum8_format().with_max_payload(4);
        let good = format.encode(&[9]).unwrap();
        let mut decoder = StreamDecoder::new(format, 8);
        decoder.feed(&[0x55, 0x55, 0x55]);
        decoder.feed(&good);
        let (frames, _) = collect(&mut decoder);
        assert_eq!(frames, vec![vec![9]]);
    }

    #[test]
    fn test_handler_error_consumes_frame() {
        let format = sum8_format();
        let mut bytes = format.encode(&[1]).unwrap();
        bytes.extend(format.encode(&[2]).unwrap());
        let mut decoder = StreamDecoder::new(format, 64);
        decoder.feed(&bytes);

        let err = decoder.process(|_| Err(AcqError::arg("rejected"))).unwrap_err();
        assert!(matches!(err, AcqError::Arg(_)));
        let (frames, _) = collect(&mut decoder);
        assert_eq!(frames, vec![vec![2]]);
    }

    #[test]
    fn test_crc16_frames() {
        let format = MagicFrame::new(&[0xAB], LengthField::U16Le, Checksum::Crc16Modbus);
        let frame = format.encode(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(frame.len(), 1 + 2 + 4 + 2);
        let mut decoder = StreamDecoder::new(format, 64);
        decoder.feed(&frame);
        let (frames, corrupt) = collect(&mut decoder);
        assert_eq!(frames, vec![vec![0xDE, 0xAD, 0xBE, 0xEF]]);
        assert_eq!(corrupt, 0);
    }

    #[test]
    fn test_nibble_sync_resync() {
        let format = NibbleSyncFrame::new(4).unwrap();
        let mut decoder = StreamDecoder::new(format, 32);
        // Garbage, a broken frame (third byte out of place), then a good one.
        decoder.feed(&[0x07, 0x1A, 0x2B, 0x1C, 0x11, 0x22, 0x33, 0x44]);
        let (frames, corrupt) = collect(&mut decoder);
        assert_eq!(frames, vec![vec![0x11, 0x22, 0x33, 0x44]]);
        assert_eq!(corrupt, 0);
        assert!(NibbleSyncFrame::new(0).is_err());
        assert!(NibbleSyncFrame::new(16).is_err());
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_output(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..12), 1..8),
            chunk in 1usize..9,
        ) {
            let format = sum8_format();
            let mut stream = Vec::new();
            for p in &payloads {
                stream.extend(format.encode(p).unwrap());
            }

            let mut decoder = StreamDecoder::new(format, 64);
            let mut decoded = Vec::new();
            for piece in stream.chunks(chunk) {
                prop_assert_eq!(decoder.feed(piece), piece.len());
                decoder.process(|event| {
                    if let DecodeEvent::Frame(p) = event {
                        decoded.push(p.to_vec());
                    }
                    Ok(())
                }).unwrap();
            }
            prop_assert_eq!(decoded, payloads);
            prop_assert!(decoder.buffered().is_empty());
        }

        #[test]
        fn prop_aligned_buffer_consumes_exactly_one_frame(
            payload in proptest::collection::vec(any::<u8>(), 0..16),
            tail in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let format = sum8_format();
            let frame = format.encode(&payload).unwrap();
            let mut decoder = StreamDecoder::new(format, 64);
            decoder.feed(&frame);
            decoder.feed(&tail);

            let mut got = Vec::new();
            let n = decoder.process_one(|event| {
                if let DecodeEvent::Frame(p) = event {
                    got.push(p.to_vec());
                }
                Ok(())
            }).unwrap();
            prop_assert_eq!(n, 1);
            prop_assert_eq!(got, vec![payload]);
            prop_assert_eq!(decoder.buffered(), &tail[..]);
        }
    }
}

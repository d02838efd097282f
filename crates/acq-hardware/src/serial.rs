//! Serial transport, connection strings and scan-time stream detection.
//!
//! Connection strings:
//! - `/dev/ttyUSB0` (any other path): a serial port opened with the
//!   `serialcomm` parameters, e.g. `9600/8n1/dtr=1/rts=0/flow=0`
//! - `tcp-raw/<host>/<port>`: a raw TCP byte stream, used by serial-to-LAN
//!   bridges and by hardware-free tests

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};

use acq_core::decoder::{DecodeEvent, FrameFormat, StreamDecoder};
use acq_core::mux::{next_poll_key, wait_fd, PollEvents, PollObject};
use acq_core::{AcqError, AcqResult, StreamTransport, Transport};

const TCP_RAW_PREFIX: &str = "tcp-raw/";

/// Parsed `serialcomm` string: `<baud>[/<bits><parity><stop>][/key=value...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// `None` leaves the line as the driver found it.
    pub rts: Option<bool>,
    pub dtr: Option<bool>,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            rts: None,
            dtr: None,
        }
    }
}

fn parse_line_state(key: &str, value: &str) -> AcqResult<bool> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(AcqError::arg(format!("invalid value '{}' for {}", value, key))),
    }
}

impl SerialParams {
    pub fn parse(text: &str) -> AcqResult<Self> {
        let invalid = |why: &str| AcqError::arg(format!("serialcomm '{}': {}", text, why));
        let mut parts = text.split('/');
        let mut params = SerialParams::default();

        params.baud_rate = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|&baud| baud > 0)
            .ok_or_else(|| invalid("could not infer speed"))?;

        let mut rest = parts.peekable();
        if let Some(frame) = rest.peek().copied().filter(|s| !s.contains('=')) {
            let bytes = frame.as_bytes();
            if bytes.len() != 3 {
                return Err(invalid("frame format must look like 8n1"));
            }
            params.data_bits = match bytes[0] {
                b'5' => DataBits::Five,
                b'6' => DataBits::Six,
                b'7' => DataBits::Seven,
                b'8' => DataBits::Eight,
                _ => return Err(invalid("data bits must be 5 to 8")),
            };
            params.parity = match bytes[1] {
                b'n' => Parity::None,
                b'e' => Parity::Even,
                b'o' => Parity::Odd,
                _ => return Err(invalid("parity must be n, e or o")),
            };
            params.stop_bits = match bytes[2] {
                b'1' => StopBits::One,
                b'2' => StopBits::Two,
                _ => return Err(invalid("stop bits must be 1 or 2")),
            };
            rest.next();
        }

        for option in rest {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| invalid("options must be key=value"))?;
            match key {
                "rts" => params.rts = Some(parse_line_state(key, value)?),
                "dtr" => params.dtr = Some(parse_line_state(key, value)?),
                "flow" => {
                    params.flow_control = match value {
                        "0" => FlowControl::None,
                        "1" => FlowControl::Hardware,
                        "2" => FlowControl::Software,
                        _ => return Err(invalid("flow must be 0, 1 or 2")),
                    }
                }
                other => {
                    tracing::debug!(option = other, "Ignoring unknown serialcomm option");
                }
            }
        }
        Ok(params)
    }
}

/// Serial port transport built on `serialport`'s native TTY handle.
pub struct SerialTransport {
    port: Option<TTYPort>,
    key: u64,
    fd: i32,
    path: String,
}

impl SerialTransport {
    pub fn open(path: &str, params: &SerialParams) -> AcqResult<Self> {
        tracing::debug!(port = path, ?params, "Opening serial port");
        let mut port = serialport::new(path, params.baud_rate)
            .data_bits(params.data_bits)
            .parity(params.parity)
            .stop_bits(params.stop_bits)
            .flow_control(params.flow_control)
            .timeout(Duration::ZERO)
            .open_native()
            .map_err(io::Error::from)?;

        if let Some(rts) = params.rts {
            port.write_request_to_send(rts).map_err(io::Error::from)?;
        }
        if let Some(dtr) = params.dtr {
            port.write_data_terminal_ready(dtr).map_err(io::Error::from)?;
        }
        if let Err(e) = port.clear(ClearBuffer::Input) {
            tracing::debug!(port = path, error = %e, "Could not flush serial input");
        }

        let fd = port.as_raw_fd();
        Ok(Self {
            port: Some(port),
            key: next_poll_key(),
            fd,
            path: path.to_string(),
        })
    }

    fn port(&mut self) -> AcqResult<&mut TTYPort> {
        self.port.as_mut().ok_or(AcqError::DeviceClosed)
    }
}

impl Transport for SerialTransport {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> AcqResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.port()?.read(buf);
        match result {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_all_blocking(&mut self, data: &[u8], timeout: Duration) -> AcqResult<()> {
        let path = self.path.clone();
        let port = self.port()?;
        port.set_timeout(timeout).map_err(io::Error::from)?;
        let mut result = port.write_all(data);
        if result.is_ok() {
            result = port.flush();
        }
        port.set_timeout(Duration::ZERO).map_err(io::Error::from)?;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(AcqError::Timeout(format!(
                "write of {} bytes to {} timed out",
                data.len(),
                path
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_object(&self) -> PollObject {
        PollObject::Stream {
            key: self.key,
            fd: self.fd,
        }
    }

    fn flush_input(&mut self) -> AcqResult<()> {
        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(|e| AcqError::Io(e.into()))
    }

    fn close(&mut self) -> AcqResult<()> {
        if self.port.take().is_some() {
            tracing::debug!(port = %self.path, "Serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Open `conn`, either a serial port or a `tcp-raw/<host>/<port>` stream.
pub fn open_conn(conn: &str, serialcomm: &str) -> AcqResult<Box<dyn Transport>> {
    if let Some(target) = conn.strip_prefix(TCP_RAW_PREFIX) {
        let (host, port) = target
            .rsplit_once('/')
            .ok_or_else(|| AcqError::arg(format!("'{}' must look like tcp-raw/<host>/<port>", conn)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| AcqError::arg(format!("invalid TCP port in '{}'", conn)))?;
        tracing::debug!(host, port, "Connecting raw TCP transport");
        return Ok(Box::new(StreamTransport::connect_tcp(host, port)?));
    }

    let params = SerialParams::parse(serialcomm)?;
    Ok(Box::new(SerialTransport::open(conn, &params)?))
}

/// Read from `transport` until `decoder` yields one valid frame, or
/// `timeout` elapses. Returns the frame's payload; bytes after it stay
/// buffered in the decoder.
///
/// Meant for scan-time probing only: it blocks the calling thread.
pub fn stream_detect<F: FrameFormat>(
    transport: &mut dyn Transport,
    decoder: &mut StreamDecoder<F>,
    timeout: Duration,
) -> AcqResult<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let fd = transport.poll_object().fd();
    tracing::debug!(conn = %transport.describe(), ?timeout, "Detecting packets");

    loop {
        decoder.read_from(transport)?;

        let mut found = None;
        let outcome = decoder.process_one(|event| {
            if let DecodeEvent::Frame(payload) = event {
                found = Some(payload.to_vec());
            }
            Ok(())
        });
        match outcome {
            Ok(_) => {}
            // Full buffer of garbage: the decoder wiped it, keep listening.
            Err(AcqError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {}
            Err(e) => return Err(e),
        }
        if let Some(payload) = found {
            tracing::debug!(conn = %transport.describe(), len = payload.len(), "Valid packet detected");
            return Ok(payload);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AcqError::Timeout(format!(
                "no valid packet from {} within {:?}",
                transport.describe(),
                timeout
            )));
        }
        match fd {
            Some(fd) => {
                wait_fd(fd, PollEvents::IN, remaining)?;
            }
            None => std::thread::sleep(remaining.min(Duration::from_millis(10))),
        }
    }
}

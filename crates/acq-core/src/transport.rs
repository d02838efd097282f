//! Transport abstraction.
//!
//! The core never performs transport syscalls itself beyond polling. A
//! transport only has to offer non-blocking reads, bounded blocking writes and
//! a [`PollObject`] the multiplexer can wait on.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::error::{AcqError, AcqResult};
use crate::mux::{next_poll_key, wait_fd, PollEvents, PollObject};

pub trait Transport: Send {
    /// Read whatever is available without blocking. `Ok(0)` means no data yet.
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> AcqResult<usize>;

    /// Write all of `data`, waiting at most `timeout` in total.
    fn write_all_blocking(&mut self, data: &[u8], timeout: Duration) -> AcqResult<()>;

    /// Identity to register with the session.
    fn poll_object(&self) -> PollObject;

    /// Drop any unread input.
    fn flush_input(&mut self) -> AcqResult<()>;

    fn close(&mut self) -> AcqResult<()>;

    fn is_open(&self) -> bool;

    /// Human readable connection string for logs.
    fn describe(&self) -> String;
}

/// Streams that can be switched to non-blocking mode.
pub trait NonBlocking {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl NonBlocking for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

impl NonBlocking for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

/// Transport over any descriptor-backed byte stream (Unix socket, TCP).
pub struct StreamTransport<T> {
    stream: Option<T>,
    key: u64,
    fd: RawFd,
    name: String,
}

impl<T> StreamTransport<T>
where
    T: Read + Write + AsRawFd + NonBlocking + Send,
{
    pub fn new(stream: T, name: &str) -> AcqResult<Self> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        Ok(Self {
            stream: Some(stream),
            key: next_poll_key(),
            fd,
            name: name.to_string(),
        })
    }

    fn stream(&mut self) -> AcqResult<&mut T> {
        self.stream.as_mut().ok_or(AcqError::DeviceClosed)
    }
}

impl StreamTransport<TcpStream> {
    /// Connect to `host:port` (the `tcp-raw/<host>/<port>` connection form).
    pub fn connect_tcp(host: &str, port: u16) -> AcqResult<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Self::new(stream, &format!("tcp-raw/{}/{}", host, port))
    }
}

impl<T> Transport for StreamTransport<T>
where
    T: Read + Write + AsRawFd + NonBlocking + Send,
{
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> AcqResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.stream()?.read(buf);
        match result {
            Ok(0) => Err(AcqError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ))),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all_blocking(&mut self, data: &[u8], timeout: Duration) -> AcqResult<()> {
        let deadline = Instant::now() + timeout;
        let fd = self.fd;
        let mut written = 0;
        while written < data.len() {
            let result = self.stream()?.write(&data[written..]);
            match result {
                Ok(0) => {
                    return Err(AcqError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no data",
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || !wait_fd(fd, PollEvents::OUT, remaining)? {
                        return Err(AcqError::Timeout(format!(
                            "write to {} stalled after {} of {} bytes",
                            self.name,
                            written,
                            data.len()
                        )));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn poll_object(&self) -> PollObject {
        PollObject::Stream {
            key: self.key,
            fd: self.fd,
        }
    }

    fn flush_input(&mut self) -> AcqResult<()> {
        let mut scratch = [0u8; 256];
        loop {
            let result = self.stream()?.read(&mut scratch);
            match result {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) -> AcqResult<()> {
        if self.stream.take().is_some() {
            tracing::debug!(conn = %self.name, "Transport closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_stream_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut ta = StreamTransport::new(a, "a").unwrap();
        let mut tb = StreamTransport::new(b, "b").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(tb.read_nonblocking(&mut buf).unwrap(), 0);

        ta.write_all_blocking(b"hello", Duration::from_millis(100)).unwrap();
        assert!(wait_fd(tb.poll_object().fd().unwrap(), PollEvents::IN, Duration::from_secs(1)).unwrap());
        let n = tb.read_nonblocking(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_flush_and_close() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut ta = StreamTransport::new(a, "a").unwrap();
        let mut tb = StreamTransport::new(b, "b").unwrap();

        ta.write_all_blocking(b"stale", Duration::from_millis(100)).unwrap();
        tb.flush_input().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(tb.read_nonblocking(&mut buf).unwrap(), 0);

        tb.close().unwrap();
        assert!(!tb.is_open());
        assert!(matches!(tb.read_nonblocking(&mut buf), Err(AcqError::DeviceClosed)));
    }

    #[test]
    fn test_peer_close_is_io_error() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tb = StreamTransport::new(b, "b").unwrap();
        drop(a);
        let mut buf = [0u8; 8];
        assert!(matches!(tb.read_nonblocking(&mut buf), Err(AcqError::Io(_))));
    }

    #[test]
    fn test_poll_objects_distinct() {
        let (a, b) = UnixStream::pair().unwrap();
        let ta = StreamTransport::new(a, "a").unwrap();
        let tb = StreamTransport::new(b, "b").unwrap();
        assert_ne!(ta.poll_object(), tb.poll_object());
    }
}

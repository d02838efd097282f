//! Event-source multiplexer.
//!
//! A single-threaded, cooperative scheduler over poll-able objects. Each
//! registered source has a poll identity ([`PollObject`]), an event mask, a
//! timeout and a callback. One [`Multiplexer::iterate`] call:
//!
//! 1. blocks in one `poll(2)` across every registered descriptor, bounded by
//!    the smallest non-zero source timeout (zero means "never force a wake");
//! 2. invokes each source whose descriptor reported activity, or, when the
//!    poll timed out with no activity at all, each source whose timeout equals
//!    the bound that was used;
//! 3. removes a source whose callback returned `false`;
//! 4. runs the caller's `after_each` hook after every callback (the session
//!    uses it to observe a pending stop).
//!
//! When exactly one source is registered and it is a [`PollObject::Dummy`],
//! the multiplexer free-wheels: the callback runs immediately, without
//! blocking, on every iteration.
//!
//! Sources are addressed by identity, never by position. Callbacks may add or
//! remove sources (their own included) while an iteration is in progress: the
//! triggered set is snapshotted after the poll, and every entry is looked up
//! again right before its callback runs, so a source removed earlier in the
//! same iteration is never invoked and no source runs twice.
//!
//! The poll bound is recomputed from the current sources on every iteration,
//! so the smallest non-zero timeout always wins.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::{AcqError, AcqResult};

static NEXT_POLL_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique key for [`PollObject::Dummy`] and
/// [`PollObject::Stream`] identities.
pub fn next_poll_key() -> u64 {
    NEXT_POLL_KEY.fetch_add(1, Ordering::Relaxed)
}

bitflags! {
    /// Poll event mask (`POLLIN`, `POLLOUT`, ...).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: i16 {
        const IN = libc::POLLIN;
        const PRI = libc::POLLPRI;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

/// Identity of an event source.
///
/// The whole value is the identity: two sources may share a descriptor as
/// long as their identities differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollObject {
    /// Raw file descriptor.
    Fd(RawFd),
    /// Stream handle (serial port, socket) keyed by its own identity.
    Stream { key: u64, fd: RawFd },
    /// No descriptor: the source only runs on timeout, or free-wheels.
    Dummy(u64),
}

impl PollObject {
    /// Fresh dummy identity.
    pub fn dummy() -> Self {
        PollObject::Dummy(next_poll_key())
    }

    /// Descriptor to poll, if any.
    pub fn fd(&self) -> Option<RawFd> {
        match *self {
            PollObject::Fd(fd) | PollObject::Stream { fd, .. } if fd >= 0 => Some(fd),
            _ => None,
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, PollObject::Dummy(_))
    }
}

/// Source callback: receives the scheduler context and the reported events;
/// returning `false` removes the source.
pub type SourceCallback<C> = Box<dyn FnMut(&C, PollEvents) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceId(u64);

struct Source<C> {
    id: SourceId,
    object: PollObject,
    events: PollEvents,
    timeout: Option<Duration>,
    callback: Rc<RefCell<SourceCallback<C>>>,
}

// =============================================================================
// Waker
// =============================================================================

/// Self-pipe that interrupts a blocked poll from another thread.
#[derive(Debug)]
pub struct Waker {
    rx: UnixStream,
    tx: UnixStream,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok(Self { rx, tx })
    }

    /// Wake the poll loop. Never blocks; a full pipe already guarantees a wake.
    pub fn wake(&self) {
        match (&self.tx).write(&[1]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "Failed to signal poll waker"),
        }
    }

    fn drain(&self) {
        let mut scratch = [0u8; 64];
        loop {
            match (&self.rx).read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

/// Poll-based scheduler over event sources.
///
/// `C` is the context handed to every callback (the session).
pub struct Multiplexer<C> {
    sources: RefCell<Vec<Source<C>>>,
    next_id: std::cell::Cell<u64>,
    waker: Arc<Waker>,
}

impl<C> Multiplexer<C> {
    pub fn new() -> AcqResult<Self> {
        Ok(Self {
            sources: RefCell::new(Vec::new()),
            next_id: std::cell::Cell::new(1),
            waker: Arc::new(Waker::new()?),
        })
    }

    /// Waker whose `wake()` interrupts a blocked [`iterate`](Self::iterate).
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Register a source. `timeout` of zero never forces a wake.
    ///
    /// A second source with the same identity is rejected.
    pub fn add(
        &self,
        object: PollObject,
        events: PollEvents,
        timeout: Duration,
        callback: SourceCallback<C>,
    ) -> AcqResult<()> {
        let mut sources = self.sources.borrow_mut();
        if sources.iter().any(|s| s.object == object) {
            return Err(AcqError::arg(format!(
                "event source {:?} is already registered",
                object
            )));
        }
        let id = SourceId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        sources.push(Source {
            id,
            object,
            events,
            timeout: (!timeout.is_zero()).then_some(timeout),
            callback: Rc::new(RefCell::new(callback)),
        });
        tracing::trace!(?object, ?timeout, total = sources.len(), "Event source added");
        Ok(())
    }

    /// Remove the source with this identity. Removing an unknown identity is
    /// not an error.
    pub fn remove(&self, object: PollObject) -> AcqResult<()> {
        let mut sources = self.sources.borrow_mut();
        let before = sources.len();
        sources.retain(|s| s.object != object);
        if sources.len() == before {
            tracing::debug!(?object, "Removal of unregistered event source ignored");
        } else {
            tracing::trace!(?object, total = sources.len(), "Event source removed");
        }
        Ok(())
    }

    fn remove_by_id(&self, id: SourceId) {
        self.sources.borrow_mut().retain(|s| s.id != id);
    }

    pub fn clear(&self) {
        self.sources.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.sources.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.borrow().is_empty()
    }

    pub fn contains(&self, object: PollObject) -> bool {
        self.sources.borrow().iter().any(|s| s.object == object)
    }

    /// Smallest non-zero timeout over all sources.
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.sources.borrow().iter().filter_map(|s| s.timeout).min()
    }

    fn live_callback(&self, id: SourceId) -> Option<Rc<RefCell<SourceCallback<C>>>> {
        self.sources
            .borrow()
            .iter()
            .find(|s| s.id == id)
            .map(|s| Rc::clone(&s.callback))
    }

    /// Run one callback; `false` means the source asked to be removed.
    fn dispatch(&self, ctx: &C, id: SourceId, events: PollEvents) {
        let Some(callback) = self.live_callback(id) else {
            return;
        };
        let keep = match callback.try_borrow_mut() {
            Ok(mut cb) => (*cb)(ctx, events),
            Err(_) => {
                tracing::warn!("Event source callback re-entered; skipping");
                return;
            }
        };
        if !keep {
            self.remove_by_id(id);
        }
    }

    /// One scheduling pass. See the module documentation for the rules.
    pub fn iterate(&self, ctx: &C, after_each: &mut dyn FnMut(&C)) -> AcqResult<()> {
        // Free-wheel over a lone descriptor-less source.
        let lone_dummy = {
            let sources = self.sources.borrow();
            match sources.as_slice() {
                [only] if only.object.is_dummy() => Some(only.id),
                _ => None,
            }
        };
        if let Some(id) = lone_dummy {
            self.dispatch(ctx, id, PollEvents::empty());
            after_each(ctx);
            return Ok(());
        }

        let bound = self.poll_timeout();
        let (mut fds, slots) = {
            let sources = self.sources.borrow();
            let mut fds = Vec::with_capacity(sources.len() + 1);
            let mut slots = Vec::with_capacity(sources.len());
            fds.push(libc::pollfd {
                fd: self.waker.fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for source in sources.iter() {
                let slot = source.object.fd().map(|fd| {
                    fds.push(libc::pollfd {
                        fd,
                        events: source.events.bits(),
                        revents: 0,
                    });
                    fds.len() - 1
                });
                slots.push((source.id, source.timeout, slot));
            }
            (fds, slots)
        };

        let ready = match poll_fds(&mut fds, bound) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if fds[0].revents != 0 {
            self.waker.drain();
        }

        let triggered: Vec<(SourceId, PollEvents)> = slots
            .iter()
            .filter_map(|&(id, timeout, slot)| {
                let revents = slot
                    .map(|i| PollEvents::from_bits_truncate(fds[i].revents))
                    .unwrap_or_default();
                if !revents.is_empty() {
                    Some((id, revents))
                } else if ready == 0 && timeout.is_some() && timeout == bound {
                    Some((id, PollEvents::empty()))
                } else {
                    None
                }
            })
            .collect();

        if triggered.is_empty() {
            after_each(ctx);
            return Ok(());
        }

        for (id, events) in triggered {
            self.dispatch(ctx, id, events);
            after_each(ctx);
        }
        Ok(())
    }
}

/// `poll(2)` over `fds` with an optional bound.
fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms: libc::c_int = match timeout {
        // Round up so a sub-millisecond timeout does not become a busy loop.
        Some(t) => t
            .as_nanos()
            .div_ceil(1_000_000)
            .min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };
    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd structs
    // for the duration of the call.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Wait until `fd` reports one of `events`, or `timeout` elapses.
///
/// Returns `false` on timeout.
pub fn wait_fd(fd: RawFd, events: PollEvents, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = [libc::pollfd {
            fd,
            events: events.bits(),
            revents: 0,
        }];
        match poll_fds(&mut fds, Some(remaining)) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if remaining.is_zero() {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

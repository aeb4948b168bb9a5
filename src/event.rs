//! Edge-triggered event loop over the OS readiness facility.
//!
//! Wraps `mio::Poll` behind a descriptor-keyed interface: descriptors are
//! registered with an interest mask, and ready descriptors come back as a
//! semantic readiness mask (readable / writable). Registration is
//! edge-triggered, so handlers are expected to drain until "would block".

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::warn;

pub use mio::Interest;

/// Maximum number of ready descriptors dispatched per wakeup.
const MAX_EVENTS: usize = 128;

/// Semantic readiness of a descriptor, decoded from the OS event mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// Callback invoked by the event loop for each ready descriptor.
///
/// The loop is passed back in so the handler can register and unregister
/// descriptors while reacting.
pub trait EventHandler {
    fn handle_event(
        &mut self,
        event_loop: &EventLoop,
        fd: RawFd,
        readiness: Readiness,
    ) -> io::Result<()>;
}

/// Edge-triggered readiness loop keyed by raw file descriptor.
pub struct EventLoop {
    poll: Poll,
    events: Events,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
        })
    }

    /// Add a descriptor. Fails if the descriptor is already registered.
    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    /// Change the interest mask of a registered descriptor.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    /// Remove a descriptor. Must be called before the descriptor is closed.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Wait once and dispatch every ready descriptor to the handler.
    ///
    /// Returns the number of events dispatched. Handler errors are logged
    /// and do not interrupt dispatch; a signal-interrupted wait returns
    /// `Ok(0)`. A `timeout` of `None` blocks until an event arrives.
    pub fn poll_once(
        &mut self,
        handler: &mut dyn EventHandler,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }

        let batch: Vec<(RawFd, Readiness)> = self
            .events
            .iter()
            .map(|event| {
                let readiness = Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                };
                (event.token().0 as RawFd, readiness)
            })
            .collect();

        for (fd, readiness) in &batch {
            if let Err(e) = handler.handle_event(self, *fd, *readiness) {
                warn!(fd, error = %e, "event handler failed");
            }
        }

        Ok(batch.len())
    }

    /// Dispatch events until the process is killed.
    pub fn run(&mut self, handler: &mut dyn EventHandler) -> io::Result<()> {
        loop {
            self.poll_once(handler, None)?;
        }
    }

    /// Release the notification facility.
    pub fn stop(self) {}
}

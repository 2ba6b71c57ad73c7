//! Multiplexer abstraction and its platform implementations.
//!
//! The reactor never talks to the OS wait primitive directly; it goes
//! through [`Multiplexer`], and constructs instances through a
//! [`MultiplexerProvider`] so a defective multiplexer can be discarded and
//! rebuilt at runtime. Platform backends:
//!
//! - [`epoll`] on Linux, with an eventfd wake descriptor
//! - [`kqueue`] on macOS and the BSDs, with an `EVFILT_USER` wake event
//!
//! Tests substitute their own provider to script wait outcomes.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::interest::Interest;

#[cfg(target_os = "linux")]
pub(crate) mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) mod kqueue;

/// Token under which the wake descriptor is registered internally. Never
/// handed out to registrations.
pub const WAKE_TOKEN: usize = usize::MAX;

/// A single readiness notification.
#[derive(Clone, Copy, Debug)]
pub struct ReadyEvent {
    /// The registration token the event belongs to.
    pub token: usize,
    /// Readable, accept or hangup readiness.
    pub readable: bool,
    /// Writable or connect readiness.
    pub writable: bool,
}

/// Thread-safe handle that breaks a blocked wait on its multiplexer.
///
/// Waking an already-replaced multiplexer is harmless.
pub trait WakeSignal: Send + Sync {
    fn wake(&self);
}

/// The OS-level wait object.
///
/// Implementations append readiness notifications for registered tokens to
/// the buffer passed to the wait calls (clearing it first) and report the
/// raw number of wait events, wake notifications included, so callers can
/// tell an empty return from a woken one.
pub trait Multiplexer {
    /// Blocks until readiness, wake, or timeout. `None` blocks
    /// indefinitely. A spurious interruption reports zero events.
    fn select(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<usize>;

    /// Non-blocking poll.
    fn select_now(&mut self, out: &mut Vec<ReadyEvent>) -> io::Result<usize>;

    /// Starts watching `fd` under `token` for `interest`.
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Replaces the interest of an existing watch.
    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Stops watching `fd`.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// A wake handle bound to this multiplexer instance.
    fn wake_signal(&self) -> Arc<dyn WakeSignal>;

    /// Capability probe for the reusable readiness-set optimization: the
    /// suggested pre-size, or `None` if the backend cannot support it.
    fn flip_capacity(&self) -> Option<usize>;
}

/// Opens fresh [`Multiplexer`] instances, both at construction time and
/// when the reactor rebuilds a defective one.
pub trait MultiplexerProvider: Send {
    fn open(&self) -> io::Result<Box<dyn Multiplexer>>;
}

/// The default provider for the build target.
pub struct OsProvider;

impl MultiplexerProvider for OsProvider {
    #[cfg(target_os = "linux")]
    fn open(&self) -> io::Result<Box<dyn Multiplexer>> {
        Ok(Box::new(epoll::EpollMultiplexer::new()?))
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    fn open(&self) -> io::Result<Box<dyn Multiplexer>> {
        Ok(Box::new(kqueue::KqueueMultiplexer::new()?))
    }
}

/// Maps an interest mask onto the two readiness directions the OS
/// primitives know about.
pub(crate) fn directions(interest: Interest) -> (bool, bool) {
    let read = interest.intersects(Interest::READ | Interest::ACCEPT);
    let write = interest.intersects(Interest::WRITE | Interest::CONNECT);
    (read, write)
}

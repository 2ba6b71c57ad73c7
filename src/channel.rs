//! Channel and task collaborators dispatched by the reactor.
//!
//! The reactor does not know how endpoints encode or parse data; it only
//! invokes the abstract operations below when the multiplexer reports
//! readiness. Implementations are bound to the reactor thread (`Rc`
//! attachments) and must keep callbacks short, since a slow callback stalls
//! the whole multiplexed set.

use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::interest::Interest;
use crate::reactor::registration::Registration;

/// I/O operations of a channel-like endpoint.
///
/// Errors returned from the fallible operations are treated as local,
/// transient conditions: the reactor closes the channel and moves on, they
/// are never surfaced to application callers.
pub trait ChannelIo {
    /// Invoked when read or accept readiness is signaled, and defensively
    /// when a readiness event carries no operations at all.
    fn read(&self) -> io::Result<()>;

    /// Invoked when write readiness is signaled; expected to drain the
    /// channel's pending writes.
    fn flush(&self) -> io::Result<()>;

    /// Invoked when connect readiness is signaled. The reactor clears the
    /// connect bit from the registration's interest mask before this call.
    fn finish_connect(&self) -> io::Result<()>;

    /// Closes the channel. Must be idempotent.
    fn close(&self);

    /// True while the channel is open. The reactor detaches the
    /// registration of a channel that reports closed.
    fn is_open(&self) -> bool;
}

/// A foreign task bound to an endpoint registration.
pub trait IoTask {
    /// Invoked when the endpoint is ready. An `Err` cancels the
    /// registration and is passed to [`IoTask::unregistered`].
    fn ready(&self, fd: RawFd, registration: &Registration) -> io::Result<()>;

    /// Invoked once the registration is no longer tracked by the reactor:
    /// after a callback failure (with the cause), after the callback
    /// invalidated the registration, during a failed multiplexer migration,
    /// or at shutdown (without a cause).
    fn unregistered(&self, fd: RawFd, cause: Option<&io::Error>);
}

/// What a registration dispatches to.
#[derive(Clone)]
pub enum Attachment {
    /// A channel-like endpoint.
    Channel(Rc<dyn ChannelIo>),
    /// A foreign task.
    Task(Rc<dyn IoTask>),
}

/// A registrable endpoint: a descriptor plus the operations it supports.
#[derive(Clone, Copy, Debug)]
pub struct Endpoint {
    fd: RawFd,
    valid_ops: Interest,
}

impl Endpoint {
    /// An endpoint supporting exactly `valid_ops`.
    pub fn new(fd: RawFd, valid_ops: Interest) -> Self {
        Self { fd, valid_ops }
    }

    /// A connected or connecting stream: read, write and connect.
    pub fn stream(fd: RawFd) -> Self {
        Self::new(fd, Interest::READ | Interest::WRITE | Interest::CONNECT)
    }

    /// A listening socket: accept only.
    pub fn listener(fd: RawFd) -> Self {
        Self::new(fd, Interest::ACCEPT)
    }

    /// The raw descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The operations this endpoint can be registered for.
    pub fn valid_ops(&self) -> Interest {
        self.valid_ops
    }
}

//! Registration handles binding endpoints to the reactor.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::channel::Attachment;
use crate::interest::Interest;

#[derive(Debug)]
struct RegistrationState {
    token: usize,
    fd: RawFd,
    valid_ops: Interest,
    interest: Cell<Interest>,
    valid: Cell<bool>,
}

/// A live binding of an endpoint to the reactor's multiplexer.
///
/// Returned by [`Reactor::register`](crate::Reactor::register). Clones share
/// state; a channel typically keeps one clone as a back-reference so it can
/// detach itself on close. The reactor owns the binding's lifecycle: a
/// registration never outlives the multiplexer it was migrated to last.
#[derive(Clone, Debug)]
pub struct Registration {
    state: Rc<RegistrationState>,
}

impl Registration {
    pub(crate) fn new(token: usize, fd: RawFd, valid_ops: Interest, interest: Interest) -> Self {
        Self {
            state: Rc::new(RegistrationState {
                token,
                fd,
                valid_ops,
                interest: Cell::new(interest),
                valid: Cell::new(true),
            }),
        }
    }

    /// The reactor-internal token readiness events are keyed by.
    pub fn token(&self) -> usize {
        self.state.token
    }

    /// The registered descriptor.
    pub fn fd(&self) -> RawFd {
        self.state.fd
    }

    /// The operations the endpoint supports.
    pub fn valid_ops(&self) -> Interest {
        self.state.valid_ops
    }

    /// The current interest mask.
    pub fn interest(&self) -> Interest {
        self.state.interest.get()
    }

    /// False once the registration has been cancelled, its channel closed,
    /// or its migration to a rebuilt multiplexer failed.
    pub fn is_valid(&self) -> bool {
        self.state.valid.get()
    }

    /// Marks the registration invalid. The reactor completes the cleanup
    /// (multiplexer deregistration, table removal) when it next observes
    /// the registration; use [`Reactor::cancel`](crate::Reactor::cancel)
    /// for immediate cleanup.
    pub fn invalidate(&self) {
        self.state.valid.set(false);
    }

    pub(crate) fn set_interest(&self, interest: Interest) {
        self.state.interest.set(interest);
    }
}

/// A table entry: the shared handle plus what readiness dispatches to.
pub(crate) struct Entry {
    pub(crate) reg: Registration,
    pub(crate) attachment: Attachment,
}

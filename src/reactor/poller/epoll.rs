//! epoll-backed multiplexer for Linux.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, epoll_create1, epoll_ctl, epoll_event, epoll_wait, eventfd,
};

use super::{Multiplexer, ReadyEvent, WAKE_TOKEN, WakeSignal, directions};
use crate::interest::Interest;

/// Upper bound on events drained per wait call, and the suggested pre-size
/// for the reusable readiness set.
const EVENT_CAPACITY: usize = 64;

struct EventFdWake {
    fd: Arc<OwnedFd>,
}

impl WakeSignal for EventFdWake {
    fn wake(&self) {
        let one: u64 = 1;
        // A full counter means a wake is already pending; nothing to do.
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                ptr::from_ref(&one).cast(),
                size_of::<u64>(),
            );
        }
    }
}

pub(crate) struct EpollMultiplexer {
    epfd: OwnedFd,
    wake_fd: Arc<OwnedFd>,
}

impl EpollMultiplexer {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = syscall_fd(unsafe { epoll_create1(EPOLL_CLOEXEC) })?;

        let wake_fd = syscall_fd(unsafe { eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN as u64,
        };
        syscall(unsafe {
            epoll_ctl(
                epfd.as_raw_fd(),
                EPOLL_CTL_ADD,
                wake_fd.as_raw_fd(),
                &mut event,
            )
        })?;

        Ok(Self {
            epfd,
            wake_fd: Arc::new(wake_fd),
        })
    }

    fn wait(&mut self, timeout_ms: i32, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        out.clear();

        let mut events = [epoll_event { events: 0, u64: 0 }; EVENT_CAPACITY];
        let n = unsafe {
            epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                EVENT_CAPACITY as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for event in &events[..n as usize] {
            let token = event.u64 as usize;
            if token == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            let bits = event.events;
            out.push(ReadyEvent {
                token,
                readable: bits & (EPOLLIN | EPOLLERR | EPOLLHUP) as u32 != 0,
                writable: bits & (EPOLLOUT | EPOLLERR | EPOLLHUP) as u32 != 0,
            });
        }
        Ok(n as usize)
    }

    fn drain_wake(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.wake_fd.as_raw_fd(),
                ptr::from_mut(&mut counter).cast(),
                size_of::<u64>(),
            );
        }
    }

    fn ctl(&self, op: i32, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let (read, write) = directions(interest);
        let mut bits = 0u32;
        if read {
            bits |= EPOLLIN as u32;
        }
        if write {
            bits |= EPOLLOUT as u32;
        }
        let mut event = epoll_event {
            events: bits,
            u64: token as u64,
        };
        syscall(unsafe { epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) })
    }
}

impl Multiplexer for EpollMultiplexer {
    fn select(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
        };
        self.wait(timeout_ms, out)
    }

    fn select_now(&mut self, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        self.wait(0, out)
    }

    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, token, interest)
    }

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        syscall(unsafe { epoll_ctl(self.epfd.as_raw_fd(), EPOLL_CTL_DEL, fd, ptr::null_mut()) })
    }

    fn wake_signal(&self) -> Arc<dyn WakeSignal> {
        Arc::new(EventFdWake {
            fd: self.wake_fd.clone(),
        })
    }

    fn flip_capacity(&self) -> Option<usize> {
        Some(EVENT_CAPACITY)
    }
}

fn syscall(ret: i32) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn syscall_fd(ret: i32) -> io::Result<OwnedFd> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(ret) })
    }
}

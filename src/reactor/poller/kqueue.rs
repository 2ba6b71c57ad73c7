//! kqueue-backed multiplexer for macOS and the BSDs.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EVFILT_READ, EVFILT_USER, EVFILT_WRITE, NOTE_TRIGGER,
    kevent, kqueue,
};

use super::{Multiplexer, ReadyEvent, WAKE_TOKEN, WakeSignal, directions};
use crate::interest::Interest;

/// Upper bound on events drained per wait call, and the suggested pre-size
/// for the reusable readiness set.
const EVENT_CAPACITY: usize = 64;

/// Ident of the user event used to break blocked waits.
const WAKE_IDENT: usize = 0;

struct UserEventWake {
    kq: Arc<OwnedFd>,
}

impl WakeSignal for UserEventWake {
    fn wake(&self) {
        let event = kevent {
            ident: WAKE_IDENT,
            filter: EVFILT_USER,
            flags: 0,
            fflags: NOTE_TRIGGER,
            data: 0,
            udata: WAKE_TOKEN as *mut _,
        };
        unsafe {
            kevent(self.kq.as_raw_fd(), &event, 1, ptr::null_mut(), 0, ptr::null());
        }
    }
}

pub(crate) struct KqueueMultiplexer {
    kq: Arc<OwnedFd>,
}

impl KqueueMultiplexer {
    pub(crate) fn new() -> io::Result<Self> {
        let ret = unsafe { kqueue() };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let kq = unsafe { OwnedFd::from_raw_fd(ret) };

        let event = kevent {
            ident: WAKE_IDENT,
            filter: EVFILT_USER,
            flags: EV_ADD | EV_ENABLE | EV_CLEAR,
            fflags: 0,
            data: 0,
            udata: WAKE_TOKEN as *mut _,
        };
        syscall(unsafe { kevent(kq.as_raw_fd(), &event, 1, ptr::null_mut(), 0, ptr::null()) })?;

        Ok(Self { kq: Arc::new(kq) })
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        out.clear();

        let timespec = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as _,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(ptr::null(), |timespec| ptr::from_ref(timespec));

        let mut events: [kevent; EVENT_CAPACITY] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                EVENT_CAPACITY as i32,
                timespec_ptr,
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
            let token = event.udata as usize;
            if token == WAKE_TOKEN {
                continue;
            }
            out.push(ReadyEvent {
                token,
                readable: event.filter == EVFILT_READ,
                writable: event.filter == EVFILT_WRITE,
            });
        }
        Ok(n as usize)
    }

    fn update(&self, fd: RawFd, filter: i16, enable: bool, token: usize) -> io::Result<()> {
        let event = kevent {
            ident: fd as usize,
            filter,
            flags: if enable { EV_ADD | EV_ENABLE } else { EV_DELETE },
            fflags: 0,
            data: 0,
            udata: token as *mut _,
        };
        let ret = unsafe { kevent(self.kq.as_raw_fd(), &event, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Deleting a filter that was never added is not a failure.
            if !enable && err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Multiplexer for KqueueMultiplexer {
    fn select(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        self.wait(timeout, out)
    }

    fn select_now(&mut self, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        self.wait(Some(Duration::ZERO), out)
    }

    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.reregister(fd, token, interest)
    }

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let (read, write) = directions(interest);
        self.update(fd, EVFILT_READ, read, token)?;
        self.update(fd, EVFILT_WRITE, write, token)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.update(fd, EVFILT_READ, false, 0)?;
        self.update(fd, EVFILT_WRITE, false, 0)
    }

    fn wake_signal(&self) -> Arc<dyn WakeSignal> {
        Arc::new(UserEventWake {
            kq: self.kq.clone(),
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

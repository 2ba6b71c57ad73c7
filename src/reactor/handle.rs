//! Cross-thread handle to a running reactor.
//!
//! Foreign threads never touch reactor-owned state directly; everything
//! goes through the task queue and the wakeup protocol implemented here.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::reactor::Reactor;
use crate::reactor::poller::WakeSignal;
use crate::task::TaskQueue;

/// Default share of each iteration's time budget spent on readiness
/// dispatch.
pub(crate) const DEFAULT_IO_RATIO: u32 = 50;

/// State shared between a reactor and its handles.
pub(crate) struct Shared {
    pub(crate) tasks: TaskQueue,
    wakeup: AtomicBool,
    io_ratio: AtomicU32,
    shutdown: AtomicBool,
    wake_signal: Mutex<Arc<dyn WakeSignal>>,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    pub(crate) fn new(wake_signal: Arc<dyn WakeSignal>, io_ratio: u32) -> Self {
        Self {
            tasks: TaskQueue::new(),
            wakeup: AtomicBool::new(false),
            io_ratio: AtomicU32::new(io_ratio),
            shutdown: AtomicBool::new(false),
            wake_signal: Mutex::new(wake_signal),
            loop_thread: Mutex::new(None),
        }
    }

    /// Issues a wake through the current multiplexer's signal.
    pub(crate) fn wake(&self) {
        self.wake_signal.lock().unwrap().wake();
    }

    /// Swaps in the wake signal of a freshly built multiplexer.
    pub(crate) fn set_wake_signal(&self, signal: Arc<dyn WakeSignal>) {
        *self.wake_signal.lock().unwrap() = signal;
    }

    /// Captures and clears the pending-wakeup flag at iteration start.
    pub(crate) fn take_wakeup(&self) -> bool {
        self.wakeup.swap(false, Ordering::AcqRel)
    }

    /// True if a wake request arrived since the flag was last cleared.
    pub(crate) fn wakeup_pending(&self) -> bool {
        self.wakeup.load(Ordering::Acquire)
    }

    pub(crate) fn io_ratio(&self) -> u32 {
        self.io_ratio.load(Ordering::Relaxed)
    }

    pub(crate) fn set_io_ratio(&self, percent: u32) -> Result<(), Error> {
        if percent == 0 || percent > 100 {
            return Err(Error::Configuration(format!(
                "io ratio: {percent} (expected: 0 < ratio <= 100)"
            )));
        }
        self.io_ratio.store(percent, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn enter_loop(&self) {
        *self.loop_thread.lock().unwrap() = Some(thread::current().id());
    }

    fn in_loop(&self) -> bool {
        *self.loop_thread.lock().unwrap() == Some(thread::current().id())
    }

    /// The wakeup protocol's producer side: flip the flag only if it was
    /// clear, and issue the expensive wake call only on that transition.
    pub(crate) fn wakeup(&self) {
        if !self.in_loop()
            && self
                .wakeup
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.wake();
        }
    }
}

/// Cloneable, thread-safe handle to a [`Reactor`].
///
/// # Example
///
/// ```ignore
/// let handle = reactor.handle();
/// std::thread::spawn(move || {
///     handle.execute(|reactor| {
///         // runs on the reactor thread
///     });
/// });
/// ```
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Enqueues `task` for execution on the reactor thread and wakes a
    /// blocked wait. Tasks submitted after termination are never run.
    pub fn execute(&self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.shared.tasks.push(Box::new(task));
        self.shared.wakeup();
    }

    /// Runs `task` on the reactor thread once `delay` has elapsed.
    ///
    /// Tasks scheduled for the same deadline run in submission order.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        let deadline = Instant::now() + delay;
        self.execute(move |reactor| reactor.schedule_at(deadline, Box::new(task)));
    }

    /// Breaks a blocked multiplexer wait, if any.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Schedules a multiplexer rebuild onto the reactor thread.
    pub fn rebuild_multiplexer(&self) {
        self.execute(|reactor| reactor.rebuild_multiplexer());
    }

    /// Requests shutdown: the reactor drains registrations and terminates
    /// once no tasks, due timers or registrations remain.
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
        self.shared.wakeup();
    }

    /// The percentage of each iteration's time budget spent on readiness
    /// dispatch.
    pub fn io_ratio(&self) -> u32 {
        self.shared.io_ratio()
    }

    /// Sets the io ratio. Valid range `(0, 100]`.
    pub fn set_io_ratio(&self, percent: u32) -> Result<(), Error> {
        self.shared.set_io_ratio(percent)
    }
}

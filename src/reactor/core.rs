//! The reactor core.
//!
//! One dedicated thread runs [`Reactor::run`], multiplexing every registered
//! endpoint and executing every task handed off by foreign threads. Each
//! iteration alternates between a multiplexer wait, readiness dispatch and
//! task execution, time-sliced by the configured io ratio.
//!
//! Two platform defects are defended against here:
//!
//! - Some multiplexer implementations can return immediately and repeatedly
//!   while reporting no work, saturating a CPU. Consecutive premature
//!   returns are counted and, past a configurable threshold, the multiplexer
//!   is discarded and rebuilt with every live registration migrated.
//! - Readiness events occasionally arrive with no operations signaled at
//!   all; they are dispatched to the read path so the endpoint can make
//!   progress instead of re-triggering forever.

use std::collections::HashMap;
use std::io;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::channel::{Attachment, ChannelIo, Endpoint, IoTask};
use crate::config;
use crate::error::Error;
use crate::interest::Interest;
use crate::reactor::handle::{ReactorHandle, Shared};
use crate::reactor::poller::{Multiplexer, MultiplexerProvider, ReadyEvent};
use crate::reactor::ready_set::ReadySet;
use crate::reactor::registration::{Entry, Registration};
use crate::task::{ReactorTask, ScheduledQueue};

/// Explicit cancellations tolerated within one iteration before a forced
/// non-blocking re-poll prunes the stale entries. Kept independent from the
/// auto-rebuild threshold.
const CLEANUP_INTERVAL: u32 = 256;

/// Ceiling on a blocking wait when no scheduled task is nearer.
const SELECT_CEILING: Duration = Duration::from_secs(1);

/// Pause after an iteration fails wholesale, so a persistent failure cannot
/// turn into a tight loop.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Where the loop currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting on the multiplexer.
    Selecting,
    /// Dispatching readiness events.
    DispatchingIo,
    /// Executing queued tasks.
    RunningTasks,
    /// Draining registrations after a shutdown request.
    ShuttingDown,
    /// The loop has exited; nothing will run again.
    Terminated,
}

/// A single-threaded I/O reactor.
///
/// Construct through [`ReactorBuilder`](crate::ReactorBuilder), hand
/// [`ReactorHandle`]s to other threads, then call [`Reactor::run`] on the
/// thread that will own it.
///
/// # Example
///
/// ```ignore
/// let mut reactor = ReactorBuilder::new().build()?;
/// let handle = reactor.handle();
/// std::thread::spawn(move || {
///     handle.execute(|reactor| {
///         let reg = reactor.register(endpoint, Interest::READ, attachment)?;
///         // ...
///     });
/// });
/// reactor.run();
/// ```
pub struct Reactor {
    provider: Box<dyn MultiplexerProvider>,
    mux: Box<dyn Multiplexer>,
    selected: ReadySet,
    registrations: HashMap<usize, Entry>,
    next_token: usize,
    timers: ScheduledQueue,
    shared: Arc<Shared>,
    cancelled_keys: u32,
    needs_reselect: bool,
    state: LoopState,
    rebuild_threshold: u32,
    ready_set_disabled: bool,
}

impl Reactor {
    pub(crate) fn build(
        provider: Box<dyn MultiplexerProvider>,
        io_ratio: u32,
        rebuild_threshold: u32,
        ready_set_disabled: bool,
    ) -> Result<Self, Error> {
        let mux = provider.open().map_err(Error::MultiplexerOpen)?;
        let selected = ReadySet::probe(mux.as_ref(), ready_set_disabled);
        let shared = Arc::new(Shared::new(mux.wake_signal(), io_ratio));

        Ok(Self {
            provider,
            mux,
            selected,
            registrations: HashMap::new(),
            next_token: 0,
            timers: ScheduledQueue::new(),
            shared,
            cancelled_keys: 0,
            needs_reselect: false,
            state: LoopState::Selecting,
            rebuild_threshold,
            ready_set_disabled,
        })
    }

    /// A cloneable, thread-safe handle to this reactor.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle::new(self.shared.clone())
    }

    /// The loop's current state.
    pub fn state(&self) -> LoopState {
        self.state
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

    /// Binds `endpoint` to this reactor's multiplexer.
    ///
    /// Fails with [`Error::Configuration`] if `interest` is empty or not a
    /// subset of the endpoint's valid operations, and with
    /// [`Error::ShutDown`] once shutdown has been requested.
    pub fn register(
        &mut self,
        endpoint: Endpoint,
        interest: Interest,
        attachment: Attachment,
    ) -> Result<Registration, Error> {
        if interest.is_empty() {
            return Err(Error::Configuration(
                "interest mask must not be empty".into(),
            ));
        }
        if !endpoint.valid_ops().contains(interest) {
            return Err(Error::Configuration(format!(
                "invalid interest mask: {:?} (valid operations: {:?})",
                interest,
                endpoint.valid_ops()
            )));
        }
        if self.shared.is_shutdown() {
            return Err(Error::ShutDown);
        }

        let token = self.next_token;
        self.next_token += 1;
        self.mux
            .register(endpoint.fd(), token, interest)
            .map_err(Error::Registration)?;

        let reg = Registration::new(token, endpoint.fd(), endpoint.valid_ops(), interest);
        self.registrations.insert(
            token,
            Entry {
                reg: reg.clone(),
                attachment,
            },
        );
        Ok(reg)
    }

    /// Cancels a registration: deregisters the descriptor and drops the
    /// table entry. Harmless on an already-cancelled registration.
    pub fn cancel(&mut self, reg: &Registration) {
        if self.registrations.remove(&reg.token()).is_none() {
            return;
        }
        reg.invalidate();
        if let Err(err) = self.mux.deregister(reg.fd()) {
            debug!("failed to deregister fd {}: {err}", reg.fd());
        }

        self.cancelled_keys += 1;
        if self.cancelled_keys >= CLEANUP_INTERVAL {
            self.cancelled_keys = 0;
            self.needs_reselect = true;
        }
    }

    /// Replaces the registration's interest mask.
    ///
    /// Fails with [`Error::Configuration`] if `interest` is not a subset of
    /// the endpoint's valid operations. A cancelled registration is left
    /// untouched.
    pub fn set_interest(&mut self, reg: &Registration, interest: Interest) -> Result<(), Error> {
        if !reg.valid_ops().contains(interest) {
            return Err(Error::Configuration(format!(
                "invalid interest mask: {:?} (valid operations: {:?})",
                interest,
                reg.valid_ops()
            )));
        }
        if !reg.is_valid() || !self.registrations.contains_key(&reg.token()) {
            return Ok(());
        }
        self.mux
            .reregister(reg.fd(), reg.token(), interest)
            .map_err(Error::Registration)?;
        reg.set_interest(interest);
        Ok(())
    }

    /// Adds `task` to the deadline-ordered queue. Reactor thread only;
    /// foreign threads use [`ReactorHandle::schedule`].
    pub fn schedule_at(&mut self, deadline: Instant, task: ReactorTask) {
        self.timers.schedule(deadline, task);
    }

    /// Discards the current multiplexer and constructs a fresh one,
    /// migrating every valid registration.
    ///
    /// This is the workaround for multiplexer implementations that return
    /// immediately and repeatedly while reporting no work. Idempotent; safe
    /// to invoke at any point on the reactor thread. Foreign threads use
    /// [`ReactorHandle::rebuild_multiplexer`], which schedules the call
    /// here.
    pub fn rebuild_multiplexer(&mut self) {
        let mut new_mux = match self.provider.open() {
            Ok(mux) => mux,
            Err(err) => {
                warn!("failed to open a new multiplexer: {err}");
                return;
            }
        };

        let mut migrated = 0usize;
        let tokens: Vec<usize> = self.registrations.keys().copied().collect();
        for token in tokens {
            let (reg, attachment) = match self.registrations.get(&token) {
                Some(entry) => (entry.reg.clone(), entry.attachment.clone()),
                None => continue,
            };
            if !reg.is_valid() {
                self.registrations.remove(&token);
                continue;
            }

            match new_mux.register(reg.fd(), token, reg.interest()) {
                Ok(()) => migrated += 1,
                Err(err) => {
                    warn!("failed to migrate a registration to the new multiplexer: {err}");
                    reg.invalidate();
                    self.registrations.remove(&token);
                    match attachment {
                        Attachment::Channel(channel) => channel.close(),
                        Attachment::Task(task) => task.unregistered(reg.fd(), Some(&err)),
                    }
                }
            }
        }

        self.shared.set_wake_signal(new_mux.wake_signal());
        self.selected = ReadySet::probe(new_mux.as_ref(), self.ready_set_disabled);
        // The old handle is closed only now, after every live registration
        // has been migrated or disposed.
        self.mux = new_mux;
        info!("migrated {migrated} registration(s) to a new multiplexer");
    }

    /// Runs the loop until shutdown completes.
    ///
    /// Blocks the calling thread; every channel and task callback bound to
    /// this reactor executes here.
    pub fn run(&mut self) {
        self.shared.enter_loop();
        debug!("reactor loop started");

        loop {
            let old_waken = self.shared.take_wakeup();
            match panic::catch_unwind(AssertUnwindSafe(|| self.run_iteration(old_waken))) {
                Ok(Ok(ControlFlow::Break(()))) => break,
                Ok(Ok(ControlFlow::Continue(()))) => {}
                Ok(Err(err)) => {
                    warn!("unexpected error in the reactor loop: {err}");
                    thread::sleep(FAILURE_BACKOFF);
                }
                Err(payload) => {
                    warn!(
                        "unexpected panic in the reactor loop: {}",
                        panic_message(payload.as_ref())
                    );
                    thread::sleep(FAILURE_BACKOFF);
                }
            }
        }

        self.state = LoopState::Terminated;
        debug!("reactor terminated");
    }

    fn run_iteration(&mut self, old_waken: bool) -> io::Result<ControlFlow<()>> {
        self.state = LoopState::Selecting;
        if !self.shared.tasks.is_empty() {
            self.select_now_restoring()?;
        } else {
            self.do_select(old_waken)?;
            // A wake that raced with entry into the blocking wait leaves
            // the flag set; re-issue so the consumed wake is not lost.
            if self.shared.wakeup_pending() {
                self.shared.wake();
            }
        }

        self.cancelled_keys = 0;
        self.needs_reselect = false;

        let io_ratio = self.shared.io_ratio();
        if io_ratio == 100 {
            self.state = LoopState::DispatchingIo;
            self.process_ready();
            self.state = LoopState::RunningTasks;
            self.run_all_tasks(None);
        } else {
            let io_start = Instant::now();
            self.state = LoopState::DispatchingIo;
            self.process_ready();
            let io_time = io_start.elapsed();
            self.state = LoopState::RunningTasks;
            self.run_all_tasks(Some(io_time * (100 - io_ratio) / io_ratio));
        }

        if self.shared.is_shutdown() {
            self.state = LoopState::ShuttingDown;
            self.close_all();
            if self.confirm_shutdown() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Blocking wait bounded by the nearer of the next scheduled deadline
    /// or the default ceiling, with premature-return accounting.
    fn do_select(&mut self, old_waken: bool) -> io::Result<()> {
        let mut select_cnt: u32 = 0;
        let mut current = Instant::now();
        let delay = self
            .timers
            .next_delay(current)
            .unwrap_or(SELECT_CEILING)
            .min(SELECT_CEILING);
        let deadline = current + delay;

        loop {
            let remaining = deadline.saturating_duration_since(current);
            let timeout_ms = (remaining.as_micros() as u64 + 500) / 1000;
            if timeout_ms == 0 {
                if select_cnt == 0 {
                    self.mux.select_now(self.selected.buffer_mut())?;
                    select_cnt = 1;
                }
                break;
            }

            let timeout = Duration::from_millis(timeout_ms);
            let selected = self.mux.select(Some(timeout), self.selected.buffer_mut())?;
            select_cnt += 1;

            if selected != 0
                || old_waken
                || self.shared.wakeup_pending()
                || !self.shared.tasks.is_empty()
                || self.timers.has_due(Instant::now())
            {
                // Selected something, woken up, or a task became ready.
                break;
            }

            let now = Instant::now();
            if now.duration_since(current) >= timeout {
                // The full timeout elapsed with nothing selected; an
                // ordinary empty return.
                select_cnt = 1;
            } else if self.rebuild_threshold > 0 && select_cnt >= self.rebuild_threshold {
                warn!(
                    "multiplexer returned prematurely {select_cnt} times in a row; \
                     rebuilding"
                );
                self.rebuild_multiplexer();
                self.mux.select_now(self.selected.buffer_mut())?;
                select_cnt = 1;
                break;
            }

            current = now;
        }

        if select_cnt > config::MIN_PREMATURE_RETURNS {
            debug!(
                "multiplexer returned prematurely {} times in a row",
                select_cnt - 1
            );
        }
        Ok(())
    }

    fn select_now_restoring(&mut self) -> io::Result<()> {
        let result = self.mux.select_now(self.selected.buffer_mut());
        // Restore the wake state consumed by the poll.
        if self.shared.wakeup_pending() {
            self.shared.wake();
        }
        result.map(|_| ())
    }

    /// Non-blocking re-poll that prunes stale cancelled entries.
    fn select_again(&mut self) {
        self.needs_reselect = false;
        if let Err(err) = self.mux.select_now(self.selected.buffer_mut()) {
            warn!("failed to refresh the readiness set: {err}");
        }
    }

    fn process_ready(&mut self) {
        let mut batch = self.selected.flip();
        let mut index = 0;
        while index < batch.len() {
            let event = batch[index];
            index += 1;
            self.dispatch_event(event);

            if self.needs_reselect {
                // Too many cancellations accumulated; re-poll and start
                // over on the refreshed set.
                self.select_again();
                self.selected.recycle(batch);
                batch = self.selected.flip();
                index = 0;
            }
        }
        self.selected.recycle(batch);
    }

    fn dispatch_event(&mut self, event: ReadyEvent) {
        let Some(entry) = self.registrations.get(&event.token) else {
            // Stale notification for an already-cancelled registration.
            return;
        };
        let reg = entry.reg.clone();
        match entry.attachment.clone() {
            Attachment::Channel(channel) => self.dispatch_channel(event, reg, channel),
            Attachment::Task(task) => self.dispatch_task(reg, task),
        }
    }

    fn dispatch_channel(&mut self, event: ReadyEvent, reg: Registration, channel: Rc<dyn ChannelIo>) {
        if !reg.is_valid() {
            // The registration went invalid before its event was seen.
            self.close_channel(&reg, &channel);
            return;
        }

        let interest = reg.interest();
        let mut ready = Interest::empty();
        if event.readable {
            ready |= interest.intersection(Interest::READ | Interest::ACCEPT);
        }
        if event.writable {
            ready |= interest.intersection(Interest::WRITE | Interest::CONNECT);
        }

        // A zero-readiness event is handed to the read path as well: some
        // multiplexers produce them, and the read path is where progress
        // can be made without spinning.
        if ready.intersects(Interest::READ | Interest::ACCEPT) || ready.is_empty() {
            if let Err(err) = channel.read() {
                debug!("read failed on fd {}: {err}", reg.fd());
                self.close_channel(&reg, &channel);
                return;
            }
            if !channel.is_open() {
                // Closed by the read path; no need to handle write.
                self.cancel(&reg);
                return;
            }
        }

        if ready.contains(Interest::WRITE) {
            if let Err(err) = channel.flush() {
                debug!("flush failed on fd {}: {err}", reg.fd());
                self.close_channel(&reg, &channel);
                return;
            }
        }

        if ready.contains(Interest::CONNECT) {
            // Clear the connect bit first: a completed connect would
            // otherwise re-trigger on every subsequent wait.
            if let Err(err) = self.set_interest(&reg, interest.remove(Interest::CONNECT)) {
                debug!("failed to clear connect interest on fd {}: {err}", reg.fd());
            }
            if let Err(err) = channel.finish_connect() {
                debug!("finish-connect failed on fd {}: {err}", reg.fd());
                self.close_channel(&reg, &channel);
                return;
            }
        }

        if !channel.is_open() {
            self.cancel(&reg);
        }
    }

    fn dispatch_task(&mut self, reg: Registration, task: Rc<dyn IoTask>) {
        match task.ready(reg.fd(), &reg) {
            Ok(()) => {
                if !reg.is_valid() {
                    // Invalidated by the callback itself.
                    self.cancel(&reg);
                    task.unregistered(reg.fd(), None);
                }
            }
            Err(err) => {
                self.cancel(&reg);
                task.unregistered(reg.fd(), Some(&err));
            }
        }
    }

    fn close_channel(&mut self, reg: &Registration, channel: &Rc<dyn ChannelIo>) {
        channel.close();
        self.cancel(reg);
    }

    fn run_all_tasks(&mut self, cap: Option<Duration>) {
        self.fetch_due_scheduled();

        let deadline = cap.map(|cap| Instant::now() + cap);
        let mut executed: u64 = 0;
        while let Some(task) = self.poll_task() {
            self.safe_execute(task);
            executed += 1;

            // Reading the clock every task would dominate cheap tasks;
            // check the budget every 64.
            if executed & 0x3F == 0
                && let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                break;
            }
        }
    }

    fn fetch_due_scheduled(&mut self) {
        let now = Instant::now();
        while let Some(task) = self.timers.pop_due(now) {
            self.shared.tasks.push(task);
        }
    }

    fn poll_task(&mut self) -> Option<ReactorTask> {
        let task = self.shared.tasks.pop();
        if self.needs_reselect {
            self.select_again();
        }
        task
    }

    fn safe_execute(&mut self, task: ReactorTask) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(self))) {
            warn!(
                "a task panicked on the reactor thread: {}",
                panic_message(payload.as_ref())
            );
        }
    }

    /// One pass over every remaining registration: channels are closed,
    /// task attachments cancelled and notified.
    fn close_all(&mut self) {
        self.select_again();

        let tokens: Vec<usize> = self.registrations.keys().copied().collect();
        for token in tokens {
            let Some(entry) = self.registrations.remove(&token) else {
                continue;
            };
            entry.reg.invalidate();
            if let Err(err) = self.mux.deregister(entry.reg.fd()) {
                debug!("failed to deregister fd {}: {err}", entry.reg.fd());
            }
            match entry.attachment {
                Attachment::Channel(channel) => channel.close(),
                Attachment::Task(task) => task.unregistered(entry.reg.fd(), None),
            }
        }
    }

    fn confirm_shutdown(&mut self) -> bool {
        self.shared.tasks.is_empty()
            && !self.timers.has_due(Instant::now())
            && self.registrations.is_empty()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

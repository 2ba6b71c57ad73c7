//! Loop behavior tests driven by a scripted multiplexer: the busy-loop
//! rebuild workaround, cancellation pruning, io-ratio ordering and the
//! zero-readiness anomaly.

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spindle::{
    Attachment, ChannelIo, Endpoint, Interest, Multiplexer, MultiplexerProvider, ReactorBuilder,
    ReactorHandle, ReadyEvent, WakeSignal,
};

/// Test-wide state shared by the provider, its multiplexers and the test.
struct MockShared {
    opens: AtomicUsize,
    select_now_calls: AtomicUsize,
    /// When set, generation-0 multiplexers return immediately with zero
    /// readiness, mimicking the platform busy-loop defect.
    defect_armed: AtomicBool,
    /// One-shot: the next wait reports readable readiness for every
    /// registered token.
    deliver_pending: AtomicBool,
    /// One-shot: the next wait reports an event with no readiness at all.
    deliver_zero_pending: AtomicBool,
    woken: Mutex<bool>,
    cond: Condvar,
}

impl MockShared {
    fn new() -> Arc<MockShared> {
        Arc::new(MockShared {
            opens: AtomicUsize::new(0),
            select_now_calls: AtomicUsize::new(0),
            defect_armed: AtomicBool::new(false),
            deliver_pending: AtomicBool::new(false),
            deliver_zero_pending: AtomicBool::new(false),
            woken: Mutex::new(false),
            cond: Condvar::new(),
        })
    }
}

struct MockWakeSignal {
    shared: Arc<MockShared>,
}

impl WakeSignal for MockWakeSignal {
    fn wake(&self) {
        *self.shared.woken.lock().unwrap() = true;
        self.shared.cond.notify_all();
    }
}

struct MockMux {
    shared: Arc<MockShared>,
    generation: usize,
    tokens: Vec<(RawFd, usize)>,
}

impl MockMux {
    fn emit_pending(&self, out: &mut Vec<ReadyEvent>) -> bool {
        if self.shared.deliver_pending.swap(false, Ordering::AcqRel) {
            for &(_, token) in &self.tokens {
                out.push(ReadyEvent {
                    token,
                    readable: true,
                    writable: false,
                });
            }
            return true;
        }
        if self.shared.deliver_zero_pending.swap(false, Ordering::AcqRel) {
            for &(_, token) in &self.tokens {
                out.push(ReadyEvent {
                    token,
                    readable: false,
                    writable: false,
                });
            }
            return true;
        }
        false
    }
}

impl Multiplexer for MockMux {
    fn select(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        out.clear();
        if self.emit_pending(out) {
            return Ok(out.len());
        }
        if self.generation == 0 && self.shared.defect_armed.load(Ordering::Acquire) {
            // Premature return: no readiness, no wake, long before the
            // requested timeout.
            return Ok(0);
        }

        let timeout = timeout.unwrap_or(Duration::from_millis(100));
        let mut woken = self.shared.woken.lock().unwrap();
        if !*woken {
            let (guard, _) = self.shared.cond.wait_timeout(woken, timeout).unwrap();
            woken = guard;
        }
        if *woken {
            *woken = false;
            drop(woken);
            self.emit_pending(out);
            return Ok(1 + out.len());
        }
        Ok(0)
    }

    fn select_now(&mut self, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        self.shared.select_now_calls.fetch_add(1, Ordering::SeqCst);
        out.clear();
        self.emit_pending(out);
        Ok(out.len())
    }

    fn register(&mut self, fd: RawFd, token: usize, _interest: Interest) -> io::Result<()> {
        self.tokens.push((fd, token));
        Ok(())
    }

    fn reregister(&mut self, _fd: RawFd, _token: usize, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.tokens.retain(|&(owner, _)| owner != fd);
        Ok(())
    }

    fn wake_signal(&self) -> Arc<dyn WakeSignal> {
        Arc::new(MockWakeSignal {
            shared: self.shared.clone(),
        })
    }

    fn flip_capacity(&self) -> Option<usize> {
        Some(64)
    }
}

struct MockProvider {
    shared: Arc<MockShared>,
}

impl MultiplexerProvider for MockProvider {
    fn open(&self) -> io::Result<Box<dyn Multiplexer>> {
        let generation = self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockMux {
            shared: self.shared.clone(),
            generation,
            tokens: Vec::new(),
        }))
    }
}

struct CountingChannel {
    reads: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    open: Cell<bool>,
}

impl CountingChannel {
    fn new(reads: Arc<AtomicUsize>, closed: Arc<AtomicBool>) -> Rc<CountingChannel> {
        Rc::new(CountingChannel {
            reads,
            closed,
            open: Cell::new(true),
        })
    }
}

impl ChannelIo for CountingChannel {
    fn read(&self) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn finish_connect(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.open.set(false);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }
}

fn spawn_reactor(builder: ReactorBuilder) -> (ReactorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let joiner = thread::spawn(move || {
        let mut reactor = builder.build().expect("reactor construction failed");
        tx.send(reactor.handle()).unwrap();
        reactor.run();
    });
    (rx.recv().unwrap(), joiner)
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_premature_returns_trigger_exactly_one_rebuild() {
    let shared = MockShared::new();
    let (handle, joiner) = spawn_reactor(
        ReactorBuilder::new()
            .provider(MockProvider {
                shared: shared.clone(),
            })
            .auto_rebuild_threshold(512),
    );

    let reads = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    {
        let reads = reads.clone();
        let closed = closed.clone();
        handle.execute(move |reactor| {
            reactor
                .register(
                    Endpoint::new(9, Interest::READ),
                    Interest::READ,
                    Attachment::Channel(CountingChannel::new(reads, closed)),
                )
                .unwrap();
            ready_tx.send(()).unwrap();
        });
    }
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(shared.opens.load(Ordering::SeqCst), 1);

    // Arm the defect: 512 consecutive premature returns must rebuild once.
    shared.defect_armed.store(true, Ordering::SeqCst);
    handle.wakeup();
    wait_until("the multiplexer rebuild", || {
        shared.opens.load(Ordering::SeqCst) == 2
    });

    // The registration was migrated; readiness on the new multiplexer must
    // still reach the channel.
    shared.deliver_pending.store(true, Ordering::SeqCst);
    handle.wakeup();
    wait_until("dispatch after the rebuild", || {
        reads.load(Ordering::SeqCst) >= 1
    });

    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        shared.opens.load(Ordering::SeqCst),
        2,
        "the streak must trigger exactly one rebuild"
    );

    handle.shutdown();
    joiner.join().unwrap();
    assert!(closed.load(Ordering::SeqCst), "shutdown must close the channel");
}

#[test]
fn test_cancellation_threshold_forces_reselect() {
    let shared = MockShared::new();
    let (handle, joiner) = spawn_reactor(ReactorBuilder::new().provider(MockProvider {
        shared: shared.clone(),
    }));

    let reads = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let (result_tx, result_rx) = mpsc::channel();
    {
        let shared = shared.clone();
        handle.execute(move |reactor| {
            let channel = CountingChannel::new(reads, closed);
            let regs: Vec<_> = (0..256)
                .map(|i| {
                    reactor
                        .register(
                            Endpoint::new(1000 + i, Interest::READ),
                            Interest::READ,
                            Attachment::Channel(channel.clone()),
                        )
                        .unwrap()
                })
                .collect();

            // 255 cancellations stay below the threshold.
            for reg in &regs[..255] {
                reactor.cancel(reg);
            }
            result_tx.send(shared.select_now_calls.load(Ordering::SeqCst)).unwrap();

            let in_loop = reactor.handle();
            let last = regs[255].clone();
            {
                let shared = shared.clone();
                let result_tx = result_tx.clone();
                in_loop.execute(move |reactor| {
                    // The 256th cancellation marks the loop for a forced
                    // re-poll before the next task is handed out.
                    reactor.cancel(&last);
                    result_tx
                        .send(shared.select_now_calls.load(Ordering::SeqCst))
                        .unwrap();

                    let shared = shared.clone();
                    let result_tx = result_tx.clone();
                    reactor.handle().execute(move |_| {
                        result_tx
                            .send(shared.select_now_calls.load(Ordering::SeqCst))
                            .unwrap();
                    });
                });
            }
        });
    }

    let below_threshold = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let at_threshold = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let after_threshold = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        at_threshold, below_threshold,
        "255 cancellations must not force a re-poll"
    );
    assert_eq!(
        after_threshold,
        below_threshold + 1,
        "the 256th cancellation must force exactly one re-poll before the next task"
    );

    handle.shutdown();
    joiner.join().unwrap();
}

#[test]
fn test_io_ratio_100_dispatches_readiness_before_tasks() {
    let shared = MockShared::new();
    let (handle, joiner) = spawn_reactor(
        ReactorBuilder::new()
            .provider(MockProvider {
                shared: shared.clone(),
            })
            .io_ratio(100),
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    let (ready_tx, ready_rx) = mpsc::channel();
    {
        let order = order.clone();
        handle.execute(move |reactor| {
            let channel = Rc::new(OrderChannel { order });
            reactor
                .register(
                    Endpoint::new(9, Interest::READ),
                    Interest::READ,
                    Attachment::Channel(channel),
                )
                .unwrap();
            ready_tx.send(()).unwrap();
        });
    }
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Make readiness and a task arrive in the same iteration: the wake
    // that delivers the task also delivers the readiness event.
    shared.deliver_pending.store(true, Ordering::SeqCst);
    let (done_tx, done_rx) = mpsc::channel();
    {
        let order = order.clone();
        handle.execute(move |_| {
            order.lock().unwrap().push("task");
            done_tx.send(()).unwrap();
        });
    }
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let order = order.lock().unwrap().clone();
    let io_at = order.iter().position(|entry| *entry == "io");
    let task_at = order.iter().position(|entry| *entry == "task");
    assert!(
        io_at.is_some() && io_at < task_at,
        "readiness dispatch must never be preempted by tasks: {order:?}"
    );

    handle.shutdown();
    joiner.join().unwrap();
}

#[test]
fn test_zero_readiness_event_reaches_read_path() {
    let shared = MockShared::new();
    let (handle, joiner) = spawn_reactor(ReactorBuilder::new().provider(MockProvider {
        shared: shared.clone(),
    }));

    let reads = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    {
        let reads = reads.clone();
        let closed = closed.clone();
        handle.execute(move |reactor| {
            reactor
                .register(
                    Endpoint::new(9, Interest::READ),
                    Interest::READ,
                    Attachment::Channel(CountingChannel::new(reads, closed)),
                )
                .unwrap();
            ready_tx.send(()).unwrap();
        });
    }
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // An event with no readiness at all must still be handed to the read
    // path instead of being silently dropped.
    shared.deliver_zero_pending.store(true, Ordering::SeqCst);
    handle.wakeup();
    wait_until("the defensive read dispatch", || {
        reads.load(Ordering::SeqCst) >= 1
    });

    handle.shutdown();
    joiner.join().unwrap();
}

struct OrderChannel {
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl ChannelIo for OrderChannel {
    fn read(&self) -> io::Result<()> {
        self.order.lock().unwrap().push("io");
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn finish_connect(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn is_open(&self) -> bool {
        true
    }
}

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spindle::{
    Attachment, ChannelIo, Endpoint, Interest, IoTask, Reactor, ReactorBuilder, ReactorHandle,
    Registration,
};

/// Channel that reads available bytes from a pipe and reports them.
struct PipeChannel {
    fd: RawFd,
    open: Cell<bool>,
    bytes_read: Sender<usize>,
}

impl ChannelIo for PipeChannel {
    fn read(&self) -> io::Result<()> {
        let mut buf = [0u8; 256];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            // End of stream: the peer closed its end.
            self.open.set(false);
        }
        let _ = self.bytes_read.send(n as usize);
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
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }
}

struct UnregisterProbe {
    unregistered: Arc<Mutex<Vec<Option<String>>>>,
}

impl IoTask for UnregisterProbe {
    fn ready(&self, _fd: RawFd, _registration: &Registration) -> io::Result<()> {
        Ok(())
    }

    fn unregistered(&self, _fd: RawFd, cause: Option<&io::Error>) {
        self.unregistered
            .lock()
            .unwrap()
            .push(cause.map(|err| err.to_string()));
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

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe() failed");
    (fds[0], fds[1])
}

fn register_pipe_reader(handle: &ReactorHandle, rfd: RawFd) -> mpsc::Receiver<usize> {
    let (bytes_tx, bytes_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    handle.execute(move |reactor: &mut Reactor| {
        let channel = Rc::new(PipeChannel {
            fd: rfd,
            open: Cell::new(true),
            bytes_read: bytes_tx,
        });
        reactor
            .register(
                Endpoint::new(rfd, Interest::READ),
                Interest::READ,
                Attachment::Channel(channel),
            )
            .unwrap();
        ready_tx.send(()).unwrap();
    });
    ready_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("registration did not run");
    bytes_rx
}

#[test]
fn test_pipe_readiness_dispatches_read() {
    let (handle, joiner) = spawn_reactor(ReactorBuilder::new());
    let (rfd, wfd) = make_pipe();
    let bytes_rx = register_pipe_reader(&handle, rfd);

    let wrote = unsafe { libc::write(wfd, b"ping".as_ptr() as *const _, 4) };
    assert_eq!(wrote, 4);

    let n = bytes_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("read readiness was not dispatched");
    assert_eq!(n, 4);

    handle.shutdown();
    joiner.join().unwrap();
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}

#[test]
fn test_pipe_readiness_with_plain_ready_set() {
    // The fallback readiness-set path must be observably equivalent.
    let (handle, joiner) = spawn_reactor(ReactorBuilder::new().disable_ready_set_optimization());
    let (rfd, wfd) = make_pipe();
    let bytes_rx = register_pipe_reader(&handle, rfd);

    let wrote = unsafe { libc::write(wfd, b"pong".as_ptr() as *const _, 4) };
    assert_eq!(wrote, 4);
    assert_eq!(
        bytes_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        4,
        "the plain path must deliver the same readiness"
    );

    handle.shutdown();
    joiner.join().unwrap();
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}

#[test]
fn test_peer_close_reaches_read_path_as_eof() {
    let (handle, joiner) = spawn_reactor(ReactorBuilder::new());
    let (rfd, wfd) = make_pipe();
    let bytes_rx = register_pipe_reader(&handle, rfd);

    unsafe { libc::close(wfd) };

    let n = bytes_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("hangup was not dispatched");
    assert_eq!(n, 0, "peer close must surface as a zero-byte read");

    handle.shutdown();
    joiner.join().unwrap();
    unsafe { libc::close(rfd) };
}

#[test]
fn test_foreign_thread_task_breaks_blocked_wait() {
    let (handle, joiner) = spawn_reactor(ReactorBuilder::new());

    // Let the loop settle into a blocking wait.
    thread::sleep(Duration::from_millis(100));

    let (tx, rx) = mpsc::channel();
    let submitted = Instant::now();
    handle.execute(move |_| {
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("task was not executed");
    assert!(
        submitted.elapsed() < Duration::from_millis(500),
        "wakeup must break the blocked wait well before the select ceiling"
    );

    handle.shutdown();
    joiner.join().unwrap();
}

#[test]
fn test_scheduled_tasks_run_in_deadline_order() {
    let (handle, joiner) = spawn_reactor(ReactorBuilder::new());

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();

    {
        let order = order.clone();
        handle.schedule(Duration::from_millis(60), move |_| {
            order.lock().unwrap().push("late");
        });
    }
    {
        let order = order.clone();
        handle.schedule(Duration::from_millis(10), move |_| {
            order.lock().unwrap().push("early");
        });
    }
    handle.schedule(Duration::from_millis(120), move |_| {
        done_tx.send(()).unwrap();
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("scheduled tasks did not fire");
    assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);

    handle.shutdown();
    joiner.join().unwrap();
}

#[test]
fn test_shutdown_closes_channels_and_notifies_tasks() {
    let (handle, joiner) = spawn_reactor(ReactorBuilder::new());
    let (rfd, wfd) = make_pipe();
    let (task_rfd, task_wfd) = make_pipe();

    let closed = Arc::new(AtomicBool::new(false));
    let unregistered = Arc::new(Mutex::new(Vec::new()));
    let (ready_tx, ready_rx) = mpsc::channel();
    {
        let closed = closed.clone();
        let unregistered = unregistered.clone();
        handle.execute(move |reactor| {
            let channel = Rc::new(ClosableChannel {
                closed,
                open: Cell::new(true),
            });
            reactor
                .register(
                    Endpoint::new(rfd, Interest::READ),
                    Interest::READ,
                    Attachment::Channel(channel),
                )
                .unwrap();

            let probe = Rc::new(UnregisterProbe { unregistered });
            reactor
                .register(
                    Endpoint::new(task_rfd, Interest::READ),
                    Interest::READ,
                    Attachment::Task(probe),
                )
                .unwrap();
            ready_tx.send(()).unwrap();
        });
    }
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    handle.shutdown();
    joiner.join().unwrap();

    assert!(
        closed.load(Ordering::SeqCst),
        "shutdown must close channel attachments"
    );
    assert_eq!(
        *unregistered.lock().unwrap(),
        vec![None],
        "shutdown must notify task attachments exactly once, without a cause"
    );

    unsafe {
        libc::close(rfd);
        libc::close(wfd);
        libc::close(task_rfd);
        libc::close(task_wfd);
    }
}

struct ClosableChannel {
    closed: Arc<AtomicBool>,
    open: Cell<bool>,
}

impl ChannelIo for ClosableChannel {
    fn read(&self) -> io::Result<()> {
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

//! Completion promises for queued writes.
//!
//! A [`WritePromise`] is completed exactly once, on the reactor thread, with
//! either success or a failure cause. Listeners registered with
//! [`WritePromise::on_complete`] run synchronously at completion time, in
//! registration order; a listener registered after completion runs
//! immediately. Listeners may reenter the write queue that completed the
//! promise, which is why completion releases all internal borrows before
//! invoking them.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

/// The result a promise was completed with.
#[derive(Clone, Debug)]
pub enum WriteOutcome {
    /// The write was handed to the underlying write path successfully.
    Success,
    /// The write failed; the cause is shared by every promise failed in the
    /// same batch.
    Failure(Rc<io::Error>),
}

impl WriteOutcome {
    /// Returns true for [`WriteOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, WriteOutcome::Success)
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Rc<io::Error>> {
        match self {
            WriteOutcome::Success => None,
            WriteOutcome::Failure(cause) => Some(cause),
        }
    }
}

type Listener = Box<dyn FnOnce(&WriteOutcome)>;

struct PromiseState {
    outcome: Option<WriteOutcome>,
    listeners: Vec<Listener>,
}

/// A single-threaded, complete-exactly-once write promise.
///
/// Clones share the same underlying state.
///
/// # Example
///
/// ```
/// use spindle::WritePromise;
///
/// let promise = WritePromise::new();
/// promise.on_complete(|outcome| assert!(outcome.is_success()));
/// assert!(promise.complete());
/// assert!(!promise.complete(), "second completion must be rejected");
/// ```
#[derive(Clone)]
pub struct WritePromise {
    inner: Rc<RefCell<PromiseState>>,
}

impl WritePromise {
    /// Creates an incomplete promise.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(PromiseState {
                outcome: None,
                listeners: Vec::new(),
            })),
        }
    }

    /// Completes the promise successfully.
    ///
    /// Returns false if the promise was already complete; the first
    /// completion always wins.
    pub fn complete(&self) -> bool {
        self.finish(WriteOutcome::Success)
    }

    /// Completes the promise with `cause`.
    ///
    /// Returns false if the promise was already complete.
    pub fn fail(&self, cause: Rc<io::Error>) -> bool {
        self.finish(WriteOutcome::Failure(cause))
    }

    /// Registers a completion listener.
    ///
    /// Runs immediately if the promise is already complete.
    pub fn on_complete(&self, listener: impl FnOnce(&WriteOutcome) + 'static) {
        let ready = self.inner.borrow().outcome.clone();

        // Run outside the borrow so the listener may reenter.
        match ready {
            Some(outcome) => listener(&outcome),
            None => self.inner.borrow_mut().listeners.push(Box::new(listener)),
        }
    }

    /// Returns true once the promise has been completed.
    pub fn is_complete(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// The outcome, if the promise has been completed.
    pub fn outcome(&self) -> Option<WriteOutcome> {
        self.inner.borrow().outcome.clone()
    }

    /// Builds a promise that completes when every promise in `parts` has
    /// completed: successfully if all parts succeeded, otherwise with the
    /// first observed failure cause.
    ///
    /// An empty slice yields an already-successful promise.
    pub fn aggregate(parts: &[WritePromise]) -> WritePromise {
        let combined = WritePromise::new();
        if parts.is_empty() {
            combined.complete();
            return combined;
        }

        let remaining = Rc::new(RefCell::new(parts.len()));
        let first_failure: Rc<RefCell<Option<Rc<io::Error>>>> = Rc::new(RefCell::new(None));

        for part in parts {
            let combined = combined.clone();
            let remaining = remaining.clone();
            let first_failure = first_failure.clone();
            part.on_complete(move |outcome| {
                if let WriteOutcome::Failure(cause) = outcome {
                    let mut slot = first_failure.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(cause.clone());
                    }
                }

                let mut left = remaining.borrow_mut();
                *left -= 1;
                if *left == 0 {
                    drop(left);
                    match first_failure.borrow().clone() {
                        Some(cause) => combined.fail(cause),
                        None => combined.complete(),
                    };
                }
            });
        }

        combined
    }

    fn finish(&self, outcome: WriteOutcome) -> bool {
        let listeners = {
            let mut state = self.inner.borrow_mut();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.listeners)
        };

        // Borrow released: listeners may reenter queue and promise APIs.
        for listener in listeners {
            listener(&outcome);
        }
        true
    }
}

impl Default for WritePromise {
    fn default() -> Self {
        Self::new()
    }
}

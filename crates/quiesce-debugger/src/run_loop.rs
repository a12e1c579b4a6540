use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::thread::ThreadId;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long [RunLoop::cycle] waits for a callback to arrive.
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_millis(10);

thread_local! {
    static CURRENT: Arc<RunLoop> = Arc::new(RunLoop::new());
}

/// Cooperative queue of callbacks bound to a single thread.
///
/// Any thread can dispatch callbacks onto a run loop, but only the bound
/// thread services them.
pub struct RunLoop {
    /// Thread servicing this run loop.
    thread_id: ThreadId,

    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl RunLoop {
    fn new() -> Self {
        let (tx, rx) = channel::unbounded();

        Self {
            thread_id: ThreadId::current(),
            tx,
            rx,
        }
    }

    /// Returns the run loop bound to the calling thread.
    pub fn current() -> Arc<Self> {
        CURRENT.with(Arc::clone)
    }

    /// Returns the thread servicing this run loop.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Returns whether the calling thread is the one servicing this run loop.
    pub fn is_current(&self) -> bool {
        self.thread_id == ThreadId::current()
    }

    /// Queues a callback, to be executed the next time the bound thread
    /// services its run loop.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        // the receiver lives as long as `self`, so sending cannot fail
        let _ = self.tx.send(Box::new(task));
    }

    /// Wakes up the bound thread if it is waiting for callbacks.
    pub fn wake(&self) {
        self.dispatch(|| ());
    }

    /// Returns the number of queued callbacks.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Services one batch of callbacks, waiting up to
    /// [DEFAULT_CYCLE_TIMEOUT] for the first one.
    ///
    /// Returns the number of executed callbacks.
    pub fn cycle(&self) -> usize {
        self.cycle_timeout(DEFAULT_CYCLE_TIMEOUT)
    }

    /// Services one batch of callbacks, waiting up to `timeout` for the
    /// first one.
    ///
    /// Returns the number of executed callbacks.
    pub fn cycle_timeout(&self, timeout: Duration) -> usize {
        if !self.is_current() {
            tracing::warn!(owner = %self.thread_id, "run loop cycled by foreign thread");
            return 0;
        }

        let Ok(first) = self.rx.recv_timeout(timeout) else {
            return 0;
        };

        first();

        1 + self.service_pending()
    }

    /// Services the callbacks queued so far, without waiting.
    ///
    /// Callbacks queued while servicing are left for the next batch.
    ///
    /// Returns the number of executed callbacks.
    pub fn service_pending(&self) -> usize {
        if !self.is_current() {
            tracing::warn!(owner = %self.thread_id, "run loop serviced by foreign thread");
            return 0;
        }

        let batch = self.rx.len();

        self.rx.try_iter().take(batch).fold(0, |count, task| {
            task();
            count + 1
        })
    }
}

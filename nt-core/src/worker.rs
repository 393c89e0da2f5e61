//! Named OS threads joined with a deadline, and poison-tolerant locking.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

/// How long shutdown waits for any one thread.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to a spawned thread that signals when its body returns (or unwinds).
pub struct Worker {
    name: String,
    handle: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> io::Result<Worker>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (tx, done) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _done = tx;
            f();
        })?;
        Ok(Worker { name, handle, done })
    }

    /// Join, giving up after `timeout`. A thread that overruns is logged and detached.
    pub fn join_timeout(self, timeout: Duration) -> bool {
        if self.handle.thread().id() == thread::current().id() {
            return true;
        }
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    warn!("{} thread panicked", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} thread did not stop within {:?}", self.name, timeout);
                false
            }
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Returns the guard and whether the wait timed out.
pub(crate) fn wait_timeout<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, bool) {
    let (g, res) = cv
        .wait_timeout(guard, timeout)
        .unwrap_or_else(PoisonError::into_inner);
    (g, res.timed_out())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn joins_finished_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let w = Worker::spawn("quick", move || r.store(true, Ordering::SeqCst)).unwrap();
        assert!(w.join_timeout(JOIN_TIMEOUT));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn overrunning_thread_is_detached() {
        let (tx, rx) = mpsc::channel::<()>();
        let w = Worker::spawn("slow", move || {
            let _ = rx.recv();
        })
        .unwrap();
        assert!(!w.join_timeout(Duration::from_millis(20)));
        drop(tx);
    }

    #[test]
    fn panicking_thread_counts_as_done() {
        let w = Worker::spawn("panics", || panic!("boom")).unwrap();
        assert!(w.join_timeout(JOIN_TIMEOUT));
    }
}

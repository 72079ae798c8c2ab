//! Deadline timer thread.
//!
//! One named thread owns a deadline-ordered map of boxed closures. The
//! client engine uses it for call deadlines and reconnect supervision.
//! Cancelling a pending entry drops the closure unrun, which releases
//! everything the closure owns — reconnect supervision relies on this to
//! free a parked call context when its timer is aborted.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type TimerFn = Box<dyn FnOnce() + Send>;

struct TimerState {
    entries: BTreeMap<(Instant, u64), TimerFn>,
    next_id: u64,
    stopped: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Handle to a scheduled closure. Dropping the handle does not cancel.
pub struct TimerHandle {
    inner: Weak<TimerInner>,
    key: (Instant, u64),
}

impl TimerHandle {
    /// Cancel the entry if it has not fired yet; its closure is dropped.
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.state.lock();
            state.entries.remove(&self.key);
        }
    }
}

/// A timer worker thread.
#[derive(Clone)]
pub struct TimerThread {
    inner: Arc<TimerInner>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TimerThread {
    pub fn spawn(name: &str) -> TimerThread {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState { entries: BTreeMap::new(), next_id: 0, stopped: false }),
            cv: Condvar::new(),
        });

        let loop_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(loop_inner))
            .expect("failed to spawn timer thread");

        TimerThread { inner, worker: Arc::new(Mutex::new(Some(handle))) }
    }

    /// Schedule `f` to run after `delay`.
    pub fn schedule_in(&self, delay: Duration, f: TimerFn) -> TimerHandle {
        let mut state = self.inner.state.lock();
        let key = (Instant::now() + delay, state.next_id);
        state.next_id += 1;
        if !state.stopped {
            state.entries.insert(key, f);
            self.inner.cv.notify_one();
        }
        TimerHandle { inner: Arc::downgrade(&self.inner), key }
    }

    /// Stop the thread; pending closures are dropped unrun.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.entries.clear();
            self.inner.cv.notify_one();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(inner: Arc<TimerInner>) {
    let mut state = inner.state.lock();
    loop {
        if state.stopped {
            return;
        }
        let now = Instant::now();
        match state.entries.keys().next().copied() {
            Some((due, _)) if due <= now => {
                let due_keys: Vec<_> =
                    state.entries.range(..=(now, u64::MAX)).map(|(k, _)| *k).collect();
                for key in due_keys {
                    if let Some(f) = state.entries.remove(&key) {
                        // Run without the lock so closures may reschedule.
                        drop(state);
                        f();
                        state = inner.state.lock();
                    }
                }
            }
            Some((due, _)) => {
                inner.cv.wait_until(&mut state, due);
            }
            None => {
                inner.cv.wait(&mut state);
            }
        }
    }
}

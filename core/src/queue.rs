//! Completion queue and the zero-delay alarm.
//!
//! The queue is the meeting point of the wire layer and the engines:
//! asynchronous operations complete by posting `(tag, ok)` events, and
//! worker threads block on `next()` to drive the per-call state
//! machines. Within one queue each event is delivered to exactly one
//! consumer; across queues events run in parallel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};

/// Wake sentinel posted by `shutdown()`. Never a real context address.
const WAKE_TAG: usize = usize::MAX;

/// One completion event: the tag handed to the operation, and whether
/// the operation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub tag: usize,
    pub ok: bool,
}

/// Multi-producer, multi-consumer completion queue.
///
/// After `shutdown()`, already posted events keep draining out of
/// `next()`; once the queue is empty `next()` returns `None` and the
/// consumer should exit. Posts arriving after shutdown are absorbed: the
/// operation's context is never woken again and leaks until process
/// exit, which is the documented cost of shutting down with work in
/// flight.
pub struct CompletionQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    shut: AtomicBool,
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(CompletionQueue { tx, rx, shut: AtomicBool::new(false) })
    }

    /// Post a completion event. Absorbed silently after shutdown.
    pub fn post(&self, tag: usize, ok: bool) {
        if self.shut.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.send(Event { tag, ok });
    }

    /// Block for the next event. `None` once the queue is shut down and
    /// drained.
    pub fn next(&self) -> Option<Event> {
        loop {
            if self.shut.load(Ordering::Acquire) {
                // Drain already posted completions, then report
                // exhaustion. Every exit passes the wake on, so any
                // number of consumers still blocked in `recv` below
                // unwind in turn.
                loop {
                    match self.rx.try_recv() {
                        Ok(ev) if ev.tag != WAKE_TAG => {
                            let _ = self.tx.send(Event { tag: WAKE_TAG, ok: false });
                            return Some(ev);
                        }
                        Ok(_) => continue,
                        Err(_) => {
                            let _ = self.tx.send(Event { tag: WAKE_TAG, ok: false });
                            return None;
                        }
                    }
                }
            }
            match self.rx.recv() {
                Ok(ev) if ev.tag != WAKE_TAG => return Some(ev),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Shut the queue down. Consumers drain what was already posted and
    /// then observe exhaustion.
    pub fn shutdown(&self) {
        if !self.shut.swap(true, Ordering::AcqRel) {
            // A single wake suffices: each consumer that unwinds
            // re-posts it for the next one, however many are blocked.
            let _ = self.tx.send(Event { tag: WAKE_TAG, ok: false });
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }
}

/// Zero-delay alarm.
///
/// The engines use it to bounce a user-thread action back onto a queue
/// thread: arming the alarm posts the tag immediately, and the state
/// machine resumes when a worker pulls the event.
#[derive(Debug, Default)]
pub struct Alarm;

impl Alarm {
    pub const fn new() -> Self {
        Alarm
    }

    pub fn set(&self, queue: &CompletionQueue, tag: usize) {
        queue.post(tag, true);
    }
}

//! Supervisor record of one server-stream subscription.

use std::any::TypeId;
use std::time::Duration;

use crossbeam_channel::Sender;
use grapnel_core::{TimerHandle, TimerThread};
use grapnel_wire::ClientContext;

use crate::call::SessionId;
use crate::detail::context::{RawCall, RunGuard};
use crate::engine::Job;

/// Keyed by session id in the engine's stream map. Carries what the
/// engine needs to cancel the live RPC and to supervise reconnects.
pub(crate) struct ServerStreamEntry {
    /// Fingerprint of the request message type; one stream per type.
    pub request_type: TypeId,
    pub session_id: SessionId,
    /// The active call's context, for cancellation. Replaced on each
    /// relaunch.
    pub context: ClientContext,
    pub relaunch_interval: Duration,
    relaunch_timer: Option<TimerHandle>,
}

impl ServerStreamEntry {
    pub fn new(
        request_type: TypeId,
        session_id: SessionId,
        context: ClientContext,
        relaunch_interval: Duration,
    ) -> Self {
        ServerStreamEntry {
            request_type,
            session_id,
            context,
            relaunch_interval,
            relaunch_timer: None,
        }
    }

    /// Cancel the pending reconnect (its parked context is reclaimed)
    /// and the live RPC.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.relaunch_timer.take() {
            timer.cancel();
        }
        self.context.try_cancel();
    }

    /// Arm the reconnect timer: after the interval, the parked context
    /// is run on the strand. An aborted timer drops it instead.
    pub fn schedule_relaunch(&mut self, raw: RawCall, timer: &TimerThread, strand: Sender<Job>) {
        let mut armed = RunGuard::new(raw);
        let handle = timer.schedule_in(
            self.relaunch_interval,
            Box::new(move || {
                let raw = armed.disarm();
                let mut queued = RunGuard::new(raw);
                let job = Job::Work(Box::new(move |_core| {
                    let raw = queued.disarm();
                    unsafe { raw.context().run() };
                }));
                // A send failure drops the job, whose guard reclaims.
                let _ = strand.send(job);
            }),
        );
        self.relaunch_timer = Some(handle);
    }
}

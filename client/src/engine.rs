//! The client runtime engine.
//!
//! Dispatches RPCs to the wire and executes the provided callbacks on
//! call events. Two internal threads do the work: one pumps the
//! completion queue, one runs the strand — a serialized job queue that
//! owns all engine state (the stream map, the running flag). Public
//! operations post a job and return; queue events are translated on
//! the pump and re-posted onto the strand before dispatch.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use grapnel_core::tag::split;
use grapnel_core::{CompletionQueue, Logger, TimerThread};
use grapnel_wire::{Channel, ChannelLimits, ClientContext, Directory, Message, Status};
use parking_lot::Mutex;

use crate::call::{
    ClientState, ServerStreamCall, SessionId, SingularCall, StreamEvent,
};
use crate::config::{Environment, Options};
use crate::detail::context::{Aliveness, RawCall, RunGuard};
use crate::detail::singular::SingularCallContext;
use crate::detail::stream::ServerStreamCallContext;
use crate::entry::ServerStreamEntry;
use crate::metrics;

fn client_engine_category() -> &'static str {
    "ClientEngine"
}

/// One unit of strand work.
pub(crate) enum Job {
    Work(Box<dyn FnOnce(&mut EngineCore) + Send>),
    Stop,
}

/// State owned by the strand thread; nothing else touches it.
pub(crate) struct EngineCore {
    pub streams: HashMap<SessionId, ServerStreamEntry>,
}

pub(crate) struct EngineShared {
    options: Options,
    channel: Channel,
    queue: Arc<CompletionQueue>,
    running: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl EngineShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// What call contexts hold instead of the engine: enough to post jobs
/// back onto the strand.
#[derive(Clone)]
pub(crate) struct EngineRef {
    strand_tx: Sender<Job>,
    shared: Arc<EngineShared>,
    timer: TimerThread,
}

impl EngineRef {
    /// Re-arm a finished stream: if its entry still exists and the
    /// engine runs, the parked replacement context starts after the
    /// entry's reconnect interval.
    pub(crate) fn relaunch_stream(
        &self,
        session_id: SessionId,
        context: ClientContext,
        raw: RawCall,
    ) {
        let shared = self.shared.clone();
        let timer = self.timer.clone();
        let strand_tx = self.strand_tx.clone();
        let mut queued = RunGuard::new(raw);

        let job = Job::Work(Box::new(move |core| {
            let raw = queued.disarm();
            if !core.streams.contains_key(&session_id) {
                // Shut down while finishing; nothing supervises this
                // context any more.
                unsafe { raw.reclaim() };
                return;
            }
            if !shared.is_running() {
                core.streams.remove(&session_id);
                metrics::STREAMS_ACTIVE.decrement();
                unsafe { raw.reclaim() };
                return;
            }
            let entry = core.streams.get_mut(&session_id).expect("presence checked above");
            shared
                .logger
                .debug(|| format!("stream '{}' scheduled for relaunch", entry.session_id));
            entry.context = context;
            entry.schedule_relaunch(raw, &timer, strand_tx.clone());
        }));
        let _ = self.strand_tx.send(job);
    }

    /// Remove a finished stream's entry.
    pub(crate) fn cleanup_stream(&self, session_id: SessionId) {
        let job = Job::Work(Box::new(move |core| {
            if core.streams.remove(&session_id).is_some() {
                metrics::STREAMS_ACTIVE.decrement();
            }
        }));
        let _ = self.strand_tx.send(job);
    }
}

struct Strand {
    tx: Sender<Job>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Strand {
    fn spawn(name: &str) -> Strand {
        let (tx, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Strand::run(rx))
            .expect("failed to spawn strand thread");
        Strand { tx, thread: Mutex::new(Some(handle)) }
    }

    fn run(rx: Receiver<Job>) {
        let mut core = EngineCore { streams: HashMap::new() };
        for job in rx {
            match job {
                Job::Work(work) => work(&mut core),
                Job::Stop => break,
            }
        }
    }

    fn post(&self, work: impl FnOnce(&mut EngineCore) + Send + 'static) {
        let _ = self.tx.send(Job::Work(Box::new(work)));
    }

    fn sender(&self) -> Sender<Job> {
        self.tx.clone()
    }

    fn stop(&self) {
        let _ = self.tx.send(Job::Stop);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Client runtime engine. See the crate docs for the model.
pub struct ClientEngine {
    shared: Arc<EngineShared>,
    strand: Strand,
    timer: TimerThread,
    shut: bool,
}

impl ClientEngine {
    /// Create the channel and the internal threads. The engine stays
    /// in `Standby` until [`run`](Self::run).
    pub fn new(options: Options, environment: Environment, directory: &Directory) -> Self {
        let timer = TimerThread::spawn("grapnel-client-timer");
        let limits = ChannelLimits {
            max_send_bytes: options.request_size_limit_bytes(),
            max_recv_bytes: options.response_size_limit_bytes(),
        };
        let channel = Channel::connect(
            directory,
            options.address(),
            options.credentials().clone(),
            limits,
            timer.clone(),
        );

        let shared = Arc::new(EngineShared {
            options,
            channel,
            queue: CompletionQueue::new(),
            running: AtomicBool::new(false),
            pump: Mutex::new(None),
            logger: Logger::new(client_engine_category, environment.logger_callback()),
        });
        let strand = Strand::spawn("grapnel-client-strand");

        ClientEngine { shared, strand, timer, shut: false }
    }

    /// Current engine state.
    pub fn state(&self) -> ClientState {
        if self.shared.is_running() { ClientState::Running } else { ClientState::Standby }
    }

    /// Start the completion-queue pump and allow API executions.
    /// Blocks until the engine is `Running`; call once.
    pub fn run(&self) {
        let (promise_tx, promise_rx) = bounded::<()>(1);
        let shared = self.shared.clone();
        let strand_tx = self.strand.sender();

        self.strand.post(move |_core| {
            if !shared.running.swap(true, Ordering::AcqRel) {
                shared.logger.info(|| "client engine running".to_string());
                let pump_shared = shared.clone();
                let pump_tx = strand_tx.clone();
                let handle = thread::Builder::new()
                    .name("grapnel-client-pump".to_string())
                    .spawn(move || pump_loop(pump_shared, pump_tx))
                    .expect("failed to spawn pump thread");
                *shared.pump.lock() = Some(handle);
            }
            let _ = promise_tx.send(());
        });

        let _ = promise_rx.recv();
    }

    /// Execute a singular call. Posted onto the strand; if the engine
    /// is not running the call is dropped.
    pub fn execute_singular_call<Req: Message, Resp: Message>(
        &self,
        call: SingularCall<Req, Resp>,
    ) {
        let shared = self.shared.clone();
        self.strand.post(move |_core| {
            if !shared.is_running() {
                return;
            }
            let SingularCall { request, reader_factory, callback, deadline } = call;

            let context = ClientContext::new();
            context.set_deadline(deadline.unwrap_or(shared.options.singular_call_deadline()));
            let reader = reader_factory(&shared.channel, &context, &request, &shared.queue);

            metrics::SINGULAR_CALLS.increment();
            let raw = RawCall::spawn(Box::new(SingularCallContext::new(
                request, callback, context, reader,
            )));
            unsafe { raw.context().run() };
        });
    }

    /// Launch a server stream. Posted onto the strand; rejection (a
    /// duplicate session id, a second stream of the same request type,
    /// or an empty session id) is delivered as one terminal
    /// `FAILED_PRECONDITION` event on the call's own callback.
    pub fn launch_server_stream<Req: Message, Notif: Message>(
        &self,
        call: ServerStreamCall<Req, Notif>,
    ) {
        let shared = self.shared.clone();
        let engine = self.engine_ref();
        self.strand.post(move |core| {
            if !shared.is_running() {
                return;
            }
            let ServerStreamCall {
                session_id,
                request,
                reader_factory,
                callback,
                deadline,
                relaunch_interval,
                relaunch_policy,
            } = call;

            let reject = |reason: &str, mut callback: crate::call::StreamEventCallback<Notif>| {
                shared.logger.error(|| format!("stream '{session_id}' rejected: {reason}"));
                metrics::STREAMS_REJECTED.increment();
                callback(StreamEvent::Finished(Status::failed_precondition(reason)));
            };

            if session_id.is_empty() {
                return reject("empty session id", callback);
            }
            let request_type = TypeId::of::<Req>();
            if core.streams.values().any(|entry| entry.request_type == request_type) {
                return reject("duplicated stream type", callback);
            }
            if core.streams.contains_key(&session_id) {
                return reject("duplicated stream session id", callback);
            }

            let context = ServerStreamCallContext::new(
                engine,
                shared.channel.clone(),
                shared.queue.clone(),
                request,
                session_id.clone(),
                deadline.unwrap_or(shared.options.server_stream_deadline()),
                relaunch_policy.unwrap_or(shared.options.server_stream_relaunch_policy()),
                callback,
                reader_factory,
            );

            core.streams.insert(
                session_id.clone(),
                ServerStreamEntry::new(
                    request_type,
                    session_id,
                    context.client_context(),
                    relaunch_interval
                        .unwrap_or(shared.options.server_stream_relaunch_interval()),
                ),
            );
            metrics::STREAMS_ACTIVE.increment();
            metrics::STREAMS_LAUNCHED.increment();

            let raw = RawCall::spawn(Box::new(context));
            unsafe { raw.context().run() };
        });
    }

    /// Shut down a server stream, if present: cancels the live RPC and
    /// any pending reconnect, and removes the entry.
    pub fn shutdown_server_stream(&self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        let shared = self.shared.clone();
        self.strand.post(move |core| {
            if !shared.is_running() {
                return;
            }
            if let Some(mut entry) = core.streams.remove(&session_id) {
                shared.logger.debug(|| format!("stream '{}' shut down", entry.session_id));
                entry.cancel();
                metrics::STREAMS_ACTIVE.decrement();
            }
        });
    }

    /// Latch `Standby`, cancel every supervised stream, then tear the
    /// internal threads down. Each in-flight stream observes exactly
    /// one `ABORTED "Client shutdown"` event.
    pub fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;

        let (promise_tx, promise_rx) = bounded::<()>(1);
        let shared = self.shared.clone();
        self.strand.post(move |core| {
            shared.running.store(false, Ordering::Release);
            for entry in core.streams.values_mut() {
                shared
                    .logger
                    .debug(|| format!("cancelling stream '{}' on shutdown", entry.session_id));
                entry.cancel();
            }
            let drained = core.streams.drain().count();
            metrics::STREAMS_ACTIVE.sub(drained as i64);
            let _ = promise_tx.send(());
        });
        let _ = promise_rx.recv();

        // Cancellations above have posted their failure events; the
        // pump drains them into dispatch jobs before it sees
        // exhaustion, and the strand runs those jobs before `Stop`.
        self.shared.queue.shutdown();
        if let Some(pump) = self.shared.pump.lock().take() {
            let _ = pump.join();
        }
        self.timer.stop();
        self.strand.stop();
    }

    fn engine_ref(&self) -> EngineRef {
        EngineRef {
            strand_tx: self.strand.sender(),
            shared: self.shared.clone(),
            timer: self.timer.clone(),
        }
    }
}

impl Drop for ClientEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pump_loop(shared: Arc<EngineShared>, strand_tx: Sender<Job>) {
    while let Some(event) = shared.queue.next() {
        let (addr, flags) = split(event.tag);
        let raw = RawCall::from_addr(addr);
        let ok = event.ok;
        let dispatch_shared = shared.clone();

        let job = Job::Work(Box::new(move |_core| {
            let state = if dispatch_shared.is_running() {
                ClientState::Running
            } else {
                ClientState::Standby
            };
            metrics::EVENTS_DISPATCHED.increment();
            match unsafe { raw.context().on_event(ok, state, flags) } {
                Aliveness::Alive => {}
                Aliveness::Dead => unsafe { raw.reclaim() },
            }
        }));
        if strand_tx.send(job).is_err() {
            break;
        }
    }
}

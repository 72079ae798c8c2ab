//! Finite state machine of a server-stream method.
//!
//! The outer context is what completion-queue tags address; the inner
//! implementation is shared: the queue-thread path reaches it through
//! the outer context, userspace through a weak handle. The outbound
//! FIFO and the state machine are guarded by one mutex, so pushes may
//! come from any thread; a push against an idle stream arms a
//! zero-delay alarm to bounce processing back onto a queue thread.
//!
//! Peer cancellation is observed through the done probe (tag flag
//! `0b01`) and the context's cancelled flag, checked on every event;
//! once cancelled, pending alarms are drained one by one and further
//! notifications are dropped.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use grapnel_core::tag::{ContextAddr, TagFlags};
use grapnel_core::{Alarm, CompletionQueue, Logger, LoggerCallback, MethodDescriptor};
use grapnel_wire::{Message, RequestSlot, ServerContext, Status, StreamWriter};
use parking_lot::{Mutex, MutexGuard};

use super::context::{self, MethodContext, WeakCell};
use crate::metrics;
use crate::stream::{ServerStreamAcceptorFn, ServerStreamMethod, ServerStreamMethodCallback};

fn server_stream_category() -> &'static str {
    "ServerStreamMethodContext"
}

/// Tag flag of the done probe registered at startup.
pub(crate) const PROBE_FLAGS: TagFlags = TagFlags::new(0b01);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Initial state, nothing happens.
    StandingBy,
    /// Waiting for the next inbound request.
    AwaitingRequest,
    /// Idle: queue empty, no outstanding write.
    AwaitingNotifications,
    /// A push against an idle stream armed the alarm.
    AwaitingAlarm,
    /// A notification write is in flight.
    AwaitingWrite,
    /// The terminal status is being written.
    AwaitingFinish,
    /// Cancelled by the remote; draining stragglers.
    Cancelled,
    /// Terminal.
    Finished,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::StandingBy => "StandingBy",
            State::AwaitingRequest => "AwaitingRequest",
            State::AwaitingNotifications => "AwaitingNotifications",
            State::AwaitingAlarm => "AwaitingAlarm",
            State::AwaitingWrite => "AwaitingWrite",
            State::AwaitingFinish => "AwaitingFinish",
            State::Cancelled => "Cancelled",
            State::Finished => "Finished",
        }
    }
}

struct Mutable<Notif> {
    state: State,
    notifications: VecDeque<Result<Notif, Status>>,
    alarm_count: usize,
    drop_notifications: bool,
    addr: Option<ContextAddr>,
    cell: Option<WeakCell>,
}

pub(crate) struct StreamInner<S, Req: Message, Notif: Message> {
    descriptor: Arc<MethodDescriptor>,
    logger: Logger,
    service: Arc<S>,
    queue: Arc<CompletionQueue>,
    callback: ServerStreamMethodCallback<S, Req, Notif>,
    acceptor: ServerStreamAcceptorFn<S, Req, Notif>,

    server_context: ServerContext,
    request_slot: RequestSlot<Req>,
    stream_writer: StreamWriter<Notif>,
    alarm: Alarm,

    /// Set once at acceptance; read lock-free by request guards.
    request: OnceLock<Req>,
    self_weak: Weak<StreamInner<S, Req, Notif>>,
    mutable: Mutex<Mutable<Notif>>,
}

/// The tagged object: delegates everything to the shared inner.
pub(crate) struct ServerStreamMethodContext<S, Req: Message, Notif: Message> {
    inner: Arc<StreamInner<S, Req, Notif>>,
}

impl<S, Req, Notif> ServerStreamMethodContext<S, Req, Notif>
where
    S: Send + Sync + 'static,
    Req: Message,
    Notif: Message,
{
    /// Construct, install, and start a fresh context.
    pub(crate) fn spawn(
        descriptor: Arc<MethodDescriptor>,
        logger_callback: LoggerCallback,
        service: Arc<S>,
        queue: Arc<CompletionQueue>,
        callback: ServerStreamMethodCallback<S, Req, Notif>,
        acceptor: ServerStreamAcceptorFn<S, Req, Notif>,
    ) {
        let inner = Arc::new_cyclic(|weak| StreamInner {
            descriptor,
            logger: Logger::new(server_stream_category, logger_callback),
            service,
            queue,
            callback,
            acceptor,
            server_context: ServerContext::new(),
            request_slot: RequestSlot::new(),
            stream_writer: StreamWriter::new(),
            alarm: Alarm::new(),
            request: OnceLock::new(),
            self_weak: weak.clone(),
            mutable: Mutex::new(Mutable {
                state: State::StandingBy,
                notifications: VecDeque::new(),
                alarm_count: 0,
                drop_notifications: false,
                addr: None,
                cell: None,
            }),
        });
        inner.logger.debug(|| format!("{} constructed", inner.identity()));
        metrics::CONTEXTS_ACTIVE.increment();
        context::spawn(Box::new(ServerStreamMethodContext { inner }));
    }
}

impl<S, Req, Notif> MethodContext for ServerStreamMethodContext<S, Req, Notif>
where
    S: Send + Sync + 'static,
    Req: Message,
    Notif: Message,
{
    fn install(&mut self, addr: ContextAddr, cell: WeakCell) {
        let mut mutable = self.inner.mutable.lock();
        mutable.addr = Some(addr);
        mutable.cell = Some(cell);
    }

    fn run(&self) {
        self.inner.run();
    }

    fn on_event(&self, ok: bool, flags: TagFlags) {
        self.inner.on_event(ok, flags);
    }
}

impl<S, Req: Message, Notif: Message> Drop for ServerStreamMethodContext<S, Req, Notif> {
    fn drop(&mut self) {
        metrics::CONTEXTS_ACTIVE.decrement();
        self.inner.logger.debug(|| format!("{} destructed", self.inner.identity()));
    }
}

impl<S, Req: Message, Notif: Message> StreamInner<S, Req, Notif> {
    fn identity(&self) -> String {
        format!("{}[impl:{:p}]", self.descriptor.full_name, self)
    }
}

impl<S, Req, Notif> StreamInner<S, Req, Notif>
where
    S: Send + Sync + 'static,
    Req: Message,
    Notif: Message,
{
    pub(crate) fn peer(&self) -> String {
        self.server_context.peer()
    }

    pub(crate) fn request(&self) -> Option<&Req> {
        self.request.get()
    }

    fn run(&self) {
        let mut mutable = self.mutable.lock();
        assert_eq!(mutable.state, State::StandingBy, "run outside StandingBy");
        self.logger.debug(|| format!("{} running", self.identity()));

        let addr = mutable.addr.expect("context installed before run");
        let cell = mutable.cell.clone().expect("context installed before run");

        // The probe count is held from registration until the probe
        // fires (cancel or finish) or is explicitly released.
        context::retain_event(&cell);
        self.server_context.async_notify_when_done(&self.queue, addr.tag(PROBE_FLAGS));

        mutable.state = State::AwaitingRequest;
        context::retain_event(&cell);
        (self.acceptor)(
            &self.service,
            &self.server_context,
            &self.request_slot,
            &self.stream_writer,
            &self.queue,
            &self.queue,
            addr.tag(TagFlags::NONE),
        );
    }

    fn on_event(&self, ok: bool, flags: TagFlags) {
        let mut mutable = self.mutable.lock();
        self.logger.debug(|| {
            format!(
                "{} got event, state - {}, ok - {}, flags - {:#04b}, queue - {}, alarms - {}",
                self.identity(),
                mutable.state.name(),
                ok,
                flags.bits(),
                mutable.notifications.len(),
                mutable.alarm_count
            )
        });

        if !ok {
            self.logger.warn(|| {
                format!(
                    "{} not ok, destructing, queue - {}, alarms - {}",
                    self.identity(),
                    mutable.notifications.len(),
                    mutable.alarm_count
                )
            });
            mutable.state = State::Finished;
            mutable.drop_notifications = true;
            let addr = mutable.addr.expect("installed");
            drop(mutable);
            // The probe will never fire for a call that was never
            // accepted; give its count back.
            if self.server_context.clear_done() {
                unsafe { context::release_event(addr) };
            }
            return;
        }

        if self.server_context.is_cancelled()
            && !matches!(mutable.state, State::Cancelled | State::Finished)
        {
            self.logger.debug(|| format!("{} cancelled by remote", self.identity()));
            metrics::STREAMS_CANCELLED.increment();
            mutable.state = State::Cancelled;
            mutable.drop_notifications = true;
        }

        match mutable.state {
            State::AwaitingRequest => self.on_request(mutable),
            State::AwaitingAlarm => self.on_alarm(mutable),
            State::AwaitingWrite => self.on_write(mutable),
            State::AwaitingFinish => self.on_finished(mutable, flags),
            State::Cancelled => self.on_cancelled(mutable),
            State::StandingBy | State::AwaitingNotifications | State::Finished => {
                unreachable!("illegal state {} for a queue event", mutable.state.name())
            }
        }
    }

    fn on_request(&self, mut mutable: MutexGuard<'_, Mutable<Notif>>) {
        self.logger.debug(|| format!("{} notifying userspace", self.identity()));

        // Replacement discipline, as for unary methods.
        ServerStreamMethodContext::spawn(
            self.descriptor.clone(),
            self.logger.callback(),
            self.service.clone(),
            self.queue.clone(),
            self.callback.clone(),
            self.acceptor,
        );

        mutable.state = State::AwaitingNotifications;
        let request = self.request_slot.take().expect("request filled at acceptance");
        let _ = self.request.set(request);
        drop(mutable);

        metrics::CALLS_ACCEPTED.increment();
        (self.callback)(ServerStreamMethod::new(self.self_weak.clone()));
    }

    fn on_alarm(&self, mut mutable: MutexGuard<'_, Mutable<Notif>>) {
        assert!(!mutable.notifications.is_empty(), "alarm without a pending notification");
        assert!(mutable.alarm_count >= 1, "alarm event without an armed alarm");

        mutable.alarm_count -= 1;
        self.process_pending(mutable);
    }

    fn on_write(&self, mutable: MutexGuard<'_, Mutable<Notif>>) {
        let mut mutable = mutable;
        if mutable.notifications.is_empty() {
            self.logger.debug(|| format!("{} awaiting notification", self.identity()));
            mutable.state = State::AwaitingNotifications;
            return;
        }
        self.process_pending(mutable);
    }

    fn on_cancelled(&self, mut mutable: MutexGuard<'_, Mutable<Notif>>) {
        if mutable.alarm_count <= 1 {
            self.logger.debug(|| format!("{} destroying on cancel", self.identity()));
            mutable.alarm_count = 0;
            mutable.notifications.clear();
            return;
        }

        // Pending alarms raced the cancellation; drain them one by one.
        mutable.alarm_count -= 1;
        mutable.notifications.clear();
        self.logger.debug(|| {
            format!(
                "{} draining pending alarm on cancel, alarms - {}",
                self.identity(),
                mutable.alarm_count
            )
        });
    }

    fn on_finished(&self, mut mutable: MutexGuard<'_, Mutable<Notif>>, flags: TagFlags) {
        if flags == PROBE_FLAGS {
            self.logger.debug(|| {
                format!(
                    "{} got done probe, queue - {}, alarms - {}",
                    self.identity(),
                    mutable.notifications.len(),
                    mutable.alarm_count
                )
            });
            return;
        }

        self.logger.debug(|| {
            format!(
                "{} finished, destructing, queue - {}, alarms - {}",
                self.identity(),
                mutable.notifications.len(),
                mutable.alarm_count
            )
        });
        mutable.state = State::Finished;
    }

    fn process_pending(&self, mut mutable: MutexGuard<'_, Mutable<Notif>>) {
        let notification =
            mutable.notifications.pop_front().expect("pending notification present");
        let addr = mutable.addr.expect("installed");
        let cell = mutable.cell.clone().expect("installed");

        match notification {
            Ok(notification) => {
                self.logger.debug(|| {
                    format!(
                        "{} writing, queue - {}, alarms - {}",
                        self.identity(),
                        mutable.notifications.len(),
                        mutable.alarm_count
                    )
                });
                mutable.state = State::AwaitingWrite;
                drop(mutable);
                context::retain_event(&cell);
                self.stream_writer.write(notification, addr.tag(TagFlags::NONE));
                metrics::NOTIFICATIONS_WRITTEN.increment();
            }
            Err(status) => {
                self.logger.debug(|| {
                    format!(
                        "{} finishing, queue - {}, alarms - {}",
                        self.identity(),
                        mutable.notifications.len(),
                        mutable.alarm_count
                    )
                });
                mutable.state = State::AwaitingFinish;
                drop(mutable);
                context::retain_event(&cell);
                // Fires the done probe before posting this completion.
                self.stream_writer.finish(status, addr.tag(TagFlags::NONE));
            }
        }
    }

    /// Userspace pushes a notification or a terminal status.
    pub(crate) fn post(&self, notification: Result<Notif, Status>) {
        let mut mutable = self.mutable.lock();
        self.logger.debug(|| {
            format!("{} userspace posts, state - {}", self.identity(), mutable.state.name())
        });

        if mutable.drop_notifications {
            self.logger.debug(|| format!("{} dropped", self.identity()));
            return;
        }

        if notification.is_err() {
            mutable.drop_notifications = true;
            self.logger.debug(|| format!("{} closed by userspace", self.identity()));
        }

        match mutable.state {
            State::StandingBy | State::AwaitingRequest | State::AwaitingFinish => {
                unreachable!("post in state {} before the stream was delivered", mutable.state.name())
            }

            State::AwaitingAlarm | State::AwaitingWrite => {
                self.logger
                    .debug(|| format!("{} is processing notifications, pushing", self.identity()));
                mutable.notifications.push_back(notification);
            }

            State::AwaitingNotifications => {
                self.logger.debug(|| {
                    format!("{} is waiting for notifications, alarming + pushing", self.identity())
                });
                mutable.state = State::AwaitingAlarm;
                mutable.alarm_count += 1;
                mutable.notifications.push_back(notification);
                let addr = mutable.addr.expect("installed");
                let cell = mutable.cell.clone().expect("installed");
                context::retain_event(&cell);
                self.alarm.set(&self.queue, addr.tag(TagFlags::NONE));
            }

            State::Cancelled | State::Finished => {
                self.logger
                    .debug(|| format!("{} notification attempt after cancellation", self.identity()));
            }
        }
    }
}

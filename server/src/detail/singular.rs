//! Finite state machine of a unary server method.
//!
//! One context accepts exactly one inbound RPC. On acceptance it spawns
//! a fresh clone so the next inbound RPC always finds a waiting handler,
//! then hands itself to user code; the user's response re-enters the
//! queue thread through a zero-delay alarm and is written back on the
//! wire there.

use std::sync::Arc;

use grapnel_core::tag::{ContextAddr, TagFlags};
use grapnel_core::{Alarm, CompletionQueue, Logger, LoggerCallback, MethodDescriptor};
use grapnel_wire::{Message, RequestSlot, ResponseWriter, ServerContext, Status};
use parking_lot::Mutex;

use super::context::{self, MethodContext, WeakCell};
use crate::metrics;
use crate::singular::{SingularAcceptorFn, SingularMethod, SingularMethodCallback};

fn singular_method_category() -> &'static str {
    "SingularMethodContext"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Initial state, nothing happens.
    StandingBy,
    /// Waiting for the next inbound request; tagged `0b01`.
    AwaitingRequest,
    /// Request handed to user code, waiting for it to respond.
    AwaitingResponse,
    /// User responded; waiting to re-enter a queue thread; tagged `0b10`.
    AwaitingAlarm,
    /// Response being written; destroyed when done; tagged `0b11`.
    AwaitingFinish,
    /// Terminal; absorbs nothing further.
    Finished,
}

impl State {
    fn flags(self) -> TagFlags {
        match self {
            State::AwaitingRequest => TagFlags::new(0b01),
            State::AwaitingAlarm => TagFlags::new(0b10),
            State::AwaitingFinish => TagFlags::new(0b11),
            // Internal states never appear as queue tags.
            State::StandingBy | State::AwaitingResponse | State::Finished => TagFlags::NONE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            State::StandingBy => "StandingBy",
            State::AwaitingRequest => "AwaitingRequest",
            State::AwaitingResponse => "AwaitingResponse",
            State::AwaitingAlarm => "AwaitingAlarm",
            State::AwaitingFinish => "AwaitingFinish",
            State::Finished => "Finished",
        }
    }
}

struct Mutable<Req, Resp> {
    state: State,
    request: Option<Req>,
    response: Option<Result<Resp, Status>>,
}

pub(crate) struct SingularMethodContext<S, Req: Message, Resp: Message> {
    descriptor: Arc<MethodDescriptor>,
    logger: Logger,
    service: Arc<S>,
    queue: Arc<CompletionQueue>,
    callback: SingularMethodCallback<S, Req, Resp>,
    acceptor: SingularAcceptorFn<S, Req, Resp>,

    server_context: ServerContext,
    request_slot: RequestSlot<Req>,
    response_writer: ResponseWriter<Resp>,
    alarm: Alarm,

    addr: Option<ContextAddr>,
    cell: Option<WeakCell>,
    mutable: Mutex<Mutable<Req, Resp>>,
}

impl<S, Req: Message, Resp: Message> SingularMethodContext<S, Req, Resp> {
    fn identity(&self) -> String {
        format!("{}[{:p}]", self.descriptor.full_name, self)
    }
}

impl<S, Req, Resp> SingularMethodContext<S, Req, Resp>
where
    S: Send + Sync + 'static,
    Req: Message,
    Resp: Message,
{
    /// Construct, install, and start a fresh context.
    pub(crate) fn spawn(
        descriptor: Arc<MethodDescriptor>,
        logger_callback: LoggerCallback,
        service: Arc<S>,
        queue: Arc<CompletionQueue>,
        callback: SingularMethodCallback<S, Req, Resp>,
        acceptor: SingularAcceptorFn<S, Req, Resp>,
    ) {
        let context = SingularMethodContext {
            descriptor,
            logger: Logger::new(singular_method_category, logger_callback),
            service,
            queue,
            callback,
            acceptor,
            server_context: ServerContext::new(),
            request_slot: RequestSlot::new(),
            response_writer: ResponseWriter::new(),
            alarm: Alarm::new(),
            addr: None,
            cell: None,
            mutable: Mutex::new(Mutable {
                state: State::StandingBy,
                request: None,
                response: None,
            }),
        };
        context.logger.debug(|| format!("{} constructed", context.identity()));
        metrics::CONTEXTS_ACTIVE.increment();
        context::spawn(Box::new(context));
    }

    fn tag(&self, flags: TagFlags) -> usize {
        self.addr.expect("context installed before use").tag(flags)
    }

    fn cell(&self) -> &WeakCell {
        self.cell.as_ref().expect("context installed before use")
    }

    /// Obtain the remote address.
    pub(crate) fn peer(&self) -> String {
        self.server_context.peer()
    }

    /// Borrow the accepted request.
    pub(crate) fn request(&self) -> impl std::ops::Deref<Target = Req> + '_ {
        parking_lot::MutexGuard::map(self.mutable.lock(), |m| {
            m.request.as_mut().expect("request available while userspace holds the method")
        })
    }

    /// Move the accepted request out.
    pub(crate) fn take_request(&self) -> Req {
        self.mutable.lock().request.take().expect("request released once")
    }

    /// Userspace responds; re-enter the queue thread via the alarm.
    pub(crate) fn respond(&self, response: Result<Resp, Status>) {
        let mut mutable = self.mutable.lock();
        assert_eq!(mutable.state, State::AwaitingResponse, "respond outside response window");
        self.logger
            .debug(|| format!("{} userspace responds, state - {}", self.identity(), mutable.state.name()));

        mutable.state = State::AwaitingAlarm;
        mutable.response = Some(response);

        context::retain_event(self.cell());
        self.alarm.set(&self.queue, self.tag(State::AwaitingAlarm.flags()));
    }

    fn on_request(&self, flags: TagFlags) {
        assert_eq!(flags.bits(), State::AwaitingRequest.flags().bits(), "tag drifted from state");
        self.logger.debug(|| format!("{} notifying userspace", self.identity()));

        // Replacement discipline: the next inbound RPC needs a waiting
        // handler before user code ever sees this one.
        Self::spawn(
            self.descriptor.clone(),
            self.logger.callback(),
            self.service.clone(),
            self.queue.clone(),
            self.callback.clone(),
            self.acceptor,
        );

        let handle = {
            let mut mutable = self.mutable.lock();
            mutable.state = State::AwaitingResponse;
            mutable.request =
                Some(self.request_slot.take().expect("request filled at acceptance"));
            SingularMethod::new(
                self.cell().upgrade().expect("context cell live during dispatch"),
                self as *const Self,
            )
        };

        metrics::CALLS_ACCEPTED.increment();
        // The lock is released: the callback may use the handle freely.
        (self.callback)(handle);
    }

    fn on_alarm(&self, flags: TagFlags) {
        assert_eq!(flags.bits(), State::AwaitingAlarm.flags().bits(), "tag drifted from state");

        let mut mutable = self.mutable.lock();
        mutable.state = State::AwaitingFinish;
        let response = mutable.response.take().expect("response stored by respond");
        drop(mutable);

        context::retain_event(self.cell());
        match response {
            Ok(response) => {
                self.logger.debug(|| format!("{} writing", self.identity()));
                self.response_writer.finish(Ok(response), self.tag(State::AwaitingFinish.flags()));
            }
            Err(status) => {
                self.logger.debug(|| format!("{} finishing", self.identity()));
                self.response_writer.finish(Err(status), self.tag(State::AwaitingFinish.flags()));
            }
        }
        metrics::RESPONSES_SENT.increment();
    }

    fn on_finished(&self, flags: TagFlags) {
        assert_eq!(flags.bits(), State::AwaitingFinish.flags().bits(), "tag drifted from state");
        self.logger.debug(|| format!("{} finished, destructing", self.identity()));
        self.mutable.lock().state = State::Finished;
    }
}

impl<S, Req, Resp> MethodContext for SingularMethodContext<S, Req, Resp>
where
    S: Send + Sync + 'static,
    Req: Message,
    Resp: Message,
{
    fn install(&mut self, addr: ContextAddr, cell: WeakCell) {
        self.addr = Some(addr);
        self.cell = Some(cell);
    }

    fn run(&self) {
        let mut mutable = self.mutable.lock();
        assert_eq!(mutable.state, State::StandingBy, "run outside StandingBy");
        self.logger.debug(|| format!("{} running", self.identity()));

        mutable.state = State::AwaitingRequest;
        context::retain_event(self.cell());
        (self.acceptor)(
            &self.service,
            &self.server_context,
            &self.request_slot,
            &self.response_writer,
            &self.queue,
            &self.queue,
            self.tag(State::AwaitingRequest.flags()),
        );
    }

    fn on_event(&self, ok: bool, flags: TagFlags) {
        let state = self.mutable.lock().state;
        self.logger.debug(|| {
            format!(
                "{} got event, state - {}, ok - {}, flags - {:#04b}",
                self.identity(),
                state.name(),
                ok,
                flags.bits()
            )
        });

        if !ok {
            self.logger.warn(|| format!("{} not ok, destructing", self.identity()));
            self.mutable.lock().state = State::Finished;
            return;
        }

        match state {
            State::AwaitingRequest => self.on_request(flags),
            State::AwaitingAlarm => self.on_alarm(flags),
            State::AwaitingFinish => self.on_finished(flags),
            State::StandingBy | State::AwaitingResponse | State::Finished => {
                unreachable!("illegal state {} for a queue event", state.name())
            }
        }
    }
}

impl<S, Req: Message, Resp: Message> Drop for SingularMethodContext<S, Req, Resp> {
    fn drop(&mut self) {
        metrics::CONTEXTS_ACTIVE.decrement();
        self.logger.debug(|| format!("{} destructed", self.identity()));
    }
}

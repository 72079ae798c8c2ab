//! Runtime of a server-stream call with reconnect supervision.
//!
//! The context connects, reads notifications one at a time, and on any
//! failure finishes the call to learn the terminal status. Under the
//! `Relaunch` policy a non-cancelled terminal status hands a brand-new
//! context to the engine, which re-runs it after the reconnect
//! interval; the event callback moves into the new context, so the
//! terminal event of a relaunched stream is never delivered to user
//! code.

use std::sync::Arc;
use std::time::Duration;

use grapnel_core::CompletionQueue;
use grapnel_core::tag::{ContextAddr, TagFlags};
use grapnel_wire::{Channel, ClientContext, Code, Message, Status, StreamingReader};

use super::context::{Aliveness, CallContext, RawCall};
use crate::call::{ClientState, RelaunchPolicy, SessionId, StreamEvent, StreamEventCallback, StreamReaderFn};
use crate::engine::EngineRef;
use crate::metrics;

/// Tag flag distinguishing read completions from start/finish ones.
pub(crate) const READ_FLAGS: TagFlags = TagFlags::new(0b01);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Reading,
    Finishing,
}

pub(crate) struct ServerStreamCallContext<Req: Message, Notif: Message> {
    engine: EngineRef,
    channel: Channel,
    queue: Arc<CompletionQueue>,
    request: Option<Req>,
    session_id: SessionId,
    deadline: Duration,
    relaunch_policy: RelaunchPolicy,
    callback: Option<StreamEventCallback<Notif>>,
    reader_factory: StreamReaderFn<Req, Notif>,
    context: ClientContext,
    reader: StreamingReader<Notif>,
    state: State,
    addr: Option<ContextAddr>,
}

impl<Req: Message, Notif: Message> ServerStreamCallContext<Req, Notif> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: EngineRef,
        channel: Channel,
        queue: Arc<CompletionQueue>,
        request: Req,
        session_id: SessionId,
        deadline: Duration,
        relaunch_policy: RelaunchPolicy,
        callback: StreamEventCallback<Notif>,
        reader_factory: StreamReaderFn<Req, Notif>,
    ) -> Self {
        let context = ClientContext::new();
        context.set_deadline(deadline);
        let reader = reader_factory(&channel, &context, &request, &queue);

        ServerStreamCallContext {
            engine,
            channel,
            queue,
            request: Some(request),
            session_id,
            deadline,
            relaunch_policy,
            callback: Some(callback),
            reader_factory,
            context,
            reader,
            state: State::Connecting,
            addr: None,
        }
    }

    /// The context this call cancels through; the supervising entry
    /// keeps a copy.
    pub(crate) fn client_context(&self) -> ClientContext {
        self.context.clone()
    }

    fn tag(&self, flags: TagFlags) -> usize {
        self.addr.expect("context installed before use").tag(flags)
    }

    fn deliver(&mut self, event: StreamEvent<Notif>) {
        (self.callback.as_mut().expect("callback live while delivering"))(event);
    }

    fn on_error(&mut self, client_state: ClientState) -> Aliveness {
        self.state = State::Finishing;

        if client_state == ClientState::Running {
            self.reader.finish(self.tag(TagFlags::NONE));
            Aliveness::Alive
        } else {
            self.deliver(StreamEvent::Finished(Status::aborted("Client shutdown")));
            Aliveness::Dead
        }
    }

    fn on_connected(&mut self) -> Aliveness {
        self.state = State::Reading;
        self.reader.read(self.tag(READ_FLAGS));
        Aliveness::Alive
    }

    fn on_read(&mut self) -> Aliveness {
        let notification = self.reader.take_notification();
        self.deliver(StreamEvent::Notification(notification));
        self.reader.read(self.tag(READ_FLAGS));
        Aliveness::Alive
    }

    fn on_finished(&mut self, client_state: ClientState) -> Aliveness {
        let status = self.reader.take_status();

        let should_relaunch = client_state == ClientState::Running
            && self.relaunch_policy == RelaunchPolicy::Relaunch
            && status.code() != Code::Cancelled;

        if !should_relaunch {
            self.deliver(StreamEvent::Finished(status));
            self.engine.cleanup_stream(self.session_id.clone());
            return Aliveness::Dead;
        }

        // Fresh context, fresh client context and reader; the request,
        // session and callback move over.
        let replacement = Self::new(
            self.engine.clone(),
            self.channel.clone(),
            self.queue.clone(),
            self.request.take().expect("request present until relaunch"),
            self.session_id.clone(),
            self.deadline,
            self.relaunch_policy,
            self.callback.take().expect("callback present until relaunch"),
            self.reader_factory,
        );
        let supervising_context = replacement.client_context();
        let raw = RawCall::spawn(Box::new(replacement));

        metrics::STREAMS_RELAUNCHED.increment();
        self.engine.relaunch_stream(self.session_id.clone(), supervising_context, raw);
        Aliveness::Dead
    }
}

impl<Req: Message, Notif: Message> CallContext for ServerStreamCallContext<Req, Notif> {
    fn install(&mut self, addr: ContextAddr) {
        self.addr = Some(addr);
    }

    fn run(&mut self) {
        self.reader.start_call(self.tag(TagFlags::NONE));
    }

    fn on_event(&mut self, ok: bool, client_state: ClientState, flags: TagFlags) -> Aliveness {
        if !ok {
            return self.on_error(client_state);
        }

        match self.state {
            State::Connecting => self.on_connected(),
            State::Reading => {
                debug_assert_eq!(flags, READ_FLAGS, "read completion carries the read flag");
                self.on_read()
            }
            State::Finishing => self.on_finished(client_state),
        }
    }
}

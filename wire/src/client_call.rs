//! Client-side per-call objects: context and readers.
//!
//! Readers own their result slots; the call state machine takes the
//! values out after the completion event. Deadlines run on the channel's
//! timer thread and cancellation propagates through the shared cancel
//! token, so a pending read completes `ok=false` and `finish` observes
//! the terminal status no matter which side ended the call.
//!
//! Lock discipline: the per-call state mutex is never held across a
//! `Channel::call`, a timer operation, or a cancel-token call — sinks
//! and watchers take the same mutex from other threads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grapnel_core::{CompletionQueue, TimerHandle};
use parking_lot::Mutex;

use crate::channel::{CancelToken, Channel, ReplySink, StreamChunk};
use crate::frame;
use crate::message::Message;
use crate::status::{Code, Status};

// ── Client context ──────────────────────────────────────────────────────

struct ClientContextState {
    deadline: Option<Duration>,
}

/// Client-side RPC context: deadline and cancellation.
#[derive(Clone)]
pub struct ClientContext {
    state: Arc<Mutex<ClientContextState>>,
    cancel: CancelToken,
}

impl Default for ClientContext {
    fn default() -> Self {
        ClientContext {
            state: Arc::new(Mutex::new(ClientContextState { deadline: None })),
            cancel: CancelToken::new(),
        }
    }
}

impl ClientContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deadline(&self, deadline: Duration) {
        self.state.lock().deadline = Some(deadline);
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.state.lock().deadline
    }

    /// Best-effort cancellation of the call this context is attached to.
    pub fn try_cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

fn decode_body<M: Message>(framed: &Bytes, max_recv: Option<usize>) -> Result<M, Status> {
    let body = frame::decode_whole_message(framed)
        .map_err(|e| Status::internal(format!("malformed response frame: {e}")))?;
    if let Some(limit) = max_recv {
        if body.len() > limit {
            return Err(Status::resource_exhausted(format!(
                "received message of {} bytes exceeds limit of {} bytes",
                body.len(),
                limit
            )));
        }
    }
    M::decode(&body).map_err(|e| Status::internal(format!("malformed response: {e}")))
}

// ── Singular reader ─────────────────────────────────────────────────────

struct UnaryState<Resp> {
    request_frame: Option<Result<Bytes, Status>>,
    started: bool,
    completed: bool,
    outcome: Option<(Option<Resp>, Status)>,
    finish_tag: Option<usize>,
    deadline_timer: Option<TimerHandle>,
}

struct UnaryShared<Resp> {
    channel: Channel,
    context: ClientContext,
    method: String,
    queue: Arc<CompletionQueue>,
    state: Mutex<UnaryState<Resp>>,
}

impl<Resp: Message> UnaryShared<Resp> {
    /// Record the outcome once and wake the armed finish, if any.
    fn complete(&self, response: Option<Resp>, status: Status) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.completed = true;
        if let Some(timer) = state.deadline_timer.take() {
            timer.cancel();
        }
        state.outcome = Some((response, status));
        if let Some(tag) = state.finish_tag.take() {
            self.queue.post(tag, true);
        }
    }

    fn on_reply(&self, result: Result<Bytes, Status>) {
        match result {
            Ok(framed) => {
                match decode_body::<Resp>(&framed, self.channel.limits().max_recv_bytes) {
                    Ok(response) => self.complete(Some(response), Status::ok()),
                    Err(status) => self.complete(None, status),
                }
            }
            Err(status) => self.complete(None, status),
        }
    }
}

/// Async reader for a unary call: start, arm the finish, take the
/// result after the completion event.
pub struct SingularReader<Resp: Message> {
    shared: Arc<UnaryShared<Resp>>,
}

impl<Resp: Message> SingularReader<Resp> {
    pub fn new<Req: Message>(
        channel: &Channel,
        context: &ClientContext,
        method: &str,
        request: &Req,
        queue: &Arc<CompletionQueue>,
    ) -> Self {
        let body = request.encode_to_vec();
        let request_frame = match channel.limits().max_send_bytes {
            Some(limit) if body.len() > limit => Err(Status::resource_exhausted(format!(
                "request of {} bytes exceeds limit of {} bytes",
                body.len(),
                limit
            ))),
            _ => Ok(frame::encode_message(&body)),
        };

        SingularReader {
            shared: Arc::new(UnaryShared {
                channel: channel.clone(),
                context: context.clone(),
                method: method.to_string(),
                queue: queue.clone(),
                state: Mutex::new(UnaryState {
                    request_frame: Some(request_frame),
                    started: false,
                    completed: false,
                    outcome: None,
                    finish_tag: None,
                    deadline_timer: None,
                }),
            }),
        }
    }

    /// Issue the call. The outcome lands through the reply sink, the
    /// deadline timer, or cancellation — whichever happens first.
    pub fn start_call(&self) {
        let frame = {
            let mut state = self.shared.state.lock();
            if state.started {
                return;
            }
            state.started = true;
            state.request_frame.take()
        };

        let token = self.shared.context.cancel_token();
        let watcher = self.shared.clone();
        token.watch(Box::new(move || {
            watcher.complete(None, Status::cancelled("call cancelled"));
        }));

        if let Some(deadline) = self.shared.context.deadline() {
            let expired = self.shared.clone();
            let expired_token = token.clone();
            let handle = self.shared.channel.timer().schedule_in(
                deadline,
                Box::new(move || {
                    expired.complete(
                        None,
                        Status::deadline_exceeded("call deadline expired"),
                    );
                    expired_token.cancel();
                }),
            );
            let mut state = self.shared.state.lock();
            if state.completed {
                handle.cancel();
            } else {
                state.deadline_timer = Some(handle);
            }
        }

        match frame.expect("request frame present until the call starts") {
            Err(status) => self.shared.complete(None, status),
            Ok(frame) => {
                let sink = self.shared.clone();
                let reply = ReplySink::Unary(Box::new(move |result| sink.on_reply(result)));
                if let Err(e) =
                    self.shared.channel.call(&self.shared.method, frame, reply, token)
                {
                    self.shared.complete(None, Status::unavailable(e.to_string()));
                }
            }
        }
    }

    /// Arm the finish: `(tag, ok=true)` posts once the outcome is in.
    pub fn finish(&self, tag: usize) {
        let mut state = self.shared.state.lock();
        if state.outcome.is_some() {
            self.shared.queue.post(tag, true);
        } else {
            state.finish_tag = Some(tag);
        }
    }

    /// Take the outcome after the finish completion event.
    pub fn take_result(&self) -> (Option<Resp>, Status) {
        self.shared
            .state
            .lock()
            .outcome
            .take()
            .expect("finish completion precedes take_result")
    }
}

// ── Streaming reader ────────────────────────────────────────────────────

struct StreamState<Notif> {
    request_frame: Option<Result<Bytes, Status>>,
    started: bool,
    inbox: VecDeque<Bytes>,
    trailer: Option<Status>,
    current: Option<Notif>,
    pending_read: Option<usize>,
    pending_finish: Option<usize>,
    status_out: Option<Status>,
    deadline_timer: Option<TimerHandle>,
}

struct StreamShared<Notif> {
    channel: Channel,
    context: ClientContext,
    method: String,
    queue: Arc<CompletionQueue>,
    state: Mutex<StreamState<Notif>>,
}

impl<Notif: Message> StreamShared<Notif> {
    /// Latch the terminal status: fail the pending read, satisfy the
    /// armed finish. Idempotent; the first status wins.
    fn finish_with(&self, status: Status) {
        let mut state = self.state.lock();
        if state.trailer.is_some() {
            return;
        }
        if let Some(timer) = state.deadline_timer.take() {
            timer.cancel();
        }
        state.trailer = Some(status.clone());
        if let Some(tag) = state.pending_read.take() {
            self.queue.post(tag, false);
        }
        if let Some(tag) = state.pending_finish.take() {
            state.status_out = Some(status);
            self.queue.post(tag, true);
        }
    }

    fn on_chunk(&self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Trailer(status) => self.finish_with(status),
            StreamChunk::Item(framed) => {
                let failure = {
                    let mut state = self.state.lock();
                    if state.trailer.is_some() {
                        return;
                    }
                    match state.pending_read.take() {
                        None => {
                            state.inbox.push_back(framed);
                            None
                        }
                        Some(tag) => {
                            match decode_body::<Notif>(
                                &framed,
                                self.channel.limits().max_recv_bytes,
                            ) {
                                Ok(notification) => {
                                    state.current = Some(notification);
                                    self.queue.post(tag, true);
                                    None
                                }
                                Err(status) => {
                                    // Re-arm so the trailer latch fails this read.
                                    state.pending_read = Some(tag);
                                    Some(status)
                                }
                            }
                        }
                    }
                };
                if let Some(status) = failure {
                    self.finish_with(status);
                    self.context.try_cancel();
                }
            }
        }
    }
}

/// Async reader for a server stream: start, read one notification at a
/// time, then finish for the terminal status.
pub struct StreamingReader<Notif: Message> {
    shared: Arc<StreamShared<Notif>>,
}

impl<Notif: Message> StreamingReader<Notif> {
    pub fn new<Req: Message>(
        channel: &Channel,
        context: &ClientContext,
        method: &str,
        request: &Req,
        queue: &Arc<CompletionQueue>,
    ) -> Self {
        let body = request.encode_to_vec();
        let request_frame = match channel.limits().max_send_bytes {
            Some(limit) if body.len() > limit => Err(Status::resource_exhausted(format!(
                "request of {} bytes exceeds limit of {} bytes",
                body.len(),
                limit
            ))),
            _ => Ok(frame::encode_message(&body)),
        };

        StreamingReader {
            shared: Arc::new(StreamShared {
                channel: channel.clone(),
                context: context.clone(),
                method: method.to_string(),
                queue: queue.clone(),
                state: Mutex::new(StreamState {
                    request_frame: Some(request_frame),
                    started: false,
                    inbox: VecDeque::new(),
                    trailer: None,
                    current: None,
                    pending_read: None,
                    pending_finish: None,
                    status_out: None,
                    deadline_timer: None,
                }),
            }),
        }
    }

    /// Issue the call; `(tag, ok=true)` posts once the call is under
    /// way. Connection failure surfaces on the first read, as with a
    /// fail-fast channel.
    pub fn start_call(&self, tag: usize) {
        let frame = {
            let mut state = self.shared.state.lock();
            if state.started {
                return;
            }
            state.started = true;
            state.request_frame.take()
        };

        let token = self.shared.context.cancel_token();
        let watcher = self.shared.clone();
        token.watch(Box::new(move || {
            watcher.finish_with(Status::cancelled("call cancelled"));
        }));

        if let Some(deadline) = self.shared.context.deadline() {
            let expired = self.shared.clone();
            let expired_token = token.clone();
            let handle = self.shared.channel.timer().schedule_in(
                deadline,
                Box::new(move || {
                    expired.finish_with(Status::deadline_exceeded("stream deadline expired"));
                    expired_token.cancel();
                }),
            );
            let mut state = self.shared.state.lock();
            if state.trailer.is_some() {
                handle.cancel();
            } else {
                state.deadline_timer = Some(handle);
            }
        }

        match frame.expect("request frame present until the call starts") {
            Err(status) => self.shared.finish_with(status),
            Ok(frame) => {
                let armed = !token.is_cancelled();
                if armed {
                    let sink = self.shared.clone();
                    let reply =
                        ReplySink::Stream(Arc::new(move |chunk| sink.on_chunk(chunk)));
                    if let Err(e) =
                        self.shared.channel.call(&self.shared.method, frame, reply, token)
                    {
                        self.shared.finish_with(Status::unavailable(e.to_string()));
                    }
                }
            }
        }

        self.shared.queue.post(tag, true);
    }

    /// Arm one read: `(tag, ok=true)` with a notification buffered, or
    /// `(tag, ok=false)` once the stream is over.
    pub fn read(&self, tag: usize) {
        let failure = {
            let mut state = self.shared.state.lock();
            match state.inbox.pop_front() {
                Some(framed) => {
                    match decode_body::<Notif>(&framed, self.shared.channel.limits().max_recv_bytes)
                    {
                        Ok(notification) => {
                            state.current = Some(notification);
                            self.shared.queue.post(tag, true);
                            None
                        }
                        Err(status) if state.trailer.is_none() => {
                            // Fail this read once the trailer is latched below.
                            state.pending_read = Some(tag);
                            Some(status)
                        }
                        Err(_) => {
                            // Already over; the finish carries the status.
                            self.shared.queue.post(tag, false);
                            None
                        }
                    }
                }
                None => {
                    if state.trailer.is_some() {
                        self.shared.queue.post(tag, false);
                    } else {
                        state.pending_read = Some(tag);
                    }
                    None
                }
            }
        };
        if let Some(status) = failure {
            self.shared.finish_with(status);
            self.shared.context.try_cancel();
        }
    }

    /// Take the notification buffered by the last successful read.
    pub fn take_notification(&self) -> Notif {
        self.shared
            .state
            .lock()
            .current
            .take()
            .expect("read completion precedes take_notification")
    }

    /// Arm the finish: `(tag, ok=true)` posts once the terminal status
    /// is in.
    pub fn finish(&self, tag: usize) {
        let mut state = self.shared.state.lock();
        match state.trailer.clone() {
            Some(status) => {
                state.status_out = Some(status);
                self.shared.queue.post(tag, true);
            }
            None => state.pending_finish = Some(tag),
        }
    }

    /// Take the terminal status after the finish completion event.
    pub fn take_status(&self) -> Status {
        self.shared
            .state
            .lock()
            .status_out
            .take()
            .expect("finish completion precedes take_status")
    }

    /// Whether the terminal status is already `CANCELLED`; used by
    /// tests and diagnostics.
    pub fn is_cancelled(&self) -> bool {
        self.shared
            .state
            .lock()
            .trailer
            .as_ref()
            .map(|s| s.code() == Code::Cancelled)
            .unwrap_or(false)
    }
}

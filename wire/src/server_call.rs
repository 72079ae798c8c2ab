//! Server-side per-call objects: context, request slot, and writers.
//!
//! These are the objects a method state machine owns and an acceptor
//! binds when a real inbound RPC is paired with it. The done probe
//! (`async_notify_when_done`) fires exactly once — on peer cancellation
//! or on terminal finish — and is always posted before the finish
//! completion, which the stream FSM relies on when it ignores the probe
//! in its finishing state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use grapnel_core::CompletionQueue;
use parking_lot::Mutex;

use crate::channel::{CancelToken, ReplySink, StreamChunk};
use crate::frame;
use crate::message::Message;
use crate::status::Status;

// ── Server context ──────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct ServerContextShared {
    peer: Mutex<Option<String>>,
    cancelled: AtomicBool,
    done: Mutex<Option<(Arc<CompletionQueue>, usize)>>,
    done_fired: AtomicBool,
}

impl ServerContextShared {
    /// Fire the done probe if one is registered and it has not fired.
    pub(crate) fn fire_done(&self) {
        if self.done_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some((queue, tag)) = self.done.lock().clone() {
            queue.post(tag, true);
        }
    }

    pub(crate) fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Server-side RPC context: peer identity, cancellation observation.
#[derive(Clone, Default)]
pub struct ServerContext {
    shared: Arc<ServerContextShared>,
}

impl ServerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote peer identity; empty until the call is accepted.
    pub fn peer(&self) -> String {
        self.shared.peer.lock().clone().unwrap_or_default()
    }

    /// Whether the peer has cancelled the call.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Register a completion-queue probe delivered when the call is
    /// done (cancelled by the peer, or finished). Register before the
    /// call is accepted.
    pub fn async_notify_when_done(&self, queue: &Arc<CompletionQueue>, tag: usize) {
        *self.shared.done.lock() = Some((queue.clone(), tag));
    }

    /// Deregister the done probe. Returns whether an unfired
    /// registration was removed — if so, its event will never post and
    /// the owner must release whatever it pinned for it.
    pub fn clear_done(&self) -> bool {
        if self.shared.done_fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.done.lock().take().is_some()
    }

    pub(crate) fn bind(&self, peer: String, cancel: &CancelToken) {
        *self.shared.peer.lock() = Some(peer);
        let shared = self.shared.clone();
        cancel.watch(Box::new(move || {
            shared.set_cancelled();
            shared.fire_done();
        }));
    }

    pub(crate) fn shared(&self) -> Arc<ServerContextShared> {
        self.shared.clone()
    }
}

// ── Request slot ────────────────────────────────────────────────────────

/// Holds the decoded inbound request between acceptance and the state
/// machine picking it up on the queue thread.
pub struct RequestSlot<Req> {
    inner: Arc<Mutex<Option<Req>>>,
}

impl<Req> Clone for RequestSlot<Req> {
    fn clone(&self) -> Self {
        RequestSlot { inner: self.inner.clone() }
    }
}

impl<Req> Default for RequestSlot<Req> {
    fn default() -> Self {
        RequestSlot { inner: Arc::new(Mutex::new(None)) }
    }
}

impl<Req> RequestSlot<Req> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fill(&self, request: Req) {
        *self.inner.lock() = Some(request);
    }

    /// Take the request out; present exactly once after acceptance.
    pub fn take(&self) -> Option<Req> {
        self.inner.lock().take()
    }
}

// ── Unary response writer ───────────────────────────────────────────────

struct UnaryRoute {
    sink: Box<dyn FnOnce(Result<bytes::Bytes, Status>) + Send>,
    queue: Arc<CompletionQueue>,
}

/// Writes the single response of a unary call.
pub struct ResponseWriter<Resp> {
    route: Arc<Mutex<Option<UnaryRoute>>>,
    _marker: std::marker::PhantomData<fn(Resp)>,
}

impl<Resp> Clone for ResponseWriter<Resp> {
    fn clone(&self) -> Self {
        ResponseWriter { route: self.route.clone(), _marker: std::marker::PhantomData }
    }
}

impl<Resp> Default for ResponseWriter<Resp> {
    fn default() -> Self {
        ResponseWriter { route: Arc::new(Mutex::new(None)), _marker: std::marker::PhantomData }
    }
}

impl<Resp: Message> ResponseWriter<Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(
        &self,
        sink: Box<dyn FnOnce(Result<bytes::Bytes, Status>) + Send>,
        queue: Arc<CompletionQueue>,
    ) {
        *self.route.lock() = Some(UnaryRoute { sink, queue });
    }

    /// Deliver the unary outcome and post the completion for `tag`.
    pub fn finish(&self, outcome: Result<Resp, Status>, tag: usize) {
        let route = self.route.lock().take().expect("response writer finished twice");
        let framed = outcome.map(|resp| frame::encode_message(&resp.encode_to_vec()));
        (route.sink)(framed);
        route.queue.post(tag, true);
    }
}

// ── Stream writer ───────────────────────────────────────────────────────

struct StreamRoute {
    sink: Arc<dyn Fn(StreamChunk) + Send + Sync>,
    queue: Arc<CompletionQueue>,
    context: Arc<ServerContextShared>,
    cancel: CancelToken,
}

/// Writes the notifications and terminal status of a server stream.
///
/// Writes after peer cancellation are dropped on the floor but still
/// complete `ok=true`, so the stream FSM observes the cancelled flag on
/// the completion and drains through its cancelled path instead of
/// seeing a failure event with alarms still outstanding.
pub struct StreamWriter<Notif> {
    route: Arc<Mutex<Option<StreamRoute>>>,
    _marker: std::marker::PhantomData<fn(Notif)>,
}

impl<Notif> Clone for StreamWriter<Notif> {
    fn clone(&self) -> Self {
        StreamWriter { route: self.route.clone(), _marker: std::marker::PhantomData }
    }
}

impl<Notif> Default for StreamWriter<Notif> {
    fn default() -> Self {
        StreamWriter { route: Arc::new(Mutex::new(None)), _marker: std::marker::PhantomData }
    }
}

impl<Notif: Message> StreamWriter<Notif> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(
        &self,
        sink: Arc<dyn Fn(StreamChunk) + Send + Sync>,
        queue: Arc<CompletionQueue>,
        context: Arc<ServerContextShared>,
        cancel: CancelToken,
    ) {
        *self.route.lock() = Some(StreamRoute { sink, queue, context, cancel });
    }

    /// Write one notification and post the completion for `tag`.
    pub fn write(&self, notification: Notif, tag: usize) {
        let route = self.route.lock();
        let route = route.as_ref().expect("stream writer used before acceptance");
        if !route.cancel.is_cancelled() {
            let framed = frame::encode_message(&notification.encode_to_vec());
            (route.sink)(StreamChunk::Item(framed));
        }
        route.queue.post(tag, true);
    }

    /// Finish the stream with `status` and post the completion for
    /// `tag`. The done probe fires before the completion is posted.
    pub fn finish(&self, status: Status, tag: usize) {
        let route = self.route.lock().take().expect("stream writer finished twice");
        if !route.cancel.is_cancelled() {
            (route.sink)(StreamChunk::Trailer(status));
        }
        route.context.fire_done();
        route.queue.post(tag, true);
    }
}

/// Deliver an error outcome to a call that never reached a handler.
pub(crate) fn reply_error(reply: ReplySink, status: Status) {
    match reply {
        ReplySink::Unary(sink) => sink(Err(status)),
        ReplySink::Stream(sink) => sink(StreamChunk::Trailer(status)),
    }
}

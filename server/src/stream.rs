//! Inbound server-stream handling object passed to userspace.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use grapnel_core::CompletionQueue;
use grapnel_wire::{Message, RequestSlot, ServerContext, Status, StreamWriter};

use crate::detail::stream::StreamInner;

/// Acceptor supplied by generated code for a server-stream method; see
/// [`crate::SingularAcceptorFn`] for the role it plays.
pub type ServerStreamAcceptorFn<S, Req, Notif> = fn(
    &S,
    &ServerContext,
    &RequestSlot<Req>,
    &StreamWriter<Notif>,
    &Arc<CompletionQueue>,
    &Arc<CompletionQueue>,
    usize,
);

/// Userspace callback notified of each accepted stream.
pub type ServerStreamMethodCallback<S, Req, Notif> =
    Arc<dyn Fn(ServerStreamMethod<S, Req, Notif>) + Send + Sync>;

/// Observable state of a stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Running,
    Finished,
}

/// One accepted server stream.
///
/// Userspace may hold this handle for as long as it likes and push any
/// number of notifications followed by one close; the handle holds only
/// a weak link, so the stream terminates on its own schedule (peer
/// cancellation included) and every operation degrades to a no-op once
/// it has. The stream machinery never blocks on userspace.
pub struct ServerStreamMethod<S, Req: Message, Notif: Message> {
    inner: Weak<StreamInner<S, Req, Notif>>,
}

impl<S, Req: Message, Notif: Message> Clone for ServerStreamMethod<S, Req, Notif> {
    fn clone(&self) -> Self {
        ServerStreamMethod { inner: self.inner.clone() }
    }
}

/// Borrow of the stream's inbound request; keeps the stream
/// implementation alive while held.
pub struct RequestGuard<S, Req: Message, Notif: Message> {
    inner: Arc<StreamInner<S, Req, Notif>>,
}

impl<S, Req, Notif> Deref for RequestGuard<S, Req, Notif>
where
    S: Send + Sync + 'static,
    Req: Message,
    Notif: Message,
{
    type Target = Req;

    fn deref(&self) -> &Req {
        self.inner.request().expect("request set at acceptance")
    }
}

impl<S, Req, Notif> ServerStreamMethod<S, Req, Notif>
where
    S: Send + Sync + 'static,
    Req: Message,
    Notif: Message,
{
    pub(crate) fn new(inner: Weak<StreamInner<S, Req, Notif>>) -> Self {
        ServerStreamMethod { inner }
    }

    /// Current state; a stream may be finished by the remote or by
    /// userspace at any time.
    pub fn state(&self) -> StreamState {
        if self.inner.strong_count() > 0 { StreamState::Running } else { StreamState::Finished }
    }

    /// Obtain the remote address, if the stream is still running.
    pub fn peer(&self) -> Option<String> {
        self.inner.upgrade().map(|inner| inner.peer())
    }

    /// Borrow the stream-initiating request, if still running.
    pub fn request(&self) -> Option<RequestGuard<S, Req, Notif>> {
        self.inner.upgrade().map(|inner| RequestGuard { inner })
    }

    /// Send one notification to the remote; dropped if finished.
    pub fn push(&self, notification: Notif) -> StreamState {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.post(Ok(notification));
                StreamState::Running
            }
            None => StreamState::Finished,
        }
    }

    /// Close the stream with a terminal status; dropped if finished.
    pub fn close(&self, status: Status) -> StreamState {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.post(Err(status));
                StreamState::Running
            }
            None => StreamState::Finished,
        }
    }
}

//! Inbound unary request handling object passed to userspace.

use std::sync::Arc;

use grapnel_core::CompletionQueue;
use grapnel_wire::{Message, RequestSlot, ResponseWriter, ServerContext, Status};

use crate::detail::context::ContextCell;
use crate::detail::singular::SingularMethodContext;

/// Acceptor supplied by generated code: binds a method to the async
/// service's "accept the next inbound RPC" entry point without the
/// engine ever naming the generated skeleton type.
pub type SingularAcceptorFn<S, Req, Resp> = fn(
    &S,
    &ServerContext,
    &RequestSlot<Req>,
    &ResponseWriter<Resp>,
    &Arc<CompletionQueue>,
    &Arc<CompletionQueue>,
    usize,
);

/// Userspace callback notified of each accepted unary call.
pub type SingularMethodCallback<S, Req, Resp> =
    Arc<dyn Fn(SingularMethod<S, Req, Resp>) + Send + Sync>;

/// One accepted unary call, owned by userspace until it responds.
///
/// `respond` consumes the handle, so responding twice is a compile
/// error rather than a runtime trap. Dropping the handle without
/// responding releases the context but leaks the in-flight RPC slot:
/// the remote peer observes nothing until its deadline expires.
pub struct SingularMethod<S, Req: Message, Resp: Message> {
    /// Keeps the context alive for the response window.
    _cell: ContextCell,
    context: *const SingularMethodContext<S, Req, Resp>,
}

// The handle moves freely between user threads; the context behind the
// raw pointer is internally synchronized and kept alive by `cell`.
unsafe impl<S: Send + Sync, Req: Message, Resp: Message> Send for SingularMethod<S, Req, Resp> {}

impl<S, Req, Resp> SingularMethod<S, Req, Resp>
where
    S: Send + Sync + 'static,
    Req: Message,
    Resp: Message,
{
    pub(crate) fn new(
        cell: ContextCell,
        context: *const SingularMethodContext<S, Req, Resp>,
    ) -> Self {
        SingularMethod { _cell: cell, context }
    }

    fn context(&self) -> &SingularMethodContext<S, Req, Resp> {
        unsafe { &*self.context }
    }

    /// Obtain the remote address.
    pub fn peer(&self) -> String {
        self.context().peer()
    }

    /// Borrow the inbound request.
    pub fn request(&self) -> impl std::ops::Deref<Target = Req> + '_ {
        self.context().request()
    }

    /// Move the inbound request out; callable once.
    pub fn take_request(&mut self) -> Req {
        self.context().take_request()
    }

    /// Send the response, positive or negative, to the remote.
    pub fn respond(self, response: Result<Resp, Status>) {
        // Ownership of the context transfers back to the completion
        // queue through the alarm armed here.
        self.context().respond(response);
    }
}

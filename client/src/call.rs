//! Call descriptors handed to the client engine.
//!
//! These are parameter bags: the engine consumes them on its strand
//! and turns them into call contexts. Reader factories are plain
//! function values, the role the generated stub plays — see the
//! [`singular_reader!`](crate::singular_reader) and
//! [`stream_reader!`](crate::stream_reader) macros.

use std::sync::Arc;
use std::time::Duration;

use grapnel_core::CompletionQueue;
use grapnel_wire::{Channel, ClientContext, Message, SingularReader, Status, StreamingReader};

/// Opaque user-supplied identifier of a server-stream subscription.
pub type SessionId = String;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Running,
    Standby,
}

/// Whether a broken server stream is relaunched automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaunchPolicy {
    Relaunch,
    Shutdown,
}

/// Outcome of a singular call: the request that was sent and either
/// the response or the terminal status.
#[derive(Debug)]
pub struct Summary<Req, Resp> {
    pub request: Req,
    pub result: Result<Resp, Status>,
}

pub type CompletionCallback<Req, Resp> = Box<dyn FnOnce(Summary<Req, Resp>) + Send>;

/// Factory producing the async reader of a unary call; supplied by
/// generated code.
pub type SingularReaderFn<Req, Resp> =
    fn(&Channel, &ClientContext, &Req, &Arc<CompletionQueue>) -> SingularReader<Resp>;

/// A unary RPC to execute.
pub struct SingularCall<Req: Message, Resp: Message> {
    pub request: Req,
    pub reader_factory: SingularReaderFn<Req, Resp>,
    pub callback: CompletionCallback<Req, Resp>,
    /// Overrides the engine default when set.
    pub deadline: Option<Duration>,
}

impl<Req: Message, Resp: Message> SingularCall<Req, Resp> {
    pub fn new(
        request: Req,
        reader_factory: SingularReaderFn<Req, Resp>,
        callback: impl FnOnce(Summary<Req, Resp>) + Send + 'static,
    ) -> Self {
        SingularCall { request, reader_factory, callback: Box::new(callback), deadline: None }
    }
}

/// One event of a server stream as observed by user code.
#[derive(Debug)]
pub enum StreamEvent<Notif> {
    Notification(Notif),
    /// Terminal; nothing follows until a relaunch.
    Finished(Status),
}

pub type StreamEventCallback<Notif> = Box<dyn FnMut(StreamEvent<Notif>) + Send>;

/// Factory producing the async reader of a server-stream call.
pub type StreamReaderFn<Req, Notif> =
    fn(&Channel, &ClientContext, &Req, &Arc<CompletionQueue>) -> StreamingReader<Notif>;

/// A server-stream RPC to launch.
///
/// The session id must be non-empty and unique within the engine, and
/// at most one stream per request message type may be active.
pub struct ServerStreamCall<Req: Message, Notif: Message> {
    pub session_id: SessionId,
    pub request: Req,
    pub reader_factory: StreamReaderFn<Req, Notif>,
    pub callback: StreamEventCallback<Notif>,
    /// Overrides the engine defaults when set.
    pub deadline: Option<Duration>,
    pub relaunch_interval: Option<Duration>,
    pub relaunch_policy: Option<RelaunchPolicy>,
}

impl<Req: Message, Notif: Message> ServerStreamCall<Req, Notif> {
    pub fn new(
        session_id: impl Into<SessionId>,
        request: Req,
        reader_factory: StreamReaderFn<Req, Notif>,
        callback: impl FnMut(StreamEvent<Notif>) + Send + 'static,
    ) -> Self {
        ServerStreamCall {
            session_id: session_id.into(),
            request,
            reader_factory,
            callback: Box::new(callback),
            deadline: None,
            relaunch_interval: None,
            relaunch_policy: None,
        }
    }
}

/// Generate a [`SingularReaderFn`] for a method addressed by fully
/// qualified name.
#[macro_export]
macro_rules! singular_reader {
    ($method:expr) => {
        |channel, context, request, queue| {
            $crate::SingularReader::new(channel, context, $method, request, queue)
        }
    };
}

/// Generate a [`StreamReaderFn`] for a method addressed by fully
/// qualified name.
#[macro_export]
macro_rules! stream_reader {
    ($method:expr) => {
        |channel, context, request, queue| {
            $crate::StreamingReader::new(channel, context, $method, request, queue)
        }
    };
}

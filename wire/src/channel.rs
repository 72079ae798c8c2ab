//! Client channel, address directory, and the inbound-call envelope.
//!
//! The directory is an explicit, instance-scoped address registry;
//! there is no process-global resolver. A channel resolves its target
//! per call, so a stream that reconnects finds a server that came up
//! after the channel was created.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use crossbeam_channel::Sender;
use grapnel_core::TimerThread;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

use crate::status::Status;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("address not found in directory: {0}")]
    Unresolved(String),
    #[error("address already bound: {0}")]
    AddressInUse(String),
    #[error("server is shut down")]
    ServerClosed,
}

// ── Call envelope ───────────────────────────────────────────────────────

/// One chunk of a server stream as seen by the client sink.
pub(crate) enum StreamChunk {
    /// A framed notification payload.
    Item(Bytes),
    /// Terminal status; nothing follows.
    Trailer(Status),
}

/// Where the server delivers the outcome of a call.
pub(crate) enum ReplySink {
    Unary(Box<dyn FnOnce(Result<Bytes, Status>) + Send>),
    Stream(Arc<dyn Fn(StreamChunk) + Send + Sync>),
}

/// A call in flight from a channel to a server dispatcher.
pub(crate) struct InboundCall {
    pub method: String,
    /// Framed request payload.
    pub payload: Bytes,
    pub peer: String,
    pub reply: ReplySink,
    pub cancel: CancelToken,
}

// ── Cancellation ────────────────────────────────────────────────────────

/// Shared cancellation state between a client context and the server
/// side of its call. Watchers registered after cancellation run
/// immediately; each watcher runs at most once.
#[derive(Clone)]
pub(crate) struct CancelToken {
    inner: Arc<CancelShared>,
}

struct CancelShared {
    cancelled: AtomicBool,
    watchers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(CancelShared {
                cancelled: AtomicBool::new(false),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let watchers = std::mem::take(&mut *self.inner.watchers.lock());
        for watcher in watchers {
            watcher();
        }
    }

    pub fn watch(&self, f: Box<dyn FnOnce() + Send>) {
        if self.is_cancelled() {
            f();
            return;
        }
        let mut watchers = self.inner.watchers.lock();
        // Re-check under the lock so a racing cancel cannot strand us.
        if self.inner.cancelled.load(Ordering::Acquire) {
            drop(watchers);
            f();
        } else {
            watchers.push(f);
        }
    }
}

// ── Directory ───────────────────────────────────────────────────────────

/// Handle a dispatcher hands out for inbound calls.
#[derive(Clone)]
pub(crate) struct ServerHandle {
    pub calls_tx: Sender<InboundCall>,
}

/// Instance-scoped address registry connecting channels to servers.
#[derive(Clone, Default)]
pub struct Directory {
    inner: Arc<RwLock<HashMap<String, ServerHandle>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&self, address: &str, handle: ServerHandle) -> Result<(), WireError> {
        let mut map = self.inner.write();
        if map.contains_key(address) {
            return Err(WireError::AddressInUse(address.to_string()));
        }
        map.insert(address.to_string(), handle);
        Ok(())
    }

    pub(crate) fn unbind(&self, address: &str) {
        self.inner.write().remove(address);
    }

    pub(crate) fn resolve(&self, address: &str) -> Option<ServerHandle> {
        self.inner.read().get(address).cloned()
    }
}

// ── Credentials ─────────────────────────────────────────────────────────

/// Channel credentials. TLS is a collaborator concern; only the
/// insecure variant exists here, but the type keeps the surface shaped
/// like the real one.
#[derive(Debug, Clone)]
pub struct ChannelCredentials(());

impl ChannelCredentials {
    pub fn insecure() -> Self {
        ChannelCredentials(())
    }
}

/// Server credentials, same story as [`ChannelCredentials`].
#[derive(Debug, Clone)]
pub struct ServerCredentials(());

impl ServerCredentials {
    pub fn insecure() -> Self {
        ServerCredentials(())
    }
}

// ── Channel ─────────────────────────────────────────────────────────────

/// Byte caps applied per channel; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelLimits {
    /// Cap on an outbound request payload.
    pub max_send_bytes: Option<usize>,
    /// Cap on an inbound response or notification payload.
    pub max_recv_bytes: Option<usize>,
}

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(0);

struct ChannelInner {
    directory: Directory,
    address: String,
    _credentials: ChannelCredentials,
    limits: ChannelLimits,
    timer: TimerThread,
    peer: String,
}

/// Clone-able client connection handle.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn connect(
        directory: &Directory,
        address: impl Into<String>,
        credentials: ChannelCredentials,
        limits: ChannelLimits,
        timer: TimerThread,
    ) -> Channel {
        let address = address.into();
        let peer = format!("inproc:client-{}", CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed));
        Channel {
            inner: Arc::new(ChannelInner {
                directory: directory.clone(),
                address,
                _credentials: credentials,
                limits,
                timer,
                peer,
            }),
        }
    }

    /// The address this channel targets.
    pub fn target(&self) -> &str {
        &self.inner.address
    }

    pub(crate) fn limits(&self) -> ChannelLimits {
        self.inner.limits
    }

    pub(crate) fn timer(&self) -> &TimerThread {
        &self.inner.timer
    }

    pub(crate) fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Hand a call to the target server's dispatcher.
    pub(crate) fn call(
        &self,
        method: &str,
        payload: Bytes,
        reply: ReplySink,
        cancel: CancelToken,
    ) -> Result<(), WireError> {
        let handle = self
            .inner
            .directory
            .resolve(&self.inner.address)
            .ok_or_else(|| WireError::Unresolved(self.inner.address.clone()))?;
        handle
            .calls_tx
            .send(InboundCall {
                method: method.to_string(),
                payload,
                peer: self.inner.peer.clone(),
                reply,
                cancel,
            })
            .map_err(|_| WireError::ServerClosed)
    }
}

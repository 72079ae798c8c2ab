//! Async service mailboxes, server builder, and the dispatcher.
//!
//! The generated asynchronous skeleton of a real gRPC stack is a
//! mailbox of "accept the next inbound RPC" operations. Here that role
//! is played by [`AsyncRpcService`]: acceptor functions park a typed
//! acceptance per method, and the [`Server`] dispatcher thread pairs
//! inbound calls with parked acceptances FIFO. Calls that arrive before
//! any acceptance is parked are backlogged; unknown methods are
//! answered `UNIMPLEMENTED`; a malformed request payload is answered
//! `INVALID_ARGUMENT` without consuming the parked acceptance.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, unbounded};
use grapnel_core::CompletionQueue;
use parking_lot::Mutex;

use crate::channel::{Directory, InboundCall, ReplySink, ServerCredentials, ServerHandle, WireError};
use crate::frame;
use crate::message::Message;
use crate::server_call::{RequestSlot, ResponseWriter, ServerContext, StreamWriter, reply_error};
use crate::status::Status;

// ── Service state ───────────────────────────────────────────────────────

enum AcceptOutcome {
    Accepted,
    Rejected(InboundCall, Status),
}

struct ParkedAcceptor {
    accept: Box<dyn FnMut(InboundCall) -> AcceptOutcome + Send>,
    queue: Arc<CompletionQueue>,
    tag: usize,
}

#[derive(Default)]
struct MethodMailbox {
    acceptors: VecDeque<ParkedAcceptor>,
    backlog: VecDeque<InboundCall>,
}

/// Shared mailbox state of one async service. Cheap to clone; the
/// engine, the builder, and the dispatcher all hold the same instance.
#[derive(Clone, Default)]
pub struct ServiceHandle {
    methods: Arc<Mutex<HashMap<String, MethodMailbox>>>,
}

impl ServiceHandle {
    /// Declare a method before any call or acceptance can reference it.
    /// Registration does this; undeclared methods are `UNIMPLEMENTED`.
    pub fn declare_method(&self, full_name: &str) {
        self.methods.lock().entry(full_name.to_string()).or_default();
    }

    /// Number of acceptances currently parked for a method.
    pub fn pending_handlers(&self, full_name: &str) -> usize {
        self.methods.lock().get(full_name).map(|m| m.acceptors.len()).unwrap_or(0)
    }

    /// Fail every parked acceptance with `ok=false`. Engine shutdown
    /// path: workers drain the failure events and reclaim their
    /// contexts before the queues report exhaustion.
    pub fn fail_pending(&self) {
        let mut methods = self.methods.lock();
        for mailbox in methods.values_mut() {
            for acceptor in mailbox.acceptors.drain(..) {
                acceptor.queue.post(acceptor.tag, false);
            }
        }
    }

    fn knows(&self, method: &str) -> bool {
        self.methods.lock().contains_key(method)
    }

    /// Pair an inbound call with a parked acceptance, or backlog it.
    fn deliver(&self, call: InboundCall) {
        let method = call.method.clone();
        let reject = {
            let mut methods = self.methods.lock();
            match methods.get_mut(&method) {
                None => Some((call.reply, Status::unimplemented("unknown method"))),
                Some(mailbox) => match mailbox.acceptors.pop_front() {
                    None => {
                        mailbox.backlog.push_back(call);
                        None
                    }
                    Some(mut acceptor) => match (acceptor.accept)(call) {
                        AcceptOutcome::Accepted => None,
                        AcceptOutcome::Rejected(rejected, status) => {
                            // The acceptance stays armed for the next call.
                            mailbox.acceptors.push_front(acceptor);
                            Some((rejected.reply, status))
                        }
                    },
                },
            }
        };
        if let Some((reply, status)) = reject {
            reply_error(reply, status);
        }
    }

    /// Park an acceptance; a backlogged call is paired immediately.
    fn park(&self, method: &str, mut acceptor: ParkedAcceptor) {
        loop {
            let reject = {
                let mut methods = self.methods.lock();
                let mailbox =
                    methods.get_mut(method).expect("method declared before an acceptance is parked");
                match mailbox.backlog.pop_front() {
                    None => {
                        mailbox.acceptors.push_back(acceptor);
                        return;
                    }
                    Some(call) => match (acceptor.accept)(call) {
                        AcceptOutcome::Accepted => return,
                        AcceptOutcome::Rejected(rejected, status) => (rejected.reply, status),
                    },
                }
            };
            reply_error(reject.0, reject.1);
            // The acceptance stays armed; retry against the backlog.
        }
    }

    /// Answer every backlogged call `UNAVAILABLE`; dispatcher teardown.
    fn flush_backlog(&self) {
        let mut methods = self.methods.lock();
        let calls: Vec<InboundCall> =
            methods.values_mut().flat_map(|m| m.backlog.drain(..)).collect();
        drop(methods);
        for call in calls {
            reply_error(call.reply, Status::unavailable("server shutdown"));
        }
    }
}

/// An asynchronous service the engines can register and drive.
pub trait AsyncService: Default + Send + Sync + 'static {
    fn handle(&self) -> &ServiceHandle;
}

/// The provided dynamic async service: methods are declared at
/// registration time and addressed by fully qualified name. A code
/// generator would wrap this with one acceptor function per method.
#[derive(Default)]
pub struct AsyncRpcService {
    handle: ServiceHandle,
}

impl AsyncService for AsyncRpcService {
    fn handle(&self) -> &ServiceHandle {
        &self.handle
    }
}

fn decode_request<Req: Message>(payload: &Bytes) -> Result<Req, Status> {
    let body = frame::decode_whole_message(payload)
        .map_err(|e| Status::invalid_argument(format!("malformed request frame: {e}")))?;
    Req::decode(&body).map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))
}

impl AsyncRpcService {
    /// Arm acceptance of the next inbound unary call on `method`.
    ///
    /// When a real RPC is paired with this acceptance, the request slot
    /// is filled, the context and writer are bound, and `(tag, ok=true)`
    /// is posted on `queue`.
    pub fn request_unary<Req: Message, Resp: Message>(
        &self,
        method: &str,
        context: &ServerContext,
        request: &RequestSlot<Req>,
        writer: &ResponseWriter<Resp>,
        queue: &Arc<CompletionQueue>,
        tag: usize,
    ) {
        let context = context.clone();
        let request = request.clone();
        let writer = writer.clone();
        let completion_queue = queue.clone();

        let accept = Box::new(move |call: InboundCall| {
            if matches!(call.reply, ReplySink::Stream(_)) {
                return AcceptOutcome::Rejected(call, Status::unimplemented("method is unary"));
            }
            let decoded = match decode_request::<Req>(&call.payload) {
                Ok(decoded) => decoded,
                Err(status) => return AcceptOutcome::Rejected(call, status),
            };
            let InboundCall { peer, reply, cancel, .. } = call;
            let ReplySink::Unary(sink) = reply else { unreachable!("checked above") };
            request.fill(decoded);
            context.bind(peer, &cancel);
            writer.bind(sink, completion_queue.clone());
            completion_queue.post(tag, true);
            AcceptOutcome::Accepted
        });

        self.handle.park(method, ParkedAcceptor { accept, queue: queue.clone(), tag });
    }

    /// Arm acceptance of the next inbound server-stream call.
    pub fn request_server_stream<Req: Message, Notif: Message>(
        &self,
        method: &str,
        context: &ServerContext,
        request: &RequestSlot<Req>,
        writer: &StreamWriter<Notif>,
        queue: &Arc<CompletionQueue>,
        tag: usize,
    ) {
        let context = context.clone();
        let request = request.clone();
        let writer = writer.clone();
        let completion_queue = queue.clone();

        let accept = Box::new(move |call: InboundCall| {
            if matches!(call.reply, ReplySink::Unary(_)) {
                return AcceptOutcome::Rejected(
                    call,
                    Status::unimplemented("method is server-streaming"),
                );
            }
            let decoded = match decode_request::<Req>(&call.payload) {
                Ok(decoded) => decoded,
                Err(status) => return AcceptOutcome::Rejected(call, status),
            };
            let InboundCall { peer, reply, cancel, .. } = call;
            let ReplySink::Stream(sink) = reply else { unreachable!("checked above") };
            request.fill(decoded);
            context.bind(peer, &cancel);
            writer.bind(sink, completion_queue.clone(), context.shared(), cancel);
            completion_queue.post(tag, true);
            AcceptOutcome::Accepted
        });

        self.handle.park(method, ParkedAcceptor { accept, queue: queue.clone(), tag });
    }
}

// ── Server builder and server ───────────────────────────────────────────

/// Builds a [`Server`]: listening addresses plus registered services.
pub struct ServerBuilder {
    directory: Directory,
    ports: Vec<(String, ServerCredentials)>,
    services: Vec<ServiceHandle>,
}

impl ServerBuilder {
    pub fn new(directory: &Directory) -> Self {
        ServerBuilder { directory: directory.clone(), ports: Vec::new(), services: Vec::new() }
    }

    pub fn add_listening_port(
        &mut self,
        address: impl Into<String>,
        credentials: ServerCredentials,
    ) -> &mut Self {
        self.ports.push((address.into(), credentials));
        self
    }

    pub fn register_service(&mut self, handle: &ServiceHandle) -> &mut Self {
        self.services.push(handle.clone());
        self
    }

    /// Bind every address and spawn the dispatcher thread.
    pub fn build_and_start(self) -> Result<Server, WireError> {
        let (calls_tx, calls_rx) = unbounded::<InboundCall>();

        let mut bound: Vec<String> = Vec::with_capacity(self.ports.len());
        for (address, _credentials) in &self.ports {
            if let Err(e) = self.directory.bind(address, ServerHandle { calls_tx: calls_tx.clone() })
            {
                for address in &bound {
                    self.directory.unbind(address);
                }
                return Err(e);
            }
            bound.push(address.clone());
        }

        let services = self.services.clone();
        let dispatcher = thread::Builder::new()
            .name("grapnel-dispatch".to_string())
            .spawn(move || run_dispatcher(calls_rx, services))
            .expect("failed to spawn dispatcher thread");

        Ok(Server {
            directory: self.directory,
            addresses: bound,
            calls_tx: Mutex::new(Some(calls_tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }
}

fn run_dispatcher(calls_rx: Receiver<InboundCall>, services: Vec<ServiceHandle>) {
    for call in calls_rx {
        match services.iter().find(|s| s.knows(&call.method)) {
            Some(service) => service.deliver(call),
            None => reply_error(call.reply, Status::unimplemented("unknown method")),
        }
    }
    for service in &services {
        service.flush_backlog();
    }
}

/// A running server: bound addresses plus the dispatcher thread. The
/// server is owned by user code; engines borrow it.
pub struct Server {
    directory: Directory,
    addresses: Vec<String>,
    calls_tx: Mutex<Option<crossbeam_channel::Sender<InboundCall>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Unbind the addresses and stop the dispatcher. Backlogged calls
    /// are answered `UNAVAILABLE`; parked acceptances stay with their
    /// engine, which fails them on its own shutdown.
    pub fn shutdown(&self) {
        for address in &self.addresses {
            self.directory.unbind(address);
        }
        drop(self.calls_tx.lock().take());
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CancelToken, Channel, ChannelCredentials, ChannelLimits};
    use crate::message::{DecodeError, proto};
    use grapnel_core::{Event, TimerThread};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Ping {
        value: String,
    }

    impl Message for Ping {
        fn type_name() -> &'static str {
            "test.Ping"
        }
        fn encode(&self, buf: &mut Vec<u8>) {
            proto::encode_string_field(1, &self.value, buf);
        }
        fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
            let mut ping = Ping::default();
            while !bytes.is_empty() {
                let (field, wire_type) = proto::decode_tag(&mut bytes)?;
                if field == 1 {
                    ping.value = proto::decode_string_field(&mut bytes)?;
                } else {
                    proto::skip_field(wire_type, &mut bytes)?;
                }
            }
            Ok(ping)
        }
    }

    fn framed(msg: &Ping) -> Bytes {
        frame::encode_message(&msg.encode_to_vec())
    }

    struct Env {
        directory: Directory,
        timer: TimerThread,
        service: Arc<AsyncRpcService>,
        server: Server,
    }

    fn env() -> Env {
        let directory = Directory::new();
        let timer = TimerThread::spawn("wire-test-timer");
        let service = Arc::new(AsyncRpcService::default());
        service.handle().declare_method("test.Svc/Ping");

        let mut builder = ServerBuilder::new(&directory);
        builder
            .add_listening_port("inproc:wire-test", ServerCredentials::insecure())
            .register_service(service.handle());
        let server = builder.build_and_start().unwrap();
        Env { directory, timer, service, server }
    }

    fn unary_sink(
        tx: crossbeam_channel::Sender<Result<Bytes, Status>>,
    ) -> ReplySink {
        ReplySink::Unary(Box::new(move |result| {
            let _ = tx.send(result);
        }))
    }

    #[test]
    fn pairs_parked_acceptance_with_call() {
        let env = env();
        let queue = CompletionQueue::new();
        let context = ServerContext::new();
        let slot: RequestSlot<Ping> = RequestSlot::new();
        let writer: ResponseWriter<Ping> = ResponseWriter::new();

        env.service.request_unary("test.Svc/Ping", &context, &slot, &writer, &queue, 0x10);
        assert_eq!(env.service.handle().pending_handlers("test.Svc/Ping"), 1);

        let channel = Channel::connect(
            &env.directory,
            "inproc:wire-test",
            ChannelCredentials::insecure(),
            ChannelLimits::default(),
            env.timer.clone(),
        );
        let (tx, rx) = unbounded();
        channel
            .call("test.Svc/Ping", framed(&Ping { value: "hi".into() }), unary_sink(tx), CancelToken::new())
            .unwrap();

        assert_eq!(queue.next(), Some(Event { tag: 0x10, ok: true }));
        assert_eq!(env.service.handle().pending_handlers("test.Svc/Ping"), 0);
        assert_eq!(slot.take().unwrap(), Ping { value: "hi".into() });
        assert_eq!(context.peer(), channel.peer());

        writer.finish(Ok(Ping { value: "hi".into() }), 0x20);
        assert_eq!(queue.next(), Some(Event { tag: 0x20, ok: true }));
        let reply = rx.recv().unwrap().unwrap();
        let body = frame::decode_whole_message(&reply).unwrap();
        assert_eq!(Ping::decode(&body).unwrap(), Ping { value: "hi".into() });

        env.timer.stop();
    }

    #[test]
    fn backlogged_call_pairs_on_park() {
        let env = env();
        let channel = Channel::connect(
            &env.directory,
            "inproc:wire-test",
            ChannelCredentials::insecure(),
            ChannelLimits::default(),
            env.timer.clone(),
        );
        let (tx, _rx) = unbounded();
        channel
            .call("test.Svc/Ping", framed(&Ping::default()), unary_sink(tx), CancelToken::new())
            .unwrap();
        // Give the dispatcher a moment to backlog the call.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let queue = CompletionQueue::new();
        let context = ServerContext::new();
        let slot: RequestSlot<Ping> = RequestSlot::new();
        let writer: ResponseWriter<Ping> = ResponseWriter::new();
        env.service.request_unary("test.Svc/Ping", &context, &slot, &writer, &queue, 0x10);

        assert_eq!(queue.next(), Some(Event { tag: 0x10, ok: true }));
        env.timer.stop();
    }

    #[test]
    fn unknown_method_is_unimplemented() {
        let env = env();
        let channel = Channel::connect(
            &env.directory,
            "inproc:wire-test",
            ChannelCredentials::insecure(),
            ChannelLimits::default(),
            env.timer.clone(),
        );
        let (tx, rx) = unbounded();
        channel
            .call("test.Svc/Nope", framed(&Ping::default()), unary_sink(tx), CancelToken::new())
            .unwrap();

        let status = rx.recv().unwrap().unwrap_err();
        assert_eq!(status.code(), crate::status::Code::Unimplemented);
        env.timer.stop();
    }

    #[test]
    fn malformed_payload_keeps_acceptance_armed() {
        let env = env();
        let queue = CompletionQueue::new();
        let context = ServerContext::new();
        let slot: RequestSlot<Ping> = RequestSlot::new();
        let writer: ResponseWriter<Ping> = ResponseWriter::new();
        env.service.request_unary("test.Svc/Ping", &context, &slot, &writer, &queue, 0x10);

        let channel = Channel::connect(
            &env.directory,
            "inproc:wire-test",
            ChannelCredentials::insecure(),
            ChannelLimits::default(),
            env.timer.clone(),
        );
        let (tx, rx) = unbounded();
        channel
            .call("test.Svc/Ping", Bytes::from_static(b"\xff\xff"), unary_sink(tx), CancelToken::new())
            .unwrap();

        let status = rx.recv().unwrap().unwrap_err();
        assert_eq!(status.code(), crate::status::Code::InvalidArgument);
        assert_eq!(env.service.handle().pending_handlers("test.Svc/Ping"), 1);
        env.timer.stop();
    }

    #[test]
    fn fail_pending_posts_failures() {
        let env = env();
        let queue = CompletionQueue::new();
        let context = ServerContext::new();
        let slot: RequestSlot<Ping> = RequestSlot::new();
        let writer: ResponseWriter<Ping> = ResponseWriter::new();
        env.service.request_unary("test.Svc/Ping", &context, &slot, &writer, &queue, 0x10);

        env.service.handle().fail_pending();
        assert_eq!(queue.next(), Some(Event { tag: 0x10, ok: false }));
        assert_eq!(env.service.handle().pending_handlers("test.Svc/Ping"), 0);
        env.timer.stop();
    }

    #[test]
    fn server_shutdown_unbinds() {
        let env = env();
        env.server.shutdown();
        let channel = Channel::connect(
            &env.directory,
            "inproc:wire-test",
            ChannelCredentials::insecure(),
            ChannelLimits::default(),
            env.timer.clone(),
        );
        let (tx, _rx) = unbounded();
        assert!(matches!(
            channel.call("test.Svc/Ping", framed(&Ping::default()), unary_sink(tx), CancelToken::new()),
            Err(WireError::Unresolved(_))
        ));
        env.timer.stop();
    }
}

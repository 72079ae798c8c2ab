//! Integration tests for the service engine.
//!
//! Drives a real engine + worker pool through the loopback wire with
//! hand-pumped client-side readers, without the client engine: each
//! test owns its completion queue and steps the call explicitly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use grapnel_core::{CompletionQueue, MethodDescriptor, TimerThread, log};
use grapnel_server::{
    AsyncService, ConfigError, Environment, Options, ServiceEngine, SingularMethod,
    server_stream_acceptor, singular_acceptor,
};
use grapnel_wire::{
    AsyncRpcService, Channel, ChannelCredentials, ChannelLimits, ClientContext, Code, DecodeError,
    Directory, Message, ServerBuilder, ServerCredentials, SingularReader, Status, StreamingReader,
    proto,
};

// ── Test messages ───────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, PartialEq)]
struct FooRequest {
    value: String,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Foo {
    value: String,
}

macro_rules! string_message {
    ($name:ident, $type_name:expr) => {
        impl Message for $name {
            fn type_name() -> &'static str {
                $type_name
            }
            fn encode(&self, buf: &mut Vec<u8>) {
                proto::encode_string_field(1, &self.value, buf);
            }
            fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
                let mut message = Self::default();
                while !bytes.is_empty() {
                    let (field, wire_type) = proto::decode_tag(&mut bytes)?;
                    if field == 1 {
                        message.value = proto::decode_string_field(&mut bytes)?;
                    } else {
                        proto::skip_field(wire_type, &mut bytes)?;
                    }
                }
                Ok(message)
            }
        }
    };
}

string_message!(FooRequest, "ex.FooRequest");
string_message!(Foo, "ex.Foo");

// ── Helpers ─────────────────────────────────────────────────────────────

fn get_foo_descriptor() -> MethodDescriptor {
    MethodDescriptor::new("ex.Frontend", "GetFoo", "ex.FooRequest", "ex.Foo", false)
}

fn subscribe_foo_descriptor() -> MethodDescriptor {
    MethodDescriptor::new("ex.Frontend", "SubscribeFoo", "ex.FooRequest", "ex.Foo", true)
}

fn environment() -> Environment {
    // Engine logs flow through the tracing bridge; visible with
    // RUST_LOG set.
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    Environment::new(log::tracing_callback())
}

struct TestBed {
    directory: Directory,
    timer: TimerThread,
    client_queue: Arc<CompletionQueue>,
}

impl TestBed {
    fn new() -> Self {
        TestBed {
            directory: Directory::new(),
            timer: TimerThread::spawn("engine-test-timer"),
            client_queue: CompletionQueue::new(),
        }
    }

    fn channel(&self, address: &str) -> Channel {
        Channel::connect(
            &self.directory,
            address,
            ChannelCredentials::insecure(),
            ChannelLimits::default(),
            self.timer.clone(),
        )
    }

    fn unary(&self, channel: &Channel, request: &FooRequest) -> (Option<Foo>, Status) {
        let context = ClientContext::new();
        context.set_deadline(Duration::from_secs(5));
        let reader =
            SingularReader::new(channel, &context, "ex.Frontend/GetFoo", request, &self.client_queue);
        reader.start_call();
        reader.finish(0x100);
        let event = self.client_queue.next().expect("client completion");
        assert_eq!(event.tag, 0x100);
        reader.take_result()
    }
}

impl Drop for TestBed {
    fn drop(&mut self) {
        self.timer.stop();
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

// ── Registration validation ─────────────────────────────────────────────

#[test]
fn registration_rejects_type_mismatch() {
    let bed = TestBed::new();
    let mut builder = ServerBuilder::new(&bed.directory);
    let options = Options::new("ex.Frontend").unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, environment());

    // Request/response registered backwards relative to the descriptor.
    let descriptor =
        MethodDescriptor::new("ex.Frontend", "GetFoo", "ex.Other", "ex.Foo", false);
    let result = engine.register_singular_method(
        &descriptor,
        singular_acceptor!("ex.Frontend/GetFoo"),
        |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| drop(method),
    );
    assert!(matches!(result, Err(ConfigError::TypeMismatch { .. })));
}

#[test]
fn registration_rejects_kind_mismatch_and_duplicates() {
    let bed = TestBed::new();
    let mut builder = ServerBuilder::new(&bed.directory);
    let options = Options::new("ex.Frontend").unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, environment());

    // A streaming descriptor cannot take a singular registration.
    let result = engine.register_singular_method(
        &subscribe_foo_descriptor(),
        singular_acceptor!("ex.Frontend/SubscribeFoo"),
        |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| drop(method),
    );
    assert!(matches!(result, Err(ConfigError::KindMismatch(_))));

    engine
        .register_singular_method(
            &get_foo_descriptor(),
            singular_acceptor!("ex.Frontend/GetFoo"),
            |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| drop(method),
        )
        .unwrap();
    let result = engine.register_singular_method(
        &get_foo_descriptor(),
        singular_acceptor!("ex.Frontend/GetFoo"),
        |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| drop(method),
    );
    assert!(matches!(result, Err(ConfigError::DuplicateMethod(_))));
}

#[test]
fn run_requires_a_registered_method() {
    let bed = TestBed::new();
    let mut builder = ServerBuilder::new(&bed.directory);
    builder.add_listening_port("inproc:empty-engine", ServerCredentials::insecure());
    let options = Options::new("ex.Frontend").unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, environment());
    let server = builder.build_and_start().unwrap();
    assert!(matches!(engine.run(&server), Err(ConfigError::NoMethodsRegistered)));
}

// ── Engine behavior ─────────────────────────────────────────────────────

#[test]
fn unary_echo_roundtrip() {
    let bed = TestBed::new();
    let mut builder = ServerBuilder::new(&bed.directory);
    let options = Options::new("ex.Frontend")
        .unwrap()
        .add_endpoint("inproc:engine-echo", ServerCredentials::insecure())
        .unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, environment());

    engine
        .register_singular_method(
            &get_foo_descriptor(),
            singular_acceptor!("ex.Frontend/GetFoo"),
            |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| {
                let value = method.request().value.clone();
                method.respond(Ok(Foo { value }));
            },
        )
        .unwrap();

    let server = builder.build_and_start().unwrap();
    engine.run(&server).unwrap();

    let channel = bed.channel("inproc:engine-echo");
    let (response, status) = bed.unary(&channel, &FooRequest { value: "abc".into() });
    assert!(status.is_ok(), "unexpected status: {status}");
    assert_eq!(response.unwrap(), Foo { value: "abc".into() });
}

#[test]
fn unary_error_status_passthrough() {
    let bed = TestBed::new();
    let mut builder = ServerBuilder::new(&bed.directory);
    let options = Options::new("ex.Frontend")
        .unwrap()
        .add_endpoint("inproc:engine-err", ServerCredentials::insecure())
        .unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, environment());

    engine
        .register_singular_method(
            &get_foo_descriptor(),
            singular_acceptor!("ex.Frontend/GetFoo"),
            |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| {
                method.respond(Err(Status::invalid_argument("bad")));
            },
        )
        .unwrap();

    let server = builder.build_and_start().unwrap();
    engine.run(&server).unwrap();

    let channel = bed.channel("inproc:engine-err");
    let (response, status) = bed.unary(&channel, &FooRequest { value: "x".into() });
    assert!(response.is_none());
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), Some("bad"));
}

#[test]
fn handler_pool_reaches_steady_state_and_respawns() {
    let bed = TestBed::new();
    let mut builder = ServerBuilder::new(&bed.directory);
    let options = Options::new("ex.Frontend")
        .unwrap()
        .add_endpoint("inproc:engine-pool", ServerCredentials::insecure())
        .unwrap()
        .with_queue_count(2)
        .unwrap()
        .with_handlers_per_thread(3)
        .unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, environment());

    engine
        .register_singular_method(
            &get_foo_descriptor(),
            singular_acceptor!("ex.Frontend/GetFoo"),
            |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| {
                let value = method.request().value.clone();
                method.respond(Ok(Foo { value }));
            },
        )
        .unwrap();

    let server = builder.build_and_start().unwrap();
    let handle = engine.service().handle().clone();
    engine.run(&server).unwrap();

    // 2 queues × 1 thread × 3 handlers pre-warmed.
    wait_for("pre-warmed handler pool", || {
        handle.pending_handlers("ex.Frontend/GetFoo") == 6
    });

    // Each accepted call spawns its replacement.
    let channel = bed.channel("inproc:engine-pool");
    let (_, status) = bed.unary(&channel, &FooRequest { value: "y".into() });
    assert!(status.is_ok());
    wait_for("replacement handler", || handle.pending_handlers("ex.Frontend/GetFoo") == 6);
}

#[test]
fn stream_preserves_push_order_and_close() {
    let bed = TestBed::new();
    let mut builder = ServerBuilder::new(&bed.directory);
    let options = Options::new("ex.Frontend")
        .unwrap()
        .add_endpoint("inproc:engine-stream", ServerCredentials::insecure())
        .unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, environment());

    engine
        .register_server_stream_method(
            &subscribe_foo_descriptor(),
            server_stream_acceptor!("ex.Frontend/SubscribeFoo"),
            |stream: grapnel_server::ServerStreamMethod<AsyncRpcService, FooRequest, Foo>| {
                // Push from another thread; the delivery callback is
                // not the place to produce a long stream.
                std::thread::spawn(move || {
                    for i in 0..10 {
                        stream.push(Foo { value: i.to_string() });
                    }
                    stream.close(Status::ok());
                });
            },
        )
        .unwrap();

    let server = builder.build_and_start().unwrap();
    engine.run(&server).unwrap();

    let channel = bed.channel("inproc:engine-stream");
    let context = ClientContext::new();
    context.set_deadline(Duration::from_secs(5));
    let reader: StreamingReader<Foo> = StreamingReader::new(
        &channel,
        &context,
        "ex.Frontend/SubscribeFoo",
        &FooRequest { value: "sub".into() },
        &bed.client_queue,
    );
    reader.start_call(0x200);
    assert!(bed.client_queue.next().unwrap().ok);

    let mut seen = Vec::new();
    loop {
        reader.read(0x201);
        let event = bed.client_queue.next().unwrap();
        if !event.ok {
            break;
        }
        seen.push(reader.take_notification().value);
    }
    reader.finish(0x202);
    assert!(bed.client_queue.next().unwrap().ok);
    assert!(reader.take_status().is_ok());

    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);
}

#[test]
fn peer_cancellation_finishes_stream_and_drops_pushes() {
    let bed = TestBed::new();
    let mut builder = ServerBuilder::new(&bed.directory);
    let options = Options::new("ex.Frontend")
        .unwrap()
        .add_endpoint("inproc:engine-cancel", ServerCredentials::insecure())
        .unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, environment());

    let (handle_tx, handle_rx) = crossbeam_channel::unbounded();
    engine
        .register_server_stream_method(
            &subscribe_foo_descriptor(),
            server_stream_acceptor!("ex.Frontend/SubscribeFoo"),
            move |stream: grapnel_server::ServerStreamMethod<AsyncRpcService, FooRequest, Foo>| {
                let _ = handle_tx.send(stream);
            },
        )
        .unwrap();

    let server = builder.build_and_start().unwrap();
    engine.run(&server).unwrap();

    let channel = bed.channel("inproc:engine-cancel");
    let context = ClientContext::new();
    context.set_deadline(Duration::from_secs(5));
    let reader: StreamingReader<Foo> = StreamingReader::new(
        &channel,
        &context,
        "ex.Frontend/SubscribeFoo",
        &FooRequest::default(),
        &bed.client_queue,
    );
    reader.start_call(0x300);
    assert!(bed.client_queue.next().unwrap().ok);

    let stream = handle_rx.recv_timeout(Duration::from_secs(5)).expect("stream delivered");
    assert_eq!(stream.state(), grapnel_server::StreamState::Running);
    stream.push(Foo { value: "before".into() });

    reader.read(0x301);
    assert!(bed.client_queue.next().unwrap().ok);
    assert_eq!(reader.take_notification().value, "before");

    // Cancel mid-stream; the server observes it and the context drains.
    reader.read(0x301);
    context.try_cancel();
    assert!(!bed.client_queue.next().unwrap().ok);
    reader.finish(0x302);
    assert!(bed.client_queue.next().unwrap().ok);
    assert_eq!(reader.take_status().code(), Code::Cancelled);

    wait_for("stream context teardown", || {
        stream.state() == grapnel_server::StreamState::Finished
    });
    // Post-cancel pushes land nowhere.
    assert_eq!(stream.push(Foo { value: "after".into() }), grapnel_server::StreamState::Finished);
}

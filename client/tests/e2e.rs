//! End-to-end tests: a real service engine and a real client engine
//! wired through the loopback directory.
//!
//! Each test owns its own directory, addresses, and engines, so the
//! per-engine uniqueness rules (one stream per session id and per
//! request type) never leak between tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use grapnel_client::{
    ClientEngine, ClientState, Code, Environment as ClientEnvironment, Options as ClientOptions,
    RelaunchPolicy, ServerStreamCall, SingularCall, StreamEvent, Summary, singular_reader,
    stream_reader,
};
use grapnel_core::{MethodDescriptor, log};
use grapnel_server::{
    Environment as ServerEnvironment, Options as ServerOptions, ServerStreamMethod, ServiceEngine,
    SingularMethod, StreamState, server_stream_acceptor, singular_acceptor,
};
use grapnel_wire::{
    AsyncRpcService, DecodeError, Directory, Message, Server, ServerBuilder, ServerCredentials,
    Status, proto,
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

#[derive(Debug, Default, Clone, PartialEq)]
struct BarRequest {
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
string_message!(BarRequest, "ex.BarRequest");

// ── Fixture ─────────────────────────────────────────────────────────────

type StreamHandle = ServerStreamMethod<AsyncRpcService, FooRequest, Foo>;

/// A running frontend service: `GetFoo` echoes (or fails on demand),
/// `SubscribeFoo` hands its stream handle to the test body.
struct Fixture {
    directory: Directory,
    streams: Receiver<StreamHandle>,
    _engine: ServiceEngine<AsyncRpcService>,
    _server: Server,
}

fn logger_callback() -> grapnel_core::LoggerCallback {
    // Both engines log through the tracing bridge; visible with
    // RUST_LOG set.
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    log::tracing_callback()
}

fn fixture(address: &str) -> Fixture {
    let directory = Directory::new();
    let mut builder = ServerBuilder::new(&directory);
    let options = ServerOptions::new("ex.Frontend")
        .unwrap()
        .add_endpoint(address, ServerCredentials::insecure())
        .unwrap();
    let mut engine: ServiceEngine<AsyncRpcService> =
        ServiceEngine::new(&mut builder, options, ServerEnvironment::new(logger_callback()));

    engine
        .register_singular_method(
            &MethodDescriptor::new("ex.Frontend", "GetFoo", "ex.FooRequest", "ex.Foo", false),
            singular_acceptor!("ex.Frontend/GetFoo"),
            |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| {
                let value = method.request().value.clone();
                if value == "bad" {
                    method.respond(Err(Status::invalid_argument("bad")));
                } else {
                    method.respond(Ok(Foo { value }));
                }
            },
        )
        .unwrap();

    let (stream_tx, streams) = unbounded();
    engine
        .register_server_stream_method(
            &MethodDescriptor::new("ex.Frontend", "SubscribeFoo", "ex.FooRequest", "ex.Foo", true),
            server_stream_acceptor!("ex.Frontend/SubscribeFoo"),
            move |stream: StreamHandle| {
                let _ = stream_tx.send(stream);
            },
        )
        .unwrap();

    let server = builder.build_and_start().unwrap();
    engine.run(&server).unwrap();

    Fixture { directory, streams, _engine: engine, _server: server }
}

fn client(directory: &Directory, address: &str) -> ClientEngine {
    let options = ClientOptions::new(address)
        .unwrap()
        .with_singular_call_deadline(Duration::from_secs(5))
        .unwrap()
        .with_server_stream_deadline(Duration::from_secs(30))
        .unwrap()
        .with_server_stream_relaunch_interval(Duration::from_millis(200))
        .unwrap();
    let engine =
        ClientEngine::new(options, ClientEnvironment::new(logger_callback()), directory);
    engine.run();
    engine
}

fn collector() -> (impl FnMut(StreamEvent<Foo>) + Send + 'static, Receiver<StreamEvent<Foo>>) {
    let (tx, rx) = unbounded();
    (
        move |event| {
            let _ = tx.send(event);
        },
        rx,
    )
}

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(10) {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

// ── Scenario 1 & 2: unary round trip and unary error ────────────────────

#[test]
fn unary_round_trip() {
    let fixture = fixture("inproc:e2e-unary");
    let engine = client(&fixture.directory, "inproc:e2e-unary");

    let (tx, rx) = unbounded();
    engine.execute_singular_call(SingularCall::new(
        FooRequest { value: "abc".into() },
        singular_reader!("ex.Frontend/GetFoo"),
        move |summary: Summary<FooRequest, Foo>| {
            let _ = tx.send(summary);
        },
    ));

    let summary = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(summary.request.value, "abc");
    assert_eq!(summary.result.unwrap().value, "abc");
}

#[test]
fn unary_error_carries_code_and_message() {
    let fixture = fixture("inproc:e2e-unary-err");
    let engine = client(&fixture.directory, "inproc:e2e-unary-err");

    let (tx, rx) = unbounded();
    engine.execute_singular_call(SingularCall::new(
        FooRequest { value: "bad".into() },
        singular_reader!("ex.Frontend/GetFoo"),
        move |summary: Summary<FooRequest, Foo>| {
            let _ = tx.send(summary);
        },
    ));

    let summary = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let status = summary.result.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), Some("bad"));
}

// ── Scenario 3: stream of N, in order, one terminal ─────────────────────

#[test]
fn stream_of_one_hundred_in_order() {
    let fixture = fixture("inproc:e2e-stream");
    let engine = client(&fixture.directory, "inproc:e2e-stream");

    let (callback, events) = collector();
    let mut call = ServerStreamCall::new(
        "s1",
        FooRequest { value: "sub".into() },
        stream_reader!("ex.Frontend/SubscribeFoo"),
        callback,
    );
    call.relaunch_policy = Some(RelaunchPolicy::Shutdown);
    engine.launch_server_stream(call);

    let stream = fixture.streams.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(stream.request().unwrap().value, "sub");
    for i in 0..100 {
        stream.push(Foo { value: i.to_string() });
    }
    stream.close(Status::ok());

    for i in 0..100 {
        match events.recv_timeout(RECV_TIMEOUT).unwrap() {
            StreamEvent::Notification(foo) => assert_eq!(foo.value, i.to_string()),
            StreamEvent::Finished(status) => panic!("early terminal: {status}"),
        }
    }
    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Finished(status) => assert!(status.is_ok()),
        StreamEvent::Notification(foo) => panic!("excess notification: {foo:?}"),
    }
}

// ── Scenario 4: reconnect after a broken stream ─────────────────────────

#[test]
fn stream_relaunches_after_unavailable() {
    let fixture = fixture("inproc:e2e-reconnect");
    let engine = client(&fixture.directory, "inproc:e2e-reconnect");

    let (callback, events) = collector();
    engine.launch_server_stream(ServerStreamCall::new(
        "s1",
        FooRequest { value: "sub".into() },
        stream_reader!("ex.Frontend/SubscribeFoo"),
        callback,
    ));

    // Round one: deliver a notification, then break the stream.
    let first = fixture.streams.recv_timeout(RECV_TIMEOUT).unwrap();
    first.push(Foo { value: "round-one".into() });
    first.close(Status::unavailable("backend going away"));
    let broken_at = Instant::now();

    // The relaunch repeats the same request and session id after the
    // configured interval.
    let second = fixture.streams.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(
        broken_at.elapsed() >= Duration::from_millis(200),
        "relaunched after only {:?}",
        broken_at.elapsed()
    );
    assert_eq!(second.request().unwrap().value, "sub");
    second.push(Foo { value: "round-two".into() });

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Notification(foo) => assert_eq!(foo.value, "round-one"),
        StreamEvent::Finished(status) => panic!("terminal should be swallowed: {status}"),
    }
    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Notification(foo) => assert_eq!(foo.value, "round-two"),
        StreamEvent::Finished(status) => panic!("terminal should be swallowed: {status}"),
    }

    // Deliberate shutdown ends the supervision with one CANCELLED.
    engine.shutdown_server_stream("s1");
    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Finished(status) => assert_eq!(status.code(), Code::Cancelled),
        StreamEvent::Notification(foo) => panic!("excess notification: {foo:?}"),
    }
}

#[test]
fn shutdown_policy_suppresses_relaunch() {
    let fixture = fixture("inproc:e2e-no-relaunch");
    let engine = client(&fixture.directory, "inproc:e2e-no-relaunch");

    let (callback, events) = collector();
    let mut call = ServerStreamCall::new(
        "s1",
        FooRequest::default(),
        stream_reader!("ex.Frontend/SubscribeFoo"),
        callback,
    );
    call.relaunch_policy = Some(RelaunchPolicy::Shutdown);
    engine.launch_server_stream(call);

    let stream = fixture.streams.recv_timeout(RECV_TIMEOUT).unwrap();
    stream.close(Status::unavailable("backend going away"));

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Finished(status) => assert_eq!(status.code(), Code::Unavailable),
        StreamEvent::Notification(foo) => panic!("unexpected notification: {foo:?}"),
    }
    // No second acceptance happens.
    assert!(fixture.streams.recv_timeout(Duration::from_millis(500)).is_err());
}

// ── Scenario 5: cancellation mid-stream ─────────────────────────────────

#[test]
fn cancellation_drains_server_and_delivers_cancelled() {
    let fixture = fixture("inproc:e2e-cancel");
    let engine = client(&fixture.directory, "inproc:e2e-cancel");

    let (callback, events) = collector();
    engine.launch_server_stream(ServerStreamCall::new(
        "s1",
        FooRequest::default(),
        stream_reader!("ex.Frontend/SubscribeFoo"),
        callback,
    ));

    let stream = fixture.streams.recv_timeout(RECV_TIMEOUT).unwrap();
    stream.push(Foo { value: "one".into() });
    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Notification(foo) => assert_eq!(foo.value, "one"),
        StreamEvent::Finished(status) => panic!("early terminal: {status}"),
    }

    engine.shutdown_server_stream("s1");

    // The client observes one CANCELLED terminal and nothing after.
    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Finished(status) => assert_eq!(status.code(), Code::Cancelled),
        StreamEvent::Notification(foo) => panic!("excess notification: {foo:?}"),
    }

    // The server observes peer cancellation and tears the context down;
    // later pushes land nowhere.
    wait_for("server stream teardown", || stream.state() == StreamState::Finished);
    assert_eq!(stream.push(Foo { value: "late".into() }), StreamState::Finished);
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
}

// ── Scenario 6: concurrent pushes ───────────────────────────────────────

#[test]
fn concurrent_pushes_all_reach_the_wire_in_thread_order() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 1000;

    let fixture = fixture("inproc:e2e-concurrent");
    let engine = client(&fixture.directory, "inproc:e2e-concurrent");

    let (callback, events) = collector();
    let mut call = ServerStreamCall::new(
        "s1",
        FooRequest::default(),
        stream_reader!("ex.Frontend/SubscribeFoo"),
        callback,
    );
    call.relaunch_policy = Some(RelaunchPolicy::Shutdown);
    engine.launch_server_stream(call);

    let stream = fixture.streams.recv_timeout(RECV_TIMEOUT).unwrap();
    let mut pushers = Vec::new();
    for t in 0..THREADS {
        let stream = stream.clone();
        pushers.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                stream.push(Foo { value: format!("{t}:{i}") });
            }
        }));
    }
    for pusher in pushers {
        pusher.join().unwrap();
    }
    stream.close(Status::ok());

    let mut next_per_thread = [0usize; THREADS];
    let mut total = 0usize;
    loop {
        match events.recv_timeout(RECV_TIMEOUT).unwrap() {
            StreamEvent::Notification(foo) => {
                total += 1;
                let (t, i) = foo.value.split_once(':').expect("thread-tagged value");
                let t: usize = t.parse().unwrap();
                let i: usize = i.parse().unwrap();
                assert_eq!(i, next_per_thread[t], "per-thread order broken for pusher {t}");
                next_per_thread[t] += 1;
            }
            StreamEvent::Finished(status) => {
                assert!(status.is_ok());
                break;
            }
        }
    }
    assert_eq!(total, THREADS * PER_THREAD);
}

// ── Uniqueness rules ────────────────────────────────────────────────────

#[test]
fn duplicate_type_and_session_are_rejected() {
    let fixture = fixture("inproc:e2e-unique");
    let engine = client(&fixture.directory, "inproc:e2e-unique");

    let (callback, first_events) = collector();
    engine.launch_server_stream(ServerStreamCall::new(
        "s1",
        FooRequest::default(),
        stream_reader!("ex.Frontend/SubscribeFoo"),
        callback,
    ));
    let _stream = fixture.streams.recv_timeout(RECV_TIMEOUT).unwrap();

    // Same request type, different session: rejected.
    let (callback, rejected_type) = collector();
    engine.launch_server_stream(ServerStreamCall::new(
        "s2",
        FooRequest::default(),
        stream_reader!("ex.Frontend/SubscribeFoo"),
        callback,
    ));
    match rejected_type.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Finished(status) => assert_eq!(status.code(), Code::FailedPrecondition),
        StreamEvent::Notification(foo) => panic!("unexpected notification: {foo:?}"),
    }

    // Different request type, same session id: rejected.
    let (tx, rejected_session) = unbounded();
    engine.launch_server_stream(ServerStreamCall::new(
        "s1",
        BarRequest::default(),
        stream_reader!("ex.Frontend/SubscribeBar"),
        move |event: StreamEvent<Foo>| {
            let _ = tx.send(event);
        },
    ));
    match rejected_session.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Finished(status) => assert_eq!(status.code(), Code::FailedPrecondition),
        StreamEvent::Notification(foo) => panic!("unexpected notification: {foo:?}"),
    }

    // The original stream is untouched by the rejections.
    assert!(first_events.recv_timeout(Duration::from_millis(200)).is_err());
}

// ── Shutdown safety ─────────────────────────────────────────────────────

#[test]
fn engine_shutdown_aborts_in_flight_streams_exactly_once() {
    let fixture = fixture("inproc:e2e-shutdown");
    let mut engine = client(&fixture.directory, "inproc:e2e-shutdown");
    assert_eq!(engine.state(), ClientState::Running);

    let terminal_count = Arc::new(AtomicUsize::new(0));
    let (tx, events) = unbounded();
    let counted = terminal_count.clone();
    engine.launch_server_stream(ServerStreamCall::new(
        "s1",
        FooRequest::default(),
        stream_reader!("ex.Frontend/SubscribeFoo"),
        move |event: StreamEvent<Foo>| {
            if matches!(event, StreamEvent::Finished(_)) {
                counted.fetch_add(1, Ordering::SeqCst);
            }
            let _ = tx.send(event);
        },
    ));

    let stream = fixture.streams.recv_timeout(RECV_TIMEOUT).unwrap();
    stream.push(Foo { value: "pre-shutdown".into() });
    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Notification(foo) => assert_eq!(foo.value, "pre-shutdown"),
        StreamEvent::Finished(status) => panic!("early terminal: {status}"),
    }

    engine.shutdown();
    assert_eq!(engine.state(), ClientState::Standby);

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        StreamEvent::Finished(status) => {
            assert_eq!(status.code(), Code::Aborted);
            assert_eq!(status.message(), Some("Client shutdown"));
        }
        StreamEvent::Notification(foo) => panic!("notification after shutdown: {foo:?}"),
    }
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(terminal_count.load(Ordering::SeqCst), 1);
}

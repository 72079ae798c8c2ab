//! grapnel-client — callback-style client engine.
//!
//! Dispatches RPCs to the wire and executes provided callbacks on call
//! events. The engine owns one completion queue, one pump thread, and
//! one strand thread; all engine state is touched only on the strand,
//! so public operations post a job and return immediately.
//!
//! Singular calls complete exactly once with a [`Summary`]. Server
//! streams are supervised by session id: a broken stream is relaunched
//! after the configured interval under [`RelaunchPolicy::Relaunch`],
//! and `CANCELLED` terminal statuses (a deliberate
//! [`ClientEngine::shutdown_server_stream`]) suppress the relaunch.
//!
//! ```ignore
//! let options = Options::new("127.0.0.1:50051")?
//!     .with_server_stream_relaunch_interval(Duration::from_millis(500))?;
//! let engine = ClientEngine::new(options, Environment::new(tracing_callback()), &directory);
//! engine.run();
//!
//! engine.execute_singular_call(SingularCall::new(
//!     FooRequest { value: "abc".into() },
//!     singular_reader!("example.Frontend/GetFoo"),
//!     |summary: Summary<FooRequest, Foo>| println!("{:?}", summary.result),
//! ));
//!
//! engine.launch_server_stream(ServerStreamCall::new(
//!     "session-1",
//!     FooRequest::default(),
//!     stream_reader!("example.Frontend/SubscribeFoo"),
//!     |event: StreamEvent<Foo>| match event {
//!         StreamEvent::Notification(foo) => println!("{foo:?}"),
//!         StreamEvent::Finished(status) => println!("done: {status}"),
//!     },
//! ));
//! ```

mod call;
mod config;
mod detail;
mod engine;
mod entry;
mod metrics;

pub use call::{
    ClientState, CompletionCallback, RelaunchPolicy, ServerStreamCall, SessionId, SingularCall,
    SingularReaderFn, StreamEvent, StreamEventCallback, StreamReaderFn, Summary,
};
pub use config::{ConfigError, Environment, Options};
pub use engine::ClientEngine;

// Re-exports for reader-factory macros and call signatures.
pub use grapnel_core::CompletionQueue;
pub use grapnel_wire::{
    Channel, ChannelCredentials, ClientContext, Code, Directory, Message, SingularReader, Status,
    StreamingReader,
};

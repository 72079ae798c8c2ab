//! grapnel-server — callback-style service engine.
//!
//! The engine turns an asynchronous, completion-queue-based service
//! skeleton into ergonomic callbacks: register a handler per method,
//! run on a built server, and each accepted RPC arrives as a
//! lifecycle-managed object (`SingularMethod` for unary calls,
//! `ServerStreamMethod` for server streams). The engine owns the
//! completion queues and the worker pool; the server stays owned by
//! user code.
//!
//! ```ignore
//! let directory = Directory::new();
//! let mut builder = ServerBuilder::new(&directory);
//!
//! let options = Options::new("example.Frontend")?
//!     .add_endpoint("127.0.0.1:50051", ServerCredentials::insecure())?;
//! let environment = Environment::new(grapnel_core::log::tracing_callback());
//!
//! let mut engine: ServiceEngine<AsyncRpcService> =
//!     ServiceEngine::new(&mut builder, options, environment);
//! engine.register_singular_method(
//!     &get_foo_descriptor(),
//!     singular_acceptor!("example.Frontend/GetFoo"),
//!     |method: SingularMethod<AsyncRpcService, FooRequest, Foo>| {
//!         let value = method.request().value.clone();
//!         method.respond(Ok(Foo { value }));
//!     },
//! )?;
//!
//! let server = builder.build_and_start()?;
//! engine.run(&server)?;
//! ```

mod acceptor;
mod config;
mod detail;
mod engine;
mod metrics;
mod registry;
mod singular;
mod stream;

pub use config::{ConfigError, Environment, Options};
pub use engine::ServiceEngine;
pub use singular::{SingularAcceptorFn, SingularMethod, SingularMethodCallback};
pub use stream::{
    RequestGuard, ServerStreamAcceptorFn, ServerStreamMethod, ServerStreamMethodCallback,
    StreamState,
};

// Re-exports for acceptor macros and handler signatures.
pub use grapnel_core::{CompletionQueue, MethodDescriptor};
pub use grapnel_wire::{
    AsyncRpcService, AsyncService, RequestSlot, ResponseWriter, ServerContext, Status,
    StreamWriter,
};

//! Acceptor generation macros.
//!
//! An acceptor is the free function value that binds a method to the
//! async service's "accept the next inbound RPC" entry point. A code
//! generator emits one per method; these macros do the same for
//! [`AsyncRpcService`](crate::AsyncRpcService) methods addressed by
//! fully qualified name.

/// Generate a [`SingularAcceptorFn`](crate::SingularAcceptorFn) for a
/// unary method of [`AsyncRpcService`](crate::AsyncRpcService).
///
/// ```ignore
/// engine.register_singular_method(
///     &descriptor,
///     singular_acceptor!("example.Frontend/GetFoo"),
///     |method| { /* ... */ },
/// )?;
/// ```
#[macro_export]
macro_rules! singular_acceptor {
    ($method:expr) => {
        |service: &$crate::AsyncRpcService,
         context: &$crate::ServerContext,
         request: &$crate::RequestSlot<_>,
         writer: &$crate::ResponseWriter<_>,
         _new_call_queue: &::std::sync::Arc<$crate::CompletionQueue>,
         notification_queue: &::std::sync::Arc<$crate::CompletionQueue>,
         tag: usize| {
            service.request_unary($method, context, request, writer, notification_queue, tag)
        }
    };
}

/// Generate a [`ServerStreamAcceptorFn`](crate::ServerStreamAcceptorFn)
/// for a server-stream method of
/// [`AsyncRpcService`](crate::AsyncRpcService).
#[macro_export]
macro_rules! server_stream_acceptor {
    ($method:expr) => {
        |service: &$crate::AsyncRpcService,
         context: &$crate::ServerContext,
         request: &$crate::RequestSlot<_>,
         writer: &$crate::StreamWriter<_>,
         _new_call_queue: &::std::sync::Arc<$crate::CompletionQueue>,
         notification_queue: &::std::sync::Arc<$crate::CompletionQueue>,
         tag: usize| {
            service.request_server_stream($method, context, request, writer, notification_queue, tag)
        }
    };
}

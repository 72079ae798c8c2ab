//! grapnel-wire — the RPC transport surface the grapnel engines drive.
//!
//! This crate provides gRPC framing on top of an in-process loopback
//! transport. It does not use async/await or tokio: every asynchronous
//! operation carries a tagged pointer and completes by posting an event
//! onto a [`grapnel_core::CompletionQueue`], which is exactly the
//! contract the engine state machines are written against.
//!
//! # Architecture
//!
//! gRPC messages are framed as:
//! - 1 byte: compressed flag (0 = uncompressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload (protobuf)
//!
//! Both directions of the loopback carry framed payloads. Protobuf
//! encoding is left to [`Message`] implementations; the [`proto`]
//! helpers cover the wire format without a codegen dependency.
//!
//! Server side, an [`AsyncRpcService`] holds per-method mailboxes of
//! parked acceptances; a [`Server`] dispatcher thread pairs inbound
//! calls with them. Client side, [`SingularReader`] and
//! [`StreamingReader`] own the call state and complete against the
//! client's queue. Cancellation and deadlines propagate through shared
//! cancel tokens and the core timer thread.

mod channel;
mod client_call;
mod frame;
mod message;
mod service;
mod server_call;
mod status;

pub use channel::{Channel, ChannelCredentials, ChannelLimits, Directory, ServerCredentials, WireError};
pub use client_call::{ClientContext, SingularReader, StreamingReader};
pub use frame::{HEADER_SIZE, MessageDecoder, decode_message, encode_message};
pub use message::{DecodeError, Message, proto};
pub use service::{AsyncRpcService, AsyncService, Server, ServerBuilder, ServiceHandle};
pub use server_call::{RequestSlot, ResponseWriter, ServerContext, StreamWriter};
pub use status::{Code, Status};

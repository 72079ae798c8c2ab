//! grapnel-core — shared machinery for the grapnel RPC engines.
//!
//! This crate carries the pieces both engines are built from: the
//! tagged-pointer convention that lets a completion-queue tag carry a
//! context address plus two bits of state, the completion queue itself,
//! a timer thread for deadlines and reconnect supervision, the callback
//! logger, and the method-descriptor surface used for registration
//! validation.

pub mod descriptor;
pub mod log;
pub mod queue;
pub mod tag;
pub mod timer;

pub use descriptor::{DescriptorDatabase, DescriptorPool, MethodDescriptor, ServiceDescriptor};
pub use log::{LogLevel, LogMessage, Logger, LoggerCallback};
pub use queue::{Alarm, CompletionQueue, Event};
pub use tag::{ContextAddr, TAG_FLAGS_MASK, TagFlags};
pub use timer::{TimerHandle, TimerThread};

//! The service execution engine.
//!
//! Owns the async service, its completion queues, and the worker pool
//! that drives them. Construction registers the service and its
//! endpoints on the provided server builder; the server itself stays
//! owned by user code. `run` pre-warms the handler pool and starts the
//! per-queue event threads.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use grapnel_core::tag::split;
use grapnel_core::{CompletionQueue, Logger, LoggerCallback, MethodDescriptor};
use grapnel_wire::{AsyncService, Message, Server, ServerBuilder};
use parking_lot::Mutex;

use crate::config::{ConfigError, Environment, Options};
use crate::metrics;
use crate::registry::{MethodRegistry, Spawner};
use crate::singular::{SingularAcceptorFn, SingularMethod};
use crate::stream::{ServerStreamAcceptorFn, ServerStreamMethod};

fn service_engine_category() -> &'static str {
    "ServiceEngine"
}

/// gRPC service execution engine.
///
/// Register call handlers (unique per method), then `run` on a built
/// server. Within one completion queue events are serialized; across
/// queues they run in parallel, so one method context is never
/// concurrent with itself.
pub struct ServiceEngine<S: AsyncService> {
    options: Options,
    environment: Environment,
    logger: Logger,
    service: Arc<S>,
    queues: Vec<Arc<CompletionQueue>>,
    registry: MethodRegistry<S>,
    workers: Vec<JoinHandle<()>>,
    running: bool,
}

impl<S: AsyncService> ServiceEngine<S> {
    /// Registers the service and the configured endpoints on `builder`;
    /// multiple engines may share one builder and therefore one server.
    pub fn new(builder: &mut ServerBuilder, options: Options, environment: Environment) -> Self {
        let service = Arc::new(S::default());

        for (address, credentials) in options.endpoints() {
            builder.add_listening_port(address.clone(), credentials.clone());
        }
        builder.register_service(service.handle());

        let queues = (0..options.queue_count()).map(|_| CompletionQueue::new()).collect();
        let logger = Logger::new(service_engine_category, environment.logger_callback());

        ServiceEngine {
            options,
            environment,
            logger,
            service,
            queues,
            registry: MethodRegistry::new(),
            workers: Vec::new(),
            running: false,
        }
    }

    /// The engine-owned async service.
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Register a unary method handler; must be unique per method.
    pub fn register_singular_method<Req, Resp>(
        &mut self,
        descriptor: &MethodDescriptor,
        acceptor: SingularAcceptorFn<S, Req, Resp>,
        on_request: impl Fn(SingularMethod<S, Req, Resp>) + Send + Sync + 'static,
    ) -> Result<(), ConfigError>
    where
        Req: Message,
        Resp: Message,
    {
        self.registry.register_singular(descriptor, acceptor, Arc::new(on_request))?;
        self.service.handle().declare_method(&descriptor.full_name);
        self.logger.info(|| {
            format!(
                "Service '{}' method '{}' register succeed",
                self.options.service_name(),
                descriptor.full_name
            )
        });
        Ok(())
    }

    /// Register a server-stream method handler; must be unique per
    /// method.
    pub fn register_server_stream_method<Req, Notif>(
        &mut self,
        descriptor: &MethodDescriptor,
        acceptor: ServerStreamAcceptorFn<S, Req, Notif>,
        on_request: impl Fn(ServerStreamMethod<S, Req, Notif>) + Send + Sync + 'static,
    ) -> Result<(), ConfigError>
    where
        Req: Message,
        Notif: Message,
    {
        self.registry.register_server_stream(descriptor, acceptor, Arc::new(on_request))?;
        self.service.handle().declare_method(&descriptor.full_name);
        self.logger.info(|| {
            format!(
                "Service '{}' method '{}' register succeed",
                self.options.service_name(),
                descriptor.full_name
            )
        });
        Ok(())
    }

    /// Run service execution; call once, with the server built and
    /// started.
    pub fn run(&mut self, server: &Server) -> Result<(), ConfigError> {
        if self.running {
            return Err(ConfigError::AlreadyRunning);
        }
        if self.registry.is_empty() {
            return Err(ConfigError::NoMethodsRegistered);
        }
        let _ = server; // a built server is the precondition, nothing more

        self.logger.info(|| {
            let addresses: Vec<&str> =
                self.options.endpoints().keys().map(String::as_str).collect();
            format!(
                "Running '{}' service on: {}",
                self.options.service_name(),
                addresses.join(",")
            )
        });

        // Worker threads carry the service name, truncated to the
        // kernel's 15-byte limit.
        let mut thread_name = self.options.service_name().to_string();
        let mut cut = thread_name.len().min(15);
        while !thread_name.is_char_boundary(cut) {
            cut -= 1;
        }
        thread_name.truncate(cut);

        let spawners = self.registry.spawners();
        for queue in &self.queues {
            // One event is dispatched at a time per queue; extra
            // threads on the same queue take over as others rotate out.
            let dispatch_serial = Arc::new(Mutex::new(()));

            for _ in 0..self.options.threads_per_queue() {
                let worker = Worker {
                    service: self.service.clone(),
                    queue: queue.clone(),
                    spawners: spawners.clone(),
                    logger_callback: self.environment.logger_callback(),
                    handlers_per_thread: self.options.handlers_per_thread(),
                    dispatch_serial: dispatch_serial.clone(),
                };
                let handle = thread::Builder::new()
                    .name(thread_name.clone())
                    .spawn(move || worker.run())
                    .expect("failed to spawn engine worker thread");
                self.workers.push(handle);
            }
        }

        self.running = true;
        Ok(())
    }
}

impl<S: AsyncService> Drop for ServiceEngine<S> {
    /// Shutdown order matters: fail the parked acceptances first so
    /// workers reclaim every pre-warmed handler while draining, then
    /// shut the queues, then join the pool.
    fn drop(&mut self) {
        self.service.handle().fail_pending();
        for queue in &self.queues {
            queue.shutdown();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

struct Worker<S> {
    service: Arc<S>,
    queue: Arc<CompletionQueue>,
    spawners: Vec<Spawner<S>>,
    logger_callback: LoggerCallback,
    handlers_per_thread: usize,
    dispatch_serial: Arc<Mutex<()>>,
}

impl<S: Send + Sync + 'static> Worker<S> {
    fn run(self) {
        // Pre-warm: every registered method gets its share of waiting
        // handlers on this thread's queue.
        for spawner in &self.spawners {
            for _ in 0..self.handlers_per_thread {
                spawner(&self.service, &self.queue, &self.logger_callback);
            }
        }

        loop {
            let serial = self.dispatch_serial.lock();
            let Some(event) = self.queue.next() else {
                break;
            };
            let (addr, flags) = split(event.tag);
            let cell = unsafe { crate::detail::context::take_event(addr) };
            cell.on_event(event.ok, flags);
            metrics::EVENTS_DISPATCHED.increment();
            drop(cell);
            drop(serial);
        }
    }
}

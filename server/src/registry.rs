//! Method registry: descriptor → type-erased spawner.
//!
//! Registration captures the concrete request/response types in a
//! spawner closure so the engine never carries per-method generics.
//! Each spawner call produces one fresh, started handler bound to a
//! queue; contexts respawn themselves after every acceptance.

use std::collections::BTreeMap;
use std::sync::Arc;

use grapnel_core::{CompletionQueue, LoggerCallback, MethodDescriptor};
use grapnel_wire::Message;

use crate::config::ConfigError;
use crate::detail::singular::SingularMethodContext;
use crate::detail::stream::ServerStreamMethodContext;
use crate::singular::{SingularAcceptorFn, SingularMethodCallback};
use crate::stream::{ServerStreamAcceptorFn, ServerStreamMethodCallback};

pub(crate) type Spawner<S> =
    Arc<dyn Fn(&Arc<S>, &Arc<CompletionQueue>, &LoggerCallback) + Send + Sync>;

pub(crate) struct MethodRegistry<S> {
    methods: BTreeMap<String, Spawner<S>>,
}

impl<S: Send + Sync + 'static> MethodRegistry<S> {
    pub fn new() -> Self {
        MethodRegistry { methods: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn spawners(&self) -> Vec<Spawner<S>> {
        self.methods.values().cloned().collect()
    }

    fn check_types<Req: Message, Resp: Message>(
        descriptor: &MethodDescriptor,
    ) -> Result<(), ConfigError> {
        if Req::type_name() != descriptor.input_type {
            return Err(ConfigError::TypeMismatch {
                method: descriptor.full_name.clone(),
                registered: Req::type_name(),
                declared: descriptor.input_type.clone(),
            });
        }
        if Resp::type_name() != descriptor.output_type {
            return Err(ConfigError::TypeMismatch {
                method: descriptor.full_name.clone(),
                registered: Resp::type_name(),
                declared: descriptor.output_type.clone(),
            });
        }
        Ok(())
    }

    fn claim(&mut self, full_name: String, spawner: Spawner<S>) -> Result<(), ConfigError> {
        if self.methods.contains_key(&full_name) {
            return Err(ConfigError::DuplicateMethod(full_name));
        }
        self.methods.insert(full_name, spawner);
        Ok(())
    }

    pub fn register_singular<Req, Resp>(
        &mut self,
        descriptor: &MethodDescriptor,
        acceptor: SingularAcceptorFn<S, Req, Resp>,
        callback: SingularMethodCallback<S, Req, Resp>,
    ) -> Result<(), ConfigError>
    where
        Req: Message,
        Resp: Message,
    {
        Self::check_types::<Req, Resp>(descriptor)?;
        if descriptor.server_streaming {
            return Err(ConfigError::KindMismatch(descriptor.full_name.clone()));
        }

        let descriptor = Arc::new(descriptor.clone());
        let full_name = descriptor.full_name.clone();
        self.claim(
            full_name,
            Arc::new(move |service, queue, logger_callback| {
                SingularMethodContext::spawn(
                    descriptor.clone(),
                    logger_callback.clone(),
                    service.clone(),
                    queue.clone(),
                    callback.clone(),
                    acceptor,
                );
            }),
        )
    }

    pub fn register_server_stream<Req, Notif>(
        &mut self,
        descriptor: &MethodDescriptor,
        acceptor: ServerStreamAcceptorFn<S, Req, Notif>,
        callback: ServerStreamMethodCallback<S, Req, Notif>,
    ) -> Result<(), ConfigError>
    where
        Req: Message,
        Notif: Message,
    {
        Self::check_types::<Req, Notif>(descriptor)?;
        if !descriptor.server_streaming {
            return Err(ConfigError::KindMismatch(descriptor.full_name.clone()));
        }

        let descriptor = Arc::new(descriptor.clone());
        let full_name = descriptor.full_name.clone();
        self.claim(
            full_name,
            Arc::new(move |service, queue, logger_callback| {
                ServerStreamMethodContext::spawn(
                    descriptor.clone(),
                    logger_callback.clone(),
                    service.clone(),
                    queue.clone(),
                    callback.clone(),
                    acceptor,
                );
            }),
        )
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::serializer::Serializer;
use crate::session::Session;
use crate::AppResult;

pub type HandlerFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;
/// Frontend handler: replies, if any, go through the session explicitly.
pub type LocalHandler = Arc<dyn Fn(Arc<Session>, Bytes) -> HandlerFuture + Send + Sync>;

pub type SysFuture = Pin<Box<dyn Future<Output = AppResult<Option<Bytes>>> + Send>>;
/// Backend sys handler: session-scoped, one optional reply slot.
pub type SysHandler = Arc<dyn Fn(Arc<Session>, Bytes) -> SysFuture + Send + Sync>;

pub type UserFuture = Pin<Box<dyn Future<Output = AppResult<Bytes>> + Send>>;
/// Backend user handler: positional JSON arguments, payload-or-error result.
pub type UserHandler = Arc<dyn Fn(Vec<serde_json::Value>) -> UserFuture + Send + Sync>;

/// Explicit method table for frontend services: `service → method →
/// invocation closure`, built once at startup and inspectable without any
/// reflection facility.
#[derive(Default)]
pub struct HandlerRegistry {
    services: HashMap<String, HashMap<String, LocalHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers a method taking the raw payload bytes unmodified.
    pub fn register_raw<F, Fut>(&mut self, service: &str, method: &str, handler: F)
    where
        F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        self.insert(
            service,
            method,
            Arc::new(move |session, payload| Box::pin(handler(session, payload))),
        );
    }

    /// Registers a method with a declared argument type, populated through
    /// the configured serializer before invocation.
    pub fn register<S, T, F, Fut>(&mut self, service: &str, method: &str, serializer: Arc<S>, handler: F)
    where
        S: Serializer,
        T: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Session>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        self.insert(
            service,
            method,
            Arc::new(move |session, payload: Bytes| -> HandlerFuture {
                match serializer.deserialize::<T>(&payload) {
                    Ok(arg) => Box::pin(handler(session, arg)),
                    Err(e) => Box::pin(async move { Err(e) }),
                }
            }),
        );
    }

    fn insert(&mut self, service: &str, method: &str, handler: LocalHandler) {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), handler);
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<LocalHandler> {
        self.services.get(service)?.get(method).cloned()
    }

    /// All registered `service.method` names, sorted, for the route
    /// dictionary.
    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .flat_map(|(service, methods)| {
                methods
                    .keys()
                    .map(move |method| format!("{}.{}", service, method))
            })
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Explicit method tables for backend services, split by invocation
/// namespace.
#[derive(Default)]
pub struct RemoteRegistry {
    sys: HashMap<String, HashMap<String, SysHandler>>,
    user: HashMap<String, HashMap<String, UserHandler>>,
}

impl RemoteRegistry {
    pub fn new() -> RemoteRegistry {
        RemoteRegistry::default()
    }

    /// Session-scoped method on the raw payload.
    pub fn register_sys_raw<F, Fut>(&mut self, service: &str, method: &str, handler: F)
    where
        F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Option<Bytes>>> + Send + 'static,
    {
        self.sys
            .entry(service.to_string())
            .or_default()
            .insert(
                method.to_string(),
                Arc::new(move |session, payload| Box::pin(handler(session, payload))),
            );
    }

    /// Session-scoped method with a declared argument type.
    pub fn register_sys<S, T, F, Fut>(
        &mut self,
        service: &str,
        method: &str,
        serializer: Arc<S>,
        handler: F,
    ) where
        S: Serializer,
        T: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Session>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Option<Bytes>>> + Send + 'static,
    {
        self.sys.entry(service.to_string()).or_default().insert(
            method.to_string(),
            Arc::new(move |session, payload: Bytes| -> SysFuture {
                match serializer.deserialize::<T>(&payload) {
                    Ok(arg) => Box::pin(handler(session, arg)),
                    Err(e) => Box::pin(async move { Err(e) }),
                }
            }),
        );
    }

    /// Plain rpc method on a positional JSON argument list.
    pub fn register_user<F, Fut>(&mut self, service: &str, method: &str, handler: F)
    where
        F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Bytes>> + Send + 'static,
    {
        self.user
            .entry(service.to_string())
            .or_default()
            .insert(
                method.to_string(),
                Arc::new(move |args| Box::pin(handler(args))),
            );
    }

    pub fn lookup_sys(&self, service: &str, method: &str) -> Option<SysHandler> {
        self.sys.get(service)?.get(method).cloned()
    }

    pub fn lookup_user(&self, service: &str, method: &str) -> Option<UserHandler> {
        self.user.get(service)?.get(method).cloned()
    }
}

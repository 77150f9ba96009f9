//! Route parsing and handler registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{HandlerError, RoutingError};
use crate::session::SessionHandle;

/// A parsed `service.module.method` route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub service: String,
    pub module: String,
    pub method: String,
}

impl Route {
    /// Parse a route. Exactly three non-empty, dot-separated segments are
    /// accepted.
    pub fn parse(route: &str) -> Result<Self, RoutingError> {
        let mut parts = route.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(service), Some(module), Some(method), None)
                if !service.is_empty() && !module.is_empty() && !method.is_empty() =>
            {
                Ok(Self {
                    service: service.to_string(),
                    module: module.to_string(),
                    method: method.to_string(),
                })
            }
            _ => Err(RoutingError::Malformed(route.to_string())),
        }
    }

    /// Key of the handler within its service, `module.method`.
    pub fn handler_key(&self) -> String {
        format!("{}.{}", self.module, self.method)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.service, self.module, self.method)
    }
}

/// A request handler.
///
/// Returns the response payload. For notifies the payload is discarded.
pub trait Handler: Send + Sync {
    fn call(&self, session: &dyn SessionHandle, payload: &[u8]) -> Result<Vec<u8>, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&dyn SessionHandle, &[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync,
{
    fn call(&self, session: &dyn SessionHandle, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        self(session, payload)
    }
}

/// Handlers indexed by service type, then by `module.method`.
///
/// Built at startup and shared read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    services: HashMap<String, HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for `route`, replacing any previous handler.
    pub fn register<F>(&mut self, route: &str, handler: F) -> Result<(), RoutingError>
    where
        F: Fn(&dyn SessionHandle, &[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(route, Arc::new(handler))
    }

    /// Register `handler` for `route`, replacing any previous handler.
    pub fn register_handler(
        &mut self,
        route: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RoutingError> {
        let route = Route::parse(route)?;
        let key = route.handler_key();
        let previous = self
            .services
            .entry(route.service.clone())
            .or_default()
            .insert(key, handler);
        if previous.is_some() {
            tracing::warn!(%route, "handler replaced");
        } else {
            tracing::debug!(%route, "handler registered");
        }
        Ok(())
    }

    /// Whether any handler is registered for `service`.
    pub fn serves(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Look up the handler for `route`.
    ///
    /// Fails with [`RoutingError::NoHandler`] if the service is served here
    /// but the method is unknown.
    pub fn get(&self, route: &Route) -> Result<Arc<dyn Handler>, RoutingError> {
        self.services
            .get(&route.service)
            .and_then(|handlers| handlers.get(&route.handler_key()))
            .cloned()
            .ok_or_else(|| RoutingError::NoHandler(route.to_string()))
    }

    /// Service types with at least one handler.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

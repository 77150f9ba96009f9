//! Built-in handlers: the gateway's entry routes and the echo routes served
//! by backends.

use serde::{Deserialize, Serialize};
use switchyard_transport::{HandlerError, HandlerRegistry, RoutingError, SessionHandle};

#[derive(Debug, Deserialize)]
struct BindRequest {
    uid: String,
}

#[derive(Debug, Serialize)]
struct BindReply<'a> {
    code: u16,
    uid: &'a str,
}

/// Bind the connection to the `uid` in a `{"uid": ...}` payload.
fn bind(session: &dyn SessionHandle, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
    let request: BindRequest = serde_json::from_slice(payload)
        .map_err(|e| HandlerError::application(400, format!("bad bind request: {e}")))?;
    session.bind(&request.uid)?;
    tracing::info!(connection = session.connection_id(), uid = %request.uid, "user entered");
    serde_json::to_vec(&BindReply {
        code: 200,
        uid: &request.uid,
    })
    .map_err(|e| HandlerError::application(500, e.to_string()))
}

/// Routes served by the gateway itself under `service`.
pub fn entry_handlers(service: &str) -> Result<HandlerRegistry, RoutingError> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(&format!("{service}.entry.bind"), bind)?;
    handlers.register(&format!("{service}.entry.ping"), |_s, payload| {
        Ok(payload.to_vec())
    })?;
    Ok(handlers)
}

/// Routes served by an in-process backend of type `service`.
pub fn echo_handlers(service: &str) -> Result<HandlerRegistry, RoutingError> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(&format!("{service}.echo.say"), |_s, payload| {
        Ok(payload.to_vec())
    })?;
    Ok(handlers)
}
